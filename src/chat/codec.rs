//! Wire codec for the `/chat/1.0.0` frame format.
//!
//! A frame is either free-form text (a chat message) or text carrying the
//! literal `nickname:` prefix (a nickname announcement). Frame delimiting is
//! the transport's job; this codec always sees exactly one frame at a time.

use thiserror::Error;

/// Literal prefix marking a nickname-control frame.
pub const NICKNAME_PREFIX: &str = "nickname:";

/// A frame that cannot be interpreted as UTF-8 text. The frame is dropped
/// and logged; the connection stays open.
#[derive(Debug, Error)]
#[error("frame is not valid UTF-8: {0}")]
pub struct DecodeAnomaly(#[from] std::str::Utf8Error);

/// One decoded unit of wire data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The sender announced a (possibly empty) nickname.
    NicknameUpdate(String),
    /// Plain chat text.
    ChatMessage(String),
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::NicknameUpdate(name) => format!("{NICKNAME_PREFIX}{name}").into_bytes(),
            Frame::ChatMessage(text) => text.clone().into_bytes(),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeAnomaly> {
        let text = std::str::from_utf8(payload)?;
        Ok(match text.strip_prefix(NICKNAME_PREFIX) {
            Some(name) => Frame::NicknameUpdate(name.to_string()),
            None => Frame::ChatMessage(text.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nickname_frames_carry_the_prefix() {
        let frame = Frame::NicknameUpdate("Bob".into());
        assert_eq!(frame.encode(), b"nickname:Bob");
        assert_eq!(Frame::decode(b"nickname:Bob").unwrap(), frame);
    }

    #[test]
    fn plain_text_is_a_chat_message() {
        assert_eq!(
            Frame::decode(b"hello there").unwrap(),
            Frame::ChatMessage("hello there".into())
        );
    }

    #[test]
    fn empty_suffix_is_an_empty_nickname_not_an_error() {
        assert_eq!(
            Frame::decode(b"nickname:").unwrap(),
            Frame::NicknameUpdate(String::new())
        );
    }

    #[test]
    fn prefix_mid_text_stays_a_chat_message() {
        assert_eq!(
            Frame::decode(b"my nickname: is Bob").unwrap(),
            Frame::ChatMessage("my nickname: is Bob".into())
        );
    }

    #[test]
    fn non_utf8_is_a_decode_anomaly() {
        assert!(Frame::decode(&[0xff, 0xfe, 0x00]).is_err());
    }
}
