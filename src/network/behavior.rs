use std::error::Error;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::prelude::*;
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::swarm::NetworkBehaviour;
use libp2p::{PeerId, StreamProtocol, identify, identity, mdns, ping};

/// Protocol name for the line-delimited chat frames.
pub const CHAT_PROTOCOL: StreamProtocol = StreamProtocol::new("/chat/1.0.0");

/// Upper bound on one frame. The wire format itself has no length limit;
/// this only guards the reader against an unbounded stream.
const MAX_FRAME_LEN: u64 = 64 * 1024;

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "ChatBehaviorEvent")]
pub struct ChatBehavior {
    pub chat: request_response::Behaviour<LineCodec>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub mdns: mdns::tokio::Behaviour,
}

pub enum ChatBehaviorEvent {
    Chat(request_response::Event<Vec<u8>, ()>),
    Identify(identify::Event),
    Ping(ping::Event),
    Mdns(mdns::Event),
}

impl From<request_response::Event<Vec<u8>, ()>> for ChatBehaviorEvent {
    fn from(event: request_response::Event<Vec<u8>, ()>) -> Self {
        ChatBehaviorEvent::Chat(event)
    }
}

impl From<identify::Event> for ChatBehaviorEvent {
    fn from(event: identify::Event) -> Self {
        ChatBehaviorEvent::Identify(event)
    }
}

impl From<ping::Event> for ChatBehaviorEvent {
    fn from(event: ping::Event) -> Self {
        ChatBehaviorEvent::Ping(event)
    }
}

impl From<mdns::Event> for ChatBehaviorEvent {
    fn from(event: mdns::Event) -> Self {
        ChatBehaviorEvent::Mdns(event)
    }
}

/// One newline-delimited frame per request stream. `/chat/1.0.0` has no
/// acknowledgements, so the response side carries no bytes at all.
#[derive(Clone, Default)]
pub struct LineCodec;

#[async_trait]
impl request_response::Codec for LineCodec {
    type Protocol = StreamProtocol;
    type Request = Vec<u8>;
    type Response = ();

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Vec<u8>>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut frame = Vec::new();
        // One byte past the limit distinguishes an oversized frame from one
        // that is exactly at it; truncating would record a corrupt message.
        io.take(MAX_FRAME_LEN + 1).read_to_end(&mut frame).await?;
        if frame.len() as u64 > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame exceeds maximum length",
            ));
        }
        if frame.last() == Some(&b'\n') {
            frame.pop();
        }
        Ok(frame)
    }

    async fn read_response<T>(&mut self, _: &StreamProtocol, _io: &mut T) -> io::Result<()>
    where
        T: AsyncRead + Unpin + Send,
    {
        Ok(())
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        frame: Vec<u8>,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.write_all(&frame).await?;
        io.write_all(b"\n").await?;
        io.close().await
    }

    async fn write_response<T>(&mut self, _: &StreamProtocol, io: &mut T, _: ()) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.close().await
    }
}

pub fn build_behavior(
    local_key: &identity::Keypair,
    local_peer_id: PeerId,
    keep_alive: Duration,
) -> Result<ChatBehavior, Box<dyn Error>> {
    let chat = request_response::Behaviour::with_codec(
        LineCodec,
        std::iter::once((CHAT_PROTOCOL, ProtocolSupport::Full)),
        request_response::Config::default(),
    );

    let identify_config = identify::Config::new("peerchat/1.0.0".into(), local_key.public());
    let identify = identify::Behaviour::new(identify_config);

    // The ping behaviour generates the actual keep-alive traffic; its
    // interval matches the scheduler's period so connections never idle out.
    let ping = ping::Behaviour::new(ping::Config::new().with_interval(keep_alive));

    let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?;

    Ok(ChatBehavior {
        chat,
        identify,
        ping,
        mdns,
    })
}
