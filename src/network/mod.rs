pub mod behavior;
pub mod client;
pub mod transport;

pub use client::NetworkClient;
