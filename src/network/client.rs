//! libp2p network task.
//!
//! Owns the swarm and translates between swarm events and the session
//! core's channels: identify results and connection closures become
//! presence events, inbound `/chat/1.0.0` requests become frame events,
//! and core commands become dials, requests and probes.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::str::FromStr;
use std::time::Duration;

use futures::StreamExt;
use libp2p::request_response;
use libp2p::swarm::{Config as SwarmConfig, SwarmEvent};
use libp2p::{Multiaddr, PeerId, Swarm, identify, identity, mdns, ping};
use tokio::sync::mpsc;

use crate::chat::persist::IDENTITY_KEY;
use crate::common::{NetworkCommand, NetworkEvent, PeerIdentity};
use crate::storage::KvStore;

use super::behavior::{CHAT_PROTOCOL, ChatBehavior, ChatBehaviorEvent, build_behavior};
use super::transport::build_transport;

pub struct NetworkClient {
    event_sender: mpsc::Sender<NetworkEvent>,
    command_receiver: mpsc::Receiver<NetworkCommand>,
    listen_port: u16,
    keep_alive: Duration,
    idle_timeout: Duration,
    /// Peers that advertised `/chat/1.0.0` and are currently connected.
    chat_peers: HashSet<PeerId>,
    /// Latest round trip per peer, fed by the ping behaviour.
    rtt_cache: HashMap<PeerId, Duration>,
}

impl NetworkClient {
    pub fn new(
        event_sender: mpsc::Sender<NetworkEvent>,
        command_receiver: mpsc::Receiver<NetworkCommand>,
        listen_port: u16,
        keep_alive: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            event_sender,
            command_receiver,
            listen_port,
            keep_alive,
            idle_timeout,
            chat_peers: HashSet::new(),
            rtt_cache: HashMap::new(),
        }
    }

    pub async fn run(mut self, kv: &dyn KvStore) -> Result<(), Box<dyn Error>> {
        let local_key = load_or_generate_local_key(kv)?;
        let local_peer_id = PeerId::from(local_key.public());
        log::info!("local peer id: {local_peer_id}");

        let transport = build_transport(&local_key)?;
        let behavior = build_behavior(&local_key, local_peer_id, self.keep_alive)?;
        let mut swarm = Swarm::new(
            transport,
            behavior,
            local_peer_id,
            SwarmConfig::with_tokio_executor().with_idle_connection_timeout(self.idle_timeout),
        );

        swarm.listen_on(format!("/ip4/0.0.0.0/tcp/{}", self.listen_port).parse()?)?;

        log::info!("network event loop started");
        loop {
            tokio::select! {
                command = self.command_receiver.recv() => {
                    match command {
                        Some(command) => self.handle_command(command, &mut swarm).await,
                        None => break,
                    }
                }
                event = swarm.select_next_some() => {
                    self.handle_swarm_event(event, &mut swarm).await;
                }
            }
        }

        Ok(())
    }

    async fn handle_command(&mut self, command: NetworkCommand, swarm: &mut Swarm<ChatBehavior>) {
        match command {
            NetworkCommand::SendFrame { peer, payload } => match PeerId::from_str(peer.as_str()) {
                Ok(peer_id) => {
                    swarm.behaviour_mut().chat.send_request(&peer_id, payload);
                }
                Err(err) => log::warn!("cannot parse peer id {peer}: {err}"),
            },
            NetworkCommand::Probe { peer } => {
                let rtt = self.probe(&peer, swarm);
                self.emit(NetworkEvent::ProbeResult { peer, rtt }).await;
            }
            NetworkCommand::Dial { address } => match address.parse::<Multiaddr>() {
                Ok(addr) => {
                    log::info!("dialing {addr}");
                    if let Err(err) = swarm.dial(addr) {
                        log::error!("failed to dial: {err}");
                    }
                }
                Err(err) => log::error!("invalid multiaddr '{address}': {err}"),
            },
        }
    }

    /// The ping behaviour probes connected peers on its own interval; a
    /// probe command reports the most recent round trip for the peer, or
    /// failure if there is no live connection.
    fn probe(&self, peer: &PeerIdentity, swarm: &Swarm<ChatBehavior>) -> Option<Duration> {
        let peer_id = PeerId::from_str(peer.as_str()).ok()?;
        if !swarm.is_connected(&peer_id) {
            return None;
        }
        self.rtt_cache.get(&peer_id).copied()
    }

    async fn handle_swarm_event(
        &mut self,
        event: SwarmEvent<ChatBehaviorEvent>,
        swarm: &mut Swarm<ChatBehavior>,
    ) {
        match event {
            SwarmEvent::Behaviour(ChatBehaviorEvent::Chat(event)) => {
                self.handle_chat_event(event, swarm).await;
            }
            SwarmEvent::Behaviour(ChatBehaviorEvent::Identify(event)) => {
                self.handle_identify_event(event).await;
            }
            SwarmEvent::Behaviour(ChatBehaviorEvent::Ping(ping::Event {
                peer, result, ..
            })) => match result {
                Ok(rtt) => {
                    self.rtt_cache.insert(peer, rtt);
                }
                Err(err) => log::debug!("ping to {peer} failed: {err}"),
            },
            SwarmEvent::Behaviour(ChatBehaviorEvent::Mdns(event)) => {
                self.handle_mdns_event(event, swarm);
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                log::info!("listening on {address:?}");
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    self.rtt_cache.remove(&peer_id);
                    if let Some(event) = self.presence_lost(peer_id) {
                        self.emit(event).await;
                    }
                }
            }
            _ => {}
        }
    }

    async fn handle_chat_event(
        &mut self,
        event: request_response::Event<Vec<u8>, ()>,
        swarm: &mut Swarm<ChatBehavior>,
    ) {
        match event {
            request_response::Event::Message {
                peer,
                message:
                    request_response::Message::Request {
                        request, channel, ..
                    },
                ..
            } => {
                // An inbound chat frame proves the peer speaks the protocol.
                // Report presence before the frame itself so the core never
                // sees a message from a peer it was not told about.
                if let Some(connected) = self.presence_gained(peer) {
                    self.emit(connected).await;
                }
                self.emit(NetworkEvent::FrameReceived {
                    peer: PeerIdentity::from(peer),
                    payload: request,
                })
                .await;
                let _ = swarm.behaviour_mut().chat.send_response(channel, ());
            }
            request_response::Event::Message {
                message: request_response::Message::Response { .. },
                ..
            } => {}
            request_response::Event::OutboundFailure { peer, error, .. } => {
                // Fire-and-forget: log only, never retry, never retract.
                log::warn!("failed to deliver frame to {peer}: {error}");
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                log::debug!("inbound chat stream from {peer} failed: {error}");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    async fn handle_identify_event(&mut self, event: identify::Event) {
        if let identify::Event::Received { peer_id, info, .. } = event {
            log::debug!("identify info from {peer_id}: protocols={:?}", info.protocols);
            if info.protocols.iter().any(|p| *p == CHAT_PROTOCOL) {
                if let Some(event) = self.presence_gained(peer_id) {
                    self.emit(event).await;
                }
            }
        }
    }

    fn handle_mdns_event(&mut self, event: mdns::Event, swarm: &mut Swarm<ChatBehavior>) {
        match event {
            mdns::Event::Discovered(peers) => {
                for (peer_id, addr) in peers {
                    log::debug!("mdns discovered {peer_id} at {addr}");
                    if !swarm.is_connected(&peer_id) {
                        if let Err(err) = swarm.dial(addr) {
                            log::debug!("failed to dial discovered peer {peer_id}: {err}");
                        }
                    }
                }
            }
            mdns::Event::Expired(peers) => {
                for (peer_id, _) in peers {
                    log::debug!("mdns record for {peer_id} expired");
                }
            }
        }
    }

    /// Track a chat-capable peer coming online. Returns the presence event
    /// to emit, or None if the peer was already tracked.
    fn presence_gained(&mut self, peer_id: PeerId) -> Option<NetworkEvent> {
        self.chat_peers
            .insert(peer_id)
            .then(|| NetworkEvent::PeerConnected(PeerIdentity::from(peer_id)))
    }

    fn presence_lost(&mut self, peer_id: PeerId) -> Option<NetworkEvent> {
        self.chat_peers
            .remove(&peer_id)
            .then(|| NetworkEvent::PeerDisconnected(PeerIdentity::from(peer_id)))
    }

    async fn emit(&self, event: NetworkEvent) {
        if let Err(err) = self.event_sender.send(event).await {
            log::warn!("failed to emit network event: {err}");
        }
    }
}

fn load_or_generate_local_key(kv: &dyn KvStore) -> Result<identity::Keypair, Box<dyn Error>> {
    if let Some(bytes) = kv.get(IDENTITY_KEY)? {
        let keypair = identity::Keypair::from_protobuf_encoding(&bytes)
            .map_err(|e| format!("failed to decode identity key: {e}"))?;
        log::info!("loaded persisted identity key");
        return Ok(keypair);
    }

    let keypair = identity::Keypair::generate_ed25519();
    let encoded = keypair
        .to_protobuf_encoding()
        .map_err(|e| format!("failed to encode identity key: {e}"))?;
    kv.set(IDENTITY_KEY, &encoded)?;
    log::info!("generated new identity key");
    Ok(keypair)
}
