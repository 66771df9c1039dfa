//! Room-based binary transports.
//!
//! A transport carries opaque byte messages between the replicas that joined
//! the same room. Delivery is fire-and-forget: a send never waits for peers
//! and may be lost while disconnected.

use coedit_proto::RoomScheme;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use url::Url;

const EVENT_CAPACITY: usize = 1024;

/// Something observed on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A message published to a joined room
    Message {
        /// Room name
        room: String,
        /// Opaque payload
        bytes: Vec<u8>,
    },
    /// The link went up (`true`) or down (`false`)
    ConnectionStatus(bool),
}

/// Bidirectional binary channel with room semantics.
pub trait Transport: Send + Sync + 'static {
    /// Start receiving messages of `room`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::JoinRejected`] if the room refused us, or
    /// [`TransportError::Unavailable`] while disconnected.
    fn join(&self, room: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Stop receiving messages of `room`.
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be issued.
    fn leave(&self, room: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Publish to `room` without waiting for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unavailable`] while disconnected.
    fn send(&self, room: &str, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Subscribe to incoming messages and connection changes.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Whether the link is currently up.
    fn is_connected(&self) -> bool;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Debug)]
struct HubPeer {
    events: broadcast::Sender<TransportEvent>,
    connected: bool,
    rooms: HashSet<String>,
    rejections: u32,
}

#[derive(Debug, Default)]
struct HubState {
    next_peer: usize,
    peers: HashMap<usize, HubPeer>,
}

/// In-process message hub connecting [`MemoryTransport`]s.
///
/// Supports forced disconnects and join rejection to exercise session
/// recovery.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new connected peer.
    #[must_use]
    pub fn connect(&self) -> MemoryTransport {
        let mut state = lock(&self.state);
        let peer = state.next_peer;
        state.next_peer += 1;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        state.peers.insert(
            peer,
            HubPeer {
                events,
                connected: true,
                rooms: HashSet::new(),
                rejections: 0,
            },
        );
        MemoryTransport {
            hub: self.clone(),
            peer,
        }
    }

    /// Drop or restore a peer's link.
    ///
    /// A dropped link forgets its rooms; the peer must join again.
    pub fn set_connected(&self, transport: &MemoryTransport, connected: bool) {
        let mut state = lock(&self.state);
        let Some(peer) = state.peers.get_mut(&transport.peer) else {
            return;
        };
        if peer.connected == connected {
            return;
        }
        peer.connected = connected;
        if !connected {
            peer.rooms.clear();
        }
        tracing::debug!(peer = transport.peer, connected, "Memory link changed");
        let _ = peer.events.send(TransportEvent::ConnectionStatus(connected));
    }

    /// Reject the next `count` join attempts of a peer.
    pub fn reject_joins(&self, transport: &MemoryTransport, count: u32) {
        if let Some(peer) = lock(&self.state).peers.get_mut(&transport.peer) {
            peer.rejections = count;
        }
    }
}

/// One peer of a [`MemoryHub`].
#[derive(Debug)]
pub struct MemoryTransport {
    hub: MemoryHub,
    peer: usize,
}

impl MemoryTransport {
    /// The hub this peer is attached to.
    #[must_use]
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }

    fn with_peer<R>(
        &self,
        f: impl FnOnce(&mut HubPeer) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let mut state = lock(&self.hub.state);
        let peer = state
            .peers
            .get_mut(&self.peer)
            .ok_or_else(|| TransportError::Unavailable("peer detached".to_string()))?;
        f(peer)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        lock(&self.hub.state).peers.remove(&self.peer);
    }
}

impl Transport for MemoryTransport {
    async fn join(&self, room: &str) -> Result<(), TransportError> {
        self.with_peer(|peer| {
            if !peer.connected {
                return Err(TransportError::Unavailable("disconnected".to_string()));
            }
            if peer.rejections > 0 {
                peer.rejections -= 1;
                return Err(TransportError::JoinRejected(room.to_string()));
            }
            peer.rooms.insert(room.to_string());
            Ok(())
        })
    }

    async fn leave(&self, room: &str) -> Result<(), TransportError> {
        self.with_peer(|peer| {
            peer.rooms.remove(room);
            Ok(())
        })
    }

    fn send(&self, room: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        let state = lock(&self.hub.state);
        let sender = state
            .peers
            .get(&self.peer)
            .ok_or_else(|| TransportError::Unavailable("peer detached".to_string()))?;
        if !sender.connected {
            return Err(TransportError::Unavailable("disconnected".to_string()));
        }
        if !sender.rooms.contains(room) {
            return Err(TransportError::Unavailable(format!("not joined to {room}")));
        }

        for (id, peer) in &state.peers {
            if *id == self.peer || !peer.connected || !peer.rooms.contains(room) {
                continue;
            }
            let _ = peer.events.send(TransportEvent::Message {
                room: room.to_string(),
                bytes: bytes.clone(),
            });
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        let state = lock(&self.hub.state);
        match state.peers.get(&self.peer) {
            Some(peer) => peer.events.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    fn is_connected(&self) -> bool {
        lock(&self.hub.state)
            .peers
            .get(&self.peer)
            .is_some_and(|peer| peer.connected)
    }
}

/// Transport over an MQTT broker, one topic per room.
pub struct MqttTransport {
    client: AsyncClient,
    scheme: RoomScheme,
    events: broadcast::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    driver: JoinHandle<()>,
}

impl MqttTransport {
    /// Connect to a broker and start driving the MQTT event loop.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn connect(
        mqtt_broker: &str,
        client_id: &str,
        scheme: RoomScheme,
    ) -> Result<Self, TransportError> {
        let (host, port) = parse_mqtt_url(mqtt_broker)?;

        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));

        let driver = {
            let events = events.clone();
            let connected = Arc::clone(&connected);
            let scheme = scheme.clone();
            tokio::spawn(async move {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            tracing::info!("MQTT connected");
                            connected.store(true, Ordering::SeqCst);
                            let _ = events.send(TransportEvent::ConnectionStatus(true));
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            tracing::trace!(
                                topic = %publish.topic,
                                payload_len = publish.payload.len(),
                                "Received room message"
                            );
                            let Some(room) = scheme.parse(&publish.topic) else {
                                continue;
                            };
                            let _ = events.send(TransportEvent::Message {
                                room,
                                bytes: publish.payload.to_vec(),
                            });
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if connected.swap(false, Ordering::SeqCst) {
                                let _ = events.send(TransportEvent::ConnectionStatus(false));
                            }
                            tracing::error!(error = %e, "MQTT error");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            })
        };

        Ok(Self {
            client,
            scheme,
            events,
            connected,
            driver,
        })
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl Transport for MqttTransport {
    async fn join(&self, room: &str) -> Result<(), TransportError> {
        let topic = self.scheme.topic(room);
        tracing::info!(topic = %topic, "Subscribing to room topic");
        self.client
            .subscribe(&topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))
    }

    async fn leave(&self, room: &str) -> Result<(), TransportError> {
        self.client
            .unsubscribe(self.scheme.topic(room))
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))
    }

    fn send(&self, room: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Unavailable("disconnected".to_string()));
        }
        let topic = self.scheme.topic(room);
        tracing::debug!(topic = %topic, payload_len = bytes.len(), "Publishing room message");
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, bytes)
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Parse MQTT URL into host and port.
fn parse_mqtt_url(input: &str) -> Result<(String, u16), TransportError> {
    if input.contains("://") {
        let url = Url::parse(input)
            .map_err(|e| TransportError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(TransportError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(1883);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| TransportError::InvalidBrokerUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => 1883,
        Some(port) => port.parse().map_err(|_| {
            TransportError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'"))
        })?,
    };
    if parts.next().is_some() {
        return Err(TransportError::InvalidBrokerUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}

/// Errors for transport operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The link is down or the room is not joined
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    /// The room refused the join request
    #[error("join rejected for room {0}")]
    JoinRejected(String),
    /// The request could not be queued
    #[error("transport i/o error: {0}")]
    Io(String),
    /// Invalid MQTT broker URL
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_urls() {
        assert_eq!(
            parse_mqtt_url("tcp://broker:1884").unwrap(),
            ("broker".to_string(), 1884)
        );
        assert_eq!(
            parse_mqtt_url("mqtt://broker").unwrap(),
            ("broker".to_string(), 1883)
        );
        assert_eq!(
            parse_mqtt_url("localhost:1999").unwrap(),
            ("localhost".to_string(), 1999)
        );
        assert!(parse_mqtt_url("ws://broker").is_err());
        assert!(parse_mqtt_url("a:1:2").is_err());
        assert!(parse_mqtt_url(":1883").is_err());
    }

    #[tokio::test]
    async fn hub_delivers_to_other_room_members() {
        let hub = MemoryHub::new();
        let a = hub.connect();
        let b = hub.connect();
        let c = hub.connect();
        let mut a_events = a.events();
        let mut b_events = b.events();
        let mut c_events = c.events();

        a.join("doc-1").await.unwrap();
        b.join("doc-1").await.unwrap();
        c.join("doc-2").await.unwrap();

        a.send("doc-1", vec![1, 2]).unwrap();
        assert_eq!(
            b_events.recv().await.unwrap(),
            TransportEvent::Message {
                room: "doc-1".to_string(),
                bytes: vec![1, 2]
            }
        );
        assert!(a_events.try_recv().is_err());
        assert!(c_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_drops_rooms_and_blocks_sends() {
        let hub = MemoryHub::new();
        let a = hub.connect();
        let mut events = a.events();
        a.join("doc-1").await.unwrap();

        hub.set_connected(&a, false);
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::ConnectionStatus(false)
        );
        assert!(!a.is_connected());
        assert!(matches!(
            a.send("doc-1", vec![0]),
            Err(TransportError::Unavailable(_))
        ));
        assert!(a.join("doc-1").await.is_err());

        hub.set_connected(&a, true);
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::ConnectionStatus(true)
        );
        // rooms were forgotten with the link
        assert!(a.send("doc-1", vec![0]).is_err());
        a.join("doc-1").await.unwrap();
        assert!(a.send("doc-1", vec![0]).is_ok());
    }

    #[tokio::test]
    async fn rejected_joins_are_counted_down() {
        let hub = MemoryHub::new();
        let a = hub.connect();
        hub.reject_joins(&a, 2);
        for _ in 0..2 {
            assert_eq!(
                a.join("doc-1").await,
                Err(TransportError::JoinRejected("doc-1".to_string()))
            );
        }
        assert!(a.join("doc-1").await.is_ok());
    }
}
