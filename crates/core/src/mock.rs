//! In-memory connection capability and relay
//!
//! `MockNetwork` stands in for the media engine: connections created from
//! the same network find each other through the endpoint id embedded in
//! their descriptions, and their channels are wired together once an
//! offer/answer pair has been applied on both sides. `MockRelayHub` is an
//! in-memory room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::capability::{
    ChannelEvent, ChannelHandle, ChannelMessage, ChannelOptions, Connection, ConnectionEvent,
    ConnectionEvents, ConnectionFactory, DataChannel, SignalingState,
};
use crate::error::{Error, Result};
use crate::features::BinaryType;
use crate::relay::{RelayEvent, SignalSender};
use crate::signal::{IceCandidate, SdpType, SessionDescription, Signal};

/// First id handed to channels opened without a negotiated id
const FIRST_DYNAMIC_CHANNEL_ID: u16 = 1000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registry of live mock endpoints
#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<u64, Weak<MockConnection>>>,
    next_id: AtomicU64,
}

/// A shared medium that mock connections are created on
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<NetworkInner>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory creating connections on this network
    pub fn factory(&self) -> Arc<MockConnectionFactory> {
        Arc::new(MockConnectionFactory {
            network: self.clone(),
            created: Mutex::new(Vec::new()),
        })
    }

    fn connect(&self) -> (Arc<MockConnection>, ConnectionEvents) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(MockConnection {
            id,
            network: Arc::downgrade(&self.inner),
            events: Mutex::new(Some(events_tx)),
            state: Mutex::new(ConnectionState::new()),
            fail_implicit: AtomicBool::new(false),
        });
        lock(&self.inner.endpoints).insert(id, Arc::downgrade(&connection));
        (connection, events_rx)
    }
}

/// Factory that records every connection it creates
pub struct MockConnectionFactory {
    network: MockNetwork,
    created: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnectionFactory {
    /// All connections created so far, oldest first
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        lock(&self.created).clone()
    }

    /// The most recently created connection
    pub fn latest(&self) -> Option<Arc<MockConnection>> {
        lock(&self.created).last().cloned()
    }
}

impl ConnectionFactory for MockConnectionFactory {
    fn create(&self) -> Result<(Arc<dyn Connection>, ConnectionEvents)> {
        let (connection, events) = self.network.connect();
        lock(&self.created).push(connection.clone());
        Ok((connection, events))
    }
}

struct ConnectionState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_endpoint: Option<u64>,
    /// A data section was requested, so negotiation has been flagged
    data_requested: bool,
    connected: bool,
    channels: Vec<Arc<MockChannel>>,
    pending: Vec<Arc<MockChannel>>,
    remote_candidates: Vec<IceCandidate>,
    next_channel_id: u16,
    version: u64,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            signaling: SignalingState::Stable,
            local: None,
            remote: None,
            remote_endpoint: None,
            data_requested: false,
            connected: false,
            channels: Vec::new(),
            pending: Vec::new(),
            remote_candidates: Vec::new(),
            next_channel_id: FIRST_DYNAMIC_CHANNEL_ID,
            version: 0,
        }
    }
}

/// In-memory connection
pub struct MockConnection {
    id: u64,
    network: Weak<NetworkInner>,
    events: Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>,
    state: Mutex<ConnectionState>,
    fail_implicit: AtomicBool,
}

impl MockConnection {
    pub fn is_closed(&self) -> bool {
        lock(&self.state).signaling == SignalingState::Closed
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.state).remote.clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).remote_candidates.clone()
    }

    /// Channels opened locally on this connection
    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        lock(&self.state).channels.clone()
    }

    /// Make implicit `set_local_description` fail, forcing the explicit path
    pub fn fail_implicit_descriptions(&self, fail: bool) {
        self.fail_implicit.store(fail, Ordering::Relaxed);
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(event);
        }
    }

    fn sdp(&self, version: u64) -> String {
        format!("mock endpoint={} version={}", self.id, version)
    }

    fn parse_endpoint(sdp: &str) -> Option<u64> {
        sdp.strip_prefix("mock endpoint=")?
            .split_whitespace()
            .next()?
            .parse()
            .ok()
    }

    fn lookup(&self, id: u64) -> Option<Arc<MockConnection>> {
        let network = self.network.upgrade()?;
        let endpoint = lock(&network.endpoints).get(&id)?.upgrade();
        endpoint
    }

    fn ensure_open(state: &ConnectionState) -> Result<()> {
        if state.signaling == SignalingState::Closed {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    fn local_candidate(&self, version: u64) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host", version, self.id),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    /// Wire up channels with the remote endpoint once both sides are stable
    fn establish_transport(&self) {
        let Some(remote_id) = lock(&self.state).remote_endpoint else {
            return;
        };
        let Some(remote) = self.lookup(remote_id) else {
            debug!(endpoint = self.id, remote = remote_id, "Remote endpoint is gone");
            return;
        };
        if remote.is_closed() {
            return;
        }

        let ours = {
            let mut state = lock(&self.state);
            state.connected = true;
            std::mem::take(&mut state.pending)
        };
        let theirs = {
            let mut state = lock(&remote.state);
            state.connected = true;
            state.remote_endpoint = Some(self.id);
            std::mem::take(&mut state.pending)
        };

        for channel in ours {
            self.attach(channel, &remote);
        }
        for channel in theirs {
            remote.attach(channel, self);
        }
        debug!(endpoint = self.id, remote = remote_id, "Mock transport established");
    }

    /// Pair a local channel with its counterpart on the remote endpoint
    fn attach(&self, channel: Arc<MockChannel>, remote: &MockConnection) {
        if channel.is_paired() {
            return;
        }
        if channel.negotiated {
            // Both sides open negotiated channels themselves
            let counterpart = lock(&remote.state)
                .channels
                .iter()
                .find(|c| c.negotiated && c.id == channel.id && !c.is_paired())
                .cloned();
            if let Some(counterpart) = counterpart {
                MockChannel::pair(&channel, &counterpart);
            }
            return;
        }

        let (counterpart, events) = MockChannel::new(&channel.label, channel.id, false);
        lock(&remote.state).channels.push(counterpart.clone());
        MockChannel::pair(&channel, &counterpart);
        remote.emit(ConnectionEvent::InboundChannel(ChannelHandle {
            channel: counterpart,
            events,
        }));
    }

    fn apply_local(&self, description: SessionDescription) -> Result<SessionDescription> {
        let version = {
            let mut state = lock(&self.state);
            Self::ensure_open(&state)?;
            match (description.kind, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::HaveLocalOffer;
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::Stable;
                }
                (kind, signaling) => {
                    return Err(Error::Description(format!(
                        "cannot apply local {} in state {:?}",
                        kind, signaling
                    )));
                }
            }
            state.local = Some(description.clone());
            state.version
        };
        self.emit(ConnectionEvent::LocalCandidate(self.local_candidate(version)));
        Ok(description)
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    async fn set_local_description(&self) -> Result<SessionDescription> {
        if self.fail_implicit.load(Ordering::Relaxed) {
            return Err(Error::Description("implicit description unsupported".into()));
        }
        let description = match self.signaling_state() {
            SignalingState::Stable | SignalingState::HaveLocalOffer => self.create_offer().await?,
            SignalingState::HaveRemoteOffer => self.create_answer().await?,
            other => {
                return Err(Error::Description(format!(
                    "no description applicable in state {:?}",
                    other
                )))
            }
        };
        self.apply_local_description(description).await
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        state.version += 1;
        Ok(SessionDescription::new(SdpType::Offer, self.sdp(state.version)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(Error::Description("no remote offer to answer".into()));
        }
        state.version += 1;
        Ok(SessionDescription::new(SdpType::Answer, self.sdp(state.version)))
    }

    async fn apply_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<SessionDescription> {
        self.apply_local(description)
    }

    async fn apply_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote_id = Self::parse_endpoint(&description.sdp)
            .ok_or_else(|| Error::Apply(format!("malformed {} description", description.kind)))?;

        let converged = {
            let mut state = lock(&self.state);
            Self::ensure_open(&state).map_err(|e| Error::Apply(e.to_string()))?;
            let converged = match (description.kind, state.signaling) {
                (SdpType::Offer, SignalingState::HaveLocalOffer) => {
                    // Implicit rollback of our own offer
                    state.local = None;
                    state.signaling = SignalingState::HaveRemoteOffer;
                    false
                }
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::HaveRemoteOffer;
                    false
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    true
                }
                (kind, signaling) => {
                    return Err(Error::Apply(format!(
                        "cannot apply remote {} in state {:?}",
                        kind, signaling
                    )));
                }
            };
            state.remote = Some(description);
            state.remote_endpoint = Some(remote_id);
            converged
        };
        if converged {
            self.establish_transport();
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = lock(&self.state);
        Self::ensure_open(&state).map_err(|e| Error::Candidate(e.to_string()))?;
        if state.remote.is_none() {
            return Err(Error::Candidate("no remote description".into()));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    fn open_channel(&self, label: &str, options: ChannelOptions) -> Result<ChannelHandle> {
        let (channel, events, needs_negotiation, connected) = {
            let mut state = lock(&self.state);
            Self::ensure_open(&state)?;
            let id = match options.negotiated_id {
                Some(id) => id,
                None => {
                    let id = state.next_channel_id;
                    state.next_channel_id = state.next_channel_id.wrapping_add(1);
                    id
                }
            };
            let (channel, events) =
                MockChannel::new(label, Some(id), options.negotiated_id.is_some());
            state.channels.push(channel.clone());
            let needs_negotiation = !state.data_requested;
            state.data_requested = true;
            if !state.connected {
                state.pending.push(channel.clone());
            }
            (channel, events, needs_negotiation, state.connected)
        };

        if connected {
            let remote = lock(&self.state).remote_endpoint.and_then(|id| self.lookup(id));
            if let Some(remote) = remote {
                self.attach(channel.clone(), &remote);
            }
        }
        if needs_negotiation {
            self.emit(ConnectionEvent::NegotiationNeeded);
        }

        Ok(ChannelHandle { channel, events })
    }

    fn close(&self) {
        let channels = {
            let mut state = lock(&self.state);
            state.signaling = SignalingState::Closed;
            state.connected = false;
            state.pending.clear();
            std::mem::take(&mut state.channels)
        };
        for channel in channels {
            channel.close();
        }
        lock(&self.events).take();
        if let Some(network) = self.network.upgrade() {
            lock(&network.endpoints).remove(&self.id);
        }
    }
}

/// In-memory data channel
pub struct MockChannel {
    label: String,
    id: Option<u16>,
    negotiated: bool,
    binary_type: Mutex<BinaryType>,
    inbox: mpsc::UnboundedSender<ChannelEvent>,
    peer: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    open: AtomicBool,
}

impl MockChannel {
    fn new(label: &str, id: Option<u16>, negotiated: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (inbox, events) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            label: label.to_string(),
            id,
            negotiated,
            binary_type: Mutex::new(BinaryType::ArrayBuffer),
            inbox,
            peer: Mutex::new(None),
            open: AtomicBool::new(false),
        });
        (channel, events)
    }

    fn pair(a: &Arc<MockChannel>, b: &Arc<MockChannel>) {
        *lock(&a.peer) = Some(b.inbox.clone());
        *lock(&b.peer) = Some(a.inbox.clone());
        a.mark_open();
        b.mark_open();
    }

    fn mark_open(&self) {
        self.open.store(true, Ordering::Release);
        let _ = self.inbox.send(ChannelEvent::Open);
    }

    fn is_paired(&self) -> bool {
        lock(&self.peer).is_some()
    }

    /// Two already-open ends of one channel, outside of any connection
    pub fn pair_detached(label: &str) -> (ChannelHandle, ChannelHandle) {
        let (a, a_events) = Self::new(label, Some(0), false);
        let (b, b_events) = Self::new(label, Some(0), false);
        Self::pair(&a, &b);
        (
            ChannelHandle {
                channel: a,
                events: a_events,
            },
            ChannelHandle {
                channel: b,
                events: b_events,
            },
        )
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MockChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockChannel")
            .field("label", &self.label)
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl DataChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn id(&self) -> Option<u16> {
        self.id
    }

    fn binary_type(&self) -> BinaryType {
        *lock(&self.binary_type)
    }

    fn set_binary_type(&self, binary_type: BinaryType) {
        *lock(&self.binary_type) = binary_type;
    }

    fn buffered_amount(&self) -> usize {
        // Delivery is immediate
        0
    }

    fn set_buffered_amount_low_threshold(&self, _threshold: usize) {}

    fn send(&self, message: ChannelMessage) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Channel(format!("channel '{}' is not open", self.label)));
        }
        let peer = lock(&self.peer).clone();
        let Some(peer) = peer else {
            return Err(Error::Channel(format!("channel '{}' has no peer", self.label)));
        };
        peer.send(ChannelEvent::Message(message))
            .map_err(|_| Error::Channel(format!("channel '{}' peer is gone", self.label)))
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.inbox.send(ChannelEvent::Closed);
        if let Some(peer) = lock(&self.peer).take() {
            let _ = peer.send(ChannelEvent::Closed);
        }
    }
}

struct HubMember {
    id: u64,
    tx: mpsc::Sender<RelayEvent>,
}

/// In-memory room relaying signals between its members
#[derive(Clone, Default)]
pub struct MockRelayHub {
    members: Arc<Mutex<Vec<HubMember>>>,
    next_id: Arc<AtomicU64>,
}

impl MockRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the room. Existing members hear `PeerJoined`.
    pub fn join(&self) -> (Arc<MockRelayMember>, mpsc::Receiver<RelayEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(256);
        let _ = tx.try_send(RelayEvent::Connected);

        let mut members = lock(&self.members);
        for member in members.iter() {
            let _ = member.tx.try_send(RelayEvent::PeerJoined);
        }
        members.push(HubMember { id, tx });

        let member = Arc::new(MockRelayMember {
            id,
            hub: self.clone(),
        });
        (member, rx)
    }

    fn others(&self, id: u64) -> Vec<mpsc::Sender<RelayEvent>> {
        lock(&self.members)
            .iter()
            .filter(|m| m.id != id)
            .map(|m| m.tx.clone())
            .collect()
    }
}

/// One member's handle on a `MockRelayHub`
pub struct MockRelayMember {
    id: u64,
    hub: MockRelayHub,
}

impl MockRelayMember {
    /// Leave the room. Remaining members hear `PeerLeft`.
    pub fn leave(&self) {
        let remaining = {
            let mut members = lock(&self.hub.members);
            members.retain(|m| m.id != self.id);
            members.iter().map(|m| m.tx.clone()).collect::<Vec<_>>()
        };
        for tx in remaining {
            let _ = tx.try_send(RelayEvent::PeerLeft);
        }
    }
}

#[async_trait]
impl SignalSender for MockRelayMember {
    async fn send(&self, signal: Signal) -> Result<()> {
        for tx in self.hub.others(self.id) {
            tx.send(RelayEvent::Signal(signal.clone()))
                .await
                .map_err(|_| Error::Signaling("relay member is gone".into()))?;
        }
        Ok(())
    }
}
