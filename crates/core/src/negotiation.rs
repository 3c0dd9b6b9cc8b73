//! Negotiation state machine
//!
//! Two peers converge on one offer/answer pair without a coordinator. Roles
//! break ties: when offers collide the impolite peer drops the incoming
//! offer, the polite peer applies it over its own (implicit rollback).
//! A description that cannot be applied tears the session down and both
//! peers start over on fresh connections (reset-and-retry); only the polite
//! peer announces the reset, the impolite peer only reacts to it.
//!
//! Every async step captures the session it started on. After each await it
//! checks that session is still current and becomes a no-op otherwise.
//! Reset backoff runs on its own task so the caller's event loop keeps
//! moving while a reset is pending.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::capability::{Connection, ConnectionEvent, ConnectionFactory, SignalingState};
use crate::config::PeerConfig;
use crate::error::{Error, Result};
use crate::features::{self, Features};
use crate::relay::SignalSender;
use crate::session::Session;
use crate::signal::{IceCandidate, SdpType, SessionDescription, Signal};

/// Tie-break role, fixed for the lifetime of a room membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Impolite,
    Polite,
}

/// Local offer side of the negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OfferPhase {
    #[default]
    Idle,
    /// A local offer is being generated and sent on this session
    Making { generation: u64 },
    /// Polite peer after a reset: no self-triggered offer until it has
    /// answered the remote peer's offer
    Suppressed,
}

/// Remote description side of the negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemotePhase {
    #[default]
    Idle,
    ApplyingOffer,
    ApplyingAnswer,
}

/// What to do with an incoming description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Apply,
    /// Colliding offer dropped by the impolite peer
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NegotiationState {
    pub role: Role,
    pub offer: OfferPhase,
    pub remote: RemotePhase,
    /// Set for the remainder of the current remote message when an offer
    /// was dropped; candidates of that offer are expected to fail
    pub ignoring_offer: bool,
    /// Resets since the last converged offer/answer pair
    pub consecutive_resets: u32,
    /// Terminal: resets exhausted
    pub failed: bool,
    /// A reset is scheduled; the current session is about to be discarded
    pub reset_pending: bool,
}

impl NegotiationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_polite(&self) -> bool {
        self.role == Role::Polite
    }

    pub fn is_making_offer(&self) -> bool {
        matches!(self.offer, OfferPhase::Making { .. })
    }

    pub fn is_ignoring_offer(&self) -> bool {
        self.ignoring_offer
    }

    pub fn is_setting_remote_answer_pending(&self) -> bool {
        self.remote == RemotePhase::ApplyingAnswer
    }

    pub fn is_suppressing_initial_offer(&self) -> bool {
        self.offer == OfferPhase::Suppressed
    }

    /// Whether an incoming offer can be applied without colliding
    pub fn ready_for_offer(&self, signaling: SignalingState) -> bool {
        !self.is_making_offer()
            && (signaling == SignalingState::Stable || self.is_setting_remote_answer_pending())
    }

    /// Arbitrate an incoming (non-reset) description
    pub fn receive_description(&mut self, kind: SdpType, signaling: SignalingState) -> Disposition {
        let offer_collision = kind == SdpType::Offer && !self.ready_for_offer(signaling);
        self.ignoring_offer = !self.is_polite() && offer_collision;
        if self.ignoring_offer {
            return Disposition::Ignore;
        }
        self.remote = if kind == SdpType::Answer {
            RemotePhase::ApplyingAnswer
        } else {
            RemotePhase::ApplyingOffer
        };
        Disposition::Apply
    }

    /// Try to start a local offer on session `generation`. Returns false if
    /// suppressed, busy, or about to reset.
    fn begin_offer(&mut self, generation: u64) -> bool {
        if self.failed || self.reset_pending || self.offer != OfferPhase::Idle {
            return false;
        }
        self.offer = OfferPhase::Making { generation };
        true
    }

    /// End the offer made on `generation`. An offer of another session is
    /// left alone.
    fn finish_offer(&mut self, generation: u64) {
        if self.offer == (OfferPhase::Making { generation }) {
            self.offer = OfferPhase::Idle;
        }
    }

    /// The post-reset suppression window ends once we have answered
    fn finish_answer(&mut self) {
        if self.offer == OfferPhase::Suppressed {
            self.offer = OfferPhase::Idle;
        }
        self.consecutive_resets = 0;
    }

    /// Transient state for a freshly reset session
    pub fn reset(&mut self) {
        self.offer = if self.is_polite() {
            OfferPhase::Suppressed
        } else {
            OfferPhase::Idle
        };
        self.remote = RemotePhase::Idle;
        self.ignoring_offer = false;
        self.reset_pending = false;
    }

    /// The paired peer left; in-flight work belonged to the old session
    fn on_session_replaced(&mut self) {
        if self.is_making_offer() {
            self.offer = OfferPhase::Idle;
        }
        self.remote = RemotePhase::Idle;
        self.ignoring_offer = false;
        self.reset_pending = false;
        self.consecutive_resets = 0;
        self.failed = false;
    }
}

/// Connection event tagged with the session generation that raised it
#[derive(Debug)]
pub struct SessionEvent {
    pub generation: u64,
    pub event: ConnectionEvent,
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

struct Inner {
    factory: Arc<dyn ConnectionFactory>,
    signals: Arc<dyn SignalSender>,
    config: PeerConfig,
    /// Lock order: `state` before `session`
    state: Mutex<NegotiationState>,
    session: RwLock<Arc<Session>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

/// Negotiation driver for one local peer
#[derive(Clone)]
pub struct Negotiator {
    inner: Arc<Inner>,
}

impl Negotiator {
    /// Create the negotiator and its first session. Connection events of
    /// every session it creates arrive on the returned stream.
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        signals: Arc<dyn SignalSender>,
        config: PeerConfig,
    ) -> Result<(Self, SessionEvents)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let local = Features::new(config.binary_type);
        let session = open_session(factory.as_ref(), 1, &events_tx, local)?;

        let negotiator = Self {
            inner: Arc::new(Inner {
                factory,
                signals,
                config,
                state: Mutex::new(NegotiationState::new()),
                session: RwLock::new(session),
                events_tx,
            }),
        };
        Ok((negotiator, events_rx))
    }

    /// Current session
    pub async fn session(&self) -> Arc<Session> {
        self.inner.session.read().await.clone()
    }

    pub async fn generation(&self) -> u64 {
        self.inner.session.read().await.generation()
    }

    /// Snapshot of the negotiation state
    pub async fn state(&self) -> NegotiationState {
        *self.inner.state.lock().await
    }

    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    async fn is_current(&self, session: &Session) -> bool {
        self.generation().await == session.generation()
    }

    /// Another peer joined the room: we arrived first, so we yield
    pub async fn on_peer_joined(&self) {
        let mut state = self.inner.state.lock().await;
        if !state.is_polite() {
            info!("Peer joined, taking the polite role");
        }
        state.role = Role::Polite;
    }

    /// The paired peer left: start over on a fresh session, keeping our role
    pub async fn on_peer_left(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        self.replace_session().await?;
        state.on_session_replaced();
        Ok(())
    }

    /// The connection asks for a fresh offer
    pub async fn on_negotiation_needed(&self) -> Result<()> {
        // Read the session under the state lock; a reset swaps both together
        let session = {
            let mut state = self.inner.state.lock().await;
            let session = self.session().await;
            if !state.begin_offer(session.generation()) {
                debug!(
                    generation = session.generation(),
                    offer = ?state.offer,
                    reset_pending = state.reset_pending,
                    "Not making an offer"
                );
                return Ok(());
            }
            session
        };

        debug!(generation = session.generation(), "Negotiation needed, making offer");
        let outcome = match local_description(session.connection().as_ref(), SdpType::Offer).await {
            Ok(offer) if self.is_current(&session).await => {
                self.inner.signals.send(Signal::Description(offer)).await
            }
            Ok(_) => {
                debug!(generation = session.generation(), "Dropping offer of a discarded session");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Could not produce an offer, abandoning attempt");
                Ok(())
            }
        };

        // Clear on every path; a reset since then already cleared it
        self.inner
            .state
            .lock()
            .await
            .finish_offer(session.generation());
        outcome
    }

    /// Forward a locally discovered candidate, in discovery order
    pub async fn on_local_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.inner.signals.send(Signal::Candidate(candidate)).await
    }

    /// Handle one signal relayed from the remote peer
    pub async fn on_remote_signal(&self, signal: Signal) -> Result<()> {
        match signal {
            Signal::Description(description) if description.kind == SdpType::Reset => {
                info!("Remote peer requested a reset");
                self.reset_and_retry().await
            }
            Signal::Description(description) => self.on_remote_description(description).await,
            Signal::Candidate(candidate) => self.on_remote_candidate(candidate).await,
        }
    }

    async fn on_remote_description(&self, description: SessionDescription) -> Result<()> {
        let session = self.session().await;
        let kind = description.kind;
        let signaling = session.connection().signaling_state();

        let disposition = {
            let mut state = self.inner.state.lock().await;
            if state.failed {
                debug!(kind = %kind, "Negotiation failed, ignoring description");
                return Ok(());
            }
            if state.reset_pending {
                debug!(kind = %kind, "Reset pending, ignoring description");
                return Ok(());
            }
            state.receive_description(kind, signaling)
        };
        if disposition == Disposition::Ignore {
            debug!(kind = %kind, signaling_state = ?signaling, "Ignoring colliding offer");
            return Ok(());
        }

        debug!(kind = %kind, signaling_state = ?signaling, "Applying remote description");
        if let Err(e) = session.connection().apply_remote_description(description).await {
            warn!(error = %e, kind = %kind, "Cannot apply remote description, resetting");
            return self.reset_and_retry().await;
        }
        if !self.is_current(&session).await {
            return Ok(());
        }
        self.inner.state.lock().await.remote = RemotePhase::Idle;

        match kind {
            SdpType::Offer => self.answer(&session).await,
            SdpType::Answer => {
                self.inner.state.lock().await.consecutive_resets = 0;
                info!(generation = session.generation(), "Negotiation converged");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn answer(&self, session: &Session) -> Result<()> {
        let answer = match local_description(session.connection().as_ref(), SdpType::Answer).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "Cannot answer remote offer, resetting");
                return self.reset_and_retry().await;
            }
        };
        if !self.is_current(session).await {
            return Ok(());
        }

        let sent = self.inner.signals.send(Signal::Description(answer)).await;
        self.inner.state.lock().await.finish_answer();
        info!(generation = session.generation(), "Answered remote offer");
        sent
    }

    async fn on_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let session = self.session().await;
        if let Err(e) = session.connection().add_remote_candidate(candidate).await {
            if self.inner.state.lock().await.ignoring_offer {
                debug!(error = %e, "Dropped candidate of an ignored offer");
            } else {
                warn!(error = %e, "Cannot add ICE candidate for peer");
            }
        }
        Ok(())
    }

    /// Discard the session, start over on a fresh one and, when polite,
    /// ask the remote peer to do the same. With a backoff the reset is
    /// scheduled and this returns right away; further failures on the
    /// doomed session fold into the pending reset.
    pub async fn reset_and_retry(&self) -> Result<()> {
        let (generation, attempt, polite) = {
            let mut state = self.inner.state.lock().await;
            if state.failed {
                return Err(Error::ResetLimitExceeded {
                    attempts: state.consecutive_resets,
                });
            }
            if state.reset_pending {
                debug!("Reset already scheduled");
                return Ok(());
            }
            if state.consecutive_resets >= self.inner.config.max_reset_attempts {
                state.failed = true;
                error!(
                    attempts = state.consecutive_resets,
                    "Negotiation does not converge, giving up"
                );
                return Err(Error::ResetLimitExceeded {
                    attempts: state.consecutive_resets,
                });
            }
            state.consecutive_resets += 1;
            state.reset_pending = true;
            (self.generation().await, state.consecutive_resets, state.is_polite())
        };

        let backoff = self.inner.config.reset_backoff(attempt);
        if backoff.is_zero() {
            return self.finish_reset(generation, attempt, polite).await;
        }

        debug!(attempt, backoff_ms = backoff.as_millis() as u64, "Backing off before reset");
        let negotiator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if let Err(e) = negotiator.finish_reset(generation, attempt, polite).await {
                warn!(error = %e, attempt, "Scheduled reset failed");
            }
        });
        Ok(())
    }

    /// Swap in a fresh session unless `generation` was replaced meanwhile
    async fn finish_reset(&self, generation: u64, attempt: u32, polite: bool) -> Result<()> {
        let session = {
            let mut state = self.inner.state.lock().await;
            if self.generation().await != generation {
                debug!(generation, "Session already replaced, dropping scheduled reset");
                return Ok(());
            }
            state.reset();
            self.replace_session().await?
        };
        info!(generation = session.generation(), attempt, polite, "Session reset");

        if polite {
            self.inner
                .signals
                .send(Signal::Description(SessionDescription::reset()))
                .await?;
        }
        Ok(())
    }

    /// Close the current session and swap in a fresh one
    async fn replace_session(&self) -> Result<Arc<Session>> {
        let local = Features::new(self.inner.config.binary_type);
        let mut current = self.inner.session.write().await;
        let fresh = open_session(
            self.inner.factory.as_ref(),
            current.generation() + 1,
            &self.inner.events_tx,
            local,
        )?;
        let old = std::mem::replace(&mut *current, fresh.clone());
        old.connection().close();
        debug!(
            old = old.generation(),
            new = fresh.generation(),
            "Session replaced"
        );
        Ok(fresh)
    }

    /// Close the current session for good
    pub async fn close(&self) {
        self.session().await.connection().close();
    }
}

/// Create a connection, forward its events tagged with `generation`, and
/// open the feature channel on it.
fn open_session(
    factory: &dyn ConnectionFactory,
    generation: u64,
    events_tx: &mpsc::UnboundedSender<SessionEvent>,
    local: Features,
) -> Result<Arc<Session>> {
    let (connection, mut events) = factory.create()?;
    let session = Arc::new(Session::new(generation, connection));

    let tx = events_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if tx.send(SessionEvent { generation, event }).is_err() {
                break;
            }
        }
    });

    features::establish(&session, local)?;
    Ok(session)
}

/// Generate and apply a local description, falling back to the explicit
/// create-then-apply path when the implicit one fails.
async fn local_description(connection: &dyn Connection, kind: SdpType) -> Result<SessionDescription> {
    match connection.set_local_description().await {
        Ok(description) => Ok(description),
        Err(e) => {
            debug!(error = %e, kind = %kind, "Implicit local description failed, creating explicitly");
            let description = match kind {
                SdpType::Offer => connection.create_offer().await?,
                _ => connection.create_answer().await?,
            };
            connection.apply_local_description(description).await
        }
    }
}
