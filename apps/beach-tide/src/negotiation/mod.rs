//! Offer/answer negotiation of one peer connection against one plugin handle.

pub mod peer;
pub mod rtc;
pub mod state;

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::channel::ChannelSpec;
use crate::replay::ReplayChannels;
use crate::signaling::{IceCandidate, JsepKind, PluginHandle};

pub use peer::{PeerError, PeerEvent, PeerFactory, PeerLink, PeerState};
pub use rtc::{RtcPeerFactory, RtcPeerLink};
pub use state::{NegotiationPhase, NegotiationQueue, Trigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    Attach,
    OpenChannels,
    CreateOffer,
    ApplyLocal,
    RemoteExchange,
    ApplyRemote,
    AwaitConnected,
    Join,
}

impl fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationStep::Attach => "attach",
            NegotiationStep::OpenChannels => "open-channels",
            NegotiationStep::CreateOffer => "create-offer",
            NegotiationStep::ApplyLocal => "apply-local",
            NegotiationStep::RemoteExchange => "remote-exchange",
            NegotiationStep::ApplyRemote => "apply-remote",
            NegotiationStep::AwaitConnected => "await-connected",
            NegotiationStep::Join => "join",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("negotiation failed at {step}: {cause}")]
pub struct NegotiationError {
    pub step: NegotiationStep,
    pub cause: String,
}

impl NegotiationError {
    pub fn new(step: NegotiationStep, cause: impl fmt::Display) -> Self {
        Self {
            step,
            cause: cause.to_string(),
        }
    }
}

/// What the peer connection carries.
#[derive(Debug, Clone)]
pub enum NegotiationPlan {
    /// Opens the reliable and unreliable replay channels.
    Publisher {
        reliable: ChannelSpec,
        unreliable: ChannelSpec,
    },
    /// Receives remote media only.
    Subscriber,
}

/// Returned once the gateway reports the connection up. Channels are only
/// reachable through this value.
pub struct Established {
    pub channels: Option<ReplayChannels>,
}

pub struct Negotiator {
    inner: Arc<NegotiatorInner>,
}

struct NegotiatorInner {
    handle: Arc<PluginHandle>,
    peer: Arc<dyn PeerLink>,
    queue: NegotiationQueue,
    generation: AtomicU64,
    exchanges: AtomicU64,
    closed: AtomicBool,
    phase_tx: watch::Sender<NegotiationPhase>,
    failure_tx: watch::Sender<Option<NegotiationError>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Negotiator {
    pub fn new(handle: Arc<PluginHandle>, peer: Arc<dyn PeerLink>) -> Self {
        let (phase_tx, _) = watch::channel(NegotiationPhase::Idle);
        let (failure_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(NegotiatorInner {
                handle,
                peer,
                queue: NegotiationQueue::new(),
                generation: AtomicU64::new(0),
                exchanges: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                phase_tx,
                failure_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn handle(&self) -> &Arc<PluginHandle> {
        &self.inner.handle
    }

    pub fn phase(&self) -> NegotiationPhase {
        *self.inner.phase_tx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<NegotiationPhase> {
        self.inner.phase_tx.subscribe()
    }

    /// Failures of background renegotiations; the initial handshake reports
    /// through [`Negotiator::establish`].
    pub fn subscribe_failures(&self) -> watch::Receiver<Option<NegotiationError>> {
        self.inner.failure_tx.subscribe()
    }

    pub fn completed_exchanges(&self) -> u64 {
        self.inner.exchanges.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Attaches, opens channels, runs the first exchange and waits for the
    /// gateway's connected signal. On failure the peer is closed and the
    /// handle detached.
    pub async fn establish(
        &self,
        plugin: &str,
        plan: &NegotiationPlan,
        connect_timeout: Duration,
    ) -> Result<Established, NegotiationError> {
        match self.handshake(plugin, plan, connect_timeout).await {
            Ok(established) => Ok(established),
            Err(err) => {
                tracing::error!(
                    target = "negotiation",
                    handle_id = ?self.inner.handle.id(),
                    step = %err.step,
                    cause = %err.cause,
                    "handshake failed"
                );
                self.close().await;
                Err(err)
            }
        }
    }

    async fn handshake(
        &self,
        plugin: &str,
        plan: &NegotiationPlan,
        connect_timeout: Duration,
    ) -> Result<Established, NegotiationError> {
        let inner = &self.inner;
        let handle_id = inner
            .handle
            .attach(plugin)
            .await
            .map_err(|err| NegotiationError::new(NegotiationStep::Attach, err))?;

        let channels = match plan {
            NegotiationPlan::Publisher {
                reliable,
                unreliable,
            } => {
                let reliable = inner
                    .peer
                    .open_channel(reliable)
                    .await
                    .map_err(|err| NegotiationError::new(NegotiationStep::OpenChannels, err))?;
                let unreliable = inner
                    .peer
                    .open_channel(unreliable)
                    .await
                    .map_err(|err| NegotiationError::new(NegotiationStep::OpenChannels, err))?;
                Some(ReplayChannels {
                    reliable,
                    unreliable,
                })
            }
            NegotiationPlan::Subscriber => {
                inner
                    .peer
                    .receive_media()
                    .await
                    .map_err(|err| NegotiationError::new(NegotiationStep::OpenChannels, err))?;
                None
            }
        };

        if inner.queue.request() != Trigger::Start {
            return Err(NegotiationError::new(
                NegotiationStep::CreateOffer,
                "an exchange is already in flight",
            ));
        }
        inner.spawn_event_tasks();

        if let Err(err) = inner.run_exchange().await {
            inner.queue.reset();
            return Err(err);
        }
        if inner.queue.complete() {
            inner.spawn_follow_ups();
        }

        tracing::debug!(target = "negotiation", handle_id, "awaiting connected signal");
        match tokio::time::timeout(connect_timeout, inner.handle.wait_connected()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(NegotiationError::new(NegotiationStep::AwaitConnected, err)),
            Err(_) => {
                return Err(NegotiationError::new(
                    NegotiationStep::AwaitConnected,
                    format!("no connected signal within {connect_timeout:?}"),
                ));
            }
        }
        tracing::info!(target = "negotiation", handle_id, "peer connection established");
        Ok(Established { channels })
    }

    /// Queues an offer/answer exchange. Triggers arriving while one is in
    /// flight collapse into a single follow-up.
    pub fn request_renegotiation(&self) -> Trigger {
        self.inner.request_renegotiation()
    }

    /// Closes the peer connection and detaches the handle. Idempotent.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

impl Drop for Negotiator {
    fn drop(&mut self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl NegotiatorInner {
    fn set_phase(&self, phase: NegotiationPhase) {
        self.phase_tx.send_replace(phase);
    }

    async fn run_exchange(&self) -> Result<(), NegotiationError> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(target = "negotiation", generation, "starting offer/answer exchange");

        self.set_phase(NegotiationPhase::GatheringOffer);
        let offer = self
            .peer
            .create_offer()
            .await
            .map_err(|err| NegotiationError::new(NegotiationStep::CreateOffer, err))?;

        self.set_phase(NegotiationPhase::AwaitingLocalApply);
        let local = async {
            self.peer
                .apply_local(&offer)
                .await
                .map_err(|err| NegotiationError::new(NegotiationStep::ApplyLocal, err))?;
            self.set_phase(NegotiationPhase::AwaitingRemoteExchange);
            Ok::<(), NegotiationError>(())
        };
        let remote = async {
            self.handle
                .send_jsep(offer.clone())
                .await
                .map_err(|err| NegotiationError::new(NegotiationStep::RemoteExchange, err))
        };
        let ((), answer) = tokio::try_join!(local, remote)?;

        if self.closed.load(Ordering::Acquire)
            || self.generation.load(Ordering::Acquire) != generation
        {
            tracing::debug!(
                target = "negotiation",
                generation,
                "discarding answer from superseded exchange",
            );
            return Ok(());
        }
        let answer = answer.ok_or_else(|| {
            NegotiationError::new(NegotiationStep::RemoteExchange, "reply carried no answer")
        })?;
        if answer.kind != JsepKind::Answer {
            return Err(NegotiationError::new(
                NegotiationStep::RemoteExchange,
                format!("expected an answer, got {:?}", answer.kind),
            ));
        }
        self.peer
            .apply_remote(&answer)
            .await
            .map_err(|err| NegotiationError::new(NegotiationStep::ApplyRemote, err))?;

        self.exchanges.fetch_add(1, Ordering::AcqRel);
        self.set_phase(NegotiationPhase::Stable);
        tracing::debug!(target = "negotiation", generation, "exchange complete");
        Ok(())
    }

    fn request_renegotiation(self: &Arc<Self>) -> Trigger {
        if self.closed.load(Ordering::Acquire) {
            tracing::debug!(target = "negotiation", "ignoring renegotiation on closed context");
            return Trigger::Coalesced;
        }
        let trigger = self.queue.request();
        match trigger {
            Trigger::Start => self.spawn_follow_ups(),
            Trigger::Queued => {
                tracing::debug!(target = "negotiation", "exchange in flight; follow-up queued");
            }
            Trigger::Coalesced => {
                tracing::debug!(target = "negotiation", "follow-up already queued");
            }
        }
        trigger
    }

    /// Runs exchanges while the queue holds work. The caller must own the
    /// in-flight slot.
    fn spawn_follow_ups(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                if let Err(err) = inner.run_exchange().await {
                    tracing::error!(
                        target = "negotiation",
                        step = %err.step,
                        cause = %err.cause,
                        "renegotiation failed"
                    );
                    inner.failure_tx.send_replace(Some(err));
                    inner.close().await;
                    return;
                }
                if !inner.queue.complete() {
                    return;
                }
            }
        });
        self.tasks.lock().push(task);
    }

    fn spawn_event_tasks(self: &Arc<Self>) {
        let Some(mut events) = self.peer.take_events() else {
            tracing::debug!(target = "negotiation", "peer events already taken");
            return;
        };
        let (trickle_tx, trickle_rx) = mpsc::unbounded_channel();
        let trickle = tokio::spawn(trickle_candidates(Arc::clone(&self.handle), trickle_rx));

        let inner = Arc::clone(self);
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PeerEvent::LocalCandidate(candidate) => {
                        if trickle_tx.send(candidate).is_err() {
                            break;
                        }
                    }
                    PeerEvent::NegotiationNeeded => {
                        inner.request_renegotiation();
                    }
                    PeerEvent::StateChanged(state) => match state {
                        PeerState::Failed | PeerState::Disconnected => {
                            tracing::warn!(
                                target = "negotiation",
                                state = ?state,
                                "peer connection degraded",
                            );
                        }
                        _ => {
                            tracing::debug!(
                                target = "negotiation",
                                state = ?state,
                                "peer connection state changed",
                            );
                        }
                    },
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(trickle);
        tasks.push(pump);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.queue.reset();
        self.peer.close().await;
        self.handle.detach().await;
        self.set_phase(NegotiationPhase::Idle);
        tracing::debug!(
            target = "negotiation",
            handle_id = ?self.handle.id(),
            "negotiation context closed",
        );
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }
}

/// Trickles candidates for one handle in gathering order. The end-of-candidates
/// marker goes out at most once.
async fn trickle_candidates(
    handle: Arc<PluginHandle>,
    mut candidates: mpsc::UnboundedReceiver<Option<IceCandidate>>,
) {
    let mut completed = false;
    while let Some(candidate) = candidates.recv().await {
        match candidate {
            Some(candidate) => handle.send_trickle(Some(candidate)).await,
            None if completed => {
                tracing::debug!(target = "negotiation", "ignoring repeated end-of-candidates");
            }
            None => {
                completed = true;
                handle.send_trickle(None).await;
            }
        }
    }
}
