use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::envelope::{Envelope, HandleId, Inbound, Request, SessionId};
use super::transport::SignalLink;
use super::SignalingError;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a request may wait for its reply.
    pub request_timeout: Duration,
    /// Idle period after which a keepalive is sent.
    pub keepalive_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unattached,
    Created,
    Destroyed,
}

/// One gateway session multiplexed over a single [`SignalLink`].
///
/// Replies are correlated by transaction id through the pending table;
/// envelopes without a matching transaction are pushes and are fanned out by
/// their `sender` handle id. Handles only keep a weak reference, so dropping
/// the `Session` tears down its tasks.
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    config: SessionConfig,
    outbound: mpsc::UnboundedSender<String>,
    shared: Mutex<Shared>,
    listeners: Mutex<HashMap<HandleId, mpsc::UnboundedSender<Envelope>>>,
    session_events_tx: mpsc::UnboundedSender<Envelope>,
    session_events_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    state_tx: watch::Sender<SessionState>,
    last_activity: Mutex<Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    state: SessionState,
    id: Option<SessionId>,
    pending: HashMap<String, PendingReply>,
}

struct PendingReply {
    reply: oneshot::Sender<Result<Envelope, SignalingError>>,
    completes_on_ack: bool,
    kind: &'static str,
}

impl Session {
    /// Starts pumping the link. The session stays `Unattached` until
    /// [`Session::create`] succeeds.
    pub fn start(link: SignalLink, config: SessionConfig) -> Self {
        let SignalLink {
            outbound,
            mut inbound,
            tasks,
        } = link;
        let (session_events_tx, session_events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Unattached);
        let inner = Arc::new(SessionInner {
            config,
            outbound,
            shared: Mutex::new(Shared {
                state: SessionState::Unattached,
                id: None,
                pending: HashMap::new(),
            }),
            listeners: Mutex::new(HashMap::new()),
            session_events_tx,
            session_events_rx: Mutex::new(Some(session_events_rx)),
            state_tx,
            last_activity: Mutex::new(Instant::now()),
            tasks: Mutex::new(tasks),
        });

        let reader_inner = Arc::downgrade(&inner);
        let reader = tokio::spawn(async move {
            while let Some(text) = inbound.recv().await {
                let Some(inner) = reader_inner.upgrade() else {
                    return;
                };
                inner.receive(&text);
            }
            if let Some(inner) = reader_inner.upgrade() {
                inner.close("gateway connection closed");
            }
        });
        let keepalive = tokio::spawn(keepalive_loop(Arc::downgrade(&inner)));
        {
            let mut guard = inner.tasks.lock();
            guard.push(reader);
            guard.push(keepalive);
        }

        Session { inner }
    }

    /// Asks the gateway for a new session and records the assigned id.
    pub async fn create(&self) -> Result<SessionId, SignalingError> {
        if self.state() != SessionState::Unattached {
            return Err(SignalingError::Protocol("session already created".into()));
        }
        let reply = self
            .inner
            .send(Request::Create, None)
            .await
            .map_err(|err| match err {
                SignalingError::Gateway { code, reason } => SignalingError::Transport(format!(
                    "session creation rejected ({code}): {reason}"
                )),
                other => other,
            })?;
        let id = reply.assigned_id()?;
        {
            let mut shared = self.inner.shared.lock();
            if shared.state == SessionState::Destroyed {
                return Err(SignalingError::Transport(
                    "session closed during creation".into(),
                ));
            }
            shared.id = Some(id);
            shared.state = SessionState::Created;
        }
        self.inner.state_tx.send_replace(SessionState::Created);
        tracing::info!(target = "signaling", session_id = id, "gateway session created");
        Ok(id)
    }

    pub async fn send(
        &self,
        request: Request,
        handle_id: Option<HandleId>,
    ) -> Result<Envelope, SignalingError> {
        self.inner.send(request, handle_id).await
    }

    /// Feeds one raw inbound envelope through correlation and push dispatch.
    pub fn receive(&self, raw: &str) {
        self.inner.receive(raw);
    }

    pub fn id(&self) -> Option<SessionId> {
        self.inner.shared.lock().id
    }

    pub fn state(&self) -> SessionState {
        self.inner.shared.lock().state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.shared.lock().pending.len()
    }

    /// Pushes not addressed to any attached handle. Can be taken once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        self.inner.session_events_rx.lock().take()
    }

    /// Sends `destroy` when the session exists, then closes it locally.
    pub async fn destroy(&self) {
        if self.state() == SessionState::Created {
            if let Err(err) = self.inner.send(Request::Destroy, None).await {
                tracing::debug!(target = "signaling", error = %err, "destroy request failed");
            }
        }
        self.inner.close("session destroyed by client");
    }

    pub fn close(&self, reason: &str) {
        self.inner.close(reason);
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }
}

impl SessionInner {
    pub(crate) async fn send(
        &self,
        request: Request,
        handle_id: Option<HandleId>,
    ) -> Result<Envelope, SignalingError> {
        let transaction = Uuid::new_v4().simple().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        let frame = {
            let mut shared = self.shared.lock();
            if shared.state == SessionState::Destroyed {
                return Err(SignalingError::Transport("session destroyed".into()));
            }
            let frame = request.to_frame(&transaction, shared.id, handle_id)?;
            shared.pending.insert(
                transaction.clone(),
                PendingReply {
                    reply: reply_tx,
                    completes_on_ack: request.completes_on_ack(),
                    kind: request.kind(),
                },
            );
            frame
        };
        tracing::trace!(
            target = "signaling",
            kind = request.kind(),
            transaction = %transaction,
            handle_id = ?handle_id,
            "sending request"
        );
        self.touch();
        if self.outbound.send(frame).is_err() {
            self.close("gateway connection closed");
        }

        match tokio::time::timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SignalingError::Transport(
                "session dropped before reply".into(),
            )),
            Err(_) => {
                self.shared.lock().pending.remove(&transaction);
                tracing::warn!(
                    target = "signaling",
                    kind = request.kind(),
                    transaction = %transaction,
                    "request timed out"
                );
                Err(SignalingError::Timeout(self.config.request_timeout))
            }
        }
    }

    fn receive(&self, raw: &str) {
        self.touch();
        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(target = "signaling", error = %err, "discarding inbound frame");
                return;
            }
        };

        if let Some(transaction) = envelope.transaction.clone() {
            let mut shared = self.shared.lock();
            if let Some(completes_on_ack) = shared
                .pending
                .get(&transaction)
                .map(|entry| entry.completes_on_ack)
            {
                if matches!(envelope.body, Inbound::Ack) && !completes_on_ack {
                    tracing::trace!(
                        target = "signaling",
                        transaction = %transaction,
                        "request acknowledged; awaiting plugin event"
                    );
                    return;
                }
                if let Some(entry) = shared.pending.remove(&transaction) {
                    drop(shared);
                    tracing::trace!(
                        target = "signaling",
                        kind = entry.kind,
                        transaction = %transaction,
                        "reply correlated"
                    );
                    let result = match envelope.body {
                        Inbound::Error(fault) => Err(fault.into()),
                        _ => Ok(envelope),
                    };
                    let _ = entry.reply.send(result);
                }
                return;
            }
            drop(shared);
            if matches!(
                envelope.body,
                Inbound::Ack | Inbound::Success { .. } | Inbound::Error(_)
            ) {
                tracing::debug!(
                    target = "signaling",
                    transaction = %transaction,
                    "discarding reply without a pending request"
                );
                return;
            }
        }

        self.dispatch_push(envelope);
    }

    fn dispatch_push(&self, envelope: Envelope) {
        if let Some(sender) = envelope.sender {
            let mut listeners = self.listeners.lock();
            if let Some(listener) = listeners.get(&sender) {
                if listener.send(envelope).is_err() {
                    listeners.remove(&sender);
                }
                return;
            }
            drop(listeners);
            tracing::debug!(
                target = "signaling",
                handle_id = sender,
                "push for unknown handle; forwarding to session listeners"
            );
        }

        let timed_out = matches!(envelope.body, Inbound::Timeout);
        if let Inbound::Unrecognized { kind } = &envelope.body {
            tracing::warn!(target = "signaling", kind = %kind, "unrecognized session push");
        }
        let _ = self.session_events_tx.send(envelope);
        if timed_out {
            self.close("session timed out on the gateway");
        }
    }

    pub(crate) fn register_listener(
        &self,
        handle_id: HandleId,
    ) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(handle_id, tx);
        rx
    }

    pub(crate) fn unregister_listener(&self, handle_id: HandleId) {
        self.listeners.lock().remove(&handle_id);
    }

    pub(crate) fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_deadline(&self) -> Instant {
        *self.last_activity.lock() + self.config.keepalive_interval
    }

    fn close(&self, reason: &str) {
        let drained: Vec<PendingReply> = {
            let mut shared = self.shared.lock();
            if shared.state == SessionState::Destroyed {
                return;
            }
            shared.state = SessionState::Destroyed;
            shared.pending.drain().map(|(_, entry)| entry).collect()
        };
        tracing::info!(
            target = "signaling",
            reason,
            failed_requests = drained.len(),
            "gateway session closed"
        );
        for entry in drained {
            let _ = entry
                .reply
                .send(Err(SignalingError::Transport(reason.to_string())));
        }
        self.listeners.lock().clear();
        self.state_tx.send_replace(SessionState::Destroyed);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn keepalive_loop(session: Weak<SessionInner>) {
    loop {
        let (deadline, state) = match session.upgrade() {
            Some(inner) => (inner.idle_deadline(), inner.state()),
            None => return,
        };
        if state == SessionState::Destroyed {
            return;
        }
        if Instant::now() < deadline {
            tokio::time::sleep_until(deadline).await;
            continue;
        }
        let Some(inner) = session.upgrade() else {
            return;
        };
        if state != SessionState::Created {
            inner.touch();
            continue;
        }
        tracing::trace!(target = "signaling", "session idle; sending keepalive");
        match inner.send(Request::Keepalive, None).await {
            Ok(_) => {}
            Err(SignalingError::Transport(_)) => return,
            Err(err) => {
                tracing::warn!(target = "signaling", error = %err, "keepalive failed");
            }
        }
    }
}
