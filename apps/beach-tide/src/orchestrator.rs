//! Owns one gateway session and every negotiation context built on it.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::{ChannelReliability, ChannelSpec};
use crate::config::ClientConfig;
use crate::negotiation::{
    Established, NegotiationError, NegotiationPlan, NegotiationStep, Negotiator, PeerError,
    PeerFactory,
};
use crate::replay::{RecordedEvent, ReplayError, ReplayHandle, ReplayOptions, ReplaySummary};
use crate::signaling::{
    HandleEvent, JoinResponse, PluginEvent, PluginHandle, PluginReply, PluginRequest, RoomId,
    Session, SessionState, SignalLink, SignalingError, SubscriptionSpec, UserId,
};

pub type ParticipantId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientStatus {
    Connecting,
    Negotiating,
    Joined,
    Replaying,
    Failed(String),
    Closed,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("failed to create peer connection: {0}")]
    Peer(#[from] PeerError),
    #[error("not joined to the room")]
    NotJoined,
    #[error("publisher connection has no data channels")]
    MissingChannels,
}

/// One negotiated connection plus whatever runs on top of it.
pub struct ParticipantContext {
    negotiator: Negotiator,
    replay: Option<ReplayHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl ParticipantContext {
    pub fn new(negotiator: Negotiator) -> Self {
        Self {
            negotiator,
            replay: None,
            tasks: Vec::new(),
        }
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    async fn close(mut self) {
        if let Some(replay) = self.replay.take() {
            replay.cancel();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.negotiator.close().await;
    }
}

impl Drop for ParticipantContext {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

pub struct Orchestrator {
    config: ClientConfig,
    room_id: RoomId,
    user_id: UserId,
    session: Session,
    peers: Arc<dyn PeerFactory>,
    contexts: Mutex<HashMap<ParticipantId, ParticipantContext>>,
    room_users: Mutex<BTreeSet<UserId>>,
    status_tx: watch::Sender<ClientStatus>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: ClientConfig,
        room_id: impl Into<RoomId>,
        user_id: impl Into<UserId>,
        link: SignalLink,
        peers: Arc<dyn PeerFactory>,
    ) -> Arc<Self> {
        let session = Session::start(link, config.session_config());
        let (status_tx, _) = watch::channel(ClientStatus::Connecting);
        Arc::new(Self {
            config,
            room_id: room_id.into(),
            user_id: user_id.into(),
            session,
            peers,
            contexts: Mutex::new(HashMap::new()),
            room_users: Mutex::new(BTreeSet::new()),
            status_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Connects to `config.gateway_url` over websocket and creates the session.
    pub async fn connect(
        config: ClientConfig,
        room_id: impl Into<RoomId>,
        user_id: impl Into<UserId>,
        peers: Arc<dyn PeerFactory>,
    ) -> Result<Arc<Self>, OrchestratorError> {
        let link = SignalLink::connect(&config.gateway_url).await?;
        let orchestrator = Self::new(config, room_id, user_id, link, peers);
        orchestrator.start().await?;
        Ok(orchestrator)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn status(&self) -> ClientStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ClientStatus> {
        self.status_tx.subscribe()
    }

    pub fn room_users(&self) -> BTreeSet<UserId> {
        self.room_users.lock().clone()
    }

    pub fn participants(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.contexts.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn set_status(&self, status: ClientStatus) {
        tracing::debug!(
            target = "orchestrator",
            user_id = %self.user_id,
            status = ?status,
            "status changed",
        );
        self.status_tx.send_replace(status);
    }

    fn fail(&self, reason: String) {
        tracing::error!(
            target = "orchestrator",
            user_id = %self.user_id,
            reason = %reason,
            "client failed",
        );
        self.set_status(ClientStatus::Failed(reason));
    }

    /// Creates the gateway session and starts watching it.
    pub async fn start(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        if let Err(err) = self.session.create().await {
            self.fail(format!("session creation failed: {err}"));
            return Err(err.into());
        }

        let mut state = self.session.subscribe_state();
        let weak = Arc::downgrade(self);
        let watcher = tokio::spawn(async move {
            if state
                .wait_for(|state| *state == SessionState::Destroyed)
                .await
                .is_err()
            {
                return;
            }
            if let Some(orchestrator) = weak.upgrade() {
                if orchestrator.status() != ClientStatus::Closed {
                    orchestrator.fail("signaling transport lost".into());
                }
            }
        });

        let mut tasks = vec![watcher];
        if let Some(mut events) = self.session.take_events() {
            tasks.push(tokio::spawn(async move {
                while let Some(envelope) = events.recv().await {
                    tracing::debug!(
                        target = "orchestrator",
                        sender = ?envelope.sender,
                        body = ?envelope.body,
                        "session push"
                    );
                }
            }));
        }
        self.tasks.lock().extend(tasks);
        Ok(())
    }

    /// Negotiates the publisher connection, joins the room and starts the
    /// replay once the connection is up.
    pub async fn run_publisher(
        self: &Arc<Self>,
        recording: Vec<RecordedEvent>,
        options: ReplayOptions,
    ) -> Result<(), OrchestratorError> {
        self.set_status(ClientStatus::Negotiating);
        let plan = NegotiationPlan::Publisher {
            reliable: ChannelSpec::new(&self.config.reliable_label, ChannelReliability::Reliable),
            unreliable: ChannelSpec::new(
                &self.config.unreliable_label,
                ChannelReliability::Unreliable,
            ),
        };
        let join = PluginRequest::Join {
            room_id: self.room_id.clone(),
            user_id: self.user_id.clone(),
            subscribe: Some(SubscriptionSpec::publisher(self.config.subscribe_data)),
        };
        let (mut context, established, reply) = match self.negotiate(plan, join).await {
            Ok(parts) => parts,
            Err(err) => {
                self.fail(err.to_string());
                return Err(err);
            }
        };

        let joined = JoinResponse::from_response(reply.response()).unwrap_or_else(|err| {
            tracing::warn!(
                target = "orchestrator",
                error = %err,
                "ignoring malformed join response",
            );
            JoinResponse::default()
        });
        let existing: BTreeSet<UserId> = joined
            .members_of(&self.room_id)
            .into_iter()
            .filter(|user| *user != self.user_id)
            .collect();
        self.room_users.lock().extend(existing.iter().cloned());
        tracing::info!(
            target = "orchestrator",
            room_id = %self.room_id,
            user_id = %self.user_id,
            present = existing.len(),
            "joined room"
        );
        self.set_status(ClientStatus::Joined);

        if let Some(events) = context.negotiator.handle().take_events() {
            context
                .tasks
                .push(tokio::spawn(watch_room(Arc::downgrade(self), events)));
        }
        context.tasks.push(self.watch_failures(&context.negotiator));

        let Some(channels) = established.channels else {
            context.close().await;
            self.fail("publisher connection has no data channels".into());
            return Err(OrchestratorError::MissingChannels);
        };
        if recording.is_empty() {
            tracing::info!(target = "orchestrator", "no recording to replay");
        } else {
            let replay = ReplayHandle::spawn(recording, self.user_id.clone(), channels, options);
            self.set_status(ClientStatus::Replaying);
            context
                .tasks
                .push(self.watch_replay(replay.subscribe_outcome()));
            context.replay = Some(replay);
        }

        if let Some(previous) = self.register(self.user_id.clone(), context) {
            previous.close().await;
        }

        if self.config.subscribe_media {
            for user in existing {
                self.spawn_subscriber(user);
            }
        }
        Ok(())
    }

    async fn negotiate(
        &self,
        plan: NegotiationPlan,
        join: PluginRequest,
    ) -> Result<(ParticipantContext, Established, PluginReply), OrchestratorError> {
        let peer = self.peers.create().await?;
        let handle = Arc::new(PluginHandle::new(&self.session));
        let negotiator = Negotiator::new(handle, peer);
        let established = negotiator
            .establish(&self.config.plugin, &plan, self.config.connect_timeout)
            .await?;

        let sent = match join.to_body() {
            Ok(body) => negotiator.handle().send_message(body).await,
            Err(err) => Err(err),
        };
        let reply = match sent {
            Ok(reply) => reply,
            Err(err) => {
                negotiator.close().await;
                return Err(NegotiationError::new(NegotiationStep::Join, err).into());
            }
        };
        Ok((ParticipantContext::new(negotiator), established, reply))
    }

    fn watch_failures(self: &Arc<Self>, negotiator: &Negotiator) -> JoinHandle<()> {
        let mut failures = negotiator.subscribe_failures();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while failures.changed().await.is_ok() {
                let failure = failures.borrow_and_update().clone();
                if let (Some(err), Some(orchestrator)) = (failure, weak.upgrade()) {
                    orchestrator.fail(err.to_string());
                    orchestrator.retire(orchestrator.user_id.clone());
                    return;
                }
            }
        })
    }

    fn watch_replay(
        self: &Arc<Self>,
        mut outcome: watch::Receiver<Option<Result<ReplaySummary, ReplayError>>>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let result = match outcome.wait_for(Option::is_some).await {
                Ok(result) => result.clone(),
                Err(_) => return,
            };
            let Some(orchestrator) = weak.upgrade() else {
                return;
            };
            match result {
                Some(Ok(summary)) => {
                    tracing::info!(target = "orchestrator", sent = summary.sent, "replay complete");
                }
                Some(Err(err)) => {
                    tracing::warn!(target = "orchestrator", error = %err, "replay ended early");
                }
                None => return,
            }
            if orchestrator.status() == ClientStatus::Replaying {
                orchestrator.set_status(ClientStatus::Joined);
            }
        })
    }

    fn spawn_subscriber(self: &Arc<Self>, publisher: UserId) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let Some(orchestrator) = weak.upgrade() else {
                return;
            };
            if let Err(err) = orchestrator.open_subscriber(publisher.clone()).await {
                tracing::warn!(
                    target = "orchestrator",
                    publisher = %publisher,
                    error = %err,
                    "media subscription failed"
                );
            }
        });
        self.track(task);
    }

    /// Opens a receive-only connection for `publisher`'s media.
    pub async fn open_subscriber(
        self: &Arc<Self>,
        publisher: UserId,
    ) -> Result<(), OrchestratorError> {
        if publisher == self.user_id || self.contexts.lock().contains_key(&publisher) {
            return Ok(());
        }
        let join = PluginRequest::Join {
            room_id: self.room_id.clone(),
            user_id: self.user_id.clone(),
            subscribe: Some(SubscriptionSpec::media_from(publisher.clone())),
        };
        let (context, _, _) = self.negotiate(NegotiationPlan::Subscriber, join).await?;
        if !self.room_users.lock().contains(&publisher) {
            tracing::debug!(
                target = "orchestrator",
                publisher = %publisher,
                "publisher left during negotiation",
            );
            context.close().await;
            return Ok(());
        }
        tracing::info!(target = "orchestrator", publisher = %publisher, "subscribed to media");
        if let Some(previous) = self.register(publisher, context) {
            previous.close().await;
        }
        Ok(())
    }

    /// Adds a context, returning any context it replaced.
    pub fn register(
        &self,
        participant: ParticipantId,
        context: ParticipantContext,
    ) -> Option<ParticipantContext> {
        tracing::debug!(target = "orchestrator", participant = %participant, "context registered");
        self.contexts.lock().insert(participant, context)
    }

    /// Closes a context from one of its own watcher tasks. The close runs on
    /// a fresh task since closing aborts the context's tasks.
    fn retire(self: &Arc<Self>, participant: ParticipantId) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.unregister(&participant).await;
            }
        });
        self.track(task);
    }

    /// Keeps `task` for shutdown, dropping handles of tasks that already ended.
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Number of task handles currently held for shutdown.
    pub fn background_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Removes and closes a context. Returns whether one existed.
    pub async fn unregister(&self, participant: &str) -> bool {
        let context = self.contexts.lock().remove(participant);
        match context {
            Some(context) => {
                context.close().await;
                tracing::debug!(target = "orchestrator", participant, "context closed");
                true
            }
            None => false,
        }
    }

    fn publisher_handle(&self) -> Result<Arc<PluginHandle>, OrchestratorError> {
        self.contexts
            .lock()
            .get(&self.user_id)
            .map(|context| Arc::clone(context.negotiator.handle()))
            .ok_or(OrchestratorError::NotJoined)
    }

    async fn send_plugin(&self, request: PluginRequest) -> Result<(), OrchestratorError> {
        let handle = self.publisher_handle()?;
        handle.send_message(request.to_body()?).await?;
        Ok(())
    }

    pub async fn subscribe(&self, what: SubscriptionSpec) -> Result<(), OrchestratorError> {
        self.send_plugin(PluginRequest::Subscribe { what }).await
    }

    pub async fn block(&self, whom: impl Into<UserId>) -> Result<(), OrchestratorError> {
        self.send_plugin(PluginRequest::Block { whom: whom.into() })
            .await
    }

    pub async fn unblock(&self, whom: impl Into<UserId>) -> Result<(), OrchestratorError> {
        self.send_plugin(PluginRequest::Unblock { whom: whom.into() })
            .await
    }

    async fn on_room_event(self: &Arc<Self>, event: PluginEvent) {
        match event {
            PluginEvent::Join { room_id, user_id } => {
                if room_id != self.room_id || user_id == self.user_id {
                    return;
                }
                let added = self.room_users.lock().insert(user_id.clone());
                tracing::info!(target = "orchestrator", user_id = %user_id, "user joined");
                if added && self.config.subscribe_media {
                    self.spawn_subscriber(user_id);
                }
            }
            PluginEvent::Leave { room_id, user_id } => {
                if room_id != self.room_id || user_id == self.user_id {
                    return;
                }
                self.room_users.lock().remove(&user_id);
                tracing::info!(target = "orchestrator", user_id = %user_id, "user left");
                self.unregister(&user_id).await;
            }
            PluginEvent::Blocked { by } => {
                tracing::info!(target = "orchestrator", by = %by, "blocked by user");
            }
            PluginEvent::Unblocked { by } => {
                tracing::info!(target = "orchestrator", by = %by, "unblocked by user");
            }
            PluginEvent::Data { body } => {
                tracing::trace!(target = "orchestrator", body = %body, "room data");
            }
            PluginEvent::Unrecognized(_) => {}
        }
    }

    /// Closes every context and destroys the session.
    pub async fn shutdown(&self) {
        self.set_status(ClientStatus::Closed);
        let contexts: Vec<_> = self.contexts.lock().drain().map(|(_, ctx)| ctx).collect();
        for context in contexts {
            context.close().await;
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.session.destroy().await;
        tracing::info!(target = "orchestrator", user_id = %self.user_id, "client shut down");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Starts `count` publishing clients, `spacing` apart. A client that fails
/// to connect or join is logged and shut down; the others still start.
pub async fn launch<F, Fut>(
    count: usize,
    spacing: Duration,
    recording: &[RecordedEvent],
    options: &ReplayOptions,
    mut connect: F,
) -> Vec<Arc<Orchestrator>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Arc<Orchestrator>, OrchestratorError>>,
{
    let mut clients = Vec::with_capacity(count);
    for index in 0..count {
        if index > 0 && !spacing.is_zero() {
            tokio::time::sleep(spacing).await;
        }
        let client = match connect(index).await {
            Ok(client) => client,
            Err(err) => {
                tracing::error!(
                    target = "orchestrator",
                    index,
                    error = %err,
                    "client failed to connect"
                );
                continue;
            }
        };
        if let Err(err) = client
            .run_publisher(recording.to_vec(), options.clone())
            .await
        {
            tracing::error!(
                target = "orchestrator",
                index,
                user_id = %client.user_id(),
                error = %err,
                "client failed to join"
            );
            client.shutdown().await;
            continue;
        }
        clients.push(client);
    }
    tracing::info!(
        target = "orchestrator",
        started = clients.len(),
        requested = count,
        "clients started"
    );
    clients
}

async fn watch_room(
    orchestrator: Weak<Orchestrator>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<HandleEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(orchestrator) = orchestrator.upgrade() else {
            return;
        };
        match event {
            HandleEvent::Plugin(event) => orchestrator.on_room_event(event).await,
            HandleEvent::Hangup { reason } => {
                tracing::warn!(
                    target = "orchestrator",
                    reason = ?reason,
                    "publisher connection hung up",
                );
            }
            HandleEvent::Detached => {
                orchestrator.fail("publisher handle detached by gateway".into());
                orchestrator.retire(orchestrator.user_id.clone());
                return;
            }
            HandleEvent::RemoteJsep(jsep) => {
                tracing::warn!(
                    target = "orchestrator",
                    kind = ?jsep.kind,
                    "ignoring gateway-initiated description",
                );
            }
            HandleEvent::Media { kind, receiving } => {
                tracing::debug!(target = "orchestrator", kind = ?kind, receiving, "media state");
            }
            HandleEvent::SlowLink { .. } | HandleEvent::Unrecognized { .. } => {}
        }
    }
}
