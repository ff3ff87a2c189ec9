use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::envelope::{
    Envelope, HandleId, IceCandidate, Inbound, Jsep, PluginReply, Request, empty_body,
};
use super::plugin::PluginEvent;
use super::session::{Session, SessionInner};
use super::SignalingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Unattached,
    Attached,
    /// Terminal. A detached handle is never reattached.
    Detached,
}

/// Pushes addressed to one handle, after the connected signal is split off.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleEvent {
    Plugin(PluginEvent),
    RemoteJsep(Jsep),
    Media { kind: Option<String>, receiving: bool },
    SlowLink { uplink: bool },
    Hangup { reason: Option<String> },
    Detached,
    Unrecognized { kind: String },
}

struct HandleCore {
    state: HandleState,
    id: Option<HandleId>,
}

struct RouterParts {
    connected_tx: oneshot::Sender<()>,
    events_tx: mpsc::UnboundedSender<HandleEvent>,
}

/// A sub-channel bound to one plugin instance on the gateway.
pub struct PluginHandle {
    session: Weak<SessionInner>,
    core: Arc<Mutex<HandleCore>>,
    router_parts: Mutex<Option<RouterParts>>,
    connected_rx: Mutex<Option<oneshot::Receiver<()>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<HandleEvent>>>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl PluginHandle {
    pub fn new(session: &Session) -> Self {
        let (connected_tx, connected_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            session: session.downgrade(),
            core: Arc::new(Mutex::new(HandleCore {
                state: HandleState::Unattached,
                id: None,
            })),
            router_parts: Mutex::new(Some(RouterParts {
                connected_tx,
                events_tx,
            })),
            connected_rx: Mutex::new(Some(connected_rx)),
            events_rx: Mutex::new(Some(events_rx)),
            router: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Option<HandleId> {
        self.core.lock().id
    }

    pub fn state(&self) -> HandleState {
        self.core.lock().state
    }

    pub async fn attach(&self, plugin: &str) -> Result<HandleId, SignalingError> {
        match self.state() {
            HandleState::Unattached => {}
            HandleState::Attached => {
                return Err(SignalingError::Protocol("handle already attached".into()));
            }
            HandleState::Detached => return Err(SignalingError::Detached),
        }
        let session = self.session()?;
        let reply = session
            .send(
                Request::Attach {
                    plugin: plugin.to_string(),
                },
                None,
            )
            .await?;
        let id = reply.assigned_id()?;
        let pushes = session.register_listener(id);
        {
            let mut core = self.core.lock();
            core.id = Some(id);
            core.state = HandleState::Attached;
        }
        if let Some(parts) = self.router_parts.lock().take() {
            let task = tokio::spawn(route_pushes(id, pushes, parts, Arc::clone(&self.core)));
            *self.router.lock() = Some(task);
        }
        tracing::debug!(target = "signaling", handle_id = id, plugin, "plugin handle attached");
        Ok(id)
    }

    /// Sends a plugin message and waits for the plugin's reply event.
    pub async fn send_message(
        &self,
        body: serde_json::Value,
    ) -> Result<PluginReply, SignalingError> {
        let (session, id) = self.attached()?;
        let envelope = session
            .send(Request::Message { body, jsep: None }, Some(id))
            .await?;
        PluginReply::from_envelope(envelope)
    }

    /// Sends a session description and returns the description in the reply.
    pub async fn send_jsep(&self, jsep: Jsep) -> Result<Option<Jsep>, SignalingError> {
        let (session, id) = self.attached()?;
        let envelope = session
            .send(
                Request::Message {
                    body: empty_body(),
                    jsep: Some(jsep),
                },
                Some(id),
            )
            .await?;
        Ok(PluginReply::from_envelope(envelope)?.jsep)
    }

    /// Trickles one local candidate; `None` tells the gateway gathering is
    /// complete. Failures are only logged.
    pub async fn send_trickle(&self, candidate: Option<IceCandidate>) {
        let (session, id) = match self.attached() {
            Ok(attached) => attached,
            Err(err) => {
                tracing::debug!(target = "signaling", error = %err, "skipping trickle");
                return;
            }
        };
        let terminator = candidate.is_none();
        if let Err(err) = session
            .send(
                Request::Trickle {
                    candidate: candidate.into(),
                },
                Some(id),
            )
            .await
        {
            tracing::warn!(
                target = "signaling",
                handle_id = id,
                terminator,
                error = %err,
                "trickle failed"
            );
        }
    }

    /// Moves the handle to its terminal state, telling the gateway if it was
    /// attached. Calling it again does nothing.
    pub async fn detach(&self) {
        let attached_id = {
            let mut core = self.core.lock();
            let prior = core.state;
            core.state = HandleState::Detached;
            match prior {
                HandleState::Attached => core.id,
                _ => None,
            }
        };
        let Some(id) = attached_id else {
            return;
        };
        if let Some(session) = self.session.upgrade() {
            if let Err(err) = session.send(Request::Detach, Some(id)).await {
                tracing::debug!(
                    target = "signaling",
                    handle_id = id,
                    error = %err,
                    "detach request failed",
                );
            }
            session.unregister_listener(id);
        }
        tracing::debug!(target = "signaling", handle_id = id, "plugin handle detached");
    }

    /// Resolves once the gateway reports the peer connection is up. The
    /// signal can only be awaited once.
    pub async fn wait_connected(&self) -> Result<(), SignalingError> {
        let rx = self
            .connected_rx
            .lock()
            .take()
            .ok_or_else(|| SignalingError::Protocol("connected signal already taken".into()))?;
        rx.await.map_err(|_| SignalingError::Detached)
    }

    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<HandleEvent>> {
        self.events_rx.lock().take()
    }

    fn session(&self) -> Result<Arc<SessionInner>, SignalingError> {
        self.session
            .upgrade()
            .ok_or_else(|| SignalingError::Transport("session dropped".into()))
    }

    fn attached(&self) -> Result<(Arc<SessionInner>, HandleId), SignalingError> {
        let id = {
            let core = self.core.lock();
            match (core.state, core.id) {
                (HandleState::Attached, Some(id)) => id,
                _ => return Err(SignalingError::Detached),
            }
        };
        Ok((self.session()?, id))
    }
}

impl Drop for PluginHandle {
    fn drop(&mut self) {
        if let Some(task) = self.router.get_mut().take() {
            task.abort();
        }
        let core = self.core.lock();
        if let (HandleState::Attached, Some(id)) = (core.state, core.id) {
            if let Some(session) = self.session.upgrade() {
                session.unregister_listener(id);
            }
        }
    }
}

async fn route_pushes(
    handle_id: HandleId,
    mut pushes: mpsc::UnboundedReceiver<Envelope>,
    parts: RouterParts,
    core: Arc<Mutex<HandleCore>>,
) {
    let RouterParts {
        connected_tx,
        events_tx,
    } = parts;
    let mut connected_tx = Some(connected_tx);

    while let Some(envelope) = pushes.recv().await {
        let event = match envelope.body {
            Inbound::WebrtcUp => {
                match connected_tx.take() {
                    Some(tx) => {
                        tracing::info!(target = "signaling", handle_id, "peer connection up");
                        let _ = tx.send(());
                    }
                    None => {
                        tracing::debug!(
                            target = "signaling",
                            handle_id,
                            "ignoring duplicate webrtcup",
                        );
                    }
                }
                continue;
            }
            Inbound::Event { plugindata, jsep } => {
                if let Some(jsep) = jsep {
                    let _ = events_tx.send(HandleEvent::RemoteJsep(jsep));
                }
                let Some(data) = plugindata.map(|p| p.data).filter(|data| !data.is_null()) else {
                    continue;
                };
                let event = PluginEvent::from_value(data);
                if let PluginEvent::Unrecognized(raw) = &event {
                    tracing::warn!(
                        target = "signaling",
                        handle_id,
                        event = %raw,
                        "unrecognized plugin event",
                    );
                }
                HandleEvent::Plugin(event)
            }
            Inbound::Media { kind, receiving } => HandleEvent::Media { kind, receiving },
            Inbound::SlowLink { uplink } => {
                tracing::warn!(
                    target = "signaling",
                    handle_id,
                    uplink,
                    "gateway reports slow link",
                );
                HandleEvent::SlowLink { uplink }
            }
            Inbound::Hangup { reason } => {
                tracing::info!(
                    target = "signaling",
                    handle_id,
                    reason = ?reason,
                    "peer connection hung up",
                );
                HandleEvent::Hangup { reason }
            }
            Inbound::Detached => {
                core.lock().state = HandleState::Detached;
                let _ = events_tx.send(HandleEvent::Detached);
                break;
            }
            Inbound::Unrecognized { kind } => {
                tracing::warn!(
                    target = "signaling",
                    handle_id,
                    kind = %kind,
                    "unrecognized handle push",
                );
                HandleEvent::Unrecognized { kind }
            }
            other => {
                tracing::debug!(
                    target = "signaling",
                    handle_id,
                    body = ?other,
                    "ignoring uncorrelated reply",
                );
                continue;
            }
        };
        let _ = events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::session::SessionConfig;
    use crate::signaling::transport::{GatewayEnd, memory_link};
    use serde_json::{Value, json};
    use std::time::Duration;
    use test_timeout::tokio_timeout_test;

    async fn next_frame(end: &mut GatewayEnd) -> Value {
        let text = end.incoming.recv().await.expect("client frame");
        serde_json::from_str(&text).expect("json frame")
    }

    fn push(end: &GatewayEnd, value: Value) {
        end.outgoing.send(value.to_string()).expect("client alive");
    }

    async fn attached_handle() -> (Session, Arc<PluginHandle>, GatewayEnd) {
        let (link, mut end) = memory_link();
        let session = Session::start(
            link,
            SessionConfig {
                request_timeout: Duration::from_secs(2),
                keepalive_interval: Duration::from_secs(60),
            },
        );
        let create = session.create();
        let gateway = async {
            let frame = next_frame(&mut end).await;
            push(
                &end,
                json!({"janus": "success", "transaction": frame["transaction"], "data": {"id": 1}}),
            );
        };
        let (created, ()) = tokio::join!(create, gateway);
        created.unwrap();

        let handle = Arc::new(PluginHandle::new(&session));
        let attach = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.attach("janus.plugin.sfu").await })
        };
        let frame = next_frame(&mut end).await;
        assert_eq!(frame["janus"], "attach");
        assert_eq!(frame["plugin"], "janus.plugin.sfu");
        push(
            &end,
            json!({"janus": "success", "transaction": frame["transaction"], "data": {"id": 9}}),
        );
        assert_eq!(attach.await.unwrap().unwrap(), 9);
        (session, handle, end)
    }

    #[tokio_timeout_test]
    async fn connected_fires_once_despite_duplicate_webrtcup() {
        let (_session, handle, end) = attached_handle().await;
        assert_eq!(handle.state(), HandleState::Attached);
        push(&end, json!({"janus": "webrtcup", "session_id": 1, "sender": 9}));
        push(&end, json!({"janus": "webrtcup", "session_id": 1, "sender": 9}));
        handle.wait_connected().await.unwrap();
        assert!(matches!(
            handle.wait_connected().await,
            Err(SignalingError::Protocol(_))
        ));
    }

    #[tokio_timeout_test]
    async fn unattached_handle_refuses_messages() {
        let (link, _end) = memory_link();
        let session = Session::start(link, SessionConfig::default());
        let handle = PluginHandle::new(&session);
        assert_eq!(
            handle.send_message(json!({})).await.unwrap_err(),
            SignalingError::Detached
        );
    }

    #[tokio_timeout_test]
    async fn jsep_message_returns_answer() {
        let (_session, handle, mut end) = attached_handle().await;
        let exchange = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.send_jsep(Jsep::offer("v=0 offer")).await })
        };
        let frame = next_frame(&mut end).await;
        assert_eq!(frame["janus"], "message");
        assert_eq!(frame["handle_id"], 9);
        assert_eq!(frame["body"], json!({}));
        assert_eq!(frame["jsep"]["type"], "offer");
        push(&end, json!({"janus": "ack", "transaction": frame["transaction"]}));
        push(
            &end,
            json!({
                "janus": "event",
                "transaction": frame["transaction"],
                "sender": 9,
                "plugindata": {"plugin": "janus.plugin.sfu", "data": {"success": true}},
                "jsep": {"type": "answer", "sdp": "v=0 answer"}
            }),
        );
        assert_eq!(
            exchange.await.unwrap().unwrap(),
            Some(Jsep::answer("v=0 answer"))
        );
    }

    #[tokio_timeout_test]
    async fn trickle_terminator_goes_out_as_completed() {
        let (_session, handle, mut end) = attached_handle().await;
        let trickle = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.send_trickle(None).await })
        };
        let frame = next_frame(&mut end).await;
        assert_eq!(frame["janus"], "trickle");
        assert_eq!(frame["candidate"], json!({"completed": true}));
        push(&end, json!({"janus": "ack", "transaction": frame["transaction"]}));
        trickle.await.unwrap();
    }

    #[tokio_timeout_test]
    async fn plugin_events_and_detached_push_are_forwarded() {
        let (_session, handle, end) = attached_handle().await;
        let mut events = handle.take_events().unwrap();
        push(
            &end,
            json!({
                "janus": "event",
                "sender": 9,
                "plugindata": {
                    "plugin": "janus.plugin.sfu",
                    "data": {"event": "join", "room_id": "r", "user_id": "7"}
                }
            }),
        );
        push(&end, json!({"janus": "detached", "sender": 9}));

        assert_eq!(
            events.recv().await.unwrap(),
            HandleEvent::Plugin(PluginEvent::Join {
                room_id: "r".into(),
                user_id: "7".into()
            })
        );
        assert_eq!(events.recv().await.unwrap(), HandleEvent::Detached);
        assert_eq!(handle.state(), HandleState::Detached);
    }

    #[tokio_timeout_test]
    async fn detach_is_sent_once() {
        let (_session, handle, mut end) = attached_handle().await;
        let first = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.detach().await })
        };
        let frame = next_frame(&mut end).await;
        assert_eq!(frame["janus"], "detach");
        push(&end, json!({"janus": "success", "transaction": frame["transaction"]}));
        first.await.unwrap();

        handle.detach().await;
        assert_eq!(handle.state(), HandleState::Detached);
        assert!(end.incoming.try_recv().is_err());
    }
}
