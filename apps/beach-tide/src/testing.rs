//! In-memory doubles for the gateway, peer connections and data channels,
//! used by the unit and integration tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::{ChannelError, ChannelSpec, OutboundChannel};
use crate::negotiation::{PeerError, PeerEvent, PeerFactory, PeerLink};
use crate::signaling::transport::{GatewayEnd, memory_link};
use crate::signaling::{IceCandidate, Jsep, SFU_PLUGIN, SignalLink};

static SEND_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FakeOpenState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SentFrame {
    /// Global send order across every fake channel.
    pub seq: u64,
    pub at: Instant,
    pub text: String,
}

impl SentFrame {
    pub fn payload(&self) -> Value {
        serde_json::from_str(&self.text).unwrap_or(Value::Null)
    }
}

pub struct FakeChannel {
    label: String,
    state_tx: watch::Sender<FakeOpenState>,
    sent: Mutex<Vec<SentFrame>>,
    attempts: AtomicU64,
    fail_on: Mutex<Option<u64>>,
}

impl FakeChannel {
    fn with_state(label: &str, state: FakeOpenState) -> Arc<Self> {
        let (state_tx, _) = watch::channel(state);
        Arc::new(Self {
            label: label.to_string(),
            state_tx,
            sent: Mutex::new(Vec::new()),
            attempts: AtomicU64::new(0),
            fail_on: Mutex::new(None),
        })
    }

    pub fn open(label: &str) -> Arc<Self> {
        Self::with_state(label, FakeOpenState::Open)
    }

    pub fn connecting(label: &str) -> Arc<Self> {
        Self::with_state(label, FakeOpenState::Connecting)
    }

    pub fn set_open(&self) {
        self.state_tx.send_replace(FakeOpenState::Open);
    }

    pub fn set_closed(&self) {
        self.state_tx.send_replace(FakeOpenState::Closed);
    }

    /// Fails the send attempt with this zero-based index.
    pub fn fail_on(&self, attempt: u64) {
        *self.fail_on.lock() = Some(attempt);
    }

    /// Successfully sent frames, in order.
    pub fn sent(&self) -> Vec<SentFrame> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl OutboundChannel for FakeChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        *self.state_tx.borrow() == FakeOpenState::Open
    }

    async fn wait_open(&self) -> Result<(), ChannelError> {
        let mut state_rx = self.state_tx.subscribe();
        let state = state_rx
            .wait_for(|state| *state != FakeOpenState::Connecting)
            .await
            .map(|state| *state)
            .unwrap_or(FakeOpenState::Closed);
        match state {
            FakeOpenState::Open => Ok(()),
            _ => Err(ChannelError::Closed(self.label.clone())),
        }
    }

    async fn send_text(&self, text: String) -> Result<(), ChannelError> {
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel);
        if !self.is_open() {
            return Err(ChannelError::Closed(self.label.clone()));
        }
        if *self.fail_on.lock() == Some(attempt) {
            return Err(ChannelError::Send("injected failure".into()));
        }
        self.sent.lock().push(SentFrame {
            seq: SEND_SEQ.fetch_add(1, Ordering::AcqRel),
            at: Instant::now(),
            text,
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    CreateOffer,
    ApplyLocal,
    ApplyRemote,
    OpenChannel,
}

/// Scriptable [`PeerLink`]. Every call is logged; the first local apply
/// emits two host candidates followed by the end-of-candidates marker.
pub struct FakePeer {
    calls: Mutex<Vec<String>>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    auto_open: AtomicBool,
    failure: Mutex<Option<FakeFailure>>,
    offer_delay: Mutex<Duration>,
    offers: AtomicU64,
    gathered: AtomicBool,
    closed: AtomicBool,
}

impl FakePeer {
    pub fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            channels: Mutex::new(Vec::new()),
            auto_open: AtomicBool::new(true),
            failure: Mutex::new(None),
            offer_delay: Mutex::new(Duration::ZERO),
            offers: AtomicU64::new(0),
            gathered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn host_candidates() -> Vec<IceCandidate> {
        (0..2)
            .map(|n| IceCandidate {
                candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            })
            .collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().clone()
    }

    pub fn channel(&self, label: &str) -> Option<Arc<FakeChannel>> {
        self.channels
            .lock()
            .iter()
            .find(|channel| channel.label == label)
            .cloned()
    }

    pub fn set_auto_open(&self, auto_open: bool) {
        self.auto_open.store(auto_open, Ordering::Release);
    }

    pub fn fail_at(&self, failure: FakeFailure) {
        *self.failure.lock() = Some(failure);
    }

    pub fn set_offer_delay(&self, delay: Duration) {
        *self.offer_delay.lock() = delay;
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn trigger_renegotiation(&self) {
        self.emit(PeerEvent::NegotiationNeeded);
    }

    pub fn offers(&self) -> u64 {
        self.offers.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn check(&self, step: FakeFailure) -> Result<(), PeerError> {
        if *self.failure.lock() == Some(step) {
            return Err(PeerError::new(format!("injected {step:?} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLink for FakePeer {
    async fn create_offer(&self) -> Result<Jsep, PeerError> {
        self.record("create_offer".into());
        let delay = *self.offer_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check(FakeFailure::CreateOffer)?;
        let n = self.offers.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(Jsep::offer(format!("v=0 fake-offer {n}")))
    }

    async fn apply_local(&self, offer: &Jsep) -> Result<(), PeerError> {
        self.record(format!("apply_local:{}", offer.sdp));
        self.check(FakeFailure::ApplyLocal)?;
        if !self.gathered.swap(true, Ordering::AcqRel) {
            for candidate in Self::host_candidates() {
                self.emit(PeerEvent::LocalCandidate(Some(candidate)));
            }
            self.emit(PeerEvent::LocalCandidate(None));
        }
        Ok(())
    }

    async fn apply_remote(&self, answer: &Jsep) -> Result<(), PeerError> {
        self.record(format!("apply_remote:{}", answer.sdp));
        self.check(FakeFailure::ApplyRemote)
    }

    async fn open_channel(
        &self,
        spec: &ChannelSpec,
    ) -> Result<Arc<dyn OutboundChannel>, PeerError> {
        self.record(format!("open_channel:{}", spec.label));
        self.check(FakeFailure::OpenChannel)?;
        let channel = if self.auto_open.load(Ordering::Acquire) {
            FakeChannel::open(&spec.label)
        } else {
            FakeChannel::connecting(&spec.label)
        };
        self.channels.lock().push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn receive_media(&self) -> Result<(), PeerError> {
        self.record("receive_media".into());
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) {
        self.record("close".into());
        self.closed.store(true, Ordering::Release);
        for channel in self.channels.lock().iter() {
            channel.set_closed();
        }
    }
}

/// Hands out [`FakePeer`]s and keeps them for inspection.
#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    next_failure: Mutex<Option<FakeFailure>>,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().clone()
    }

    pub fn fail_next(&self, failure: FakeFailure) {
        *self.next_failure.lock() = Some(failure);
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(&self) -> Result<Arc<dyn PeerLink>, PeerError> {
        let peer = FakePeer::new();
        if let Some(failure) = self.next_failure.lock().take() {
            peer.fail_at(failure);
        }
        self.peers.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayScript {
    pub session_id: u64,
    pub first_handle_id: u64,
    /// Push `webrtcup` after the first answer on each handle.
    pub webrtcup: bool,
    pub duplicate_webrtcup: bool,
    pub webrtcup_delay: Duration,
    pub answer_delay: Duration,
    pub reject_attach: bool,
    pub reject_join: bool,
    /// Answer every trickle with an error.
    pub reject_trickle: bool,
    /// Users reported in the join response.
    pub room_users: Vec<String>,
}

impl Default for GatewayScript {
    fn default() -> Self {
        Self {
            session_id: 1001,
            first_handle_id: 2001,
            webrtcup: true,
            duplicate_webrtcup: false,
            webrtcup_delay: Duration::ZERO,
            answer_delay: Duration::ZERO,
            reject_attach: false,
            reject_join: false,
            reject_trickle: false,
            room_users: Vec::new(),
        }
    }
}

/// In-memory gateway answering requests according to a [`GatewayScript`].
pub struct ScriptedGateway {
    shared: Arc<GatewayShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct GatewayShared {
    script: GatewayScript,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    requests: Mutex<Vec<Value>>,
    notify: Notify,
    next_handle: AtomicU64,
    answers: AtomicU64,
    connected: Mutex<HashSet<u64>>,
    delayed: Mutex<Vec<JoinHandle<()>>>,
}

impl ScriptedGateway {
    pub fn spawn(script: GatewayScript) -> (SignalLink, Self) {
        let (link, end) = memory_link();
        let GatewayEnd { incoming, outgoing } = end;
        let shared = Arc::new(GatewayShared {
            next_handle: AtomicU64::new(script.first_handle_id),
            script,
            outgoing: Mutex::new(Some(outgoing)),
            requests: Mutex::new(Vec::new()),
            notify: Notify::new(),
            answers: AtomicU64::new(0),
            connected: Mutex::new(HashSet::new()),
            delayed: Mutex::new(Vec::new()),
        });
        let task = tokio::spawn(serve(Arc::clone(&shared), incoming));
        (
            link,
            Self {
                shared,
                task: Mutex::new(Some(task)),
            },
        )
    }

    pub fn requests(&self) -> Vec<Value> {
        self.shared.requests.lock().clone()
    }

    pub fn requests_of(&self, kind: &str) -> Vec<Value> {
        self.shared
            .requests
            .lock()
            .iter()
            .filter(|request| request["janus"] == kind)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.requests_of(kind).len()
    }

    /// Plugin messages whose body `kind` matches.
    pub fn plugin_messages(&self, body_kind: &str) -> Vec<Value> {
        self.requests_of("message")
            .into_iter()
            .filter(|request| request["body"]["kind"] == body_kind)
            .collect()
    }

    /// Resolves once at least `count` requests of `kind` have arrived.
    pub async fn wait_for(&self, kind: &str, count: usize) {
        loop {
            let notified = self.shared.notify.notified();
            if self.count(kind) >= count {
                return;
            }
            notified.await;
        }
    }

    /// Sends a raw envelope to the client.
    pub fn push(&self, value: Value) {
        self.shared.send(value);
    }

    pub fn session_id(&self) -> u64 {
        self.shared.script.session_id
    }

    /// Drops both directions of the link, as a lost websocket would.
    pub fn disconnect(&self) {
        self.shared.outgoing.lock().take();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        for task in self.shared.delayed.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for ScriptedGateway {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn serve(shared: Arc<GatewayShared>, mut incoming: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = incoming.recv().await {
        let Ok(request) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        shared.requests.lock().push(request.clone());
        shared.notify.notify_waiters();
        shared.respond(&request);
    }
}

impl GatewayShared {
    fn send(&self, value: Value) {
        if let Some(outgoing) = self.outgoing.lock().as_ref() {
            let _ = outgoing.send(value.to_string());
        }
    }

    fn respond(self: &Arc<Self>, request: &Value) {
        let transaction = request["transaction"].clone();
        let session_id = self.script.session_id;
        match request["janus"].as_str().unwrap_or_default() {
            "create" => self.send(json!({
                "janus": "success",
                "transaction": transaction,
                "data": {"id": session_id}
            })),
            "attach" if self.script.reject_attach => self.send(json!({
                "janus": "error",
                "session_id": session_id,
                "transaction": transaction,
                "error": {"code": 460, "reason": "No such plugin"}
            })),
            "attach" => {
                let handle_id = self.next_handle.fetch_add(1, Ordering::AcqRel);
                self.send(json!({
                    "janus": "success",
                    "session_id": session_id,
                    "transaction": transaction,
                    "data": {"id": handle_id}
                }));
            }
            "message" => self.respond_message(request, transaction),
            "trickle" if self.script.reject_trickle => self.send(json!({
                "janus": "error",
                "session_id": session_id,
                "transaction": transaction,
                "error": {"code": 467, "reason": "Trickle refused"}
            })),
            "trickle" | "keepalive" => self.send(json!({
                "janus": "ack",
                "session_id": session_id,
                "transaction": transaction
            })),
            "detach" | "destroy" => self.send(json!({
                "janus": "success",
                "session_id": session_id,
                "transaction": transaction
            })),
            other => self.send(json!({
                "janus": "error",
                "transaction": transaction,
                "error": {"code": 453, "reason": format!("unknown request {other}")}
            })),
        }
    }

    fn respond_message(self: &Arc<Self>, request: &Value, transaction: Value) {
        let session_id = self.script.session_id;
        let handle_id = request["handle_id"].as_u64().unwrap_or_default();
        self.send(json!({
            "janus": "ack",
            "session_id": session_id,
            "transaction": transaction
        }));

        let mut steps = Vec::new();
        if request.get("jsep").is_some() {
            let n = self.answers.fetch_add(1, Ordering::AcqRel) + 1;
            steps.push((
                self.script.answer_delay,
                json!({
                    "janus": "event",
                    "session_id": session_id,
                    "sender": handle_id,
                    "transaction": transaction,
                    "plugindata": {"plugin": SFU_PLUGIN, "data": {"success": true}},
                    "jsep": {"type": "answer", "sdp": format!("v=0 fake-answer {n}")}
                }),
            ));
            if self.script.webrtcup && self.connected.lock().insert(handle_id) {
                let up = json!({
                    "janus": "webrtcup",
                    "session_id": session_id,
                    "sender": handle_id
                });
                steps.push((self.script.webrtcup_delay, up.clone()));
                if self.script.duplicate_webrtcup {
                    steps.push((Duration::ZERO, up));
                }
            }
        } else {
            let body = &request["body"];
            let data = match body["kind"].as_str() {
                Some("join") if self.script.reject_join => json!({
                    "success": false,
                    "error": {"code": 4, "msg": "join refused"}
                }),
                Some("join") => {
                    let mut users = Map::new();
                    users.insert(
                        body["room_id"].as_str().unwrap_or_default().to_string(),
                        json!(self.script.room_users),
                    );
                    json!({"success": true, "response": {"users": users}})
                }
                _ => json!({"success": true}),
            };
            steps.push((
                Duration::ZERO,
                json!({
                    "janus": "event",
                    "session_id": session_id,
                    "sender": handle_id,
                    "transaction": transaction,
                    "plugindata": {"plugin": SFU_PLUGIN, "data": data}
                }),
            ));
        }
        self.play(steps);
    }

    fn play(self: &Arc<Self>, steps: Vec<(Duration, Value)>) {
        if steps.iter().all(|(delay, _)| delay.is_zero()) {
            for (_, frame) in steps {
                self.send(frame);
            }
            return;
        }
        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            for (delay, frame) in steps {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                shared.send(frame);
            }
        });
        self.delayed.lock().push(task);
    }
}
