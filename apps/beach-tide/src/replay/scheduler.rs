use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::record::RecordedEvent;
use super::rewrite::localize;
use crate::channel::OutboundChannel;

pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub tick: Duration,
    pub looping: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            looping: false,
        }
    }
}

/// The two outbound channels a replay writes to.
#[derive(Clone)]
pub struct ReplayChannels {
    pub reliable: Arc<dyn OutboundChannel>,
    pub unreliable: Arc<dyn OutboundChannel>,
}

impl ReplayChannels {
    fn for_event(&self, reliable: bool) -> &Arc<dyn OutboundChannel> {
        if reliable {
            &self.reliable
        } else {
            &self.unreliable
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplayError {
    #[error("sending event {index} on {channel} failed: {reason}")]
    Send {
        index: usize,
        channel: String,
        reason: String,
    },
    #[error("channel closed before replay started: {0}")]
    ChannelClosed(String),
    #[error("failed to encode event {index}: {reason}")]
    Encode { index: usize, reason: String },
    #[error("replay cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub sent: u64,
    /// Completed passes when looping.
    pub loops: u64,
}

struct PreparedEvent {
    offset: Duration,
    reliable: bool,
    text: String,
}

/// Cursor into the timeline, relative to `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayState {
    pub start: Instant,
    pub cursor: usize,
}

impl ReplayState {
    pub fn new(start: Instant) -> Self {
        Self { start, cursor: 0 }
    }

    /// Indices of every event due at `now`, starting at the cursor and
    /// stopping at the first event still in the future.
    pub fn due(&self, offsets: impl IntoIterator<Item = Duration>, now: Instant) -> Range<usize> {
        let elapsed = now.saturating_duration_since(self.start);
        let pending = offsets
            .into_iter()
            .skip(self.cursor)
            .take_while(|offset| *offset <= elapsed)
            .count();
        self.cursor..self.cursor + pending
    }

    pub fn restart(&mut self, now: Instant) {
        self.start = now;
        self.cursor = 0;
    }
}

fn prepare(events: &[RecordedEvent], local_id: &str) -> Result<Vec<PreparedEvent>, ReplayError> {
    localize(events, local_id)
        .into_iter()
        .enumerate()
        .map(|(index, event)| {
            let text = serde_json::to_string(&event.payload).map_err(|err| ReplayError::Encode {
                index,
                reason: err.to_string(),
            })?;
            Ok(PreparedEvent {
                offset: event.offset,
                reliable: event.reliable,
                text,
            })
        })
        .collect()
}

/// Replays `events` once both channels are open. Every due event goes out on
/// each tick so a late tick only delays events, never drops them. The first
/// send failure ends the replay.
pub async fn run(
    events: &[RecordedEvent],
    local_id: &str,
    channels: &ReplayChannels,
    options: &ReplayOptions,
) -> Result<ReplaySummary, ReplayError> {
    let prepared = prepare(events, local_id)?;

    tokio::try_join!(channels.reliable.wait_open(), channels.unreliable.wait_open())
        .map_err(|err| ReplayError::ChannelClosed(err.to_string()))?;

    let mut summary = ReplaySummary::default();
    if prepared.is_empty() {
        tracing::info!(target = "replay", "recording is empty; nothing to replay");
        return Ok(summary);
    }
    tracing::info!(
        target = "replay",
        events = prepared.len(),
        looping = options.looping,
        tick_ms = options.tick.as_millis() as u64,
        "replay starting"
    );

    let mut ticker = tokio::time::interval(options.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut state = ReplayState::new(Instant::now());

    loop {
        ticker.tick().await;
        // At most one re-check per tick, after a restart.
        let mut rechecked = false;
        loop {
            let due = state.due(prepared.iter().map(|event| event.offset), Instant::now());
            dispatch(&prepared, due.clone(), channels, &mut summary).await?;
            state.cursor = due.end;

            if state.cursor < prepared.len() {
                break;
            }
            if !options.looping {
                tracing::info!(target = "replay", sent = summary.sent, "replay finished");
                return Ok(summary);
            }
            summary.loops += 1;
            tracing::debug!(target = "replay", loops = summary.loops, "replay looping");
            state.restart(Instant::now());
            if rechecked {
                break;
            }
            rechecked = true;
        }
    }
}

async fn dispatch(
    prepared: &[PreparedEvent],
    due: Range<usize>,
    channels: &ReplayChannels,
    summary: &mut ReplaySummary,
) -> Result<(), ReplayError> {
    for index in due {
        let event = &prepared[index];
        let channel = channels.for_event(event.reliable);
        if let Err(err) = channel.send_text(event.text.clone()).await {
            tracing::warn!(
                target = "replay",
                index,
                channel = channel.label(),
                error = %err,
                "replay send failed; stopping"
            );
            return Err(ReplayError::Send {
                index,
                channel: channel.label().to_string(),
                reason: err.to_string(),
            });
        }
        summary.sent += 1;
    }
    Ok(())
}

/// A replay running on its own task. Dropping the handle cancels it.
pub struct ReplayHandle {
    task: JoinHandle<()>,
    outcome: watch::Receiver<Option<Result<ReplaySummary, ReplayError>>>,
}

impl ReplayHandle {
    pub fn spawn(
        events: Vec<RecordedEvent>,
        local_id: String,
        channels: ReplayChannels,
        options: ReplayOptions,
    ) -> Self {
        let (outcome_tx, outcome) = watch::channel(None);
        let task = tokio::spawn(async move {
            let result = run(&events, &local_id, &channels, &options).await;
            outcome_tx.send_replace(Some(result));
        });
        Self { task, outcome }
    }

    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Becomes `Some` once the replay ends on its own. Stays `None` when
    /// cancelled.
    pub fn subscribe_outcome(&self) -> watch::Receiver<Option<Result<ReplaySummary, ReplayError>>> {
        self.outcome.clone()
    }

    /// Waits for the replay to end. A cancelled replay reports
    /// [`ReplayError::Cancelled`].
    pub async fn finished(&self) -> Result<ReplaySummary, ReplayError> {
        let mut outcome = self.outcome.clone();
        match outcome.wait_for(Option::is_some).await {
            Ok(result) => result.clone().unwrap_or(Err(ReplayError::Cancelled)),
            Err(_) => Err(ReplayError::Cancelled),
        }
    }
}

impl Drop for ReplayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeChannel;
    use serde_json::json;
    use test_timeout::tokio_timeout_test;

    fn channels(reliable: &Arc<FakeChannel>, unreliable: &Arc<FakeChannel>) -> ReplayChannels {
        ReplayChannels {
            reliable: reliable.clone(),
            unreliable: unreliable.clone(),
        }
    }

    fn timeline(offsets: &[u64]) -> Vec<RecordedEvent> {
        offsets
            .iter()
            .enumerate()
            .map(|(n, offset)| RecordedEvent::new(*offset, n % 2 == 0, json!({ "n": n })))
            .collect()
    }

    #[test]
    fn due_range_catches_up_on_late_ticks() {
        let start = Instant::now();
        let offsets = [0, 50, 120].map(Duration::from_millis);
        let state = ReplayState::new(start);
        assert_eq!(state.due(offsets, start), 0..1);
        assert_eq!(state.due(offsets, start + Duration::from_millis(200)), 0..3);
        let state = ReplayState { start, cursor: 1 };
        assert_eq!(state.due(offsets, start + Duration::from_millis(60)), 1..2);
        assert_eq!(state.due(offsets, start + Duration::from_millis(10)), 1..1);
    }

    #[tokio_timeout_test(paused)]
    async fn dispatches_in_order_on_selected_channels() {
        let reliable = FakeChannel::open("reliable");
        let unreliable = FakeChannel::open("unreliable");
        let events = timeline(&[0, 50, 120]);
        let started = Instant::now();

        let summary = run(
            &events,
            "42",
            &channels(&reliable, &unreliable),
            &ReplayOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(summary, ReplaySummary { sent: 3, loops: 0 });
        let reliable_sent = reliable.sent();
        let unreliable_sent = unreliable.sent();
        assert_eq!(reliable_sent.len(), 2);
        assert_eq!(unreliable_sent.len(), 1);
        assert_eq!(reliable_sent[0].payload()["n"], 0);
        assert_eq!(unreliable_sent[0].payload()["n"], 1);
        assert_eq!(reliable_sent[1].payload()["n"], 2);
        assert_eq!(reliable_sent[0].payload()["clientId"], "42");

        assert!(unreliable_sent[0].at - started >= Duration::from_millis(50));
        assert!(reliable_sent[1].at - started >= Duration::from_millis(120));
        assert!(reliable_sent[1].at - started < Duration::from_millis(140));
    }

    #[tokio_timeout_test(paused)]
    async fn late_tick_sends_everything_due_at_once() {
        let reliable = FakeChannel::open("reliable");
        let unreliable = FakeChannel::open("unreliable");
        let events = timeline(&[0, 50, 120]);
        let options = ReplayOptions {
            tick: Duration::from_millis(200),
            looping: false,
        };

        run(&events, "1", &channels(&reliable, &unreliable), &options)
            .await
            .unwrap();

        let mut all: Vec<_> = reliable.sent().into_iter().chain(unreliable.sent()).collect();
        all.sort_by_key(|frame| frame.seq);
        let order: Vec<_> = all.iter().map(|frame| frame.payload()["n"].clone()).collect();
        assert_eq!(order, vec![json!(0), json!(1), json!(2)]);
        assert_eq!(all[1].at, all[2].at);
    }

    #[tokio_timeout_test(paused)]
    async fn looping_restarts_from_the_first_event() {
        let reliable = FakeChannel::open("reliable");
        let unreliable = FakeChannel::open("unreliable");
        let events = vec![
            RecordedEvent::new(0, true, json!({"n": 0})),
            RecordedEvent::new(30, true, json!({"n": 1})),
        ];
        let handle = ReplayHandle::spawn(
            events,
            "7".into(),
            channels(&reliable, &unreliable),
            ReplayOptions {
                tick: Duration::from_millis(10),
                looping: true,
            },
        );

        tokio::time::sleep(Duration::from_millis(75)).await;
        handle.cancel();
        assert_eq!(handle.finished().await, Err(ReplayError::Cancelled));

        let sent = reliable.sent();
        assert!(sent.len() >= 4, "expected a second pass, got {}", sent.len());
        assert_eq!(sent[2].payload()["n"], 0);
        let second_pass = sent[3].at - sent[2].at;
        assert!(second_pass >= Duration::from_millis(30));
    }

    #[tokio_timeout_test(paused)]
    async fn all_zero_looping_recording_yields_between_ticks() {
        let reliable = FakeChannel::open("reliable");
        let unreliable = FakeChannel::open("unreliable");
        let events = vec![
            RecordedEvent::new(0, true, json!({"n": 0})),
            RecordedEvent::new(0, true, json!({"n": 1})),
        ];
        let handle = ReplayHandle::spawn(
            events,
            "3".into(),
            channels(&reliable, &unreliable),
            ReplayOptions {
                tick: Duration::from_millis(10),
                looping: true,
            },
        );

        tokio::time::sleep(Duration::from_millis(25)).await;
        handle.cancel();
        assert_eq!(handle.finished().await, Err(ReplayError::Cancelled));

        let sent = reliable.sent();
        assert!(!sent.is_empty());
        assert!(sent.len() <= 12, "sent {} frames", sent.len());
        assert_eq!(sent.len() % 4, 0);
        assert_eq!(sent[0].at, sent[3].at);
    }

    #[tokio_timeout_test(paused)]
    async fn send_failure_stops_dispatch() {
        let reliable = FakeChannel::open("reliable");
        let unreliable = FakeChannel::open("unreliable");
        reliable.fail_on(1);
        let events = vec![
            RecordedEvent::new(0, true, json!({"n": 0})),
            RecordedEvent::new(10, true, json!({"n": 1})),
            RecordedEvent::new(20, true, json!({"n": 2})),
        ];

        let err = run(
            &events,
            "1",
            &channels(&reliable, &unreliable),
            &ReplayOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ReplayError::Send { index: 1, .. }), "{err:?}");
        let sent = reliable.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload()["n"], 0);
    }

    #[tokio_timeout_test(paused)]
    async fn waits_for_the_later_channel_to_open() {
        let reliable = FakeChannel::open("reliable");
        let unreliable = FakeChannel::connecting("unreliable");
        let events = timeline(&[0]);
        let handle = ReplayHandle::spawn(
            events,
            "1".into(),
            channels(&reliable, &unreliable),
            ReplayOptions::default(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(reliable.sent().is_empty());
        unreliable.set_open();

        assert_eq!(
            handle.finished().await,
            Ok(ReplaySummary { sent: 1, loops: 0 })
        );
        assert_eq!(reliable.sent().len(), 1);
    }

    #[tokio_timeout_test]
    async fn closed_channel_fails_the_start_gate() {
        let reliable = FakeChannel::open("reliable");
        let unreliable = FakeChannel::connecting("unreliable");
        unreliable.set_closed();
        let err = run(
            &timeline(&[0]),
            "1",
            &channels(&reliable, &unreliable),
            &ReplayOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReplayError::ChannelClosed(_)));
        assert!(reliable.sent().is_empty());
    }
}
