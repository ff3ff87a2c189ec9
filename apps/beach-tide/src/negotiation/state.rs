use parking_lot::Mutex;

/// Where one offer/answer exchange currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    GatheringOffer,
    AwaitingLocalApply,
    AwaitingRemoteExchange,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Idle,
    InProgress,
    PendingRetry,
}

/// What the caller should do with a renegotiation trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Nothing in flight; the caller runs the exchange.
    Start,
    /// An exchange is running; one follow-up is now scheduled.
    Queued,
    /// A follow-up was already scheduled.
    Coalesced,
}

/// Coalescing queue that keeps at most one exchange in flight and at most
/// one follow-up pending.
#[derive(Debug)]
pub struct NegotiationQueue {
    state: Mutex<QueueState>,
}

impl Default for NegotiationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl NegotiationQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::Idle),
        }
    }

    pub fn request(&self) -> Trigger {
        let mut state = self.state.lock();
        match *state {
            QueueState::Idle => {
                *state = QueueState::InProgress;
                Trigger::Start
            }
            QueueState::InProgress => {
                *state = QueueState::PendingRetry;
                Trigger::Queued
            }
            QueueState::PendingRetry => Trigger::Coalesced,
        }
    }

    /// Called when an exchange finishes. Returns `true` when a follow-up is
    /// pending, in which case the caller keeps ownership and runs it.
    pub fn complete(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            QueueState::PendingRetry => {
                *state = QueueState::InProgress;
                true
            }
            _ => {
                *state = QueueState::Idle;
                false
            }
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = QueueState::Idle;
    }

    pub fn is_idle(&self) -> bool {
        *self.state.lock() == QueueState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triggers_during_flight_collapse_into_one_follow_up() {
        let queue = NegotiationQueue::new();
        assert_eq!(queue.request(), Trigger::Start);
        assert_eq!(queue.request(), Trigger::Queued);
        assert_eq!(queue.request(), Trigger::Coalesced);
        assert!(queue.complete());
        assert!(!queue.complete());
        assert!(queue.is_idle());
    }

    #[test]
    fn trigger_after_completion_starts_fresh() {
        let queue = NegotiationQueue::new();
        assert_eq!(queue.request(), Trigger::Start);
        assert!(!queue.complete());
        assert_eq!(queue.request(), Trigger::Start);
        queue.reset();
        assert!(queue.is_idle());
    }
}
