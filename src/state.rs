//! Client state word shared by every task.
//!
//! States are bits in a single word; orthogonal states may hold at the
//! same time, attention states are mutually exclusive. Waits tolerate
//! spurious wakeups: the condition is re-checked on every notification.

use bitflags::bitflags;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClientState: u32 {
        const CONNECTED               = 1 << 0;
        const CONNECTION_DENIED       = 1 << 1;
        const CAPABILITIES_ACCEPTED   = 1 << 2;
        const CAPABILITIES_REJECTED   = 1 << 3;
        const MICROPHONE_OPEN         = 1 << 4;
        const SPEAKER_OPEN            = 1 << 5;
        const OPEN_SPEAKER_RECEIVED   = 1 << 6;
        const CLOSE_SPEAKER_NO_OFFSET = 1 << 7;
        const ATTENTION_IDLE          = 1 << 8;
        const ATTENTION_THINKING      = 1 << 9;
        const ATTENTION_SPEAKING      = 1 << 10;
        const ATTENTION_ALERTING      = 1 << 11;
    }
}

impl ClientState {
    /// Union of the four attention bits; setting one clears the others.
    pub const ATTENTION_MASK: ClientState = ClientState::ATTENTION_IDLE
        .union(ClientState::ATTENTION_THINKING)
        .union(ClientState::ATTENTION_SPEAKING)
        .union(ClientState::ATTENTION_ALERTING);
}

/// Multi-waiter state set. Setting or clearing bits wakes every waiter;
/// each re-evaluates its own condition.
pub struct StateSet {
    bits: Mutex<ClientState>,
    notify: Notify,
}

impl StateSet {
    pub fn new() -> Self {
        StateSet {
            bits: Mutex::new(ClientState::empty()),
            notify: Notify::new(),
        }
    }

    pub fn set(&self, state: ClientState) {
        self.bits.lock().unwrap().insert(state);
        self.notify.notify_waiters();
    }

    pub fn clear(&self, state: ClientState) {
        self.bits.lock().unwrap().remove(state);
        self.notify.notify_waiters();
    }

    /// Switch to one attention state, clearing the other three atomically.
    pub fn set_attention(&self, state: ClientState) {
        debug_assert!(ClientState::ATTENTION_MASK.contains(state));
        {
            let mut bits = self.bits.lock().unwrap();
            bits.remove(ClientState::ATTENTION_MASK);
            bits.insert(state);
        }
        self.notify.notify_waiters();
    }

    /// `true` if every bit of `state` is set.
    pub fn contains(&self, state: ClientState) -> bool {
        self.bits.lock().unwrap().contains(state)
    }

    /// `true` if any bit of `state` is set.
    pub fn intersects(&self, state: ClientState) -> bool {
        self.bits.lock().unwrap().intersects(state)
    }

    pub fn snapshot(&self) -> ClientState {
        *self.bits.lock().unwrap()
    }

    /// Wait until any bit of `mask` is set; returns the bits seen.
    pub async fn wait_any(&self, mask: ClientState) -> ClientState {
        loop {
            // Register for the next notification before checking, so a
            // concurrent set between check and sleep is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let seen = self.snapshot().intersection(mask);
            if !seen.is_empty() {
                return seen;
            }
            notified.await;
        }
    }

    /// Wait until any bit of `mask` is set, up to `timeout`. Returns the
    /// bits seen, empty on timeout.
    pub async fn wait_any_timeout(&self, mask: ClientState, timeout: Duration) -> ClientState {
        match tokio::time::timeout(timeout, self.wait_any(mask)).await {
            Ok(seen) => seen,
            Err(_) => ClientState::empty(),
        }
    }
}

impl Default for StateSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn attention_states_are_exclusive() {
        let set = StateSet::new();
        set.set_attention(ClientState::ATTENTION_THINKING);
        set.set_attention(ClientState::ATTENTION_SPEAKING);

        assert!(set.contains(ClientState::ATTENTION_SPEAKING));
        assert!(!set.intersects(
            ClientState::ATTENTION_IDLE
                | ClientState::ATTENTION_THINKING
                | ClientState::ATTENTION_ALERTING
        ));
    }

    #[test]
    fn attention_does_not_disturb_other_bits() {
        let set = StateSet::new();
        set.set(ClientState::CONNECTED | ClientState::MICROPHONE_OPEN);
        set.set_attention(ClientState::ATTENTION_IDLE);
        assert!(set.contains(ClientState::CONNECTED | ClientState::MICROPHONE_OPEN));
    }

    #[tokio::test]
    async fn wait_any_returns_immediately_when_set() {
        let set = StateSet::new();
        set.set(ClientState::CONNECTED);
        let seen = set
            .wait_any(ClientState::CONNECTED | ClientState::CONNECTION_DENIED)
            .await;
        assert_eq!(seen, ClientState::CONNECTED);
    }

    #[tokio::test]
    async fn wait_any_wakes_on_set() {
        let set = Arc::new(StateSet::new());
        let waiter = {
            let set = set.clone();
            tokio::spawn(async move { set.wait_any(ClientState::SPEAKER_OPEN).await })
        };
        tokio::task::yield_now().await;
        set.set(ClientState::SPEAKER_OPEN);
        assert_eq!(waiter.await.unwrap(), ClientState::SPEAKER_OPEN);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_any_timeout_expires_empty() {
        let set = StateSet::new();
        let seen = set
            .wait_any_timeout(ClientState::CONNECTED, Duration::from_millis(50))
            .await;
        assert!(seen.is_empty());
    }
}
