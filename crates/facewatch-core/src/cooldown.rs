//! Per-identity event cooldown.
//!
//! Keeps one person standing in front of a camera from producing an event
//! on every frame: an identity may emit again only once the cooldown window
//! has elapsed since its last emitted event.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Cooldown state of a single identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownState {
    Unseen,
    Seen(DateTime<Utc>),
}

/// Decides whether a matched identity may emit a new event.
///
/// The check and the update happen under one lock, so two concurrent calls
/// for the same identity cannot both pass. A gate is normally owned by one
/// pipeline; wrap it in an `Arc` to share it between pipelines.
#[derive(Debug, Default)]
pub struct CooldownGate {
    last_emitted: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl CooldownGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and records `now` as the identity's last emission if
    /// the identity is unseen or `now - last >= window`. Otherwise the state
    /// is left untouched.
    ///
    /// A `now` earlier than the recorded time never emits.
    pub fn should_emit(&self, identity: &str, now: DateTime<Utc>, window: Duration) -> bool {
        let mut last_emitted = self
            .last_emitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let allowed = match last_emitted.get(identity) {
            None => true,
            Some(last) => match (now - *last).to_std() {
                Ok(elapsed) => elapsed >= window,
                Err(_) => false,
            },
        };

        if allowed {
            last_emitted.insert(identity.to_string(), now);
        }
        allowed
    }

    pub fn state(&self, identity: &str) -> CooldownState {
        let last_emitted = self
            .last_emitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match last_emitted.get(identity) {
            Some(ts) => CooldownState::Seen(*ts),
            None => CooldownState::Unseen,
        }
    }

    /// Number of identities that have emitted at least once.
    pub fn tracked(&self) -> usize {
        self.last_emitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    const WINDOW: Duration = Duration::from_secs(30);

    #[test]
    fn test_first_sighting_emits() {
        let gate = CooldownGate::new();
        assert_eq!(gate.state("alice"), CooldownState::Unseen);
        assert!(gate.should_emit("alice", at(0), WINDOW));
        assert_eq!(gate.state("alice"), CooldownState::Seen(at(0)));
    }

    #[test]
    fn test_within_window_suppressed_and_state_unchanged() {
        let gate = CooldownGate::new();
        assert!(gate.should_emit("alice", at(0), WINDOW));
        assert!(!gate.should_emit("alice", at(29), WINDOW));
        assert_eq!(gate.state("alice"), CooldownState::Seen(at(0)));
    }

    #[test]
    fn test_window_boundary_emits() {
        let gate = CooldownGate::new();
        assert!(gate.should_emit("alice", at(0), WINDOW));
        assert!(gate.should_emit("alice", at(30), WINDOW));
        assert_eq!(gate.state("alice"), CooldownState::Seen(at(30)));
    }

    #[test]
    fn test_window_measured_from_last_emission() {
        let gate = CooldownGate::new();
        assert!(gate.should_emit("alice", at(0), WINDOW));
        assert!(!gate.should_emit("alice", at(20), WINDOW));
        // 35s after the emission at 0, even though only 15s after the suppressed sighting.
        assert!(gate.should_emit("alice", at(35), WINDOW));
    }

    #[test]
    fn test_identities_are_independent() {
        let gate = CooldownGate::new();
        assert!(gate.should_emit("alice", at(0), WINDOW));
        assert!(gate.should_emit("bob", at(1), WINDOW));
        assert!(!gate.should_emit("alice", at(2), WINDOW));
        assert_eq!(gate.tracked(), 2);
    }

    #[test]
    fn test_clock_going_backwards_does_not_emit() {
        let gate = CooldownGate::new();
        assert!(gate.should_emit("alice", at(100), WINDOW));
        assert!(!gate.should_emit("alice", at(0), WINDOW));
    }

    #[test]
    fn test_zero_window_always_emits() {
        let gate = CooldownGate::new();
        assert!(gate.should_emit("alice", at(0), Duration::ZERO));
        assert!(gate.should_emit("alice", at(0), Duration::ZERO));
    }

    #[test]
    fn test_concurrent_callers_single_emission() {
        let gate = Arc::new(CooldownGate::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || gate.should_emit("alice", at(0), WINDOW))
            })
            .collect();
        let emitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&e| e)
            .count();
        assert_eq!(emitted, 1);
    }

    #[test]
    fn test_property_events_by_delta() {
        for window_secs in [1i64, 5, 30, 120] {
            let window = Duration::from_secs(window_secs as u64);
            for delta in [0i64, 1, window_secs - 1, window_secs, window_secs + 1] {
                let gate = CooldownGate::new();
                let emitted = [gate.should_emit("x", at(0), window), gate.should_emit("x", at(delta), window)]
                    .iter()
                    .filter(|&&e| e)
                    .count();
                let expected = if delta < window_secs { 1 } else { 2 };
                assert_eq!(emitted, expected, "window={window_secs}s delta={delta}s");
            }
        }
    }
}
