// Relay session states and readiness bookkeeping

use std::fmt;

/// Lifecycle of a relay allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayState {
    Uninitialized,
    /// Looking up the relay server address
    Resolving,
    /// Control connection open, allocate request sent
    Sending,
    /// Server challenged the request; retrying with credentials
    Configuring,
    /// Allocation granted; installing queued permissions
    Creating,
    Ready,
    /// Allocation refresh in flight; the allocation is still usable
    Refreshing,
    Disconnected,
    Deallocating,
    Destroying,
}

impl RelayState {
    /// The allocation can carry data
    pub fn is_ready(self) -> bool {
        matches!(self, RelayState::Ready | RelayState::Refreshing)
    }

    /// Still working towards the first `Ready`
    pub fn is_pre_ready(self) -> bool {
        matches!(
            self,
            RelayState::Uninitialized
                | RelayState::Resolving
                | RelayState::Sending
                | RelayState::Configuring
                | RelayState::Creating
        )
    }

    pub fn is_teardown(self) -> bool {
        matches!(self, RelayState::Deallocating | RelayState::Destroying)
    }

    /// No further transitions except teardown
    pub fn is_finished(self) -> bool {
        self == RelayState::Disconnected || self.is_teardown()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelayState::Uninitialized => "uninitialized",
            RelayState::Resolving => "resolving",
            RelayState::Sending => "sending",
            RelayState::Configuring => "configuring",
            RelayState::Creating => "creating",
            RelayState::Ready => "ready",
            RelayState::Refreshing => "refreshing",
            RelayState::Disconnected => "disconnected",
            RelayState::Deallocating => "deallocating",
            RelayState::Destroying => "destroying",
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides when the readiness callback fires.
///
/// At most one outcome is ever reported: `true` on the first entry into
/// `Ready`, or `false` when the session drops to `Disconnected` before it
/// was ever ready. Teardown and later disconnects report nothing.
#[derive(Debug, Default)]
pub(crate) struct ReadinessTracker {
    reported: bool,
}

impl ReadinessTracker {
    pub fn on_transition(&mut self, old: RelayState, new: RelayState) -> Option<bool> {
        if self.reported {
            return None;
        }
        let outcome = match new {
            RelayState::Ready => Some(true),
            RelayState::Disconnected if old.is_pre_ready() => Some(false),
            _ => None,
        };
        if outcome.is_some() {
            self.reported = true;
        }
        outcome
    }

    /// Suppress any future report
    pub fn close(&mut self) {
        self.reported = true;
    }

    pub fn reported(&self) -> bool {
        self.reported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [RelayState; 10] = [
        RelayState::Uninitialized,
        RelayState::Resolving,
        RelayState::Sending,
        RelayState::Configuring,
        RelayState::Creating,
        RelayState::Ready,
        RelayState::Refreshing,
        RelayState::Disconnected,
        RelayState::Deallocating,
        RelayState::Destroying,
    ];

    #[test]
    fn test_ready_reported_once() {
        let mut tracker = ReadinessTracker::default();
        assert_eq!(tracker.on_transition(RelayState::Creating, RelayState::Ready), Some(true));
        assert_eq!(tracker.on_transition(RelayState::Ready, RelayState::Refreshing), None);
        assert_eq!(tracker.on_transition(RelayState::Refreshing, RelayState::Ready), None);
        assert_eq!(tracker.on_transition(RelayState::Ready, RelayState::Disconnected), None);
    }

    #[test]
    fn test_failure_before_ready() {
        let mut tracker = ReadinessTracker::default();
        assert_eq!(tracker.on_transition(RelayState::Resolving, RelayState::Sending), None);
        assert_eq!(
            tracker.on_transition(RelayState::Sending, RelayState::Disconnected),
            Some(false)
        );
        assert!(tracker.reported());
    }

    #[test]
    fn test_teardown_is_silent() {
        let mut tracker = ReadinessTracker::default();
        assert_eq!(
            tracker.on_transition(RelayState::Sending, RelayState::Deallocating),
            None
        );
        assert_eq!(
            tracker.on_transition(RelayState::Deallocating, RelayState::Destroying),
            None
        );
    }

    #[test]
    fn test_closed_tracker_never_reports() {
        let mut tracker = ReadinessTracker::default();
        tracker.close();
        assert_eq!(tracker.on_transition(RelayState::Creating, RelayState::Ready), None);
    }

    proptest! {
        #[test]
        fn prop_at_most_one_outcome(path in proptest::collection::vec(0usize..ALL.len(), 0..40)) {
            let mut tracker = ReadinessTracker::default();
            let mut current = RelayState::Uninitialized;
            let mut outcomes = 0;
            for index in path {
                let next = ALL[index];
                if tracker.on_transition(current, next).is_some() {
                    outcomes += 1;
                }
                current = next;
            }
            prop_assert!(outcomes <= 1);
        }
    }
}
