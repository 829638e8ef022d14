//! Subscription lifecycle.

use serde::{Deserialize, Serialize};

/// State of a single subscription.
///
/// `Unopened -> Open -> {Completed | Errored | Disposed}`; disposal is also
/// allowed before opening. Terminal states never change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Not yet attached to a source.
    #[default]
    Unopened,
    /// Receiving values.
    Open,
    /// Source completed.
    Completed,
    /// Source emitted an error.
    Errored,
    /// Torn down by a disposer or by client teardown.
    Disposed,
}

impl SubscriptionState {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Disposed)
    }

    /// Whether values may still be delivered.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    /// Move to `next` if the transition is allowed.
    ///
    /// Returns `false` (and leaves the state untouched) otherwise.
    pub fn transition(&mut self, next: Self) -> bool {
        let allowed = matches!(
            (*self, next),
            (Self::Unopened, Self::Open | Self::Disposed)
                | (Self::Open, Self::Completed | Self::Errored | Self::Disposed)
        );
        if allowed {
            *self = next;
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_then_complete() {
        let mut state = SubscriptionState::default();
        assert!(state.transition(SubscriptionState::Open));
        assert!(state.is_open());
        assert!(state.transition(SubscriptionState::Completed));
        assert!(state.is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [
            SubscriptionState::Completed,
            SubscriptionState::Errored,
            SubscriptionState::Disposed,
        ] {
            let mut state = terminal;
            assert!(!state.transition(SubscriptionState::Open));
            assert!(!state.transition(SubscriptionState::Disposed));
            assert!(!state.transition(SubscriptionState::Errored));
            assert_eq!(state, terminal);
        }
    }

    #[test]
    fn dispose_before_open() {
        let mut state = SubscriptionState::Unopened;
        assert!(!state.transition(SubscriptionState::Completed));
        assert!(state.transition(SubscriptionState::Disposed));
    }
}
