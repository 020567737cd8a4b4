//! The connection state machine.
//!
//! One tagged enum and one transition function replace the usual pile of
//! `is_connecting` / `should_reconnect` booleans, making impossible
//! combinations (connecting and failed at once) unrepresentable.

use std::time::Duration;

/// Automatic reconnection gives up after this many consecutive attempts.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Backoff grows linearly from this base.
pub const BASE_RETRY_DELAY: Duration = Duration::from_millis(2_000);

/// Backoff never exceeds this ceiling.
pub const MAX_RETRY_DELAY: Duration = Duration::from_millis(10_000);

/// A connect attempt with no open acknowledgement within this window is a
/// failure.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// How often the local user's presence record is refreshed while connected.
pub const PRESENCE_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

/// Where a session currently stands with its relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Collaboration is off for this session (no room id). Terminal until
    /// re-enabled by the caller.
    Disabled,
    /// A connect attempt is in flight. `attempt` starts at 1.
    Connecting {
        /// Which consecutive attempt this is.
        attempt: u32,
    },
    /// The socket is open and the handshake completed.
    Connected,
    /// The last attempt failed; a retry is scheduled.
    Error {
        /// The attempt that just failed.
        attempt: u32,
    },
    /// The attempt cap was reached. No automatic retries; a manual retry
    /// starts the counter over.
    Failed,
    /// Intentional local close. Terminal.
    Disconnected,
}

/// Everything that can move a session between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The handshake completed.
    Opened,
    /// A connect attempt failed or timed out.
    ConnectFailed,
    /// The scheduled backoff elapsed.
    RetryDue,
    /// An established connection was lost to the network.
    Dropped,
    /// The caller asked for a retry (or re-enabled a disabled session).
    ManualRetry,
    /// The caller tore the session down.
    CloseRequested,
}

impl SessionStatus {
    /// The single transition function. Events that make no sense in the
    /// current state leave it unchanged.
    #[must_use]
    pub fn transition(self, event: SessionEvent) -> Self {
        use SessionEvent::*;
        use SessionStatus::*;

        match (self, event) {
            (_, CloseRequested) => Disconnected,
            (Disconnected, _) => Disconnected,

            (Connecting { .. }, Opened) => Connected,
            (Connecting { attempt }, ConnectFailed) => {
                if attempt >= MAX_RECONNECT_ATTEMPTS {
                    Failed
                } else {
                    Error { attempt }
                }
            }
            (Error { attempt }, RetryDue) => Connecting {
                attempt: attempt + 1,
            },
            // A drop after an established connection starts a fresh attempt
            // series.
            (Connected, Dropped) => Connecting { attempt: 1 },
            // Manual retry resets the counter from anywhere non-terminal.
            (Failed | Error { .. } | Disabled | Connecting { .. }, ManualRetry) => {
                Connecting { attempt: 1 }
            }

            (state, _) => state,
        }
    }

    /// True once no further automatic work will happen.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// The coarse label the UI renders. Raw transport errors never reach
    /// the user.
    #[must_use]
    pub fn user_facing(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Connecting { .. } => "syncing",
            Self::Disabled | Self::Error { .. } | Self::Failed | Self::Disconnected => "offline",
        }
    }
}

/// Delay before retry number `attempt + 1`, growing linearly with a cap.
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    base.saturating_mul(attempt).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_success_connects() {
        let status = SessionStatus::Connecting { attempt: 2 };
        assert_eq!(
            status.transition(SessionEvent::Opened),
            SessionStatus::Connected
        );
    }

    #[test]
    fn three_failures_reach_failed_and_stay_there() {
        let mut status = SessionStatus::Connecting { attempt: 1 };

        status = status.transition(SessionEvent::ConnectFailed);
        assert_eq!(status, SessionStatus::Error { attempt: 1 });
        status = status.transition(SessionEvent::RetryDue);
        assert_eq!(status, SessionStatus::Connecting { attempt: 2 });

        status = status.transition(SessionEvent::ConnectFailed);
        status = status.transition(SessionEvent::RetryDue);
        assert_eq!(status, SessionStatus::Connecting { attempt: 3 });

        status = status.transition(SessionEvent::ConnectFailed);
        assert_eq!(status, SessionStatus::Failed);

        // No automatic way out of Failed.
        assert_eq!(status.transition(SessionEvent::RetryDue), status);
        assert_eq!(status.transition(SessionEvent::ConnectFailed), status);
    }

    #[test]
    fn manual_retry_resets_the_attempt_counter() {
        let status = SessionStatus::Failed.transition(SessionEvent::ManualRetry);
        assert_eq!(status, SessionStatus::Connecting { attempt: 1 });
    }

    #[test]
    fn network_drop_restarts_the_attempt_series() {
        let status = SessionStatus::Connected.transition(SessionEvent::Dropped);
        assert_eq!(status, SessionStatus::Connecting { attempt: 1 });
    }

    #[test]
    fn close_wins_from_every_state() {
        for status in [
            SessionStatus::Disabled,
            SessionStatus::Connecting { attempt: 2 },
            SessionStatus::Connected,
            SessionStatus::Error { attempt: 1 },
            SessionStatus::Failed,
        ] {
            assert_eq!(
                status.transition(SessionEvent::CloseRequested),
                SessionStatus::Disconnected
            );
        }
    }

    #[test]
    fn disconnected_is_terminal() {
        let status = SessionStatus::Disconnected;
        assert!(status.is_terminal());
        assert_eq!(status.transition(SessionEvent::ManualRetry), status);
        assert_eq!(status.transition(SessionEvent::Opened), status);
    }

    #[test]
    fn backoff_grows_linearly_and_caps() {
        let base = BASE_RETRY_DELAY;
        let max = MAX_RETRY_DELAY;
        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(5, base, max), Duration::from_millis(10_000));
        assert_eq!(backoff_delay(100, base, max), max);
    }

    #[test]
    fn user_facing_labels_are_coarse() {
        assert_eq!(SessionStatus::Connected.user_facing(), "connected");
        assert_eq!(
            SessionStatus::Connecting { attempt: 1 }.user_facing(),
            "syncing"
        );
        assert_eq!(SessionStatus::Failed.user_facing(), "offline");
        assert_eq!(SessionStatus::Error { attempt: 2 }.user_facing(), "offline");
    }
}
