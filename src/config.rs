// src/config.rs
use std::time::Duration;

/// Reconnection policy for the realtime channel.
///
/// The delays are deliberately fixed rather than exponential: the channel is
/// only useful while the rider is actively watching a trip, so a long backoff
/// tail would outlive the screen it serves.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Hard ceiling on automatic reconnection attempts before the supervisor
    /// gives up and reports a terminal failure.
    pub max_attempts: u32,
    /// Fixed delay between attempts. Also the minimum spacing enforced when
    /// external triggers (health check, network listener) fire back to back.
    pub retry_delay: Duration,
    /// How long to wait for the transport to confirm a connection before the
    /// attempt counts as failed.
    pub confirm_timeout: Duration,
    /// Grace period after `disconnect` so the old socket can tear down before
    /// a fresh connect is issued.
    pub teardown_grace: Duration,
    /// Interval of the background `is_connected` probe while the device
    /// reports network reachability.
    pub health_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_millis(3000),
            confirm_timeout: Duration::from_millis(5000),
            teardown_grace: Duration::from_millis(300),
            health_interval: Duration::from_secs(30),
        }
    }
}

/// Timing knobs for a trip request session.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// How long a submitted request collects driver offers before it expires.
    /// Matches the server's own expiry window so both sides agree on when a
    /// search is over.
    pub offer_window: Duration,
    /// Cadence of countdown ticks surfaced to the UI.
    pub countdown_tick: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            offer_window: Duration::from_secs(300),
            countdown_tick: Duration::from_secs(1),
        }
    }
}

/// Auth token maintenance.
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    /// Cadence of proactive token refreshes. Shorter than the server's token
    /// lifetime so an expiring token is never handed to a reconnect attempt.
    pub token_refresh_interval: Duration,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            token_refresh_interval: Duration::from_secs(45 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_defaults_match_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.retry_delay, Duration::from_millis(3000));
        assert_eq!(policy.health_interval, Duration::from_secs(30));
    }

    #[test]
    fn offer_window_is_five_minutes() {
        assert_eq!(
            SessionPolicy::default().offer_window,
            Duration::from_secs(300)
        );
    }
}
