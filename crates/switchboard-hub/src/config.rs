use std::time::Duration;
use switchboard_protocol::{MAX_CONTENT_CHARS, MAX_FRAME_BYTES};

/// Tunables for the hub and every connection it owns.
#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
    /// How often the writer sends a transport-level ping.
    pub ping_interval: Duration,
    /// How long the reader waits for any heartbeat before giving up.
    pub pong_wait: Duration,
    pub max_content_chars: usize,
    /// Unread messages replayed to a freshly registered connection.
    pub backlog_limit: usize,
    pub max_frame_bytes: usize,
    /// Inbound token bucket: burst size.
    pub rate_burst: u32,
    /// Inbound token bucket: sustained frames per second.
    pub rate_per_second: f64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            max_content_chars: MAX_CONTENT_CHARS,
            backlog_limit: 50,
            max_frame_bytes: MAX_FRAME_BYTES,
            rate_burst: 30,
            rate_per_second: 10.0,
        }
    }
}

impl HubConfig {
    /// Reject settings that would make connections unusable.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.outbound_capacity == 0 {
            anyhow::bail!("outbound_capacity must be at least 1");
        }
        if self.ping_interval.is_zero() {
            anyhow::bail!("ping_interval must be non-zero");
        }
        // Pings have to land before the peer's read deadline expires.
        if self.ping_interval >= self.pong_wait {
            anyhow::bail!(
                "ping_interval ({:?}) must be shorter than pong_wait ({:?})",
                self.ping_interval,
                self.pong_wait
            );
        }
        if self.max_content_chars == 0 || self.max_frame_bytes == 0 {
            anyhow::bail!("content and frame limits must be non-zero");
        }
        if self.rate_burst == 0
            || !self.rate_per_second.is_finite()
            || self.rate_per_second <= 0.0
        {
            anyhow::bail!("rate limit must allow at least one frame");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = HubConfig::default();
        config.validate().unwrap();
        assert_eq!(config.outbound_capacity, 256);
        assert!(config.ping_interval < config.pong_wait);
    }

    #[test]
    fn ping_must_beat_pong_wait() {
        let config = HubConfig {
            ping_interval: Duration::from_secs(60),
            pong_wait: Duration::from_secs(60),
            ..HubConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("shorter than pong_wait"));
    }

    #[test]
    fn zero_capacity_rejected() {
        let config = HubConfig {
            outbound_capacity: 0,
            ..HubConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn refill_rate_must_be_a_positive_number() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = HubConfig {
                rate_per_second: rate,
                ..HubConfig::default()
            };
            assert!(config.validate().is_err(), "rate {rate} accepted");
        }
    }
}
