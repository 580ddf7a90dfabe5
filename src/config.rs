use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Tuning parameters for a [`PullConsumer`](crate::zmq::PullConsumer).
///
/// None of these values encode a protocol requirement. The defaults give
/// the socket half a second to finish its handshake after connecting, and
/// pause briefly after each message.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PullConfig {
    /// Pause after connecting, before the handle is returned
    #[serde(rename = "settle_delay_ms", with = "millis")]
    pub settle_delay: Duration,
    /// Pause after each successfully received message
    #[serde(rename = "recv_delay_ms", with = "millis")]
    pub recv_delay: Duration,
    /// If set, a receive that waits longer than this reports a transport
    /// error instead of blocking forever.
    #[serde(rename = "recv_timeout_ms", with = "optional_millis")]
    pub recv_timeout: Option<Duration>,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            recv_delay: Duration::from_millis(10),
            recv_timeout: None,
        }
    }
}

impl PullConfig {
    /// Read a TOML configuration file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }
    pub fn recv_delay(mut self, delay: Duration) -> Self {
        self.recv_delay = delay;
        self
    }
    pub fn recv_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.recv_timeout = timeout;
        self
    }

    /// The receive timeout in the form zmq expects: milliseconds, -1 for infinite
    pub(crate) fn rcvtimeo(&self) -> i32 {
        match self.recv_timeout {
            Some(timeout) => i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX),
            None => -1,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PullConfig::default();
        assert_eq!(config.settle_delay, Duration::from_millis(500));
        assert_eq!(config.recv_delay, Duration::from_millis(10));
        assert_eq!(config.recv_timeout, None);
        assert_eq!(config.rcvtimeo(), -1);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: PullConfig = toml::from_str("recv_timeout_ms = 250").unwrap();
        assert_eq!(config.recv_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.rcvtimeo(), 250);
        assert_eq!(config.settle_delay, Duration::from_millis(500));

        let config: PullConfig =
            toml::from_str("settle_delay_ms = 0\nrecv_delay_ms = 3").unwrap();
        assert_eq!(config.settle_delay, Duration::ZERO);
        assert_eq!(config.recv_delay, Duration::from_millis(3));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<PullConfig>("settle_delay = 5").is_err());
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = PullConfig::from_file(Path::new("/nonexistent/zmqpull.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/zmqpull.toml"));
    }
}
