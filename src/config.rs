//! Session configuration
//!
//! Defaults match the capture cadence the agent expects; every value can be
//! overridden from the environment with `SessionConfig::from_env`.

use crate::error::{KoraError, Result};
use std::time::Duration;

/// Default agent endpoint when `KORA_ENDPOINT` is not set
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8765/agent";

/// Configuration for a voice session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint of the agent
    pub endpoint: String,
    /// Agent to talk to, sent as the `agent_id` query parameter
    pub agent_id: Option<String>,
    /// Application name reported to the sound server
    pub app_name: String,
    /// Capture device name, `None` for the default source
    pub input_device: Option<String>,
    /// Playback device name, `None` for the default sink
    pub output_device: Option<String>,
    /// Duration of one captured chunk
    pub chunk_interval: Duration,
    /// Grace delay between the end of capture and `end_of_speech`
    pub flush_delay: Duration,
    /// Number of samples kept for the level meter
    pub analysis_window: usize,
    /// Capture and playback sample rate (mono S16LE)
    pub sample_rate: u32,
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            agent_id: None,
            app_name: "kora".to_string(),
            input_device: None,
            output_device: None,
            chunk_interval: Duration::from_millis(250),
            flush_delay: Duration::from_millis(250),
            analysis_window: 256,
            sample_rate: 16_000,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    /// Build a configuration from `KORA_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(endpoint) = lookup("KORA_ENDPOINT") {
            config.endpoint = endpoint;
        }
        config.agent_id = lookup("KORA_AGENT_ID").filter(|id| !id.trim().is_empty());
        config.input_device = lookup("KORA_INPUT_DEVICE");
        config.output_device = lookup("KORA_OUTPUT_DEVICE");

        if let Some(ms) = lookup("KORA_CHUNK_MS") {
            config.chunk_interval = Duration::from_millis(parse_number("KORA_CHUNK_MS", &ms)?);
        }
        if let Some(ms) = lookup("KORA_FLUSH_MS") {
            config.flush_delay = Duration::from_millis(parse_number("KORA_FLUSH_MS", &ms)?);
        }
        if let Some(window) = lookup("KORA_ANALYSIS_WINDOW") {
            config.analysis_window = parse_number("KORA_ANALYSIS_WINDOW", &window)?;
        }
        if let Some(rate) = lookup("KORA_SAMPLE_RATE") {
            config.sample_rate = parse_number("KORA_SAMPLE_RATE", &rate)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(KoraError::Config(format!(
                "endpoint must be a ws:// or wss:// URL, got '{}'",
                self.endpoint
            )));
        }
        if self.chunk_interval.is_zero() {
            return Err(KoraError::Config("chunk interval must be non-zero".into()));
        }
        if self.analysis_window == 0 {
            return Err(KoraError::Config("analysis window must be non-zero".into()));
        }
        if self.sample_rate == 0 {
            return Err(KoraError::Config("sample rate must be non-zero".into()));
        }
        Ok(())
    }

    /// Endpoint with the agent id folded in as a query parameter.
    pub fn url(&self) -> String {
        match &self.agent_id {
            Some(agent_id) => {
                let sep = if self.endpoint.contains('?') { '&' } else { '?' };
                format!("{}{}agent_id={}", self.endpoint, sep, agent_id)
            }
            None => self.endpoint.clone(),
        }
    }

    /// Size in bytes of one full chunk of S16LE mono audio.
    pub fn chunk_bytes(&self) -> usize {
        let samples = self.sample_rate as u128 * self.chunk_interval.as_millis() / 1000;
        (samples as usize).max(1) * 2
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| KoraError::Config(format!("{} is not a valid number: '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.chunk_interval, Duration::from_millis(250));
        assert_eq!(config.flush_delay, Duration::from_millis(250));
        assert_eq!(config.analysis_window, 256);
        assert!(config.validate().is_ok());
        // 250ms of 16 kHz mono S16LE
        assert_eq!(config.chunk_bytes(), 8000);
    }

    #[test]
    fn test_overrides_from_lookup() {
        let config = SessionConfig::from_lookup(lookup_from(&[
            ("KORA_ENDPOINT", "wss://agent.example/ws"),
            ("KORA_AGENT_ID", "abc123"),
            ("KORA_CHUNK_MS", "100"),
            ("KORA_FLUSH_MS", "0"),
        ]))
        .unwrap();

        assert_eq!(config.chunk_interval, Duration::from_millis(100));
        assert_eq!(config.flush_delay, Duration::ZERO);
        assert_eq!(config.url(), "wss://agent.example/ws?agent_id=abc123");
    }

    #[test]
    fn test_agent_id_appends_to_existing_query() {
        let config = SessionConfig {
            endpoint: "ws://host/ws?v=1".into(),
            agent_id: Some("a".into()),
            ..Default::default()
        };
        assert_eq!(config.url(), "ws://host/ws?v=1&agent_id=a");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = SessionConfig::from_lookup(lookup_from(&[("KORA_CHUNK_MS", "fast")])).unwrap_err();
        assert!(matches!(err, KoraError::Config(_)));

        let err = SessionConfig::from_lookup(lookup_from(&[("KORA_CHUNK_MS", "0")])).unwrap_err();
        assert!(matches!(err, KoraError::Config(_)));

        let err =
            SessionConfig::from_lookup(lookup_from(&[("KORA_ENDPOINT", "http://x")])).unwrap_err();
        assert!(matches!(err, KoraError::Config(_)));
    }
}
