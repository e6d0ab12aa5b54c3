use std::time::Duration;

use serde::Deserialize;

/// Runtime configuration, read from `INTERLINK_*` environment variables.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,

    #[serde(default = "defaults::service_name")]
    pub service_name: String,
    pub group_id: Option<String>,

    #[serde(default = "defaults::poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "defaults::poll_backoff_ms")]
    pub poll_backoff_ms: u64,

    #[serde(default = "defaults::retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "defaults::enabled")]
    pub retry_enabled: bool,
    pub max_retries: Option<u32>,

    #[serde(default = "defaults::timer_tick_ms")]
    pub timer_tick_ms: u64,
    #[serde(default = "defaults::claim_lease_secs")]
    pub claim_lease_secs: u64,

    #[serde(default = "defaults::report_scheduled_topic")]
    pub report_scheduled_topic: String,
    #[serde(default = "defaults::patient_event_topic")]
    pub patient_event_topic: String,
    #[serde(default = "defaults::dispatch_flush_topic")]
    pub dispatch_flush_topic: String,
    #[serde(default = "defaults::dispatch_ready_topic")]
    pub dispatch_ready_topic: String,
    /// Comma separated. Empty means every lifecycle event qualifies.
    #[serde(default)]
    pub dispatch_event_types: String,
}

mod defaults {
    pub fn service_name() -> String {
        "interlink".to_owned()
    }

    pub fn poll_timeout_ms() -> u64 {
        1_000
    }

    pub fn poll_backoff_ms() -> u64 {
        5_000
    }

    pub fn retry_delay_secs() -> u64 {
        60
    }

    pub fn enabled() -> bool {
        true
    }

    pub fn timer_tick_ms() -> u64 {
        1_000
    }

    pub fn claim_lease_secs() -> u64 {
        60
    }

    pub fn report_scheduled_topic() -> String {
        "ReportScheduled".to_owned()
    }

    pub fn patient_event_topic() -> String {
        "PatientEvent".to_owned()
    }

    pub fn dispatch_flush_topic() -> String {
        "DispatchFlushRequested".to_owned()
    }

    pub fn dispatch_ready_topic() -> String {
        "DispatchReady".to_owned()
    }
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("INTERLINK_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("interlink.db")
    }

    pub fn group_id(&self) -> &str {
        self.group_id.as_deref().unwrap_or(&self.service_name)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn poll_backoff(&self) -> Duration {
        Duration::from_millis(self.poll_backoff_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn timer_tick(&self) -> Duration {
        Duration::from_millis(self.timer_tick_ms)
    }

    pub fn claim_lease(&self) -> chrono::Duration {
        i64::try_from(self.claim_lease_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn dispatch_event_types(&self) -> Vec<String> {
        self.dispatch_event_types
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// The quarantine channel for this service.
    pub fn dead_letter_topic(&self) -> String {
        crate::dead_letter::dead_letter_topic(&self.service_name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            service_name: defaults::service_name(),
            group_id: None,
            poll_timeout_ms: defaults::poll_timeout_ms(),
            poll_backoff_ms: defaults::poll_backoff_ms(),
            retry_delay_secs: defaults::retry_delay_secs(),
            retry_enabled: true,
            max_retries: None,
            timer_tick_ms: defaults::timer_tick_ms(),
            claim_lease_secs: defaults::claim_lease_secs(),
            report_scheduled_topic: defaults::report_scheduled_topic(),
            patient_event_topic: defaults::patient_event_topic(),
            dispatch_flush_topic: defaults::dispatch_flush_topic(),
            dispatch_ready_topic: defaults::dispatch_ready_topic(),
            dispatch_event_types: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_list() {
        let config = Config {
            dispatch_event_types: " Admit, Discharge ,,".to_owned(),
            ..Config::default()
        };

        assert_eq!(config.dispatch_event_types(), vec!["Admit", "Discharge"]);
        assert!(Config::default().dispatch_event_types().is_empty());
    }

    #[test]
    fn test_group_defaults_to_service() {
        let config = Config {
            service_name: "query-dispatch".to_owned(),
            ..Config::default()
        };

        assert_eq!(config.group_id(), "query-dispatch");
        assert_eq!(config.dead_letter_topic(), "query-dispatch-dead-letter");
    }

    #[test]
    fn test_oversized_claim_lease_saturates() {
        let config = Config {
            claim_lease_secs: u64::MAX,
            ..Config::default()
        };

        assert_eq!(config.claim_lease(), chrono::Duration::MAX);
        assert_eq!(Config::default().claim_lease(), chrono::Duration::seconds(60));
    }
}
