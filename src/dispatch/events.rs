//! Wire shapes of the messages the dispatch engine reads and writes.

use serde::{Deserialize, Serialize};

use crate::db::dispatch::WindowSpec;

/// A facility scheduled a report over a period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledReportNotification {
    #[serde(default)]
    pub facility_id: String,
    pub report_types: Vec<String>,
    pub frequency: String,
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl ScheduledReportNotification {
    pub fn window(&self) -> WindowSpec {
        WindowSpec::new(
            self.report_types.iter().cloned(),
            self.frequency.trim(),
            self.start_date.trim(),
            self.end_date.trim(),
        )
    }
}

/// Something happened to a patient at a facility (admit, discharge, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientLifecycleEvent {
    #[serde(default)]
    pub facility_id: String,
    pub patient_id: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Asks for accumulated dispatches to go out now instead of at their
/// deadline. Without a patient, every open dispatch of the facility goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchFlushRequested {
    #[serde(default)]
    pub facility_id: String,
    #[serde(default)]
    pub patient_id: Option<String>,
}

/// Emitted once per (facility, patient) accumulation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReadyEvent {
    pub facility_id: String,
    pub patient_id: String,
    pub correlation_id: String,
    pub report_windows: Vec<WindowSpec>,
}
