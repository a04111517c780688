//! Lineage reconstruction for parent-linked CRM activities.
//!
//! Given one activity id, the engine rebuilds every ancestor and every
//! descendant of that activity, attaches follow-up notes, and returns the
//! result in chronological order. Entry points:
//! - [`PipelineOrchestrator`] for one-shot resolution with optimized→original
//!   fallback.
//! - [`PipelineHandle`] for presentation layers that need `refetch`,
//!   `is_loading` and `error` state.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

mod annotate;
mod handle;
mod lineage;
mod orchestrator;
mod store;

pub use annotate::{annotate_follow_ups, Annotated};
pub use handle::{PipelineHandle, PipelineSnapshot};
pub use lineage::{resolve_lineage, LineageStrategy, OptimizedStrategy, OriginalStrategy};
pub use orchestrator::{PipelineOrchestrator, PipelineRun};
pub use store::{ActivityStore, InMemoryActivityStore, StoreCallCounts};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PipelineError {
    #[error("activity not found: {0}")]
    NotFound(ActivityId),
    #[error("record store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("follow-up annotation failed: {0}")]
    Annotation(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    /// Stable machine-readable code for error envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "pipeline.not_found",
            Self::StoreUnavailable(_) => "pipeline.store_unavailable",
            Self::Annotation(_) => "pipeline.annotation_failed",
            Self::Validation(_) => "pipeline.validation_error",
            Self::Configuration(_) => "pipeline.configuration_error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ActivityId(pub String);

impl ActivityId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ActivityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for ActivityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct FollowUpId(pub String);

impl Display for FollowUpId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for FollowUpId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    /// Maps a loosely typed stored value onto the closed set, substituting
    /// [`Priority::Medium`] for anything unrecognised. Matching is exact:
    /// `"HIGH"` or `" low "` are outside the set.
    #[must_use]
    pub fn normalize(value: &str) -> Self {
        Self::parse(value).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Activity {
    pub id: ActivityId,
    #[serde(with = "time::serde::rfc3339")]
    pub activity_date: OffsetDateTime,
    pub activity_type: String,
    pub parent_activity_id: Option<ActivityId>,
    pub customer_id: Option<String>,
    pub lead_id: Option<String>,
    pub contact_id: Option<String>,
    pub notes: Option<String>,
    pub pipeline_stage: Option<String>,
    #[serde(default)]
    pub follow_ups: Vec<FollowUp>,
}

impl Activity {
    /// Builds a bare activity with no descriptive payload.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        activity_date: OffsetDateTime,
        activity_type: impl Into<String>,
        parent_activity_id: Option<&str>,
    ) -> Self {
        Self {
            id: ActivityId(id.into()),
            activity_date,
            activity_type: activity_type.into(),
            parent_activity_id: parent_activity_id.map(ActivityId::from),
            customer_id: None,
            lead_id: None,
            contact_id: None,
            notes: None,
            pipeline_stage: None,
            follow_ups: Vec::new(),
        }
    }
}

/// A follow-up row as the record store hands it over, before priority
/// normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FollowUpRecord {
    pub id: FollowUpId,
    pub activity_id: ActivityId,
    pub follow_up_note: String,
    #[serde(with = "time::serde::rfc3339")]
    pub follow_up_date: OffsetDateTime,
    pub priority: String,
    pub is_done: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FollowUp {
    pub id: FollowUpId,
    pub activity_id: ActivityId,
    pub follow_up_note: String,
    #[serde(with = "time::serde::rfc3339")]
    pub follow_up_date: OffsetDateTime,
    pub priority: Priority,
    pub is_done: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<FollowUpRecord> for FollowUp {
    fn from(record: FollowUpRecord) -> Self {
        Self {
            priority: Priority::normalize(&record.priority),
            id: record.id,
            activity_id: record.activity_id,
            follow_up_note: record.follow_up_note,
            follow_up_date: record.follow_up_date,
            is_done: record.is_done,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Optimized,
    Original,
}

impl StrategyKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Optimized => "optimized",
            Self::Original => "original",
        }
    }
}

impl Display for StrategyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    pub fallback_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fallback_enabled: true,
        }
    }
}

impl PipelineConfig {
    /// Decodes a pipeline configuration from JSON.
    ///
    /// # Errors
    /// Returns [`PipelineError::Configuration`] when JSON decoding fails.
    pub fn from_json(value: &Value) -> Result<Self, PipelineError> {
        serde_json::from_value(value.clone()).map_err(|err| {
            PipelineError::Configuration(format!("invalid pipeline config JSON payload: {err}"))
        })
    }
}

/// Orders a resolved pipeline by `activity_date`, breaking ties by id.
pub fn sort_chronologically(activities: &mut [Activity]) {
    activities.sort_by(|lhs, rhs| {
        lhs.activity_date
            .cmp(&rhs.activity_date)
            .then_with(|| lhs.id.cmp(&rhs.id))
    });
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`PipelineError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, PipelineError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| PipelineError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(PipelineError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`PipelineError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, PipelineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            PipelineError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}


#[cfg(test)]
mod tests {
    use super::fixtures::{activity, must, must_utc};
    use super::*;
    use serde_json::json;

    #[test]
    fn priority_outside_closed_set_defaults_to_medium() {
        assert_eq!(Priority::normalize("high"), Priority::High);
        assert_eq!(Priority::normalize("low"), Priority::Low);
        assert_eq!(Priority::normalize(" low "), Priority::Medium);
        assert_eq!(Priority::normalize("HIGH"), Priority::Medium);
        assert_eq!(Priority::normalize("urgent"), Priority::Medium);
        assert_eq!(Priority::normalize(""), Priority::Medium);
    }

    #[test]
    fn identifiers_honour_width_and_alignment() {
        assert_eq!(format!("[{:<6}]", ActivityId::from("r1")), "[r1    ]");
        assert_eq!(format!("[{:>6}]", FollowUpId::from("f1")), "[    f1]");
        assert_eq!(format!("[{:<10}]", StrategyKind::Optimized), "[optimized ]");
        assert_eq!(format!("[{:.3}]", StrategyKind::Original), "[ori]");
    }

    #[test]
    fn chronological_sort_breaks_date_ties_by_id() {
        let mut activities = vec![
            activity("b", 3, None),
            activity("c", 1, None),
            activity("a", 3, None),
        ];
        sort_chronologically(&mut activities);
        let ids: Vec<_> = activities.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn pipeline_config_from_json_rejects_wrong_types() {
        let ok = must(PipelineConfig::from_json(&json!({ "fallback_enabled": false })));
        assert!(!ok.fallback_enabled);

        let err = PipelineConfig::from_json(&json!({ "fallback_enabled": "yes" }));
        assert!(matches!(err, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn parse_rfc3339_rejects_non_utc() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        assert_eq!(
            must(format_rfc3339(must_utc("2026-02-07T12:00:00Z"))),
            "2026-02-07T12:00:00Z"
        );
    }

    #[test]
    fn activity_json_omits_nothing_and_defaults_follow_ups() {
        let value = json!({
            "id": "a1",
            "activity_date": "2026-02-07T12:00:00Z",
            "activity_type": "meeting",
            "parent_activity_id": null,
            "customer_id": "cust-9",
            "lead_id": null,
            "contact_id": null,
            "notes": "kickoff",
            "pipeline_stage": "qualified"
        });
        let decoded: Activity = must(serde_json::from_value(value));
        assert!(decoded.follow_ups.is_empty());
        assert_eq!(decoded.customer_id.as_deref(), Some("cust-9"));
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            PipelineError::NotFound(ActivityId::from("x")).code(),
            "pipeline.not_found"
        );
        assert_eq!(
            PipelineError::StoreUnavailable(String::new()).code(),
            "pipeline.store_unavailable"
        );
    }
}
