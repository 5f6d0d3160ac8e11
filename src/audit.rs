//! Audit logging for LTI protocol lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with the serialized event in
//! the `audit` field, so the trail can be extracted by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `login.initiated` | An OIDC login redirect was issued |
//! | `launch.validated` | An `id_token` passed every check |
//! | `launch.rejected` | An `id_token` or launch request failed validation |
//! | `deep_link.responded` | A signed Deep Linking response was built |
//! | `grade.synced` | A score was accepted by the platform |
//! | `grade.failed` | A score submission failed |

use serde::Serialize;

use crate::ags::GradeSyncLogEntry;
use crate::lti::ValidatedLaunch;
use uuid::Uuid;

/// Structured audit event.
#[derive(Debug, Default, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g. `"launch.validated"`).
    pub event: &'static str,
    /// Issuer involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<String>,
    /// Deployment involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    /// Platform user (`sub`) for launches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Stored launch id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_id: Option<String>,
    /// LTI message type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<&'static str>,
    /// Internal assignment for grade events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<String>,
    /// Internal student for grade events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    /// Score given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Line item the score was posted to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_item_url: Option<String>,
    /// Number of content items returned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_count: Option<usize>,
    /// Failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    /// Construct a `login.initiated` event.
    #[must_use]
    pub fn login_initiated(platform_id: &str, deployment_id: Option<&str>) -> Self {
        Self {
            event: "login.initiated",
            platform_id: Some(platform_id.to_string()),
            deployment_id: deployment_id.map(str::to_string),
            ..Self::default()
        }
    }

    /// Construct a `launch.validated` event; `launch_id` is set once stored.
    #[must_use]
    pub fn launch_validated(launch: &ValidatedLaunch, launch_id: Option<Uuid>) -> Self {
        Self {
            event: "launch.validated",
            platform_id: Some(launch.platform_id.clone()),
            deployment_id: Some(launch.context.deployment_id.clone()),
            user_id: Some(launch.context.user.sub.clone()),
            launch_id: launch_id.map(|id| id.to_string()),
            message_type: Some(launch.context.message_type.as_str()),
            ..Self::default()
        }
    }

    /// Construct a `launch.rejected` event.
    #[must_use]
    pub fn launch_rejected(reason: impl Into<String>) -> Self {
        Self {
            event: "launch.rejected",
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Construct a `deep_link.responded` event.
    #[must_use]
    pub fn deep_link_responded(platform_id: &str, deployment_id: &str, item_count: usize) -> Self {
        Self {
            event: "deep_link.responded",
            platform_id: Some(platform_id.to_string()),
            deployment_id: Some(deployment_id.to_string()),
            item_count: Some(item_count),
            ..Self::default()
        }
    }

    /// Construct `grade.synced` or `grade.failed` from a sync log entry.
    #[must_use]
    pub fn grade(entry: &GradeSyncLogEntry) -> Self {
        Self {
            event: if entry.status.is_success() {
                "grade.synced"
            } else {
                "grade.failed"
            },
            platform_id: Some(entry.platform_id.clone()),
            assignment_id: entry.assignment_id.clone(),
            student_id: Some(entry.student_id.clone()),
            score: Some(entry.score),
            line_item_url: Some(entry.line_item_url.clone()),
            reason: entry.error_message.clone(),
            ..Self::default()
        }
    }
}

/// Emit an audit event via `tracing::info!`.
///
/// ```text
/// INFO lti_bridge::audit audit={"event":"launch.validated","platform_id":...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "lti audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
