//! AGS wire types: line items, scores and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OAuth scopes granted for AGS calls.
pub mod scope {
    /// Manage line items
    pub const LINE_ITEM: &str = "https://purl.imsglobal.org/spec/lti-ags/scope/lineitem";
    /// Read line items
    pub const LINE_ITEM_READONLY: &str =
        "https://purl.imsglobal.org/spec/lti-ags/scope/lineitem.readonly";
    /// Publish scores
    pub const SCORE: &str = "https://purl.imsglobal.org/spec/lti-ags/scope/score";
    /// Read results
    pub const RESULT_READONLY: &str = "https://purl.imsglobal.org/spec/lti-ags/scope/result.readonly";
}

/// IMS media types used on AGS endpoints.
pub mod media {
    /// Single line item
    pub const LINE_ITEM: &str = "application/vnd.ims.lis.v2.lineitem+json";
    /// Line item container
    pub const LINE_ITEM_CONTAINER: &str = "application/vnd.ims.lis.v2.lineitemcontainer+json";
    /// Score publication
    pub const SCORE: &str = "application/vnd.ims.lis.v1.score+json";
    /// Result container
    pub const RESULT_CONTAINER: &str = "application/vnd.ims.lis.v2.resultcontainer+json";
}

/// A gradebook column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    /// Platform-assigned URL; empty until created
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Maximum score
    pub score_maximum: f64,
    /// Column label
    pub label: String,
    /// Tool resource id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Bound resource link
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_link_id: Option<String>,
    /// Free-form tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Submission window start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date_time: Option<DateTime<Utc>>,
    /// Submission window end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date_time: Option<DateTime<Utc>>,
}

impl LineItem {
    /// A not-yet-created line item.
    #[must_use]
    pub fn new(label: impl Into<String>, score_maximum: f64) -> Self {
        Self {
            id: String::new(),
            score_maximum,
            label: label.into(),
            resource_id: None,
            resource_link_id: None,
            tag: None,
            start_date_time: None,
            end_date_time: None,
        }
    }
}

/// Learner progress reported with a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityProgress {
    /// Not started
    Initialized,
    /// Started
    Started,
    /// In progress
    InProgress,
    /// Submitted, possibly awaiting grading
    Submitted,
    /// Done
    Completed,
}

/// Grading status reported with a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GradingProgress {
    /// Final grade
    FullyGraded,
    /// Grading in progress
    Pending,
    /// Needs a human grader
    PendingManual,
    /// Grading failed
    Failed,
    /// Nothing to grade yet
    NotReady,
}

/// A score publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Score {
    /// Platform `sub` of the learner
    pub user_id: String,
    /// Points awarded
    pub score_given: f64,
    /// Points possible
    pub score_maximum: f64,
    /// Feedback shown to the learner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// When the score was produced
    pub timestamp: DateTime<Utc>,
    /// Learner progress
    pub activity_progress: ActivityProgress,
    /// Grading status
    pub grading_progress: GradingProgress,
}

impl Score {
    /// A final, fully graded score stamped now.
    #[must_use]
    pub fn completed(user_id: impl Into<String>, score_given: f64, score_maximum: f64) -> Self {
        Self {
            user_id: user_id.into(),
            score_given,
            score_maximum,
            comment: None,
            timestamp: Utc::now(),
            activity_progress: ActivityProgress::Completed,
            grading_progress: GradingProgress::FullyGraded,
        }
    }

    /// Attach learner feedback.
    #[must_use]
    pub fn with_comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment;
        self
    }
}

/// A gradebook cell as reported by the result service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgsResult {
    /// Result URL
    pub id: String,
    /// Line item the result belongs to
    #[serde(default)]
    pub score_of: Option<String>,
    /// Platform `sub` of the learner
    pub user_id: String,
    /// Current score
    #[serde(default)]
    pub result_score: Option<f64>,
    /// Maximum for `result_score`
    #[serde(default)]
    pub result_maximum: Option<f64>,
    /// Feedback
    #[serde(default)]
    pub comment: Option<String>,
}
