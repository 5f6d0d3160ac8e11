//! Grade sync: publishing finalized grades from the grading subsystem.
//!
//! A sync resolves the assignment's line item in three steps: the binding
//! already stored on the assignment, then a platform lookup by `resourceId`,
//! then creation. A newly found or created line item is bound so later syncs
//! skip the platform round trips. Every submission attempt is logged whether
//! it succeeds or not.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info};

use super::client::{AgsClient, LineItemContainer};
use super::directory::{Assignment, AssignmentDirectory, GradableSubmission, IdentityDirectory};
use super::log::GradeSyncLogEntry;
use super::model::{LineItem, Score};
use crate::Result;

/// One grade to publish.
#[derive(Debug, Clone)]
pub struct GradeSyncRequest {
    /// Target platform
    pub platform_id: String,
    /// Course context on the platform
    pub context_id: String,
    /// Line-item container granted by the launch; overrides the registered
    /// template for `context_id`
    pub line_items_url: Option<String>,
    /// Internal assignment
    pub assignment_id: String,
    /// Internal student
    pub student_id: String,
    /// Points awarded
    pub score: f64,
    /// Feedback
    pub comment: Option<String>,
}

/// A student whose grade could not be published.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedUser {
    /// Internal student
    pub student_id: String,
    /// Why it failed
    pub error: String,
}

/// Outcome of a bulk sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkSyncSummary {
    /// Scores accepted by the platform
    pub synced_count: usize,
    /// Scores not delivered
    pub failed_count: usize,
    /// Per-student failures
    pub failed_users: Vec<FailedUser>,
}

/// Publishes grades through an [`AgsClient`].
pub struct GradeSync {
    client: Arc<AgsClient>,
    assignments: Arc<dyn AssignmentDirectory>,
    identities: Arc<dyn IdentityDirectory>,
    max_concurrency: usize,
}

impl GradeSync {
    /// Create a syncer with at most `max_concurrency` submissions in flight.
    #[must_use]
    pub fn new(
        client: Arc<AgsClient>,
        assignments: Arc<dyn AssignmentDirectory>,
        identities: Arc<dyn IdentityDirectory>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            client,
            assignments,
            identities,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Publish one student's grade for an assignment.
    ///
    /// # Errors
    ///
    /// Returns the first failure: assignment lookup, line item resolution,
    /// identity mapping, or the score submission itself. A log entry is
    /// written in every case.
    pub async fn sync_grade_to_platform(&self, request: &GradeSyncRequest) -> Result<()> {
        let assignment = match self.assignments.assignment(&request.assignment_id).await {
            Ok(a) => a,
            Err(e) => {
                self.record_failure(request, (request.score, 0.0), "", &e.to_string())
                    .await;
                return Err(e);
            }
        };
        let scores = (request.score, assignment.max_score);

        let container = request
            .line_items_url
            .as_deref()
            .map_or(LineItemContainer::Context(&request.context_id), LineItemContainer::Url);
        let line_item_url = match self
            .ensure_line_item(&request.platform_id, container, &assignment)
            .await
        {
            Ok(url) => url,
            Err(e) => {
                self.record_failure(request, scores, "", &e.to_string()).await;
                return Err(e);
            }
        };

        let submission = GradableSubmission {
            student_id: request.student_id.clone(),
            score: request.score,
            comment: request.comment.clone(),
        };
        self.sync_submission(&request.platform_id, &assignment, &line_item_url, &submission)
            .await
    }

    /// Publish every gradable submission of an assignment.
    ///
    /// Failures are isolated per student; one shared line item is resolved
    /// up front. If it cannot be resolved, every submission is logged and
    /// reported as failed.
    ///
    /// # Errors
    ///
    /// Returns an error only when the assignment or its submissions cannot be
    /// read; nothing is submitted in that case.
    pub async fn bulk_sync_grades<'c>(
        &self,
        platform_id: &str,
        container: impl Into<LineItemContainer<'c>>,
        assignment_id: &str,
    ) -> Result<BulkSyncSummary> {
        let container = container.into();
        let assignment = self.assignments.assignment(assignment_id).await?;
        let submissions = self.assignments.gradable_submissions(assignment_id).await?;
        debug!(
            platform = %platform_id,
            assignment = %assignment_id,
            count = submissions.len(),
            "Starting bulk grade sync"
        );

        let outcomes: Vec<(String, std::result::Result<(), String>)> =
            match self.ensure_line_item(platform_id, container, &assignment).await {
                Ok(line_item_url) => {
                    stream::iter(submissions)
                        .map(|submission| {
                            let assignment = &assignment;
                            let line_item_url = &line_item_url;
                            async move {
                                let outcome = self
                                    .sync_submission(platform_id, assignment, line_item_url, &submission)
                                    .await;
                                (submission.student_id, outcome.map_err(|e| e.to_string()))
                            }
                        })
                        .buffer_unordered(self.max_concurrency)
                        .collect()
                        .await
                }
                Err(e) => {
                    let reason = e.to_string();
                    let mut outcomes = Vec::with_capacity(submissions.len());
                    for submission in submissions {
                        self.client
                            .record(GradeSyncLogEntry::new(
                                platform_id,
                                Some(assignment_id),
                                &submission.student_id,
                                (submission.score, assignment.max_score),
                                "",
                                Err(reason.clone()),
                            ))
                            .await;
                        outcomes.push((submission.student_id, Err(reason.clone())));
                    }
                    outcomes
                }
            };

        let mut summary = BulkSyncSummary::default();
        for (student_id, outcome) in outcomes {
            match outcome {
                Ok(()) => summary.synced_count += 1,
                Err(error) => {
                    summary.failed_count += 1;
                    summary.failed_users.push(FailedUser { student_id, error });
                }
            }
        }
        info!(
            platform = %platform_id,
            assignment = %assignment_id,
            synced = summary.synced_count,
            failed = summary.failed_count,
            "Bulk grade sync finished"
        );
        Ok(summary)
    }

    /// Map the student and publish one submission; logs every outcome.
    async fn sync_submission(
        &self,
        platform_id: &str,
        assignment: &Assignment,
        line_item_url: &str,
        submission: &GradableSubmission,
    ) -> Result<()> {
        let user_id = match self
            .identities
            .platform_user_id(platform_id, &submission.student_id)
            .await
        {
            Ok(u) => u,
            Err(e) => {
                self.client
                    .record(GradeSyncLogEntry::new(
                        platform_id,
                        Some(&assignment.id),
                        &submission.student_id,
                        (submission.score, assignment.max_score),
                        line_item_url,
                        Err(e.to_string()),
                    ))
                    .await;
                return Err(e);
            }
        };

        let score = Score::completed(user_id, submission.score, assignment.max_score)
            .with_comment(submission.comment.clone());
        self.client
            .publish_score(
                platform_id,
                line_item_url,
                &score,
                Some(&assignment.id),
                &submission.student_id,
            )
            .await
    }

    /// Existing binding, then platform lookup by resource id, then create and bind.
    async fn ensure_line_item(
        &self,
        platform_id: &str,
        container: LineItemContainer<'_>,
        assignment: &Assignment,
    ) -> Result<String> {
        if let Some(url) = &assignment.line_item_url {
            return Ok(url.clone());
        }

        let line_item = match self
            .client
            .find_line_item(platform_id, container, &assignment.id)
            .await?
        {
            Some(existing) => existing,
            None => {
                let mut template = LineItem::new(&assignment.title, assignment.max_score);
                template.resource_id = Some(assignment.id.clone());
                self.client
                    .create_line_item(platform_id, container, &template)
                    .await?
            }
        };

        self.assignments
            .bind_line_item(&assignment.id, &line_item.id)
            .await?;
        debug!(assignment = %assignment.id, line_item = %line_item.id, "Bound line item");
        Ok(line_item.id)
    }

    async fn record_failure(
        &self,
        request: &GradeSyncRequest,
        scores: (f64, f64),
        line_item_url: &str,
        reason: &str,
    ) {
        self.client
            .record(GradeSyncLogEntry::new(
                &request.platform_id,
                Some(&request.assignment_id),
                &request.student_id,
                scores,
                line_item_url,
                Err(reason.to_string()),
            ))
            .await;
    }
}
