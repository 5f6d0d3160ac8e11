//! Collaborator seams for grade sync: assignments and identities.
//!
//! The grading subsystem owns assignments, submissions and the mapping from
//! internal students to platform users. Grade sync only reads them, plus one
//! write: binding an assignment to the platform line item it publishes to.

use dashmap::DashMap;

use crate::{Error, Result};

/// An internal assignment that publishes grades to a platform.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Internal id, also used as the line item `resourceId`
    pub id: String,
    /// Gradebook label
    pub title: String,
    /// Points possible
    pub max_score: f64,
    /// Line item already bound to this assignment
    pub line_item_url: Option<String>,
}

/// A finalized grade waiting to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct GradableSubmission {
    /// Internal student id
    pub student_id: String,
    /// Points awarded
    pub score: f64,
    /// Feedback
    pub comment: Option<String>,
}

/// Read access to assignments plus the line-item binding.
#[async_trait::async_trait]
pub trait AssignmentDirectory: Send + Sync + 'static {
    /// Look up an assignment. Unknown ids are [`Error::NotFound`].
    async fn assignment(&self, assignment_id: &str) -> Result<Assignment>;

    /// Remember the line item an assignment publishes to.
    async fn bind_line_item(&self, assignment_id: &str, line_item_url: &str) -> Result<()>;

    /// Submissions with a final grade.
    async fn gradable_submissions(&self, assignment_id: &str) -> Result<Vec<GradableSubmission>>;
}

/// Maps internal students to platform users.
#[async_trait::async_trait]
pub trait IdentityDirectory: Send + Sync + 'static {
    /// Platform `sub` for `student_id` on `platform_id`.
    async fn platform_user_id(&self, platform_id: &str, student_id: &str) -> Result<String>;
}

/// In-memory assignment directory.
#[derive(Default)]
pub struct InMemoryAssignmentDirectory {
    assignments: DashMap<String, Assignment>,
    submissions: DashMap<String, Vec<GradableSubmission>>,
}

impl InMemoryAssignmentDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an assignment with its gradable submissions.
    pub fn insert(&self, assignment: Assignment, submissions: Vec<GradableSubmission>) {
        self.submissions.insert(assignment.id.clone(), submissions);
        self.assignments.insert(assignment.id.clone(), assignment);
    }
}

#[async_trait::async_trait]
impl AssignmentDirectory for InMemoryAssignmentDirectory {
    async fn assignment(&self, assignment_id: &str) -> Result<Assignment> {
        self.assignments
            .get(assignment_id)
            .map(|a| a.clone())
            .ok_or_else(|| Error::NotFound(format!("assignment {assignment_id}")))
    }

    async fn bind_line_item(&self, assignment_id: &str, line_item_url: &str) -> Result<()> {
        let mut assignment = self
            .assignments
            .get_mut(assignment_id)
            .ok_or_else(|| Error::NotFound(format!("assignment {assignment_id}")))?;
        assignment.line_item_url = Some(line_item_url.to_string());
        Ok(())
    }

    async fn gradable_submissions(&self, assignment_id: &str) -> Result<Vec<GradableSubmission>> {
        Ok(self
            .submissions
            .get(assignment_id)
            .map(|s| s.clone())
            .unwrap_or_default())
    }
}

/// In-memory identity directory keyed by `(platform_id, student_id)`.
#[derive(Default)]
pub struct InMemoryIdentityDirectory {
    users: DashMap<(String, String), String>,
}

impl InMemoryIdentityDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `student_id` to `platform_user_id` on `platform_id`.
    pub fn insert(&self, platform_id: &str, student_id: &str, platform_user_id: &str) {
        self.users.insert(
            (platform_id.to_string(), student_id.to_string()),
            platform_user_id.to_string(),
        );
    }
}

#[async_trait::async_trait]
impl IdentityDirectory for InMemoryIdentityDirectory {
    async fn platform_user_id(&self, platform_id: &str, student_id: &str) -> Result<String> {
        self.users
            .get(&(platform_id.to_string(), student_id.to_string()))
            .map(|u| u.clone())
            .ok_or_else(|| Error::NotFound(format!("no platform identity for student {student_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment() -> Assignment {
        Assignment {
            id: "hw-1".to_string(),
            title: "Homework 1".to_string(),
            max_score: 10.0,
            line_item_url: None,
        }
    }

    #[tokio::test]
    async fn binding_is_visible_on_next_lookup() {
        // GIVEN: an unbound assignment
        let dir = InMemoryAssignmentDirectory::new();
        dir.insert(assignment(), Vec::new());

        // WHEN: a line item is bound
        dir.bind_line_item("hw-1", "https://lms.example.edu/li/1").await.unwrap();

        // THEN: the binding is returned
        let found = dir.assignment("hw-1").await.unwrap();
        assert_eq!(found.line_item_url.as_deref(), Some("https://lms.example.edu/li/1"));
    }

    #[tokio::test]
    async fn unknown_assignment_is_not_found() {
        let dir = InMemoryAssignmentDirectory::new();
        assert!(matches!(dir.assignment("nope").await, Err(Error::NotFound(_))));
        assert!(matches!(dir.bind_line_item("nope", "x").await, Err(Error::NotFound(_))));
        assert!(dir.gradable_submissions("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn identities_are_scoped_per_platform() {
        let dir = InMemoryIdentityDirectory::new();
        dir.insert("https://a.example", "s1", "sub-a");

        assert_eq!(dir.platform_user_id("https://a.example", "s1").await.unwrap(), "sub-a");
        assert!(dir.platform_user_id("https://b.example", "s1").await.is_err());
    }
}
