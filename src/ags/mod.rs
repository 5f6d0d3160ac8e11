//! Assignment and Grade Services.
//!
//! [`AgsClient`] talks to the platform: token exchange, line items, scores
//! and results. [`GradeSync`] sits on top of it and publishes grades that the
//! grading subsystem has finalized, resolving line items and platform
//! identities through the [`AssignmentDirectory`] and [`IdentityDirectory`]
//! seams. Every score attempt lands in the [`GradeSyncLog`].

pub mod client;
pub mod directory;
pub mod log;
pub mod model;
pub mod sync;

pub use client::{AccessToken, AgsClient, LineItemContainer};
pub use directory::{
    Assignment, AssignmentDirectory, GradableSubmission, IdentityDirectory,
    InMemoryAssignmentDirectory, InMemoryIdentityDirectory,
};
pub use log::{GradeSyncLog, GradeSyncLogEntry, InMemoryGradeSyncLog, SyncStatus};
pub use model::{ActivityProgress, AgsResult, GradingProgress, LineItem, Score};
pub use sync::{BulkSyncSummary, FailedUser, GradeSync, GradeSyncRequest};
