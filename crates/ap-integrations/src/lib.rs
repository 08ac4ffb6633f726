//! The issue-tracker boundary.
//!
//! [`gateway::IssueTracker`] is the narrow interface the pipeline consumes.
//! [`github::GitHubClient`] implements it over the GitHub REST and GraphQL
//! APIs; `fake::FakeTracker` (feature `test-support`) implements it in memory.

#[cfg(any(test, feature = "test-support"))]
pub mod fake;
pub mod gateway;
pub mod github;
pub mod types;
