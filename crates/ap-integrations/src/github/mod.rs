pub mod client;
pub mod issues;
pub mod projects;
pub mod pull_requests;

pub use client::GitHubClient;
