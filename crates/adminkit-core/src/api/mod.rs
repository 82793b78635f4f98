//! REST API client module for the admin console backend.
//!
//! This module provides the `ApiClient` gateway: every outbound call
//! attaches the current bearer token, and an authentication rejection is
//! resolved through the session manager's refresh protocol before the
//! call is retried exactly once. All other failures pass through
//! unchanged, classified by `ApiError`.

pub mod client;
pub mod error;

pub use client::{ApiClient, RefreshEndpoint};
pub use error::ApiError;
