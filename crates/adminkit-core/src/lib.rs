//! adminkit-core - client session layer for the admin console backend.
//!
//! This crate authenticates a user, attaches the bearer credential to
//! outgoing requests, and transparently renews it on expiry. Concurrent
//! requests that observe a rejected access token share a single refresh
//! call; the rest queue up and are resumed in arrival order once the
//! refresh resolves, each retrying its original request exactly once.
//!
//! The pieces:
//! - [`auth::SessionManager`]: the session state machine and refresh protocol
//! - [`auth::TokenStore`]: durable on-disk storage for the credential pair
//! - [`api::ApiClient`]: the request gateway and backend endpoints
//! - [`api::ApiError`]: the failure taxonomy every call resolves into

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError};
pub use auth::{SessionManager, SessionState, TokenPair, TokenStore};
pub use config::Config;
