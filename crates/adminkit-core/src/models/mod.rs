//! Data models for the admin console backend API.
//!
//! Wire field names are camelCase; structs map them with per-field
//! `serde(rename)`. With the `ts` feature enabled the externally consumed
//! models export TypeScript definitions for the web front end.

pub mod auth;
pub mod user;

pub use auth::{AuthUser, CaptchaChallenge, LoginRequest, RegisterRequest};
pub use user::{SortOrder, User, UserPage, UserQuery};
