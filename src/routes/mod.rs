//! HTTP route handlers.
//!
//! [`health`] is public; everything in [`sessions`] sits behind
//! [`crate::auth::require_api_key`].

pub mod health;
pub mod sessions;
