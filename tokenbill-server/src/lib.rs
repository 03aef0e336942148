//! Tokenbill server library
//!
//! The HTTP surface (webhook endpoint plus the authenticated user-facing
//! API) and the scheduled workers, assembled around the billing core. Split
//! out of the binary so the routes and auth layer are testable.

#![forbid(unsafe_code)]

pub mod alerts;
pub mod auth;
pub mod routes;
pub mod state;
pub mod workers;

pub use routes::router;
pub use state::AppState;
