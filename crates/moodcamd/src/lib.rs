//! moodcamd library: the daemon's HTTP surface and inference plumbing.
//!
//! Split out of the binary so the integration tests can build the router
//! against an engine with detection disabled.

pub mod config;
pub mod engine;
pub mod error;
pub mod routes;
pub mod session;
pub mod ws;

pub use config::Config;
pub use engine::{Analysis, EngineHandle, Pipeline};
pub use error::ApiError;
pub use routes::{router, AppState};
pub use session::SessionStore;
