//! HTTP observer API.
//!
//! A thin adapter over [`crate::engine::Engine`]: task submission and operator
//! commands as JSON endpoints, plus a server-sent event stream for observers.
//! Enabled by `server.http.enabled` and disabled with `--no-http`.

mod routes;
mod server;

pub use routes::{ApiError, ApiState, build_router, status_for};
pub use server::{HttpHandle, HttpStatus, start_server, start_server_with_retry};
