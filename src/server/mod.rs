//! HTTP boundary: routes, response mapping and server lifecycle.

mod error;
mod handlers;
mod middleware;
#[allow(clippy::module_inception)]
mod server;

pub use error::{RelayError, ServerError};
pub use handlers::AppState;
pub use middleware::RequestId;
pub use server::RelayServer;
