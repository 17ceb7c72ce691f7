pub mod errors;
pub mod handlers;
pub mod http_server;

pub use errors::{ApiError, ErrorResponse};
pub use handlers::{ClassifyResponse, HealthResponse, IMAGE_FIELD};
pub use http_server::{build_router, serve, AppState};
