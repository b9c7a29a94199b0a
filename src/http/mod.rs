//! HTTP surface: health, room lookup and the WebSocket upgrade route

mod routes;

pub use routes::{build_router, AppError};
