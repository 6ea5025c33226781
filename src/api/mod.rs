//! HTTP API - render submission, status, cancellation and progress streaming

pub mod routes;

pub use routes::create_router;
