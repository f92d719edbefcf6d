//! Server-side half of the recording stack: the HTTP client middleware.
//! Event types, the sanitizer and the JSONL writer live in `depwatch_core`.

pub mod middleware;

pub use middleware::RecordingMiddleware;
