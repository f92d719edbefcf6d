pub mod logger;
pub mod sanitizer;
pub mod types;

pub use logger::RecordingLogger;
pub use sanitizer::{Sanitizer, SENSITIVE_HEADERS};
pub use types::*;
