pub mod sanitization;
pub mod subscriber;
pub mod tracing;

pub use sanitization::sanitize_log_message;
pub use subscriber::setup_tracing;
pub use self::tracing::{TRACE_ID_HEADER, TraceId, trace_requests};
