pub mod runtime;
pub mod upstream;

pub use runtime::{Gateway, serve, start_server};
pub use upstream::UpstreamProxy;
