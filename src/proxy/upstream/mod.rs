// Upstream side - outbound HTTP to origin servers
pub mod forwarder;

pub use forwarder::{ForwarderOptions, HttpForwarder};
