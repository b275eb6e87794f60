//! Remote execution protocol: submit/poll commands and transfer files to a sandbox.

pub mod client;
pub mod http;
pub mod models;
pub mod transport;

pub use client::TestbedClient;
pub use http::HttpTransport;
pub use transport::{LocalTransport, SandboxTransport};
