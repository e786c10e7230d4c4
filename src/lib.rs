pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod registry;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod upstream;
pub mod wsproto;
