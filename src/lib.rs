pub mod app;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod netinfo;
pub mod platform;
pub mod protocol;
pub mod protocols;
pub mod retry;
pub mod ui;

pub use error::Result;
pub use error::VpnError;
