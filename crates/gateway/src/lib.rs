// freemonitor-gateway: real-time pub/sub gateway for device telemetry and alerts.

pub mod app;
pub mod auth;
pub mod cache;
pub mod config;
pub mod cors;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod lookup;
pub mod rate_limit;
pub mod reaper;
pub mod registry;
pub mod router;
pub mod sink;
pub mod ws;

pub use app::build_app;
pub use auth::{Identity, IdentityVerifier};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewaySettings};
pub use lookup::{AlertLookup, DeviceLookup, MemoryDirectory};
