//! Switchboard: a line-protocol server for authenticated chat and
//! name-based remote function dispatch.
//!
//! ## Architecture
//!
//! - `protocol`: frame types, payload schemas and the `FrameCodec`
//! - `credentials`: flat-file login/password store
//! - `registry`: live sessions and function ownership
//! - `session`: per-connection state machine
//! - `broker`: CALC request/answer bridging between connections
//! - `relay`: direct and broadcast messaging
//! - `server`: TCP accept loop
//! - `client`: async client for the protocol

pub mod broker;
pub mod client;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;

pub use config::AppConfig;
pub use context::AppContext;
pub use server::Server;
