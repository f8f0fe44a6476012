//! OpenNet Core - Foundational Types
//!
//! Configuration, errors, addressing and lifecycle events shared by the
//! OpenNet runtime and CLI. Nothing in this crate performs I/O beyond
//! reading configuration files.

pub mod config;
pub mod error;
pub mod event;
pub mod mobility;
pub mod network;

// Re-export commonly used types
pub use config::{
    AgentConfig, ConnectPolicy, LteConfig, LteMode, PollPolicy, RestartBehavior, WifiConfig,
};
pub use error::{NetError, Result};
pub use event::{Activity, EventEmitter, SessionEvent};
pub use mobility::{Mobility, MobilityModel, Vector3};
pub use network::{AddressCursor, IfaceAddr};

/// OpenNet version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
