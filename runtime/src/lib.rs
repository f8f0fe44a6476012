//! OpenNet Runtime - simulation session engine.
//!
//! Drives a remote simulation agent over a persistent statement channel,
//! builds LTE and Wi-Fi topologies inside it, and moves the resulting TAP
//! interfaces into the emulated hosts' network namespaces.

#![allow(clippy::result_large_err)]

pub mod channel;
pub mod dry_run;
pub mod endpoint;
pub mod host;
pub mod poll;
pub mod script;
pub mod sequencer;
pub mod session;

// Re-export common types
pub use channel::{AgentChannel, Reply, TcpTransport, Transport};
pub use dry_run::{RecordingHost, RecordingTransport};
pub use endpoint::{Endpoint, EndpointState, MigrationPlan, TapIntf};
pub use host::{EmulatedHost, NetnsHost};
pub use poll::{wait_until, ReplyClass};
pub use script::{Expr, Statement};
pub use sequencer::{Batch, ObjectTable, Sequencer};
pub use session::lte::{EpsBearerSpec, LteSession};
pub use session::wifi::{WifiRole, WifiSession};
pub use session::{SessionCore, SessionOptions, SessionState};

/// OpenNet Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
