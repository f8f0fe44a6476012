use thiserror::Error;

/// OpenNet error types
#[derive(Error, Debug)]
pub enum NetError {
    /// The simulation agent never accepted a connection
    #[error("Agent connect failed: {address} after {attempts} attempts - {message}")]
    Connect {
        address: String,
        attempts: u32,
        message: String,
    },

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A wait was cancelled by its caller
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The agent replied with something that is not a protocol sentinel
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Send or receive on a channel that was already closed
    #[error("Command channel is closed")]
    ChannelClosed,

    /// A statement references a remote object that no earlier statement created
    #[error("Undefined reference: '{name}' in statement: {statement}")]
    UndefinedReference { name: String, statement: String },

    /// Setup / per-node statement ordering violation
    #[error("Sequence error: {0}")]
    Sequence(String),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Second migration attempt on an endpoint
    #[error("Endpoint {0} has already been migrated")]
    AlreadyMigrated(String),

    /// A migration step failed; earlier steps were rolled back
    #[error("Migration of {endpoint} failed at step '{step}': {message}")]
    Migration {
        endpoint: String,
        step: String,
        message: String,
    },

    /// A migration step failed and the rollback failed too
    #[error("Endpoint {endpoint} left inconsistent: {message}")]
    Inconsistent { endpoint: String, message: String },

    /// Host shell-out exited non-zero
    #[error("Command failed on {host}: `{command}` - {stderr}")]
    Command {
        host: String,
        command: String,
        stderr: String,
    },

    /// No addresses left in the UE subnet
    #[error("Address pool exhausted: {0}")]
    AddressExhausted(String),

    /// A statement parameter cannot be rendered as a remote literal
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for NetError {
    fn from(err: serde_json::Error) -> Self {
        NetError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for NetError {
    fn from(err: serde_yaml::Error) -> Self {
        NetError::Serialization(err.to_string())
    }
}

/// Result type alias for OpenNet operations
pub type Result<T> = std::result::Result<T, NetError>;
