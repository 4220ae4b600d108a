//! Error taxonomy for the tool bridge.
//!
//! Every variant names the server or tool it concerns so that failures can be
//! logged per source without losing context. Only [`BridgeError::Config`] and
//! [`BridgeError::Storage`] ever reach an HTTP caller directly; the rest are
//! absorbed by the turn (logged, or handed to the model as a tool result).

use thiserror::Error;

/// Errors raised by the registry, connector, aggregator and execution bridge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// A server descriptor is malformed or missing required fields.
    #[error("invalid configuration for MCP server '{server}': {reason}")]
    Config {
        /// Registry key of the offending descriptor.
        server: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The server process could not be spawned or the endpoint was unreachable.
    #[error("failed to connect to MCP server '{server}': {reason}")]
    Connection {
        /// Registry key of the server.
        server: String,
        /// Underlying transport or handshake failure.
        reason: String,
    },

    /// A session was opened but listing its tools failed.
    #[error("tools/list failed for MCP server '{server}': {reason}")]
    Discovery {
        /// Registry key of the server.
        server: String,
        /// Underlying protocol failure.
        reason: String,
    },

    /// A specific tool call failed on the local or remote side.
    #[error("tool '{tool}' failed: {reason}")]
    Invocation {
        /// Namespaced tool name as seen by the model.
        tool: String,
        /// Failure detail surfaced to the model.
        reason: String,
    },

    /// The step cap was reached while the model still requested tools.
    #[error("step budget of {max_steps} exhausted without a final answer")]
    BudgetExceeded {
        /// Configured maximum number of model/tool round-trips.
        max_steps: usize,
    },

    /// The registry backing store could not be read or written.
    #[error("server registry storage error: {0}")]
    Storage(String),
}

impl BridgeError {
    /// Short machine-readable kind, used in structured tool failures.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Connection { .. } => "connection",
            Self::Discovery { .. } => "discovery",
            Self::Invocation { .. } => "invocation",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::Storage(_) => "storage",
        }
    }

    pub(crate) fn config(server: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            server: server.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invocation(tool: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Invocation {
            tool: tool.into(),
            reason: reason.to_string(),
        }
    }
}
