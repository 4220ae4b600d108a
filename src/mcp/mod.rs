//! Model Context Protocol (MCP) tool bridge.
//!
//! Every chat turn works from a fresh snapshot of the server registry:
//! it connects to each configured server, discovers its tools, merges them
//! with the built-in tools into one flat namespace, executes whatever the
//! model calls, and closes every session when the turn ends.
//!
//! # Configuration
//!
//! MCP servers are configured via `mcp.json`:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "time": {
//!       "command": "npx",
//!       "args": ["-y", "@mcpcentral/mcp-time"],
//!       "env": {}
//!     },
//!     "tavily": {
//!       "url": "https://mcp.tavily.com/mcp/?key=${TAVILY_API_KEY}"
//!     }
//!   }
//! }
//! ```
//!
//! # Tool Naming
//!
//! Tools are exposed under their own names with no server prefix. When two
//! sources offer the same name, the source merged last wins: built-ins
//! first, then servers in name order.

pub mod aggregator;
pub mod bridge;
pub mod config;
pub mod session;
pub mod store;
