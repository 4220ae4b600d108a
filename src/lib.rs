//! MCP chat bridge
//!
//! A streaming chat backend that lets an LLM call tools from any number of
//! Model Context Protocol servers alongside a few built-in tools.
//!
//! # Architecture
//!
//! - **Server**: Axum HTTP surface with SSE streaming of turns
//! - **LLM Orchestration**: OpenAI-compatible streaming driver and a bounded
//!   multi-step turn driver
//! - **MCP Client**: per-turn sessions over stdio or streamable HTTP, merged
//!   into one flat tool namespace
//!
//! # Modules
//!
//! - [`mcp`]: registry, connector, aggregator and execution bridge
//! - [`llm`]: LLM driver trait, Chat Completions driver, turn orchestrator
//! - [`normalized`]: Unified streaming event model
//! - [`tools`]: Built-in tools
//! - [`server`]: HTTP routes

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod error;
pub mod llm;
pub mod mcp;
pub mod normalized;
pub mod server;
pub mod telemetry;
pub mod testing;
pub mod tools;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::llm::Orchestrator;
use crate::mcp::store::ServerRegistry;

/// Application state shared across all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server registry read by every turn and written by `/api/mcp`.
    pub registry: Arc<dyn ServerRegistry>,
    /// LLM orchestrator for chat turns.
    pub orchestrator: Arc<Orchestrator>,
    /// Global Configuration
    pub config: Arc<AppConfig>,
    /// Cancelled on shutdown; every turn runs under a child token.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// State sharing the orchestrator's registry.
    pub fn new(orchestrator: Arc<Orchestrator>, config: Arc<AppConfig>) -> Self {
        Self {
            registry: Arc::clone(orchestrator.registry()),
            orchestrator,
            config,
            shutdown: CancellationToken::new(),
        }
    }
}
