use crate::llm::{LlmSettings, Provider};
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_STEPS: u64 = 5;
const DEFAULT_TURN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_COMPARISON_DELAY_MS: u64 = 3000;
const DEFAULT_REGISTRY_PATH: &str = "mcp.json";

const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_LLM_MODEL: &str = "gpt-4o";
const DEFAULT_AZURE_API_VERSION: &str = "2024-08-01-preview";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Address to bind
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Path of the MCP server registry file
    #[arg(long, env = "MCP_REGISTRY")]
    pub registry: Option<String>,

    /// Maximum model/tool round-trips per chat turn
    #[arg(long, env = "MAX_STEPS")]
    pub max_steps: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub chat: ChatConfig,
    pub mcp: McpSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// Bound on producing a response head; streamed bodies are bounded by the turn timeout.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    pub max_steps: usize,
    pub turn_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub comparison_delay_ms: u64,
    pub chart_tool: bool,
    pub system_prompt: String,
}

impl ChatConfig {
    #[must_use]
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS as usize,
            turn_timeout_secs: DEFAULT_TURN_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            comparison_delay_ms: DEFAULT_COMPARISON_DELAY_MS,
            chart_tool: false,
            system_prompt: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct McpSettings {
    pub registry_path: String,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            registry_path: DEFAULT_REGISTRY_PATH.to_string(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    /// Precedence, lowest first: defaults, config file, `MCPCHAT_*` env, CLI flags.
    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder()
            .set_default("server.port", i64::from(DEFAULT_PORT))?
            .set_default("server.host", DEFAULT_HOST)?
            .set_default("server.request_timeout_secs", DEFAULT_REQUEST_TIMEOUT_SECS)?
            .set_default("chat.max_steps", DEFAULT_MAX_STEPS)?
            .set_default("chat.turn_timeout_secs", DEFAULT_TURN_TIMEOUT_SECS)?
            .set_default("chat.connect_timeout_secs", DEFAULT_CONNECT_TIMEOUT_SECS)?
            .set_default("chat.comparison_delay_ms", DEFAULT_COMPARISON_DELAY_MS)?
            .set_default("chat.chart_tool", false)?
            .set_default("chat.system_prompt", "")?
            .set_default("mcp.registry_path", DEFAULT_REGISTRY_PATH)?;

        // An explicit file must exist; ./config.{yaml,toml,json} is optional.
        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder.add_source(File::with_name("config").required(false)),
        };

        // E.g. MCPCHAT_SERVER__PORT=8000, MCPCHAT_CHAT__MAX_STEPS=3
        builder = builder.add_source(
            Environment::with_prefix("MCPCHAT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // clap has already folded in the flags' own env vars (PORT, HOST, ...).
        if let Some(host) = cli.host {
            builder = builder.set_override("server.host", host)?;
        }
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", i64::from(port))?;
        }
        if let Some(registry) = cli.registry {
            builder = builder.set_override("mcp.registry_path", registry)?;
        }
        if let Some(max_steps) = cli.max_steps {
            builder = builder.set_override("chat.max_steps", i64::from(max_steps))?;
        }

        let cfg: Self = builder.build()?.try_deserialize()?;
        if cfg.chat.max_steps == 0 {
            return Err(config::ConfigError::Message(
                "chat.max_steps must be at least 1".to_string(),
            ));
        }
        Ok(cfg)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

pub fn load_llm_settings() -> Result<LlmSettings, String> {
    let base_url = non_empty_env("LLM_BASE_URL").unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string());
    let model = non_empty_env("LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string());
    let api_key = non_empty_env("LLM_API_KEY").or_else(|| non_empty_env("OPENAI_API_KEY"));

    // Auto-detect provider from base URL
    let mut provider = Provider::detect_from_url(&base_url);

    if let Provider::AzureOpenAI { .. } = &provider {
        let deployment_name = non_empty_env("AZURE_DEPLOYMENT_NAME").ok_or_else(|| {
            "AZURE_DEPLOYMENT_NAME is required for Azure OpenAI endpoints".to_string()
        })?;
        provider = Provider::AzureOpenAI {
            deployment_name,
            api_version: non_empty_env("AZURE_API_VERSION")
                .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
        };
    }

    let parallel_tool_calls = match non_empty_env("LLM_PARALLEL_TOOLS") {
        Some(raw) => Some(
            raw.parse::<bool>()
                .map_err(|e| format!("LLM_PARALLEL_TOOLS='{raw}': {e}"))?,
        ),
        None => None,
    };

    Ok(LlmSettings {
        base_url,
        api_key,
        model,
        provider,
        parallel_tool_calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_struct_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.chat.max_steps, 5);
        assert_eq!(cfg.chat.turn_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.chat.comparison_delay_ms, 3000);
        assert_eq!(cfg.mcp.registry_path, "mcp.json");
    }

    #[test]
    fn test_cli_rejects_unknown_flag() {
        let err = AppConfig::load_from_args(["mcp-chat", "--bogus"]).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }
}
