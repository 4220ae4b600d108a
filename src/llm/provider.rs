//! Provider detection for OpenAI-compatible endpoints.
//!
//! Providers differ in URL layout, auth header and a few request options;
//! the request/response body is the same Chat Completions shape everywhere.

/// Supported LLM providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    /// `OpenAI` (api.openai.com)
    OpenAI,
    /// Azure `OpenAI` Service
    AzureOpenAI {
        /// Deployment name; Azure routes by deployment, not model.
        deployment_name: String,
        /// API version (e.g., "2024-08-01-preview")
        api_version: String,
    },
    /// `OpenRouter` (openrouter.ai)
    OpenRouter,
    /// Together AI (together.ai, together.xyz)
    TogetherAI,
    /// Groq (groq.com)
    Groq,
    /// Generic OpenAI-compatible provider
    Generic,
}

impl Provider {
    /// Detect provider from base URL.
    ///
    /// ```rust
    /// use mcp_chat::llm::Provider;
    ///
    /// assert_eq!(Provider::detect_from_url("https://api.openai.com"), Provider::OpenAI);
    /// ```
    #[must_use]
    pub fn detect_from_url(base_url: &str) -> Self {
        let host = url::Url::parse(base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase))
            .unwrap_or_else(|| base_url.to_lowercase());

        if host.ends_with("azure.com") {
            Self::AzureOpenAI {
                deployment_name: String::new(),
                api_version: "2024-08-01-preview".to_string(),
            }
        } else if host.ends_with("openrouter.ai") {
            Self::OpenRouter
        } else if host.ends_with("together.ai") || host.ends_with("together.xyz") {
            Self::TogetherAI
        } else if host.ends_with("groq.com") {
            Self::Groq
        } else if host.ends_with("openai.com") {
            Self::OpenAI
        } else {
            Self::Generic
        }
    }

    /// Whether `parallel_tool_calls` may be sent. Generic endpoints often reject unknown fields.
    #[must_use]
    pub fn supports_parallel_tools(&self) -> bool {
        !matches!(self, Self::Generic)
    }

    /// Build the chat completions URL for this provider.
    #[must_use]
    pub fn build_chat_url(&self, base_url: &str, _model: &str) -> String {
        let base = base_url.trim_end_matches('/');

        match self {
            Self::AzureOpenAI {
                deployment_name,
                api_version,
            } => format!(
                "{base}/openai/deployments/{deployment_name}/chat/completions?api-version={api_version}"
            ),
            // Tolerate base URLs that already carry the version segment.
            _ if base.ends_with("/v1") => format!("{base}/chat/completions"),
            _ => format!("{base}/v1/chat/completions"),
        }
    }
}
