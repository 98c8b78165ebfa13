//! Provider bindings: the capability seam between the Gateway and a
//! specific LLM vendor's HTTP API.
//!
//! Adding a new provider is one factory registration here plus a pricing
//! catalog entry (`provider::pricing`) — the Gateway, Agent Runner and
//! Scheduler never match on provider id directly.
//!
//! Credentials never reach the Gateway as raw strings held in memory
//! longer than a single request: they arrive as per-request header
//! values, built the same way `with_tollbooth_auth` composes a header
//! pair onto a `reqwest::RequestBuilder`, and are attached immediately
//! before the request is sent.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// A resolved, opaque handle to a (provider, model) pair. The Gateway
/// only ever holds one of these — never a raw API key.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub api_key_header: String,
    pub proxy_url_header: String,
}

/// Per-provider binding: knows how to name its own headers and where its
/// API lives. Implementations hold no credentials; those are supplied
/// per-call by the caller (ultimately sourced from the inbound
/// `runOrchestration(..., apiKeys)` argument).
pub trait ProviderBinding: Send + Sync {
    /// Provider id as used in `agent_key`/model-id prefixes (e.g. "anthropic").
    fn provider_id(&self) -> &'static str;

    /// Default base URL for this provider's chat-completions endpoint.
    fn base_url(&self) -> &str;

    /// Header name carrying this provider's API key, e.g. `X-Api-Key-Anthropic`.
    fn api_key_header(&self) -> String {
        format!("X-Api-Key-{}", capitalize(self.provider_id()))
    }

    /// Header name carrying an optional proxy override URL for this provider.
    fn proxy_url_header(&self) -> String {
        format!("X-Proxy-Url-{}", capitalize(self.provider_id()))
    }

    fn resolve(&self, model: &str) -> ModelHandle {
        ModelHandle {
            provider: self.provider_id().to_string(),
            model: model.to_string(),
            base_url: self.base_url().to_string(),
            api_key_header: self.api_key_header(),
            proxy_url_header: self.proxy_url_header(),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

macro_rules! simple_binding {
    ($name:ident, $id:literal, $url:literal) => {
        struct $name;
        impl ProviderBinding for $name {
            fn provider_id(&self) -> &'static str {
                $id
            }
            fn base_url(&self) -> &str {
                $url
            }
        }
    };
}

simple_binding!(AnthropicBinding, "anthropic", "https://api.anthropic.com/v1/messages");
simple_binding!(OpenAiBinding, "openai", "https://api.openai.com/v1/chat/completions");
simple_binding!(
    GoogleBinding,
    "google",
    "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
);
simple_binding!(XaiBinding, "xai", "https://api.x.ai/v1/chat/completions");
simple_binding!(DeepseekBinding, "deepseek", "https://api.deepseek.com/chat/completions");
simple_binding!(MistralBinding, "mistral", "https://api.mistral.ai/v1/chat/completions");
simple_binding!(CerebrasBinding, "cerebras", "https://api.cerebras.ai/v1/chat/completions");

struct Factory {
    bindings: HashMap<&'static str, Box<dyn ProviderBinding>>,
}

static FACTORY: OnceLock<Factory> = OnceLock::new();

fn factory() -> &'static Factory {
    FACTORY.get_or_init(|| {
        let mut bindings: HashMap<&'static str, Box<dyn ProviderBinding>> = HashMap::new();
        bindings.insert("anthropic", Box::new(AnthropicBinding));
        bindings.insert("openai", Box::new(OpenAiBinding));
        bindings.insert("google", Box::new(GoogleBinding));
        bindings.insert("xai", Box::new(XaiBinding));
        bindings.insert("deepseek", Box::new(DeepseekBinding));
        bindings.insert("mistral", Box::new(MistralBinding));
        bindings.insert("cerebras", Box::new(CerebrasBinding));
        Factory { bindings }
    })
}

/// Resolve a `(provider, model)` pair into an opaque `ModelHandle`.
/// Fails with `NoProvider` if the provider id is unregistered.
pub fn provider(provider_id: &str, model: &str) -> Result<ModelHandle> {
    factory()
        .bindings
        .get(provider_id)
        .map(|binding| binding.resolve(model))
        .ok_or_else(|| Error::NoProvider(format!("{provider_id}/{model}")))
}

/// Credentials for one provider, supplied by the caller of
/// `runOrchestration` and never persisted by this crate.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub api_key: String,
    pub proxy_url: Option<String>,
}

/// Attach this provider's auth headers to a request builder, mirroring
/// `with_tollbooth_auth`'s header-injection style but keyed per provider
/// instead of a single shared secret.
pub fn with_provider_auth(
    builder: reqwest::RequestBuilder,
    handle: &ModelHandle,
    creds: &ProviderCredentials,
) -> reqwest::RequestBuilder {
    let mut builder = builder.header(&handle.api_key_header, &creds.api_key);
    if let Some(proxy_url) = &creds.proxy_url {
        builder = builder.header(&handle.proxy_url_header, proxy_url);
    }
    builder
}
