//! Protocol codecs: translation between the canonical model and each
//! provider dialect's wire format.
//!
//! A [`ProtocolCodec`] owns everything dialect-specific about one upstream
//! call: the payload shape in both directions, the error envelope, the
//! upstream path and the authentication convention. The gateway picks a
//! codec per provider through the [`CodecRegistry`].

pub mod anthropic;
pub mod anthropic_stream;
pub mod anthropic_types;
pub mod canonical;
pub mod openai;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::routing::ProviderDescriptor;
use canonical::{CanonicalRequest, CanonicalResponse};

pub use anthropic::AnthropicCodec;
pub use anthropic_stream::MessagesStreamTranslator;
pub use openai::OpenAiCodec;

/// Longest upstream body excerpt carried in a generic error message.
pub(crate) const ERROR_EXCERPT_LEN: usize = 500;

/// Wire protocol family spoken by an upstream provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Dialect::OpenAi),
            "anthropic" => Ok(Dialect::Anthropic),
            other => Err(GatewayError::config(format!(
                "unknown dialect '{other}' (expected 'openai' or 'anthropic')"
            ))),
        }
    }
}

/// Inbound gateway endpoint a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    ChatCompletions,
    Responses,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::ChatCompletions => "/v1/chat/completions",
            Endpoint::Responses => "/responses",
        }
    }
}

/// Structured error reported by an upstream in a non-success response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    pub kind: String,
    pub message: String,
}

impl UpstreamError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Fallback when the error body is not in the dialect's envelope.
    pub fn generic(status: StatusCode, body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        let excerpt = truncate(text.trim(), ERROR_EXCERPT_LEN);
        let message = if excerpt.is_empty() {
            format!("upstream returned status {}", status.as_u16())
        } else {
            format!("upstream returned status {}: {excerpt}", status.as_u16())
        };
        Self::new("upstream_error", message)
    }

    pub fn into_gateway_error(self, status: StatusCode) -> GatewayError {
        GatewayError::Upstream {
            status: status.as_u16(),
            kind: self.kind,
            message: self.message,
        }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Translator between the canonical model and one provider dialect.
pub trait ProtocolCodec: Send + Sync + fmt::Debug {
    fn dialect(&self) -> Dialect;

    /// Upstream path serving the given gateway endpoint.
    fn upstream_path(&self, endpoint: Endpoint) -> &'static str;

    /// Serialize a canonical request into the dialect's payload.
    fn encode(&self, req: &CanonicalRequest) -> Result<Bytes>;

    /// Parse a dialect payload back into a canonical request.
    fn decode_request(&self, body: &[u8]) -> Result<CanonicalRequest>;

    /// Parse a successful upstream body into a canonical response.
    fn decode(&self, body: &[u8]) -> Result<CanonicalResponse>;

    /// Extract the upstream's error from a non-success body. Never fails.
    fn decode_error(&self, status: StatusCode, body: &[u8]) -> UpstreamError;

    /// Build the outbound request, attaching the dialect's credentials.
    fn build_request(
        &self,
        client: &reqwest::Client,
        provider: &ProviderDescriptor,
        path: &str,
        payload: Bytes,
    ) -> Result<reqwest::Request>;

    /// Rewriter for a streamed upstream body. `None` relays the bytes as
    /// they arrive.
    fn stream_translator(&self) -> Option<Box<dyn StreamTranslator>> {
        None
    }
}

/// Turns a dialect's server-sent events into canonical
/// `chat.completion.chunk` events, one upstream event at a time.
pub trait StreamTranslator: Send {
    /// SSE frames to send for the payload of one upstream `data:` line.
    fn on_event(&mut self, data: &str) -> Vec<Bytes>;

    /// Frames to send once the upstream body has ended cleanly.
    fn finish(&mut self) -> Vec<Bytes>;
}

/// Codec for a dialect.
pub fn codec_for_dialect(dialect: Dialect) -> Arc<dyn ProtocolCodec> {
    match dialect {
        Dialect::OpenAi => Arc::new(OpenAiCodec),
        Dialect::Anthropic => Arc::new(AnthropicCodec::default()),
    }
}

/// Provider name → codec.
#[derive(Debug, Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn ProtocolCodec>>,
}

impl CodecRegistry {
    /// One codec per provider, chosen by the provider's dialect.
    pub fn for_providers(providers: &[ProviderDescriptor]) -> Self {
        let mut registry = Self::default();
        for provider in providers {
            registry.register(&provider.name, codec_for_dialect(provider.dialect));
        }
        registry
    }

    /// Install (or replace) the codec used for a provider.
    pub fn register(&mut self, provider: impl Into<String>, codec: Arc<dyn ProtocolCodec>) {
        self.codecs.insert(provider.into(), codec);
    }

    pub fn codec_for(&self, provider: &str) -> Option<Arc<dyn ProtocolCodec>> {
        self.codecs.get(provider).cloned()
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

/// `{base_url}{path}` without doubling the slash between them.
pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn provider(name: &str, dialect: Dialect) -> ProviderDescriptor {
        ProviderDescriptor {
            name: name.to_string(),
            base_url: "http://localhost:9999".to_string(),
            credential: None,
            timeout: Duration::from_secs(5),
            dialect,
        }
    }

    #[test]
    fn test_registry_follows_provider_dialect() {
        let registry = CodecRegistry::for_providers(&[
            provider("openai-prod", Dialect::OpenAi),
            provider("claude", Dialect::Anthropic),
        ]);

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.codec_for("openai-prod").unwrap().dialect(),
            Dialect::OpenAi
        );
        assert_eq!(
            registry.codec_for("claude").unwrap().dialect(),
            Dialect::Anthropic
        );
        assert!(registry.codec_for("missing").is_none());
    }

    #[test]
    fn test_register_overrides_codec() {
        let mut registry = CodecRegistry::for_providers(&[provider("p", Dialect::OpenAi)]);
        registry.register("p", codec_for_dialect(Dialect::Anthropic));
        assert_eq!(registry.codec_for("p").unwrap().dialect(), Dialect::Anthropic);
    }

    #[test]
    fn test_dialect_parsing() {
        assert_eq!("OpenAI".parse::<Dialect>().unwrap(), Dialect::OpenAi);
        assert_eq!("anthropic".parse::<Dialect>().unwrap(), Dialect::Anthropic);
        assert!("gemini".parse::<Dialect>().is_err());
    }

    #[test]
    fn test_generic_upstream_error_keeps_excerpt() {
        let err = UpstreamError::generic(StatusCode::BAD_GATEWAY, b"<html>oops</html>");
        assert_eq!(err.kind, "upstream_error");
        assert_eq!(err.message, "upstream returned status 502: <html>oops</html>");

        let empty = UpstreamError::generic(StatusCode::NOT_FOUND, b"");
        assert_eq!(empty.message, "upstream returned status 404");
    }

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("https://api.openai.com/", "/v1/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(join_url("http://h:1", "/responses"), "http://h:1/responses");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
