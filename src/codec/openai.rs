//! OpenAI-compatible dialect.
//!
//! The canonical model already is the OpenAI chat-completions shape, so
//! encoding and decoding are plain (de)serialization. Unknown fields travel
//! through the `extra` maps untouched.

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;

use super::canonical::{CanonicalRequest, CanonicalResponse};
use super::{join_url, truncate, Dialect, Endpoint, ProtocolCodec, UpstreamError};
use crate::error::{GatewayError, Result};
use crate::routing::ProviderDescriptor;

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiCodec;

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(rename = "type", default)]
    error_type: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl ProtocolCodec for OpenAiCodec {
    fn dialect(&self) -> Dialect {
        Dialect::OpenAi
    }

    fn upstream_path(&self, endpoint: Endpoint) -> &'static str {
        endpoint.path()
    }

    fn encode(&self, req: &CanonicalRequest) -> Result<Bytes> {
        serde_json::to_vec(req)
            .map(Bytes::from)
            .map_err(|e| GatewayError::encode(e.to_string()))
    }

    fn decode_request(&self, body: &[u8]) -> Result<CanonicalRequest> {
        serde_json::from_slice(body).map_err(|e| GatewayError::translation(e.to_string()))
    }

    fn decode(&self, body: &[u8]) -> Result<CanonicalResponse> {
        serde_json::from_slice(body).map_err(|e| {
            GatewayError::translation(format!(
                "{e}. Body: {}",
                truncate(&String::from_utf8_lossy(body), 300)
            ))
        })
    }

    fn decode_error(&self, status: StatusCode, body: &[u8]) -> UpstreamError {
        let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(body) else {
            return UpstreamError::generic(status, body);
        };

        // Some OpenAI-compatible servers leave `type` empty and only fill `code`.
        let kind = envelope
            .error
            .error_type
            .filter(|t| !t.is_empty())
            .or_else(|| match envelope.error.code {
                Some(serde_json::Value::String(code)) if !code.is_empty() => Some(code),
                _ => None,
            })
            .unwrap_or_else(|| "upstream_error".to_string());

        UpstreamError::new(kind, envelope.error.message)
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        provider: &ProviderDescriptor,
        path: &str,
        payload: Bytes,
    ) -> Result<reqwest::Request> {
        let mut builder = client
            .post(join_url(&provider.base_url, path))
            .header(CONTENT_TYPE, "application/json")
            .timeout(provider.timeout)
            .body(payload);

        if let Some(ref key) = provider.credential {
            builder = builder.header(AUTHORIZATION, format!("Bearer {key}"));
        }

        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::canonical::{ChatMessage, GenerationParams, StopSequences};
    use serde_json::json;
    use std::time::Duration;

    fn sample_request() -> CanonicalRequest {
        CanonicalRequest {
            model: "gpt-4".to_string(),
            messages: vec![
                ChatMessage::text("system", "Be brief."),
                ChatMessage::text("user", "Hello"),
            ],
            stream: true,
            params: GenerationParams {
                temperature: Some(0.7),
                max_tokens: Some(64),
                stop: Some(StopSequences::One("END".to_string())),
                ..GenerationParams::default()
            },
        }
    }

    fn provider(credential: Option<&str>) -> ProviderDescriptor {
        ProviderDescriptor {
            name: "openai-prod".to_string(),
            base_url: "https://api.openai.com".to_string(),
            credential: credential.map(str::to_string),
            timeout: Duration::from_secs(30),
            dialect: Dialect::OpenAi,
        }
    }

    #[test]
    fn test_encode_then_decode_request_is_lossless() {
        let req = sample_request();
        let payload = OpenAiCodec.encode(&req).unwrap();
        let back = OpenAiCodec.decode_request(&payload).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_encode_preserves_canonical_shape() {
        let payload = OpenAiCodec.encode(&sample_request()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["model"], "gpt-4");
        assert_eq!(value["stream"], true);
        assert_eq!(value["messages"][1]["content"], "Hello");
        assert_eq!(value["stop"], "END");
    }

    #[test]
    fn test_decode_response() {
        let body = json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "gpt-4",
            "system_fingerprint": "fp_1",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hi!"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        });

        let resp = OpenAiCodec
            .decode(&serde_json::to_vec(&body).unwrap())
            .unwrap();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("Hi!"));
        assert_eq!(resp.usage.as_ref().unwrap().total_tokens, 5);
        assert_eq!(resp.extra["system_fingerprint"], "fp_1");
        assert_eq!(serde_json::to_value(&resp).unwrap(), body);
    }

    #[test]
    fn test_decode_rejects_malformed_body() {
        let err = OpenAiCodec.decode(b"not json").unwrap_err();
        assert!(matches!(err, GatewayError::Translation { .. }));

        let err = OpenAiCodec.decode(br#"{"choices": "nope"}"#).unwrap_err();
        assert!(matches!(err, GatewayError::Translation { .. }));
    }

    #[test]
    fn test_decode_error_envelope() {
        let body = br#"{"error":{"message":"Rate limit reached","type":"requests","code":"rate_limit_exceeded"}}"#;
        let err = OpenAiCodec.decode_error(StatusCode::TOO_MANY_REQUESTS, body);
        assert_eq!(err.kind, "requests");
        assert_eq!(err.message, "Rate limit reached");
        assert_eq!(err.to_string(), "requests: Rate limit reached");
    }

    #[test]
    fn test_decode_error_falls_back_to_code() {
        let body = br#"{"error":{"message":"bad key","type":"","code":"invalid_api_key"}}"#;
        let err = OpenAiCodec.decode_error(StatusCode::UNAUTHORIZED, body);
        assert_eq!(err.kind, "invalid_api_key");
    }

    #[test]
    fn test_decode_error_never_fails() {
        let err = OpenAiCodec.decode_error(StatusCode::BAD_REQUEST, b"gateway exploded");
        assert_eq!(err.kind, "upstream_error");
        assert!(err.message.contains("400"));
        assert!(err.message.contains("gateway exploded"));
    }

    #[test]
    fn test_build_request_uses_bearer_auth() {
        let client = reqwest::Client::new();
        let req = OpenAiCodec
            .build_request(
                &client,
                &provider(Some("sk-test")),
                "/v1/chat/completions",
                Bytes::from_static(b"{}"),
            )
            .unwrap();

        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(
            req.url().as_str(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(req.headers()[AUTHORIZATION], "Bearer sk-test");
        assert_eq!(req.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(req.timeout(), Some(&Duration::from_secs(30)));
    }

    #[test]
    fn test_build_request_without_credential() {
        let client = reqwest::Client::new();
        let req = OpenAiCodec
            .build_request(&client, &provider(None), "/responses", Bytes::new())
            .unwrap();
        assert!(req.headers().get(AUTHORIZATION).is_none());
        assert_eq!(req.url().path(), "/responses");
    }

    #[test]
    fn test_decode_keeps_choice_and_message_fields() {
        let body = json!({
            "id": "chatcmpl-2",
            "object": "chat.completion",
            "created": 1_741_570_283,
            "model": "gpt-4o-2024-08-06",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "hi",
                    "refusal": null,
                    "annotations": []
                },
                "logprobs": null,
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        });

        let resp = OpenAiCodec
            .decode(&serde_json::to_vec(&body).unwrap())
            .unwrap();
        assert_eq!(serde_json::to_value(&resp).unwrap(), body);
    }

    #[test]
    fn test_streams_pass_through_untouched() {
        assert!(OpenAiCodec.stream_translator().is_none());
    }
}
