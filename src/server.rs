use crate::codec::canonical::CanonicalRequest;
use crate::codec::{CodecRegistry, Endpoint, StreamTranslator};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::forwarder::Forwarder;
use crate::relay::{event_stream_response, relay, translate_events, ChannelSink};
use crate::routing::RoutingTable;

use axum::body::Body;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use uuid::Uuid;

/// Frames buffered between the relay task and the response body.
const RELAY_CHANNEL_CAPACITY: usize = 16;

/// One independently configured gateway: its routes, codecs and forwarder.
///
/// Nothing is global, so several gateways can serve from one process.
#[derive(Debug)]
pub struct Gateway {
    routes: RoutingTable,
    codecs: CodecRegistry,
    forwarder: Forwarder,
    body_limit: Option<usize>,
}

impl Gateway {
    /// Codecs are chosen from each provider's dialect.
    pub fn new(routes: RoutingTable, forwarder: Forwarder) -> Self {
        let codecs = CodecRegistry::for_providers(routes.providers());
        Self {
            routes,
            codecs,
            forwarder,
            body_limit: None,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let routes = RoutingTable::from_config(config)?;
        let forwarder = Forwarder::from_config(&config.retry)?;
        Ok(Self::new(routes, forwarder).with_body_limit(config.server.max_body_bytes))
    }

    /// Cap inbound bodies at `limit` bytes. `None` lifts the cap.
    #[must_use]
    pub fn with_body_limit(mut self, limit: Option<usize>) -> Self {
        self.body_limit = limit;
        self
    }

    #[must_use]
    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn router(self: Arc<Self>) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        let body_limit = match self.body_limit {
            Some(limit) => DefaultBodyLimit::max(limit),
            None => DefaultBodyLimit::disable(),
        };

        Router::new()
            .route("/v1/chat/completions", post(handle_chat_completions))
            .route("/responses", post(handle_responses))
            .route("/health", get(handle_health))
            .route("/v1/models", get(handle_models))
            .layer(body_limit)
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    /// Serve one inbound request. Never fails: every error becomes a JSON
    /// error response.
    pub async fn handle(&self, endpoint: Endpoint, body: Bytes) -> Response {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("request", %request_id, endpoint = endpoint.path());

        // Dropping the handler (caller gone) cancels any in-flight forward.
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();

        async {
            match self.process(endpoint, &body, &cancel).await {
                Ok(response) => response,
                Err(e) => e.into_response(),
            }
        }
        .instrument(span)
        .await
    }

    async fn process(
        &self,
        endpoint: Endpoint,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let request: CanonicalRequest = serde_json::from_slice(body)
            .map_err(|e| GatewayError::invalid_request(e.to_string()))?;

        let provider_name =
            self.routes
                .resolve_provider(&request.model)
                .ok_or_else(|| GatewayError::ModelNotFound {
                    model: request.model.clone(),
                })?;
        let provider = self.routes.resolve_descriptor(provider_name).ok_or_else(|| {
            GatewayError::ProviderNotFound {
                provider: provider_name.to_string(),
            }
        })?;
        let codec = self.codecs.codec_for(&provider.name).ok_or_else(|| {
            GatewayError::internal(format!("no codec registered for provider '{}'", provider.name))
        })?;

        tracing::info!(
            model = %request.model,
            provider = %provider.name,
            dialect = %codec.dialect(),
            stream = request.stream,
            messages = request.messages.len(),
            "Routing request"
        );

        let payload = codec.encode(&request)?;
        tracing::trace!(body = %String::from_utf8_lossy(&payload), "Upstream payload");
        let outbound = codec.build_request(
            self.forwarder.client(),
            provider,
            codec.upstream_path(endpoint),
            payload,
        )?;

        let upstream = self.forwarder.execute(cancel, outbound).await?;
        let status = upstream.status();

        if !status.is_success() {
            let error_body = upstream
                .bytes()
                .await
                .map_err(|e| GatewayError::upstream_read(e.to_string()))?;
            let err = codec.decode_error(status, &error_body);
            tracing::debug!(status = status.as_u16(), error = %err, "Upstream rejected request");
            return Err(err.into_gateway_error(status));
        }

        if request.stream {
            return Ok(stream_response(upstream, codec.stream_translator()));
        }

        let upstream_body = upstream
            .bytes()
            .await
            .map_err(|e| GatewayError::upstream_read(e.to_string()))?;
        let decoded = codec.decode(&upstream_body)?;
        let out = serde_json::to_vec(&decoded).map_err(|e| GatewayError::encode(e.to_string()))?;

        tracing::debug!(status = status.as_u16(), bytes = out.len(), "Request complete");

        Ok(Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(out))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
    }
}

/// Hand the live upstream body to a relay task and answer with the
/// receiving end. The task inherits the request span.
fn stream_response(
    upstream: reqwest::Response,
    translator: Option<Box<dyn StreamTranslator>>,
) -> Response {
    let status = upstream.status();
    let (mut sink, frames) = ChannelSink::channel(RELAY_CHANNEL_CAPACITY);
    let watch = sink.disconnect_watch();

    tokio::spawn(
        async move {
            let result = tokio::select! {
                result = pump(&mut sink, upstream, translator) => result,
                () = watch.wait() => Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "client disconnected",
                )),
            };

            match result {
                Ok(bytes) => tracing::info!(bytes, "Stream relay complete"),
                Err(e) => {
                    tracing::warn!(error = %e, "Stream relay aborted");
                    sink.abort(e).await;
                }
            }
        }
        .in_current_span(),
    );

    event_stream_response(status, Body::from_stream(frames))
}

async fn pump(
    sink: &mut ChannelSink,
    upstream: reqwest::Response,
    translator: Option<Box<dyn StreamTranslator>>,
) -> io::Result<u64> {
    match translator {
        Some(translator) => {
            relay(sink, translate_events(upstream.bytes_stream(), translator)).await
        }
        None => relay(sink, upstream.bytes_stream()).await,
    }
}

async fn handle_chat_completions(
    State(gateway): State<Arc<Gateway>>,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    serve(&gateway, Endpoint::ChatCompletions, body).await
}

async fn handle_responses(
    State(gateway): State<Arc<Gateway>>,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    serve(&gateway, Endpoint::Responses, body).await
}

async fn serve(
    gateway: &Gateway,
    endpoint: Endpoint,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    match body {
        Ok(body) => gateway.handle(endpoint, body).await,
        Err(rejection) => GatewayError::from(rejection).into_response(),
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_models(State(gateway): State<Arc<Gateway>>) -> Json<serde_json::Value> {
    let models: Vec<serde_json::Value> = gateway
        .routes
        .models()
        .into_iter()
        .map(|(model, provider)| {
            serde_json::json!({
                "id": model,
                "object": "model",
                "owned_by": provider,
            })
        })
        .collect();

    Json(serde_json::json!({ "data": models, "object": "list" }))
}
