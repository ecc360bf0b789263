//! Anthropic Messages dialect.
//!
//! Unlike the OpenAI dialect this one remaps the payload in both directions:
//! system messages move into the top-level `system` field, tool calls become
//! `tool_use` blocks, `tool` messages become `tool_result` blocks inside a
//! user turn, and consecutive messages of the same role are merged because
//! the Messages API requires strictly alternating turns.

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::{Map, Value};

use super::anthropic_types::{
    ContentBlock, ErrorResponse, ImageSource, Message, MessageContent, MessagesRequest,
    MessagesResponse, Metadata, ResponseContentBlock, Role, SystemContent, Tool, ToolChoice,
    ToolChoiceMode, ToolChoiceSpecific, ToolResultContent,
};
use super::canonical::{
    CanonicalRequest, CanonicalResponse, ChatContent, ChatMessage, ChatTool, ChatToolChoice,
    Choice, ContentPart, FunctionDef, GenerationParams, ImageUrl, NamedFunction,
    NamedToolChoice, ResponseMessage, StopSequences, ToolCall, Usage,
};
use super::{
    join_url, truncate, Dialect, Endpoint, MessagesStreamTranslator, ProtocolCodec,
    StreamTranslator, UpstreamError,
};
use crate::error::{GatewayError, Result};
use crate::routing::ProviderDescriptor;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
const MESSAGES_PATH: &str = "/v1/messages";

/// `max_tokens` is mandatory for the Messages API.
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

#[derive(Debug, Clone)]
pub struct AnthropicCodec {
    default_max_tokens: u64,
}

impl Default for AnthropicCodec {
    fn default() -> Self {
        Self {
            default_max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl AnthropicCodec {
    #[must_use]
    pub fn with_default_max_tokens(default_max_tokens: u64) -> Self {
        Self { default_max_tokens }
    }

    /// Canonical request → Messages API request.
    pub fn to_messages_request(&self, req: &CanonicalRequest) -> MessagesRequest {
        let mut system_parts: Vec<String> = Vec::new();
        let mut turns: Vec<(Role, Vec<ContentBlock>)> = Vec::new();

        for msg in &req.messages {
            match msg.role.as_str() {
                "system" | "developer" => {
                    if let Some(ref content) = msg.content {
                        system_parts.push(content.as_text());
                    }
                }
                "assistant" => push_turn(&mut turns, Role::Assistant, assistant_blocks(msg)),
                "tool" => push_turn(&mut turns, Role::User, vec![tool_result_block(msg)]),
                _ => push_turn(&mut turns, Role::User, user_blocks(msg)),
            }
        }

        let messages = turns
            .into_iter()
            .map(|(role, blocks)| Message {
                role,
                content: collapse_blocks(blocks),
            })
            .collect();

        let params = &req.params;

        let tools = params.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| Tool {
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    input_schema: t.function.parameters.clone(),
                })
                .collect()
        });

        MessagesRequest {
            model: req.model.clone(),
            max_tokens: params.max_tokens.unwrap_or(self.default_max_tokens),
            messages,
            system: (!system_parts.is_empty())
                .then(|| SystemContent::Text(system_parts.join("\n"))),
            stream: req.stream.then_some(true),
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.extra.get("top_k").and_then(Value::as_u64),
            tools,
            tool_choice: params.tool_choice.as_ref().map(to_anthropic_tool_choice),
            metadata: params.user.as_ref().map(|user| Metadata {
                user_id: Some(user.clone()),
            }),
            stop_sequences: params.stop.as_ref().map(StopSequences::to_vec),
        }
    }

    /// Messages API request → canonical request.
    pub fn from_messages_request(&self, req: &MessagesRequest) -> CanonicalRequest {
        let mut messages = Vec::new();

        if let Some(ref system) = req.system {
            messages.push(ChatMessage::text("system", system.as_text()));
        }

        for msg in &req.messages {
            let blocks = msg.content.blocks();
            let mut translated = match msg.role {
                Role::User => translate_user_turn(&blocks),
                Role::Assistant => translate_assistant_turn(&blocks),
            };
            messages.append(&mut translated);
        }

        let tools = req.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| ChatTool {
                    tool_type: "function".to_string(),
                    function: FunctionDef {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.input_schema.clone(),
                        extra: Map::new(),
                    },
                })
                .collect()
        });

        let mut extra = Map::new();
        if let Some(top_k) = req.top_k {
            extra.insert("top_k".to_string(), Value::from(top_k));
        }

        CanonicalRequest {
            model: req.model.clone(),
            messages,
            stream: req.stream.unwrap_or(false),
            params: GenerationParams {
                temperature: req.temperature,
                top_p: req.top_p,
                max_tokens: Some(req.max_tokens),
                stop: req.stop_sequences.clone().map(StopSequences::Many),
                user: req.metadata.as_ref().and_then(|m| m.user_id.clone()),
                tools,
                tool_choice: req.tool_choice.as_ref().map(to_canonical_tool_choice),
                extra,
                ..GenerationParams::default()
            },
        }
    }
}

impl ProtocolCodec for AnthropicCodec {
    fn dialect(&self) -> Dialect {
        Dialect::Anthropic
    }

    fn upstream_path(&self, _endpoint: Endpoint) -> &'static str {
        MESSAGES_PATH
    }

    fn encode(&self, req: &CanonicalRequest) -> Result<Bytes> {
        serde_json::to_vec(&self.to_messages_request(req))
            .map(Bytes::from)
            .map_err(|e| GatewayError::encode(e.to_string()))
    }

    fn decode_request(&self, body: &[u8]) -> Result<CanonicalRequest> {
        let req: MessagesRequest =
            serde_json::from_slice(body).map_err(|e| GatewayError::translation(e.to_string()))?;
        Ok(self.from_messages_request(&req))
    }

    fn decode(&self, body: &[u8]) -> Result<CanonicalResponse> {
        let resp: MessagesResponse = serde_json::from_slice(body).map_err(|e| {
            GatewayError::translation(format!(
                "{e}. Body: {}",
                truncate(&String::from_utf8_lossy(body), 300)
            ))
        })?;
        Ok(to_canonical_response(&resp))
    }

    fn decode_error(&self, status: StatusCode, body: &[u8]) -> UpstreamError {
        match serde_json::from_slice::<ErrorResponse>(body) {
            Ok(err) => UpstreamError::new(err.error.error_type, err.error.message),
            Err(_) => UpstreamError::generic(status, body),
        }
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
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(provider.timeout)
            .body(payload);

        if let Some(ref key) = provider.credential {
            builder = builder.header("x-api-key", key);
        }

        Ok(builder.build()?)
    }

    fn stream_translator(&self) -> Option<Box<dyn StreamTranslator>> {
        Some(Box::new(MessagesStreamTranslator::new()))
    }
}

// ---------------------------------------------------------------------------
// Canonical → Anthropic
// ---------------------------------------------------------------------------

fn push_turn(turns: &mut Vec<(Role, Vec<ContentBlock>)>, role: Role, mut blocks: Vec<ContentBlock>) {
    match turns.last_mut() {
        Some((last_role, last_blocks)) if *last_role == role => last_blocks.append(&mut blocks),
        _ => turns.push((role, blocks)),
    }
}

fn collapse_blocks(mut blocks: Vec<ContentBlock>) -> MessageContent {
    if blocks.len() == 1 {
        if let ContentBlock::Text { .. } = blocks[0] {
            if let Some(ContentBlock::Text { text }) = blocks.pop() {
                return MessageContent::Text(text);
            }
        }
    }
    MessageContent::Blocks(blocks)
}

fn user_blocks(msg: &ChatMessage) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();

    match msg.content {
        Some(ChatContent::Text(ref text)) => blocks.push(ContentBlock::Text { text: text.clone() }),
        Some(ChatContent::Parts(ref parts)) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        blocks.push(ContentBlock::Text { text: text.clone() });
                    }
                    ContentPart::ImageUrl { image_url } => match parse_data_uri(&image_url.url) {
                        Some(source) => blocks.push(ContentBlock::Image { source }),
                        None => tracing::debug!(
                            url = %truncate(&image_url.url, 80),
                            "Dropping remote image; only data URIs map to the messages dialect"
                        ),
                    },
                    ContentPart::Other(_) => tracing::debug!(
                        part = part.kind(),
                        "Dropping content part the messages dialect cannot carry"
                    ),
                }
            }
        }
        None => {}
    }

    if blocks.is_empty() {
        blocks.push(ContentBlock::Text {
            text: String::new(),
        });
    }
    blocks
}

fn assistant_blocks(msg: &ChatMessage) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();

    if let Some(ref content) = msg.content {
        let text = content.as_text();
        if !text.is_empty() {
            blocks.push(ContentBlock::Text { text });
        }
    }

    for call in msg.tool_calls.iter().flatten() {
        let input = serde_json::from_str(&call.function.arguments)
            .unwrap_or_else(|_| Value::Object(Map::new()));
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.function.name.clone(),
            input,
        });
    }

    if blocks.is_empty() {
        blocks.push(ContentBlock::Text {
            text: String::new(),
        });
    }
    blocks
}

fn tool_result_block(msg: &ChatMessage) -> ContentBlock {
    ContentBlock::ToolResult {
        tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
        content: msg
            .content
            .as_ref()
            .map(|c| ToolResultContent::Text(c.as_text())),
        is_error: None,
    }
}

/// `data:<media-type>;base64,<payload>` → base64 image source.
fn parse_data_uri(url: &str) -> Option<ImageSource> {
    let rest = url.strip_prefix("data:")?;
    let (media_type, data) = rest.split_once(";base64,")?;
    Some(ImageSource {
        source_type: "base64".to_string(),
        media_type: media_type.to_string(),
        data: data.to_string(),
    })
}

fn to_anthropic_tool_choice(choice: &ChatToolChoice) -> ToolChoice {
    match choice {
        ChatToolChoice::Mode(mode) => {
            let choice_type = match mode.as_str() {
                "required" => "any",
                "none" => "none",
                _ => "auto",
            };
            ToolChoice::Mode(ToolChoiceMode {
                choice_type: choice_type.to_string(),
            })
        }
        ChatToolChoice::Function(named) => ToolChoice::Specific(ToolChoiceSpecific {
            choice_type: "tool".to_string(),
            name: named.function.name.clone(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Anthropic → Canonical
// ---------------------------------------------------------------------------

/// A user turn can expand into several canonical messages: every
/// `tool_result` block becomes its own `tool` message.
fn translate_user_turn(blocks: &[ContentBlock]) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    let mut parts: Vec<ContentPart> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => parts.push(ContentPart::Text { text: text.clone() }),
            ContentBlock::Image { source } => parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{};base64,{}", source.media_type, source.data),
                    detail: None,
                },
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                if !parts.is_empty() {
                    messages.push(user_message(std::mem::take(&mut parts)));
                }
                let mut message = ChatMessage::text(
                    "tool",
                    tool_result_text(content.as_ref(), *is_error),
                );
                message.tool_call_id = Some(tool_use_id.clone());
                messages.push(message);
            }
            ContentBlock::ToolUse { .. } => {}
        }
    }

    if !parts.is_empty() || messages.is_empty() {
        messages.push(user_message(parts));
    }
    messages
}

fn user_message(parts: Vec<ContentPart>) -> ChatMessage {
    let content = match parts.as_slice() {
        [] => ChatContent::Text(String::new()),
        [ContentPart::Text { text }] => ChatContent::Text(text.clone()),
        _ => ChatContent::Parts(parts),
    };
    ChatMessage::new("user", Some(content))
}

fn translate_assistant_turn(blocks: &[ContentBlock]) -> Vec<ChatMessage> {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall::function(id, name, input.to_string()));
            }
            ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } => {}
        }
    }

    let text = text_parts.concat();
    let mut message = ChatMessage::new(
        "assistant",
        (!text.is_empty()).then_some(ChatContent::Text(text)),
    );
    message.tool_calls = (!tool_calls.is_empty()).then_some(tool_calls);
    vec![message]
}

fn tool_result_text(content: Option<&ToolResultContent>, is_error: Option<bool>) -> String {
    let prefix = if is_error == Some(true) { "ERROR: " } else { "" };

    match content {
        Some(ToolResultContent::Text(t)) => format!("{prefix}{t}"),
        Some(ToolResultContent::Blocks(blocks)) => {
            let text = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!("{prefix}{text}")
        }
        None => prefix.to_string(),
    }
}

fn to_canonical_tool_choice(choice: &ToolChoice) -> ChatToolChoice {
    match choice {
        ToolChoice::Mode(ToolChoiceMode { choice_type }) => {
            let mode = match choice_type.as_str() {
                "any" => "required",
                "none" => "none",
                _ => "auto",
            };
            ChatToolChoice::Mode(mode.to_string())
        }
        ToolChoice::Specific(ToolChoiceSpecific { name, .. }) => {
            ChatToolChoice::Function(NamedToolChoice {
                choice_type: "function".to_string(),
                function: NamedFunction { name: name.clone() },
            })
        }
    }
}

fn to_canonical_response(resp: &MessagesResponse) -> CanonicalResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for block in &resp.content {
        match block {
            ResponseContentBlock::Text { text: t } => text.push_str(t),
            ResponseContentBlock::Thinking { thinking } => reasoning.push_str(thinking),
            ResponseContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall::function(id, name, input.to_string()));
            }
            ResponseContentBlock::Other => {}
        }
    }

    // OpenAI-shaped clients expect `content: null` on pure tool-call turns.
    let content = if text.is_empty() && !tool_calls.is_empty() {
        None
    } else {
        Some(text)
    };

    let usage = Usage {
        prompt_tokens: resp.usage.input_tokens,
        completion_tokens: resp.usage.output_tokens,
        total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
        extra: Map::new(),
    };

    CanonicalResponse {
        id: resp.id.clone(),
        object: "chat.completion".to_string(),
        created: u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default(),
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content,
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                extra: Map::new(),
            },
            finish_reason: resp.stop_reason.as_deref().map(map_stop_reason),
            extra: Map::new(),
        }],
        usage: Some(usage),
        extra: Map::new(),
    }
}

/// Anthropic `stop_reason` → OpenAI `finish_reason`.
pub fn map_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        "tool_use" => "tool_calls".to_string(),
        "refusal" => "content_filter".to_string(),
        other => other.to_string(),
    }
}
