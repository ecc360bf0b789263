//! Streamed Messages responses → `chat.completion.chunk` events.
//!
//! Anthropic streams a response as typed events (`message_start`,
//! `content_block_delta`, `message_delta`, ...). [`MessagesStreamTranslator`]
//! consumes them one at a time and emits the OpenAI-shaped chunks a
//! chat-completions caller expects, ending with `data: [DONE]`.

use std::collections::HashMap;

use bytes::Bytes;
use serde::Serialize;

use super::anthropic::map_stop_reason;
use super::anthropic_types::{BlockDelta, ErrorBody, ResponseContentBlock, StreamEvent};
use super::canonical::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, ChunkFunction, ChunkToolCall, Usage,
};
use super::StreamTranslator;

const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

#[derive(Debug)]
pub struct MessagesStreamTranslator {
    id: String,
    model: String,
    created: u64,
    /// Content block index → position in the chunk `tool_calls` array.
    tool_calls: HashMap<u64, u64>,
    input_tokens: u64,
    done: bool,
}

impl Default for MessagesStreamTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagesStreamTranslator {
    pub fn new() -> Self {
        Self {
            id: String::new(),
            model: String::new(),
            created: u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default(),
            tool_calls: HashMap::new(),
            input_tokens: 0,
            done: false,
        }
    }

    /// Translate one parsed event into zero or more chunks.
    pub fn translate(&mut self, event: StreamEvent) -> Vec<Bytes> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                self.input_tokens = message.usage.input_tokens;
                self.delta_frame(ChunkDelta {
                    role: Some("assistant".to_string()),
                    content: Some(String::new()),
                    ..ChunkDelta::default()
                })
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ResponseContentBlock::ToolUse { id, name, .. } => {
                    let position = self.tool_calls.len() as u64;
                    self.tool_calls.insert(index, position);
                    self.delta_frame(ChunkDelta {
                        tool_calls: Some(vec![ChunkToolCall {
                            index: position,
                            id: Some(id),
                            call_type: Some("function".to_string()),
                            function: ChunkFunction {
                                name: Some(name),
                                arguments: Some(String::new()),
                            },
                        }]),
                        ..ChunkDelta::default()
                    })
                }
                ResponseContentBlock::Text { text } if !text.is_empty() => {
                    self.delta_frame(ChunkDelta {
                        content: Some(text),
                        ..ChunkDelta::default()
                    })
                }
                _ => Vec::new(),
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => self.delta_frame(ChunkDelta {
                    content: Some(text),
                    ..ChunkDelta::default()
                }),
                BlockDelta::ThinkingDelta { thinking } => self.delta_frame(ChunkDelta {
                    reasoning_content: Some(thinking),
                    ..ChunkDelta::default()
                }),
                BlockDelta::InputJsonDelta { partial_json } => {
                    let Some(&position) = self.tool_calls.get(&index) else {
                        tracing::debug!(index, "Argument delta for a block that never started");
                        return Vec::new();
                    };
                    self.delta_frame(ChunkDelta {
                        tool_calls: Some(vec![ChunkToolCall {
                            index: position,
                            id: None,
                            call_type: None,
                            function: ChunkFunction {
                                name: None,
                                arguments: Some(partial_json),
                            },
                        }]),
                        ..ChunkDelta::default()
                    })
                }
                BlockDelta::Other => Vec::new(),
            },
            StreamEvent::MessageDelta { delta, usage } => {
                let output_tokens = usage.map(|u| u.output_tokens).unwrap_or_default();
                let chunk = ChatCompletionChunk {
                    usage: Some(Usage {
                        prompt_tokens: self.input_tokens,
                        completion_tokens: output_tokens,
                        total_tokens: self.input_tokens + output_tokens,
                        extra: serde_json::Map::new(),
                    }),
                    ..self.chunk(
                        ChunkDelta::default(),
                        delta.stop_reason.as_deref().map(map_stop_reason),
                    )
                };
                frame(&chunk).into_iter().collect()
            }
            StreamEvent::MessageStop => {
                self.done = true;
                vec![Bytes::from_static(DONE_FRAME)]
            }
            StreamEvent::Error { error } => {
                tracing::warn!(
                    error_type = %error.error_type,
                    message = %error.message,
                    "Upstream stream error"
                );
                self.done = true;
                frame(&ErrorFrame { error }).into_iter().collect()
            }
            StreamEvent::ContentBlockStop { .. } | StreamEvent::Ping => Vec::new(),
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    fn delta_frame(&self, delta: ChunkDelta) -> Vec<Bytes> {
        frame(&self.chunk(delta, None)).into_iter().collect()
    }
}

impl StreamTranslator for MessagesStreamTranslator {
    fn on_event(&mut self, data: &str) -> Vec<Bytes> {
        if self.done {
            return Vec::new();
        }
        match serde_json::from_str::<StreamEvent>(data) {
            Ok(event) => self.translate(event),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unparseable stream event");
                Vec::new()
            }
        }
    }

    fn finish(&mut self) -> Vec<Bytes> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        vec![Bytes::from_static(DONE_FRAME)]
    }
}

#[derive(Serialize)]
struct ErrorFrame {
    error: ErrorBody,
}

/// `data: <json>\n\n`
fn frame<T: Serialize>(payload: &T) -> Option<Bytes> {
    match serde_json::to_string(payload) {
        Ok(json) => Some(Bytes::from(format!("data: {json}\n\n"))),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize stream chunk");
            None
        }
    }
}
