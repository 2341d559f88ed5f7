//! Canonical chat shape to Gemini `contents` and back
//!
//! Gemini requires strictly alternating `user`/`model` turns, a conversation
//! that opens with a user turn, and a matching `functionResponse` right after
//! every `functionCall`. Histories coming from callers satisfy none of that
//! reliably, so the outbound pass repairs them after mapping.

use std::collections::HashMap;

use serde_json::{Map, Value, json};

use crate::error::LlmError;
use crate::protocol::gemini::{
    FunctionCallingConfig, FunctionDeclaration, GeminiContent, GeminiPart, GeminiRole, GeminiTool,
    GenerateContentRequest, GenerateContentResponse, GenerationConfig, ToolConfig, UsageMetadata,
};
use crate::types::{
    ChoiceMessage, CompletionRequest, CompletionResponse, Content, ContentPart, FinishReason,
    GeminiExtensions, Message, Role, ToolCall, ToolChoice, ToolChoiceMode, ToolDefinition, Usage,
};

/// Joins multiple system messages into one system instruction
pub const SYSTEM_SEPARATOR: &str = "\n\n---\n\n";

/// Text of the synthetic user turn that opens a model-first history
const USER_PLACEHOLDER: &str = "(continuing conversation)";

/// Text left behind when every part of a model turn was stripped
const MODEL_PLACEHOLDER: &str = "(tool call omitted)";

/// Keys Gemini rejects inside function parameter schemas
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["default", "minimum", "maximum", "$schema"];

/// Translated conversation
#[derive(Debug, Clone, PartialEq)]
pub struct GeminiConversation {
    pub system_instruction: Option<GeminiContent>,
    pub contents: Vec<GeminiContent>,
}

/// Build a full `generateContent` request
pub fn build_request(request: &CompletionRequest) -> GenerateContentRequest {
    let conversation = to_gemini(&request.messages);

    GenerateContentRequest {
        contents: conversation.contents,
        system_instruction: conversation.system_instruction,
        generation_config: generation_config(request),
        tools: request.has_tools().then(|| tools(request.tools.as_deref().unwrap_or_default())),
        tool_config: request.tool_choice.as_ref().map(tool_config),
    }
}

/// Map canonical messages to a system instruction and valid Gemini turns
pub fn to_gemini(messages: &[Message]) -> GeminiConversation {
    let system_instruction = system_instruction(messages);
    let call_names = tool_call_names(messages);

    let turns = messages
        .iter()
        .filter_map(|message| match message.role {
            Role::System => None,
            Role::User => {
                let parts = user_parts(message);
                (!parts.is_empty()).then(|| GeminiContent::new(GeminiRole::User, parts))
            }
            Role::Assistant => model_turn(message),
            Role::Tool => Some(GeminiContent::new(
                GeminiRole::User,
                vec![tool_result_part(message, &call_names)],
            )),
        })
        .collect();

    let mut contents = merge_adjacent(turns);

    if contents.first().is_none_or(|turn| turn.role != Some(GeminiRole::User)) {
        contents.insert(
            0,
            GeminiContent::new(GeminiRole::User, vec![GeminiPart::text(USER_PLACEHOLDER)]),
        );
    }

    strip_orphan_calls(&mut contents);

    GeminiConversation {
        system_instruction,
        contents,
    }
}

fn system_instruction(messages: &[Message]) -> Option<GeminiContent> {
    let joined = messages
        .iter()
        .filter(|message| message.role == Role::System)
        .map(Message::text)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(SYSTEM_SEPARATOR);

    (!joined.is_empty()).then(|| GeminiContent {
        role: None,
        parts: vec![GeminiPart::text(joined)],
    })
}

fn tool_call_names(messages: &[Message]) -> HashMap<&str, &str> {
    messages
        .iter()
        .filter_map(|message| message.tool_calls.as_ref())
        .flatten()
        .map(|call| (call.id.as_str(), call.function.name.as_str()))
        .collect()
}

/// Parts of a user turn; empty text is dropped since Gemini rejects it
fn user_parts(message: &Message) -> Vec<GeminiPart> {
    let mut parts = Vec::new();

    match &message.content {
        Some(Content::Parts(content_parts)) => {
            for part in content_parts {
                match part {
                    ContentPart::Text { text } if text.is_empty() => {}
                    ContentPart::Text { text } => parts.push(GeminiPart::text(text.clone())),
                    ContentPart::ImageUrl { image_url } => match parse_data_uri(&image_url.url) {
                        Some((mime_type, data)) => {
                            parts.push(GeminiPart::inline_data(mime_type, data));
                        }
                        None => tracing::debug!(
                            "skipping non-inline image; Gemini needs base64 data URIs"
                        ),
                    },
                }
            }
        }
        Some(Content::Text(text)) if !text.is_empty() => parts.push(GeminiPart::text(text.clone())),
        Some(Content::Text(_)) | None => {}
    }

    parts
}

/// Split `data:<mime>;base64,<payload>`
fn parse_data_uri(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime_type = meta.strip_suffix(";base64")?;

    Some((mime_type, data))
}

fn model_turn(message: &Message) -> Option<GeminiContent> {
    let preserved = message
        .provider_extensions
        .as_ref()
        .and_then(|ext| ext.gemini())
        .filter(|ext| !ext.parts.is_empty())
        .and_then(|ext| replay_parts(&ext.parts));

    let parts = preserved.unwrap_or_else(|| synthesize_model_parts(message));

    (!parts.is_empty()).then(|| GeminiContent::new(GeminiRole::Model, parts))
}

fn replay_parts(raw: &[Value]) -> Option<Vec<GeminiPart>> {
    raw.iter()
        .map(|value| serde_json::from_value(value.clone()))
        .collect::<Result<Vec<GeminiPart>, _>>()
        .inspect_err(|e| {
            tracing::warn!(error = %e, "preserved Gemini parts are unreadable; rebuilding turn");
        })
        .ok()
}

fn synthesize_model_parts(message: &Message) -> Vec<GeminiPart> {
    let mut parts = Vec::new();

    let text = message.text();
    if !text.is_empty() {
        parts.push(GeminiPart::text(text));
    }

    for call in message.tool_calls.iter().flatten() {
        let args = serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
        let mut part = GeminiPart::function_call(call.function.name.clone(), args);

        part.thought_signature = call
            .provider_extensions
            .as_ref()
            .and_then(|ext| ext.gemini())
            .and_then(|ext| ext.thought_signature.clone());

        parts.push(part);
    }

    parts
}

fn tool_result_part(message: &Message, call_names: &HashMap<&str, &str>) -> GeminiPart {
    let call_id = message.tool_call_id.as_deref().unwrap_or_default();

    let name = call_names
        .get(call_id)
        .copied()
        .or(message.name.as_deref())
        .filter(|name| !name.is_empty())
        .unwrap_or(call_id);

    let text = message.text();
    let response = match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(object)) => Value::Object(object),
        Ok(other) => json!({ "result": other }),
        Err(_) => json!({ "result": text }),
    };

    GeminiPart::function_response(name, response)
}

fn merge_adjacent(turns: Vec<GeminiContent>) -> Vec<GeminiContent> {
    let mut merged: Vec<GeminiContent> = Vec::with_capacity(turns.len());

    for turn in turns {
        match merged.last_mut() {
            Some(previous) if previous.role == turn.role => previous.parts.extend(turn.parts),
            _ => merged.push(turn),
        }
    }

    merged
}

/// Drop `functionCall` parts that the next turn does not answer
///
/// Calls are matched to responses by name and count, in order: two calls to
/// `search` answered by one `search` response keep only the first call. A
/// turn that loses a call also loses its thought signatures, since they are
/// only valid for the exact sequence the model produced.
fn strip_orphan_calls(contents: &mut [GeminiContent]) {
    for index in 0..contents.len() {
        if contents[index].role != Some(GeminiRole::Model) || !contents[index].has_function_call() {
            continue;
        }

        let mut unanswered: HashMap<String, usize> = HashMap::new();
        let next = contents.get(index + 1).filter(|next| next.role == Some(GeminiRole::User));
        if let Some(next) = next {
            for response in next.parts.iter().filter_map(|part| part.function_response.as_ref()) {
                *unanswered.entry(response.name.clone()).or_default() += 1;
            }
        }

        let turn = &mut contents[index];
        let before = turn.parts.len();

        turn.parts.retain(|part| {
            let Some(call) = part.function_call.as_ref() else {
                return true;
            };

            match unanswered.get_mut(&call.name) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    true
                }
                _ => false,
            }
        });

        if turn.parts.len() == before {
            continue;
        }

        tracing::debug!(removed = before - turn.parts.len(), "stripped unanswered function calls");

        for part in &mut turn.parts {
            part.thought_signature = None;
        }

        if turn.parts.is_empty() {
            turn.parts.push(GeminiPart::text(MODEL_PLACEHOLDER));
        }
    }
}

/// Remove schema keywords Gemini rejects
///
/// Applying this to its own output changes nothing.
pub fn sanitize_schema(schema: &Value) -> Value {
    let Value::Object(map) = schema else {
        return schema.clone();
    };

    let mut sanitized = Map::with_capacity(map.len());

    for (key, value) in map {
        if UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()) {
            continue;
        }

        let value = match key.as_str() {
            "required" if value.is_boolean() || value.as_array().is_some_and(Vec::is_empty) => {
                continue;
            }
            "type" if value.as_str() == Some("any") => Value::String("string".to_owned()),
            "properties" => match value {
                Value::Object(properties) => Value::Object(
                    properties
                        .iter()
                        .map(|(name, property)| (name.clone(), sanitize_schema(property)))
                        .collect(),
                ),
                other => other.clone(),
            },
            "items" => match value {
                Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
                other => sanitize_schema(other),
            },
            _ => value.clone(),
        };

        sanitized.insert(key.clone(), value);
    }

    Value::Object(sanitized)
}

fn generation_config(request: &CompletionRequest) -> Option<GenerationConfig> {
    let params = &request.params;
    let format = request.response_format.as_ref().filter(|format| format.wants_json());

    let config = GenerationConfig {
        temperature: params.temperature,
        top_p: params.top_p,
        max_output_tokens: params.max_tokens,
        stop_sequences: params.stop.clone(),
        response_mime_type: format.map(|_| "application/json".to_owned()),
        response_schema: format.and_then(|format| format.schema()).map(sanitize_schema),
    };

    (config != GenerationConfig::default()).then_some(config)
}

fn tools(definitions: &[ToolDefinition]) -> Vec<GeminiTool> {
    vec![GeminiTool {
        function_declarations: definitions
            .iter()
            .map(|definition| FunctionDeclaration {
                name: definition.function.name.clone(),
                description: definition.function.description.clone(),
                parameters: definition.function.parameters.as_ref().map(sanitize_schema),
            })
            .collect(),
    }]
}

fn tool_config(choice: &ToolChoice) -> ToolConfig {
    let (mode, allowed_function_names) = match choice {
        ToolChoice::Mode(ToolChoiceMode::None) => ("NONE", None),
        ToolChoice::Mode(ToolChoiceMode::Auto) => ("AUTO", None),
        ToolChoice::Mode(ToolChoiceMode::Required) => ("ANY", None),
        ToolChoice::Function(forced) => ("ANY", Some(vec![forced.function.name.clone()])),
    };

    ToolConfig {
        function_calling_config: FunctionCallingConfig {
            mode: mode.to_owned(),
            allowed_function_names,
        },
    }
}

/// Map a Gemini response to the canonical shape
///
/// The full parts array is kept in the message extensions so the next
/// outbound pass can replay it verbatim.
pub fn from_gemini(
    response: &GenerateContentResponse,
    model: &str,
) -> Result<CompletionResponse, LlmError> {
    let Some(candidate) = response.candidates.first() else {
        return Err(LlmError::Provider {
            provider: "gemini".to_owned(),
            message: "response contained no candidates".to_owned(),
        });
    };

    let parts = candidate
        .content
        .as_ref()
        .map(|content| content.parts.as_slice())
        .unwrap_or_default();

    let text: String = parts.iter().filter_map(GeminiPart::visible_text).collect();

    let tool_calls: Vec<ToolCall> = parts
        .iter()
        .filter_map(|part| {
            let call = part.function_call.as_ref()?;
            let mut tool_call = ToolCall::new(
                format!("call_{}", uuid::Uuid::new_v4().simple()),
                call.name.clone(),
                call.args.to_string(),
            );
            tool_call.provider_extensions =
                part.thought_signature.clone().map(GeminiExtensions::with_signature);
            Some(tool_call)
        })
        .collect();

    let finish_reason = if tool_calls.is_empty() {
        finish_reason(candidate.finish_reason.as_deref())
    } else {
        FinishReason::ToolCalls
    };

    let message = ChoiceMessage {
        content: (!text.is_empty() || tool_calls.is_empty()).then_some(text),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        provider_extensions: (!parts.is_empty()).then(|| {
            let native = parts.iter().filter_map(|part| serde_json::to_value(part).ok());
            GeminiExtensions::with_parts(native.collect())
        }),
        ..ChoiceMessage::text("")
    };

    let mut completion = CompletionResponse::single(model, message, finish_reason);
    completion.usage = response.usage_metadata.map(usage);

    Ok(completion)
}

/// Visible text delta of a streamed chunk
pub fn visible_text(chunk: &GenerateContentResponse) -> Option<String> {
    let text: String = chunk
        .candidates
        .first()
        .and_then(|candidate| candidate.content.as_ref())
        .map(|content| content.parts.iter().filter_map(GeminiPart::visible_text).collect())
        .unwrap_or_default();

    (!text.is_empty()).then_some(text)
}

fn finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        None | Some("STOP") => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII") => {
            FinishReason::ContentFilter
        }
        Some(_) => FinishReason::Other,
    }
}

const fn usage(metadata: UsageMetadata) -> Usage {
    Usage {
        prompt_tokens: metadata.prompt_token_count,
        completion_tokens: metadata.candidates_token_count,
        total_tokens: metadata.total_token_count,
    }
}
