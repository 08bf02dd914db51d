//! Span attribute schema.
//!
//! Canonical keys follow `gen_ai.<category>.<field>`. Several downstream
//! viewers read differently-named keys for the same value, so every canonical
//! key with an entry in [`aliases`] is written together with its aliases.
//! Empty identity values are never omitted: they become an `<unknown_...>`
//! sentinel derived from the key.

use opentelemetry::{Context, KeyValue, Value, trace::TraceContextExt};
use veadk_core::{Content, LlmRequest, LlmResponse, Part, ReadonlyContext};

use crate::resolver::{ContextField, ContextResolver};

pub const GEN_AI_SYSTEM: &str = "gen_ai.system";
pub const GEN_AI_OPERATION_NAME: &str = "gen_ai.operation.name";
pub const GEN_AI_SPAN_KIND: &str = "gen_ai.span.kind";

pub const GEN_AI_APP_NAME: &str = "gen_ai.app.name";
pub const GEN_AI_USER_ID: &str = "gen_ai.user.id";
pub const GEN_AI_SESSION_ID: &str = "gen_ai.session.id";
pub const GEN_AI_AGENT_NAME: &str = "gen_ai.agent.name";
pub const GEN_AI_INVOCATION_ID: &str = "gen_ai.invocation.id";
pub const GEN_AI_CALL_TYPE: &str = "gen_ai.call.type";

pub const GEN_AI_REQUEST_MODEL: &str = "gen_ai.request.model";
pub const GEN_AI_REQUEST_TEMPERATURE: &str = "gen_ai.request.temperature";
pub const GEN_AI_REQUEST_TOP_P: &str = "gen_ai.request.top_p";
pub const GEN_AI_REQUEST_MAX_TOKENS: &str = "gen_ai.request.max_tokens";
pub const GEN_AI_REQUEST_FUNCTIONS: &str = "gen_ai.request.functions";
pub const GEN_AI_PROMPT: &str = "gen_ai.prompt";

pub const GEN_AI_RESPONSE_MODEL: &str = "gen_ai.response.model";
pub const GEN_AI_RESPONSE_FINISH_REASON: &str = "gen_ai.response.finish_reason";
pub const GEN_AI_COMPLETION: &str = "gen_ai.completion";

pub const GEN_AI_USAGE_INPUT_TOKENS: &str = "gen_ai.usage.input_tokens";
pub const GEN_AI_USAGE_OUTPUT_TOKENS: &str = "gen_ai.usage.output_tokens";
pub const GEN_AI_USAGE_TOTAL_TOKENS: &str = "gen_ai.usage.total_tokens";
pub const GEN_AI_USAGE_REASONING_TOKENS: &str = "gen_ai.usage.reasoning_tokens";

pub const GEN_AI_INPUT: &str = "gen_ai.input";
pub const GEN_AI_OUTPUT: &str = "gen_ai.output";

pub const GEN_AI_TOOL_NAME: &str = "gen_ai.tool.name";
pub const GEN_AI_TOOL_CALL_ID: &str = "gen_ai.tool.call.id";
pub const GEN_AI_TOOL_INPUT: &str = "gen_ai.tool.input";
pub const GEN_AI_TOOL_OUTPUT: &str = "gen_ai.tool.output";
/// Approximate token counts of the tool payloads (serialized bytes / 4).
pub const GEN_AI_TOOL_ESTIMATED_INPUT_TOKENS: &str = "gen_ai.tool.estimated_input_tokens";
pub const GEN_AI_TOOL_ESTIMATED_OUTPUT_TOKENS: &str = "gen_ai.tool.estimated_output_tokens";

pub const GEN_AI_TOKEN_TYPE: &str = "gen_ai.token.type";
pub const GEN_AI_CHOICE_EVENT: &str = "gen_ai.choice";
pub const THOUGHT_EVENT: &str = "thought";

pub const ERROR_TYPE: &str = "error.type";

/// Tool keys written by the host framework on its own tool spans.
pub const HOST_TOOL_ARGS: &str = "gcp.vertex.agent.tool_call_args";
pub const HOST_TOOL_RESPONSE: &str = "gcp.vertex.agent.tool_response";

pub mod span_kind {
    pub const WORKFLOW: &str = "workflow";
    pub const AGENT: &str = "agent";
    pub const LLM: &str = "llm";
    pub const TOOL: &str = "tool";
}

pub mod operation {
    pub const CHAIN: &str = "chain";
    pub const INVOKE_AGENT: &str = "invoke_agent";
    pub const CHAT: &str = "chat";
    pub const EXECUTE_TOOL: &str = "execute_tool";
}

/// Extra keys a canonical key is also written under.
pub fn aliases(key: &str) -> &'static [&'static str] {
    match key {
        GEN_AI_SESSION_ID => &["session.id"],
        GEN_AI_USER_ID => &["user.id"],
        GEN_AI_APP_NAME => &["app_name", "app.name"],
        GEN_AI_AGENT_NAME => &["agent_name", "agent.name"],
        GEN_AI_INVOCATION_ID => &["invocation.id"],
        GEN_AI_INPUT | GEN_AI_TOOL_INPUT => &["input.value"],
        GEN_AI_OUTPUT | GEN_AI_TOOL_OUTPUT => &["output.value"],
        GEN_AI_USAGE_INPUT_TOKENS => &["gen_ai.usage.prompt_tokens"],
        GEN_AI_USAGE_OUTPUT_TOKENS => &["gen_ai.usage.completion_tokens"],
        GEN_AI_SPAN_KIND => &["span.kind"],
        _ => &[],
    }
}

/// `gen_ai.user.id` becomes `<unknown_user_id>`.
pub fn unknown_sentinel(key: &str) -> String {
    let field = key.strip_prefix("gen_ai.").unwrap_or(key).replace('.', "_");
    format!("<unknown_{field}>")
}

/// The canonical key/value plus one pair per alias.
pub fn aliased(key: &'static str, value: impl Into<Value>) -> Vec<KeyValue> {
    let value = value.into();
    let mut pairs = Vec::with_capacity(1 + aliases(key).len());
    for alias in aliases(key) {
        pairs.push(KeyValue::new(*alias, value.clone()));
    }
    pairs.insert(0, KeyValue::new(key, value));
    pairs
}

/// Like [`aliased`], substituting the sentinel for an empty string.
pub fn aliased_str(key: &'static str, value: impl Into<String>) -> Vec<KeyValue> {
    let value = value.into();
    if value.is_empty() {
        aliased(key, unknown_sentinel(key))
    } else {
        aliased(key, value)
    }
}

/// Writes the attributes onto the span active in `cx`.
pub fn set_span_attributes(cx: &Context, attributes: impl IntoIterator<Item = KeyValue>) {
    let span = cx.span();
    for attribute in attributes {
        span.set_attribute(attribute);
    }
}

pub fn set_span_attribute(cx: &Context, key: &'static str, value: impl Into<String>) {
    set_span_attributes(cx, aliased_str(key, value));
}

/// Identity attributes every span carries.
pub fn common_attributes<C: ReadonlyContext + ?Sized>(
    resolver: &ContextResolver,
    ctx: &C,
) -> Vec<KeyValue> {
    let fields = [
        (GEN_AI_SYSTEM, ContextField::ModelProvider),
        (GEN_AI_APP_NAME, ContextField::AppName),
        (GEN_AI_USER_ID, ContextField::UserId),
        (GEN_AI_SESSION_ID, ContextField::SessionId),
        (GEN_AI_INVOCATION_ID, ContextField::InvocationId),
        (GEN_AI_CALL_TYPE, ContextField::CallType),
    ];
    fields
        .into_iter()
        .flat_map(|(key, field)| aliased_str(key, resolver.resolve(field, Some(ctx))))
        .collect()
}

pub fn kind_attributes(kind: &'static str, operation: &'static str) -> Vec<KeyValue> {
    let mut attributes = aliased(GEN_AI_SPAN_KIND, kind);
    attributes.push(KeyValue::new(GEN_AI_OPERATION_NAME, operation));
    attributes
}

pub fn request_attributes(request: &LlmRequest) -> Vec<KeyValue> {
    let mut attributes = vec![KeyValue::new(GEN_AI_REQUEST_MODEL, request.model.clone())];

    if let Some(config) = &request.config {
        if let Some(temperature) = config.temperature {
            attributes.push(KeyValue::new(GEN_AI_REQUEST_TEMPERATURE, f64::from(temperature)));
        }
        if let Some(top_p) = config.top_p {
            attributes.push(KeyValue::new(GEN_AI_REQUEST_TOP_P, f64::from(top_p)));
        }
        if let Some(max_tokens) = config.max_output_tokens {
            attributes.push(KeyValue::new(GEN_AI_REQUEST_MAX_TOKENS, i64::from(max_tokens)));
        }
    }

    let mut index = 0;
    let instruction = request.config.as_ref().and_then(|c| c.system_instruction.as_ref());
    if let Some(instruction) = instruction.filter(|s| !s.is_empty()) {
        attributes.push(KeyValue::new(format!("{GEN_AI_PROMPT}.0.role"), "system"));
        attributes.push(KeyValue::new(format!("{GEN_AI_PROMPT}.0.content"), instruction.clone()));
        index = 1;
    }
    for content in &request.contents {
        attributes.extend(content_attributes(GEN_AI_PROMPT, index, content));
        index += 1;
    }

    let mut tools: Vec<_> = request.tools.iter().collect();
    tools.sort_by(|a, b| a.0.cmp(b.0));
    for (i, (name, declaration)) in tools.into_iter().enumerate() {
        let prefix = format!("{GEN_AI_REQUEST_FUNCTIONS}.{i}");
        attributes.push(KeyValue::new(format!("{prefix}.name"), name.clone()));
        if let Some(description) = declaration.get("description").and_then(|d| d.as_str()) {
            attributes
                .push(KeyValue::new(format!("{prefix}.description"), description.to_string()));
        }
        if let Some(parameters) = declaration.get("parameters") {
            attributes.push(KeyValue::new(format!("{prefix}.parameters"), parameters.to_string()));
        }
    }

    if let Some(last) = request.contents.last() {
        attributes.extend(aliased(GEN_AI_INPUT, last.text()));
    }
    attributes
}

/// Completion attributes for the final, accumulated response content.
pub fn response_attributes(response: &LlmResponse, content: &Content) -> Vec<KeyValue> {
    let mut attributes = Vec::new();
    if let Some(model) = &response.model_version {
        attributes.push(KeyValue::new(GEN_AI_RESPONSE_MODEL, model.clone()));
    }
    if let Some(reason) = &response.finish_reason {
        attributes.push(KeyValue::new(GEN_AI_RESPONSE_FINISH_REASON, reason.as_str()));
        attributes.push(KeyValue::new(
            format!("{GEN_AI_COMPLETION}.0.finish_reason"),
            reason.as_str(),
        ));
    }
    attributes.extend(content_attributes(GEN_AI_COMPLETION, 0, content));
    attributes.extend(aliased(GEN_AI_OUTPUT, content.text()));
    attributes
}

pub fn usage_attributes(prompt: i64, candidates: i64, total: i64) -> Vec<KeyValue> {
    let mut attributes = aliased(GEN_AI_USAGE_INPUT_TOKENS, prompt);
    attributes.extend(aliased(GEN_AI_USAGE_OUTPUT_TOKENS, candidates));
    attributes.push(KeyValue::new(GEN_AI_USAGE_TOTAL_TOKENS, total));
    attributes
}

/// `<prefix>.<index>.role`, `.content`, `.reasoning_content` and tool calls of one message.
fn content_attributes(prefix: &str, index: usize, content: &Content) -> Vec<KeyValue> {
    let base = format!("{prefix}.{index}");
    let mut attributes = vec![KeyValue::new(format!("{base}.role"), content.role.clone())];

    let text = content.text();
    if !text.is_empty() {
        attributes.push(KeyValue::new(format!("{base}.content"), text));
    }
    let thinking: String = content.parts.iter().filter_map(Part::thinking).collect();
    if !thinking.is_empty() {
        attributes.push(KeyValue::new(format!("{base}.reasoning_content"), thinking));
    }

    let mut call_index = 0;
    for part in &content.parts {
        match part {
            Part::FunctionCall { name, args, id } => {
                let call = format!("{base}.tool_calls.{call_index}");
                attributes.push(KeyValue::new(format!("{call}.type"), "function"));
                attributes.push(KeyValue::new(format!("{call}.name"), name.clone()));
                attributes.push(KeyValue::new(format!("{call}.arguments"), args.to_string()));
                if let Some(id) = id {
                    attributes.push(KeyValue::new(format!("{call}.id"), id.clone()));
                }
                call_index += 1;
            }
            Part::FunctionResponse { function_response, id } => {
                attributes.push(KeyValue::new(
                    format!("{base}.content"),
                    function_response.response.to_string(),
                ));
                if let Some(id) = id {
                    attributes.push(KeyValue::new(format!("{base}.tool_call_id"), id.clone()));
                }
            }
            _ => {}
        }
    }
    attributes
}
