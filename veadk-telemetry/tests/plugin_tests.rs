mod common;

use common::{
    Harness, TestContext, has_attribute, histogram, int_attribute, span_context, string_attribute,
    sum,
};
use opentelemetry::trace::{SpanId, Status};
use serde_json::json;
use veadk_core::{Content, FinishReason, LlmRequest, LlmResponse, Part, UsageMetadata};
use veadk_plugin::Plugin;
use veadk_telemetry::attributes::{
    GEN_AI_APP_NAME, GEN_AI_CHOICE_EVENT, GEN_AI_INPUT, GEN_AI_OUTPUT, GEN_AI_SESSION_ID,
    GEN_AI_SPAN_KIND, GEN_AI_TOOL_CALL_ID, GEN_AI_TOOL_ESTIMATED_INPUT_TOKENS,
    GEN_AI_USAGE_INPUT_TOKENS, GEN_AI_USAGE_OUTPUT_TOKENS, GEN_AI_USAGE_TOTAL_TOKENS,
    GEN_AI_USER_ID, THOUGHT_EVENT,
};
use veadk_telemetry::metrics::{CHAT_COUNT, EXCEPTIONS, OPERATION_DURATION, TOKEN_USAGE};

fn request(text: &str) -> LlmRequest {
    LlmRequest::new("doubao-pro", vec![Content::new("user").with_text(text)])
}

fn answer(text: &str, prompt: i32, candidates: i32) -> LlmResponse {
    LlmResponse::new(Content::new("model").with_text(text)).with_usage(prompt, candidates)
}

#[tokio::test]
async fn test_span_hierarchy() {
    let h = Harness::new();
    let root = TestContext::invocation("What's the weather in Paris?");

    h.plugin.before_run(root.scope().into_invocation()).await.unwrap();
    h.plugin.before_agent(root.scope().into_callback()).await.unwrap();
    h.plugin.before_model(root.scope().into_callback(), &request("weather?")).await.unwrap();

    let call = Content::new("model").with_part(Part::function_call(
        "get_weather",
        json!({"city": "Paris"}),
        Some("call_1".to_string()),
    ));
    let response = LlmResponse::new(call).with_usage(10, 5);
    h.plugin.after_model(root.scope().into_callback(), &response).await.unwrap();

    let args = json!({"city": "Paris"});
    let result = json!({"forecast": "sunny"});
    let tool = || root.scope().call("call_1").into_tool();
    h.plugin.before_tool(tool(), "get_weather", &args).await.unwrap();
    h.plugin.after_tool(tool(), "get_weather", &args, &result).await.unwrap();

    h.plugin.after_agent(root.scope().into_callback()).await.unwrap();
    h.plugin.after_run(root.scope().into_invocation()).await;

    let invocation = h.span("invocation");
    let agent = h.span("invoke_agent weather_agent");
    let llm = h.span("chat doubao-pro");
    let tool = h.span("execute_tool get_weather");

    assert_eq!(invocation.parent_span_id, SpanId::INVALID);
    assert_eq!(agent.parent_span_id, invocation.span_context.span_id());
    assert_eq!(llm.parent_span_id, agent.span_context.span_id());
    // The tool hangs off the model call that requested it, not the agent.
    assert_eq!(tool.parent_span_id, llm.span_context.span_id());

    let trace_id = invocation.span_context.trace_id();
    for span in [&agent, &llm, &tool] {
        assert_eq!(span.span_context.trace_id(), trace_id);
    }

    assert_eq!(string_attribute(&invocation, GEN_AI_SPAN_KIND).as_deref(), Some("workflow"));
    assert_eq!(
        string_attribute(&invocation, GEN_AI_INPUT).as_deref(),
        Some("What's the weather in Paris?")
    );
    assert_eq!(string_attribute(&agent, GEN_AI_APP_NAME).as_deref(), Some("weather_app"));
    assert_eq!(string_attribute(&agent, GEN_AI_USER_ID).as_deref(), Some("alice"));
    assert_eq!(string_attribute(&llm, GEN_AI_SESSION_ID).as_deref(), Some("s-1"));
    assert_eq!(string_attribute(&llm, "session.id").as_deref(), Some("s-1"));
    assert_eq!(string_attribute(&tool, GEN_AI_TOOL_CALL_ID).as_deref(), Some("call_1"));
    // {"city":"Paris"} is 16 bytes.
    assert_eq!(int_attribute(&tool, GEN_AI_TOOL_ESTIMATED_INPUT_TOKENS), Some(4));

    // All scope keys are gone once every scope has closed.
    assert!(root.state().is_empty());
}

#[tokio::test]
async fn test_token_totals_accumulate_across_calls() {
    let h = Harness::new();
    let root = TestContext::invocation("plan a trip");

    h.plugin.before_run(root.scope().into_invocation()).await.unwrap();
    h.plugin.before_agent(root.scope().into_callback()).await.unwrap();

    h.plugin.before_model(root.scope().into_callback(), &request("step one")).await.unwrap();
    h.plugin.after_model(root.scope().into_callback(), &answer("first", 10, 5)).await.unwrap();
    h.plugin.before_model(root.scope().into_callback(), &request("step two")).await.unwrap();
    let response = answer("Pack an umbrella.", 8, 3);
    h.plugin.after_model(root.scope().into_callback(), &response).await.unwrap();

    h.plugin.after_agent(root.scope().into_callback()).await.unwrap();
    h.plugin.after_run(root.scope().into_invocation()).await;

    let invocation = h.span("invocation");
    assert_eq!(int_attribute(&invocation, GEN_AI_USAGE_INPUT_TOKENS), Some(18));
    assert_eq!(int_attribute(&invocation, GEN_AI_USAGE_OUTPUT_TOKENS), Some(8));
    assert_eq!(int_attribute(&invocation, GEN_AI_USAGE_TOTAL_TOKENS), Some(26));
    assert_eq!(string_attribute(&invocation, GEN_AI_OUTPUT).as_deref(), Some("Pack an umbrella."));

    let calls: Vec<_> = h.spans().into_iter().filter(|s| s.name == "chat doubao-pro").collect();
    assert_eq!(calls.len(), 2);
    // Each model call span carries its own usage only.
    let second =
        calls.iter().find(|s| int_attribute(s, GEN_AI_USAGE_INPUT_TOKENS) == Some(8)).unwrap();
    assert_eq!(int_attribute(second, GEN_AI_USAGE_OUTPUT_TOKENS), Some(3));

    let totals = h.metrics.snapshot();
    assert_eq!(totals.input_tokens, 18);
    assert_eq!(totals.output_tokens, 8);
    assert_eq!(totals.chat_count, 2);

    let metrics = h.reader.metrics();
    let tokens = histogram::<u64>(&metrics, TOKEN_USAGE);
    let tokens_of = |direction: &str| -> u64 {
        tokens
            .data_points
            .iter()
            .filter(|point| has_attribute(&point.attributes, "gen_ai.token.type", direction))
            .map(|point| point.sum)
            .sum()
    };
    assert_eq!(tokens_of("input"), 18);
    assert_eq!(tokens_of("output"), 8);
    let chats: u64 =
        sum::<u64>(&metrics, CHAT_COUNT).data_points.iter().map(|point| point.value).sum();
    assert_eq!(chats, 2);
    // The invocation and both model calls.
    let durations: u64 = histogram::<f64>(&metrics, OPERATION_DURATION)
        .data_points
        .iter()
        .map(|point| point.count)
        .sum();
    assert_eq!(durations, 3);
}

#[tokio::test]
async fn test_streaming_response() {
    let h = Harness::new();
    let root = TestContext::invocation("hi");

    h.plugin.before_run(root.scope().into_invocation()).await.unwrap();
    h.plugin.before_model(root.scope().into_callback(), &request("hi")).await.unwrap();

    let thinking =
        LlmResponse::partial(Content::new("model").with_part(Part::thinking_part("greet back")));
    h.plugin.after_model(root.scope().into_callback(), &thinking).await.unwrap();
    for chunk in ["Hel", "lo ", "there"] {
        let partial = LlmResponse::partial(Content::new("model").with_text(chunk));
        h.plugin.after_model(root.scope().into_callback(), &partial).await.unwrap();
    }

    // Nothing has ended while chunks are still streaming.
    assert!(h.spans().is_empty());
    assert_eq!(h.metrics.snapshot().first_token_records, 1);

    let mut last = LlmResponse::new(Content::new("model")).with_usage(4, 3);
    last.finish_reason = Some(FinishReason::Stop);
    h.plugin.after_model(root.scope().into_callback(), &last).await.unwrap();
    h.plugin.after_run(root.scope().into_invocation()).await;

    let llm = h.span("chat doubao-pro");
    assert_eq!(
        string_attribute(&llm, "gen_ai.completion.0.content").as_deref(),
        Some("Hello there")
    );
    assert_eq!(llm.events.iter().filter(|e| e.name == THOUGHT_EVENT).count(), 1);
    assert_eq!(llm.events.iter().filter(|e| e.name == GEN_AI_CHOICE_EVENT).count(), 1);

    let totals = h.metrics.snapshot();
    assert_eq!(totals.first_token_records, 1);
    assert_eq!(totals.time_to_generate_records, 1);
    assert_eq!(totals.time_per_output_token_records, 1);
    assert_eq!(
        string_attribute(&h.span("invocation"), GEN_AI_OUTPUT).as_deref(),
        Some("Hello there")
    );
}

#[tokio::test]
async fn test_model_error_marks_span() {
    let h = Harness::new();
    let root = TestContext::invocation("hi");

    h.plugin.before_run(root.scope().into_invocation()).await.unwrap();
    let req = request("hi");
    h.plugin.before_model(root.scope().into_callback(), &req).await.unwrap();
    h.plugin.on_model_error(root.scope().into_callback(), &req, "rate limited").await.unwrap();
    // A late chunk for the failed call is ignored.
    h.plugin.after_model(root.scope().into_callback(), &answer("late", 1, 1)).await.unwrap();
    h.plugin.after_run(root.scope().into_invocation()).await;

    let llm = h.span("chat doubao-pro");
    assert_eq!(llm.status, Status::error("rate limited"));
    assert_eq!(string_attribute(&llm, "error.type").as_deref(), Some("rate limited"));
    assert_eq!(h.spans().iter().filter(|s| s.name == "chat doubao-pro").count(), 1);

    let totals = h.metrics.snapshot();
    assert_eq!(totals.exceptions, 1);
    assert_eq!(totals.chat_count, 0);

    let metrics = h.reader.metrics();
    let exceptions = sum::<u64>(&metrics, EXCEPTIONS);
    assert_eq!(exceptions.data_points.len(), 1);
    assert_eq!(exceptions.data_points[0].value, 1);
    assert!(has_attribute(&exceptions.data_points[0].attributes, "error.type", "error"));
    assert!(!common::has_metric(&metrics, CHAT_COUNT));
}

#[tokio::test]
async fn test_error_response_takes_error_path() {
    let h = Harness::new();
    let root = TestContext::invocation("hi");

    h.plugin.before_model(root.scope().into_callback(), &request("hi")).await.unwrap();
    let mut failed = LlmResponse::new(Content::new("model"));
    failed.error_code = Some("500".to_string());
    failed.error_message = Some("upstream unavailable".to_string());
    h.plugin.after_model(root.scope().into_callback(), &failed).await.unwrap();

    let llm = h.span("chat doubao-pro");
    assert_eq!(llm.status, Status::error("upstream unavailable"));
    assert_eq!(h.metrics.snapshot().exceptions, 1);
}

#[tokio::test]
async fn test_tool_error() {
    let h = Harness::new();
    let root = TestContext::invocation("hi");
    let args = json!({"q": "x"});

    h.plugin.before_tool(root.scope().into_tool(), "search", &args).await.unwrap();
    h.plugin.on_tool_error(root.scope().into_tool(), "search", &args, "timeout").await.unwrap();

    let tool = h.span("execute_tool search");
    assert_eq!(tool.status, Status::error("timeout"));
    assert_eq!(h.metrics.snapshot().exceptions, 1);
}

#[tokio::test]
async fn test_missing_scope_is_noop() {
    let h = Harness::new();
    let root = TestContext::invocation("hi");

    h.plugin.after_run(root.scope().into_invocation()).await;
    assert!(h.plugin.after_agent(root.scope().into_callback()).await.unwrap().is_none());
    let response = answer("x", 1, 1);
    assert!(h.plugin.after_model(root.scope().into_callback(), &response).await.unwrap().is_none());
    let tool = root.scope().call("c").into_tool();
    h.plugin.after_tool(tool, "t", &json!({}), &json!({})).await.unwrap();
    h.plugin.on_tool_error(root.scope().into_tool(), "t", &json!({}), "boom").await.unwrap();

    assert!(h.spans().is_empty());
    assert_eq!(h.metrics.snapshot(), Default::default());
}

#[tokio::test]
async fn test_double_close_is_ignored() {
    let h = Harness::new();
    let root = TestContext::invocation("hi");

    h.plugin.before_agent(root.scope().into_callback()).await.unwrap();
    h.plugin.after_agent(root.scope().into_callback()).await.unwrap();
    h.plugin.after_agent(root.scope().into_callback()).await.unwrap();

    assert_eq!(h.spans().len(), 1);
}

#[tokio::test]
async fn test_host_spans_are_mapped_and_purged_later() {
    let h = Harness::new();
    let host_run = span_context(0xabc, 1);
    let host_llm = span_context(0xabc, 2);
    let root = TestContext::invocation("hi");

    h.plugin.before_run(root.scope().host(host_run.clone()).into_invocation()).await.unwrap();
    let ctx = root.scope().host(host_llm.clone()).into_callback();
    h.plugin.before_model(ctx, &request("hi")).await.unwrap();

    assert_eq!(h.registry.active_invocation_count(), 1);
    let own_llm = h.registry.get_own_span_context(host_llm.span_id()).unwrap();
    let own_trace = h.registry.get_own_trace_id(host_run.trace_id()).unwrap();
    assert_eq!(own_llm.trace_id(), own_trace);
    assert_ne!(own_trace, host_run.trace_id());

    h.plugin.after_model(root.scope().into_callback(), &answer("hello", 2, 1)).await.unwrap();
    h.plugin.after_run(root.scope().into_invocation()).await;

    // The invocation is no longer active, but its mappings outlive it for the grace period.
    assert_eq!(h.registry.active_invocation_count(), 0);
    assert!(h.registry.get_own_span_context(host_run.span_id()).is_some());
}

#[tokio::test]
async fn test_stale_model_call_closed_on_next_call() {
    let h = Harness::new();
    let root = TestContext::invocation("hi");

    h.plugin.before_model(root.scope().into_callback(), &request("first")).await.unwrap();
    h.plugin.before_model(root.scope().into_callback(), &request("second")).await.unwrap();
    h.plugin.after_model(root.scope().into_callback(), &answer("done", 1, 1)).await.unwrap();

    assert_eq!(h.spans().iter().filter(|s| s.name == "chat doubao-pro").count(), 2);
}
