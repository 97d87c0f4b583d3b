/// Decision-engine abstraction for the agent loop.
///
/// The engine is a black box: it receives the system instruction, the cycle
/// prompt and the tool schemas, and answers with free text plus zero or more
/// tool calls. Two backends exist:
/// - `OpenRouterInferenceAdapter`: OpenRouter chat completions via a
///   non-replicated IC HTTPS outcall.
/// - `DeterministicInferenceAdapter`: rule-based planner selected with the
///   `deterministic-local` model name, used on local replicas and in tests.
use crate::domain::types::{RuntimeConfig, ToolCall};
use crate::prompt;
use crate::timing::{
    current_time_ns, elapsed_ms, INFERENCE_OUTCALL_TIMEOUT_MS, INFERENCE_OUTCALL_TIMEOUT_NS,
};
use async_trait::async_trait;
use candid::Nat;
use canlog::{log, GetLogFilter, LogFilter, LogPriorityLevels};
use ic_cdk::management_canister::{
    http_request, HttpHeader, HttpMethod, HttpRequestArgs, HttpRequestResult,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const DETERMINISTIC_MODEL: &str = "deterministic-local";
const REQUEST_NO_ACTION_MARKER: &str = "request_no_action:true";
const REQUEST_INFERENCE_ERROR_MARKER: &str = "request_inference_error:true";
const DETERMINISTIC_REBALANCE_RATIO: &str = "0.6";
const DETERMINISTIC_RELAYER_AMOUNT: &str = "1000000";

#[derive(Clone, Copy, Serialize, Deserialize, LogPriorityLevels)]
enum InferenceLogPriority {
    #[log_level(capacity = 2000, name = "INFERENCE_INFO")]
    Info,
    #[log_level(capacity = 2000, name = "INFERENCE_ERROR")]
    Error,
}

impl GetLogFilter for InferenceLogPriority {
    fn get_log_filter() -> LogFilter {
        LogFilter::ShowAll
    }
}

#[derive(Clone, Debug)]
pub struct InferenceRequest {
    /// Correlates engine log lines with the cycle that issued them.
    pub cycle_id: String,
    pub system: String,
    pub prompt: String,
    /// OpenAI-style function tool schemas.
    pub tools: Vec<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

#[async_trait(?Send)]
pub trait InferenceAdapter {
    async fn generate(&self, request: &InferenceRequest) -> Result<EngineOutput, String>;
}

/// Picks the backend named by the configured model.
pub fn adapter_for_config(config: &RuntimeConfig) -> Box<dyn InferenceAdapter> {
    if config.inference_model.trim() == DETERMINISTIC_MODEL {
        Box::new(DeterministicInferenceAdapter)
    } else {
        Box::new(OpenRouterInferenceAdapter::from_config(config))
    }
}

// ── Deterministic planner ───────────────────────────────────────────────────

/// Plans from the context bundle alone: one call per allowed method it
/// recognises, wired to the permission context and manager from the bundle.
///
/// The user request may carry `amount:<micro-units>` to override the relayer
/// amount, and the markers `request_no_action:true` / `request_inference_error:true`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeterministicInferenceAdapter;

#[async_trait(?Send)]
impl InferenceAdapter for DeterministicInferenceAdapter {
    async fn generate(&self, request: &InferenceRequest) -> Result<EngineOutput, String> {
        run_deterministic_inference(request)
    }
}

fn run_deterministic_inference(request: &InferenceRequest) -> Result<EngineOutput, String> {
    let user_request = prompt::user_request_of(&request.prompt).unwrap_or_default();
    if user_request.contains(REQUEST_INFERENCE_ERROR_MARKER) {
        return Err("deterministic engine failure requested".to_string());
    }
    if user_request.contains(REQUEST_NO_ACTION_MARKER) {
        return Ok(EngineOutput {
            text: "No action needed: current state is within target bounds.".to_string(),
            tool_calls: Vec::new(),
        });
    }

    let context = prompt::bundle_field(&request.prompt, prompt::PERMISSION_CONTEXT_LABEL)
        .unwrap_or_default();
    let manager = prompt::bundle_field(&request.prompt, prompt::DELEGATION_MANAGER_LABEL)
        .unwrap_or_default();
    let offered = offered_tool_names(&request.tools);

    let mut tool_calls = Vec::new();
    if request.prompt.contains("rebalance(uint256)") && offered.contains(&"rebalance_portfolio") {
        tool_calls.push(ToolCall {
            tool_call_id: Some(format!("{}-{}", request.cycle_id, tool_calls.len())),
            tool: "rebalance_portfolio".to_string(),
            args_json: json!({
                "currentEthRatio": DETERMINISTIC_REBALANCE_RATIO,
                "permissionsContext": context,
                "delegationManager": manager,
            })
            .to_string(),
        });
    }
    if request.prompt.contains("payRelayer(uint256)") && offered.contains(&"pay_gas_relayer") {
        let amount = requested_amount(user_request)
            .unwrap_or_else(|| DETERMINISTIC_RELAYER_AMOUNT.to_string());
        tool_calls.push(ToolCall {
            tool_call_id: Some(format!("{}-{}", request.cycle_id, tool_calls.len())),
            tool: "pay_gas_relayer".to_string(),
            args_json: json!({
                "amount": amount,
                "permissionsContext": context,
                "delegationManager": manager,
            })
            .to_string(),
        });
    }

    let text = if tool_calls.is_empty() {
        "No permitted action applies to the current state.".to_string()
    } else {
        let names = tool_calls
            .iter()
            .map(|call| call.tool.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        format!("Executing within granted permissions: {names}.")
    };
    Ok(EngineOutput { text, tool_calls })
}

fn offered_tool_names(tools: &[Value]) -> Vec<&str> {
    tools
        .iter()
        .filter_map(|tool| {
            tool.get("function")
                .and_then(|function| function.get("name"))
                .and_then(Value::as_str)
        })
        .collect()
}

fn requested_amount(user_request: &str) -> Option<String> {
    let (_, rest) = user_request.split_once("amount:")?;
    let digits = rest
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>();
    (!digits.is_empty()).then_some(digits)
}

// ── OpenRouter ──────────────────────────────────────────────────────────────

pub struct OpenRouterInferenceAdapter {
    model: String,
    base_url: String,
    api_key: Option<String>,
    max_response_bytes: u64,
}

impl OpenRouterInferenceAdapter {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            model: config.inference_model.clone(),
            base_url: config.openrouter_base_url.clone(),
            api_key: config.openrouter_api_key.clone(),
            max_response_bytes: config.openrouter_max_response_bytes,
        }
    }

    fn validate_config(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("openrouter model cannot be empty".to_string());
        }
        if self.base_url.trim().is_empty() {
            return Err("openrouter base url cannot be empty".to_string());
        }
        if self.max_response_bytes == 0 {
            return Err("openrouter max_response_bytes must be > 0".to_string());
        }
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| "openrouter api key is not configured".to_string())?;
        if api_key.trim().is_empty() {
            return Err("openrouter api key is empty".to_string());
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl InferenceAdapter for OpenRouterInferenceAdapter {
    async fn generate(&self, request: &InferenceRequest) -> Result<EngineOutput, String> {
        self.validate_config()?;

        let api_key = self.api_key.clone().unwrap_or_default();
        let payload = serde_json::to_vec(&build_openrouter_request_body(request, &self.model))
            .map_err(|error| format!("failed to build openrouter request payload: {error}"))?;

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let outcall = HttpRequestArgs {
            url,
            max_response_bytes: Some(self.max_response_bytes),
            method: HttpMethod::POST,
            headers: vec![
                HttpHeader {
                    name: "content-type".to_string(),
                    value: "application/json".to_string(),
                },
                HttpHeader {
                    name: "authorization".to_string(),
                    value: format!("Bearer {api_key}"),
                },
            ],
            body: Some(payload),
            transform: None,
            is_replicated: Some(false),
        };

        log!(
            InferenceLogPriority::Info,
            "cycle={} provider=openrouter model={} tools={} outcall_non_replicated=true",
            request.cycle_id,
            self.model,
            request.tools.len()
        );

        let started_at_ns = current_time_ns();
        let outcome = http_request(&outcall).await;
        let finished_at_ns = current_time_ns();
        let elapsed = elapsed_ms(started_at_ns, finished_at_ns);
        if finished_at_ns.saturating_sub(started_at_ns) > INFERENCE_OUTCALL_TIMEOUT_NS {
            log!(
                InferenceLogPriority::Error,
                "cycle={} provider=openrouter outcall_timeout elapsed_ms={} timeout_ms={}",
                request.cycle_id,
                elapsed,
                INFERENCE_OUTCALL_TIMEOUT_MS
            );
            return Err(format!(
                "openrouter outcall timed out: elapsed={elapsed} ms timeout={INFERENCE_OUTCALL_TIMEOUT_MS} ms"
            ));
        }

        let response = outcome.map_err(|error| {
            let message = format!("openrouter http outcall failed: {error}");
            log!(
                InferenceLogPriority::Error,
                "cycle={} provider=openrouter outcall_failed elapsed_ms={} error={}",
                request.cycle_id,
                elapsed,
                message
            );
            message
        })?;

        let parsed = parse_openrouter_http_response(response);
        if let Ok(output) = &parsed {
            log!(
                InferenceLogPriority::Info,
                "cycle={} provider=openrouter completed elapsed_ms={} tool_calls={}",
                request.cycle_id,
                elapsed,
                output.tool_calls.len()
            );
        }
        parsed
    }
}

fn build_openrouter_request_body(request: &InferenceRequest, model: &str) -> Value {
    json!({
        "model": model,
        "messages": [
            { "role": "system", "content": request.system },
            { "role": "user", "content": request.prompt },
        ],
        "tool_choice": "auto",
        "tools": request.tools,
    })
}

fn parse_openrouter_http_response(response: HttpRequestResult) -> Result<EngineOutput, String> {
    let status = nat_to_status_code(&response.status)?;
    let body = String::from_utf8(response.body)
        .map_err(|error| format!("openrouter response was not valid utf-8: {error}"))?;

    if !(200..300).contains(&status) {
        return Err(format!("openrouter returned status {status}: {body}"));
    }

    parse_openrouter_completion(&body)
}

#[derive(Deserialize)]
struct OpenRouterResponse {
    choices: Vec<OpenRouterChoice>,
}

#[derive(Deserialize)]
struct OpenRouterChoice {
    message: OpenRouterMessage,
}

#[derive(Deserialize)]
struct OpenRouterMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenRouterToolCall>>,
}

#[derive(Deserialize)]
struct OpenRouterToolCall {
    id: Option<String>,
    function: OpenRouterFunction,
}

#[derive(Deserialize)]
struct OpenRouterFunction {
    name: String,
    arguments: String,
}

enum ToolArgsError {
    JsonParse(String),
    NotObject,
}

fn parse_relaxed_json_value(raw: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => Ok(value),
        Err(primary_error) => {
            json5::from_str::<Value>(raw).map_err(|_| primary_error.to_string())
        }
    }
}

fn parse_tool_args_candidate(raw: &str) -> Result<Value, ToolArgsError> {
    let parsed = parse_relaxed_json_value(raw).map_err(ToolArgsError::JsonParse)?;
    match parsed {
        Value::Object(_) => Ok(parsed),
        // Some models double-encode the arguments object.
        Value::String(nested) => match parse_relaxed_json_value(nested.trim()) {
            Ok(nested_parsed @ Value::Object(_)) => Ok(nested_parsed),
            _ => Err(ToolArgsError::NotObject),
        },
        _ => Err(ToolArgsError::NotObject),
    }
}

fn strip_markdown_code_fence(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return None;
    }

    let mut lines = trimmed.lines();
    lines.next()?;
    let mut body = lines.collect::<Vec<_>>();
    if body.last().map(|line| line.trim()) != Some("```") {
        return None;
    }
    body.pop();
    Some(body.join("\n"))
}

fn parse_tool_arguments(arguments: &str) -> Result<Value, String> {
    let mut candidates = vec![arguments.trim().to_string()];
    if let Some(stripped) = strip_markdown_code_fence(arguments) {
        let stripped = stripped.trim().to_string();
        if !stripped.is_empty() && stripped != candidates[0] {
            candidates.push(stripped);
        }
    }

    let mut last_json_error = None;
    let mut saw_non_object = false;
    for candidate in candidates {
        match parse_tool_args_candidate(&candidate) {
            Ok(parsed) => return Ok(parsed),
            Err(ToolArgsError::JsonParse(error)) => last_json_error = Some(error),
            Err(ToolArgsError::NotObject) => saw_non_object = true,
        }
    }

    if saw_non_object {
        return Err("openrouter tool arguments must be a JSON object".to_string());
    }
    Err(format!(
        "openrouter tool arguments were invalid json: {}",
        last_json_error.unwrap_or_else(|| "unknown parse error".to_string())
    ))
}

fn parse_openrouter_completion(raw: &str) -> Result<EngineOutput, String> {
    let response: OpenRouterResponse = serde_json::from_str(raw)
        .map_err(|error| format!("failed to parse openrouter response json: {error}"))?;

    let first_choice = response
        .choices
        .first()
        .ok_or_else(|| "openrouter response contained no choices".to_string())?;

    let mut tool_calls = Vec::new();
    for tool_call in first_choice.message.tool_calls.iter().flatten() {
        // Unparseable arguments stay raw so the tool layer records them as a failed call.
        let args_json = match parse_tool_arguments(&tool_call.function.arguments) {
            Ok(arguments) => arguments.to_string(),
            Err(error) => {
                log!(
                    InferenceLogPriority::Info,
                    "openrouter_tool_args_unparsed tool={} error={}",
                    tool_call.function.name,
                    error
                );
                tool_call.function.arguments.clone()
            }
        };
        tool_calls.push(ToolCall {
            tool_call_id: tool_call.id.clone().filter(|id| !id.trim().is_empty()),
            tool: tool_call.function.name.clone(),
            args_json,
        });
    }

    Ok(EngineOutput {
        text: first_choice.message.content.clone().unwrap_or_default(),
        tool_calls,
    })
}

fn nat_to_status_code(status: &Nat) -> Result<u16, String> {
    status
        .to_string()
        .parse::<u16>()
        .map_err(|error| format!("invalid http status value {status}: {error}"))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::block_on_with_spin;

    fn tool_schemas(names: &[&str]) -> Vec<Value> {
        names
            .iter()
            .map(|name| json!({ "type": "function", "function": { "name": name } }))
            .collect()
    }

    fn bundle(methods: &str) -> String {
        format!(
            "Agent: Gas Optimiser\nAllowed Methods: {methods}\nTechnical Details:\n- {}: 0xc0ffee\n- {}: 0xdb9b1e94b5b69df7e401ddbede43491141047db3\n",
            prompt::PERMISSION_CONTEXT_LABEL,
            prompt::DELEGATION_MANAGER_LABEL,
        )
    }

    fn request(methods: &str, user_prompt: Option<&str>) -> InferenceRequest {
        InferenceRequest {
            cycle_id: "cycle-1".to_string(),
            system: prompt::SYSTEM_INSTRUCTION.to_string(),
            prompt: prompt::build_cycle_prompt(&bundle(methods), user_prompt),
            tools: tool_schemas(&["rebalance_portfolio", "pay_gas_relayer"]),
        }
    }

    #[test]
    fn deterministic_plans_relayer_payment_from_bundle() {
        let output = block_on_with_spin(
            DeterministicInferenceAdapter.generate(&request("payRelayer(uint256)", None)),
        )
        .unwrap();
        assert_eq!(output.tool_calls.len(), 1);
        let call = &output.tool_calls[0];
        assert_eq!(call.tool, "pay_gas_relayer");
        let args: Value = serde_json::from_str(&call.args_json).unwrap();
        assert_eq!(args["amount"], "1000000");
        assert_eq!(args["permissionsContext"], "0xc0ffee");
        assert_eq!(
            args["delegationManager"],
            "0xdb9b1e94b5b69df7e401ddbede43491141047db3"
        );
    }

    #[test]
    fn deterministic_honours_amount_and_markers() {
        let output = block_on_with_spin(DeterministicInferenceAdapter.generate(&request(
            "payRelayer(uint256)",
            Some("pay the relayer amount:250000"),
        )))
        .unwrap();
        let args: Value = serde_json::from_str(&output.tool_calls[0].args_json).unwrap();
        assert_eq!(args["amount"], "250000");

        let idle = block_on_with_spin(DeterministicInferenceAdapter.generate(&request(
            "rebalance(uint256)",
            Some("request_no_action:true"),
        )))
        .unwrap();
        assert!(idle.tool_calls.is_empty());

        let error = block_on_with_spin(DeterministicInferenceAdapter.generate(&request(
            "rebalance(uint256)",
            Some("request_inference_error:true"),
        )))
        .unwrap_err();
        assert!(error.contains("failure requested"));
    }

    #[test]
    fn deterministic_plans_rebalance_with_fixed_ratio() {
        let output = block_on_with_spin(
            DeterministicInferenceAdapter.generate(&request("rebalance(uint256)", None)),
        )
        .unwrap();
        assert_eq!(output.tool_calls.len(), 1);
        let args: Value = serde_json::from_str(&output.tool_calls[0].args_json).unwrap();
        assert_eq!(args["currentEthRatio"], "0.6");
    }

    #[test]
    fn adapter_selection_follows_model_name() {
        let config = RuntimeConfig {
            inference_model: DETERMINISTIC_MODEL.to_string(),
            ..RuntimeConfig::default()
        };
        let output = block_on_with_spin(
            adapter_for_config(&config).generate(&request("rebalance(uint256)", None)),
        )
        .unwrap();
        assert_eq!(output.tool_calls.len(), 1);
    }

    #[test]
    fn request_body_carries_system_prompt_and_tools() {
        let body = build_openrouter_request_body(&request("rebalance(uint256)", None), "m");
        assert_eq!(body["model"], "m");
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["tools"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn parse_openrouter_completion_maps_tool_calls() {
        let payload = r#"{
            "choices": [{
                "message": {
                    "content": "rebalancing",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "rebalance_portfolio",
                            "arguments": "{\"currentEthRatio\":\"0.55\"}"
                        }
                    }]
                }
            }]
        }"#;

        let out = parse_openrouter_completion(payload).unwrap();
        assert_eq!(out.text, "rebalancing");
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(out.tool_calls[0].args_json, r#"{"currentEthRatio":"0.55"}"#);
    }

    #[test]
    fn parse_openrouter_completion_accepts_relaxed_arguments() {
        let payload = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [
                        { "function": { "name": "pay_gas_relayer", "arguments": "{amount: '5',}" } },
                        { "function": { "name": "pay_gas_relayer", "arguments": "```json\n{\"amount\":\"6\"}\n```" } }
                    ]
                }
            }]
        }"#;

        let out = parse_openrouter_completion(payload).unwrap();
        assert_eq!(out.text, "");
        assert_eq!(out.tool_calls[0].args_json, r#"{"amount":"5"}"#);
        assert_eq!(out.tool_calls[1].args_json, r#"{"amount":"6"}"#);
    }

    #[test]
    fn parse_openrouter_completion_keeps_unparseable_arguments_raw() {
        let payload = r#"{
            "choices": [{
                "message": {
                    "content": "paying",
                    "tool_calls": [
                        { "function": { "name": "pay_gas_relayer", "arguments": "{amount: " } },
                        { "function": { "name": "x", "arguments": "\"just-string\"" } },
                        { "function": { "name": "pay_gas_relayer", "arguments": "{\"amount\":\"2\"}" } }
                    ]
                }
            }]
        }"#;
        let out = parse_openrouter_completion(payload).unwrap();
        assert_eq!(out.text, "paying");
        assert_eq!(out.tool_calls.len(), 3);
        assert_eq!(out.tool_calls[0].args_json, "{amount: ");
        assert_eq!(out.tool_calls[1].args_json, "\"just-string\"");
        assert_eq!(out.tool_calls[2].args_json, r#"{"amount":"2"}"#);
        assert!(parse_openrouter_completion(r#"{"choices":[]}"#).is_err());
    }

    #[test]
    fn openrouter_config_validation_rejects_missing_api_key() {
        let adapter = OpenRouterInferenceAdapter::from_config(&RuntimeConfig::default());
        let error = adapter.validate_config().unwrap_err();
        assert!(error.contains("api key"));
    }
}
