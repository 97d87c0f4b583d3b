//! One decision cycle: prompt the engine, run the tools it picks, record the outcome.
use crate::authorizer;
use crate::domain::error::AgentError;
use crate::domain::metadata::LogMetadata;
use crate::domain::permissions::{parse_micro_units, PermissionCatalog};
use crate::domain::state_machine::transition;
use crate::domain::types::{
    ActionTargets, CycleEvent, CycleState, ExecuteRequest, ExecutionContext, ExecutionResult,
    LogStatus, ToolCall, ToolResult,
};
use crate::features::delegation::DelegatedSubmitter;
use crate::features::inference::{InferenceAdapter, InferenceRequest};
use crate::prompt;
use crate::storage::stable::{self, NewAgentLog};
use crate::timing::current_time_ns;
use crate::tools::{self, ToolContext};
use canlog::{log, GetLogFilter, LogFilter, LogPriorityLevels};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, LogPriorityLevels)]
enum AgentLogPriority {
    #[log_level(capacity = 2000, name = "AGENT_INFO")]
    Info,
    #[log_level(capacity = 500, name = "AGENT_ERROR")]
    Error,
}

impl GetLogFilter for AgentLogPriority {
    fn get_log_filter() -> LogFilter {
        LogFilter::ShowAll
    }
}

/// Collaborators a cycle needs beyond the execution context.
pub struct CycleDeps<'a> {
    pub engine: &'a dyn InferenceAdapter,
    pub submitter: &'a dyn DelegatedSubmitter,
    pub targets: &'a ActionTargets,
}

fn advance(state: CycleState, event: &CycleEvent, cycle_id: &str) -> Result<CycleState, AgentError> {
    let next = transition(&state, event).map_err(|error| {
        AgentError::Validation(format!(
            "cycle {cycle_id} cannot leave {:?} on {}: {}",
            error.from, error.event, error.reason
        ))
    })?;
    log!(
        AgentLogPriority::Info,
        "cycle={} state_transition from={:?} to={:?}",
        cycle_id,
        state,
        next
    );
    Ok(next)
}

fn action_text(prompt: Option<&str>) -> String {
    match prompt.map(str::trim).filter(|prompt| !prompt.is_empty()) {
        Some(prompt) => format!("Agent execution: {prompt}"),
        None => "Agent execution".to_string(),
    }
}

/// Runs one cycle for an authorized context and appends its audit record.
///
/// The engine is consulted exactly once. Rejected on-chain actions are data
/// inside the tool results, never an `Err`. An engine failure returns
/// `AgentError::Inference` and leaves the log untouched.
pub async fn run_execution_cycle(
    ctx: &ExecutionContext,
    user_prompt: Option<&str>,
    deps: &CycleDeps<'_>,
) -> Result<ExecutionResult, AgentError> {
    let subscription = &ctx.subscription;
    let cycle_id = format!("{}-{}", subscription.id, current_time_ns());
    let mut state = advance(CycleState::Idle, &CycleEvent::Started, &cycle_id)?;

    let request = InferenceRequest {
        cycle_id: cycle_id.clone(),
        system: prompt::SYSTEM_INSTRUCTION.to_string(),
        prompt: prompt::build_cycle_prompt(&ctx.bundle, user_prompt),
        tools: tools::openrouter_tools(),
    };

    let output = match deps.engine.generate(&request).await {
        Ok(output) => output,
        Err(reason) => {
            advance(
                state,
                &CycleEvent::EngineFailed {
                    reason: reason.clone(),
                },
                &cycle_id,
            )?;
            log!(
                AgentLogPriority::Error,
                "cycle={} subscription={} engine_failed error={}",
                cycle_id,
                subscription.id,
                reason
            );
            return Err(AgentError::Inference(reason));
        }
    };

    let tool_ctx = ToolContext {
        subscription,
        envelope: ctx.envelope.as_ref(),
        targets: deps.targets,
    };
    let mut tool_results = Vec::with_capacity(output.tool_calls.len());
    for call in &output.tool_calls {
        let result = tools::execute_tool_call(call, &tool_ctx, deps.submitter).await;
        log!(
            AgentLogPriority::Info,
            "cycle={} tool={} status={:?} tx_hash={}",
            cycle_id,
            result.tool,
            result.status,
            result.transaction_hash.as_deref().unwrap_or("-")
        );
        tool_results.push(result);
    }

    let tool_call_count = u32::try_from(output.tool_calls.len()).unwrap_or(u32::MAX);
    state = advance(
        state,
        &CycleEvent::EngineReturned {
            tool_calls: tool_call_count,
        },
        &cycle_id,
    )?;
    let status = if state == CycleState::Executed {
        LogStatus::Executed
    } else {
        LogStatus::Analysed
    };

    let metadata = LogMetadata {
        text: Some(output.text.clone()),
        tool_calls: Some(output.tool_calls.clone()),
        tool_results: Some(tool_results.clone()),
        amount: settled_relayer_amount(&output.tool_calls, &tool_results),
        current_eth_ratio: settled_eth_ratio(&output.tool_calls, &tool_results),
        error: None,
    };
    let transaction_hash = tool_results
        .iter()
        .find(|result| result.is_success())
        .and_then(|result| result.transaction_hash.clone());

    let log_row = stable::append_agent_log(NewAgentLog {
        subscription_id: subscription.id.clone(),
        agent_name: ctx.agent_name.clone(),
        action: action_text(user_prompt),
        status,
        transaction_hash,
        metadata: Some(metadata.to_json()),
    });
    log!(
        AgentLogPriority::Info,
        "cycle={} subscription={} agent={} status={} tool_calls={} log={}",
        cycle_id,
        subscription.id,
        ctx.agent_name,
        status.as_str(),
        tool_call_count,
        log_row.id
    );

    Ok(ExecutionResult {
        subscription_id: subscription.id.clone(),
        log_id: log_row.id,
        status,
        text: output.text,
        tool_calls: output.tool_calls,
        tool_results,
    })
}

/// `run_execution_cycle`, plus an `Error` audit row when the engine fails so
/// the failed attempt is still visible in the subscription's history.
pub async fn run_and_record(
    ctx: &ExecutionContext,
    user_prompt: Option<&str>,
    deps: &CycleDeps<'_>,
) -> Result<ExecutionResult, AgentError> {
    let outcome = run_execution_cycle(ctx, user_prompt, deps).await;
    if let Err(AgentError::Inference(reason)) = &outcome {
        let metadata = LogMetadata {
            error: Some(reason.clone()),
            ..LogMetadata::default()
        };
        stable::append_agent_log(NewAgentLog {
            subscription_id: ctx.subscription.id.clone(),
            agent_name: ctx.agent_name.clone(),
            action: action_text(user_prompt),
            status: LogStatus::Error,
            transaction_hash: None,
            metadata: Some(metadata.to_json()),
        });
    }
    outcome
}

/// Authorizes `request` for `user_id` and runs one recorded cycle.
pub async fn execute_agent_with(
    catalog: &PermissionCatalog,
    user_id: &str,
    request: &ExecuteRequest,
    deps: &CycleDeps<'_>,
    now_secs: u64,
) -> Result<ExecutionResult, AgentError> {
    if stable::find_user(user_id).is_none() {
        return Err(AgentError::Unauthorized(
            "connect a wallet before executing agents".to_string(),
        ));
    }
    let ctx = authorizer::authorize(
        catalog,
        user_id,
        &request.subscription_id,
        &request.agent_name,
        now_secs,
    )?;
    run_and_record(&ctx, request.prompt.as_deref(), deps).await
}

fn successful_calls<'a>(
    calls: &'a [ToolCall],
    results: &'a [ToolResult],
) -> impl Iterator<Item = &'a ToolCall> {
    calls
        .iter()
        .zip(results)
        .filter(|(_, result)| result.is_success())
        .map(|(call, _)| call)
}

fn settled_relayer_amount(calls: &[ToolCall], results: &[ToolResult]) -> Option<String> {
    let amounts = successful_calls(calls, results)
        .filter_map(tools::declared_relayer_amount)
        .filter_map(|amount| parse_micro_units(&amount).ok())
        .collect::<Vec<_>>();
    if amounts.is_empty() {
        return None;
    }
    Some(
        amounts
            .into_iter()
            .fold(0u128, u128::saturating_add)
            .to_string(),
    )
}

fn settled_eth_ratio(calls: &[ToolCall], results: &[ToolResult]) -> Option<String> {
    successful_calls(calls, results)
        .filter_map(tools::declared_eth_ratio)
        .last()
}
