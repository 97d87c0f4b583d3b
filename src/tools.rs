use crate::domain::types::{
    ActionTargets, PermissionEnvelope, Subscription, ToolCall, ToolResult, ToolStatus,
};
use crate::features::delegation::{encode_uint256_call, DelegatedCall, DelegatedSubmitter};
use alloy_primitives::U256;
use serde_json::{json, Value};

const RATIO_SCALE_DIGITS: usize = 18;
const DEFAULT_RELAYER_AMOUNT: &str = "1000000";

/// Closed set of on-chain actions an agent may request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    RebalancePortfolio,
    PayGasRelayer,
}

impl Action {
    pub fn all() -> [Action; 2] {
        [Action::RebalancePortfolio, Action::PayGasRelayer]
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all()
            .into_iter()
            .find(|action| action.name() == name.trim())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RebalancePortfolio => "rebalance_portfolio",
            Self::PayGasRelayer => "pay_gas_relayer",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::RebalancePortfolio => {
                "Rebalance the user portfolio within approved limits. Calculates current ETH ratio and executes rebalance if needed."
            }
            Self::PayGasRelayer => {
                "Pay gas relayer fees on behalf of the user within approved limits."
            }
        }
    }

    /// Solidity signature of the contract method the action calls.
    pub fn method_signature(&self) -> &'static str {
        match self {
            Self::RebalancePortfolio => "rebalance(uint256)",
            Self::PayGasRelayer => "payRelayer(uint256)",
        }
    }

    pub fn parameters_schema(&self) -> Value {
        let (primary_name, primary_description) = match self {
            Self::RebalancePortfolio => (
                "currentEthRatio",
                "Current ETH ratio as a decimal (e.g., \"0.6\" for 60%)",
            ),
            Self::PayGasRelayer => (
                "amount",
                "Amount in USDC (6 decimals, e.g., \"1000000\" for 1 USDC)",
            ),
        };
        json!({
            "type": "object",
            "properties": {
                primary_name: { "type": "string", "description": primary_description },
                "permissionsContext": { "type": "string", "description": "The permissions context" },
                "delegationManager": { "type": "string", "description": "The delegation manager" },
            },
            "required": [primary_name, "permissionsContext", "delegationManager"],
        })
    }

    fn target<'a>(&self, targets: &'a ActionTargets) -> &'a str {
        match self {
            Self::RebalancePortfolio => &targets.rebalance_contract,
            Self::PayGasRelayer => &targets.gas_relay_contract,
        }
    }

    fn success_text(&self, tx_hash: &str) -> String {
        match self {
            Self::RebalancePortfolio => {
                format!("Portfolio rebalanced successfully. Transaction: {tx_hash}")
            }
            Self::PayGasRelayer => format!("Gas relayer paid successfully. Transaction: {tx_hash}"),
        }
    }

    fn failure_text(&self, error: &str) -> String {
        match self {
            Self::RebalancePortfolio => format!("Rebalance failed: {error}"),
            Self::PayGasRelayer => format!("Gas payment failed: {error}"),
        }
    }

    fn encode_calldata(&self, args: &Value) -> Result<Vec<u8>, String> {
        let value = match self {
            Self::RebalancePortfolio => scale_ratio(
                string_arg(args, "currentEthRatio")
                    .as_deref()
                    .unwrap_or("0"),
            )?,
            Self::PayGasRelayer => parse_amount(
                string_arg(args, "amount")
                    .as_deref()
                    .unwrap_or(DEFAULT_RELAYER_AMOUNT),
            )?,
        };
        Ok(encode_uint256_call(self.method_signature(), value))
    }
}

/// Function-tool schemas for every action, in registry order.
pub fn openrouter_tools() -> Vec<Value> {
    Action::all()
        .iter()
        .map(|action| {
            json!({
                "type": "function",
                "function": {
                    "name": action.name(),
                    "description": action.description(),
                    "parameters": action.parameters_schema(),
                }
            })
        })
        .collect()
}

pub struct ToolContext<'a> {
    pub subscription: &'a Subscription,
    pub envelope: Option<&'a PermissionEnvelope>,
    pub targets: &'a ActionTargets,
}

/// Runs one requested tool call. Every failure, including unknown tools and
/// malformed arguments, is reported in the returned `ToolResult`.
pub async fn execute_tool_call(
    call: &ToolCall,
    ctx: &ToolContext<'_>,
    submitter: &dyn DelegatedSubmitter,
) -> ToolResult {
    let Some(action) = Action::from_name(&call.tool) else {
        let error = format!("unknown tool {}", call.tool);
        return ToolResult {
            tool: call.tool.clone(),
            text: format!("Tool unavailable: {error}"),
            status: ToolStatus::Error,
            transaction_hash: None,
            error: Some(error),
        };
    };

    match submit_action(action, call, ctx, submitter).await {
        Ok(tx_hash) => ToolResult {
            tool: action.name().to_string(),
            text: action.success_text(&tx_hash),
            status: ToolStatus::Success,
            transaction_hash: Some(tx_hash),
            error: None,
        },
        Err(error) => ToolResult {
            tool: action.name().to_string(),
            text: action.failure_text(&error),
            status: ToolStatus::Error,
            transaction_hash: None,
            error: Some(error),
        },
    }
}

async fn submit_action(
    action: Action,
    call: &ToolCall,
    ctx: &ToolContext<'_>,
    submitter: &dyn DelegatedSubmitter,
) -> Result<String, String> {
    let args = parse_args(&call.args_json)?;
    let target = action.target(ctx.targets);
    if let Some(envelope) = ctx.envelope {
        ensure_permitted(envelope, target, action.method_signature())?;
    }

    ensure_own_delegation(&args, ctx.subscription)?;

    let delegated = DelegatedCall {
        chain_id: ctx.subscription.chain_id,
        target: target.to_string(),
        calldata: action.encode_calldata(&args)?,
        permission_context: ctx.subscription.permission_context.clone(),
        delegation_manager: ctx.subscription.delegation_manager.clone(),
    };
    submitter.submit(&delegated).await
}

/// Echoed delegation fields must name the subscription's own grant.
fn ensure_own_delegation(args: &Value, subscription: &Subscription) -> Result<(), String> {
    if let Some(context) = string_arg(args, "permissionsContext") {
        if !context.eq_ignore_ascii_case(&subscription.permission_context) {
            return Err(format!(
                "permissionsContext {context} does not belong to subscription {}",
                subscription.id
            ));
        }
    }
    if let Some(manager) = string_arg(args, "delegationManager") {
        if !manager.eq_ignore_ascii_case(&subscription.delegation_manager) {
            return Err(format!(
                "delegationManager {manager} does not belong to subscription {}",
                subscription.id
            ));
        }
    }
    Ok(())
}

fn ensure_permitted(envelope: &PermissionEnvelope, target: &str, method: &str) -> Result<(), String> {
    if !envelope
        .allowed_targets
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(target))
    {
        return Err(format!("target {target} is not an allowed target contract"));
    }
    if !envelope.allowed_methods.iter().any(|allowed| allowed == method) {
        return Err(format!("method {method} is not an allowed method"));
    }
    Ok(())
}

fn parse_args(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err("tool arguments must be a JSON object".to_string()),
        Err(error) => Err(format!("tool arguments were invalid json: {error}")),
    }
}

/// A non-empty string argument. Numbers are accepted and rendered as text.
fn string_arg(args: &Value, key: &str) -> Option<String> {
    let value = match args.get(key)? {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    (!value.is_empty()).then_some(value)
}

/// Relayer amount declared by a `pay_gas_relayer` call, after defaulting.
pub fn declared_relayer_amount(call: &ToolCall) -> Option<String> {
    if Action::from_name(&call.tool) != Some(Action::PayGasRelayer) {
        return None;
    }
    let args = parse_args(&call.args_json).ok()?;
    let amount = string_arg(&args, "amount").unwrap_or_else(|| DEFAULT_RELAYER_AMOUNT.to_string());
    parse_amount(&amount).ok()?;
    Some(amount)
}

/// ETH ratio declared by a `rebalance_portfolio` call.
pub fn declared_eth_ratio(call: &ToolCall) -> Option<String> {
    if Action::from_name(&call.tool) != Some(Action::RebalancePortfolio) {
        return None;
    }
    string_arg(&parse_args(&call.args_json).ok()?, "currentEthRatio")
}

fn parse_amount(raw: &str) -> Result<U256, String> {
    let digits = raw.trim();
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(format!("amount {raw:?} must be a non-negative integer string"));
    }
    U256::from_str_radix(digits, 10).map_err(|error| format!("amount {raw:?} is out of range: {error}"))
}

/// `floor(ratio * 10^18)` computed on the decimal digits, so `"0.6"` is
/// exactly 600000000000000000.
fn scale_ratio(raw: &str) -> Result<U256, String> {
    let trimmed = raw.trim();
    let (whole, fraction) = trimmed.split_once('.').unwrap_or((trimmed, ""));
    let whole = if whole.is_empty() { "0" } else { whole };
    if !whole.bytes().all(|byte| byte.is_ascii_digit())
        || !fraction.bytes().all(|byte| byte.is_ascii_digit())
        || (whole == "0" && fraction.is_empty() && trimmed.ends_with('.'))
    {
        return Err(format!("currentEthRatio {raw:?} must be a decimal between 0 and 1"));
    }

    let mut scaled_fraction = fraction.chars().take(RATIO_SCALE_DIGITS).collect::<String>();
    while scaled_fraction.len() < RATIO_SCALE_DIGITS {
        scaled_fraction.push('0');
    }
    let scaled = U256::from_str_radix(&format!("{whole}{scaled_fraction}"), 10)
        .map_err(|error| format!("currentEthRatio {raw:?} is out of range: {error}"))?;
    let one = U256::from(10u64).pow(U256::from(RATIO_SCALE_DIGITS));
    if scaled > one {
        return Err(format!("currentEthRatio {raw:?} must be a decimal between 0 and 1"));
    }
    Ok(scaled)
}
