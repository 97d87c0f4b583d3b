//! Gatekeeper between an execution request and the decision loop.
use crate::domain::accounting::MICROS_PER_UNIT;
use crate::domain::error::AgentError;
use crate::domain::permissions::{PermissionCatalog, SECONDS_PER_DAY};
use crate::domain::types::{
    Agent, ExecutionContext, PermissionEnvelope, Subscription, SubscriptionStatus, TokenLimit,
};
use crate::prompt::{DELEGATION_MANAGER_LABEL, PERMISSION_CONTEXT_LABEL};
use crate::storage::stable;
use chrono::{DateTime, Utc};

const NOT_AVAILABLE: &str = "N/A";

/// Loads the subscription, checks the caller owns it and that it may still
/// act, then resolves the agent's envelope and renders the context bundle.
///
/// Ownership is checked before anything else is inspected. The requested
/// agent name must match the subscription; the envelope is always resolved
/// from the subscription's own agent. A missing envelope is not an error:
/// the bundle then reports limits as `N/A`.
pub fn authorize(
    catalog: &PermissionCatalog,
    user_id: &str,
    subscription_id: &str,
    agent_name: &str,
    now_secs: u64,
) -> Result<ExecutionContext, AgentError> {
    let (subscription, agent) = stable::find_subscription_with_agent(subscription_id)
        .ok_or_else(|| AgentError::NotFound(format!("subscription {subscription_id} not found")))?;
    if subscription.user_id != user_id {
        return Err(AgentError::Unauthorized(format!(
            "subscription {subscription_id} belongs to another user"
        )));
    }
    if subscription.status != SubscriptionStatus::Active {
        return Err(AgentError::Validation(format!(
            "subscription {subscription_id} is not active"
        )));
    }

    if subscription.agent_name != agent_name {
        return Err(AgentError::Validation(format!(
            "subscription {subscription_id} is for {}, not {agent_name}",
            subscription.agent_name
        )));
    }

    let agent_name = subscription.agent_name.clone();
    let envelope = catalog.envelope_for(&agent_name).cloned();
    if let Some(envelope) = &envelope {
        if envelope.is_expired(now_secs) {
            return Err(AgentError::Validation(format!(
                "permission for {agent_name} expired at {}",
                iso_timestamp(envelope.expiry_secs)
            )));
        }
    }

    let bundle = render_bundle(&agent_name, agent.as_ref(), envelope.as_ref(), &subscription);
    Ok(ExecutionContext {
        subscription,
        agent_name,
        envelope,
        bundle,
    })
}

/// Human-readable context handed to the decision engine.
pub fn render_bundle(
    agent_name: &str,
    agent: Option<&Agent>,
    envelope: Option<&PermissionEnvelope>,
    subscription: &Subscription,
) -> String {
    let description = agent
        .map(|agent| agent.description.as_str())
        .filter(|description| !description.trim().is_empty())
        .unwrap_or(NOT_AVAILABLE);
    let joined_or_na = |items: Option<&Vec<String>>| {
        items
            .filter(|items| !items.is_empty())
            .map(|items| items.join(", "))
            .unwrap_or_else(|| NOT_AVAILABLE.to_string())
    };
    let targets = joined_or_na(envelope.map(|envelope| &envelope.allowed_targets));
    let methods = joined_or_na(envelope.map(|envelope| &envelope.allowed_methods));
    let limits = envelope
        .map(|envelope| {
            envelope
                .token_limits
                .iter()
                .map(format_limit)
                .collect::<Vec<_>>()
                .join(", ")
        })
        .filter(|limits| !limits.is_empty())
        .unwrap_or_else(|| NOT_AVAILABLE.to_string());
    let expiry = envelope
        .map(|envelope| iso_timestamp(envelope.expiry_secs))
        .unwrap_or_else(|| NOT_AVAILABLE.to_string());

    format!(
        "Agent: {agent_name}\n\
         Description: {description}\n\
         \n\
         Your Permissions:\n\
         - Allowed Target Contracts: {targets}\n\
         - Allowed Methods: {methods}\n\
         - Spending Limits: {limits}\n\
         - Permission Expiry: {expiry}\n\
         \n\
         Technical Details (for transaction execution):\n\
         - {PERMISSION_CONTEXT_LABEL}: {}\n\
         - {DELEGATION_MANAGER_LABEL}: {}\n\
         \n\
         IMPORTANT: The \"Allowed Target Contracts\" above are the contract addresses you can interact with. Use these addresses when calling tools.\n",
        subscription.permission_context, subscription.delegation_manager,
    )
}

fn format_limit(limit: &TokenLimit) -> String {
    let amount = limit
        .amount_micros()
        .map(|micros| format_fraction(micros, MICROS_PER_UNIT))
        .unwrap_or_else(|_| limit.amount.clone());
    let days = format_fraction(u128::from(limit.period_seconds), u128::from(SECONDS_PER_DAY));
    format!("{amount} USDC per {days} day(s)")
}

/// `numerator / denominator` as a decimal with trailing zeros trimmed,
/// at most six fractional digits.
fn format_fraction(numerator: u128, denominator: u128) -> String {
    let whole = numerator / denominator;
    let remainder = numerator % denominator;
    if remainder == 0 {
        return whole.to_string();
    }
    let fraction = remainder.saturating_mul(1_000_000) / denominator;
    let digits = format!("{fraction:06}");
    let trimmed = digits.trim_end_matches('0');
    if trimmed.is_empty() {
        whole.to_string()
    } else {
        format!("{whole}.{trimmed}")
    }
}

/// Millisecond-precision UTC ISO-8601, e.g. `2025-11-14T12:00:00.000Z`.
fn iso_timestamp(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|time| time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| NOT_AVAILABLE.to_string())
}
