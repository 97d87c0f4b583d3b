//! Per-user read models. All spend figures are recomputed from the audit log.
use crate::domain::accounting::{
    micros_to_units, period_limit_micros, round2, spend_on_day_micros, today_spend_micros,
    weekly_series, weekly_window_start_ns, LocalCalendar,
};
use crate::domain::permissions::PermissionCatalog;
use crate::domain::types::{
    ActivityEntry, AgentLog, ComplianceEntry, DashboardSummary, LogKind, RuntimeConfig,
    Subscription, SubscriptionStatus, SubscriptionView,
};
use crate::storage::stable;

pub const RECENT_ACTIVITY_LIMIT: usize = 5;

pub fn dashboard_summary(
    catalog: &PermissionCatalog,
    config: &RuntimeConfig,
    user_id: &str,
    now_ns: u64,
) -> DashboardSummary {
    let calendar =
        LocalCalendar::new(config.utc_offset_minutes).unwrap_or_else(|_| LocalCalendar::utc());
    let active = active_subscriptions(user_id);
    // Spend figures never look further back than the weekly chart.
    let logs = stable::list_logs_for_user_since(user_id, weekly_window_start_ns(&calendar, now_ns));

    let daily_limit_micros: u128 = active
        .iter()
        .map(|subscription| period_limit_micros(catalog.envelope_for(&subscription.agent_name)))
        .sum();
    let spent_micros = today_spend_micros(&logs, catalog, &calendar, now_ns);

    let recent_activity = stable::list_logs_for_user(user_id, RECENT_ACTIVITY_LIMIT)
        .into_iter()
        .map(|log| ActivityEntry {
            kind: LogKind::classify(&log.action),
            id: log.id,
            agent_name: log.agent_name,
            action: log.action,
            created_at_ns: log.created_at_ns,
            status: log.status,
        })
        .collect();

    let today = calendar.day_of(now_ns);
    let compliance = active
        .iter()
        .map(|subscription| {
            let limit = period_limit_micros(catalog.envelope_for(&subscription.agent_name));
            let own_logs = logs_for(&logs, subscription);
            let spent = spend_on_day_micros(&own_logs, catalog, &calendar, today);
            ComplianceEntry {
                subscription_id: subscription.id.clone(),
                agent_name: subscription.agent_name.clone(),
                daily_limit: round2(micros_to_units(limit)),
                spent_today: round2(micros_to_units(spent)),
                within_limit: spent <= limit,
            }
        })
        .collect();

    DashboardSummary {
        wallet_address: stable::find_user(user_id).and_then(|user| user.wallet_address),
        active_agents: u32::try_from(active.len()).unwrap_or(u32::MAX),
        daily_spend_limit: round2(micros_to_units(daily_limit_micros)),
        daily_spent: round2(micros_to_units(spent_micros)),
        remaining: round2(micros_to_units(daily_limit_micros.saturating_sub(spent_micros))),
        recent_activity,
        weekly: weekly_series(&logs, catalog, &calendar, now_ns, daily_limit_micros),
        compliance,
    }
}

/// Every subscription the user holds, joined with its agent and limits.
pub fn list_subscription_views(catalog: &PermissionCatalog, user_id: &str) -> Vec<SubscriptionView> {
    stable::list_subscriptions_for_user(user_id)
        .into_iter()
        .map(|subscription| {
            let envelope = catalog.envelope_for(&subscription.agent_name);
            SubscriptionView {
                agent: stable::find_agent_by_name(&subscription.agent_name),
                daily_limit: envelope
                    .and_then(|envelope| envelope.primary_limit())
                    .and_then(|limit| limit.amount_micros().ok())
                    .map(micros_to_units),
                expiry_secs: envelope.map(|envelope| envelope.expiry_secs),
                subscription,
            }
        })
        .collect()
}

fn active_subscriptions(user_id: &str) -> Vec<Subscription> {
    stable::list_subscriptions_for_user(user_id)
        .into_iter()
        .filter(|subscription| subscription.status == SubscriptionStatus::Active)
        .collect()
}

fn logs_for(logs: &[AgentLog], subscription: &Subscription) -> Vec<AgentLog> {
    logs.iter()
        .filter(|log| log.subscription_id == subscription.id)
        .cloned()
        .collect()
}
