use crate::agent::{self, CycleDeps};
use crate::authorizer;
use crate::domain::error::AgentError;
use crate::domain::permissions::{verify_grant, PermissionCatalog};
use crate::domain::types::{RuntimeConfig, SubscribeRequest, SubscribeResponse};
use crate::storage::stable::{self, NewSubscription};
use canlog::{log, GetLogFilter, LogFilter, LogPriorityLevels};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, LogPriorityLevels)]
enum SubscriptionLogPriority {
    #[log_level(capacity = 1000, name = "SUBSCRIPTION_INFO")]
    Info,
    #[log_level(capacity = 500, name = "SUBSCRIPTION_ERROR")]
    Error,
}

impl GetLogFilter for SubscriptionLogPriority {
    fn get_log_filter() -> LogFilter {
        LogFilter::ShowAll
    }
}

/// Subscribes `user_id` to the agent named in `request`.
///
/// Every check happens before the first write, and the agent row plus the
/// subscription are written without an intervening await, so two concurrent
/// calls for the same pair cannot both create a subscription. An existing
/// subscription is returned as-is. A new one runs an initial cycle with no
/// prompt; if that cycle fails the response reports `success: false`.
pub async fn subscribe_with(
    catalog: &PermissionCatalog,
    config: &RuntimeConfig,
    user_id: &str,
    request: &SubscribeRequest,
    deps: &CycleDeps<'_>,
    now_secs: u64,
) -> Result<SubscribeResponse, AgentError> {
    if stable::find_user(user_id).is_none() {
        return Err(AgentError::Unauthorized(
            "connect a wallet before subscribing".to_string(),
        ));
    }
    let profile = catalog.profile_for(&request.agent_name).ok_or_else(|| {
        AgentError::Validation(format!(
            "No permissions found for agent: {}",
            request.agent_name
        ))
    })?;

    if let Some(existing) = stable::find_agent_by_name(&profile.name)
        .and_then(|agent| stable::find_subscription(user_id, &agent.id))
    {
        log!(
            SubscriptionLogPriority::Info,
            "user={} agent={} subscription={} already_subscribed",
            user_id,
            profile.name,
            existing.id
        );
        return Ok(SubscribeResponse {
            success: true,
            subscription: Some(existing),
            message: "Already subscribed to this agent".to_string(),
        });
    }

    let grant = request
        .granted_permissions
        .first()
        .ok_or_else(|| AgentError::Validation("No permissions provided".to_string()))?;
    let chain_id = verify_grant(&profile.envelope, grant, config.evm_chain_id)?;
    let session_address = config.session_address.clone().ok_or_else(|| {
        AgentError::Validation("session address has not been derived".to_string())
    })?;

    let description = non_empty_or(&request.description, &profile.description);
    let cost = non_empty_or(&request.cost, &profile.cost);
    let agent = stable::upsert_agent(
        &profile.name,
        description,
        cost,
        &profile.can,
        &profile.cannot,
    );
    let subscription = stable::create_subscription(NewSubscription {
        user_id: user_id.to_string(),
        agent,
        session_address,
        permission_context: grant.context.trim().to_string(),
        delegation_manager: grant.signer_meta.delegation_manager.trim().to_ascii_lowercase(),
        chain_id,
    })
    .map_err(AgentError::Storage)?;
    log!(
        SubscriptionLogPriority::Info,
        "user={} agent={} subscription={} chain_id={} created",
        user_id,
        profile.name,
        subscription.id,
        chain_id
    );

    let initial = match authorizer::authorize(
        catalog,
        user_id,
        &subscription.id,
        &profile.name,
        now_secs,
    ) {
        Ok(ctx) => agent::run_and_record(&ctx, None, deps).await,
        Err(error) => Err(error),
    };
    if let Err(error) = initial {
        log!(
            SubscriptionLogPriority::Error,
            "user={} subscription={} initial_cycle_failed error={}",
            user_id,
            subscription.id,
            error
        );
        return Ok(SubscribeResponse {
            success: false,
            subscription: None,
            message: format!("Subscription created but the initial execution failed: {error}"),
        });
    }

    Ok(SubscribeResponse {
        success: true,
        subscription: Some(subscription),
        message: format!("Subscribed to {}", profile.name),
    })
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::permissions::{GAS_OPTIMISER, PORTFOLIO_REBALANCER};
    use crate::domain::types::{
        ActionTargets, GrantedPermission, LogStatus, PermissionGrantData, PermissionGrantDetails,
        SignerMeta,
    };
    use crate::features::delegation::mock::MockDelegatedSubmitter;
    use crate::features::inference::scripted::ScriptedInferenceAdapter;
    use crate::features::inference::DeterministicInferenceAdapter;
    use crate::features::inference::InferenceAdapter;
    use crate::test_support::block_on_with_spin;

    const NOW_SECS: u64 = 1_760_529_600;
    const MANAGER: &str = "0xdb9b1e94b5b69df7e401ddbede43491141047db3";

    fn catalog() -> PermissionCatalog {
        PermissionCatalog::reference(&ActionTargets::default(), NOW_SECS)
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            session_address: Some("0x1111111111111111111111111111111111111111".to_string()),
            ..RuntimeConfig::default()
        }
    }

    fn grant(period_amount: &str) -> GrantedPermission {
        GrantedPermission {
            context: "0xc0ffee".to_string(),
            chain_id: "0xaa36a7".to_string(),
            expiry: Some(NOW_SECS + 86_400),
            address: None,
            permission: PermissionGrantDetails {
                permission_type: "erc20-token-periodic".to_string(),
                data: PermissionGrantData {
                    token_address: "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238".to_string(),
                    period_amount: period_amount.to_string(),
                    period_duration: 86_400,
                    start_time: Some(NOW_SECS),
                    justification: None,
                },
            },
            signer_meta: SignerMeta {
                delegation_manager: MANAGER.to_string(),
            },
        }
    }

    fn request(agent_name: &str, grants: Vec<GrantedPermission>) -> SubscribeRequest {
        SubscribeRequest {
            agent_name: agent_name.to_string(),
            description: String::new(),
            cost: String::new(),
            granted_permissions: grants,
        }
    }

    fn subscribe(
        user_id: &str,
        request: &SubscribeRequest,
        engine: &dyn InferenceAdapter,
        submitter: &MockDelegatedSubmitter,
    ) -> Result<SubscribeResponse, AgentError> {
        let targets = ActionTargets::default();
        let deps = CycleDeps {
            engine,
            submitter,
            targets: &targets,
        };
        block_on_with_spin(subscribe_with(
            &catalog(),
            &config(),
            user_id,
            request,
            &deps,
            NOW_SECS,
        ))
    }

    #[test]
    fn unknown_agent_fails_without_writes() {
        stable::upsert_user("alice", None);
        let submitter = MockDelegatedSubmitter::succeeding("0xfeed");
        let error = subscribe(
            "alice",
            &request("Unknown Agent", vec![grant("1000000")]),
            &DeterministicInferenceAdapter,
            &submitter,
        )
        .unwrap_err();

        assert_eq!(
            error,
            AgentError::Validation("No permissions found for agent: Unknown Agent".to_string())
        );
        assert_eq!(stable::agent_count(), 0);
        assert_eq!(stable::subscription_count(), 0);
    }

    #[test]
    fn unregistered_user_is_rejected() {
        let submitter = MockDelegatedSubmitter::succeeding("0xfeed");
        let error = subscribe(
            "ghost",
            &request(GAS_OPTIMISER, vec![grant("1000000")]),
            &DeterministicInferenceAdapter,
            &submitter,
        )
        .unwrap_err();
        assert_eq!(error.kind(), "unauthorized");
    }

    #[test]
    fn empty_or_mismatched_grants_are_rejected_before_writes() {
        stable::upsert_user("alice", None);
        let submitter = MockDelegatedSubmitter::succeeding("0xfeed");

        let empty = subscribe(
            "alice",
            &request(GAS_OPTIMISER, Vec::new()),
            &DeterministicInferenceAdapter,
            &submitter,
        )
        .unwrap_err();
        assert_eq!(empty, AgentError::Validation("No permissions provided".to_string()));

        let oversized = subscribe(
            "alice",
            &request(GAS_OPTIMISER, vec![grant("5000000")]),
            &DeterministicInferenceAdapter,
            &submitter,
        )
        .unwrap_err();
        assert_eq!(oversized.kind(), "validation");
        assert_eq!(stable::agent_count(), 0);
        assert_eq!(stable::subscription_count(), 0);
    }

    #[test]
    fn subscribing_twice_returns_the_same_subscription() {
        stable::upsert_user("alice", None);
        let submitter = MockDelegatedSubmitter::succeeding("0xfeed");
        let req = request(GAS_OPTIMISER, vec![grant("1000000")]);

        let first = subscribe("alice", &req, &DeterministicInferenceAdapter, &submitter).unwrap();
        assert!(first.success);
        let second = subscribe("alice", &req, &DeterministicInferenceAdapter, &submitter).unwrap();
        assert!(second.success);
        assert_eq!(second.message, "Already subscribed to this agent");

        assert_eq!(
            first.subscription.unwrap().id,
            second.subscription.unwrap().id
        );
        assert_eq!(stable::agent_count(), 1);
        assert_eq!(stable::subscription_count(), 1);
        // only the new subscription ran its initial cycle
        assert_eq!(submitter.calls().len(), 1);
    }

    #[test]
    fn new_subscription_runs_initial_cycle_and_copies_capabilities() {
        stable::upsert_user("alice", None);
        let submitter = MockDelegatedSubmitter::succeeding("0xfeed");
        let response = subscribe(
            "alice",
            &request(PORTFOLIO_REBALANCER, vec![grant("2000000")]),
            &DeterministicInferenceAdapter,
            &submitter,
        )
        .unwrap();

        let subscription = response.subscription.unwrap();
        assert_eq!(subscription.chain_id, 11_155_111);
        assert_eq!(subscription.permission_context, "0xc0ffee");
        assert_eq!(subscription.delegation_manager, MANAGER);

        let agent = stable::find_agent_by_name(PORTFOLIO_REBALANCER).unwrap();
        assert_eq!(agent.can.len(), 3);
        assert_eq!(agent.cost, "$0.50");

        let logs = stable::list_logs_for_subscription(&subscription.id, 10);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogStatus::Executed);
        assert_eq!(logs[0].action, "Agent execution");
    }

    #[test]
    fn failed_initial_cycle_reports_unsuccessful_response() {
        stable::upsert_user("alice", None);
        let submitter = MockDelegatedSubmitter::succeeding("0xfeed");
        let engine = ScriptedInferenceAdapter::failing("model offline");
        let response = subscribe(
            "alice",
            &request(GAS_OPTIMISER, vec![grant("1000000")]),
            &engine,
            &submitter,
        )
        .unwrap();

        assert!(!response.success);
        assert!(response.subscription.is_none());
        assert!(response.message.contains("model offline"));
        assert_eq!(stable::subscription_count(), 1);
    }
}
