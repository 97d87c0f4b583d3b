mod agent;
mod authorizer;
mod dashboard;
mod domain;
mod features;
pub mod prompt;
mod storage;
mod subscriptions;
mod timing;
mod tools;

#[cfg(test)]
mod test_support;

use crate::agent::CycleDeps;
use crate::domain::error::AgentError;
use crate::domain::permissions::{is_evm_address, PermissionCatalog};
use crate::domain::types::{
    AgentLog, AgentProfile, DashboardSummary, ExecuteRequest, ExecutionResult, RuntimeConfig,
    RuntimeConfigView, SubscribeRequest, SubscribeResponse, SubscriptionView, User,
};
use crate::features::delegation::{DelegatedSubmitter, HttpDelegatedSubmitter, UnavailableSubmitter};
use crate::features::inference::{adapter_for_config, DETERMINISTIC_MODEL};
use crate::features::threshold_signer::{derive_and_cache_session_address, ThresholdSigner};
use crate::storage::stable;
use crate::timing::{current_time_ns, current_time_secs};
use candid::CandidType;
use canlog::{log, GetLogFilter, LogFilter, LogPriorityLevels};
use serde::{Deserialize, Serialize};

/// Key name the local replica exposes; implies the deterministic planner
/// unless a model is given explicitly.
const LOCAL_TEST_KEY_NAME: &str = "dfx_test_key";
const MAX_LOG_PAGE: u32 = 200;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, LogPriorityLevels)]
enum CanisterLogPriority {
    #[log_level(capacity = 500, name = "CANISTER_INFO")]
    Info,
    #[log_level(capacity = 200, name = "CANISTER_ERROR")]
    Error,
}

impl GetLogFilter for CanisterLogPriority {
    fn get_log_filter() -> LogFilter {
        LogFilter::ShowAll
    }
}

#[derive(CandidType, Deserialize)]
struct InitArgs {
    ecdsa_key_name: String,
    #[serde(default)]
    evm_chain_id: Option<u64>,
    #[serde(default)]
    evm_rpc_url: Option<String>,
    #[serde(default)]
    inference_model: Option<String>,
    #[serde(default)]
    openrouter_base_url: Option<String>,
    #[serde(default)]
    openrouter_api_key: Option<String>,
    #[serde(default)]
    rebalance_contract: Option<String>,
    #[serde(default)]
    gas_relay_contract: Option<String>,
    #[serde(default)]
    usdc_address: Option<String>,
    #[serde(default)]
    utc_offset_minutes: Option<i32>,
}

fn ensure_controller() -> Result<(), String> {
    #[cfg(target_arch = "wasm32")]
    {
        let caller = ic_cdk::api::msg_caller();
        if !ic_cdk::api::is_controller(&caller) {
            return Err("caller is not a controller".to_string());
        }
        Ok(())
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        Ok(())
    }
}

/// Identity every user-facing record is keyed by. Anonymous callers are
/// rejected so one shared principal cannot accumulate subscriptions.
fn caller_id() -> Result<String, AgentError> {
    #[cfg(target_arch = "wasm32")]
    {
        let caller = ic_cdk::api::msg_caller();
        if caller == candid::Principal::anonymous() {
            return Err(AgentError::Unauthorized(
                "anonymous callers cannot use agents".to_string(),
            ));
        }
        Ok(caller.to_text())
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        Ok("native".to_string())
    }
}

#[ic_cdk::init]
fn init(args: InitArgs) {
    apply_init_args(args);
}

fn apply_init_args(args: InitArgs) {
    stable::init_storage();
    let key_name =
        stable::set_ecdsa_key_name(args.ecdsa_key_name).unwrap_or_else(|error| ic_cdk::trap(&error));
    if let Some(chain_id) = args.evm_chain_id {
        let _ = stable::set_evm_chain_id(chain_id).unwrap_or_else(|error| ic_cdk::trap(&error));
    }
    if let Some(rpc_url) = args.evm_rpc_url {
        let _ = stable::set_evm_rpc_url(rpc_url).unwrap_or_else(|error| ic_cdk::trap(&error));
    }
    let model = args.inference_model.or_else(|| {
        (key_name == LOCAL_TEST_KEY_NAME).then(|| DETERMINISTIC_MODEL.to_string())
    });
    if let Some(model) = model {
        let _ = stable::set_inference_model(model).unwrap_or_else(|error| ic_cdk::trap(&error));
    }
    if let Some(base_url) = args.openrouter_base_url {
        let _ = stable::set_openrouter_base_url(base_url)
            .unwrap_or_else(|error| ic_cdk::trap(&error));
    }
    if args.openrouter_api_key.is_some() {
        stable::set_openrouter_api_key(args.openrouter_api_key);
    }
    if let Some(minutes) = args.utc_offset_minutes {
        let _ = stable::set_utc_offset_minutes(minutes)
            .unwrap_or_else(|error| ic_cdk::trap(&error));
    }

    let mut targets = stable::runtime_config().targets;
    if let Some(address) = args.rebalance_contract {
        targets.rebalance_contract = address;
    }
    if let Some(address) = args.gas_relay_contract {
        targets.gas_relay_contract = address;
    }
    if let Some(address) = args.usdc_address {
        targets.usdc_token = address;
    }
    let targets =
        stable::set_action_targets(targets).unwrap_or_else(|error| ic_cdk::trap(&error));

    let seeded =
        stable::seed_permission_catalog(&PermissionCatalog::reference(&targets, current_time_secs()));
    let config = stable::runtime_config();
    log!(
        CanisterLogPriority::Info,
        "init chain_id={} model={} catalog_seeded={}",
        config.evm_chain_id,
        config.inference_model,
        seeded
    );
}

#[ic_cdk::post_upgrade]
fn post_upgrade() {
    stable::init_storage();
    log!(
        CanisterLogPriority::Info,
        "post_upgrade agents={} subscriptions={} logs={}",
        stable::agent_count(),
        stable::subscription_count(),
        stable::log_count()
    );
}

/// Stored catalog with its grant window measured from the current time.
fn active_catalog() -> PermissionCatalog {
    stable::permission_catalog().renewed(current_time_secs())
}

fn submitter_for_config(config: &RuntimeConfig) -> Box<dyn DelegatedSubmitter> {
    let signer = ThresholdSigner::new(config.ecdsa_key_name.clone());
    match HttpDelegatedSubmitter::from_config(config, signer) {
        Ok(submitter) => Box::new(submitter),
        Err(reason) => {
            log!(
                CanisterLogPriority::Error,
                "delegated_submitter unavailable reason={}",
                reason
            );
            Box::new(UnavailableSubmitter::new(reason))
        }
    }
}

#[ic_cdk::update]
fn connect_wallet(wallet_address: String) -> Result<User, AgentError> {
    let user_id = caller_id()?;
    if !is_evm_address(&wallet_address) {
        return Err(AgentError::Validation(
            "wallet address must be a 0x-prefixed 20-byte hex string".to_string(),
        ));
    }
    let user = stable::upsert_user(&user_id, Some(wallet_address.trim().to_ascii_lowercase()));
    log!(CanisterLogPriority::Info, "user={} wallet_connected", user_id);
    Ok(user)
}

#[ic_cdk::update]
async fn subscribe_to_agent(request: SubscribeRequest) -> Result<SubscribeResponse, AgentError> {
    let user_id = caller_id()?;
    let config = stable::runtime_config();
    let engine = adapter_for_config(&config);
    let submitter = submitter_for_config(&config);
    let deps = CycleDeps {
        engine: engine.as_ref(),
        submitter: submitter.as_ref(),
        targets: &config.targets,
    };
    subscriptions::subscribe_with(
        &active_catalog(),
        &config,
        &user_id,
        &request,
        &deps,
        current_time_secs(),
    )
    .await
}

#[ic_cdk::update]
async fn execute_agent(request: ExecuteRequest) -> Result<ExecutionResult, AgentError> {
    let user_id = caller_id()?;
    let config = stable::runtime_config();
    let engine = adapter_for_config(&config);
    let submitter = submitter_for_config(&config);
    let deps = CycleDeps {
        engine: engine.as_ref(),
        submitter: submitter.as_ref(),
        targets: &config.targets,
    };
    agent::execute_agent_with(
        &active_catalog(),
        &user_id,
        &request,
        &deps,
        current_time_secs(),
    )
    .await
}

#[ic_cdk::query]
fn list_subscriptions() -> Vec<SubscriptionView> {
    caller_id()
        .map(|user_id| dashboard::list_subscription_views(&active_catalog(), &user_id))
        .unwrap_or_default()
}

#[ic_cdk::query]
fn list_agent_logs(limit: u32) -> Vec<AgentLog> {
    caller_id()
        .map(|user_id| stable::list_logs_for_user(&user_id, page_size(limit)))
        .unwrap_or_default()
}

#[ic_cdk::query]
fn list_subscription_logs(subscription_id: String, limit: u32) -> Result<Vec<AgentLog>, AgentError> {
    let user_id = caller_id()?;
    let subscription = stable::find_subscription_by_id(&subscription_id)
        .ok_or_else(|| AgentError::NotFound(format!("subscription {subscription_id} not found")))?;
    if subscription.user_id != user_id {
        return Err(AgentError::Unauthorized(format!(
            "subscription {subscription_id} belongs to another user"
        )));
    }
    Ok(stable::list_logs_for_subscription(
        &subscription_id,
        page_size(limit),
    ))
}

#[ic_cdk::query]
fn get_dashboard_summary() -> DashboardSummary {
    let user_id = caller_id().unwrap_or_default();
    dashboard::dashboard_summary(
        &active_catalog(),
        &stable::runtime_config(),
        &user_id,
        current_time_ns(),
    )
}

#[ic_cdk::query]
fn list_agent_catalog() -> Vec<AgentProfile> {
    active_catalog().profiles().to_vec()
}

#[ic_cdk::query]
fn get_session_address() -> Option<String> {
    stable::get_session_address()
}

#[ic_cdk::query]
fn get_runtime_config() -> RuntimeConfigView {
    stable::runtime_config_view()
}

#[ic_cdk::update]
async fn derive_session_address() -> Result<String, String> {
    ensure_controller()?;
    let key_name = stable::runtime_config().ecdsa_key_name;
    let address = derive_and_cache_session_address(&key_name).await?;
    log!(CanisterLogPriority::Info, "session_address derived address={}", address);
    Ok(address)
}

#[ic_cdk::update]
fn set_evm_rpc_url(url: String) -> Result<String, String> {
    ensure_controller()?;
    stable::set_evm_rpc_url(url)
}

#[ic_cdk::update]
fn set_evm_chain_id(chain_id: u64) -> Result<u64, String> {
    ensure_controller()?;
    stable::set_evm_chain_id(chain_id)
}

#[ic_cdk::update]
fn set_inference_model(model: String) -> Result<String, String> {
    ensure_controller()?;
    stable::set_inference_model(model)
}

#[ic_cdk::update]
fn set_openrouter_base_url(base_url: String) -> Result<String, String> {
    ensure_controller()?;
    stable::set_openrouter_base_url(base_url)
}

#[ic_cdk::update]
fn set_openrouter_api_key(api_key: Option<String>) -> Result<bool, String> {
    ensure_controller()?;
    stable::set_openrouter_api_key(api_key);
    Ok(stable::runtime_config().openrouter_api_key.is_some())
}

#[ic_cdk::update]
fn set_utc_offset_minutes(minutes: i32) -> Result<i32, String> {
    ensure_controller()?;
    stable::set_utc_offset_minutes(minutes)
}

fn page_size(limit: u32) -> usize {
    usize::try_from(limit.min(MAX_LOG_PAGE)).unwrap_or_default()
}


ic_cdk::export_candid!();
