use crate::domain::permissions::PermissionCatalog;
use crate::domain::types::{
    ActionTargets, Agent, AgentLog, LogStatus, RuntimeConfig, RuntimeConfigView, Subscription,
    SubscriptionStatus, User,
};
use crate::timing::current_time_ns;
use ic_stable_structures::{
    memory_manager::{MemoryId, MemoryManager, VirtualMemory},
    DefaultMemoryImpl, StableBTreeMap,
};
use serde::{de::DeserializeOwned, Serialize};
use std::cell::RefCell;
use std::ops::{Bound, RangeBounds};

const RUNTIME_CONFIG_KEY: &str = "runtime.config";
const PERMISSION_CATALOG_KEY: &str = "permission.catalog";

type JsonMap = StableBTreeMap<String, Vec<u8>, VirtualMemory<DefaultMemoryImpl>>;

thread_local! {
    static MEMORY_MANAGER: RefCell<MemoryManager<DefaultMemoryImpl>> =
        RefCell::new(MemoryManager::init(DefaultMemoryImpl::default()));
    static CONFIG_MAP: RefCell<JsonMap> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(0)))
        ));
    static USER_MAP: RefCell<JsonMap> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(1)))
        ));
    static AGENT_MAP: RefCell<JsonMap> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(2)))
        ));
    static SUBSCRIPTION_MAP: RefCell<JsonMap> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(3)))
        ));
    // "{user_id}|{agent_id}" -> subscription id; enforces one subscription per pair.
    static SUBSCRIPTION_INDEX: RefCell<JsonMap> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(4)))
        ));
    static LOG_MAP: RefCell<JsonMap> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(5)))
        ));
    // "sub|{subscription_id}|{log_key}" and "user|{user_id}|{log_key}" -> log key.
    static LOG_INDEX: RefCell<JsonMap> =
        RefCell::new(StableBTreeMap::init(
            MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(6)))
        ));
}

pub fn init_storage() {
    let _ = runtime_config();
}

// ── Configuration ────────────────────────────────────────────────────────────

pub fn runtime_config() -> RuntimeConfig {
    let payload = CONFIG_MAP.with(|map| map.borrow().get(&RUNTIME_CONFIG_KEY.to_string()));
    read_json(payload.as_deref()).unwrap_or_default()
}

pub fn save_runtime_config(config: &RuntimeConfig) {
    CONFIG_MAP.with(|map| {
        map.borrow_mut()
            .insert(RUNTIME_CONFIG_KEY.to_string(), encode_json(config));
    });
}

pub fn runtime_config_view() -> RuntimeConfigView {
    RuntimeConfigView::from(&runtime_config())
}

pub fn set_ecdsa_key_name(key_name: String) -> Result<String, String> {
    if key_name.trim().is_empty() {
        return Err("ecdsa key name cannot be empty".to_string());
    }
    let mut config = runtime_config();
    config.ecdsa_key_name = key_name.trim().to_string();
    let out = config.ecdsa_key_name.clone();
    save_runtime_config(&config);
    Ok(out)
}

pub fn set_evm_chain_id(chain_id: u64) -> Result<u64, String> {
    if chain_id == 0 {
        return Err("evm chain id must be greater than zero".to_string());
    }
    let mut config = runtime_config();
    config.evm_chain_id = chain_id;
    save_runtime_config(&config);
    Ok(chain_id)
}

pub fn set_evm_rpc_url(url: String) -> Result<String, String> {
    let trimmed = url.trim();
    if !trimmed.starts_with("https://") && !trimmed.starts_with("http://") {
        return Err("evm rpc url must be an http(s) url".to_string());
    }
    let mut config = runtime_config();
    config.evm_rpc_url = trimmed.to_string();
    save_runtime_config(&config);
    Ok(config.evm_rpc_url)
}

pub fn set_inference_model(model: String) -> Result<String, String> {
    if model.trim().is_empty() {
        return Err("inference model cannot be empty".to_string());
    }
    let mut config = runtime_config();
    config.inference_model = model.trim().to_string();
    let out = config.inference_model.clone();
    save_runtime_config(&config);
    Ok(out)
}

pub fn set_openrouter_base_url(base_url: String) -> Result<String, String> {
    if base_url.trim().is_empty() {
        return Err("openrouter base url cannot be empty".to_string());
    }
    let mut config = runtime_config();
    config.openrouter_base_url = base_url.trim().trim_end_matches('/').to_string();
    let out = config.openrouter_base_url.clone();
    save_runtime_config(&config);
    Ok(out)
}

pub fn set_openrouter_api_key(api_key: Option<String>) {
    let mut config = runtime_config();
    config.openrouter_api_key = api_key
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty());
    save_runtime_config(&config);
}

pub fn set_utc_offset_minutes(minutes: i32) -> Result<i32, String> {
    if !(-14 * 60..=14 * 60).contains(&minutes) {
        return Err("utc offset must be within +/-14 hours".to_string());
    }
    let mut config = runtime_config();
    config.utc_offset_minutes = minutes;
    save_runtime_config(&config);
    Ok(minutes)
}

/// Replaces the contracts the actions call. Addresses are stored lowercased.
pub fn set_action_targets(targets: ActionTargets) -> Result<ActionTargets, String> {
    let normalize = |label: &str, raw: &str| {
        let lowered = raw.trim().to_ascii_lowercase();
        if crate::domain::permissions::is_evm_address(&lowered) {
            Ok(lowered)
        } else {
            Err(format!("{label} must be a 0x-prefixed 20-byte hex string"))
        }
    };
    let normalized = ActionTargets {
        rebalance_contract: normalize("rebalance contract", &targets.rebalance_contract)?,
        gas_relay_contract: normalize("gas relay contract", &targets.gas_relay_contract)?,
        usdc_token: normalize("usdc token", &targets.usdc_token)?,
    };
    let mut config = runtime_config();
    config.targets = normalized.clone();
    save_runtime_config(&config);
    Ok(normalized)
}

pub fn set_session_address(address: Option<String>) -> Result<Option<String>, String> {
    let normalized = match address {
        Some(raw) => {
            let lowered = raw.trim().to_ascii_lowercase();
            if !crate::domain::permissions::is_evm_address(&lowered) {
                return Err("session address must be a 0x-prefixed 20-byte hex string".to_string());
            }
            Some(lowered)
        }
        None => None,
    };
    let mut config = runtime_config();
    config.session_address = normalized.clone();
    save_runtime_config(&config);
    Ok(normalized)
}

pub fn get_session_address() -> Option<String> {
    runtime_config().session_address
}

pub fn permission_catalog() -> PermissionCatalog {
    let payload = CONFIG_MAP.with(|map| map.borrow().get(&PERMISSION_CATALOG_KEY.to_string()));
    read_json(payload.as_deref()).unwrap_or_default()
}

/// Seeds the catalog once; later calls leave the stored catalog untouched.
pub fn seed_permission_catalog(catalog: &PermissionCatalog) -> bool {
    if !permission_catalog().is_empty() {
        return false;
    }
    CONFIG_MAP.with(|map| {
        map.borrow_mut()
            .insert(PERMISSION_CATALOG_KEY.to_string(), encode_json(catalog));
    });
    true
}

fn next_seq(bump: impl FnOnce(&mut RuntimeConfig) -> &mut u64) -> u64 {
    let mut config = runtime_config();
    let slot = bump(&mut config);
    *slot = slot.saturating_add(1);
    let out = *slot;
    save_runtime_config(&config);
    out
}

// ── Users ────────────────────────────────────────────────────────────────────

pub fn find_user(user_id: &str) -> Option<User> {
    USER_MAP.with(|map| read_json(map.borrow().get(&user_id.to_string()).as_deref()))
}

pub fn upsert_user(user_id: &str, wallet_address: Option<String>) -> User {
    let user = match find_user(user_id) {
        Some(mut existing) => {
            if wallet_address.is_some() {
                existing.wallet_address = wallet_address;
            }
            existing
        }
        None => User {
            id: user_id.to_string(),
            wallet_address,
            created_at_ns: current_time_ns(),
        },
    };
    USER_MAP.with(|map| {
        map.borrow_mut().insert(user.id.clone(), encode_json(&user));
    });
    user
}

// ── Agents ───────────────────────────────────────────────────────────────────

pub fn find_agent_by_name(name: &str) -> Option<Agent> {
    AGENT_MAP.with(|map| read_json(map.borrow().get(&name.to_string()).as_deref()))
}

/// Creates the agent row on first use; an existing row is returned unchanged.
pub fn upsert_agent(
    name: &str,
    description: &str,
    cost: &str,
    can: &[String],
    cannot: &[String],
) -> Agent {
    if let Some(existing) = find_agent_by_name(name) {
        return existing;
    }
    let seq = next_seq(|config| &mut config.agent_seq);
    let agent = Agent {
        id: format!("agent-{seq:010}"),
        name: name.to_string(),
        description: description.to_string(),
        cost: cost.to_string(),
        can: can.to_vec(),
        cannot: cannot.to_vec(),
    };
    AGENT_MAP.with(|map| {
        map.borrow_mut()
            .insert(agent.name.clone(), encode_json(&agent));
    });
    agent
}

pub fn agent_count() -> u64 {
    AGENT_MAP.with(|map| map.borrow().len())
}

// ── Subscriptions ────────────────────────────────────────────────────────────

pub struct NewSubscription {
    pub user_id: String,
    pub agent: Agent,
    pub session_address: String,
    pub permission_context: String,
    pub delegation_manager: String,
    pub chain_id: u64,
}

fn subscription_index_key(user_id: &str, agent_id: &str) -> String {
    format!("{user_id}|{agent_id}")
}

pub fn find_subscription(user_id: &str, agent_id: &str) -> Option<Subscription> {
    let key = subscription_index_key(user_id, agent_id);
    let id: Option<String> =
        SUBSCRIPTION_INDEX.with(|map| read_json(map.borrow().get(&key).as_deref()));
    id.and_then(|id| find_subscription_by_id(&id))
}

pub fn find_subscription_by_id(subscription_id: &str) -> Option<Subscription> {
    SUBSCRIPTION_MAP.with(|map| read_json(map.borrow().get(&subscription_id.to_string()).as_deref()))
}

/// Subscription joined with its agent row.
pub fn find_subscription_with_agent(subscription_id: &str) -> Option<(Subscription, Option<Agent>)> {
    find_subscription_by_id(subscription_id).map(|subscription| {
        let agent = find_agent_by_name(&subscription.agent_name);
        (subscription, agent)
    })
}

/// Fails if the (user, agent) pair already holds a subscription.
pub fn create_subscription(new: NewSubscription) -> Result<Subscription, String> {
    let key = subscription_index_key(&new.user_id, &new.agent.id);
    if SUBSCRIPTION_INDEX.with(|map| map.borrow().contains_key(&key)) {
        return Err(format!(
            "subscription already exists for user {} and agent {}",
            new.user_id, new.agent.name
        ));
    }

    let seq = next_seq(|config| &mut config.subscription_seq);
    let subscription = Subscription {
        id: format!("sub-{seq:010}"),
        user_id: new.user_id,
        agent_id: new.agent.id,
        agent_name: new.agent.name,
        session_address: new.session_address,
        permission_context: new.permission_context,
        delegation_manager: new.delegation_manager,
        chain_id: new.chain_id,
        status: SubscriptionStatus::Active,
        created_at_ns: current_time_ns(),
    };

    SUBSCRIPTION_MAP.with(|map| {
        map.borrow_mut()
            .insert(subscription.id.clone(), encode_json(&subscription));
    });
    SUBSCRIPTION_INDEX.with(|map| {
        map.borrow_mut().insert(key, encode_json(&subscription.id));
    });
    Ok(subscription)
}

/// Oldest first. Only the user's own index entries are visited.
pub fn list_subscriptions_for_user(user_id: &str) -> Vec<Subscription> {
    let ids: Vec<String> = SUBSCRIPTION_INDEX.with(|map| {
        map.borrow()
            .range(prefix_range(&subscription_index_key(user_id, "")))
            .filter_map(|entry| read_json(Some(entry.value().as_slice())))
            .collect()
    });
    let mut subscriptions: Vec<Subscription> = ids
        .iter()
        .filter_map(|id| find_subscription_by_id(id))
        .collect();
    subscriptions.sort_by(|a, b| (a.created_at_ns, &a.id).cmp(&(b.created_at_ns, &b.id)));
    subscriptions
}

pub fn subscription_count() -> u64 {
    SUBSCRIPTION_MAP.with(|map| map.borrow().len())
}

// ── Agent logs ───────────────────────────────────────────────────────────────

pub struct NewAgentLog {
    pub subscription_id: String,
    pub agent_name: String,
    pub action: String,
    pub status: LogStatus,
    pub transaction_hash: Option<String>,
    pub metadata: Option<String>,
}

/// Append-only: there is no update or delete path for logs.
pub fn append_agent_log(new: NewAgentLog) -> AgentLog {
    let seq = next_seq(|config| &mut config.log_seq);
    let created_at_ns = current_time_ns();
    let log = AgentLog {
        id: format!("log-{seq:010}"),
        subscription_id: new.subscription_id,
        agent_name: new.agent_name,
        action: new.action,
        status: new.status,
        transaction_hash: new.transaction_hash,
        metadata: new.metadata,
        created_at_ns,
    };
    let key = format!("{created_at_ns:020}-{seq:020}");
    let owner = find_subscription_by_id(&log.subscription_id).map(|subscription| subscription.user_id);
    LOG_MAP.with(|map| {
        map.borrow_mut().insert(key.clone(), encode_json(&log));
    });
    LOG_INDEX.with(|map| {
        let mut map = map.borrow_mut();
        map.insert(
            format!("{}{key}", subscription_log_prefix(&log.subscription_id)),
            encode_json(&key),
        );
        if let Some(user_id) = owner {
            map.insert(format!("{}{key}", user_log_prefix(&user_id)), encode_json(&key));
        }
    });
    log
}

fn subscription_log_prefix(subscription_id: &str) -> String {
    format!("sub|{subscription_id}|")
}

fn user_log_prefix(user_id: &str) -> String {
    format!("user|{user_id}|")
}

/// Most recent first.
pub fn list_logs_for_user(user_id: &str, limit: usize) -> Vec<AgentLog> {
    list_indexed_logs(prefix_range(&user_log_prefix(user_id)), limit)
}

/// Every log of the user created at or after `since_ns`, most recent first.
pub fn list_logs_for_user_since(user_id: &str, since_ns: u64) -> Vec<AgentLog> {
    let prefix = user_log_prefix(user_id);
    let (_, upper) = prefix_range(&prefix);
    let lower = Bound::Included(format!("{prefix}{since_ns:020}"));
    list_indexed_logs((lower, upper), usize::MAX)
}

/// Most recent first.
pub fn list_logs_for_subscription(subscription_id: &str, limit: usize) -> Vec<AgentLog> {
    list_indexed_logs(prefix_range(&subscription_log_prefix(subscription_id)), limit)
}

fn list_indexed_logs(keys: impl RangeBounds<String>, limit: usize) -> Vec<AgentLog> {
    if limit == 0 {
        return Vec::new();
    }
    let log_keys: Vec<String> = LOG_INDEX.with(|map| {
        map.borrow()
            .range(keys)
            .rev()
            .take(limit)
            .filter_map(|entry| read_json(Some(entry.value().as_slice())))
            .collect()
    });
    LOG_MAP.with(|map| {
        let map = map.borrow();
        log_keys
            .iter()
            .filter_map(|key| read_json(map.get(key).as_deref()))
            .collect()
    })
}

/// Key range covering exactly the keys that start with `prefix`, which
/// must end in `|`.
fn prefix_range(prefix: &str) -> (Bound<String>, Bound<String>) {
    let mut upper = prefix.strip_suffix('|').unwrap_or(prefix).to_string();
    // '}' sorts immediately after '|'
    upper.push('}');
    (Bound::Included(prefix.to_string()), Bound::Excluded(upper))
}

pub fn log_count() -> u64 {
    LOG_MAP.with(|map| map.borrow().len())
}

fn encode_json<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

fn read_json<T: DeserializeOwned>(value: Option<&[u8]>) -> Option<T> {
    value.and_then(|raw| serde_json::from_slice(raw).ok())
}
