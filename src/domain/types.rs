use candid::CandidType;
use serde::{Deserialize, Serialize};

// ── Permission shapes ────────────────────────────────────────────────────────

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TokenLimit {
    pub token: String,
    /// 6-decimal fixed point integer, e.g. "2000000" is 2 USDC.
    pub amount: String,
    pub period_seconds: u64,
}

/// Static capability template for a named agent.
#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PermissionEnvelope {
    pub allowed_targets: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub token_limits: Vec<TokenLimit>,
    pub expiry_secs: u64,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AgentProfile {
    pub name: String,
    pub description: String,
    pub cost: String,
    pub can: Vec<String>,
    pub cannot: Vec<String>,
    pub envelope: PermissionEnvelope,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SignerMeta {
    pub delegation_manager: String,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PermissionGrantData {
    pub token_address: String,
    pub period_amount: String,
    pub period_duration: u64,
    #[serde(default)]
    pub start_time: Option<u64>,
    #[serde(default)]
    pub justification: Option<String>,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PermissionGrantDetails {
    pub permission_type: String,
    pub data: PermissionGrantData,
}

/// Artifact returned by the wallet after the user approves a delegation request.
#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GrantedPermission {
    /// Opaque delegation proof, passed through verbatim on redemption.
    pub context: String,
    /// Hex ("0xaa36a7") or decimal chain id as reported by the wallet.
    pub chain_id: String,
    #[serde(default)]
    pub expiry: Option<u64>,
    #[serde(default)]
    pub address: Option<String>,
    pub permission: PermissionGrantDetails,
    pub signer_meta: SignerMeta,
}

// ── Persistent records ───────────────────────────────────────────────────────

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub wallet_address: Option<String>,
    pub created_at_ns: u64,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub description: String,
    pub cost: String,
    pub can: Vec<String>,
    pub cannot: Vec<String>,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    Inactive,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub session_address: String,
    pub permission_context: String,
    pub delegation_manager: String,
    pub chain_id: u64,
    pub status: SubscriptionStatus,
    pub created_at_ns: u64,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogStatus {
    Executed,
    Analysed,
    Error,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::Analysed => "analysed",
            Self::Error => "error",
        }
    }
}

/// Coarse activity category shown next to each log entry.
#[derive(CandidType, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogKind {
    Execution,
    Safety,
    Bridging,
}

impl LogKind {
    pub fn classify(action: &str) -> Self {
        let lowered = action.to_ascii_lowercase();
        if lowered.contains("rebalance") || lowered.contains("swap") {
            Self::Execution
        } else if lowered.contains("risk") || lowered.contains("compliance") {
            Self::Safety
        } else {
            Self::Bridging
        }
    }
}

/// One execution cycle's audit record. Never mutated after append.
#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AgentLog {
    pub id: String,
    pub subscription_id: String,
    pub agent_name: String,
    pub action: String,
    pub status: LogStatus,
    pub transaction_hash: Option<String>,
    /// Serialized `LogMetadata` JSON.
    pub metadata: Option<String>,
    pub created_at_ns: u64,
}

// ── Decision cycle ───────────────────────────────────────────────────────────

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToolCall {
    pub tool_call_id: Option<String>,
    pub tool: String,
    pub args_json: String,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToolResult {
    pub tool: String,
    pub text: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }
}

#[derive(CandidType, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Running,
    Executed,
    Analysed,
    Failed,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub enum CycleEvent {
    Started,
    EngineReturned { tool_calls: u32 },
    EngineFailed { reason: String },
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct TransitionError {
    pub from: CycleState,
    pub event: String,
    pub reason: String,
}

/// Everything the decision loop may know about one authorized execution.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub subscription: Subscription,
    pub agent_name: String,
    pub envelope: Option<PermissionEnvelope>,
    pub bundle: String,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExecutionResult {
    pub subscription_id: String,
    pub log_id: String,
    pub status: LogStatus,
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
}

// ── Endpoint payloads ────────────────────────────────────────────────────────

#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct SubscribeRequest {
    pub agent_name: String,
    pub description: String,
    pub cost: String,
    pub granted_permissions: Vec<GrantedPermission>,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct SubscribeResponse {
    pub success: bool,
    pub subscription: Option<Subscription>,
    pub message: String,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct ExecuteRequest {
    pub subscription_id: String,
    pub agent_name: String,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SubscriptionView {
    pub subscription: Subscription,
    pub agent: Option<Agent>,
    pub daily_limit: Option<f64>,
    pub expiry_secs: Option<u64>,
}

// ── Dashboard read models ────────────────────────────────────────────────────

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ActivityEntry {
    pub id: String,
    pub agent_name: String,
    pub action: String,
    pub created_at_ns: u64,
    pub status: LogStatus,
    pub kind: LogKind,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChartPoint {
    /// Weekday label, SUN..SAT.
    pub label: String,
    /// Local calendar date, YYYY-MM-DD.
    pub date: String,
    pub spending: f64,
    pub limit: f64,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ComplianceEntry {
    pub subscription_id: String,
    pub agent_name: String,
    pub daily_limit: f64,
    pub spent_today: f64,
    pub within_limit: bool,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DashboardSummary {
    pub wallet_address: Option<String>,
    pub active_agents: u32,
    pub daily_spend_limit: f64,
    pub daily_spent: f64,
    pub remaining: f64,
    pub recent_activity: Vec<ActivityEntry>,
    pub weekly: Vec<ChartPoint>,
    pub compliance: Vec<ComplianceEntry>,
}

// ── Runtime configuration ────────────────────────────────────────────────────

/// Fixed contracts each action calls.
#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ActionTargets {
    pub rebalance_contract: String,
    pub gas_relay_contract: String,
    pub usdc_token: String,
}

impl Default for ActionTargets {
    fn default() -> Self {
        Self {
            rebalance_contract: "0x12d10a6941dfde53b6fa6fbc316516447867f675".to_string(),
            gas_relay_contract: "0x0716e32c5c0c6102e836e859969b103beec58eeb".to_string(),
            usdc_token: "0x1c7d4b196cb0c7b01d743fbc6116a902379c7238".to_string(),
        }
    }
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct RuntimeConfig {
    pub ecdsa_key_name: String,
    pub evm_chain_id: u64,
    pub evm_rpc_url: String,
    pub evm_rpc_max_response_bytes: u64,
    pub inference_model: String,
    pub openrouter_base_url: String,
    pub openrouter_api_key: Option<String>,
    pub openrouter_max_response_bytes: u64,
    pub session_address: Option<String>,
    pub targets: ActionTargets,
    pub utc_offset_minutes: i32,
    pub agent_seq: u64,
    pub subscription_seq: u64,
    pub log_seq: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ecdsa_key_name: String::new(),
            evm_chain_id: 11_155_111,
            evm_rpc_url: String::new(),
            evm_rpc_max_response_bytes: 4_096,
            inference_model: "openai/gpt-4o-mini".to_string(),
            openrouter_base_url: "https://openrouter.ai/api/v1".to_string(),
            openrouter_api_key: None,
            openrouter_max_response_bytes: 64 * 1024,
            session_address: None,
            targets: ActionTargets::default(),
            utc_offset_minutes: 0,
            agent_seq: 0,
            subscription_seq: 0,
            log_seq: 0,
        }
    }
}

/// `RuntimeConfig` without secrets or counters.
#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct RuntimeConfigView {
    pub ecdsa_key_name: String,
    pub evm_chain_id: u64,
    pub evm_rpc_url: String,
    pub inference_model: String,
    pub openrouter_base_url: String,
    pub openrouter_has_api_key: bool,
    pub session_address: Option<String>,
    pub targets: ActionTargets,
    pub utc_offset_minutes: i32,
}

impl From<&RuntimeConfig> for RuntimeConfigView {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            ecdsa_key_name: config.ecdsa_key_name.clone(),
            evm_chain_id: config.evm_chain_id,
            evm_rpc_url: config.evm_rpc_url.clone(),
            inference_model: config.inference_model.clone(),
            openrouter_base_url: config.openrouter_base_url.clone(),
            openrouter_has_api_key: config.openrouter_api_key.is_some(),
            session_address: config.session_address.clone(),
            targets: config.targets.clone(),
            utc_offset_minutes: config.utc_offset_minutes,
        }
    }
}
