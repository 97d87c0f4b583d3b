//! Static per-agent permission catalog and grant verification.
//!
//! The catalog is built once at install time and stored immutably; callers
//! receive it by reference, renewed against the current clock so a grant
//! window never ends while the canister keeps running. A name missing from
//! the catalog means the agent cannot be subscribed to.
use crate::domain::error::AgentError;
use crate::domain::types::{
    ActionTargets, AgentProfile, GrantedPermission, PermissionEnvelope, TokenLimit,
};
use serde::{Deserialize, Serialize};

pub const PORTFOLIO_REBALANCER: &str = "Portfolio Rebalancer";
pub const GAS_OPTIMISER: &str = "Gas Optimiser";

pub const SECONDS_PER_DAY: u64 = 86_400;
const GRANT_VALIDITY_SECS: u64 = 30 * SECONDS_PER_DAY;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct PermissionCatalog {
    profiles: Vec<AgentProfile>,
}

impl PermissionCatalog {
    pub fn new(profiles: Vec<AgentProfile>) -> Result<Self, String> {
        for profile in &profiles {
            profile
                .envelope
                .validate()
                .map_err(|error| format!("envelope for {} is invalid: {error}", profile.name))?;
        }
        Ok(Self { profiles })
    }

    /// Reference agents: a daily rebalancer and a gas relayer payer, both
    /// valid for 30 days from `now_secs`.
    pub fn reference(targets: &ActionTargets, now_secs: u64) -> Self {
        let expiry_secs = now_secs.saturating_add(GRANT_VALIDITY_SECS);
        Self {
            profiles: vec![
                AgentProfile {
                    name: PORTFOLIO_REBALANCER.to_string(),
                    description: "Daily portfolio rebalance within fixed budget. Automatically maintains your target asset allocation.".to_string(),
                    cost: "$0.50".to_string(),
                    can: vec![
                        "Swap assets on Uniswap/Curve".to_string(),
                        "Monitor prices".to_string(),
                        "Execute within 5% slippage".to_string(),
                    ],
                    cannot: vec![
                        "Withdraw to external addresses".to_string(),
                        "Interact with unverified contracts".to_string(),
                    ],
                    envelope: PermissionEnvelope {
                        allowed_targets: vec![targets.rebalance_contract.clone()],
                        allowed_methods: vec!["rebalance(uint256)".to_string()],
                        token_limits: vec![TokenLimit {
                            token: targets.usdc_token.clone(),
                            amount: "2000000".to_string(),
                            period_seconds: SECONDS_PER_DAY,
                        }],
                        expiry_secs,
                    },
                },
                AgentProfile {
                    name: GAS_OPTIMISER.to_string(),
                    description: "Pays gas relayer fees on your behalf within approved limits. Optimizes transaction costs.".to_string(),
                    cost: "$0.25".to_string(),
                    can: vec![
                        "Monitor mempool".to_string(),
                        "Batch transactions".to_string(),
                        "Bridge to L2s during lows".to_string(),
                    ],
                    cannot: vec![
                        "Change transaction amounts".to_string(),
                        "Access private keys".to_string(),
                    ],
                    envelope: PermissionEnvelope {
                        allowed_targets: vec![targets.gas_relay_contract.clone()],
                        allowed_methods: vec!["payRelayer(uint256)".to_string()],
                        token_limits: vec![TokenLimit {
                            token: targets.usdc_token.clone(),
                            amount: "1000000".to_string(),
                            period_seconds: SECONDS_PER_DAY,
                        }],
                        expiry_secs,
                    },
                },
            ],
        }
    }

    /// Copy whose envelopes stay valid for at least the grant window from
    /// `now_secs`. Expiries already further out are kept.
    pub fn renewed(&self, now_secs: u64) -> Self {
        let floor = now_secs.saturating_add(GRANT_VALIDITY_SECS);
        let mut renewed = self.clone();
        for profile in &mut renewed.profiles {
            profile.envelope.expiry_secs = profile.envelope.expiry_secs.max(floor);
        }
        renewed
    }

    pub fn profile_for(&self, agent_name: &str) -> Option<&AgentProfile> {
        self.profiles.iter().find(|profile| profile.name == agent_name)
    }

    pub fn envelope_for(&self, agent_name: &str) -> Option<&PermissionEnvelope> {
        self.profile_for(agent_name).map(|profile| &profile.envelope)
    }

    pub fn profiles(&self) -> &[AgentProfile] {
        &self.profiles
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl PermissionEnvelope {
    pub fn validate(&self) -> Result<(), String> {
        if self.expiry_secs == 0 {
            return Err("expiry must be an absolute unix timestamp".to_string());
        }
        for limit in &self.token_limits {
            limit.amount_micros()?;
            if limit.period_seconds == 0 {
                return Err("token limit period must be greater than zero".to_string());
            }
        }
        Ok(())
    }

    /// Only the first limit is consulted anywhere in this crate.
    pub fn primary_limit(&self) -> Option<&TokenLimit> {
        self.token_limits.first()
    }

    pub fn is_expired(&self, now_secs: u64) -> bool {
        now_secs >= self.expiry_secs
    }
}

impl TokenLimit {
    pub fn amount_micros(&self) -> Result<u128, String> {
        parse_micro_units(&self.amount)
    }
}

/// Parses a non-negative integer amount in 6-decimal fixed point.
pub fn parse_micro_units(raw: &str) -> Result<u128, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(format!("amount {raw:?} must be a non-negative integer string"));
    }
    trimmed
        .parse::<u128>()
        .map_err(|error| format!("amount {raw:?} is out of range: {error}"))
}

/// Accepts both `0xaa36a7` and `11155111`.
pub fn parse_chain_id(raw: &str) -> Result<u64, String> {
    let trimmed = raw.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex_digits) => u64::from_str_radix(hex_digits, 16),
        None => trimmed.parse::<u64>(),
    };
    parsed.map_err(|error| format!("chain id {raw:?} is invalid: {error}"))
}

pub fn is_evm_address(raw: &str) -> bool {
    let trimmed = raw.trim();
    trimmed.len() == 42
        && (trimmed.starts_with("0x") || trimmed.starts_with("0X"))
        && trimmed.bytes().skip(2).all(|byte| byte.is_ascii_hexdigit())
}

/// Checks a wallet-issued grant against the envelope that was requested.
///
/// Returns the grant's chain id on success.
pub fn verify_grant(
    envelope: &PermissionEnvelope,
    grant: &GrantedPermission,
    expected_chain_id: u64,
) -> Result<u64, AgentError> {
    let mismatch = |detail: String| AgentError::Validation(format!("granted permission {detail}"));

    if grant.context.trim().is_empty() {
        return Err(mismatch("is missing its permission context".to_string()));
    }
    if !is_evm_address(&grant.signer_meta.delegation_manager) {
        return Err(mismatch(
            "has an invalid delegation manager address".to_string(),
        ));
    }

    let chain_id = parse_chain_id(&grant.chain_id).map_err(mismatch)?;
    if chain_id != expected_chain_id {
        return Err(mismatch(format!(
            "targets chain {chain_id}, expected {expected_chain_id}"
        )));
    }

    let Some(limit) = envelope.primary_limit() else {
        return Ok(chain_id);
    };
    let data = &grant.permission.data;
    if !data.token_address.eq_ignore_ascii_case(&limit.token) {
        return Err(mismatch(format!(
            "token {} does not match {}",
            data.token_address, limit.token
        )));
    }
    let granted = parse_micro_units(&data.period_amount).map_err(mismatch)?;
    let requested = limit.amount_micros().map_err(mismatch)?;
    if granted != requested {
        return Err(mismatch(format!(
            "period amount {granted} does not match {requested}"
        )));
    }
    if data.period_duration != limit.period_seconds {
        return Err(mismatch(format!(
            "period duration {} does not match {}",
            data.period_duration, limit.period_seconds
        )));
    }
    if let Some(expiry) = grant.expiry {
        if expiry > envelope.expiry_secs {
            return Err(mismatch(format!(
                "expiry {expiry} exceeds envelope expiry {}",
                envelope.expiry_secs
            )));
        }
    }

    Ok(chain_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{PermissionGrantData, PermissionGrantDetails, SignerMeta};

    const NOW_SECS: u64 = 1_760_000_000;

    fn catalog() -> PermissionCatalog {
        PermissionCatalog::reference(&ActionTargets::default(), NOW_SECS)
    }

    fn grant_for(envelope: &PermissionEnvelope) -> GrantedPermission {
        let limit = envelope.primary_limit().unwrap();
        GrantedPermission {
            context: "0xdeadbeef".to_string(),
            chain_id: "0xaa36a7".to_string(),
            expiry: Some(envelope.expiry_secs),
            address: None,
            permission: PermissionGrantDetails {
                permission_type: "erc20-token-periodic".to_string(),
                data: PermissionGrantData {
                    token_address: limit.token.to_ascii_uppercase().replacen("0X", "0x", 1),
                    period_amount: limit.amount.clone(),
                    period_duration: limit.period_seconds,
                    start_time: Some(NOW_SECS),
                    justification: None,
                },
            },
            signer_meta: SignerMeta {
                delegation_manager: "0xdb9b1e94b5b69df7e401ddbede43491141047db3".to_string(),
            },
        }
    }

    #[test]
    fn reference_catalog_has_two_agents_with_valid_envelopes() {
        let catalog = catalog();
        assert_eq!(catalog.profiles().len(), 2);
        for profile in catalog.profiles() {
            profile.envelope.validate().unwrap();
            assert_eq!(profile.envelope.expiry_secs, NOW_SECS + 30 * SECONDS_PER_DAY);
        }
        let rebalance = catalog.envelope_for(PORTFOLIO_REBALANCER).unwrap();
        assert_eq!(rebalance.allowed_methods, vec!["rebalance(uint256)"]);
        assert_eq!(rebalance.primary_limit().unwrap().amount, "2000000");
    }

    #[test]
    fn renewed_catalog_keeps_a_full_window_ahead_of_now() {
        let later = NOW_SECS + 45 * SECONDS_PER_DAY;
        let stale = catalog();
        assert!(stale.envelope_for(GAS_OPTIMISER).unwrap().is_expired(later));

        let renewed = stale.renewed(later);
        for profile in renewed.profiles() {
            assert_eq!(profile.envelope.expiry_secs, later + 30 * SECONDS_PER_DAY);
            assert!(!profile.envelope.is_expired(later));
        }
        assert_eq!(stale.renewed(NOW_SECS - 10), stale);
    }

    #[test]
    fn unknown_agent_has_no_envelope() {
        assert!(catalog().envelope_for("Ops Agent").is_none());
        assert!(catalog().envelope_for("portfolio rebalancer").is_none());
    }

    #[test]
    fn envelope_validation_rejects_bad_amounts_and_periods() {
        let mut envelope = catalog().envelope_for(GAS_OPTIMISER).unwrap().clone();
        envelope.token_limits[0].amount = "-5".to_string();
        assert!(envelope.validate().is_err());
        envelope.token_limits[0].amount = "1.5".to_string();
        assert!(envelope.validate().is_err());
        envelope.token_limits[0].amount = "0".to_string();
        assert!(envelope.validate().is_ok());
        envelope.token_limits[0].period_seconds = 0;
        assert!(envelope.validate().is_err());
    }

    #[test]
    fn catalog_constructor_rejects_invalid_envelopes() {
        let mut profile = catalog().profile_for(GAS_OPTIMISER).unwrap().clone();
        profile.envelope.expiry_secs = 0;
        assert!(PermissionCatalog::new(vec![profile]).is_err());
    }

    #[test]
    fn chain_id_accepts_hex_and_decimal() {
        assert_eq!(parse_chain_id("0xaa36a7").unwrap(), 11_155_111);
        assert_eq!(parse_chain_id("11155111").unwrap(), 11_155_111);
        assert!(parse_chain_id("sepolia").is_err());
    }

    #[test]
    fn matching_grant_is_accepted() {
        let envelope = catalog().envelope_for(PORTFOLIO_REBALANCER).unwrap().clone();
        let grant = grant_for(&envelope);
        assert_eq!(verify_grant(&envelope, &grant, 11_155_111).unwrap(), 11_155_111);
    }

    #[test]
    fn mismatched_grants_are_rejected() {
        let envelope = catalog().envelope_for(PORTFOLIO_REBALANCER).unwrap().clone();

        let mut wrong_amount = grant_for(&envelope);
        wrong_amount.permission.data.period_amount = "5000000".to_string();
        assert!(matches!(
            verify_grant(&envelope, &wrong_amount, 11_155_111),
            Err(AgentError::Validation(_))
        ));

        let mut wrong_period = grant_for(&envelope);
        wrong_period.permission.data.period_duration = 3_600;
        assert!(verify_grant(&envelope, &wrong_period, 11_155_111).is_err());

        let mut wrong_token = grant_for(&envelope);
        wrong_token.permission.data.token_address =
            "0x0000000000000000000000000000000000000001".to_string();
        assert!(verify_grant(&envelope, &wrong_token, 11_155_111).is_err());

        let mut late_expiry = grant_for(&envelope);
        late_expiry.expiry = Some(envelope.expiry_secs + 1);
        assert!(verify_grant(&envelope, &late_expiry, 11_155_111).is_err());

        let mut empty_context = grant_for(&envelope);
        empty_context.context = " ".to_string();
        assert!(verify_grant(&envelope, &empty_context, 11_155_111).is_err());

        let grant = grant_for(&envelope);
        assert!(verify_grant(&envelope, &grant, 1).is_err());
    }
}
