//! Delegated call submission (ERC-7710 `redeemDelegations`).
//!
//! The session account never holds user funds. Each action is wrapped as a
//! single ERC-7579 execution, paired with the permission context the user
//! granted, and sent to the delegation manager, which enforces the caveats
//! on-chain.
use crate::domain::types::RuntimeConfig;
use crate::features::evm::{normalize_address, normalize_hex_blob, sign_and_send_call, HttpEvmRpcClient};
use crate::features::signer::SignerPort;
use alloy_primitives::{keccak256, U256};
use async_trait::async_trait;
use canlog::{log, GetLogFilter, LogFilter, LogPriorityLevels};
use serde::{Deserialize, Serialize};

const REDEEM_DELEGATIONS_SIGNATURE: &str = "redeemDelegations(bytes[],bytes32[],bytes[])";
/// ERC-7579 single call, default exec type.
const SINGLE_DEFAULT_MODE: [u8; 32] = [0u8; 32];

#[derive(Clone, Copy, Debug, Serialize, Deserialize, LogPriorityLevels)]
enum DelegationLogPriority {
    #[log_level(capacity = 1000, name = "DELEGATION_INFO")]
    Info,
    #[log_level(capacity = 500, name = "DELEGATION_ERROR")]
    Error,
}

impl GetLogFilter for DelegationLogPriority {
    fn get_log_filter() -> LogFilter {
        LogFilter::ShowAll
    }
}

/// One bounded call the session account performs under a granted permission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DelegatedCall {
    pub chain_id: u64,
    pub target: String,
    pub calldata: Vec<u8>,
    pub permission_context: String,
    pub delegation_manager: String,
}

#[async_trait(?Send)]
pub trait DelegatedSubmitter {
    /// Broadcasts the call and returns its transaction hash. A revert or
    /// transport failure comes back as `Err` with the underlying message.
    async fn submit(&self, call: &DelegatedCall) -> Result<String, String>;
}

pub struct HttpDelegatedSubmitter<S: SignerPort> {
    rpc: HttpEvmRpcClient,
    signer: S,
    session_address: String,
}

impl<S: SignerPort> HttpDelegatedSubmitter<S> {
    pub fn from_config(config: &RuntimeConfig, signer: S) -> Result<Self, String> {
        let session_address = config
            .session_address
            .as_deref()
            .ok_or_else(|| "session address not derived yet".to_string())?;
        Ok(Self {
            rpc: HttpEvmRpcClient::from_config(config)?,
            signer,
            session_address: normalize_address(session_address)?,
        })
    }
}

#[async_trait(?Send)]
impl<S: SignerPort> DelegatedSubmitter for HttpDelegatedSubmitter<S> {
    async fn submit(&self, call: &DelegatedCall) -> Result<String, String> {
        let manager = normalize_address(&call.delegation_manager)
            .map_err(|error| format!("invalid delegation manager: {error}"))?;
        let calldata = encode_delegated_call(call)?;

        match sign_and_send_call(
            &self.rpc,
            &self.signer,
            &self.session_address,
            call.chain_id,
            &manager,
            calldata,
        )
        .await
        {
            Ok(tx_hash) => {
                log!(
                    DelegationLogPriority::Info,
                    "delegated_call submitted target={} manager={} tx_hash={}",
                    call.target,
                    manager,
                    tx_hash
                );
                Ok(tx_hash)
            }
            Err(error) => {
                log!(
                    DelegationLogPriority::Error,
                    "delegated_call failed target={} manager={} error={}",
                    call.target,
                    manager,
                    error
                );
                Err(error)
            }
        }
    }
}

/// Stands in when the submitter cannot be configured; every call fails with
/// the configuration error, which then surfaces as a tool error.
pub struct UnavailableSubmitter {
    reason: String,
}

impl UnavailableSubmitter {
    pub fn new(reason: String) -> Self {
        Self { reason }
    }
}

#[async_trait(?Send)]
impl DelegatedSubmitter for UnavailableSubmitter {
    async fn submit(&self, call: &DelegatedCall) -> Result<String, String> {
        log!(
            DelegationLogPriority::Error,
            "delegated_call unavailable target={} reason={}",
            call.target,
            self.reason
        );
        Err(format!("delegated submission unavailable: {}", self.reason))
    }
}

/// Encodes the full `redeemDelegations` calldata for `call`.
pub fn encode_delegated_call(call: &DelegatedCall) -> Result<Vec<u8>, String> {
    let target = normalize_address(&call.target)
        .map_err(|error| format!("invalid target: {error}"))?;
    let context = decode_permission_context(&call.permission_context)?;
    let execution = encode_single_execution(&target, U256::ZERO, &call.calldata)?;
    Ok(encode_redeem_delegations(&context, &execution))
}

pub fn function_selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// `selector || uint256` calldata for single-argument functions.
pub fn encode_uint256_call(signature: &str, value: U256) -> Vec<u8> {
    let mut out = function_selector(signature).to_vec();
    out.extend_from_slice(&encode_u256_word(value));
    out
}

/// Packed ERC-7579 single execution: `target(20) || value(32) || calldata`.
fn encode_single_execution(target: &str, value: U256, calldata: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(52 + calldata.len());
    let mut address = [0u8; 20];
    hex::decode_to_slice(target.trim_start_matches("0x"), &mut address)
        .map_err(|error| format!("failed to decode target address: {error}"))?;
    out.extend_from_slice(&address);
    out.extend_from_slice(&encode_u256_word(value));
    out.extend_from_slice(calldata);
    Ok(out)
}

fn encode_redeem_delegations(context: &[u8], execution: &[u8]) -> Vec<u8> {
    let contexts = encode_bytes_array(&[context]);
    let mut modes = encode_u256_word(U256::from(1u8));
    modes.extend_from_slice(&SINGLE_DEFAULT_MODE);
    let executions = encode_bytes_array(&[execution]);

    let head_len = 3 * 32;
    let modes_offset = head_len + contexts.len();
    let executions_offset = modes_offset + modes.len();

    let mut out = function_selector(REDEEM_DELEGATIONS_SIGNATURE).to_vec();
    out.extend_from_slice(&encode_u256_word(U256::from(head_len)));
    out.extend_from_slice(&encode_u256_word(U256::from(modes_offset)));
    out.extend_from_slice(&encode_u256_word(U256::from(executions_offset)));
    out.extend_from_slice(&contexts);
    out.extend_from_slice(&modes);
    out.extend_from_slice(&executions);
    out
}

/// `bytes[]` tail: length, per-item offsets relative to the first offset
/// word, then each item as dynamic bytes.
fn encode_bytes_array(items: &[&[u8]]) -> Vec<u8> {
    let encoded = items
        .iter()
        .map(|item| encode_dynamic_bytes(item))
        .collect::<Vec<_>>();

    let mut out = encode_u256_word(U256::from(items.len()));
    let mut offset = items.len() * 32;
    for item in &encoded {
        out.extend_from_slice(&encode_u256_word(U256::from(offset)));
        offset += item.len();
    }
    for item in encoded {
        out.extend_from_slice(&item);
    }
    out
}

fn encode_dynamic_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut out = encode_u256_word(U256::from(bytes.len()));
    out.extend_from_slice(bytes);
    let padding = (32 - bytes.len() % 32) % 32;
    out.extend(std::iter::repeat(0u8).take(padding));
    out
}

fn encode_u256_word(value: U256) -> Vec<u8> {
    value.to_be_bytes::<32>().to_vec()
}

fn decode_permission_context(raw: &str) -> Result<Vec<u8>, String> {
    let normalized = normalize_hex_blob(raw, "permission context")?;
    let digits = normalized.trim_start_matches("0x");
    if digits.is_empty() {
        return Err("permission context is empty".to_string());
    }
    hex::decode(digits).map_err(|error| format!("failed to decode permission context: {error}"))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::evm::{HOST_EVM_RPC_MODE_ENV, HOST_EVM_RPC_STUB_REVERT_ENV};
    use crate::features::signer::MockSigner;
    use crate::test_support::{block_on_with_spin, with_locked_host_env};

    const TARGET: &str = "0x12d10a6941dfde53b6fa6fbc316516447867f675";
    const MANAGER: &str = "0xdb9b1e94b5b69df7e401ddbede43491141047db3";

    fn word_at(data: &[u8], index: usize) -> U256 {
        U256::from_be_slice(&data[index..index + 32])
    }

    fn sample_call() -> DelegatedCall {
        DelegatedCall {
            chain_id: 11_155_111,
            target: TARGET.to_string(),
            calldata: encode_uint256_call("payRelayer(uint256)", U256::from(1_000_000u64)),
            permission_context: "0xdeadbeef".to_string(),
            delegation_manager: MANAGER.to_string(),
        }
    }

    #[test]
    fn selector_matches_known_erc20_transfer() {
        assert_eq!(
            function_selector("transfer(address,uint256)"),
            [0xa9, 0x05, 0x9c, 0xbb]
        );
    }

    #[test]
    fn uint256_call_is_selector_plus_one_word() {
        let data = encode_uint256_call("rebalance(uint256)", U256::from(600u64));
        assert_eq!(data.len(), 36);
        assert_eq!(&data[..4], &function_selector("rebalance(uint256)"));
        assert_eq!(word_at(&data, 4), U256::from(600u64));
    }

    #[test]
    fn redeem_delegations_layout_points_at_each_tail() {
        let call = sample_call();
        let data = encode_delegated_call(&call).unwrap();
        assert_eq!(&data[..4], &function_selector(REDEEM_DELEGATIONS_SIGNATURE));
        let body = &data[4..];
        assert_eq!(body.len() % 32, 0);

        let contexts_at = word_at(body, 0).to::<usize>();
        let modes_at = word_at(body, 32).to::<usize>();
        let executions_at = word_at(body, 64).to::<usize>();
        assert_eq!(contexts_at, 96);

        // contexts: [len=1][offset=32][bytes len=4][deadbeef padded]
        assert_eq!(word_at(body, contexts_at), U256::from(1u8));
        assert_eq!(word_at(body, contexts_at + 32), U256::from(32u8));
        assert_eq!(word_at(body, contexts_at + 64), U256::from(4u8));
        assert_eq!(&body[contexts_at + 96..contexts_at + 100], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(modes_at, contexts_at + 128);

        assert_eq!(word_at(body, modes_at), U256::from(1u8));
        assert_eq!(word_at(body, modes_at + 32), U256::ZERO);
        assert_eq!(executions_at, modes_at + 64);

        let execution_len = word_at(body, executions_at + 64).to::<usize>();
        assert_eq!(execution_len, 20 + 32 + call.calldata.len());
        let execution = &body[executions_at + 96..executions_at + 96 + execution_len];
        assert_eq!(hex::encode(&execution[..20]), TARGET.trim_start_matches("0x"));
        assert_eq!(&execution[52..], call.calldata.as_slice());
    }

    #[test]
    fn encoding_rejects_bad_context_and_target() {
        let mut call = sample_call();
        call.permission_context = "0x".to_string();
        assert!(encode_delegated_call(&call).unwrap_err().contains("empty"));
        call.permission_context = "not-hex".to_string();
        assert!(encode_delegated_call(&call).is_err());

        let mut call = sample_call();
        call.target = "0x1234".to_string();
        assert!(encode_delegated_call(&call).unwrap_err().contains("invalid target"));
    }

    #[test]
    fn http_submitter_requires_session_address() {
        let config = RuntimeConfig {
            evm_rpc_url: "https://rpc.sepolia.org".to_string(),
            ..RuntimeConfig::default()
        };
        let error = HttpDelegatedSubmitter::from_config(&config, MockSigner)
            .err()
            .unwrap();
        assert!(error.contains("session address"));
    }

    #[test]
    fn http_submitter_returns_hash_or_revert_reason_from_host_stub() {
        let config = RuntimeConfig {
            evm_rpc_url: "https://rpc.sepolia.org".to_string(),
            session_address: Some("0x1111111111111111111111111111111111111111".to_string()),
            ..RuntimeConfig::default()
        };
        let submitter = HttpDelegatedSubmitter::from_config(&config, MockSigner).unwrap();

        let tx_hash = with_locked_host_env(
            &[(HOST_EVM_RPC_MODE_ENV, None), (HOST_EVM_RPC_STUB_REVERT_ENV, None)],
            || block_on_with_spin(submitter.submit(&sample_call())),
        )
        .unwrap();
        assert_eq!(tx_hash, format!("0x{}", "a".repeat(64)));

        let error = with_locked_host_env(
            &[
                (HOST_EVM_RPC_MODE_ENV, None),
                (HOST_EVM_RPC_STUB_REVERT_ENV, Some("period allowance exceeded")),
            ],
            || block_on_with_spin(submitter.submit(&sample_call())),
        )
        .unwrap_err();
        assert!(error.contains("period allowance exceeded"));
    }

    #[test]
    fn mock_submitter_records_calls() {
        let submitter = mock::MockDelegatedSubmitter::succeeding("0xabc");
        let result = block_on_with_spin(submitter.submit(&sample_call()));
        assert_eq!(result.unwrap(), "0xabc");
        assert_eq!(submitter.calls().len(), 1);
        assert_eq!(submitter.calls()[0].target, TARGET);
    }

    #[test]
    fn unavailable_submitter_reports_its_reason() {
        let submitter = UnavailableSubmitter::new("evm rpc url is not configured".to_string());
        let error = block_on_with_spin(submitter.submit(&sample_call())).unwrap_err();
        assert_eq!(
            error,
            "delegated submission unavailable: evm rpc url is not configured"
        );
    }
}
