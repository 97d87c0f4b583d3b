//! EVM JSON-RPC client and EIP-1559 transaction signing for the session account.
//!
//! On wasm32 requests go out as non-replicated IC HTTPS outcalls. Natively,
//! requests are answered by a canned stub unless
//! `SCOPED_AGENT_EVM_RPC_HOST_MODE=real`, in which case `ureq` talks to the
//! configured node.
use crate::domain::types::RuntimeConfig;
use crate::features::signer::SignerPort;
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::{length_of_length, BufMut, Encodable, Header};
use serde_json::{json, Value};
#[cfg(not(target_arch = "wasm32"))]
use std::io::Read;

#[cfg(target_arch = "wasm32")]
use candid::Nat;
#[cfg(target_arch = "wasm32")]
use ic_cdk::management_canister::{http_request, HttpHeader, HttpMethod, HttpRequestArgs};
#[cfg(target_arch = "wasm32")]
use sha3::{Digest, Keccak256};

const MAX_EVM_RPC_RESPONSE_BYTES: u64 = 2 * 1024 * 1024;
const MIN_EVM_RPC_RESPONSE_BYTES: u64 = 256;
const EMPTY_ACCESS_LIST_RLP_LEN: usize = 1;
const DEFAULT_PRIORITY_FEE_WEI: u64 = 1_000_000_000;
#[cfg(not(target_arch = "wasm32"))]
pub(crate) const HOST_EVM_RPC_MODE_ENV: &str = "SCOPED_AGENT_EVM_RPC_HOST_MODE";
/// When set natively, the stub answers `eth_estimateGas` with this revert reason.
#[cfg(not(target_arch = "wasm32"))]
pub(crate) const HOST_EVM_RPC_STUB_REVERT_ENV: &str = "SCOPED_AGENT_EVM_RPC_STUB_REVERT";

#[derive(Clone, Debug)]
pub struct HttpEvmRpcClient {
    rpc_url: String,
    max_response_bytes: u64,
}

impl HttpEvmRpcClient {
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, String> {
        let rpc_url = config.evm_rpc_url.trim();
        if rpc_url.is_empty() {
            return Err("evm rpc url is not configured".to_string());
        }
        Ok(Self {
            rpc_url: rpc_url.to_string(),
            max_response_bytes: clamp_response_bytes(config.evm_rpc_max_response_bytes),
        })
    }

    pub async fn eth_get_transaction_count(&self, address: &str) -> Result<u64, String> {
        let raw = self
            .rpc_result_str("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        parse_hex_u64(&raw, "eth_getTransactionCount")
    }

    pub async fn eth_gas_price(&self) -> Result<U256, String> {
        let raw = self.rpc_result_str("eth_gasPrice", json!([])).await?;
        parse_hex_u256(&raw, "eth_gasPrice")
    }

    /// A revert during estimation surfaces here, before anything is broadcast.
    pub async fn eth_estimate_gas(&self, from: &str, to: &str, data_hex: &str) -> Result<u64, String> {
        let raw = self
            .rpc_result_str(
                "eth_estimateGas",
                json!([{ "from": from, "to": to, "value": "0x0", "data": data_hex }]),
            )
            .await?;
        parse_hex_u64(&raw, "eth_estimateGas")
    }

    pub async fn eth_send_raw_transaction(&self, raw_tx: &[u8]) -> Result<String, String> {
        let payload = format!("0x{}", hex::encode(raw_tx));
        let raw = self
            .rpc_result_str("eth_sendRawTransaction", json!([payload]))
            .await?;
        normalize_hex_blob(&raw, "eth_sendRawTransaction result")
    }

    async fn rpc_result_str(&self, method: &str, params: Value) -> Result<String, String> {
        let response = self
            .rpc_call(method, params)
            .await
            .map_err(|error| format!("{method} failed: {error}"))?;
        response
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| format!("{method} result was missing"))
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, String> {
        let body = serde_json::to_vec(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .map_err(|error| format!("failed to serialize {method} request: {error}"))?;

        let raw = self.http_post(&body).await?;
        let value: Value = serde_json::from_slice(&raw)
            .map_err(|error| format!("failed to parse {method} response JSON: {error}"))?;
        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(message);
        }
        Ok(value)
    }

    #[cfg(target_arch = "wasm32")]
    async fn http_post(&self, body: &[u8]) -> Result<Vec<u8>, String> {
        let request = HttpRequestArgs {
            url: self.rpc_url.clone(),
            max_response_bytes: Some(self.max_response_bytes),
            method: HttpMethod::POST,
            headers: vec![HttpHeader {
                name: "content-type".to_string(),
                value: "application/json".to_string(),
            }],
            body: Some(body.to_vec()),
            transform: None,
            is_replicated: Some(false),
        };

        let response = http_request(&request)
            .await
            .map_err(|error| format!("evm rpc outcall failed: {error}"))?;
        let status = nat_to_u16(&response.status)?;
        if !(200..300).contains(&status) {
            return Err(format!("evm rpc returned status {status}"));
        }
        Ok(response.body)
    }

    #[cfg(not(target_arch = "wasm32"))]
    async fn http_post(&self, body: &[u8]) -> Result<Vec<u8>, String> {
        if !host_rpc_real_mode_enabled() {
            return host_rpc_stub_response(body);
        }

        let response = ureq::post(&self.rpc_url)
            .set("content-type", "application/json")
            .send_bytes(body)
            .map_err(|error| match error {
                ureq::Error::Status(status, _) => format!("evm rpc returned status {status}"),
                ureq::Error::Transport(transport) => {
                    format!("evm rpc host transport failed: {transport}")
                }
            })?;

        let mut raw = Vec::new();
        response
            .into_reader()
            .take(self.max_response_bytes.saturating_add(1))
            .read_to_end(&mut raw)
            .map_err(|error| format!("failed to read host rpc response body: {error}"))?;
        if u64::try_from(raw.len()).unwrap_or(u64::MAX) > self.max_response_bytes {
            return Err(format!(
                "host rpc response exceeded max_response_bytes={}",
                self.max_response_bytes
            ));
        }
        Ok(raw)
    }
}

// ── Transaction submission ──────────────────────────────────────────────────

/// Builds, signs and broadcasts a zero-value EIP-1559 call from `from`.
///
/// Returns the transaction hash reported by the node.
pub async fn sign_and_send_call(
    rpc: &HttpEvmRpcClient,
    signer: &dyn SignerPort,
    from: &str,
    chain_id: u64,
    to: &str,
    data: Vec<u8>,
) -> Result<String, String> {
    let from = normalize_address(from)?;
    let to_hex = normalize_address(to)?;
    let to_address = to_hex
        .parse::<Address>()
        .map_err(|error| format!("invalid destination address: {error}"))?;
    let data_hex = format!("0x{}", hex::encode(&data));

    let nonce = rpc.eth_get_transaction_count(&from).await?;
    let gas_limit = rpc.eth_estimate_gas(&from, &to_hex, &data_hex).await?;
    let base_fee = rpc
        .eth_gas_price()
        .await
        .unwrap_or_else(|_| U256::from(DEFAULT_PRIORITY_FEE_WEI));
    let max_priority_fee_per_gas = U256::from(DEFAULT_PRIORITY_FEE_WEI);

    let tx = Eip1559UnsignedTx {
        chain_id: U256::from(chain_id),
        nonce: U256::from(nonce),
        max_priority_fee_per_gas,
        max_fee_per_gas: base_fee + max_priority_fee_per_gas,
        gas_limit: U256::from(gas_limit),
        to: to_address,
        value: U256::ZERO,
        data: Bytes::from(data),
    };

    let unsigned = encode_eip1559_unsigned(&tx);
    let tx_hash = keccak256(&unsigned);
    let message_hash = format!("0x{}", hex::encode(tx_hash.as_slice()));
    let signature = parse_compact_signature(&signer.sign_message(&message_hash).await?)?;
    let y_parity = recover_y_parity(&tx_hash, &signature, &from)?;
    let r = U256::from_be_slice(&signature[..32]);
    let s = U256::from_be_slice(&signature[32..]);
    let signed = encode_eip1559_signed(&tx, y_parity, r, s);

    rpc.eth_send_raw_transaction(&signed).await
}

#[derive(Clone, Debug)]
struct Eip1559UnsignedTx {
    chain_id: U256,
    nonce: U256,
    max_priority_fee_per_gas: U256,
    max_fee_per_gas: U256,
    gas_limit: U256,
    to: Address,
    value: U256,
    data: Bytes,
}

impl Eip1559UnsignedTx {
    fn payload_length(&self) -> usize {
        self.chain_id.length()
            + self.nonce.length()
            + self.max_priority_fee_per_gas.length()
            + self.max_fee_per_gas.length()
            + self.gas_limit.length()
            + self.to.length()
            + self.value.length()
            + self.data.length()
            + EMPTY_ACCESS_LIST_RLP_LEN
    }

    fn encode_fields(&self, out: &mut dyn BufMut) {
        self.chain_id.encode(out);
        self.nonce.encode(out);
        self.max_priority_fee_per_gas.encode(out);
        self.max_fee_per_gas.encode(out);
        self.gas_limit.encode(out);
        self.to.encode(out);
        self.value.encode(out);
        self.data.encode(out);
        Header {
            list: true,
            payload_length: 0,
        }
        .encode(out);
    }
}

impl Encodable for Eip1559UnsignedTx {
    fn encode(&self, out: &mut dyn BufMut) {
        Header {
            list: true,
            payload_length: self.payload_length(),
        }
        .encode(out);
        self.encode_fields(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length + length_of_length(payload_length)
    }
}

struct Eip1559SignedTx<'a> {
    tx: &'a Eip1559UnsignedTx,
    y_parity: u8,
    r: U256,
    s: U256,
}

impl Eip1559SignedTx<'_> {
    fn payload_length(&self) -> usize {
        self.tx.payload_length() + self.y_parity.length() + self.r.length() + self.s.length()
    }
}

impl Encodable for Eip1559SignedTx<'_> {
    fn encode(&self, out: &mut dyn BufMut) {
        Header {
            list: true,
            payload_length: self.payload_length(),
        }
        .encode(out);
        self.tx.encode_fields(out);
        self.y_parity.encode(out);
        self.r.encode(out);
        self.s.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length + length_of_length(payload_length)
    }
}

fn encode_eip1559_unsigned(tx: &Eip1559UnsignedTx) -> Vec<u8> {
    with_type_prefix(alloy_rlp::encode(tx))
}

fn encode_eip1559_signed(tx: &Eip1559UnsignedTx, y_parity: u8, r: U256, s: U256) -> Vec<u8> {
    with_type_prefix(alloy_rlp::encode(Eip1559SignedTx { tx, y_parity, r, s }))
}

fn with_type_prefix(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(0x02);
    out.extend_from_slice(&payload);
    out
}

#[cfg(not(target_arch = "wasm32"))]
fn recover_y_parity(
    _tx_hash: &B256,
    _signature_compact: &[u8; 64],
    _expected_address: &str,
) -> Result<u8, String> {
    Ok(0)
}

#[cfg(target_arch = "wasm32")]
fn recover_y_parity(
    tx_hash: &B256,
    signature_compact: &[u8; 64],
    expected_address: &str,
) -> Result<u8, String> {
    use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
    use k256::elliptic_curve::sec1::ToEncodedPoint;

    let signature = Signature::from_slice(signature_compact)
        .map_err(|error| format!("invalid compact signature bytes: {error}"))?;
    let expected = expected_address.trim().to_ascii_lowercase();

    for candidate in [0u8, 1u8] {
        let Some(recovery_id) = RecoveryId::from_byte(candidate) else {
            continue;
        };
        let Ok(recovered) =
            VerifyingKey::recover_from_prehash(tx_hash.as_slice(), &signature, recovery_id)
        else {
            continue;
        };
        let uncompressed = recovered.to_encoded_point(false);
        let bytes = uncompressed.as_bytes();
        if bytes.len() != 65 || bytes.first().copied() != Some(0x04) {
            continue;
        }
        let digest = Keccak256::digest(&bytes[1..]);
        if format!("0x{}", hex::encode(&digest[12..32])) == expected {
            return Ok(candidate);
        }
    }

    Err("failed to recover EIP-1559 y_parity for session signature".to_string())
}

// ── Parsing helpers ─────────────────────────────────────────────────────────

#[cfg(target_arch = "wasm32")]
fn nat_to_u16(status: &Nat) -> Result<u16, String> {
    status
        .to_string()
        .parse::<u16>()
        .map_err(|error| format!("invalid HTTP status {status}: {error}"))
}

fn clamp_response_bytes(max_response_bytes: u64) -> u64 {
    max_response_bytes.clamp(MIN_EVM_RPC_RESPONSE_BYTES, MAX_EVM_RPC_RESPONSE_BYTES)
}

fn parse_hex_u64(raw: &str, field: &str) -> Result<u64, String> {
    let value = raw.trim();
    let without_prefix = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| format!("{field} must be 0x-prefixed hex"))?;
    u64::from_str_radix(without_prefix, 16)
        .map_err(|error| format!("failed to parse {field} as hex u64: {error}"))
}

fn parse_hex_u256(raw: &str, field: &str) -> Result<U256, String> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let without_prefix = trimmed
        .strip_prefix("0x")
        .ok_or_else(|| format!("{field} must be 0x-prefixed hex"))?;
    if without_prefix.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(without_prefix, 16)
        .map_err(|error| format!("failed to parse {field} as hex u256: {error}"))
}

pub(crate) fn normalize_address(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim().to_ascii_lowercase();
    if !crate::domain::permissions::is_evm_address(&trimmed) {
        return Err(format!("address {raw:?} must be a 0x-prefixed 20-byte hex string"));
    }
    Ok(trimmed)
}

pub(crate) fn normalize_hex_blob(raw: &str, field: &str) -> Result<String, String> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let without_prefix = trimmed
        .strip_prefix("0x")
        .ok_or_else(|| format!("{field} must be 0x-prefixed hex"))?;
    if without_prefix.len() % 2 != 0 {
        return Err(format!("{field} hex length must be even"));
    }
    if !without_prefix.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return Err(format!("{field} must be valid hex"));
    }
    Ok(trimmed)
}

fn parse_compact_signature(raw: &str) -> Result<[u8; 64], String> {
    let normalized = normalize_hex_blob(raw, "signature")?;
    let without_prefix = normalized.trim_start_matches("0x");
    if without_prefix.len() != 128 {
        return Err("signature must be 64 bytes (r||s)".to_string());
    }
    let mut out = [0u8; 64];
    hex::decode_to_slice(without_prefix, &mut out)
        .map_err(|error| format!("failed to decode signature: {error}"))?;
    Ok(out)
}

// ── Native host stub ────────────────────────────────────────────────────────

#[cfg(not(target_arch = "wasm32"))]
fn host_rpc_real_mode_enabled() -> bool {
    std::env::var(HOST_EVM_RPC_MODE_ENV)
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "real" | "1" | "true" | "yes")
        })
        .unwrap_or(false)
}

#[cfg(not(target_arch = "wasm32"))]
fn host_rpc_stub_response(body: &[u8]) -> Result<Vec<u8>, String> {
    let request: Value = serde_json::from_slice(body)
        .map_err(|error| format!("host rpc stub could not parse request JSON: {error}"))?;
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| "host rpc stub request is missing method".to_string())?;

    let response = match method {
        "eth_getTransactionCount" => json!({"jsonrpc":"2.0","id":1,"result":"0x0"}),
        "eth_gasPrice" => json!({"jsonrpc":"2.0","id":1,"result":"0x3b9aca00"}),
        "eth_estimateGas" => match std::env::var(HOST_EVM_RPC_STUB_REVERT_ENV) {
            Ok(reason) => json!({
                "jsonrpc":"2.0",
                "id":1,
                "error":{"code":3,"message":format!("execution reverted: {reason}")}
            }),
            Err(_) => json!({"jsonrpc":"2.0","id":1,"result":"0x186a0"}),
        },
        "eth_sendRawTransaction" => json!({
            "jsonrpc":"2.0",
            "id":1,
            "result":"0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
        }),
        unsupported => {
            return Err(format!("host rpc stub does not support method {unsupported}"));
        }
    };

    serde_json::to_vec(&response)
        .map_err(|error| format!("host rpc stub failed to serialize response: {error}"))
}
