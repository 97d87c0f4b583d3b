/// IC threshold ECDSA signing for the session account.
///
/// `ThresholdSigner` implements `SignerPort` through the management
/// canister's `sign_with_ecdsa` (secp256k1, derivation path `b"session"`).
/// The resulting EVM address is the delegate that redeems every granted
/// permission; it is derived once and cached in the runtime config.
///
/// On non-wasm32 targets the signer returns a deterministic mock signature
/// and the address is derived from the key name, so the signing path runs
/// in unit tests without a replica.
use crate::features::signer::SignerPort;
use crate::storage::stable;
use async_trait::async_trait;
use sha3::{Digest, Keccak256};

#[cfg(target_arch = "wasm32")]
use ic_cdk::management_canister::{
    ecdsa_public_key, sign_with_ecdsa, EcdsaCurve, EcdsaKeyId, EcdsaPublicKeyArgs,
    SignWithEcdsaArgs,
};

// Shared by `ecdsa_public_key` and `sign_with_ecdsa` so the addresses match.
#[cfg(target_arch = "wasm32")]
const SESSION_DERIVATION_PATH: &[u8] = b"session";

#[derive(Clone, Debug)]
pub struct ThresholdSigner {
    key_name: String,
}

impl ThresholdSigner {
    pub fn new(key_name: String) -> Self {
        Self { key_name }
    }
}

#[async_trait(?Send)]
impl SignerPort for ThresholdSigner {
    async fn sign_message(&self, message_hash: &str) -> Result<String, String> {
        if stable::get_session_address().is_none() {
            return Err("session address not derived yet".to_string());
        }

        let parsed_hash = parse_message_hash(message_hash)?;
        #[cfg(not(target_arch = "wasm32"))]
        {
            let _ = &self.key_name;
            let mut mock_signature = vec![0u8; 64];
            mock_signature[..32].copy_from_slice(&parsed_hash);
            return Ok(format!("0x{}", hex::encode(mock_signature)));
        }

        #[cfg(target_arch = "wasm32")]
        {
            let response = sign_with_ecdsa(&SignWithEcdsaArgs {
                message_hash: parsed_hash.to_vec(),
                derivation_path: vec![SESSION_DERIVATION_PATH.to_vec()],
                key_id: EcdsaKeyId {
                    curve: EcdsaCurve::Secp256k1,
                    name: self.key_name.clone(),
                },
            })
            .await
            .map_err(|error| format!("sign_with_ecdsa failed: {error}"))?;

            Ok(format!("0x{}", hex::encode(response.signature)))
        }
    }
}

/// Derive the session account's EVM address for `key_name` and cache it.
///
/// - wasm32: `ecdsa_public_key`, then Keccak256 of the uncompressed key.
/// - non-wasm32: a deterministic mock address derived from `key_name`.
pub async fn derive_and_cache_session_address(key_name: &str) -> Result<String, String> {
    if key_name.trim().is_empty() {
        return Err("ecdsa key name cannot be empty".to_string());
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        let digest = Keccak256::digest(key_name.as_bytes());
        let address = format!("0x{}", hex::encode(&digest[12..32]));
        stable::set_session_address(Some(address.clone()))?;
        Ok(address)
    }

    #[cfg(target_arch = "wasm32")]
    {
        let response = ecdsa_public_key(&EcdsaPublicKeyArgs {
            canister_id: None,
            derivation_path: vec![SESSION_DERIVATION_PATH.to_vec()],
            key_id: EcdsaKeyId {
                curve: EcdsaCurve::Secp256k1,
                name: key_name.to_string(),
            },
        })
        .await
        .map_err(|error| format!("ecdsa_public_key failed: {error}"))?;

        let address = ethereum_address_from_sec1_public_key(&response.public_key)?;
        stable::set_session_address(Some(address.clone()))?;
        Ok(address)
    }
}

fn parse_message_hash(raw: &str) -> Result<[u8; 32], String> {
    let hash = raw.trim();
    let without_prefix = hash
        .strip_prefix("0x")
        .or_else(|| hash.strip_prefix("0X"))
        .ok_or_else(|| "message_hash must be 0x-prefixed hex".to_string())?;
    if without_prefix.len() != 64 {
        return Err("message_hash must be exactly 32 bytes".to_string());
    }

    let mut out = [0u8; 32];
    hex::decode_to_slice(without_prefix, &mut out)
        .map_err(|error| format!("message_hash is not valid hex: {error}"))?;
    Ok(out)
}

#[cfg(target_arch = "wasm32")]
fn ethereum_address_from_sec1_public_key(sec1: &[u8]) -> Result<String, String> {
    use k256::elliptic_curve::sec1::ToEncodedPoint;
    use k256::PublicKey;

    let public_key = PublicKey::from_sec1_bytes(sec1)
        .map_err(|error| format!("invalid sec1 public key from ecdsa_public_key: {error}"))?;
    let uncompressed = public_key.to_encoded_point(false);
    let bytes = uncompressed.as_bytes();
    if bytes.len() != 65 || bytes.first().copied() != Some(0x04) {
        return Err("unexpected uncompressed public key format".to_string());
    }

    let digest = Keccak256::digest(&bytes[1..]);
    Ok(format!("0x{}", hex::encode(&digest[12..32])))
}
