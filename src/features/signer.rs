use async_trait::async_trait;

/// Signs 32-byte message hashes on behalf of the session account.
#[async_trait(?Send)]
pub trait SignerPort {
    /// Returns the compact 64-byte signature (r || s) as 0x-prefixed hex.
    async fn sign_message(&self, message_hash: &str) -> Result<String, String>;
}

/// Echoes the hash into `r` and zero-fills `s`.
#[cfg(test)]
#[derive(Clone, Debug, Default)]
pub struct MockSigner;

#[cfg(test)]
#[async_trait(?Send)]
impl SignerPort for MockSigner {
    async fn sign_message(&self, message_hash: &str) -> Result<String, String> {
        let digits = message_hash.trim().trim_start_matches("0x");
        if digits.len() != 64 {
            return Err("message_hash must be exactly 32 bytes".to_string());
        }
        Ok(format!("0x{digits}{}", "0".repeat(64)))
    }
}
