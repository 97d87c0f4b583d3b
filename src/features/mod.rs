pub mod delegation;
pub mod evm;
pub mod inference;
pub mod signer;
pub mod threshold_signer;
