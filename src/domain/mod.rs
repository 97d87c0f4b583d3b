pub mod accounting;
pub mod error;
pub mod metadata;
pub mod permissions;
pub mod state_machine;
pub mod types;
