//! Tripwire Vault
//!
//! Builds and models "vaults": funds locked into a three-stage, pre-signed
//! transaction tree. The vault transaction locks coins to a fresh key; one
//! trigger transaction per sampled fee rate starts the unvault countdown;
//! one panic transaction per trigger per sampled fee rate aborts to a cold
//! address the moment coercion is suspected.
//!
//! # Tree shape
//!
//! ```text
//! vault tx ──▶ trigger tx (×S fee rates) ──▶ panic tx (×S fee rates each)
//!                  │
//!                  └─ or(pk(PANIC), and(pk(UNVAULT), older(LOCK)))
//! ```
//!
//! The panic path spends immediately; the unvault path must wait out the
//! relative timelock, which is the owner's window to panic.

pub mod build;
pub mod estimate;
pub mod model;
pub mod policy;
pub mod registry;
pub mod sign;
pub mod weights;

pub use build::{BuildError, BuildRequest, VaultBuilder};
pub use estimate::{AmountSplit, EstimateError, RangeEstimator, VaultAmountEstimate};
pub use model::{TriggerEntry, TxMeta, Vault, VaultStatus};
pub use policy::{LockBlocks, PolicyError, TriggerPolicy};
pub use registry::{AllocError, VaultIdAllocator};
pub use sign::{Signer, SignError, SoftwareSigner};
