//! Validator registry and delegation ledger.
//!
//! The registry owns validator records and their stake aggregates; the
//! ledger owns delegation records and routes every aggregate change back
//! through the registry so the two stay consistent.

pub mod delegation;
pub mod error;
pub mod registry;

pub use delegation::{
    DelegationLedger, DelegationRecord, DelegationRequest, DelegationStatus, RewardClaimRequest,
    UndelegationOutcome, UndelegationRequest,
};
pub use error::{StakingError, StakingErrorKind};
pub use registry::{
    StatusChange, ValidatorRecord, ValidatorRegistry, ValidatorStatus, ValidatorUpdate,
    ValidatorUpdateKind,
};
