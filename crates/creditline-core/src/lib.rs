//! Core types for creditline.
//!
//! This crate provides the domain types of the credit ledger, with no I/O:
//!
//! - **Identifiers**: `AccountId`, `LedgerEntryId`, `PaymentOrderId`, `JobId`, `BatchId`, `ReferralId`
//! - **Accounts**: `Account`
//! - **Ledger**: `LedgerEntry`, `EntryKind`, `BalanceAudit`
//! - **Payments**: `PaymentOrder`, `PaymentProvider`, `OrderStatus`
//! - **Jobs**: `GenerationJob`, `JobPayload`, `Billable`
//! - **Referrals**: `ReferralEvent`, `ReferralOutcome`
//! - **Pricing**: `PricingConfig`, `CreditPackage`
//!
//! # Credits
//!
//! Credits are the single currency. Balances and amounts are `i64` and a
//! balance is never negative. Every balance change is mirrored by exactly one
//! ledger entry, so for every account:
//!
//! `balance == opening_balance + Σ grant + Σ refund − Σ deduct`

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod error;
pub mod ids;
pub mod job;
pub mod ledger;
pub mod payment;
pub mod pricing;
pub mod referral;
pub mod transition;

pub use account::Account;
pub use error::{BillingError, Result};
pub use ids::{AccountId, BatchId, IdError, JobId, LedgerEntryId, PaymentOrderId, ReferralId};
pub use job::{
    split_batch_cost, Billable, EnhancementMode, GenerationJob, ImageGeneration, ImageResolution,
    JobPayload, JobStatus, SkinEnhancement, Upscale, VideoGeneration,
};
pub use ledger::{reconstruct_balance, refund_reason, BalanceAudit, EntryKind, LedgerEntry};
pub use payment::{granted_credits, OrderStatus, PaymentOrder, PaymentProvider};
pub use pricing::{CreditPackage, EnhancementPricing, PricingConfig, MAX_BATCH_SIZE, MIN_BATCH_SIZE};
pub use referral::{ReferralBonus, ReferralEvent, ReferralOutcome, ReferralStats};
pub use transition::Transition;
