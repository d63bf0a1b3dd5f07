//! Error types for creditline.

use crate::ids::IdError;

/// Result type for creditline operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Errors that can occur in creditline operations.
///
/// `InsufficientCredits`, `AlreadyReferred` and `SelfReferral` are expected
/// outcomes of user requests. They never indicate that state was changed.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Insufficient credits for the operation.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Current balance in credits.
        balance: i64,
        /// Required amount in credits.
        required: i64,
    },

    /// Account not found.
    #[error("account not found: {account_id}")]
    AccountNotFound {
        /// The account ID that was not found.
        account_id: String,
    },

    /// Payment order not found.
    #[error("payment order not found: {order_id}")]
    OrderNotFound {
        /// The order ID (internal or provider-assigned) that was not found.
        order_id: String,
    },

    /// Generation job not found.
    #[error("job not found: {job_id}")]
    JobNotFound {
        /// The job ID that was not found.
        job_id: String,
    },

    /// The account has already redeemed a referral code.
    #[error("account has already been referred")]
    AlreadyReferred,

    /// The referral code belongs to the redeeming account.
    #[error("cannot redeem your own referral code")]
    SelfReferral,

    /// The referral code does not resolve to an account.
    #[error("invalid referral code: {code}")]
    InvalidReferralCode {
        /// The code as submitted.
        code: String,
    },

    /// The referral system is switched off.
    #[error("referral system is disabled")]
    ReferralDisabled,

    /// A payment notification failed authentication.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// The generation provider reported an error or timed out.
    #[error("provider failure: {0}")]
    ProviderFailure(String),

    /// A status transition out of a terminal state was attempted.
    #[error("invalid transition: {entity} {id} is {from}, cannot become {to}")]
    InvalidTransition {
        /// Kind of entity (`order`, `job`).
        entity: &'static str,
        /// Entity identifier.
        id: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Invalid amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Invalid job request (unknown mode, batch size out of range, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}
