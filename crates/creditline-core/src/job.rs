//! Generation jobs for creditline.
//!
//! A job is paid work handed to an external generation provider. Credits are
//! held when the job is created; the job then either completes (credits
//! spent) or fails (credits refunded exactly once). Job payloads are a closed
//! set of typed variants, each pricing and describing itself through
//! [`Billable`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ledger::refund_reason;
use crate::{AccountId, BatchId, BillingError, JobId, PricingConfig, Result, Transition};

/// Upscale factors accepted by the provider.
pub const UPSCALE_FACTORS: [u32; 3] = [2, 4, 8];

// ============================================================================
// Capability
// ============================================================================

/// A unit of work that can be priced and submitted to a provider.
pub trait Billable {
    /// Credit price of this request under `pricing`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the request's parameters are out of range.
    fn credit_cost(&self, pricing: &PricingConfig) -> Result<i64>;

    /// Short human-readable description, used in ledger reasons.
    fn label(&self) -> String;

    /// Request body sent to the generation provider.
    fn provider_request(&self) -> serde_json::Value;
}

fn require_url(field: &str, value: &str) -> Result<()> {
    if value.starts_with("https://") || value.starts_with("http://") {
        Ok(())
    } else {
        Err(BillingError::InvalidRequest(format!(
            "{field} must be an http(s) URL"
        )))
    }
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(BillingError::InvalidRequest(format!("{field} is required")))
    } else {
        Ok(())
    }
}

// ============================================================================
// Skin enhancement
// ============================================================================

/// Retouching style for skin enhancement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementMode {
    /// Light cleanup that keeps skin texture.
    NaturalClean,
    /// Diffused, luminous finish.
    SoftGlow,
    /// Studio lighting and retouch.
    StudioLook,
    /// Removes makeup while keeping realism.
    NoMakeupReal,
}

impl EnhancementMode {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NaturalClean => "natural_clean",
            Self::SoftGlow => "soft_glow",
            Self::StudioLook => "studio_look",
            Self::NoMakeupReal => "no_makeup_real",
        }
    }

    /// Price of this mode, before the pro add-on.
    #[must_use]
    pub const fn price(&self, pricing: &PricingConfig) -> i64 {
        match self {
            Self::NaturalClean => pricing.enhancement.natural_clean,
            Self::SoftGlow => pricing.enhancement.soft_glow,
            Self::StudioLook => pricing.enhancement.studio_look,
            Self::NoMakeupReal => pricing.enhancement.no_makeup_real,
        }
    }
}

/// Retouch a portrait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkinEnhancement {
    /// Source image.
    pub image_url: String,
    /// Retouching style.
    pub mode: EnhancementMode,
    /// Higher-fidelity model, charged as an add-on.
    #[serde(default)]
    pub pro_mode: bool,
}

impl Billable for SkinEnhancement {
    fn credit_cost(&self, pricing: &PricingConfig) -> Result<i64> {
        require_url("image_url", &self.image_url)?;
        let addon = if self.pro_mode {
            pricing.enhancement.pro_addon
        } else {
            0
        };
        Ok(self.mode.price(pricing) + addon)
    }

    fn label(&self) -> String {
        let pro = if self.pro_mode { ", pro" } else { "" };
        format!("skin enhancement ({}{pro})", self.mode.as_str())
    }

    fn provider_request(&self) -> serde_json::Value {
        serde_json::json!({
            "task": "skin_enhancement",
            "image_url": self.image_url,
            "mode": self.mode,
            "pro_mode": self.pro_mode,
        })
    }
}

// ============================================================================
// Image generation
// ============================================================================

/// Output resolution tier for image generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageResolution {
    /// Roughly 1024 px on the long edge.
    #[default]
    #[serde(rename = "1K")]
    OneK,
    /// Roughly 2048 px.
    #[serde(rename = "2K")]
    TwoK,
    /// Roughly 4096 px.
    #[serde(rename = "4K")]
    FourK,
}

impl ImageResolution {
    const fn tier(self) -> usize {
        match self {
            Self::OneK => 0,
            Self::TwoK => 1,
            Self::FourK => 2,
        }
    }
}

/// Generate an image from a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageGeneration {
    /// Text prompt.
    pub prompt: String,
    /// Provider model name.
    pub model: String,
    /// Output resolution.
    #[serde(default)]
    pub resolution: ImageResolution,
}

impl Billable for ImageGeneration {
    fn credit_cost(&self, pricing: &PricingConfig) -> Result<i64> {
        require_text("prompt", &self.prompt)?;
        require_text("model", &self.model)?;
        Ok(pricing.image_base + pricing.image_resolution_surcharge[self.resolution.tier()])
    }

    fn label(&self) -> String {
        format!("image generation ({})", self.model)
    }

    fn provider_request(&self) -> serde_json::Value {
        serde_json::json!({
            "task": "image_generation",
            "prompt": self.prompt,
            "model": self.model,
            "resolution": self.resolution,
        })
    }
}

// ============================================================================
// Video generation
// ============================================================================

/// Generate a short video from a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoGeneration {
    /// Text prompt.
    pub prompt: String,
    /// Provider model name.
    pub model: String,
    /// Clip length in seconds.
    pub duration_seconds: u32,
}

impl Billable for VideoGeneration {
    fn credit_cost(&self, pricing: &PricingConfig) -> Result<i64> {
        require_text("prompt", &self.prompt)?;
        require_text("model", &self.model)?;
        if self.duration_seconds == 0 || self.duration_seconds > pricing.video_max_seconds {
            return Err(BillingError::InvalidRequest(format!(
                "duration_seconds must be between 1 and {}",
                pricing.video_max_seconds
            )));
        }
        Ok(pricing.video_per_second * i64::from(self.duration_seconds))
    }

    fn label(&self) -> String {
        format!("video generation ({}, {}s)", self.model, self.duration_seconds)
    }

    fn provider_request(&self) -> serde_json::Value {
        serde_json::json!({
            "task": "video_generation",
            "prompt": self.prompt,
            "model": self.model,
            "duration": self.duration_seconds,
        })
    }
}

// ============================================================================
// Upscale
// ============================================================================

/// Upscale an existing image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upscale {
    /// Source image.
    pub image_url: String,
    /// Scale factor: 2, 4 or 8.
    pub factor: u32,
}

impl Billable for Upscale {
    fn credit_cost(&self, pricing: &PricingConfig) -> Result<i64> {
        require_url("image_url", &self.image_url)?;
        if !UPSCALE_FACTORS.contains(&self.factor) {
            return Err(BillingError::InvalidRequest(format!(
                "factor must be one of {UPSCALE_FACTORS:?}"
            )));
        }
        let steps = i64::from(self.factor.trailing_zeros());
        Ok(pricing.upscale_per_step * steps)
    }

    fn label(&self) -> String {
        format!("upscale x{}", self.factor)
    }

    fn provider_request(&self) -> serde_json::Value {
        serde_json::json!({
            "task": "upscale",
            "image_url": self.image_url,
            "factor": self.factor,
        })
    }
}

// ============================================================================
// Payload
// ============================================================================

/// The typed request behind a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Portrait retouch.
    SkinEnhancement(SkinEnhancement),
    /// Text to image.
    ImageGeneration(ImageGeneration),
    /// Text to video.
    VideoGeneration(VideoGeneration),
    /// Image upscale.
    Upscale(Upscale),
}

impl JobPayload {
    /// Stable name of the job kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SkinEnhancement(_) => "skin_enhancement",
            Self::ImageGeneration(_) => "image_generation",
            Self::VideoGeneration(_) => "video_generation",
            Self::Upscale(_) => "upscale",
        }
    }

    fn billable(&self) -> &dyn Billable {
        match self {
            Self::SkinEnhancement(p) => p,
            Self::ImageGeneration(p) => p,
            Self::VideoGeneration(p) => p,
            Self::Upscale(p) => p,
        }
    }
}

impl Billable for JobPayload {
    fn credit_cost(&self, pricing: &PricingConfig) -> Result<i64> {
        self.billable().credit_cost(pricing)
    }

    fn label(&self) -> String {
        self.billable().label()
    }

    fn provider_request(&self) -> serde_json::Value {
        self.billable().provider_request()
    }
}

// ============================================================================
// Job
// ============================================================================

/// Lifecycle of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, not yet held.
    Pending,
    /// Credits held, provider working.
    Processing,
    /// Result available. Credits spent.
    Completed,
    /// Provider failed or timed out. Credits refunded.
    Failed,
    /// Stopped by an administrator. No credit movement.
    Cancelled,
}

impl JobStatus {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the status is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A unit of paid work submitted to a generation provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationJob {
    /// Job ID (ULID, time-ordered).
    pub id: JobId,

    /// The paying account.
    pub account_id: AccountId,

    /// Batch this job belongs to, if it was reserved as part of one.
    pub batch_id: Option<BatchId>,

    /// What to generate.
    pub payload: JobPayload,

    /// Credits held for this job (its share, for batch items).
    pub credit_cost: i64,

    /// Current status.
    pub status: JobStatus,

    /// Provider task id for asynchronous results.
    pub external_task_id: Option<String>,

    /// Result reference once completed.
    pub result_url: Option<String>,

    /// Failure reason once failed or cancelled.
    pub error_message: Option<String>,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl GenerationJob {
    /// Create a job whose credits are about to be held.
    #[must_use]
    pub fn new(
        account_id: AccountId,
        payload: JobPayload,
        credit_cost: i64,
        batch_id: Option<BatchId>,
    ) -> Self {
        Self {
            id: JobId::generate(),
            account_id,
            batch_id,
            payload,
            credit_cost,
            status: JobStatus::Processing,
            external_task_id: None,
            result_url: None,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Ledger reason for the credit hold of a single job.
    #[must_use]
    pub fn hold_reason(&self) -> String {
        format!("{} job {}", self.payload.label(), self.id)
    }

    /// Ledger reason for the compensating refund after `error`.
    #[must_use]
    pub fn refund_reason(&self, error: &str) -> String {
        refund_reason(&format!("job {} failed: {error}", self.id))
    }

    /// Check a move to `Completed`.
    #[must_use]
    pub const fn complete_check(&self) -> Transition {
        match self.status {
            JobStatus::Pending | JobStatus::Processing => Transition::Apply,
            JobStatus::Completed => Transition::AlreadyApplied,
            JobStatus::Failed | JobStatus::Cancelled => Transition::Rejected,
        }
    }

    /// Check a move to `Failed`. Only the first move refunds.
    #[must_use]
    pub const fn fail_check(&self) -> Transition {
        match self.status {
            JobStatus::Pending | JobStatus::Processing => Transition::Apply,
            JobStatus::Failed => Transition::AlreadyApplied,
            JobStatus::Completed | JobStatus::Cancelled => Transition::Rejected,
        }
    }

    /// Check a move to `Cancelled`.
    #[must_use]
    pub const fn cancel_check(&self) -> Transition {
        match self.status {
            JobStatus::Pending | JobStatus::Processing => Transition::Apply,
            JobStatus::Cancelled => Transition::AlreadyApplied,
            JobStatus::Completed | JobStatus::Failed => Transition::Rejected,
        }
    }
}

/// Split a batch charge into per-item shares.
///
/// Each item gets `total / items`; the remainder goes to the first item so
/// the shares always sum to `total`.
#[must_use]
pub fn split_batch_cost(total: i64, items: usize) -> Vec<i64> {
    let Ok(n) = i64::try_from(items) else {
        return Vec::new();
    };
    if n == 0 {
        return Vec::new();
    }
    let share = total / n;
    let mut shares = vec![share; items];
    shares[0] += total - share * n;
    shares
}
