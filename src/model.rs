//! Core data model.
//!
//! An image is a unit under review. Each image has one review (two when
//! QC-flagged), and each image belongs to a device whose final verdict is
//! derived from the reviews of all its images.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Row id of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageId(pub i64);

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Row id of a review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReviewId(pub i64);

impl std::fmt::Display for ReviewId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier stamped onto every review row of one leasing episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight characters, for status lines.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for LeaseId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(LeaseId)
            .map_err(|e| Error::InvalidArgument(format!("lease id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

/// A content-addressed image registered for review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub path: String,
    pub device_id: String,
    /// Short code distinguishing co-located captures, e.g. "000" or "001".
    pub variant: String,
    pub content_digest: String,
    /// QC images get two independent reviews.
    pub qc_flag: bool,
    pub registered_at: DateTime<Utc>,
}

/// Registration request for one image. Hashing happens upstream.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub(crate) path: String,
    pub(crate) device_id: String,
    pub(crate) variant: String,
    pub(crate) content_digest: String,
    pub(crate) qc_flag: bool,
}

impl NewImage {
    pub fn new(
        path: impl Into<String>,
        device_id: impl Into<String>,
        variant: impl Into<String>,
        content_digest: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            device_id: device_id.into(),
            variant: variant.into(),
            content_digest: content_digest.into(),
            qc_flag: false,
        }
    }

    pub fn qc(mut self, qc_flag: bool) -> Self {
        self.qc_flag = qc_flag;
        self
    }
}

// ---------------------------------------------------------------------------
// Review
// ---------------------------------------------------------------------------

/// Lifecycle status of a review row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// In the pool, leasable.
    Unassigned,
    /// Leased to a worker under a lease id.
    InProgress,
    /// Terminal. Carries a result label.
    Done,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewStatus::Unassigned => "unassigned",
            ReviewStatus::InProgress => "in_progress",
            ReviewStatus::Done => "done",
        }
    }
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReviewStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unassigned" => Ok(ReviewStatus::Unassigned),
            "in_progress" => Ok(ReviewStatus::InProgress),
            "done" => Ok(ReviewStatus::Done),
            _ => Err(Error::Other(format!("unknown review status: {s}"))),
        }
    }
}

/// One required inspection of one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub id: ReviewId,
    pub image_id: ImageId,
    pub status: ReviewStatus,
    pub assigned_to: Option<String>,
    pub lease_id: Option<LeaseId>,
    pub result: Option<ResultLabel>,
    pub standard_version: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// What the front-end receives for each leased review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeasedItem {
    pub review_id: ReviewId,
    pub image_id: ImageId,
    pub path: String,
    pub device_id: String,
    pub qc_flag: bool,
}

// ---------------------------------------------------------------------------
// Result labels
// ---------------------------------------------------------------------------

/// A decision label as stored on a review. Open set: worker labels come
/// from configuration, synthetic codes come from the rule engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultLabel(String);

impl ResultLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The synthetic code this label spells, if any.
    pub fn synthetic(&self) -> Option<SyntheticCode> {
        SyntheticCode::ALL
            .into_iter()
            .find(|code| code.as_str() == self.0)
    }
}

impl std::fmt::Display for ResultLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResultLabel {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<SyntheticCode> for ResultLabel {
    fn from(code: SyntheticCode) -> Self {
        Self(code.as_str().to_string())
    }
}

/// Result codes written by the rule engine, never by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyntheticCode {
    /// Remaining work closed because another image of the device was a yes.
    AutoSkipDeviceYes,
    /// Remaining work closed by the no, skip, skip pattern.
    RepeatedSkipPattern,
}

impl SyntheticCode {
    pub const ALL: [SyntheticCode; 2] = [
        SyntheticCode::AutoSkipDeviceYes,
        SyntheticCode::RepeatedSkipPattern,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SyntheticCode::AutoSkipDeviceYes => "auto_skip_device_yes",
            SyntheticCode::RepeatedSkipPattern => "repeated_skip_pattern",
        }
    }
}

impl std::fmt::Display for SyntheticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// Final verdict of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceVerdict {
    Yes,
    No,
    /// Pool exhausted without either rule firing.
    Unknown,
}

impl DeviceVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceVerdict::Yes => "yes",
            DeviceVerdict::No => "no",
            DeviceVerdict::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DeviceVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeviceVerdict {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "yes" => Ok(DeviceVerdict::Yes),
            "no" => Ok(DeviceVerdict::No),
            "unknown" => Ok(DeviceVerdict::Unknown),
            _ => Err(Error::Other(format!("unknown device verdict: {s}"))),
        }
    }
}

/// The physical unit the images describe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    /// `None` while the device is open.
    pub final_result: Option<DeviceVerdict>,
    /// Triggering image id or rule name.
    pub decision_source: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl Device {
    pub fn is_closed(&self) -> bool {
        self.final_result.is_some()
    }
}

// ---------------------------------------------------------------------------
// Annotation
// ---------------------------------------------------------------------------

/// Which mouse control produced an annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
}

impl MouseButton {
    pub fn as_str(self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
        }
    }
}

impl std::fmt::Display for MouseButton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MouseButton {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "left" => Ok(MouseButton::Left),
            "right" => Ok(MouseButton::Right),
            _ => Err(Error::InvalidArgument(format!("unknown mouse button: {s}"))),
        }
    }
}

/// A click tied to one review, in normalized original-image coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub id: i64,
    pub review_id: ReviewId,
    pub x_norm: f64,
    pub y_norm: f64,
    pub button: MouseButton,
    pub created_at: DateTime<Utc>,
}
