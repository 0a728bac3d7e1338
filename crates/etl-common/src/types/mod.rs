//! Closed enumerations and identifiers shared across the ETL workspace
//!
//! Every wire string the control plane understands (comm modes, runtime
//! identifiers, lifecycle stages, argument types) has exactly one definition
//! here. Adding a variant is a compile-time checked change everywhere it is
//! matched.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ValidationError;

// ============================================================================
// Communication Modes
// ============================================================================

/// Transport pattern used between a storage node and a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CommMode {
    /// Node pushes the object over HTTP and reads the transformed body back.
    #[default]
    #[serde(rename = "hpush")]
    Push,
    /// Pod calls back into the node to fetch the object; the node later pulls
    /// the result.
    #[serde(rename = "hpull")]
    Pull,
    /// One long-lived framed connection per pod, multiplexed by correlation id.
    #[serde(rename = "ws")]
    StreamingSocket,
    /// Framed exchange over the pod's stdin/stdout.
    #[serde(rename = "io")]
    Pipe,
}

impl CommMode {
    /// All modes, in wire order.
    pub const ALL: [CommMode; 4] = [
        CommMode::Push,
        CommMode::Pull,
        CommMode::StreamingSocket,
        CommMode::Pipe,
    ];

    /// Wire/config string for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommMode::Push => "hpush",
            CommMode::Pull => "hpull",
            CommMode::StreamingSocket => "ws",
            CommMode::Pipe => "io",
        }
    }

    /// Comma separated list of accepted wire strings, used in error messages.
    pub fn supported() -> String {
        Self::ALL
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Whether responses on one connection arrive in request order.
    ///
    /// Unordered modes rely on correlation identifiers instead.
    pub fn is_ordered(&self) -> bool {
        matches!(self, CommMode::Push | CommMode::Pipe)
    }
}

impl fmt::Display for CommMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hpush" => Ok(CommMode::Push),
            "hpull" => Ok(CommMode::Pull),
            "ws" => Ok(CommMode::StreamingSocket),
            "io" => Ok(CommMode::Pipe),
            other => Err(ValidationError::UnknownCommMode {
                given: other.to_string(),
                supported: CommMode::supported(),
            }),
        }
    }
}

// ============================================================================
// Runtimes
// ============================================================================

/// Runtime API generation appended to every runtime identifier.
pub const RUNTIME_API_VERSION: u32 = 2;

/// Interpreter versions a pod image can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Runtime {
    Python3_9,
    Python3_10,
    Python3_11,
    Python3_12,
    #[default]
    Python3_13,
}

impl Runtime {
    pub const ALL: [Runtime; 5] = [
        Runtime::Python3_9,
        Runtime::Python3_10,
        Runtime::Python3_11,
        Runtime::Python3_12,
        Runtime::Python3_13,
    ];

    /// Bare interpreter version, e.g. `3.13`.
    pub fn version(&self) -> &'static str {
        match self {
            Runtime::Python3_9 => "3.9",
            Runtime::Python3_10 => "3.10",
            Runtime::Python3_11 => "3.11",
            Runtime::Python3_12 => "3.12",
            Runtime::Python3_13 => "3.13",
        }
    }

    /// Full runtime identifier, e.g. `python3.13v2`.
    pub fn identifier(&self) -> String {
        format!("python{}v{}", self.version(), RUNTIME_API_VERSION)
    }

    /// Supported bare versions in ascending order.
    pub fn supported_versions() -> Vec<String> {
        Self::ALL.iter().map(|r| r.version().to_string()).collect()
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier())
    }
}

impl FromStr for Runtime {
    type Err = ValidationError;

    /// Accepts either the full identifier (`python3.11v2`) or the bare
    /// version (`3.11`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let version = trimmed
            .strip_prefix("python")
            .and_then(|rest| rest.strip_suffix(&format!("v{}", RUNTIME_API_VERSION)))
            .unwrap_or(trimmed);

        Self::ALL
            .iter()
            .copied()
            .find(|r| r.version() == version)
            .ok_or_else(|| ValidationError::UnsupportedRuntime {
                given: s.to_string(),
                supported: Runtime::supported_versions(),
            })
    }
}

impl Serialize for Runtime {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.identifier())
    }
}

impl<'de> Deserialize<'de> for Runtime {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Lifecycle Stages
// ============================================================================

/// Lifecycle stage of a single pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "reason")]
pub enum PodStage {
    Initializing,
    Running,
    Stopped,
    /// Terminal state reached through an unrecoverable error.
    Failed(String),
}

impl PodStage {
    /// Stage string exposed to callers.
    pub fn as_str(&self) -> &'static str {
        match self {
            PodStage::Initializing => "Initializing",
            PodStage::Running => "Running",
            PodStage::Stopped => "Stopped",
            PodStage::Failed(_) => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PodStage::Stopped | PodStage::Failed(_))
    }

    /// Failure reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            PodStage::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Terminal stages have no outgoing edges. `Initializing -> Stopped` is
    /// an explicit stop issued before the readiness probe succeeded.
    pub fn can_transition_to(&self, next: &PodStage) -> bool {
        matches!(
            (self, next),
            (PodStage::Initializing, PodStage::Running)
                | (PodStage::Initializing, PodStage::Stopped)
                | (PodStage::Initializing, PodStage::Failed(_))
                | (PodStage::Running, PodStage::Stopped)
                | (PodStage::Running, PodStage::Failed(_))
        )
    }
}

impl fmt::Display for PodStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodStage::Failed(reason) => write!(f, "Failed: {}", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

// ============================================================================
// Transform Arguments
// ============================================================================

/// What the pod hands to the user transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ArgType {
    /// Raw object bytes.
    #[default]
    #[serde(rename = "")]
    Bytes,
    /// Object URL; the transform fetches the bytes itself (pull mode only).
    #[serde(rename = "url")]
    Url,
}

impl ArgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArgType::Bytes => "",
            ArgType::Url => "url",
        }
    }
}

impl FromStr for ArgType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(ArgType::Bytes),
            "url" => Ok(ArgType::Url),
            other => Err(ValidationError::InvalidArgType {
                given: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of a cluster node hosting pods.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Token pairing an asynchronous request with its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(CorrelationId)
    }
}

/// Monotonic source of correlation ids.
///
/// Ids are never reused for the lifetime of the sequence, so an abandoned
/// transfer can never be confused with a later one.
#[derive(Debug)]
pub struct CorrelationSeq(AtomicU64);

impl CorrelationSeq {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> CorrelationId {
        CorrelationId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CorrelationSeq {
    fn default() -> Self {
        Self::new()
    }
}
