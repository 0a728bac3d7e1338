//! ETL spec validation
//!
//! [`RawEtlSpec`] is what a control request carries. [`EtlSpec::validate`]
//! turns it into an immutable [`EtlSpec`] or rejects it before any pod exists.
//! Validation is pure: equal raw input yields equal specs.

use etl_common::checksum::FieldHasher;
use etl_common::duration::{format_duration, parse_duration};
use etl_common::error::{EtlError, ValidationError};
use etl_common::types::{ArgType, CommMode, Runtime};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::Duration;

use super::packager::{encode_dependencies, CodeArtifact, Packager};

/// Default bound for pod startup.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default bound for one transfer, capped at the startup bound.
pub const DEFAULT_OBJ_TIMEOUT: Duration = Duration::from_secs(45);

pub const NAME_MIN_LEN: usize = 6;
pub const NAME_MAX_LEN: usize = 32;

/// Unvalidated spec as received from a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawEtlSpec {
    pub name: String,
    /// Runtime identifier, e.g. `python3.13v2` or `3.13`
    pub runtime: Option<String>,
    /// One of `hpush`, `hpull`, `ws`, `io`
    #[serde(alias = "communication_type")]
    pub communication: Option<String>,
    #[serde(alias = "init_timeout")]
    pub timeout: Option<String>,
    pub obj_timeout: Option<String>,
    pub dependencies: Vec<String>,
    pub preimported_modules: Vec<String>,
    /// Base64 of the serialized callable
    pub code: Option<String>,
    pub suffix: Option<String>,
    pub arg_type: Option<String>,
    pub chunk_size: Option<u64>,
    /// Launch command overriding the runtime's default launcher
    pub runtime_spec: Option<RuntimeSpec>,
}

/// How to start a pod's process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl RuntimeSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

impl RawEtlSpec {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: Some(code.into()),
            ..Default::default()
        }
    }

    pub fn with_comm(mut self, comm: impl Into<String>) -> Self {
        self.communication = Some(comm.into());
        self
    }

    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }
}

/// Validated, immutable description of one transform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EtlSpec {
    name: String,
    communication: CommMode,
    runtime: Runtime,
    #[serde(serialize_with = "as_duration_str")]
    timeout: Duration,
    #[serde(serialize_with = "as_duration_str")]
    obj_timeout: Duration,
    #[serde(skip)]
    artifact: CodeArtifact,
    modules: Vec<String>,
    dependencies: Vec<String>,
    arg_type: ArgType,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    runtime_spec: Option<RuntimeSpec>,
}

impl EtlSpec {
    /// Validate a raw spec and package its code.
    #[tracing::instrument(skip(raw), fields(etl = %raw.name))]
    pub fn validate(raw: &RawEtlSpec) -> Result<Self, EtlError> {
        validate_name(&raw.name)?;

        let communication = match raw.communication.as_deref() {
            None | Some("") => CommMode::default(),
            Some(s) => s.parse()?,
        };

        let runtime = match raw.runtime.as_deref() {
            None | Some("") => Runtime::default(),
            Some(s) => s.parse()?,
        };

        let timeout = match raw.timeout.as_deref() {
            None | Some("") => DEFAULT_TIMEOUT,
            Some(s) => parse_positive("timeout", s)?,
        };

        let obj_timeout = match raw.obj_timeout.as_deref() {
            None | Some("") => DEFAULT_OBJ_TIMEOUT.min(timeout),
            Some(s) => parse_positive("obj_timeout", s)?,
        };
        if obj_timeout > timeout {
            return Err(ValidationError::InvalidTimeout {
                field: "obj_timeout",
                value: format_duration(obj_timeout),
                reason: format!("must not exceed timeout ({})", format_duration(timeout)),
            }
            .into());
        }

        let arg_type: ArgType = raw.arg_type.as_deref().unwrap_or("").parse()?;
        if arg_type == ArgType::Url && communication != CommMode::Pull {
            return Err(ValidationError::Incompatible(format!(
                "argument type 'url' requires communication type '{}', got '{}'",
                CommMode::Pull,
                communication
            ))
            .into());
        }

        if raw.chunk_size == Some(0) {
            return Err(ValidationError::Incompatible("chunk_size must be greater than 0".into()).into());
        }

        if raw
            .runtime_spec
            .as_ref()
            .is_some_and(|r| r.command.trim().is_empty())
        {
            return Err(ValidationError::MissingField("runtime_spec.command").into());
        }

        let code = raw.code.as_deref().ok_or(ValidationError::MissingField("code"))?;
        let artifact = Packager::new(runtime).package_for(
            communication,
            code,
            &raw.preimported_modules,
            raw.suffix.as_deref(),
        )?;

        Ok(Self {
            name: raw.name.clone(),
            communication,
            runtime,
            timeout,
            obj_timeout,
            modules: artifact.modules().to_vec(),
            artifact,
            dependencies: raw.dependencies.clone(),
            arg_type,
            chunk_size: raw.chunk_size,
            runtime_spec: raw.runtime_spec.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn comm(&self) -> CommMode {
        self.communication
    }

    pub fn runtime(&self) -> Runtime {
        self.runtime
    }

    /// Bound for pod startup.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn obj_timeout(&self) -> Duration {
        self.obj_timeout
    }

    /// Effective bound for one object transfer.
    pub fn call_timeout(&self) -> Duration {
        self.obj_timeout
    }

    pub fn artifact(&self) -> &CodeArtifact {
        &self.artifact
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn encoded_dependencies(&self) -> String {
        encode_dependencies(&self.dependencies)
    }

    pub fn arg_type(&self) -> ArgType {
        self.arg_type
    }

    pub fn chunk_size(&self) -> Option<u64> {
        self.chunk_size
    }

    pub fn runtime_spec(&self) -> Option<&RuntimeSpec> {
        self.runtime_spec.as_ref()
    }

    /// Content digest; two specs with equal digests are interchangeable.
    pub fn digest(&self) -> String {
        let mut hasher = FieldHasher::new()
            .field("name", &self.name)
            .field("comm", self.communication.as_str())
            .field("runtime", self.runtime.identifier())
            .field("timeout", self.timeout.as_millis().to_le_bytes())
            .field("obj_timeout", self.obj_timeout.as_millis().to_le_bytes())
            .field("code", self.artifact.encoded())
            .field("dependencies", self.encoded_dependencies())
            .field("arg_type", self.arg_type.as_str())
            .field("chunk_size", self.chunk_size.unwrap_or(0).to_le_bytes());
        if let Some(launch) = &self.runtime_spec {
            hasher = hasher.field("command", &launch.command);
            for arg in &launch.args {
                hasher = hasher.field("arg", arg);
            }
            for (key, value) in &launch.env {
                hasher = hasher.field("env", format!("{key}={value}"));
            }
        }
        hasher.finish()
    }
}

/// ETL names are DNS-label-like: lowercase alphanumerics and inner hyphens.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(ValidationError::MissingField("name"));
    }
    if name.len() < NAME_MIN_LEN || name.len() > NAME_MAX_LEN {
        return Err(invalid(&format!(
            "must be between {} and {} characters long",
            NAME_MIN_LEN, NAME_MAX_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid(
            "can only contain lowercase letters, numbers, and hyphens",
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid("cannot start or end with a hyphen"));
    }
    Ok(())
}

fn parse_positive(field: &'static str, value: &str) -> Result<Duration, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidTimeout {
        field,
        value: value.to_string(),
        reason,
    };
    let duration = parse_duration(value).map_err(invalid)?;
    if duration.is_zero() {
        return Err(invalid("must be positive".to_string()));
    }
    Ok(duration)
}

fn as_duration_str<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_duration(*d))
}
