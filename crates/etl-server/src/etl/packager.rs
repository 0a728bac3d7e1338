//! Code packager
//!
//! Turns a serialized user callable plus the modules it needs into a
//! [`CodeArtifact`]: an import list, the callable as base64 text and an optional
//! inline suffix. The artifact is rendered into one loadable source unit that
//! the pod runtime executes; nothing here ever runs user code.
//!
//! # Wire format
//!
//! The rendered unit is fixed by the runtime API version:
//!
//! ```text
//! import pickle / base64 / importlib
//! for mod in ['m1', 'm2']: importlib.import_module(mod)
//! transform = pickle.loads(base64.b64decode('<payload>'))
//! <suffix>
//! ```
//!
//! The `code` field sent to pods is base64 of that text.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use etl_common::error::PackagingError;
use etl_common::types::{CommMode, Runtime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Suffix used in `io` mode when none is given: the pod drives stdin/stdout.
pub const DEFAULT_IO_SUFFIX: &str = "transform()";

/// Serializer pin appended to every dependency list.
pub const CLOUDPICKLE_REQUIREMENT: &str = "cloudpickle>=3.0.0";

const TEMPLATE_HEAD: &str = "\nimport pickle\nimport base64\nimport importlib\n\nfor mod in ";
const TEMPLATE_IMPORT: &str = ":\n    importlib.import_module(mod)\n    \ntransform = pickle.loads(base64.b64decode('";
const TEMPLATE_BODY_END: &str = "'))\n";

#[allow(clippy::expect_used)]
static MODULE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
        .expect("module name pattern is valid")
});

/// Packaged transform code, ready to be shipped to a pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeArtifact {
    modules: Vec<String>,
    payload: String,
    suffix: Option<String>,
}

impl CodeArtifact {
    /// Modules imported before the callable is deserialized, in order.
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    /// Base64 text of the serialized callable.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    /// Render the loadable source unit.
    pub fn render(&self) -> String {
        let modules = self
            .modules
            .iter()
            .map(|m| format!("'{}'", m))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "{}[{}]{}{}{}{}\n",
            TEMPLATE_HEAD,
            modules,
            TEMPLATE_IMPORT,
            self.payload,
            TEMPLATE_BODY_END,
            self.suffix.as_deref().unwrap_or("")
        )
    }

    /// Value of the `code` field handed to pods.
    pub fn encoded(&self) -> String {
        STANDARD.encode(self.render())
    }

    /// Recover an artifact from its `code` field.
    ///
    /// This is what a pod runtime does before importing anything: it checks
    /// the envelope and extracts the three parts without executing them.
    pub fn decode(code: &str) -> Result<Self, PackagingError> {
        let raw = STANDARD
            .decode(code.trim())
            .map_err(|e| PackagingError::UndecodablePayload(e.to_string()))?;
        let text =
            String::from_utf8(raw).map_err(|e| PackagingError::UndecodablePayload(e.to_string()))?;

        let malformed = || PackagingError::UndecodablePayload("unrecognized code envelope".into());

        let rest = text.strip_prefix(TEMPLATE_HEAD).ok_or_else(malformed)?;
        let (list, rest) = rest.split_once(TEMPLATE_IMPORT).ok_or_else(malformed)?;
        let (payload, rest) = rest.split_once(TEMPLATE_BODY_END).ok_or_else(malformed)?;
        let suffix = rest.strip_suffix('\n').ok_or_else(malformed)?;

        let list = list
            .strip_prefix('[')
            .and_then(|l| l.strip_suffix(']'))
            .ok_or_else(malformed)?;
        let modules = list
            .split(", ")
            .filter(|m| !m.is_empty())
            .map(|m| {
                m.strip_prefix('\'')
                    .and_then(|m| m.strip_suffix('\''))
                    .map(str::to_string)
                    .ok_or_else(malformed)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Packager::new(Runtime::default()).package(
            payload,
            &modules,
            (!suffix.is_empty()).then_some(suffix),
        )
    }
}

/// Validates user code for one runtime and produces artifacts.
#[derive(Debug, Clone, Copy)]
pub struct Packager {
    runtime: Runtime,
}

impl Packager {
    pub fn new(runtime: Runtime) -> Self {
        Self { runtime }
    }

    /// Packager for a runtime given as a string (`python3.12v2` or `3.12`).
    pub fn for_runtime(runtime: &str) -> Result<Self, PackagingError> {
        runtime
            .parse::<Runtime>()
            .map(Self::new)
            .map_err(|_| PackagingError::UnsupportedRuntime {
                given: runtime.to_string(),
                supported: Runtime::supported_versions(),
            })
    }

    pub fn runtime(&self) -> Runtime {
        self.runtime
    }

    /// Package an already base64-encoded callable.
    pub fn package(
        &self,
        callable_b64: &str,
        modules: &[String],
        suffix: Option<&str>,
    ) -> Result<CodeArtifact, PackagingError> {
        let payload = callable_b64.trim();
        if payload.is_empty() {
            return Err(PackagingError::EmptyPayload);
        }
        let decoded = STANDARD
            .decode(payload)
            .map_err(|e| PackagingError::UndecodablePayload(e.to_string()))?;
        if decoded.is_empty() {
            return Err(PackagingError::EmptyPayload);
        }

        if let Some(bad) = modules.iter().find(|m| !MODULE_NAME.is_match(m)) {
            return Err(PackagingError::InvalidModuleName(bad.clone()));
        }

        Ok(CodeArtifact {
            modules: modules.to_vec(),
            payload: payload.to_string(),
            suffix: suffix.map(str::to_string),
        })
    }

    /// Package raw serialized callable bytes.
    pub fn package_bytes(
        &self,
        callable: &[u8],
        modules: &[String],
        suffix: Option<&str>,
    ) -> Result<CodeArtifact, PackagingError> {
        self.package(&STANDARD.encode(callable), modules, suffix)
    }

    /// Package for a given comm mode, filling in the `io` default suffix.
    pub fn package_for(
        &self,
        comm: CommMode,
        callable_b64: &str,
        modules: &[String],
        suffix: Option<&str>,
    ) -> Result<CodeArtifact, PackagingError> {
        let suffix = match (comm, suffix) {
            (CommMode::Pipe, None) => Some(DEFAULT_IO_SUFFIX),
            (_, s) => s,
        };
        self.package(callable_b64, modules, suffix)
    }
}

/// Encode the pod's package list: newline separated, serializer pin last.
pub fn encode_dependencies(dependencies: &[String]) -> String {
    let mut lines: Vec<&str> = dependencies.iter().map(String::as_str).collect();
    lines.push(CLOUDPICKLE_REQUIREMENT);
    STANDARD.encode(lines.join("\n"))
}
