//! Job kinds and their typed payload/result schemas.
//!
//! Jobs travel through the queue as raw JSON; this module is the closed set
//! of kinds the server understands and the codec that decodes stored bytes
//! into the current schema (filling defaults and upgrading legacy error
//! shapes on the way, without ever rewriting what is on disk).

pub mod codec;
pub mod types;

use std::fmt;

use crate::error::BrokerError;

/// The closed set of job kinds handled by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Osbuild,
    OsbuildKoji,
    Depsolve,
    KojiInit,
    KojiFinalize,
    ManifestIdOnly,
}

impl JobKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobKind::Osbuild => "osbuild",
            JobKind::OsbuildKoji => "osbuild-koji",
            JobKind::Depsolve => "depsolve",
            JobKind::KojiInit => "koji-init",
            JobKind::KojiFinalize => "koji-finalize",
            JobKind::ManifestIdOnly => "manifest-id-only",
        }
    }

    pub fn from_kind_str(s: &str) -> Result<Self, BrokerError> {
        match s {
            "osbuild" => Ok(JobKind::Osbuild),
            "osbuild-koji" => Ok(JobKind::OsbuildKoji),
            "depsolve" => Ok(JobKind::Depsolve),
            "koji-init" => Ok(JobKind::KojiInit),
            "koji-finalize" => Ok(JobKind::KojiFinalize),
            "manifest-id-only" => Ok(JobKind::ManifestIdOnly),
            _ => Err(BrokerError::UnknownKind(s.to_string())),
        }
    }

    /// Build jobs carry the target architecture in their type string.
    pub fn arch_qualified(&self) -> bool {
        matches!(self, JobKind::Osbuild | JobKind::OsbuildKoji)
    }

    /// Kinds that may only be handed out through a targeted request,
    /// never through open dispatch.
    pub fn targeted_only(&self) -> bool {
        matches!(self, JobKind::ManifestIdOnly)
    }

    /// The full type string stored on a job: `<kind>` or `<kind>:<arch>`.
    pub fn type_string(&self, arch: Option<&str>) -> String {
        match arch {
            Some(arch) if self.arch_qualified() => format!("{}:{}", self.as_str(), arch),
            _ => self.as_str().to_string(),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split a stored type string into its kind and optional architecture.
pub fn split_type(jtype: &str) -> (&str, Option<&str>) {
    match jtype.split_once(':') {
        Some((kind, arch)) => (kind, Some(arch)),
        None => (jtype, None),
    }
}

/// Parse a stored type string into a known kind and optional architecture.
pub fn parse_type(jtype: &str) -> Result<(JobKind, Option<&str>), BrokerError> {
    let (kind, arch) = split_type(jtype);
    Ok((JobKind::from_kind_str(kind)?, arch))
}
