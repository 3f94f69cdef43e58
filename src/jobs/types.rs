//! Per-kind payload and result schemas.
//!
//! Field names match the wire format produced by older deployments, so
//! results written years ago still decode. New optional fields always get a
//! serde default; the heavier cross-version work (pipeline-name fallbacks,
//! legacy error upgrades) lives in [`super::codec`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Names of the osbuild pipelines that produce the build environment and
/// the image payload. Results reference these to locate log sections and
/// package metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineNames {
    #[serde(default)]
    pub build: Vec<String>,
    #[serde(default)]
    pub payload: Vec<String>,
}

impl PipelineNames {
    /// Fallback used when decoding payloads or results that predate
    /// pipeline names being recorded.
    pub fn fallback() -> Self {
        Self {
            build: vec!["build".to_string()],
            payload: vec!["os".to_string(), "assembler".to_string()],
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &str> {
        self.build
            .iter()
            .chain(self.payload.iter())
            .map(String::as_str)
    }
}

/// Canonical structured job error carried inside results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub code: u32,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl JobError {
    pub fn new(code: u32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            details: None,
        }
    }
}

/// Numeric codes for [`JobError`]. The values are part of the stored result
/// format and must never be renumbered.
pub mod codes {
    pub const DNF_DEPSOLVE: u32 = 5;
    pub const DNF_OTHER: u32 = 7;
    pub const RPMMD: u32 = 8;
    pub const MANIFEST_GENERATION: u32 = 10;
    pub const BUILD_JOB: u32 = 12;
    pub const TARGET: u32 = 13;
    pub const KOJI_FAILED_DEPENDENCY: u32 = 15;
    pub const KOJI_BUILD: u32 = 16;
    pub const KOJI_INIT: u32 = 17;
    pub const KOJI_FINALIZE: u32 = 18;
}

/// Summary of an osbuild run as reported by the worker.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OsbuildOutput {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub log: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OsbuildJob {
    pub manifest: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_names: Option<PipelineNames>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OsbuildJobResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osbuild_output: Option<OsbuildOutput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_names: Option<PipelineNames>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<JobError>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DepsolveJob {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub package_sets: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module_platform_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub releasever: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arch: String,
}

/// Legacy error type tags for depsolve results.
pub const DEPSOLVE_ERROR_TYPE: &str = "depsolve";
pub const RPMMD_ERROR_TYPE: &str = "rpmmd";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DepsolveJobResult {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub package_specs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<JobError>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KojiInitJob {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub release: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KojiInitJobResult {
    #[serde(default)]
    pub build_id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub koji_error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<JobError>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OsbuildKojiJob {
    pub manifest: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub koji_server: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub koji_directory: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub koji_filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_names: Option<PipelineNames>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OsbuildKojiJobResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_os: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub osbuild_output: Option<OsbuildOutput>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_hash: String,
    #[serde(default)]
    pub image_size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub koji_error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_names: Option<PipelineNames>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<JobError>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KojiFinalizeJob {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub release: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub koji_filenames: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub koji_directory: String,
    #[serde(default)]
    pub task_id: u64,
    #[serde(default)]
    pub start_time: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KojiFinalizeJobResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<JobError>,
}

/// Payload of a manifest-id-only job. The depsolved package specs arrive as
/// the first dependency result at dispatch time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ManifestJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ManifestJobResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_error: Option<JobError>,
}
