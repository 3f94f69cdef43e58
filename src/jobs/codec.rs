//! On-read migration of stored payloads and results.
//!
//! Stored bytes are never rewritten. Whenever a payload or result is read
//! back through a typed edge, it passes through here first:
//!
//! - build payloads and results that predate pipeline names get the fixed
//!   fallback names,
//! - results carrying only a legacy error shape get a canonical `job_error`
//!   synthesized next to it (the legacy fields stay untouched),
//! - the osbuild `success` flag is recomputed from the output marker and
//!   the absence of errors.

use serde_json::{json, Value};

use super::types::{codes, JobError, PipelineNames};
use super::JobKind;

/// Migrate a stored payload to the current schema.
pub fn migrate_args(kind: JobKind, mut args: Value) -> Value {
    if let Some(obj) = args.as_object_mut() {
        if matches!(kind, JobKind::Osbuild | JobKind::OsbuildKoji) {
            ensure_pipeline_names(obj);
        }
    }
    args
}

/// Migrate a stored result to the current schema.
pub fn migrate_result(kind: JobKind, mut result: Value) -> Value {
    if let Some(obj) = result.as_object_mut() {
        migrate_result_object(kind, obj);
    }
    result
}

fn migrate_result_object(kind: JobKind, obj: &mut serde_json::Map<String, Value>) {
    match kind {
        JobKind::Osbuild => {
            ensure_pipeline_names(obj);
            if !has_job_error(obj) {
                if let Some(reason) = first_target_error(obj) {
                    set_job_error(obj, codes::TARGET, reason);
                }
            }
            let success = output_marker(obj).unwrap_or_else(|| stored_success(obj))
                && !has_job_error(obj)
                && first_target_error(obj).is_none();
            obj.insert("success".to_string(), Value::Bool(success));
        }
        JobKind::OsbuildKoji => {
            ensure_pipeline_names(obj);
            if !has_job_error(obj) {
                if let Some(reason) = legacy_string(obj, "koji_error") {
                    set_job_error(obj, codes::KOJI_BUILD, reason);
                }
            }
        }
        JobKind::Depsolve => {
            if !has_job_error(obj) {
                if let Some(reason) = legacy_string(obj, "error") {
                    let code = match obj.get("error_type").and_then(Value::as_str) {
                        Some(super::types::DEPSOLVE_ERROR_TYPE) => codes::DNF_DEPSOLVE,
                        Some(super::types::RPMMD_ERROR_TYPE) => codes::RPMMD,
                        _ => codes::DNF_OTHER,
                    };
                    set_job_error(obj, code, reason);
                }
            }
        }
        JobKind::KojiInit => {
            if !has_job_error(obj) {
                if let Some(reason) = legacy_string(obj, "koji_error") {
                    set_job_error(obj, codes::KOJI_INIT, reason);
                }
            }
        }
        JobKind::ManifestIdOnly => {
            if !has_job_error(obj) {
                if let Some(reason) = legacy_string(obj, "error") {
                    set_job_error(obj, codes::MANIFEST_GENERATION, reason);
                }
            }
        }
        JobKind::KojiFinalize => {}
    }
}

/// Whether a migrated result represents a successful run: the kind-specific
/// output marker is true where one exists, and no error of either shape is
/// present.
pub fn is_success(kind: JobKind, result: &Value) -> bool {
    let Some(obj) = result.as_object() else {
        // Jobs without a result body (e.g. koji-init placeholders) count as
        // successful; an error would have produced a body.
        return result.is_null();
    };

    if has_job_error(obj) {
        return false;
    }

    match kind {
        JobKind::Osbuild => {
            output_marker(obj).unwrap_or_else(|| stored_success(obj))
                && first_target_error(obj).is_none()
        }
        JobKind::OsbuildKoji => {
            output_marker(obj).unwrap_or(false) && legacy_string(obj, "koji_error").is_none()
        }
        JobKind::Depsolve => legacy_string(obj, "error").is_none(),
        JobKind::KojiInit => legacy_string(obj, "koji_error").is_none(),
        JobKind::ManifestIdOnly => legacy_string(obj, "error").is_none(),
        JobKind::KojiFinalize => true,
    }
}

fn ensure_pipeline_names(obj: &mut serde_json::Map<String, Value>) {
    let missing = match obj.get("pipeline_names") {
        None | Some(Value::Null) => true,
        Some(_) => false,
    };
    if missing {
        let fallback = PipelineNames::fallback();
        obj.insert(
            "pipeline_names".to_string(),
            json!({ "build": fallback.build, "payload": fallback.payload }),
        );
    }
}

fn has_job_error(obj: &serde_json::Map<String, Value>) -> bool {
    matches!(obj.get("job_error"), Some(v) if !v.is_null())
}

fn set_job_error(obj: &mut serde_json::Map<String, Value>, code: u32, reason: String) {
    let err = JobError::new(code, reason);
    obj.insert(
        "job_error".to_string(),
        serde_json::to_value(err).unwrap_or(Value::Null),
    );
}

fn legacy_string(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key).and_then(Value::as_str) {
        Some("") | None => None,
        Some(s) => Some(s.to_string()),
    }
}

fn first_target_error(obj: &serde_json::Map<String, Value>) -> Option<String> {
    obj.get("target_errors")
        .and_then(Value::as_array)
        .and_then(|errors| errors.first())
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn output_marker(obj: &serde_json::Map<String, Value>) -> Option<bool> {
    obj.get("osbuild_output")
        .filter(|v| !v.is_null())
        .map(|out| {
            out.get("success")
                .and_then(Value::as_bool)
                .unwrap_or(false)
        })
}

fn stored_success(obj: &serde_json::Map<String, Value>) -> bool {
    obj.get("success").and_then(Value::as_bool).unwrap_or(false)
}
