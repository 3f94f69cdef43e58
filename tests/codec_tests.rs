use serde_json::json;

use buildbroker::jobs::codec::{is_success, migrate_args, migrate_result};
use buildbroker::jobs::types::{
    codes, JobError, OsbuildJobResult, OsbuildOutput, PipelineNames,
};
use buildbroker::jobs::{parse_type, split_type, JobKind};

#[test]
fn test_type_strings() {
    assert_eq!(JobKind::Osbuild.type_string(Some("aarch64")), "osbuild:aarch64");
    assert_eq!(JobKind::Depsolve.type_string(Some("aarch64")), "depsolve");
    assert_eq!(JobKind::KojiInit.type_string(None), "koji-init");

    assert_eq!(split_type("osbuild:aarch64"), ("osbuild", Some("aarch64")));
    assert_eq!(split_type("depsolve"), ("depsolve", None));

    let (kind, arch) = parse_type("osbuild-koji:s390x").unwrap();
    assert_eq!(kind, JobKind::OsbuildKoji);
    assert_eq!(arch, Some("s390x"));

    assert!(parse_type("no-such-kind").is_err());
}

#[test]
fn test_pipeline_names_fallback_on_args() {
    let args = json!({"manifest": {"version": "2", "pipelines": {}}});
    let migrated = migrate_args(JobKind::Osbuild, args);
    assert_eq!(migrated["pipeline_names"]["build"], json!(["build"]));
    assert_eq!(migrated["pipeline_names"]["payload"], json!(["os", "assembler"]));

    // Explicit names are never replaced.
    let args = json!({
        "manifest": {},
        "pipeline_names": {"build": ["b"], "payload": ["x", "y", "z"]}
    });
    let migrated = migrate_args(JobKind::OsbuildKoji, args);
    assert_eq!(migrated["pipeline_names"]["build"], json!(["b"]));
    assert_eq!(migrated["pipeline_names"]["payload"], json!(["x", "y", "z"]));

    // Kind-only payloads are left alone.
    let args = json!({"package_sets": {}});
    let migrated = migrate_args(JobKind::Depsolve, args.clone());
    assert_eq!(migrated, args);
}

#[test]
fn test_depsolve_legacy_error_mapping() {
    let cases = [
        ("depsolve", codes::DNF_DEPSOLVE),
        ("rpmmd", codes::RPMMD),
        ("something-else", codes::DNF_OTHER),
    ];

    for (error_type, expected_code) in cases {
        let result = json!({"error": "it broke", "error_type": error_type});
        let migrated = migrate_result(JobKind::Depsolve, result);
        assert_eq!(migrated["job_error"]["code"], expected_code, "{error_type}");
        assert_eq!(migrated["job_error"]["reason"], "it broke");
        // Legacy fields stay in place.
        assert_eq!(migrated["error"], "it broke");
        assert_eq!(migrated["error_type"], error_type);
    }
}

#[test]
fn test_canonical_error_not_overwritten() {
    let result = json!({
        "error": "legacy text",
        "error_type": "depsolve",
        "job_error": {"code": 42, "reason": "already canonical"}
    });
    let migrated = migrate_result(JobKind::Depsolve, result);
    assert_eq!(migrated["job_error"]["code"], 42);
    assert_eq!(migrated["job_error"]["reason"], "already canonical");
}

#[test]
fn test_osbuild_target_errors_upgrade_and_success() {
    let result = json!({"target_errors": ["Upload error"]});
    let migrated = migrate_result(JobKind::Osbuild, result);
    assert_eq!(migrated["job_error"]["code"], codes::TARGET);
    assert_eq!(migrated["job_error"]["reason"], "Upload error");
    assert_eq!(migrated["success"], false);
    assert_eq!(migrated["target_errors"], json!(["Upload error"]));
}

#[test]
fn test_osbuild_success_recomputed_from_output() {
    let ok = json!({
        "success": true,
        "osbuild_output": {"type": "result", "success": true},
    });
    let migrated = migrate_result(JobKind::Osbuild, ok);
    assert_eq!(migrated["success"], true);
    assert!(is_success(JobKind::Osbuild, &migrated));

    // A lying success flag is overridden by the output marker.
    let bad = json!({
        "success": true,
        "osbuild_output": {"type": "result", "success": false},
    });
    let migrated = migrate_result(JobKind::Osbuild, bad);
    assert_eq!(migrated["success"], false);
    assert!(!is_success(JobKind::Osbuild, &migrated));

    // A canonical error fails the result even with a good output.
    let errored = json!({
        "success": true,
        "osbuild_output": {"type": "result", "success": true},
        "job_error": {"code": codes::BUILD_JOB, "reason": "boom"},
    });
    let migrated = migrate_result(JobKind::Osbuild, errored);
    assert_eq!(migrated["success"], false);
}

#[test]
fn test_osbuild_canonical_result_roundtrip() {
    let result = OsbuildJobResult {
        success: true,
        osbuild_output: Some(OsbuildOutput {
            kind: "result".to_string(),
            success: true,
            ..Default::default()
        }),
        target_errors: Vec::new(),
        pipeline_names: Some(PipelineNames {
            build: vec!["build".to_string()],
            payload: vec!["os".to_string()],
        }),
        job_error: None,
    };

    let raw = serde_json::to_value(&result).unwrap();
    let migrated = migrate_result(JobKind::Osbuild, raw);
    let decoded: OsbuildJobResult = serde_json::from_value(migrated).unwrap();
    assert_eq!(decoded, result);
}

#[test]
fn test_osbuild_result_without_pipeline_names_gets_fallback() {
    let raw = json!({
        "success": true,
        "osbuild_output": {"type": "result", "success": true},
    });
    let migrated = migrate_result(JobKind::Osbuild, raw);
    let decoded: OsbuildJobResult = serde_json::from_value(migrated).unwrap();
    assert_eq!(decoded.pipeline_names, Some(PipelineNames::fallback()));
    assert!(decoded.success);
}

#[test]
fn test_koji_legacy_errors() {
    let migrated = migrate_result(JobKind::OsbuildKoji, json!({"koji_error": "koji build error"}));
    assert_eq!(migrated["job_error"]["code"], codes::KOJI_BUILD);
    assert_eq!(migrated["job_error"]["reason"], "koji build error");
    assert_eq!(migrated["koji_error"], "koji build error");

    let migrated = migrate_result(JobKind::KojiInit, json!({"koji_error": "no session"}));
    assert_eq!(migrated["job_error"]["code"], codes::KOJI_INIT);

    let migrated = migrate_result(JobKind::ManifestIdOnly, json!({"error": "bad request"}));
    assert_eq!(migrated["job_error"]["code"], codes::MANIFEST_GENERATION);

    // koji-finalize has no legacy shape.
    let raw = json!({"job_error": null});
    let migrated = migrate_result(JobKind::KojiFinalize, raw.clone());
    assert_eq!(migrated, raw);
}

#[test]
fn test_is_success_per_kind() {
    assert!(is_success(JobKind::Depsolve, &json!({"package_specs": {}})));
    assert!(!is_success(JobKind::Depsolve, &json!({"error": "x", "error_type": "depsolve"})));

    assert!(is_success(JobKind::KojiFinalize, &json!({})));
    assert!(!is_success(
        JobKind::KojiFinalize,
        &json!({"job_error": {"code": codes::KOJI_FINALIZE, "reason": "nope"}})
    ));

    // Jobs finished without a body count as successful.
    assert!(is_success(JobKind::KojiInit, &serde_json::Value::Null));

    assert!(!is_success(JobKind::OsbuildKoji, &json!({})));
    assert!(is_success(
        JobKind::OsbuildKoji,
        &json!({"osbuild_output": {"success": true}})
    ));
}

#[test]
fn test_job_error_shape() {
    let err = JobError::new(codes::DNF_DEPSOLVE, "DNF depsolve error");
    let raw = serde_json::to_value(&err).unwrap();
    assert_eq!(raw, json!({"code": 5, "reason": "DNF depsolve error"}));
    let decoded: JobError = serde_json::from_value(raw).unwrap();
    assert_eq!(decoded, err);
}
