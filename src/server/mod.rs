//! Worker-facing server: typed enqueue API for the control plane, dispatch
//! and finish for workers, and the HTTP surface in [`api`].

pub mod api;

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{BrokerError, Result};
use crate::jobqueue::{Dispatch, FsJobQueue, JobState};
use crate::jobs::types::{
    DepsolveJob, KojiFinalizeJob, KojiInitJob, ManifestJob, OsbuildJob, OsbuildKojiJob,
};
use crate::jobs::{codec, parse_type, JobKind};

/// Everything a status reader needs about one job: queue metadata plus the
/// migrated result (present once Finished).
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub jtype: String,
    pub state: JobState,
    pub canceled: bool,
    pub dependencies: Vec<Uuid>,
    pub result: Option<Value>,
}

pub struct Server {
    queue: FsJobQueue,
    config: ServerConfig,
}

impl Server {
    pub fn new(queue: FsJobQueue, config: ServerConfig) -> Arc<Self> {
        Arc::new(Self { queue, config })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The axum router serving the worker API under the configured base path.
    pub fn router(self: &Arc<Self>) -> axum::Router {
        api::router(self.clone())
    }

    pub fn enqueue_osbuild(&self, arch: &str, job: &OsbuildJob) -> Result<Uuid> {
        self.enqueue(JobKind::Osbuild, Some(arch), job, &[])
    }

    pub fn enqueue_depsolve(&self, job: &DepsolveJob) -> Result<Uuid> {
        self.enqueue(JobKind::Depsolve, None, job, &[])
    }

    pub fn enqueue_koji_init(&self, job: &KojiInitJob) -> Result<Uuid> {
        self.enqueue(JobKind::KojiInit, None, job, &[])
    }

    /// Enqueue a koji build; it depends on the koji-init job that opened the
    /// draft build.
    pub fn enqueue_osbuild_koji(
        &self,
        arch: &str,
        job: &OsbuildKojiJob,
        init_id: Uuid,
    ) -> Result<Uuid> {
        self.enqueue(JobKind::OsbuildKoji, Some(arch), job, &[init_id])
    }

    /// Enqueue the import step; it depends on the init job and every build
    /// whose image it imports, in that order.
    pub fn enqueue_koji_finalize(
        &self,
        job: &KojiFinalizeJob,
        init_id: Uuid,
        build_ids: &[Uuid],
    ) -> Result<Uuid> {
        let mut dependencies = Vec::with_capacity(build_ids.len() + 1);
        dependencies.push(init_id);
        dependencies.extend_from_slice(build_ids);
        self.enqueue(JobKind::KojiFinalize, None, job, &dependencies)
    }

    /// Enqueue a manifest-id-only job gated on a depsolve. The kind is only
    /// reachable through [`Server::request_job_by_id`].
    pub fn enqueue_manifest_job(&self, job: &ManifestJob, depsolve_id: Uuid) -> Result<Uuid> {
        self.enqueue(JobKind::ManifestIdOnly, None, job, &[depsolve_id])
    }

    fn enqueue<T: serde::Serialize>(
        &self,
        kind: JobKind,
        arch: Option<&str>,
        job: &T,
        dependencies: &[Uuid],
    ) -> Result<Uuid> {
        let args = serde_json::to_value(job)?;
        self.queue
            .enqueue(&kind.type_string(arch), args, dependencies)
    }

    /// Long-poll dequeue for a worker advertising `arch` and `kinds`.
    ///
    /// Kinds restricted to targeted dispatch are rejected up front so a
    /// misconfigured worker fails fast instead of blocking. Unknown kind
    /// strings are allowed and simply never match.
    pub async fn request_job(&self, arch: &str, kinds: &[String]) -> Result<Dispatch> {
        for kind in kinds {
            if let Ok(known) = JobKind::from_kind_str(kind) {
                if known.targeted_only() {
                    return Err(BrokerError::TargetedKindOnly(kind.clone()));
                }
            }
        }
        let timeout = match self.config.request_timeout {
            t if t.is_zero() => None,
            t => Some(t),
        };
        self.queue.dequeue(arch, kinds, timeout).await
    }

    /// Targeted dispatch of one specific job, used by producer jobs that
    /// hand off to a follow-up worker.
    pub fn request_job_by_id(&self, arch: &str, id: Uuid) -> Result<Dispatch> {
        self.queue.dequeue_by_id(arch, id)
    }

    /// Store a result and retire the worker's token. Any artifacts uploaded
    /// under the token move to the job's directory.
    pub fn finish_job(&self, token: Uuid, result: Value) -> Result<Uuid> {
        let id = self.queue.finish(token, result)?;
        self.promote_artifacts(token, id);
        Ok(id)
    }

    pub fn cancel(&self, id: Uuid) -> Result<()> {
        self.queue.cancel(id)
    }

    pub fn is_canceled_by_token(&self, token: Uuid) -> Result<bool> {
        self.queue.is_canceled_by_token(token)
    }

    pub fn job_id_by_token(&self, token: Uuid) -> Result<Uuid> {
        self.queue.job_id_by_token(token)
    }

    /// A job's stored type, migrated payload, and dependencies.
    pub fn job(&self, id: Uuid) -> Result<(String, Value, Vec<Uuid>)> {
        let (jtype, args, dependencies) = self.queue.load_job(id)?;
        let (kind, _) = parse_type(&jtype)?;
        Ok((jtype, codec::migrate_args(kind, args), dependencies))
    }

    /// Queue metadata plus the migrated result, once Finished.
    pub fn job_status(&self, id: Uuid) -> Result<JobInfo> {
        let snapshot = self.queue.snapshot(id)?;
        let (kind, _) = parse_type(&snapshot.jtype)?;
        let result = self
            .queue
            .load_result(id)?
            .map(|raw| codec::migrate_result(kind, raw));
        Ok(JobInfo {
            jtype: snapshot.jtype,
            state: snapshot.state,
            canceled: snapshot.canceled,
            dependencies: snapshot.dependencies,
            result,
        })
    }

    /// Destination for an uploaded artifact, or `None` when artifact
    /// storage is disabled. Validates the token either way.
    pub(crate) fn artifact_path(&self, token: Uuid, name: &str) -> Result<Option<std::path::PathBuf>> {
        self.queue.job_id_by_token(token)?;
        let Some(root) = &self.config.artifacts_dir else {
            return Ok(None);
        };
        let dir = root.join("incoming").join(token.to_string());
        std::fs::create_dir_all(&dir)?;
        Ok(Some(dir.join(name)))
    }

    fn promote_artifacts(&self, token: Uuid, id: Uuid) {
        let Some(root) = &self.config.artifacts_dir else {
            return;
        };
        let incoming = root.join("incoming").join(token.to_string());
        if !incoming.is_dir() {
            return;
        }
        let dest = root.join(id.to_string());
        if let Err(err) = std::fs::rename(&incoming, &dest) {
            tracing::warn!(job_id = %id, error = %err, "Failed to move artifacts");
        }
    }
}
