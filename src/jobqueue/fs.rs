//! Filesystem-backed job queue.
//!
//! Each job owns one directory under the queue root, named by its UUID:
//!
//! ```text
//! <root>/<uuid>/job.json      type, payload, dependencies (immutable)
//! <root>/<uuid>/state.json    lifecycle state, token, cancel flag
//! <root>/<uuid>/result.json   result bytes, written once at finish
//! ```
//!
//! Every file is written to a temporary name in the same directory and
//! renamed into place, so a reader never observes a half-written job. The
//! in-memory index (pending FIFO per type, token map) is rebuilt from these
//! files on open; jobs that were Running stay Running.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{BrokerError, Result};
use crate::jobs::split_type;

use super::{Dispatch, JobSnapshot, JobState};

const JOB_FILE: &str = "job.json";
const STATE_FILE: &str = "state.json";
const RESULT_FILE: &str = "result.json";

#[derive(Serialize, Deserialize)]
struct JobFile {
    #[serde(rename = "type")]
    jtype: String,
    args: Value,
    #[serde(default)]
    dependencies: Vec<Uuid>,
    enqueued_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct StateFile {
    state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<Uuid>,
    #[serde(default)]
    canceled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct JobMeta {
    jtype: String,
    dependencies: Vec<Uuid>,
    enqueued_at: DateTime<Utc>,
    state: JobState,
    token: Option<Uuid>,
    canceled: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Index {
    jobs: HashMap<Uuid, JobMeta>,
    /// Pending jobs per full type string, oldest first.
    pending: HashMap<String, VecDeque<Uuid>>,
    /// Live dispatch tokens.
    tokens: HashMap<Uuid, Uuid>,
}

/// Durable job queue rooted at a directory.
pub struct FsJobQueue {
    root: PathBuf,
    index: Mutex<Index>,
    /// One wakeup channel per full type string. Enqueues and finishes bump
    /// the counter; blocked dequeues subscribe before re-checking the index
    /// so no wakeup is lost.
    buckets: Mutex<HashMap<String, watch::Sender<u64>>>,
}

impl FsJobQueue {
    /// Open a queue, creating the root if needed and re-reading every job.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut index = Index::default();
        let mut pending: Vec<(Uuid, DateTime<Utc>, String)> = Vec::new();

        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Ok(id) = name.to_string_lossy().parse::<Uuid>() else {
                continue;
            };

            let dir = entry.path();
            let job: JobFile = match read_json(&dir.join(JOB_FILE)) {
                Ok(job) => job,
                Err(err) => {
                    // Interrupted enqueue; the job was never visible.
                    tracing::warn!(job_id = %id, error = %err, "Skipping unreadable job");
                    continue;
                }
            };
            // A missing state file means the enqueue stopped after job.json;
            // the job is complete enough to treat as freshly pending.
            let state: StateFile = read_json(&dir.join(STATE_FILE)).unwrap_or(StateFile {
                state: JobState::Pending,
                token: None,
                canceled: false,
                started_at: None,
                finished_at: None,
            });

            if state.state == JobState::Pending {
                pending.push((id, job.enqueued_at, job.jtype.clone()));
            }
            if let (JobState::Running, Some(token)) = (state.state, state.token) {
                index.tokens.insert(token, id);
            }

            index.jobs.insert(
                id,
                JobMeta {
                    jtype: job.jtype,
                    dependencies: job.dependencies,
                    enqueued_at: job.enqueued_at,
                    state: state.state,
                    token: state.token,
                    canceled: state.canceled,
                    started_at: state.started_at,
                    finished_at: state.finished_at,
                },
            );
        }

        pending.sort_by_key(|(_, enqueued_at, _)| *enqueued_at);
        for (id, _, jtype) in pending {
            index.pending.entry(jtype).or_default().push_back(id);
        }

        tracing::info!(
            root = %root.display(),
            jobs = index.jobs.len(),
            running = index.tokens.len(),
            "Opened job queue"
        );

        Ok(Self {
            root,
            index: Mutex::new(index),
            buckets: Mutex::new(HashMap::new()),
        })
    }

    /// Persist a new Pending job. Fails if any dependency is unknown.
    pub fn enqueue(&self, jtype: &str, args: Value, dependencies: &[Uuid]) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        {
            let mut index = self.index.lock();
            for dep in dependencies {
                if !index.jobs.contains_key(dep) {
                    return Err(BrokerError::InvalidDependency(*dep));
                }
            }

            let dir = self.job_dir(id);
            fs::create_dir_all(&dir)?;
            write_json(
                &dir,
                JOB_FILE,
                &JobFile {
                    jtype: jtype.to_string(),
                    args,
                    dependencies: dependencies.to_vec(),
                    enqueued_at: now,
                },
            )?;
            write_json(
                &dir,
                STATE_FILE,
                &StateFile {
                    state: JobState::Pending,
                    token: None,
                    canceled: false,
                    started_at: None,
                    finished_at: None,
                },
            )?;

            index.jobs.insert(
                id,
                JobMeta {
                    jtype: jtype.to_string(),
                    dependencies: dependencies.to_vec(),
                    enqueued_at: now,
                    state: JobState::Pending,
                    token: None,
                    canceled: false,
                    started_at: None,
                    finished_at: None,
                },
            );
            index
                .pending
                .entry(jtype.to_string())
                .or_default()
                .push_back(id);
        }

        self.bump(jtype);
        tracing::info!(job_id = %id, jtype, "Job enqueued");
        Ok(id)
    }

    /// Long-poll dequeue: block until a job whose kind is in `kinds` (and
    /// whose arch matches, for arch-qualified types) has all dependencies
    /// finished, or until `timeout` elapses.
    ///
    /// Selection and the Running transition happen in one synchronous
    /// critical section; a caller dropped mid-wait never consumes a job.
    pub async fn dequeue(
        &self,
        arch: &str,
        kinds: &[String],
        timeout: Option<Duration>,
    ) -> Result<Dispatch> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            // Subscribe before checking so an enqueue that lands in between
            // is picked up by the wait below.
            let mut receivers = self.subscribe(arch, kinds);

            if let Some(dispatch) = self.try_dequeue(arch, kinds)? {
                return Ok(dispatch);
            }

            let changed = async {
                if receivers.is_empty() {
                    futures::future::pending::<()>().await;
                } else {
                    let waits: Vec<_> = receivers
                        .iter_mut()
                        .map(|rx| Box::pin(rx.changed()))
                        .collect();
                    let _ = futures::future::select_all(waits).await;
                }
            };

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, changed).await.is_err() {
                        if let Some(dispatch) = self.try_dequeue(arch, kinds)? {
                            return Ok(dispatch);
                        }
                        return Err(BrokerError::DequeueTimeout);
                    }
                }
                None => changed.await,
            }
        }
    }

    /// Targeted dequeue of a specific job. Fails with `NotPending` unless
    /// the job is Pending with all dependencies finished (and, for
    /// arch-qualified types, a matching arch).
    pub fn dequeue_by_id(&self, arch: &str, id: Uuid) -> Result<Dispatch> {
        let committed = {
            let mut index = self.index.lock();
            let meta = index.jobs.get(&id).ok_or(BrokerError::UnknownJob(id))?;

            let eligible = meta.state == JobState::Pending
                && deps_finished(&index.jobs, &meta.dependencies)
                && match split_type(&meta.jtype).1 {
                    Some(job_arch) => job_arch == arch,
                    None => true,
                };
            if !eligible {
                return Err(BrokerError::NotPending(id));
            }

            self.commit_dispatch(&mut index, id)?
        };

        self.load_dispatch(committed)
    }

    /// Mark the job identified by `token` finished, store its result, and
    /// retire the token. Returns the job id.
    pub fn finish(&self, token: Uuid, result: Value) -> Result<Uuid> {
        let (id, dependent_types) = {
            let mut index = self.index.lock();
            let id = *index
                .tokens
                .get(&token)
                .ok_or(BrokerError::UnknownToken(token))?;
            let meta = index.jobs.get(&id).ok_or(BrokerError::UnknownJob(id))?;

            let dir = self.job_dir(id);
            let now = Utc::now();
            write_json(&dir, RESULT_FILE, &result)?;
            write_json(
                &dir,
                STATE_FILE,
                &StateFile {
                    state: JobState::Finished,
                    token: None,
                    canceled: meta.canceled,
                    started_at: meta.started_at,
                    finished_at: Some(now),
                },
            )?;

            if let Some(meta) = index.jobs.get_mut(&id) {
                meta.state = JobState::Finished;
                meta.token = None;
                meta.finished_at = Some(now);
            }
            index.tokens.remove(&token);

            // Pending jobs waiting on this one may have become eligible.
            let dependent_types: Vec<String> = index
                .jobs
                .values()
                .filter(|m| m.state == JobState::Pending && m.dependencies.contains(&id))
                .map(|m| m.jtype.clone())
                .collect();
            (id, dependent_types)
        };

        for jtype in dependent_types {
            self.bump(&jtype);
        }
        tracing::info!(job_id = %id, "Job finished");
        Ok(id)
    }

    /// Set the sticky cancel flag. Does not change the job's state.
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        let mut index = self.index.lock();
        let meta = index.jobs.get(&id).ok_or(BrokerError::UnknownJob(id))?;

        write_json(
            &self.job_dir(id),
            STATE_FILE,
            &StateFile {
                state: meta.state,
                token: meta.token,
                canceled: true,
                started_at: meta.started_at,
                finished_at: meta.finished_at,
            },
        )?;
        if let Some(meta) = index.jobs.get_mut(&id) {
            meta.canceled = true;
        }
        tracing::info!(job_id = %id, "Job canceled");
        Ok(())
    }

    pub fn is_canceled_by_token(&self, token: Uuid) -> Result<bool> {
        let index = self.index.lock();
        let id = index
            .tokens
            .get(&token)
            .ok_or(BrokerError::UnknownToken(token))?;
        Ok(index.jobs.get(id).map(|m| m.canceled).unwrap_or(false))
    }

    pub fn job_id_by_token(&self, token: Uuid) -> Result<Uuid> {
        let index = self.index.lock();
        index
            .tokens
            .get(&token)
            .copied()
            .ok_or(BrokerError::UnknownToken(token))
    }

    /// Read a job's stored type, payload, and dependency list.
    pub fn load_job(&self, id: Uuid) -> Result<(String, Value, Vec<Uuid>)> {
        {
            let index = self.index.lock();
            if !index.jobs.contains_key(&id) {
                return Err(BrokerError::UnknownJob(id));
            }
        }
        let job: JobFile = read_json(&self.job_dir(id).join(JOB_FILE))?;
        Ok((job.jtype, job.args, job.dependencies))
    }

    /// Read a job's stored result; `None` while the job is not Finished.
    pub fn load_result(&self, id: Uuid) -> Result<Option<Value>> {
        {
            let index = self.index.lock();
            let meta = index.jobs.get(&id).ok_or(BrokerError::UnknownJob(id))?;
            if meta.state != JobState::Finished {
                return Ok(None);
            }
        }
        Ok(Some(read_json(&self.job_dir(id).join(RESULT_FILE))?))
    }

    /// Queue metadata for a job.
    pub fn snapshot(&self, id: Uuid) -> Result<JobSnapshot> {
        let index = self.index.lock();
        let meta = index.jobs.get(&id).ok_or(BrokerError::UnknownJob(id))?;
        Ok(JobSnapshot {
            jtype: meta.jtype.clone(),
            state: meta.state,
            canceled: meta.canceled,
            dependencies: meta.dependencies.clone(),
            enqueued_at: meta.enqueued_at,
            started_at: meta.started_at,
            finished_at: meta.finished_at,
        })
    }

    fn job_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Select and commit one eligible job, or return `None`. The oldest
    /// eligible job across all matching types wins; within a type, earlier
    /// entries are preferred but a blocked head does not shadow a ready
    /// successor.
    fn try_dequeue(&self, arch: &str, kinds: &[String]) -> Result<Option<Dispatch>> {
        let committed = {
            let mut index = self.index.lock();

            let mut best: Option<(Uuid, DateTime<Utc>)> = None;
            for (jtype, queue) in &index.pending {
                let (kind, job_arch) = split_type(jtype);
                if !kinds.iter().any(|k| k == kind) {
                    continue;
                }
                if let Some(job_arch) = job_arch {
                    if job_arch != arch {
                        continue;
                    }
                }
                for id in queue {
                    let Some(meta) = index.jobs.get(id) else {
                        continue;
                    };
                    if deps_finished(&index.jobs, &meta.dependencies) {
                        if best.map_or(true, |(_, t)| meta.enqueued_at < t) {
                            best = Some((*id, meta.enqueued_at));
                        }
                        break;
                    }
                }
            }

            match best {
                Some((id, _)) => self.commit_dispatch(&mut index, id)?,
                None => return Ok(None),
            }
        };

        self.load_dispatch(committed).map(Some)
    }

    /// Transition a selected job to Running: mint a token, persist the new
    /// state, then update the index. Persist failures leave both the file
    /// and the index untouched.
    fn commit_dispatch(&self, index: &mut Index, id: Uuid) -> Result<CommittedDispatch> {
        let meta = index.jobs.get(&id).ok_or(BrokerError::UnknownJob(id))?;
        let token = Uuid::new_v4();
        let now = Utc::now();
        let jtype = meta.jtype.clone();
        let dependencies = meta.dependencies.clone();

        write_json(
            &self.job_dir(id),
            STATE_FILE,
            &StateFile {
                state: JobState::Running,
                token: Some(token),
                canceled: meta.canceled,
                started_at: Some(now),
                finished_at: None,
            },
        )?;

        if let Some(meta) = index.jobs.get_mut(&id) {
            meta.state = JobState::Running;
            meta.token = Some(token);
            meta.started_at = Some(now);
        }
        if let Some(queue) = index.pending.get_mut(&jtype) {
            queue.retain(|pending| pending != &id);
        }
        index.tokens.insert(token, id);

        tracing::info!(job_id = %id, jtype = %jtype, "Job dispatched");
        Ok(CommittedDispatch {
            job_id: id,
            token,
            jtype,
            dependencies,
        })
    }

    /// Read the payload and dependency results for a committed dispatch.
    /// Dependencies are Finished at this point and results are immutable,
    /// so no lock is held.
    fn load_dispatch(&self, committed: CommittedDispatch) -> Result<Dispatch> {
        let job: JobFile = read_json(&self.job_dir(committed.job_id).join(JOB_FILE))?;
        let mut dep_results = Vec::with_capacity(committed.dependencies.len());
        for dep in &committed.dependencies {
            dep_results.push(read_json(&self.job_dir(*dep).join(RESULT_FILE))?);
        }
        Ok(Dispatch {
            job_id: committed.job_id,
            token: committed.token,
            jtype: committed.jtype,
            args: job.args,
            dep_results,
        })
    }

    fn subscribe(&self, arch: &str, kinds: &[String]) -> Vec<watch::Receiver<u64>> {
        let mut buckets = self.buckets.lock();
        let mut receivers = Vec::with_capacity(kinds.len() * 2);
        for kind in kinds {
            for key in [kind.clone(), format!("{kind}:{arch}")] {
                let sender = buckets
                    .entry(key)
                    .or_insert_with(|| watch::channel(0u64).0);
                receivers.push(sender.subscribe());
            }
        }
        receivers
    }

    fn bump(&self, jtype: &str) {
        let mut buckets = self.buckets.lock();
        let sender = buckets
            .entry(jtype.to_string())
            .or_insert_with(|| watch::channel(0u64).0);
        sender.send_modify(|v| *v = v.wrapping_add(1));
    }
}

struct CommittedDispatch {
    job_id: Uuid,
    token: Uuid,
    jtype: String,
    dependencies: Vec<Uuid>,
}

fn deps_finished(jobs: &HashMap<Uuid, JobMeta>, dependencies: &[Uuid]) -> bool {
    dependencies
        .iter()
        .all(|dep| matches!(jobs.get(dep), Some(meta) if meta.state == JobState::Finished))
}

/// Write `value` as JSON to `dir/name` via a temp file and rename, fsyncing
/// before the rename so a crash cannot surface a torn file.
fn write_json<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, value)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(name)).map_err(|err| err.error)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
