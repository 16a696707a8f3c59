//! Control flow for one session.
//!
//! A write task takes an L2 slot and its locks, runs the executor, logs the
//! run, captures evidence, and is judged by the review loop. Rejections go back
//! to the executor with a modification instruction until the task passes or
//! the review loop escalates it. The slot is released on every path.
//!
//! Component state sits behind `std::sync::Mutex`; guards are taken inside
//! short synchronous helpers and never live across an `.await`.

use crate::config::PhasegateConfig;
use crate::errors::{CoreError, CoreResult, ErrorKind};
use crate::evidence::{Artifact, EvidenceItem, EvidenceLedger, IntegrityReport};
use crate::executor::{Executor, ExecutorRequest, ExecutorResponse, ExecutorStatus};
use crate::lifecycle::{FinalReport, LifecycleController};
use crate::locks::LockManager;
use crate::phase::Phase;
use crate::pool::{L1Acquisition, L2Request, PoolEvent, ReadOnlyPool, SlotTaskStatus, WritePool};
use crate::review::{Candidate, Judgment, ReviewLoop, Verdict, is_transient_failure};
use crate::session::{ExecutorRun, PhaseStatus, SessionStore};
use crate::tracer::{ConversationTracer, NullTracer};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A unit of work handed to the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub prompt: String,
    /// Files to write-lock while the task runs.
    #[serde(default)]
    pub lock_paths: Vec<String>,
    /// Glob patterns the task may write.
    #[serde(default)]
    pub write_scope: Vec<String>,
    /// Files the delivered artifact must contain.
    #[serde(default)]
    pub required_files: Vec<String>,
}

impl TaskSpec {
    pub fn new(task_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn lock(mut self, path: impl Into<String>) -> Self {
        self.lock_paths.push(path.into());
        self
    }

    pub fn scope(mut self, pattern: impl Into<String>) -> Self {
        self.write_scope.push(pattern.into());
        self
    }

    pub fn require(mut self, path: impl Into<String>) -> Self {
        self.required_files.push(path.into());
        self
    }

    fn worker_id(&self) -> String {
        format!("worker-{}", self.task_id)
    }
}

/// How a write task ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub verdict: Verdict,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_id: Option<String>,
    pub judgments: Vec<Judgment>,
}

/// Result of a read-only task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadOutcome {
    pub task_id: String,
    pub output: String,
    pub evidence_id: String,
}

pub struct Orchestrator {
    session_id: String,
    workspace: PathBuf,
    lifecycle: Arc<Mutex<LifecycleController>>,
    store: Arc<dyn SessionStore>,
    ledger: Arc<Mutex<EvidenceLedger>>,
    locks: Arc<Mutex<LockManager>>,
    l1: Mutex<ReadOnlyPool>,
    l1_released: Notify,
    l2: Mutex<WritePool>,
    review: Mutex<ReviewLoop>,
    executor: Arc<dyn Executor>,
    tracer: Arc<dyn ConversationTracer>,
}

fn guard<'a, T>(mutex: &'a Mutex<T>, component: &str) -> CoreResult<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| CoreError::poisoned(component))
}

impl Orchestrator {
    /// Wire the components around an initialized lifecycle controller.
    ///
    /// The evidence ledger is opened for the controller's session.
    pub fn new(
        config: &PhasegateConfig,
        workspace: impl Into<PathBuf>,
        lifecycle: LifecycleController,
        mut ledger: EvidenceLedger,
        executor: Arc<dyn Executor>,
    ) -> CoreResult<Self> {
        let session_id = lifecycle.session()?.session_id.clone();
        let store = Arc::clone(lifecycle.store());
        ledger.initialize_session(&session_id)?;
        let ledger = Arc::new(Mutex::new(ledger));
        let locks = Arc::new(Mutex::new(LockManager::new(
            config.locks.max_write_workers,
            config.lock_ttl(),
        )));
        let l2 = WritePool::from_config(config, Arc::clone(&locks)).with_ledger(Arc::clone(&ledger));

        Ok(Self {
            session_id,
            workspace: workspace.into(),
            lifecycle: Arc::new(Mutex::new(lifecycle)),
            store,
            ledger,
            locks,
            l1: Mutex::new(ReadOnlyPool::from_config(config)),
            l1_released: Notify::new(),
            l2: Mutex::new(l2),
            review: Mutex::new(ReviewLoop::from_config(config)),
            executor,
            tracer: Arc::new(NullTracer),
        })
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn ConversationTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Publish pool events from both pools on `tx`.
    pub fn with_pool_events(self, tx: mpsc::Sender<PoolEvent>) -> CoreResult<Self> {
        guard(&self.l1, "L1 pool")?.set_event_channel(tx.clone());
        guard(&self.l2, "L2 pool")?.set_event_channel(tx);
        Ok(self)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn lifecycle(&self) -> Arc<Mutex<LifecycleController>> {
        Arc::clone(&self.lifecycle)
    }

    pub fn ledger(&self) -> Arc<Mutex<EvidenceLedger>> {
        Arc::clone(&self.ledger)
    }

    pub fn lock_manager(&self) -> Arc<Mutex<LockManager>> {
        Arc::clone(&self.locks)
    }

    fn with_lifecycle<T>(&self, f: impl FnOnce(&mut LifecycleController) -> CoreResult<T>) -> CoreResult<T> {
        f(&mut *guard(&self.lifecycle, "lifecycle controller")?)
    }

    fn with_ledger<T>(&self, f: impl FnOnce(&mut EvidenceLedger) -> CoreResult<T>) -> CoreResult<T> {
        f(&mut *guard(&self.ledger, "evidence ledger")?)
    }

    fn with_l2<T>(&self, f: impl FnOnce(&mut WritePool) -> CoreResult<T>) -> CoreResult<T> {
        f(&mut *guard(&self.l2, "L2 pool")?)
    }

    fn with_l1<T>(&self, f: impl FnOnce(&mut ReadOnlyPool) -> CoreResult<T>) -> CoreResult<T> {
        f(&mut *guard(&self.l1, "L1 pool")?)
    }

    fn with_review<T>(&self, f: impl FnOnce(&mut ReviewLoop) -> T) -> CoreResult<T> {
        Ok(f(&mut *guard(&self.review, "review loop")?))
    }

    /// Surface an error on the session, raising the flag its kind forces.
    fn surface(&self, err: CoreError) -> CoreError {
        if let Err(record_err) = self.with_lifecycle(|l| l.record_error(&err)) {
            warn!(error = %record_err, "failed to record session error");
        }
        err
    }

    fn trace(&self, result: CoreResult<()>) {
        if let Err(e) = result {
            warn!(error = %e, "conversation tracer failed");
        }
    }

    /// Run one write task to a PASS or ESCALATE verdict.
    pub async fn run_write_task(&self, spec: TaskSpec) -> CoreResult<TaskOutcome> {
        let worker_id = spec.worker_id();
        let slot = self.with_l2(|pool| {
            pool.acquire(
                L2Request::new(worker_id.as_str())
                    .with_locks(spec.lock_paths.iter().cloned())
                    .with_write_scope(spec.write_scope.iter().cloned()),
            )
        })?;

        let started = self.with_lifecycle(|l| l.start_parallel_tasks(std::slice::from_ref(&spec.task_id)));
        let result = match started {
            Ok(()) => {
                let driven = self.drive_write_task(&spec, &slot.slot_id, &worker_id).await;
                if let Err(err) = &driven {
                    self.settle_stranded(&slot.slot_id, &spec.task_id, err);
                }
                driven
            }
            Err(err) => Err(err),
        };

        if let Err(e) = self.with_l2(|pool| pool.release(&slot.slot_id, true)) {
            warn!(slot = %slot.slot_id, error = %e, "failed to release L2 slot");
        }
        result
    }

    async fn drive_write_task(&self, spec: &TaskSpec, slot_id: &str, worker_id: &str) -> CoreResult<TaskOutcome> {
        let task_id = spec.task_id.as_str();
        self.with_ledger(|ledger| ledger.register_operation(&self.session_id, task_id))?;
        self.with_l2(|pool| {
            pool.assign_task(slot_id, task_id)?;
            pool.update_task_status(slot_id, SlotTaskStatus::InProgress)
        })?;
        self.trace(self.tracer.user_request(&self.session_id, task_id, &spec.prompt));

        let mut judgments = Vec::new();
        let mut instruction: Option<String> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let request = ExecutorRequest {
                session_id: self.session_id.clone(),
                task_id: task_id.to_string(),
                worker_id: worker_id.to_string(),
                attempt,
                prompt: spec.prompt.clone(),
                modification_instruction: instruction.clone(),
            };
            self.trace(self.tracer.executor_request(&request));

            let started_at = Utc::now();
            let submitted = self.executor.submit(request).await;
            let response = match submitted {
                Ok(r) if r.status == ExecutorStatus::Success => Ok(r),
                Ok(r) => Err(CoreError::new(
                    ErrorKind::ExecutorFailure,
                    format!("executor reported failure: {}", r.output),
                )),
                Err(e) => Err(e),
            };
            self.log_run(task_id, worker_id, attempt, started_at, &response)?;

            let judgment = match response {
                Err(err) if is_transient_failure(err.message()) => {
                    self.with_review(|r| r.judge_failure(task_id, err.message()))?
                }
                Err(err) => {
                    warn!(task = task_id, attempt, error = %err, "executor failed");
                    self.abandon(slot_id, task_id, &err.to_string());
                    return Err(self.surface(err));
                }
                Ok(response) => {
                    self.trace(self.tracer.executor_response(&self.session_id, task_id, &response));
                    let item = match self.capture_evidence(slot_id, task_id, attempt, &response).await {
                        Ok(item) => item,
                        Err(err) => {
                            self.abandon(slot_id, task_id, &err.to_string());
                            return Err(self.surface(err));
                        }
                    };
                    let candidate = self.candidate(spec, &response, &item);
                    let judgment = self.with_review(|r| r.judge(task_id, &candidate))?;
                    if judgment.verdict == Verdict::Pass {
                        self.trace(self.tracer.quality_judgment(&self.session_id, &judgment));
                        judgments.push(judgment);
                        let evidence_id = self.accept(slot_id, task_id, item)?;
                        return Ok(TaskOutcome {
                            task_id: task_id.to_string(),
                            verdict: Verdict::Pass,
                            attempts: attempt,
                            evidence_id: Some(evidence_id),
                            judgments,
                        });
                    }
                    judgment
                }
            };

            self.trace(self.tracer.quality_judgment(&self.session_id, &judgment));
            match judgment.verdict {
                Verdict::Reject => {
                    let text = judgment.modification_instruction.clone().unwrap_or_default();
                    self.trace(self.tracer.rejection_detail(&self.session_id, task_id, &text));
                    debug!(task = task_id, attempt, "rejected, retrying with instruction");
                    instruction = Some(text);
                    judgments.push(judgment);
                }
                Verdict::Retry => {
                    debug!(task = task_id, attempt, "transient failure, retrying");
                    judgments.push(judgment);
                }
                Verdict::Escalate | Verdict::Pass => {
                    let reason = judgment
                        .reason
                        .clone()
                        .unwrap_or_else(|| "review escalated".to_string());
                    judgments.push(judgment);
                    self.with_l2(|pool| pool.complete_task(slot_id, SlotTaskStatus::Failed, None))?;
                    self.with_lifecycle(|l| l.escalate_task(task_id, &reason))?;
                    self.with_review(|r| r.reset(task_id))?;
                    return Ok(TaskOutcome {
                        task_id: task_id.to_string(),
                        verdict: Verdict::Escalate,
                        attempts: attempt,
                        evidence_id: None,
                        judgments,
                    });
                }
            }
        }
    }

    fn log_run(
        &self,
        task_id: &str,
        worker_id: &str,
        attempt: u32,
        started_at: chrono::DateTime<Utc>,
        response: &CoreResult<ExecutorResponse>,
    ) -> CoreResult<()> {
        let run = ExecutorRun {
            run_id: Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            attempt,
            started_at,
            finished_at: Utc::now(),
            status: if response.is_ok() { "success" } else { "failed" }.to_string(),
            files_modified: response
                .as_ref()
                .map(|r| r.files_modified.clone())
                .unwrap_or_default(),
            output_chars: response.as_ref().map(|r| r.output.len()).unwrap_or(0),
            error: response.as_ref().err().map(|e| e.to_string()),
        };
        self.store.append_executor_run(&run)
    }

    /// Read every modified file under the slot's write permission and build an
    /// evidence item with the raw executor output attached.
    async fn capture_evidence(
        &self,
        slot_id: &str,
        task_id: &str,
        attempt: u32,
        response: &ExecutorResponse,
    ) -> CoreResult<EvidenceItem> {
        for path in &response.files_modified {
            self.with_l2(|pool| pool.check_write(slot_id, path))?;
        }
        let mut artifacts = Vec::with_capacity(response.files_modified.len());
        for path in &response.files_modified {
            let full = self.workspace.join(path);
            // a missing file is left for the review to flag
            if let Ok(content) = tokio::fs::read_to_string(&full).await {
                artifacts.push(Artifact::new(path.as_str(), content));
            }
        }
        let log_name = format!("{}-attempt-{}", task_id, attempt);
        let raw_log = self.with_ledger(|ledger| ledger.record_raw_log(&self.session_id, &log_name, &response.output))?;
        Ok(EvidenceItem::new(&self.session_id, task_id, "file_write", artifacts)
            .with_task(task_id)
            .with_raw_log(raw_log))
    }

    fn candidate(&self, spec: &TaskSpec, response: &ExecutorResponse, item: &EvidenceItem) -> Candidate {
        let mut candidate = Candidate::new().with_response(response.output.as_str());
        if !item.artifacts.is_empty() {
            candidate = candidate.with_evidence(item.evidence_id.as_str());
        }
        for artifact in &item.artifacts {
            candidate = candidate.with_file(artifact.path.as_str(), artifact.content.as_str());
        }
        for path in &spec.required_files {
            candidate = candidate.require(path.as_str());
        }
        candidate
    }

    /// Record the passing attempt's evidence and complete the task everywhere.
    fn accept(&self, slot_id: &str, task_id: &str, item: EvidenceItem) -> CoreResult<String> {
        let completed = self.with_l2(|pool| pool.complete_task(slot_id, SlotTaskStatus::Completed, Some(item)));
        let evidence_id = match completed.map(|task| task.evidence_id) {
            Ok(Some(id)) => id,
            Ok(None) => {
                let err = CoreError::new(
                    ErrorKind::MissingEvidence,
                    format!("task {} completed without an evidence id", task_id),
                );
                self.abandon(slot_id, task_id, &err.to_string());
                return Err(self.surface(err));
            }
            Err(err) => {
                self.abandon(slot_id, task_id, &err.to_string());
                return Err(self.surface(err));
            }
        };
        self.with_lifecycle(|l| l.complete_parallel_task(task_id, Some(&json!({ "evidence_id": evidence_id }))))?;
        self.with_review(|r| r.reset(task_id))?;
        info!(task = task_id, evidence = %evidence_id, "task passed review");
        Ok(evidence_id)
    }

    /// Mark the task failed in the pool and the session, logging secondary errors.
    fn abandon(&self, slot_id: &str, task_id: &str, reason: &str) {
        if let Err(e) = self.with_l2(|pool| pool.complete_task(slot_id, SlotTaskStatus::Failed, None)) {
            debug!(slot = slot_id, error = %e, "slot task not marked failed");
        }
        if let Err(e) = self.with_lifecycle(|l| l.fail_parallel_task(task_id, reason)) {
            warn!(task = task_id, error = %e, "failed to mark task failed");
        }
    }

    /// Fail a task that an error left active in the session, so the Execution
    /// gate sees it as finished rather than still running.
    fn settle_stranded(&self, slot_id: &str, task_id: &str, err: &CoreError) {
        let still_active = self.with_lifecycle(|l| Ok(l.session()?.active_parallel_tasks().contains(task_id)));
        match still_active {
            Ok(true) => {
                warn!(task = task_id, error = %err, "task stranded by error, marking failed");
                self.abandon(slot_id, task_id, &err.to_string());
                self.surface(err.clone());
            }
            Ok(false) => {}
            Err(e) => warn!(task = task_id, error = %e, "could not check task state"),
        }
    }

    /// Run several write tasks concurrently. Results are in input order.
    pub async fn run_parallel_write_tasks(&self, specs: Vec<TaskSpec>) -> Vec<CoreResult<TaskOutcome>> {
        info!(count = specs.len(), "running write tasks in parallel");
        join_all(specs.into_iter().map(|spec| self.run_write_task(spec))).await
    }

    /// Run a read-only task in an L1 slot, waiting in the queue if needed.
    pub async fn run_read_task(&self, task_id: &str, prompt: &str) -> CoreResult<ReadOutcome> {
        let worker_id = format!("reader-{}", task_id);
        let slot_id = loop {
            let released = self.l1_released.notified();
            let acquired = self.with_l1(|pool| {
                if let Some(slot) = pool.slot_for_worker(&worker_id) {
                    return Ok(Some(slot.slot_id.clone()));
                }
                match pool.acquire(&worker_id)? {
                    L1Acquisition::Granted(slot) => Ok(Some(slot.slot_id)),
                    L1Acquisition::Queued { position } => {
                        debug!(worker = %worker_id, position, "waiting for L1 slot");
                        Ok(None)
                    }
                }
            })?;
            match acquired {
                Some(slot_id) => break slot_id,
                None => released.await,
            }
        };

        let result = self.drive_read_task(&slot_id, task_id, &worker_id, prompt).await;

        let released = self.with_l1(|pool| pool.release(&slot_id));
        self.l1_released.notify_waiters();
        if let Err(e) = released {
            warn!(slot = %slot_id, error = %e, "failed to release L1 slot");
        }
        result
    }

    async fn drive_read_task(&self, slot_id: &str, task_id: &str, worker_id: &str, prompt: &str) -> CoreResult<ReadOutcome> {
        self.with_l1(|pool| {
            pool.assign_task(slot_id, task_id)?;
            pool.update_task_status(slot_id, SlotTaskStatus::InProgress)
        })?;
        self.with_ledger(|ledger| ledger.register_operation(&self.session_id, task_id))?;
        self.trace(self.tracer.user_request(&self.session_id, task_id, prompt));

        let request = ExecutorRequest {
            session_id: self.session_id.clone(),
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            attempt: 1,
            prompt: prompt.to_string(),
            modification_instruction: None,
        };
        self.trace(self.tracer.executor_request(&request));
        let started_at = Utc::now();
        let response = self.executor.submit(request).await;
        self.log_run(task_id, worker_id, 1, started_at, &response)?;
        let response = match response {
            Ok(r) => r,
            Err(err) => {
                self.with_l1(|pool| pool.complete_task(slot_id, SlotTaskStatus::Failed, None))?;
                return Err(self.surface(err));
            }
        };
        self.trace(self.tracer.executor_response(&self.session_id, task_id, &response));

        let recorded = self.with_ledger(|ledger| {
            let raw_log = ledger.record_raw_log(&self.session_id, &format!("{}-read", task_id), &response.output)?;
            let item = EvidenceItem::new(
                &self.session_id,
                task_id,
                "read",
                vec![Artifact::new("response", response.output.as_str())],
            )
            .with_task(task_id)
            .with_raw_log(raw_log);
            ledger.record_evidence(item)
        });
        let evidence_id = match recorded {
            Ok(id) => id,
            Err(err) => {
                self.with_l1(|pool| pool.complete_task(slot_id, SlotTaskStatus::Failed, None))?;
                return Err(self.surface(err));
            }
        };
        self.with_l1(|pool| pool.complete_task(slot_id, SlotTaskStatus::Completed, Some(evidence_id.clone())))?;
        Ok(ReadOutcome {
            task_id: task_id.to_string(),
            output: response.output,
            evidence_id,
        })
    }

    /// Complete the current phase with the given evidence.
    pub fn advance(&self, evidence: &Value) -> CoreResult<Phase> {
        self.with_lifecycle(|l| l.complete_current_phase(Some(evidence), PhaseStatus::Completed))
    }

    /// Finalize and verify the evidence ledger. A failed check marks the
    /// session NO_EVIDENCE.
    pub fn seal_evidence(&self) -> CoreResult<IntegrityReport> {
        let sealed = self.with_ledger(|ledger| {
            if !ledger.is_finalized(&self.session_id) {
                ledger.finalize_session(&self.session_id)?;
            }
            ledger.verify_session_integrity(&self.session_id)
        });
        sealed.map_err(|err| self.surface(err))
    }

    /// Write the final report and hand it to the tracer. Returns the report
    /// and its location.
    pub fn final_report(&self) -> CoreResult<(FinalReport, String)> {
        let (report, path) = self.with_lifecycle(|l| l.generate_final_report())?;
        self.trace(self.tracer.final_summary(&report));
        Ok((report, path))
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}
