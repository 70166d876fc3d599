//! Background compaction with single-flight per session.
//!
//! ```text
//! Idle -> Scheduled -> Running -> Finished(Compacted | NothingToCompact
//!                                          | Cancelled | Failed) -> Idle
//! ```
//!
//! A job is tracked in a process-wide map keyed by session id from the
//! moment it is scheduled until it exits, whatever the exit path. While an
//! entry exists, further `schedule` calls for that id are no-ops.

use super::compact::{extractive_summary, merge_summary, plan_boundary, truncate_to_budget};
use super::summarizer::Summarizer;
use super::tokens::estimate_tokens;
use crate::session::{Message, MessageLog};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// When to compact and how large the rolling summary may grow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Window estimate at or above which compaction is scheduled
    pub threshold_tokens: usize,
    /// Rolling summaries above this are condensed, or cut
    pub summary_budget_tokens: usize,
    /// Upper bound on each summarizer call
    pub summarizer_timeout_secs: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold_tokens: 60_000,
            summary_budget_tokens: 2_000,
            summarizer_timeout_secs: 30,
        }
    }
}

impl CompactionConfig {
    fn summarizer_timeout(&self) -> Duration {
        Duration::from_secs(self.summarizer_timeout_secs)
    }
}

/// How a compaction job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// The window advanced and the summary was persisted
    Compacted {
        previous_start: usize,
        new_start: usize,
        summary_tokens: usize,
        /// The extractive summary stood in for the summarizer
        used_fallback: bool,
    },
    /// Too few messages would have been folded; nothing changed
    NothingToCompact,
    /// Cancelled before the session lock was taken or right after, or the
    /// session was deleted first
    Cancelled,
    Failed(String),
}

/// Lifecycle of a tracked job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Scheduled,
    Running,
    Finished(CompactionOutcome),
}

/// Sent to completion hooks after a session's prompt window moved.
///
/// Any provider-side continuation handle cached for the session describes
/// the old context and must be dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionEvent {
    pub tenant: String,
    pub session_id: String,
    pub previous_start: usize,
    pub new_start: usize,
    pub used_fallback: bool,
}

type CompactionHook = Arc<dyn Fn(&CompactionEvent) + Send + Sync>;

struct JobEntry {
    job_id: u64,
    cancel: Arc<AtomicBool>,
    state: watch::Receiver<JobState>,
}

/// Removes a job's map entry when dropped, unless a newer job owns it.
struct JobSlot<'a> {
    scheduler: &'a CompactionScheduler,
    session_id: String,
    job_id: u64,
}

impl Drop for JobSlot<'_> {
    fn drop(&mut self) {
        let mut jobs = self.scheduler.jobs();
        if jobs.get(&self.session_id).map(|e| e.job_id) == Some(self.job_id) {
            jobs.remove(&self.session_id);
        }
    }
}

/// Runs compaction jobs, at most one per session at a time.
pub struct CompactionScheduler {
    config: CompactionConfig,
    summarizer: Arc<dyn Summarizer>,
    jobs: Mutex<HashMap<String, JobEntry>>,
    next_job_id: AtomicU64,
    hooks: RwLock<Vec<CompactionHook>>,
}

impl CompactionScheduler {
    pub fn new(config: CompactionConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            config,
            summarizer,
            jobs: Mutex::new(HashMap::new()),
            next_job_id: AtomicU64::new(1),
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a hook called after every successful compaction.
    pub fn on_compacted(&self, hook: impl Fn(&CompactionEvent) + Send + Sync + 'static) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    /// Whether a window of `window_tokens` should trigger compaction.
    pub fn over_threshold(&self, window_tokens: usize) -> bool {
        window_tokens >= self.config.threshold_tokens
    }

    /// Start a background job for `log` unless one is already in flight.
    /// Returns whether a new job was started.
    pub fn schedule(self: &Arc<Self>, log: Arc<MessageLog>) -> bool {
        let (started, _) = self.start_or_join(log);
        started
    }

    /// Run compaction for `log` now and wait for it. Joins the in-flight
    /// job instead if there is one.
    pub async fn force_compact(self: &Arc<Self>, log: Arc<MessageLog>) -> CompactionOutcome {
        let (_, rx) = self.start_or_join(log);
        Self::wait_on(rx).await
    }

    /// Wait for the in-flight job of `session_id`, if any.
    pub async fn wait(&self, session_id: &str) -> Option<CompactionOutcome> {
        let rx = self.jobs().get(session_id).map(|e| e.state.clone())?;
        Some(Self::wait_on(rx).await)
    }

    /// Ask the job for `session_id` to stop. Only effective until the job
    /// has taken the session lock. Returns whether a job was found.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.jobs().get(session_id) {
            Some(entry) => {
                entry.cancel.store(true, Ordering::SeqCst);
                debug!("Cancellation requested for compaction of {}", session_id);
                true
            }
            None => false,
        }
    }

    pub fn is_in_flight(&self, session_id: &str) -> bool {
        self.jobs().contains_key(session_id)
    }

    pub fn job_state(&self, session_id: &str) -> Option<JobState> {
        self.jobs()
            .get(session_id)
            .map(|e| e.state.borrow().clone())
    }

    fn start_or_join(
        self: &Arc<Self>,
        log: Arc<MessageLog>,
    ) -> (bool, watch::Receiver<JobState>) {
        let session_id = log.session_id().to_string();
        let mut jobs = self.jobs();
        if let Some(existing) = jobs.get(&session_id) {
            debug!("Compaction for {} already in flight", session_id);
            return (false, existing.state.clone());
        }

        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = watch::channel(JobState::Scheduled);
        jobs.insert(
            session_id.clone(),
            JobEntry {
                job_id,
                cancel: Arc::clone(&cancel),
                state: rx.clone(),
            },
        );
        drop(jobs);

        debug!("Scheduled compaction job {} for {}", job_id, session_id);
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_tracked(job_id, log, cancel, tx).await;
        });
        (true, rx)
    }

    async fn wait_on(mut rx: watch::Receiver<JobState>) -> CompactionOutcome {
        match rx
            .wait_for(|state| matches!(state, JobState::Finished(_)))
            .await
        {
            Ok(state) => match &*state {
                JobState::Finished(outcome) => outcome.clone(),
                _ => CompactionOutcome::Failed("job state lost".to_string()),
            },
            Err(_) => CompactionOutcome::Failed("job ended without reporting".to_string()),
        }
    }

    async fn run_tracked(
        &self,
        job_id: u64,
        log: Arc<MessageLog>,
        cancel: Arc<AtomicBool>,
        tx: watch::Sender<JobState>,
    ) {
        let slot = JobSlot {
            scheduler: self,
            session_id: log.session_id().to_string(),
            job_id,
        };
        let _ = tx.send(JobState::Running);

        let outcome = match AssertUnwindSafe(self.run_job(&log, &cancel))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("Compaction job for {} panicked", log.session_id());
                CompactionOutcome::Failed("compaction job panicked".to_string())
            }
        };

        match &outcome {
            CompactionOutcome::Compacted {
                previous_start,
                new_start,
                summary_tokens,
                used_fallback,
            } => {
                info!(
                    "Compacted session {}: window {} -> {}, summary {} tokens{}",
                    log.session_id(),
                    previous_start,
                    new_start,
                    summary_tokens,
                    if *used_fallback { " (extractive)" } else { "" }
                );
                self.notify(&CompactionEvent {
                    tenant: log.tenant().to_string(),
                    session_id: log.session_id().to_string(),
                    previous_start: *previous_start,
                    new_start: *new_start,
                    used_fallback: *used_fallback,
                });
            }
            CompactionOutcome::NothingToCompact => {
                debug!("Nothing to compact for {}", log.session_id());
            }
            CompactionOutcome::Cancelled => {
                info!("Compaction for {} cancelled", log.session_id());
            }
            CompactionOutcome::Failed(reason) => {
                warn!("Compaction for {} failed: {}", log.session_id(), reason);
            }
        }

        // Free the slot before publishing, so a caller woken by the final
        // state can schedule the next job straight away.
        drop(slot);
        let _ = tx.send(JobState::Finished(outcome));
    }

    async fn run_job(&self, log: &MessageLog, cancel: &AtomicBool) -> CompactionOutcome {
        if cancel.load(Ordering::SeqCst) {
            return CompactionOutcome::Cancelled;
        }

        let guard = match log.lock().await {
            Ok(guard) => guard,
            Err(e) => {
                if !log.exists().await {
                    return CompactionOutcome::Cancelled;
                }
                return CompactionOutcome::Failed(e.to_string());
            }
        };
        if cancel.load(Ordering::SeqCst) || !log.exists().await {
            return CompactionOutcome::Cancelled;
        }

        let mut data = log.load_from_disk().await;
        let previous_start = data.prompt_window_start;
        let Some(new_start) = plan_boundary(data.full_history.len(), previous_start) else {
            return CompactionOutcome::NothingToCompact;
        };

        let (fresh, used_fallback) = self
            .summarize_slice(&data.full_history[previous_start..new_start])
            .await;
        let merged = merge_summary(data.summary.as_deref(), &fresh);
        let summary = self.fit_budget(merged).await;

        data.summary_token_count = estimate_tokens(&summary);
        data.summary = Some(summary);
        data.prompt_window_start = new_start;
        let summary_tokens = data.summary_token_count;

        if !log.store_locked(data).await {
            return CompactionOutcome::Failed("could not persist compacted log".to_string());
        }
        drop(guard);

        CompactionOutcome::Compacted {
            previous_start,
            new_start,
            summary_tokens,
            used_fallback,
        }
    }

    /// Summary text for `slice` and whether the extractive fallback was used.
    async fn summarize_slice(&self, slice: &[Message]) -> (String, bool) {
        let timeout = self.config.summarizer_timeout();
        let result = tokio::time::timeout(timeout, self.summarizer.summarize(slice)).await;
        match result {
            Ok(Ok(Some(text))) if !text.trim().is_empty() => {
                return (text.trim().to_string(), false);
            }
            Ok(Ok(_)) => info!("Summarizer returned nothing, using extractive summary"),
            Ok(Err(e)) => warn!("Summarizer failed: {}. Using extractive summary", e),
            Err(_) => warn!(
                "Summarizer timed out after {:?}. Using extractive summary",
                self.config.summarizer_timeout()
            ),
        }
        (extractive_summary(slice), true)
    }

    /// Bring `summary` under the budget: condense once, else cut.
    async fn fit_budget(&self, summary: String) -> String {
        let budget = self.config.summary_budget_tokens;
        if estimate_tokens(&summary) <= budget {
            return summary;
        }

        debug!(
            "Rolling summary is {} tokens (budget {}), condensing",
            estimate_tokens(&summary),
            budget
        );
        let timeout = self.config.summarizer_timeout();
        let result = tokio::time::timeout(timeout, self.summarizer.condense(&summary)).await;
        match result {
            Ok(Ok(Some(text))) if !text.trim().is_empty() => {
                return truncate_to_budget(text.trim(), budget);
            }
            Ok(Ok(_)) => info!("Condense returned nothing, truncating summary"),
            Ok(Err(e)) => warn!("Condense failed: {}. Truncating summary", e),
            Err(_) => warn!("Condense timed out, truncating summary"),
        }
        truncate_to_budget(&summary, budget)
    }

    fn notify(&self, event: &CompactionEvent) {
        let hooks: Vec<CompactionHook> = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in hooks {
            (*hook)(event);
        }
    }
}
