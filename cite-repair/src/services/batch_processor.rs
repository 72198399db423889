//! Resumable batch processor
//!
//! Applies one async operation to an ordered list of items in sequential
//! batches. Items inside a batch run concurrently; batches are separated by
//! a fixed rate-limit delay. Every `checkpoint_interval` processed items the
//! run state is written to the injected [`KeyValueStore`] so an interrupted
//! run can be continued with [`BatchProcessor::resume_processing`].
//!
//! Items are always processed as a prefix of the input, so a checkpoint only
//! needs the remaining items: the original index of the first remaining item
//! is `total_items - remaining_items.len()`.

use crate::error::Result;
use crate::models::{checkpoint_key, Checkpoint, ItemError, Tristate};
use crate::services::run_control::{Gate, RunControl};
use chrono::{DateTime, Utc};
use cite_common::config::BatchSettings;
use cite_common::{EventBus, KeyValueStore, RepairEvent};
use futures::future::join_all;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Item progress callback: (processed, total)
pub type ItemProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Three-valued outcome of a settled item, used for summary counts
pub trait Verdict {
    fn verdict(&self) -> Tristate;
}

impl Verdict for Tristate {
    fn verdict(&self) -> Tristate {
        *self
    }
}

impl Verdict for bool {
    fn verdict(&self) -> Tristate {
        (*self).into()
    }
}

impl<T> Verdict for Vec<T> {
    fn verdict(&self) -> Tristate {
        (!self.is_empty()).into()
    }
}

/// Per-run options
#[derive(Clone)]
pub struct BatchOptions {
    /// Job name; checkpoints are keyed by it
    pub job: String,
    pub progress: Option<ItemProgressFn>,
}

impl BatchOptions {
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ItemProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTiming {
    pub index: usize,
    pub size: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingMetadata {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Batches run by this call (a resumed run lists only its own batches)
    pub batches: Vec<BatchTiming>,
}

/// Dispatch failure of a whole batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchError {
    pub batch_index: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary<O> {
    pub job: String,
    pub total: usize,
    pub processed: usize,
    /// Settled with a true verdict
    pub succeeded: usize,
    /// Item errors plus settled items with a false verdict
    pub failed: usize,
    pub unknown: usize,
    /// Slot `i` is the result for input `i`
    pub results: Vec<Option<O>>,
    pub errors: Vec<ItemError>,
    pub batch_errors: Vec<BatchError>,
    /// Run ended by `stop()`; a checkpoint was left behind
    pub stopped: bool,
    pub resumed: bool,
    pub timing: TimingMetadata,
}

impl<O> BatchSummary<O> {
    /// Every processed item failed
    pub fn all_failed(&self) -> bool {
        self.processed > 0 && self.errors.len() == self.processed
    }
}

struct RunState<I, O> {
    total: usize,
    remaining: Vec<I>,
    results: Vec<Option<O>>,
    errors: Vec<ItemError>,
}

/// Batch processor service
pub struct BatchProcessor {
    settings: BatchSettings,
    store: Arc<dyn KeyValueStore>,
    control: Arc<RunControl>,
    /// Reset the control flags at the start of every run
    owns_control: bool,
    event_bus: Option<EventBus>,
}

impl BatchProcessor {
    /// Standalone processor with its own pause/stop control
    pub fn new(settings: BatchSettings, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            settings,
            store,
            control: Arc::new(RunControl::default()),
            owns_control: true,
            event_bus: None,
        }
    }

    /// Processor sharing a caller-owned control (the orchestrator's)
    pub fn with_control(
        settings: BatchSettings,
        store: Arc<dyn KeyValueStore>,
        control: Arc<RunControl>,
    ) -> Self {
        Self {
            settings,
            store,
            control,
            owns_control: false,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Items per batch after applying the concurrency cap
    pub fn effective_batch_size(&self) -> usize {
        self.settings
            .batch_size
            .min(self.settings.max_concurrent_requests)
            .max(1)
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn stop(&self) {
        self.control.stop();
    }

    /// Saved checkpoint for a job, if any
    pub async fn checkpoint<I, O>(&self, job: &str) -> Result<Option<Checkpoint<I, O>>>
    where
        I: DeserializeOwned,
        O: DeserializeOwned,
    {
        match self.store.get(&checkpoint_key(job)).await? {
            Some(value) => Ok(Some(
                serde_json::from_value(value).map_err(cite_common::Error::from)?,
            )),
            None => Ok(None),
        }
    }

    /// Process `items` from the beginning
    pub async fn process_batch<I, O, E, F, Fut>(
        &self,
        items: Vec<I>,
        options: &BatchOptions,
        op: F,
    ) -> Result<BatchSummary<O>>
    where
        I: Clone + Serialize + Send + Sync,
        O: Clone + Serialize + Verdict + Send,
        E: std::fmt::Display + Send,
        F: Fn(I) -> Fut + Send + Sync,
        Fut: Future<Output = std::result::Result<O, E>> + Send,
    {
        if self.owns_control {
            self.control.reset();
        }

        let total = items.len();
        info!(job = %options.job, total, batch_size = self.effective_batch_size(), "Starting batch run");

        let state = RunState {
            total,
            remaining: items,
            results: (0..total).map(|_| None).collect(),
            errors: Vec::new(),
        };
        self.run(state, options, op, false).await
    }

    /// Continue the job from its last checkpoint
    ///
    /// Fails with `NotFound` when the job has no checkpoint.
    pub async fn resume_processing<I, O, E, F, Fut>(
        &self,
        options: &BatchOptions,
        op: F,
    ) -> Result<BatchSummary<O>>
    where
        I: Clone + Serialize + DeserializeOwned + Send + Sync,
        O: Clone + Serialize + DeserializeOwned + Verdict + Send,
        E: std::fmt::Display + Send,
        F: Fn(I) -> Fut + Send + Sync,
        Fut: Future<Output = std::result::Result<O, E>> + Send,
    {
        let checkpoint: Checkpoint<I, O> = self.checkpoint(&options.job).await?.ok_or_else(|| {
            cite_common::Error::NotFound(format!("No checkpoint for job {}", options.job))
        })?;

        if !checkpoint.is_consistent() {
            return Err(cite_common::Error::InvalidInput(format!(
                "Checkpoint for job {} is inconsistent ({} processed + {} remaining != {})",
                options.job,
                checkpoint.processed_count,
                checkpoint.remaining_items.len(),
                checkpoint.total_items
            ))
            .into());
        }

        if self.owns_control {
            self.control.reset();
        }

        info!(
            job = %options.job,
            processed = checkpoint.processed_count,
            remaining = checkpoint.remaining_items.len(),
            checkpoint_time = %checkpoint.timestamp,
            "Resuming batch run from checkpoint"
        );

        let state = RunState {
            total: checkpoint.total_items,
            remaining: checkpoint.remaining_items,
            results: checkpoint.partial_results,
            errors: checkpoint.partial_errors,
        };
        self.run(state, options, op, true).await
    }

    async fn run<I, O, E, F, Fut>(
        &self,
        state: RunState<I, O>,
        options: &BatchOptions,
        op: F,
        resumed: bool,
    ) -> Result<BatchSummary<O>>
    where
        I: Clone + Serialize + Send + Sync,
        O: Clone + Serialize + Verdict + Send,
        E: std::fmt::Display + Send,
        F: Fn(I) -> Fut + Send + Sync,
        Fut: Future<Output = std::result::Result<O, E>> + Send,
    {
        let RunState {
            total,
            remaining,
            mut results,
            mut errors,
        } = state;

        let started_at = Utc::now();
        let run_started = tokio::time::Instant::now();
        let batch_size = self.effective_batch_size();
        let delay = Duration::from_millis(self.settings.rate_limit_delay_ms);
        let offset = total - remaining.len();

        let counter = Arc::new(AtomicUsize::new(offset));
        let mut batch_errors = Vec::new();
        let mut timings = Vec::new();
        let mut cursor = 0;
        let mut since_checkpoint = 0;
        let mut stopped = false;

        while cursor < remaining.len() {
            if cursor > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if self.control.gate().await == Gate::Stop {
                stopped = true;
                warn!(job = %options.job, processed = offset + cursor, total, "Batch run stopped");
                self.save_checkpoint(&options.job, total, offset + cursor, &remaining[cursor..], &results, &errors)
                    .await?;
                break;
            }

            let batch_index = timings.len();
            let end = (cursor + batch_size).min(remaining.len());
            let batch_started = tokio::time::Instant::now();

            let op = &op;
            let futures = remaining[cursor..end].iter().cloned().enumerate().map(|(i, item)| {
                let index = offset + cursor + i;
                let counter = Arc::clone(&counter);
                let progress = options.progress.clone();
                async move {
                    let outcome = op(item).await;
                    let processed = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(progress) = progress {
                        progress(processed, total);
                    }
                    (index, outcome)
                }
            });

            match AssertUnwindSafe(join_all(futures)).catch_unwind().await {
                Ok(settled) => {
                    for (index, outcome) in settled {
                        match outcome {
                            Ok(value) => results[index] = Some(value),
                            Err(e) => {
                                debug!(job = %options.job, index, error = %e, "Item failed");
                                errors.push(ItemError {
                                    index,
                                    message: e.to_string(),
                                });
                            }
                        }
                    }
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(job = %options.job, batch = batch_index, error = %message, "Batch dispatch failed, skipping batch");
                    for index in (offset + cursor)..(offset + end) {
                        errors.push(ItemError {
                            index,
                            message: format!("Batch {} failed: {}", batch_index, message),
                        });
                    }
                    counter.store(offset + end, Ordering::SeqCst);
                    batch_errors.push(BatchError {
                        batch_index,
                        message,
                    });
                }
            }

            let size = end - cursor;
            cursor = end;
            since_checkpoint += size;

            timings.push(BatchTiming {
                index: batch_index,
                size,
                duration_ms: batch_started.elapsed().as_millis() as u64,
            });

            debug!(
                job = %options.job,
                batch = batch_index,
                size,
                processed = offset + cursor,
                total,
                "Batch completed"
            );

            if let Some(bus) = &self.event_bus {
                bus.emit_lossy(RepairEvent::BatchCompleted {
                    job: options.job.clone(),
                    batch_index,
                    batch_size: size,
                    processed: offset + cursor,
                    total,
                    timestamp: Utc::now(),
                });
            }

            let interval = self.settings.checkpoint_interval;
            if interval > 0 && since_checkpoint >= interval && cursor < remaining.len() {
                self.save_checkpoint(&options.job, total, offset + cursor, &remaining[cursor..], &results, &errors)
                    .await?;
                since_checkpoint = 0;
            }
        }

        if !stopped {
            self.store.remove(&checkpoint_key(&options.job)).await?;
        }

        errors.sort_by_key(|e| e.index);
        let processed = offset + cursor;
        let (mut succeeded, mut failed, mut unknown) = (0, errors.len(), 0);
        for result in results.iter().flatten() {
            match result.verdict() {
                Tristate::True => succeeded += 1,
                Tristate::False => failed += 1,
                Tristate::Unknown => unknown += 1,
            }
        }

        let duration_ms = run_started.elapsed().as_millis() as u64;
        info!(
            job = %options.job,
            processed,
            total,
            succeeded,
            failed,
            unknown,
            batches = timings.len(),
            duration_ms,
            stopped,
            "Batch run finished"
        );

        Ok(BatchSummary {
            job: options.job.clone(),
            total,
            processed,
            succeeded,
            failed,
            unknown,
            results,
            errors,
            batch_errors,
            stopped,
            resumed,
            timing: TimingMetadata {
                started_at,
                finished_at: Utc::now(),
                duration_ms,
                batches: timings,
            },
        })
    }

    async fn save_checkpoint<I, O>(
        &self,
        job: &str,
        total: usize,
        processed: usize,
        remaining: &[I],
        results: &[Option<O>],
        errors: &[ItemError],
    ) -> Result<()>
    where
        I: Clone + Serialize,
        O: Clone + Serialize,
    {
        let checkpoint = Checkpoint {
            job: job.to_string(),
            total_items: total,
            processed_count: processed,
            remaining_items: remaining.to_vec(),
            partial_results: results.to_vec(),
            partial_errors: errors.to_vec(),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&checkpoint).map_err(cite_common::Error::from)?;
        self.store.put(&checkpoint_key(job), value).await?;

        debug!(job, processed, remaining = remaining.len(), "Checkpoint saved");
        if let Some(bus) = &self.event_bus {
            bus.emit_lossy(RepairEvent::CheckpointSaved {
                job: job.to_string(),
                processed,
                remaining: remaining.len(),
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
