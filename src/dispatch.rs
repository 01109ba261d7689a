//! Concurrent batch submission.
//!
//! A fixed pool of workers drains a shared queue of batches. Each worker owns
//! one batch at a time and walks it through submit, retry and backoff until
//! it is Confirmed or Failed. Outcomes flow over a channel to a single
//! collector task, which owns the progress bar and the result list.

use async_trait::async_trait;
use futures::future::join_all;
use governor::{
    clock::DefaultClock,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use std::{collections::VecDeque, num::NonZeroU32, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{batch::TransferBatch, config::DistributionConfig, error::SubmitError};

pub type SubmissionLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[async_trait]
pub trait SubmissionEndpoint: Send + Sync {
    /// Submits the batch as one transaction and waits for confirmation.
    async fn submit(&self, batch: &TransferBatch) -> Result<Signature, SubmitError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BatchOutcome {
    Confirmed { signature: String },
    Failed { reason: String },
}

impl BatchOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, BatchOutcome::Confirmed { .. })
    }

    pub fn signature(&self) -> Option<&str> {
        match self {
            BatchOutcome::Confirmed { signature } => Some(signature),
            BatchOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub batch_id: usize,
    pub recipients: Vec<Pubkey>,
    /// Base units the batch moves if it lands.
    pub amount: u64,
    pub attempts: u32,
    pub outcome: BatchOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// One entry per dispatched batch, ordered by batch id.
    pub results: Vec<BatchResult>,
}

impl DispatchReport {
    pub fn confirmed(&self) -> impl Iterator<Item = &BatchResult> {
        self.results.iter().filter(|r| r.outcome.is_confirmed())
    }

    pub fn failed(&self) -> impl Iterator<Item = &BatchResult> {
        self.results.iter().filter(|r| !r.outcome.is_confirmed())
    }

    pub fn confirmed_amount(&self) -> u64 {
        self.confirmed().map(|r| r.amount).sum()
    }

    pub fn signatures(&self) -> Vec<&str> {
        self.results.iter().filter_map(|r| r.outcome.signature()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    /// Bound on one submit-and-confirm attempt; a hung call counts as a
    /// transient failure.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DistributionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.retry_backoff(),
            attempt_timeout: config.submit_timeout(),
        }
    }
}

/// What a worker reports back to the collector.
#[derive(Debug)]
enum DispatchMsg {
    Retrying {
        batch_id: usize,
        attempt: u32,
        error: SubmitError,
    },
    Finished(BatchResult),
}

struct WorkerContext {
    endpoint: Arc<dyn SubmissionEndpoint>,
    policy: RetryPolicy,
    limiter: Option<Arc<SubmissionLimiter>>,
}

pub struct Dispatcher {
    context: Arc<WorkerContext>,
    concurrency: usize,
    show_progress: bool,
}

impl Dispatcher {
    pub fn new(endpoint: Arc<dyn SubmissionEndpoint>, config: &DistributionConfig) -> Self {
        let limiter = NonZeroU32::new(config.rate_limit)
            .map(|rps| Arc::new(RateLimiter::direct(Quota::per_second(rps))));
        Self {
            context: Arc::new(WorkerContext {
                endpoint,
                policy: RetryPolicy::from_config(config),
                limiter,
            }),
            concurrency: config.concurrency.max(1),
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Returns once every batch is Confirmed or Failed.
    pub async fn dispatch(&self, batches: Vec<TransferBatch>) -> DispatchReport {
        if batches.is_empty() {
            return DispatchReport::default();
        }

        let expected: Vec<BatchResult> = batches
            .iter()
            .map(|b| BatchResult {
                batch_id: b.id,
                recipients: b.recipients().copied().collect(),
                amount: b.total_amount(),
                attempts: 0,
                outcome: BatchOutcome::Failed {
                    reason: "batch never reached a worker".to_string(),
                },
            })
            .collect();
        let total_recipients: usize = expected.iter().map(|r| r.recipients.len()).sum();
        let workers = self.concurrency.min(batches.len());
        info!(batches = batches.len(), workers, "dispatching");

        let pb = if self.show_progress {
            ProgressBar::new(total_recipients as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} Transferring | ETA: {eta} | Speed: {per_sec}")
        {
            pb.set_style(style.progress_chars("##-"));
        }

        let queue = Arc::new(Mutex::new(VecDeque::from(batches)));
        let (tx, rx) = mpsc::unbounded_channel::<DispatchMsg>();
        let collector = tokio::spawn(collect(rx, pb.clone()));

        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let queue = queue.clone();
                let context = self.context.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    loop {
                        // lock released before the batch is worked on
                        let next = queue.lock().await.pop_front();
                        let Some(batch) = next else { break };
                        debug!(worker, batch = batch.id, "batch picked up");
                        let result = submit_with_retry(&context, &batch, &tx).await;
                        if tx.send(DispatchMsg::Finished(result)).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();
        drop(tx);

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                error!(error = %e, "dispatch worker aborted");
            }
        }

        let finished = match collector.await {
            Ok(results) => results,
            Err(e) => {
                error!(error = %e, "dispatch collector aborted");
                Vec::new()
            }
        };

        // Any batch without a reported result is Failed, never dropped.
        let mut results = expected;
        for result in finished {
            if let Some(slot) = results.iter_mut().find(|r| r.batch_id == result.batch_id) {
                *slot = result;
            }
        }
        results.sort_by_key(|r| r.batch_id);

        let report = DispatchReport { results };
        let confirmed = report.confirmed().count();
        let failed = report.results.len() - confirmed;
        pb.finish_with_message(format!("{} confirmed, {} failed", confirmed, failed));
        info!(confirmed, failed, amount = report.confirmed_amount(), "dispatch complete");
        report
    }
}

async fn submit_with_retry(
    context: &WorkerContext,
    batch: &TransferBatch,
    events: &mpsc::UnboundedSender<DispatchMsg>,
) -> BatchResult {
    let policy = context.policy;
    let mut attempt = 0;
    let outcome = loop {
        attempt += 1;
        if let Some(limiter) = &context.limiter {
            limiter.until_ready().await;
        }

        let submitted = match timeout(policy.attempt_timeout, context.endpoint.submit(batch)).await {
            Ok(result) => result,
            Err(_) => Err(SubmitError::Transient(format!(
                "no confirmation within {}s",
                policy.attempt_timeout.as_secs()
            ))),
        };

        match submitted {
            Ok(signature) => {
                break BatchOutcome::Confirmed {
                    signature: signature.to_string(),
                }
            }
            Err(error) if error.is_retryable() && attempt < policy.max_attempts => {
                let _ = events.send(DispatchMsg::Retrying {
                    batch_id: batch.id,
                    attempt,
                    error,
                });
                sleep(policy.backoff).await;
            }
            Err(error) => {
                break BatchOutcome::Failed {
                    reason: error.to_string(),
                }
            }
        }
    };

    BatchResult {
        batch_id: batch.id,
        recipients: batch.recipients().copied().collect(),
        amount: batch.total_amount(),
        attempts: attempt,
        outcome,
    }
}

/// Single owner of the result list and progress bar.
async fn collect(mut rx: mpsc::UnboundedReceiver<DispatchMsg>, pb: ProgressBar) -> Vec<BatchResult> {
    let mut results = Vec::new();
    while let Some(msg) = rx.recv().await {
        match msg {
            DispatchMsg::Retrying {
                batch_id,
                attempt,
                error,
            } => {
                warn!(batch = batch_id, attempt, %error, "batch attempt failed, retrying");
            }
            DispatchMsg::Finished(result) => {
                pb.inc(result.recipients.len() as u64);
                match &result.outcome {
                    BatchOutcome::Confirmed { signature } => {
                        let short = signature.get(..8).unwrap_or(signature);
                        pb.println(format!(
                            "✅ Confirmed: {} ({} recipients)",
                            short,
                            result.recipients.len()
                        ));
                        info!(batch = result.batch_id, %signature, attempts = result.attempts, "batch confirmed");
                    }
                    BatchOutcome::Failed { reason } => {
                        pb.println(format!("❌ Batch {} failed: {}", result.batch_id, reason));
                        warn!(batch = result.batch_id, attempts = result.attempts, %reason, "batch failed");
                    }
                }
                results.push(result);
            }
        }
    }
    results
}
