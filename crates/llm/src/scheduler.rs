//! Batch scheduler for model calls.
//!
//! Requests are sent over a bounded channel to a single actor task that
//! owns the pending queue and the flush deadline. A batch is cut when the
//! queue reaches the current batch size or when the deadline set by the
//! first queued request passes. Every request in a batch is dispatched
//! concurrently and resolves its own reply channel, so one failed call
//! never fails its siblings.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::adaptive::{AdaptiveConfig, AdaptiveController, BatchSample};
use crate::client::{ModelClient, SamplingParams};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("model call failed: {0:#}")]
    Model(anyhow::Error),

    #[error("scheduler stopped before the request completed")]
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub batch_size: usize,
    pub max_wait_ms: u64,
    pub queue_capacity: usize,
    pub adaptive: AdaptiveConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 10,
            max_wait_ms: 500,
            queue_capacity: 1024,
            adaptive: AdaptiveConfig::default(),
        }
    }
}

struct BatchRequest {
    prompt: String,
    history: Vec<String>,
    params: SamplingParams,
    reply: oneshot::Sender<Result<String, SchedulerError>>,
}

enum Command {
    Submit(BatchRequest),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct SharedStats {
    batch_size: AtomicUsize,
    batches_dispatched: AtomicU64,
    requests_dispatched: AtomicU64,
    failed_requests: AtomicU64,
    window_latency_us: AtomicU64,
    window_error_rate_bits: AtomicU64,
    window_len: AtomicUsize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub batching_enabled: bool,
    pub adaptive: bool,
    pub batch_size: usize,
    pub batches_dispatched: u64,
    pub requests_dispatched: u64,
    pub failed_requests: u64,
    pub window_avg_latency_ms: Option<f64>,
    pub window_error_rate: Option<f64>,
}

pub struct BatchScheduler {
    client: Arc<dyn ModelClient>,
    tx: Option<mpsc::Sender<Command>>,
    stats: Arc<SharedStats>,
    adaptive: bool,
}

impl BatchScheduler {
    /// Build a scheduler. With batching enabled this spawns the actor task,
    /// so it must be called inside a tokio runtime.
    pub fn new(client: Arc<dyn ModelClient>, config: SchedulerConfig) -> Self {
        let stats = Arc::new(SharedStats::default());
        let batch_size = config.batch_size.max(1);
        stats.batch_size.store(batch_size, Ordering::Relaxed);

        if !config.enabled {
            return Self {
                client,
                tx: None,
                stats,
                adaptive: false,
            };
        }

        let controller = config
            .adaptive
            .enabled
            .then(|| AdaptiveController::new(batch_size, config.adaptive.clone()));
        let adaptive = controller.is_some();
        if let Some(ctrl) = &controller {
            stats.batch_size.store(ctrl.batch_size(), Ordering::Relaxed);
        }

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let actor = Actor {
            client: Arc::clone(&client),
            rx,
            queue: Vec::new(),
            deadline: None,
            max_wait: Duration::from_millis(config.max_wait_ms),
            batch_size: stats.batch_size.load(Ordering::Relaxed),
            controller,
            in_flight: JoinSet::new(),
            stats: Arc::clone(&stats),
        };
        tokio::spawn(actor.run());

        Self {
            client,
            tx: Some(tx),
            stats,
            adaptive,
        }
    }

    pub fn is_batching(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue one generation request and wait for its result.
    pub async fn submit(
        &self,
        prompt: &str,
        history: &[String],
        params: &SamplingParams,
    ) -> Result<String, SchedulerError> {
        let Some(tx) = &self.tx else {
            self.stats.requests_dispatched.fetch_add(1, Ordering::Relaxed);
            let result = self.client.generate(prompt, history, params).await;
            if result.is_err() {
                self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
            }
            return result.map_err(SchedulerError::Model);
        };

        let (reply, response) = oneshot::channel();
        let request = BatchRequest {
            prompt: prompt.to_string(),
            history: history.to_vec(),
            params: params.clone(),
            reply,
        };

        tx.send(Command::Submit(request))
            .await
            .map_err(|_| SchedulerError::Closed)?;

        response.await.map_err(|_| SchedulerError::Closed)?
    }

    /// Dispatch everything still queued and wait for all in-flight batches.
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (ack, done) = oneshot::channel();
        if tx.send(Command::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    pub fn batch_size(&self) -> usize {
        self.stats.batch_size.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SchedulerStats {
        let window_len = self.stats.window_len.load(Ordering::Relaxed);
        let windowed = self.adaptive && window_len > 0;
        SchedulerStats {
            batching_enabled: self.is_batching(),
            adaptive: self.adaptive,
            batch_size: self.batch_size(),
            batches_dispatched: self.stats.batches_dispatched.load(Ordering::Relaxed),
            requests_dispatched: self.stats.requests_dispatched.load(Ordering::Relaxed),
            failed_requests: self.stats.failed_requests.load(Ordering::Relaxed),
            window_avg_latency_ms: windowed
                .then(|| self.stats.window_latency_us.load(Ordering::Relaxed) as f64 / 1000.0),
            window_error_rate: windowed.then(|| {
                f64::from_bits(self.stats.window_error_rate_bits.load(Ordering::Relaxed))
            }),
        }
    }
}

struct Actor {
    client: Arc<dyn ModelClient>,
    rx: mpsc::Receiver<Command>,
    queue: Vec<BatchRequest>,
    deadline: Option<Instant>,
    max_wait: Duration,
    batch_size: usize,
    controller: Option<AdaptiveController>,
    in_flight: JoinSet<BatchSample>,
    stats: Arc<SharedStats>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Submit(request)) => self.enqueue(request),
                    Some(Command::Flush(ack)) => {
                        self.drain_queue();
                        self.wait_in_flight().await;
                        let _ = ack.send(());
                    }
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.drain_queue();
                }
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    self.on_batch_done(joined);
                }
            }
        }

        // All senders are gone: finish what is left before exiting.
        self.drain_queue();
        self.wait_in_flight().await;
        debug!("Batch scheduler stopped");
    }

    fn enqueue(&mut self, request: BatchRequest) {
        self.queue.push(request);
        if self.queue.len() >= self.batch_size {
            self.drain_queue();
        } else if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.max_wait);
        }
    }

    fn drain_queue(&mut self) {
        self.deadline = None;
        while !self.queue.is_empty() {
            let take = self.batch_size.min(self.queue.len());
            let batch: Vec<BatchRequest> = self.queue.drain(..take).collect();
            self.dispatch(batch);
        }
    }

    fn dispatch(&mut self, batch: Vec<BatchRequest>) {
        let requests = batch.len();
        self.stats.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        self.stats
            .requests_dispatched
            .fetch_add(requests as u64, Ordering::Relaxed);
        debug!(requests, batch_size = self.batch_size, "Dispatching batch");

        let client = Arc::clone(&self.client);
        let stats = Arc::clone(&self.stats);
        self.in_flight.spawn(async move {
            let started = Instant::now();
            let outcomes = join_all(batch.into_iter().map(|request| {
                let client = Arc::clone(&client);
                async move {
                    let result = client
                        .generate(&request.prompt, &request.history, &request.params)
                        .await;
                    let failed = result.is_err();
                    if let Err(e) = &result {
                        warn!(error = %e, "Batch request failed");
                    }
                    // The caller may have stopped waiting; nothing to do then.
                    let _ = request.reply.send(result.map_err(SchedulerError::Model));
                    failed
                }
            }))
            .await;

            let failures = outcomes.into_iter().filter(|failed| *failed).count();
            stats
                .failed_requests
                .fetch_add(failures as u64, Ordering::Relaxed);
            BatchSample {
                duration: started.elapsed(),
                requests,
                failures,
            }
        });
    }

    async fn wait_in_flight(&mut self) {
        while let Some(joined) = self.in_flight.join_next().await {
            self.on_batch_done(joined);
        }
    }

    fn on_batch_done(&mut self, joined: Result<BatchSample, JoinError>) {
        let sample = match joined {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "Batch task aborted");
                return;
            }
        };

        let Some(controller) = self.controller.as_mut() else {
            return;
        };

        if let Some(new_size) = controller.record(sample) {
            self.batch_size = new_size;
            self.stats.batch_size.store(new_size, Ordering::Relaxed);
        }

        if let Some(avg) = controller.average_latency() {
            self.stats
                .window_latency_us
                .store(avg.as_micros() as u64, Ordering::Relaxed);
        }
        self.stats
            .window_error_rate_bits
            .store(controller.error_rate().to_bits(), Ordering::Relaxed);
        self.stats
            .window_len
            .store(controller.window_len(), Ordering::Relaxed);
    }
}
