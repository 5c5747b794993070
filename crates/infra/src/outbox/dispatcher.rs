//! Outbox dispatcher: background workers that claim, deliver and complete messages.
//!
//! ## Cycle
//!
//! Each cycle runs in one unit of work:
//!
//! 1. claim up to `batch_size` due messages;
//! 2. deliver each one through the handler registered for its kind;
//! 3. mark the delivered ones `SUCCESS`;
//! 4. commit.
//!
//! A failed message is simply left out of step 3. It stays `IN_PROGRESS` and
//! becomes due again once its lease expires. A failing claim, mark or commit
//! rolls the whole cycle back.
//!
//! ## Workers
//!
//! Workers loop on cycles. They poll again immediately after a cycle that
//! delivered something and sleep `poll_interval` otherwise, so a batch that
//! only failed does not spin against a broken endpoint. Cancellation is only
//! observed between cycles, so a stopping worker always finishes the cycle it
//! is in.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::message::OutboxMessage;
use super::outcome::{DeliveryOutcome, DeliveryStatus, LogSink, OutcomeSink};
use super::registry::HandlerRegistry;
use super::store::{OutboxError, OutboxStore};
use crate::db::{Transactor, with_transaction};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of concurrent worker tasks
    pub workers: usize,
    /// Maximum messages claimed per cycle
    pub batch_size: usize,
    /// Sleep after a cycle that delivered nothing
    pub poll_interval: Duration,
    /// How long a claim stays exclusive
    pub lease_ttl: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            lease_ttl: Duration::from_secs(30),
            name: "outbox-dispatcher".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Runtime on/off toggle. A disabled dispatcher keeps its workers but claims nothing.
#[derive(Debug, Clone)]
pub struct DispatcherSwitch(Arc<AtomicBool>);

impl DispatcherSwitch {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }

    pub fn enable(&self) {
        self.set(true);
    }

    pub fn disable(&self) {
        self.set(false);
    }
}

impl Default for DispatcherSwitch {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Result of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub delivered: usize,
}

impl CycleReport {
    pub fn failed(&self) -> usize {
        self.claimed - self.delivered
    }

    /// Whether the worker should poll again without sleeping.
    pub fn is_productive(&self) -> bool {
        self.delivered > 0
    }
}

/// Claims due outbox messages and hands them to their delivery handlers.
pub struct OutboxDispatcher<T, S> {
    transactor: Arc<T>,
    store: Arc<S>,
    registry: Arc<dyn HandlerRegistry>,
    sink: Arc<dyn OutcomeSink>,
    switch: DispatcherSwitch,
    config: DispatcherConfig,
}

impl<T, S> Clone for OutboxDispatcher<T, S> {
    fn clone(&self) -> Self {
        Self {
            transactor: self.transactor.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            sink: self.sink.clone(),
            switch: self.switch.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T, S> OutboxDispatcher<T, S>
where
    T: Transactor + 'static,
    S: OutboxStore<Tx = T::Tx> + 'static,
{
    pub fn new(
        transactor: Arc<T>,
        store: Arc<S>,
        registry: Arc<dyn HandlerRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            transactor,
            store,
            registry,
            sink: Arc::new(LogSink),
            switch: DispatcherSwitch::default(),
            config,
        }
    }

    /// Replace the default [`LogSink`].
    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Share an existing switch (e.g. one exposed over HTTP).
    pub fn with_switch(mut self, switch: DispatcherSwitch) -> Self {
        self.switch = switch;
        self
    }

    pub fn switch(&self) -> &DispatcherSwitch {
        &self.switch
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run one cycle in its own transaction.
    ///
    /// Outcomes are emitted as messages are processed, before the commit. If
    /// the commit then fails, the delivered messages are redelivered later.
    pub async fn run_cycle(&self) -> Result<CycleReport, OutboxError> {
        let this = self.clone();
        with_transaction(self.transactor.as_ref(), None, move |tx| {
            Box::pin(async move { this.process_batch(tx).await })
        })
        .await
    }

    /// Claim, deliver and complete one batch on the caller's transaction.
    pub async fn process_batch(&self, tx: &mut T::Tx) -> Result<CycleReport, OutboxError> {
        let messages = self
            .store
            .claim_batch(tx, self.config.batch_size, self.config.lease_ttl)
            .await?;

        let mut report = CycleReport {
            claimed: messages.len(),
            delivered: 0,
        };
        if messages.is_empty() {
            return Ok(report);
        }

        let mut delivered = Vec::with_capacity(messages.len());
        for message in messages {
            let outcome = self.deliver(&message).await;
            self.sink.record(&outcome);
            if outcome.is_delivered() {
                delivered.push(message.idempotency_key);
            }
        }

        self.store.mark_complete(tx, &delivered).await?;
        report.delivered = delivered.len();
        Ok(report)
    }

    async fn deliver(&self, message: &OutboxMessage) -> DeliveryOutcome {
        let started = Instant::now();
        let status = match self.registry.resolve(message.kind) {
            Err(err) => DeliveryStatus::UnknownKind(err.to_string()),
            Ok(handler) => match handler.deliver(&message.payload).await {
                Ok(()) => DeliveryStatus::Delivered,
                Err(err) => DeliveryStatus::Failed(err.to_string()),
            },
        };

        DeliveryOutcome {
            idempotency_key: message.idempotency_key.clone(),
            kind: message.kind,
            status,
            latency: started.elapsed(),
        }
    }

    /// Spawn `workers` tasks with a fresh cancellation token.
    pub fn start(&self) -> DispatcherHandle {
        self.start_with_token(&CancellationToken::new())
    }

    /// Spawn `workers` tasks that also stop when `parent` is cancelled.
    pub fn start_with_token(&self, parent: &CancellationToken) -> DispatcherHandle {
        let token = parent.child_token();
        let workers = self.config.workers.max(1);

        info!(
            dispatcher = %self.config.name,
            workers,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            lease_ttl_ms = self.config.lease_ttl.as_millis() as u64,
            "starting outbox dispatcher"
        );

        let joins = (0..workers)
            .map(|worker| {
                let this = self.clone();
                let token = token.clone();
                tokio::spawn(async move { this.worker_loop(worker, token).await })
            })
            .collect();

        DispatcherHandle {
            token,
            switch: self.switch.clone(),
            joins,
        }
    }

    async fn worker_loop(self, worker: usize, token: CancellationToken) {
        debug!(dispatcher = %self.config.name, worker, "outbox worker started");

        loop {
            if token.is_cancelled() {
                break;
            }

            let busy = if self.switch.is_enabled() {
                match self.run_cycle().await {
                    Ok(report) => {
                        if report.claimed > 0 {
                            debug!(
                                worker,
                                claimed = report.claimed,
                                delivered = report.delivered,
                                "outbox cycle finished"
                            );
                        }
                        report.is_productive()
                    }
                    Err(err) => {
                        error!(worker, error = %err, "outbox cycle failed");
                        false
                    }
                }
            } else {
                false
            };

            if !busy {
                tokio::select! {
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                    () = token.cancelled() => break,
                }
            }
        }

        debug!(dispatcher = %self.config.name, worker, "outbox worker stopped");
    }
}

/// Handle to running dispatcher workers.
#[derive(Debug)]
pub struct DispatcherHandle {
    token: CancellationToken,
    switch: DispatcherSwitch,
    joins: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Signal every worker to stop and wait until they have.
    pub async fn shutdown(self) {
        self.token.cancel();
        self.join().await;
    }

    /// Wait for the workers without signalling them.
    pub async fn join(self) {
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "outbox worker terminated abnormally");
            }
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn switch(&self) -> &DispatcherSwitch {
        &self.switch
    }

    pub fn worker_count(&self) -> usize {
        self.joins.len()
    }
}
