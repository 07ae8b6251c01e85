//! Worker pool: claims work by lane priority, runs callbacks, settles
//! outcomes with the broker and result store.

use super::context::TaskContext;
use super::handler::{Handler, HandlerRegistry, TaskFailure, TaskOutcome};
use crate::broadcast::EventSink;
use crate::broker::{Broker, Delivery};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{Event, Lane, TaskResult, WorkItem};
use crate::routing::{KindPolicy, RoutingTable};
use crate::store::ResultStore;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, info, warn};

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Lanes served and concurrent slots per lane.
    pub lanes: Vec<(Lane, usize)>,
    /// How long a claimed item stays hidden from other workers. Must exceed
    /// the longest hard timeout of any served kind.
    pub visibility_timeout: Duration,
    /// Idle wait between claim rounds when nothing is ready.
    pub poll_interval: Duration,
    /// Claims before the pool drains and asks to be rebuilt; 0 disables.
    pub max_items: u64,
    /// Retry `Fatal` failures like retryable ones.
    pub retry_fatal: bool,
    /// Ceiling for the claim-error backoff.
    pub max_claim_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lanes: Lane::ALL.iter().map(|lane| (*lane, 1)).collect(),
            visibility_timeout: Duration::from_secs(360),
            poll_interval: Duration::from_secs(1),
            max_items: 100,
            retry_fatal: true,
            max_claim_backoff: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lanes: config.lane_concurrency.clone(),
            visibility_timeout: config.visibility_timeout,
            poll_interval: config.poll_interval,
            max_items: config.worker_max_items,
            ..Self::default()
        }
    }

    fn served_lanes(&self) -> Vec<Lane> {
        self.lanes.iter().map(|(lane, _)| *lane).collect()
    }
}

/// Why [`WorkerPool::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolExit {
    /// `shutdown` was called.
    Shutdown,
    /// `max_items` reached; build a fresh pool and run again.
    Recycle,
}

pub struct WorkerPool<S> {
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
    events: Arc<dyn EventSink>,
    routes: Arc<RoutingTable>,
    handlers: Arc<HandlerRegistry<S>>,
    state: Arc<S>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
}

impl<S> Clone for WorkerPool<S> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            store: Arc::clone(&self.store),
            events: Arc::clone(&self.events),
            routes: Arc::clone(&self.routes),
            handlers: Arc::clone(&self.handlers),
            state: Arc::clone(&self.state),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
            stopping: Arc::clone(&self.stopping),
        }
    }
}

enum Settled {
    Succeeded,
    Retrying,
    Failed,
}

impl Settled {
    fn as_str(&self) -> &'static str {
        match self {
            Settled::Succeeded => "succeeded",
            Settled::Retrying => "retrying",
            Settled::Failed => "failed",
        }
    }
}

impl<S: Send + Sync + 'static> WorkerPool<S> {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn ResultStore>,
        events: Arc<dyn EventSink>,
        routes: Arc<RoutingTable>,
        handlers: Arc<HandlerRegistry<S>>,
        state: Arc<S>,
        mut config: WorkerConfig,
    ) -> Self {
        config.lanes.sort_by_key(|(lane, _)| *lane);
        Self {
            broker,
            store,
            events,
            routes,
            handlers,
            state,
            config,
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal the pool to stop claiming. In-flight tasks finish first.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Startup checks: lanes are served, every served kind has a handler,
    /// and no hard timeout outlives the visibility timeout.
    pub fn validate(&self) -> Result<()> {
        let lanes = self.config.served_lanes();
        if lanes.is_empty() {
            return Err(Error::Config("worker serves no lanes".to_string()));
        }
        if let Some((lane, _)) = self.config.lanes.iter().find(|(_, slots)| *slots == 0) {
            return Err(Error::Config(format!("lane {lane} has zero slots")));
        }
        self.handlers.validate(&self.routes, &lanes)?;

        let longest = self.routes.max_timeout(&lanes);
        if self.config.visibility_timeout <= longest {
            return Err(Error::Config(format!(
                "visibility timeout {}s must exceed the longest task timeout {}s",
                self.config.visibility_timeout.as_secs(),
                longest.as_secs()
            )));
        }
        Ok(())
    }

    /// Run until shutdown or until `max_items` claims have been made.
    /// Either way, in-flight tasks are awaited before returning.
    pub async fn run(&self) -> Result<PoolExit> {
        self.validate()?;

        let slots: Vec<(Lane, Arc<Semaphore>)> = self
            .config
            .lanes
            .iter()
            .map(|(lane, n)| (*lane, Arc::new(Semaphore::new(*n))))
            .collect();
        let mut running = JoinSet::new();
        let mut claimed: u64 = 0;
        let mut backoff = self.config.poll_interval;

        info!(lanes = ?self.config.lanes, max_items = self.config.max_items, "worker pool started");

        let exit = loop {
            if self.stopping.load(Ordering::SeqCst) {
                break PoolExit::Shutdown;
            }
            if self.config.max_items > 0 && claimed >= self.config.max_items {
                break PoolExit::Recycle;
            }
            while let Some(res) = running.try_join_next() {
                log_join(res);
            }

            let wait = match self.claim_next(&slots).await {
                Ok(Some((delivery, permit))) => {
                    claimed += 1;
                    backoff = self.config.poll_interval;
                    let pool = self.clone();
                    running.spawn(async move {
                        pool.process(delivery).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => self.config.poll_interval,
                Err(e) => {
                    warn!(backoff_ms = backoff.as_millis() as u64, "claim failed: {e}");
                    let wait = backoff;
                    backoff = (backoff * 2).min(self.config.max_claim_backoff);
                    wait
                }
            };

            // Wake on shutdown, the poll timer, or a finished task freeing a slot.
            tokio::select! {
                _ = self.shutdown.notified() => {}
                _ = tokio::time::sleep(wait) => {}
                Some(res) = running.join_next(), if !running.is_empty() => log_join(res),
            }
        };

        info!(?exit, in_flight = running.len(), claimed, "worker pool draining");
        while let Some(res) = running.join_next().await {
            log_join(res);
        }
        Ok(exit)
    }

    /// Claim from the highest-priority lane with ready work. A higher lane
    /// with ready work but no free slot blocks every lane below it.
    async fn claim_next(
        &self,
        slots: &[(Lane, Arc<Semaphore>)],
    ) -> Result<Option<(Delivery, OwnedSemaphorePermit)>> {
        for (lane, slot) in slots {
            match Arc::clone(slot).try_acquire_owned() {
                Ok(permit) => {
                    if let Some(delivery) = self
                        .broker
                        .claim(*lane, self.config.visibility_timeout)
                        .await?
                    {
                        return Ok(Some((delivery, permit)));
                    }
                }
                Err(_) => {
                    if self.broker.has_ready(*lane).await? {
                        return Ok(None);
                    }
                }
            }
        }
        Ok(None)
    }

    async fn process(&self, delivery: Delivery) {
        let item = &delivery.item;
        let span = start_task_span(&item.kind, &item.id, item.lane, item.attempt);
        let kind = item.kind.clone();
        let task_id = item.id;

        let settled = self
            .execute(&delivery, &span)
            .instrument(span.clone())
            .await;

        match settled {
            Ok(settled) => {
                metrics::task_outcomes().add(
                    1,
                    &[
                        KeyValue::new("kind", kind),
                        KeyValue::new("outcome", settled.as_str()),
                    ],
                );
            }
            Err(e) => {
                // Not acked: the broker redelivers after the visibility timeout.
                error!(%task_id, kind = %kind, "could not settle task, leaving for redelivery: {e}");
            }
        }
    }

    async fn execute(&self, delivery: &Delivery, span: &Span) -> Result<Settled> {
        let item = &delivery.item;

        if delivery.is_redelivery() {
            info!(read_ct = delivery.read_ct, "redelivered task, running again");
        }

        let policy = match self.routes.policy(&item.kind) {
            Ok(policy) => policy.clone(),
            Err(e) => {
                warn!("dropping unroutable task: {e}");
                return self.settle_failed(delivery, span, &e.to_string()).await;
            }
        };
        let Some(handler) = self.handlers.get(&item.kind) else {
            let msg = format!("no handler for task kind {:?}", item.kind);
            warn!("{msg}");
            return self.settle_failed(delivery, span, &msg).await;
        };

        record_state_transition(span, "pending", "started");
        if let Err(e) = self.store.put(&TaskResult::started(item)).await {
            warn!("could not record started state: {e}");
        }
        self.emit(Event::started(item)).await;

        let began = Instant::now();
        let outcome = self.invoke(handler, &policy, item).await;
        metrics::task_duration().record(
            began.elapsed().as_secs_f64(),
            &[KeyValue::new("kind", item.kind.clone())],
        );

        match outcome {
            Ok(payload) => {
                self.store
                    .put(&TaskResult::succeeded(item, payload.clone()))
                    .await?;
                record_state_transition(span, "started", "succeeded");
                self.emit(Event::completed(item, payload)).await;
                self.broker.ack(delivery).await?;
                Ok(Settled::Succeeded)
            }
            Err(failure) => {
                let may_retry = self.config.retry_fatal || failure.is_retryable();
                if may_retry && !item.is_last_attempt() {
                    self.settle_retry(delivery, span, &policy, &failure).await
                } else {
                    self.settle_failed(delivery, span, failure.message()).await
                }
            }
        }
    }

    /// Run the callback in its own task under the hard timeout. A panic or
    /// an overrun becomes an ordinary failure of this attempt.
    async fn invoke(
        &self,
        handler: Arc<dyn Handler<S>>,
        policy: &KindPolicy,
        item: &WorkItem,
    ) -> TaskOutcome {
        let ctx = TaskContext::new(
            item.clone(),
            Instant::now() + policy.soft_timeout,
            Arc::clone(&self.events),
        );
        let state = Arc::clone(&self.state);
        let args = item.args.clone();
        let mut task = tokio::spawn(async move { handler.run(state, ctx, args).await });

        match tokio::time::timeout(policy.timeout, &mut task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) if e.is_panic() => Err(TaskFailure::fatal("task panicked")),
            Ok(Err(_)) => Err(TaskFailure::retryable("task was cancelled")),
            Err(_) => {
                task.abort();
                Err(TaskFailure::retryable(format!(
                    "timed out after {}s",
                    policy.timeout.as_secs()
                )))
            }
        }
    }

    async fn settle_retry(
        &self,
        delivery: &Delivery,
        span: &Span,
        policy: &KindPolicy,
        failure: &TaskFailure,
    ) -> Result<Settled> {
        let item = &delivery.item;
        let next = item.next_attempt();
        let delay = policy.retry_delay(item.attempt);

        self.store.put(&TaskResult::pending(&next)).await?;
        record_state_transition(span, "started", "retrying");
        warn!(
            error = failure.message(),
            next_attempt = next.attempt,
            delay_secs = delay.as_secs(),
            "attempt failed, retrying"
        );
        // Published before the requeue so it precedes the next attempt's
        // `started` even with a zero delay.
        self.emit(Event::retrying(item, failure.message())).await;

        if let Err(e) = self.broker.requeue(delivery, &next, delay).await {
            // The broker still holds this attempt; put the store back in step
            // with what it will redeliver.
            if let Err(restore) = self.store.put(&TaskResult::started(item)).await {
                warn!("could not restore started state after failed requeue: {restore}");
            }
            return Err(e);
        }
        Ok(Settled::Retrying)
    }

    async fn settle_failed(&self, delivery: &Delivery, span: &Span, error: &str) -> Result<Settled> {
        let item = &delivery.item;
        self.store.put(&TaskResult::failed(item, error)).await?;
        record_state_transition(span, "started", "failed");
        warn!(error, "task failed");
        self.emit(Event::failed(item, error)).await;
        self.broker.ack(delivery).await?;
        Ok(Settled::Failed)
    }

    async fn emit(&self, event: Event) {
        let status = event.status;
        if let Err(e) = self.events.emit(event).await {
            warn!(%status, "event publish failed: {e}");
        }
    }
}

fn log_join(res: std::result::Result<(), JoinError>) {
    match res {
        Ok(()) => {}
        Err(e) if e.is_panic() => error!("task supervisor panicked: {e}"),
        Err(e) => debug!("task supervisor ended: {e}"),
    }
}
