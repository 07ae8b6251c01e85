//! Worker pool behavior against the in-memory broker, store and bus.
//!
//! Every test runs on a paused tokio clock, so retry delays and timeouts
//! elapse instantly while their relative timing stays observable.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::Instant;

use taskcast::broadcast::EventBus;
use taskcast::broker::Broker;
use taskcast::error::Error;
use taskcast::model::{Event, EventStatus, Lane, TaskId, TaskResult, TaskStatus, WorkItem};
use taskcast::queue::TaskQueue;
use taskcast::routing::{KindPolicy, RoutingTable};
use taskcast::store::ResultStore;
use taskcast::worker::{
    Handler, HandlerRegistry, PoolExit, TaskContext, TaskFailure, TaskOutcome, WorkerConfig,
    WorkerPool,
};
use tokio::sync::mpsc;

use common::{FlakyStore, OutageBroker};

const VT: Duration = Duration::from_secs(600);

struct Rig {
    broker: Arc<OutageBroker>,
    store: Arc<FlakyStore>,
    bus: Arc<EventBus>,
    routes: Arc<RoutingTable>,
    queue: TaskQueue,
}

impl Rig {
    fn new(routes: RoutingTable) -> Self {
        let broker = Arc::new(OutageBroker::new());
        let store = Arc::new(FlakyStore::new(Duration::from_secs(3600)));
        let bus = Arc::new(EventBus::new());
        let routes = Arc::new(routes);
        let queue = TaskQueue::new(broker.clone(), store.clone(), bus.clone(), routes.clone());
        Self {
            broker,
            store,
            bus,
            routes,
            queue,
        }
    }

    fn pool<S: Send + Sync + 'static>(
        &self,
        handlers: HandlerRegistry<S>,
        state: Arc<S>,
        config: WorkerConfig,
    ) -> WorkerPool<S> {
        WorkerPool::new(
            self.broker.clone(),
            self.store.clone(),
            self.bus.clone(),
            self.routes.clone(),
            Arc::new(handlers),
            state,
            config,
        )
    }
}

fn config(max_items: u64) -> WorkerConfig {
    WorkerConfig {
        lanes: Lane::ALL.iter().map(|lane| (*lane, 1)).collect(),
        visibility_timeout: VT,
        poll_interval: Duration::from_millis(100),
        max_items,
        retry_fatal: true,
        max_claim_backoff: Duration::from_secs(5),
    }
}

fn table(policies: Vec<KindPolicy>) -> RoutingTable {
    let mut table = RoutingTable::empty();
    for p in policies {
        table.insert(p).unwrap();
    }
    table
}

fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

fn statuses(events: &[Event]) -> Vec<(EventStatus, u32, bool)> {
    events.iter().map(|e| (e.status, e.attempt, e.retrying)).collect()
}

/// Records when each attempt started.
#[derive(Default)]
struct Starts(Mutex<Vec<(u32, Instant)>>);

impl Starts {
    fn record(&self, ctx: &TaskContext) {
        self.0.lock().unwrap().push((ctx.attempt(), Instant::now()));
    }

    fn all(&self) -> Vec<(u32, Instant)> {
        self.0.lock().unwrap().clone()
    }
}

// ── Priority ─────────────────────────────────────────────────────────

struct LaneLog {
    broker: Arc<OutageBroker>,
    starts: Mutex<Vec<Lane>>,
    violations: Mutex<Vec<String>>,
}

struct LaneTask(Lane);

#[async_trait]
impl Handler<LaneLog> for LaneTask {
    async fn run(&self, log: Arc<LaneLog>, _ctx: TaskContext, _args: Value) -> TaskOutcome {
        for higher in Lane::ALL.into_iter().filter(|l| *l < self.0) {
            if log.broker.has_ready(higher).await.unwrap() {
                log
                    .violations
                    .lock()
                    .unwrap()
                    .push(format!("{} started while {higher} had ready work", self.0));
            }
        }
        log.starts.lock().unwrap().push(self.0);
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(Value::Null)
    }
}

#[tokio::test(start_paused = true)]
async fn higher_lanes_always_claimed_first() {
    let rig = Rig::new(RoutingTable::builtin());
    for kind in [
        "purge-old-records",
        "run-analysis",
        "generate-embedding",
        "notify-status",
        "purge-old-records",
        "notify-status",
        "generate-embedding",
    ] {
        rig.queue.enqueue(kind, json!({})).await.unwrap();
    }

    let log = Arc::new(LaneLog {
        broker: rig.broker.clone(),
        starts: Mutex::new(Vec::new()),
        violations: Mutex::new(Vec::new()),
    });
    let mut handlers = HandlerRegistry::new();
    handlers
        .register("notify-status", LaneTask(Lane::Urgent))
        .register("generate-embedding", LaneTask(Lane::FastCompute))
        .register("run-analysis", LaneTask(Lane::HeavyCompute))
        .register("purge-old-records", LaneTask(Lane::Background));

    let exit = rig.pool(handlers, log.clone(), config(7)).run().await.unwrap();
    assert_eq!(exit, PoolExit::Recycle);

    let starts = log.starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 7);
    assert_eq!(starts.first(), Some(&Lane::Urgent));
    assert_eq!(starts.last(), Some(&Lane::Background));
    let violations = log.violations.lock().unwrap().clone();
    assert!(violations.is_empty(), "{violations:?}");
    assert_eq!(rig.broker.total().await, 0);
}

#[tokio::test(start_paused = true)]
async fn busy_higher_lane_blocks_lower_lanes() {
    let rig = Rig::new(RoutingTable::builtin());
    rig.queue.enqueue("notify-status", json!({})).await.unwrap();
    rig.queue.enqueue("notify-status", json!({})).await.unwrap();
    rig.queue.enqueue("purge-old-records", json!({})).await.unwrap();

    let log = Arc::new(LaneLog {
        broker: rig.broker.clone(),
        starts: Mutex::new(Vec::new()),
        violations: Mutex::new(Vec::new()),
    });
    let mut handlers = HandlerRegistry::new();
    handlers
        .register("notify-status", LaneTask(Lane::Urgent))
        .register("purge-old-records", LaneTask(Lane::Background));

    let mut cfg = config(3);
    cfg.lanes = vec![(Lane::Urgent, 1), (Lane::Background, 1)];
    rig.pool(handlers, log.clone(), cfg).run().await.unwrap();

    let starts = log.starts.lock().unwrap().clone();
    assert_eq!(starts, vec![Lane::Urgent, Lane::Urgent, Lane::Background]);
}

// ── Retry / backoff ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn always_failing_task_retries_with_exponential_backoff() {
    let rig = Rig::new(table(vec![
        KindPolicy::new("flaky", Lane::FastCompute, 3, Duration::from_secs(10))
            .with_timeout(Duration::from_secs(60)),
    ]));
    let task_id = rig.queue.enqueue("flaky", json!({})).await.unwrap();
    let (_sub, mut rx) = rig.bus.subscribe(task_id).await;

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("flaky", |starts: Arc<Starts>, ctx, _| async move {
        starts.record(&ctx);
        Err::<Value, _>(TaskFailure::retryable("upstream returned 503"))
    });
    let starts = Arc::new(Starts::default());
    rig.pool(handlers, starts.clone(), config(3)).run().await.unwrap();

    let starts = starts.all();
    assert_eq!(
        starts.iter().map(|(a, _)| *a).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    let first_gap = starts[1].1 - starts[0].1;
    let second_gap = starts[2].1 - starts[1].1;
    assert!(first_gap >= Duration::from_secs(10) && first_gap < Duration::from_secs(11), "{first_gap:?}");
    assert!(second_gap >= Duration::from_secs(20) && second_gap < Duration::from_secs(21), "{second_gap:?}");

    let result = rig.store.get(task_id).await.unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.attempt, 2);
    assert_eq!(result.error.as_deref(), Some("upstream returned 503"));

    assert_eq!(
        statuses(&drain(&mut rx)),
        vec![
            (EventStatus::Started, 0, false),
            (EventStatus::Failed, 0, true),
            (EventStatus::Started, 1, false),
            (EventStatus::Failed, 1, true),
            (EventStatus::Started, 2, false),
            (EventStatus::Failed, 2, false),
        ]
    );
    assert_eq!(rig.broker.total().await, 0);
}

#[tokio::test(start_paused = true)]
async fn fatal_failure_goes_terminal_when_not_retried() {
    let rig = Rig::new(table(vec![
        KindPolicy::new("strict", Lane::Urgent, 5, Duration::from_secs(1))
            .with_timeout(Duration::from_secs(60)),
    ]));
    let task_id = rig.queue.enqueue("strict", json!({"id": "nope"})).await.unwrap();

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("strict", |starts: Arc<Starts>, ctx, _| async move {
        starts.record(&ctx);
        Err::<Value, _>(TaskFailure::fatal("invalid arguments"))
    });
    let starts = Arc::new(Starts::default());
    let mut cfg = config(1);
    cfg.retry_fatal = false;
    rig.pool(handlers, starts.clone(), cfg).run().await.unwrap();

    assert_eq!(starts.all().len(), 1);
    let result = rig.store.get(task_id).await.unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("invalid arguments"));
    assert_eq!(rig.broker.total().await, 0);
}

#[tokio::test(start_paused = true)]
async fn fatal_failure_is_retried_by_default() {
    let rig = Rig::new(table(vec![
        KindPolicy::new("strict", Lane::Urgent, 2, Duration::from_secs(1))
            .with_timeout(Duration::from_secs(60)),
    ]));
    rig.queue.enqueue("strict", json!({})).await.unwrap();

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("strict", |starts: Arc<Starts>, ctx, _| async move {
        starts.record(&ctx);
        Err::<Value, _>(TaskFailure::fatal("invalid arguments"))
    });
    let starts = Arc::new(Starts::default());
    rig.pool(handlers, starts.clone(), config(2)).run().await.unwrap();

    assert_eq!(starts.all().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn panicking_callback_fails_the_attempt() {
    let rig = Rig::new(table(vec![
        KindPolicy::new("fragile", Lane::FastCompute, 2, Duration::from_secs(1))
            .with_timeout(Duration::from_secs(60)),
    ]));
    let task_id = rig.queue.enqueue("fragile", json!({})).await.unwrap();
    let (_sub, mut rx) = rig.bus.subscribe(task_id).await;

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("fragile", |_: Arc<()>, ctx: TaskContext, _| async move {
        if ctx.attempt() == 0 {
            panic!("index out of bounds");
        }
        Ok::<_, TaskFailure>(json!({"ok": true}))
    });
    rig.pool(handlers, Arc::new(()), config(2)).run().await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(events[1].status, EventStatus::Failed);
    assert_eq!(events[1].error.as_deref(), Some("task panicked"));
    assert_eq!(rig.store.get(task_id).await.unwrap().status, TaskStatus::Succeeded);
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn embedding_fails_once_then_succeeds() {
    let rig = Rig::new(RoutingTable::builtin());
    let task_id = rig
        .queue
        .enqueue("generate-embedding", json!({"candidate_id": 42}))
        .await
        .unwrap();
    assert_eq!(rig.broker.len(Lane::FastCompute).await, 1);
    let (_sub, mut rx) = rig.bus.subscribe(task_id).await;

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("generate-embedding", |starts: Arc<Starts>, ctx, args: Value| async move {
        starts.record(&ctx);
        assert_eq!(args["candidate_id"], 42);
        if ctx.attempt() == 0 {
            return Err(TaskFailure::retryable("embedding service unavailable"));
        }
        Ok(json!({"embedding_dimension": 384}))
    });
    let starts = Arc::new(Starts::default());
    let mut cfg = config(2);
    cfg.lanes = vec![(Lane::FastCompute, 1)];
    rig.pool(handlers, starts.clone(), cfg).run().await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(
        statuses(&events),
        vec![
            (EventStatus::Started, 0, false),
            (EventStatus::Failed, 0, true),
            (EventStatus::Started, 1, false),
            (EventStatus::Completed, 1, false),
        ]
    );
    assert!(!events[1].is_terminal());
    assert_eq!(events[3].payload, Some(json!({"embedding_dimension": 384})));

    // First retry waits the base delay of the kind.
    let starts = starts.all();
    let gap = starts[1].1 - starts[0].1;
    assert!(gap >= Duration::from_secs(60) && gap < Duration::from_secs(61), "{gap:?}");

    let result = rig.store.get(task_id).await.unwrap();
    assert_eq!(result.status, TaskStatus::Succeeded);
    assert_eq!(result.payload, Some(json!({"embedding_dimension": 384})));
}

#[tokio::test(start_paused = true)]
async fn analysis_that_never_returns_times_out_three_times() {
    let rig = Rig::new(RoutingTable::builtin());
    let task_id = rig
        .queue
        .enqueue("run-analysis", json!({"application_id": 7}))
        .await
        .unwrap();
    let (_sub, mut rx) = rig.bus.subscribe(task_id).await;

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("run-analysis", |starts: Arc<Starts>, ctx, _| async move {
        starts.record(&ctx);
        std::future::pending::<()>().await;
        Ok::<_, TaskFailure>(Value::Null)
    });
    let starts = Arc::new(Starts::default());
    let mut cfg = config(3);
    cfg.lanes = vec![(Lane::HeavyCompute, 1)];
    rig.pool(handlers, starts.clone(), cfg).run().await.unwrap();

    assert_eq!(starts.all().len(), 3);
    let result = rig.store.get(task_id).await.unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.attempt, 2);
    assert!(result.error.unwrap().contains("timed out"));

    let events = drain(&mut rx);
    let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(events.last().unwrap().status, EventStatus::Failed);
    assert!(!events.last().unwrap().retrying);
}

#[tokio::test(start_paused = true)]
async fn checkpoint_stops_callback_at_soft_limit() {
    let rig = Rig::new(table(vec![
        KindPolicy::new("batch", Lane::Background, 1, Duration::ZERO)
            .with_timeout(Duration::from_secs(10))
            .with_soft_timeout(Duration::from_secs(5)),
    ]));
    let task_id = rig.queue.enqueue("batch", json!({})).await.unwrap();

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("batch", |_: Arc<()>, ctx: TaskContext, _| async move {
        for i in 0..100u64 {
            ctx.checkpoint()?;
            ctx.batch_progress(i, 100, None).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok::<_, TaskFailure>(Value::Null)
    });
    rig.pool(handlers, Arc::new(()), config(1)).run().await.unwrap();

    let result = rig.store.get(task_id).await.unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("soft time limit exceeded"));
}

#[tokio::test(start_paused = true)]
async fn progress_events_arrive_between_started_and_completed() {
    let rig = Rig::new(RoutingTable::builtin());
    let task_id = rig.queue.enqueue("notify-status", json!({})).await.unwrap();
    let (_sub, mut rx) = rig.bus.subscribe(task_id).await;

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("notify-status", |_: Arc<()>, ctx: TaskContext, _| async move {
        ctx.progress(50, Some("rendering email")).await;
        ctx.progress(100, None).await;
        Ok::<_, TaskFailure>(json!({"sent": true}))
    });
    let mut cfg = config(1);
    cfg.lanes = vec![(Lane::Urgent, 1)];
    rig.pool(handlers, Arc::new(()), cfg).run().await.unwrap();

    let events = drain(&mut rx);
    let kinds: Vec<_> = events.iter().map(|e| (e.status, e.progress)).collect();
    assert_eq!(
        kinds,
        vec![
            (EventStatus::Started, None),
            (EventStatus::Progress, Some(50)),
            (EventStatus::Progress, Some(100)),
            (EventStatus::Completed, None),
        ]
    );
    assert_eq!(events[1].message.as_deref(), Some("rendering email"));
}

// ── At-least-once ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unwritable_result_leaves_item_for_redelivery() {
    let rig = Rig::new(table(vec![
        KindPolicy::new("embed", Lane::FastCompute, 3, Duration::from_secs(1))
            .with_timeout(Duration::from_secs(10)),
    ]));
    let task_id = rig.queue.enqueue("embed", json!({})).await.unwrap();
    rig.store.fail_next_puts(TaskStatus::Succeeded, 1);

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("embed", |starts: Arc<Starts>, ctx, _| async move {
        starts.record(&ctx);
        Ok::<_, TaskFailure>(json!({"ok": true}))
    });
    let starts = Arc::new(Starts::default());
    let mut cfg = config(2);
    cfg.visibility_timeout = Duration::from_secs(30);
    rig.pool(handlers, starts.clone(), cfg).run().await.unwrap();

    let starts = starts.all();
    assert_eq!(starts.len(), 2, "executed again after redelivery");
    assert_eq!(starts[0].0, starts[1].0, "redelivery is the same attempt");
    assert!(starts[1].1 - starts[0].1 >= Duration::from_secs(30));

    assert_eq!(rig.store.get(task_id).await.unwrap().status, TaskStatus::Succeeded);
    assert_eq!(rig.broker.total().await, 0);
}

#[tokio::test(start_paused = true)]
async fn redelivery_after_recorded_result_runs_again() {
    let rig = Rig::new(table(vec![
        KindPolicy::new("embed", Lane::FastCompute, 3, Duration::from_secs(1))
            .with_timeout(Duration::from_secs(10)),
    ]));
    let task_id = rig.queue.enqueue("embed", json!({})).await.unwrap();

    // A previous worker claimed the item, recorded its result, and died
    // before acking.
    let vt = Duration::from_secs(30);
    let claimed = rig.broker.claim(Lane::FastCompute, vt).await.unwrap().unwrap();
    rig.store
        .put(&TaskResult::succeeded(&claimed.item, json!({"ok": true})))
        .await
        .unwrap();
    tokio::time::advance(vt + Duration::from_secs(1)).await;

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("embed", |starts: Arc<Starts>, ctx, _| async move {
        starts.record(&ctx);
        Ok::<_, TaskFailure>(json!({"ok": "again"}))
    });
    let starts = Arc::new(Starts::default());
    let mut cfg = config(1);
    cfg.visibility_timeout = vt;
    rig.pool(handlers, starts.clone(), cfg).run().await.unwrap();

    let starts = starts.all();
    assert_eq!(starts.len(), 1, "redelivered item runs its callback again");
    assert_eq!(starts[0].0, 0);
    assert_eq!(rig.broker.total().await, 0);

    let result = rig.store.get(task_id).await.unwrap();
    assert_eq!(result.status, TaskStatus::Succeeded);
    assert_eq!(result.payload, Some(json!({"ok": "again"})));
}

#[tokio::test(start_paused = true)]
async fn failed_requeue_keeps_store_on_the_held_attempt() {
    let rig = Rig::new(table(vec![
        KindPolicy::new("flaky", Lane::FastCompute, 3, Duration::from_secs(1))
            .with_timeout(Duration::from_secs(60)),
    ]));
    let task_id = rig.queue.enqueue("flaky", json!({})).await.unwrap();
    rig.broker.fail_next_requeues(1);

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("flaky", |starts: Arc<Starts>, ctx: TaskContext, _| async move {
        starts.record(&ctx);
        if ctx.attempt() == 0 {
            return Err(TaskFailure::retryable("upstream returned 503"));
        }
        Ok(json!({"ok": true}))
    });
    let starts = Arc::new(Starts::default());
    let mut cfg = config(3);
    cfg.lanes = vec![(Lane::FastCompute, 1)];
    let pool = rig.pool(handlers, starts.clone(), cfg);
    let run = tokio::spawn(async move { pool.run().await });

    // The broker still holds attempt 0 until its visibility timeout lapses,
    // and the store must not claim a retry is pending.
    tokio::time::sleep(Duration::from_secs(10)).await;
    let held = rig.store.get(task_id).await.unwrap();
    assert_eq!(held.status, TaskStatus::Started);
    assert_eq!(held.attempt, 0);
    assert_eq!(rig.broker.len(Lane::FastCompute).await, 1);

    assert_eq!(run.await.unwrap().unwrap(), PoolExit::Recycle);
    let starts = starts.all();
    assert_eq!(
        starts.iter().map(|(a, _)| *a).collect::<Vec<_>>(),
        vec![0, 0, 1]
    );
    assert!(starts[1].1 - starts[0].1 >= VT);
    assert_eq!(rig.store.get(task_id).await.unwrap().status, TaskStatus::Succeeded);
    assert_eq!(rig.broker.total().await, 0);
}

// ── Lifecycle ────────────────────────────────────────────────────────

async fn noop(_: Arc<()>, _: TaskContext, _: Value) -> TaskOutcome {
    Ok(Value::Null)
}

#[tokio::test(start_paused = true)]
async fn pool_recycles_after_max_items() {
    let rig = Rig::new(RoutingTable::builtin());
    for _ in 0..5 {
        rig.queue.enqueue("purge-old-records", json!({})).await.unwrap();
    }
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("purge-old-records", noop);
    let mut cfg = config(2);
    cfg.lanes = vec![(Lane::Background, 1)];

    let exit = rig.pool(handlers, Arc::new(()), cfg).run().await.unwrap();
    assert_eq!(exit, PoolExit::Recycle);
    assert_eq!(rig.broker.len(Lane::Background).await, 3);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_idle_pool() {
    let rig = Rig::new(RoutingTable::builtin());
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("purge-old-records", noop);
    let mut cfg = config(0);
    cfg.lanes = vec![(Lane::Background, 1)];

    let pool = rig.pool(handlers, Arc::new(()), cfg);
    let ctrl = pool.clone();
    let run = tokio::spawn(async move { pool.run().await });
    tokio::time::sleep(Duration::from_secs(5)).await;
    ctrl.shutdown();

    assert_eq!(run.await.unwrap().unwrap(), PoolExit::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn broker_outage_is_ridden_out() {
    let rig = Rig::new(RoutingTable::builtin());
    let task_id = rig.queue.enqueue("purge-old-records", json!({})).await.unwrap();
    rig.broker.set_offline(true);

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("purge-old-records", noop);
    let mut cfg = config(1);
    cfg.lanes = vec![(Lane::Background, 1)];
    let pool = rig.pool(handlers, Arc::new(()), cfg);
    let run = tokio::spawn(async move { pool.run().await });

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(!run.is_finished());
    rig.broker.set_offline(false);

    assert_eq!(run.await.unwrap().unwrap(), PoolExit::Recycle);
    assert_eq!(rig.store.get(task_id).await.unwrap().status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn rejects_visibility_timeout_shorter_than_task_timeout() {
    let rig = Rig::new(RoutingTable::builtin());
    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("run-analysis", noop);
    let mut cfg = config(1);
    cfg.lanes = vec![(Lane::HeavyCompute, 1)];
    cfg.visibility_timeout = Duration::from_secs(60);

    let err = rig.pool(handlers, Arc::new(()), cfg).run().await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn rejects_served_kind_without_handler() {
    let rig = Rig::new(RoutingTable::builtin());
    let handlers = HandlerRegistry::<()>::new();
    let mut cfg = config(1);
    cfg.lanes = vec![(Lane::Urgent, 1)];

    let err = rig.pool(handlers, Arc::new(()), cfg).run().await.unwrap_err();
    assert!(err.to_string().contains("notify-status"));
}

#[tokio::test(start_paused = true)]
async fn unroutable_message_fails_terminally() {
    let rig = Rig::new(RoutingTable::builtin());
    let stray = WorkItem {
        id: TaskId::new(),
        kind: "resize-image".to_string(),
        args: Value::Null,
        lane: Lane::Background,
        attempt: 0,
        max_attempts: 3,
        enqueued_at: chrono::Utc::now(),
    };
    rig.broker.send(&stray, Duration::ZERO).await.unwrap();

    let mut handlers = HandlerRegistry::new();
    handlers.register_fn("purge-old-records", noop);
    let mut cfg = config(1);
    cfg.lanes = vec![(Lane::Background, 1)];
    rig.pool(handlers, Arc::new(()), cfg).run().await.unwrap();

    let result = rig.store.get(stray.id).await.unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(rig.broker.total().await, 0);
}
