//! Single-threaded cooperative executor driven by the event queue.
//!
//! Node programs are plain futures. They suspend on explicit wait conditions
//! (a classical message, a named EGP signal, a sleep) and are resumed when the
//! event that satisfies the condition fires. Before each event is popped the
//! executor polls every task that became ready, in wake order, so the whole
//! run is a deterministic function of the seed and the topology.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, VecDeque},
    future::Future,
    rc::Rc,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use futures::{
    channel::oneshot,
    future::LocalBoxFuture,
    task::{waker, ArcWake},
    FutureExt,
};

use super::{
    event_queue::{EventId, EventQueue, EventQueueConfig, EventRecord},
    rng::SimulationRng,
};

/// Identifier of a spawned cooperative task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Runtime configuration of a simulation.
#[derive(Debug, Clone, Default)]
pub struct SimulationConfig {
    /// Seed for every stochastic model in the run
    pub seed: u64,
    /// Event queue settings (tracing, replay log size)
    pub events: EventQueueConfig,
}

impl SimulationConfig {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            ..Default::default()
        }
    }
}

/// Summary of a `run`/`run_until` invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub events_processed: usize,
    pub tasks_completed: usize,
    /// Tasks still suspended when the queue ran dry (awaiting something that never fired)
    pub tasks_pending: usize,
    pub end_time: u64,
}

struct Task {
    name: String,
    future: LocalBoxFuture<'static, ()>,
}

/// Ready queue shared with wakers; wakers must be `Send + Sync`.
type ReadyQueue = Arc<Mutex<VecDeque<TaskId>>>;

struct TaskWaker {
    id: TaskId,
    ready: ReadyQueue,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if let Ok(mut ready) = arc_self.ready.lock() {
            if !ready.contains(&arc_self.id) {
                ready.push_back(arc_self.id);
            }
        }
    }
}

struct SimInner {
    queue: RefCell<EventQueue>,
    rng: SimulationRng,
    tasks: RefCell<BTreeMap<TaskId, Task>>,
    ready: ReadyQueue,
    next_task_id: Cell<u64>,
}

/// Cheap-clone handle to one simulation.
///
/// Every protocol object built into a network holds a clone; there is no
/// process-wide simulation state.
#[derive(Clone)]
pub struct SimContext {
    inner: Rc<SimInner>,
}

impl SimContext {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            inner: Rc::new(SimInner {
                queue: RefCell::new(EventQueue::with_config(config.events)),
                rng: SimulationRng::new(config.seed),
                tasks: RefCell::new(BTreeMap::new()),
                ready: Arc::new(Mutex::new(VecDeque::new())),
                next_task_id: Cell::new(0),
            }),
        }
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn now(&self) -> u64 {
        self.inner.queue.borrow().now()
    }

    pub fn rng(&self) -> &SimulationRng {
        &self.inner.rng
    }

    pub fn seed(&self) -> u64 {
        self.inner.rng.seed()
    }

    pub fn schedule_at<F>(&self, timestamp: u64, label: &'static str, action: F) -> EventId
    where
        F: FnOnce() + 'static,
    {
        self.inner
            .queue
            .borrow_mut()
            .schedule_at(timestamp, label, Box::new(action))
    }

    pub fn schedule_after<F>(&self, delay: u64, label: &'static str, action: F) -> EventId
    where
        F: FnOnce() + 'static,
    {
        self.inner
            .queue
            .borrow_mut()
            .schedule_after(delay, label, Box::new(action))
    }

    /// Schedules an action at the current instant, behind everything already
    /// queued for this instant.
    pub fn schedule_now<F>(&self, label: &'static str, action: F) -> EventId
    where
        F: FnOnce() + 'static,
    {
        self.schedule_after(0, label, action)
    }

    pub fn cancel(&self, id: EventId) -> bool {
        self.inner.queue.borrow_mut().cancel(id)
    }

    pub fn pending_events(&self) -> usize {
        self.inner.queue.borrow().pending_count()
    }

    pub fn event_log(&self) -> Vec<EventRecord> {
        self.inner.queue.borrow().event_log().copied().collect()
    }

    /// Spawns a cooperative task; it is first polled on the next run step.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F) -> TaskId
    where
        F: Future<Output = ()> + 'static,
    {
        let id = TaskId(self.inner.next_task_id.get());
        self.inner.next_task_id.set(id.0 + 1);
        let name = name.into();
        tracing::debug!(task = id.0, %name, "Spawning task");
        self.inner.tasks.borrow_mut().insert(
            id,
            Task {
                name,
                future: future.boxed_local(),
            },
        );
        self.wake(id);
        id
    }

    pub fn active_tasks(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    /// Future resolving after `delay` nanoseconds of virtual time.
    pub fn sleep(&self, delay: u64) -> impl Future<Output = ()> + 'static {
        let (tx, rx) = oneshot::channel::<()>();
        self.schedule_after(delay, "sleep", move || {
            let _ = tx.send(());
        });
        async move {
            let _ = rx.await;
        }
    }

    /// Runs until no ready task and no pending event is left.
    pub fn run(&self) -> RunStats {
        self.run_inner(None)
    }

    /// Runs every event scheduled at or before `deadline`, then moves the
    /// clock to `deadline`.
    pub fn run_until(&self, deadline: u64) -> RunStats {
        self.run_inner(Some(deadline))
    }

    fn run_inner(&self, deadline: Option<u64>) -> RunStats {
        let mut stats = RunStats::default();
        loop {
            stats.tasks_completed += self.poll_ready();

            let next = {
                let mut queue = self.inner.queue.borrow_mut();
                match (queue.next_event_time(), deadline) {
                    (None, _) => None,
                    (Some(at), Some(deadline)) if at > deadline => None,
                    (Some(_), _) => queue.step(),
                }
            };
            let Some(event) = next else {
                break;
            };
            event.fire();
            stats.events_processed += 1;
        }

        if let Some(deadline) = deadline {
            self.inner.queue.borrow_mut().advance_to(deadline);
        }
        stats.tasks_pending = self.active_tasks();
        stats.end_time = self.now();
        if stats.tasks_pending > 0 && deadline.is_none() {
            let names: Vec<String> = self
                .inner
                .tasks
                .borrow()
                .values()
                .map(|t| t.name.clone())
                .collect();
            tracing::debug!(?names, "Event queue drained with suspended tasks");
        }
        stats
    }

    fn wake(&self, id: TaskId) {
        if let Ok(mut ready) = self.inner.ready.lock() {
            if !ready.contains(&id) {
                ready.push_back(id);
            }
        }
    }

    fn next_ready(&self) -> Option<TaskId> {
        self.inner
            .ready
            .lock()
            .ok()
            .and_then(|mut ready| ready.pop_front())
    }

    /// Polls ready tasks until none is left; returns how many completed.
    fn poll_ready(&self) -> usize {
        let mut completed = 0;
        while let Some(id) = self.next_ready() {
            // Take the task out so it can spawn or wake others while polled.
            let Some(mut task) = self.inner.tasks.borrow_mut().remove(&id) else {
                continue;
            };
            let task_waker = waker(Arc::new(TaskWaker {
                id,
                ready: self.inner.ready.clone(),
            }));
            let mut cx = Context::from_waker(&task_waker);
            match task.future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {
                    tracing::debug!(
                        task = id.0,
                        name = %task.name,
                        now = self.now(),
                        "Task finished"
                    );
                    completed += 1;
                }
                Poll::Pending => {
                    self.inner.tasks.borrow_mut().insert(id, task);
                }
            }
        }
        completed
    }
}

impl std::fmt::Debug for SimContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimContext")
            .field("now", &self.now())
            .field("seed", &self.seed())
            .field("pending_events", &self.pending_events())
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::Mailbox;

    #[test]
    fn test_scheduled_actions_advance_time() {
        let sim = SimContext::new(SimulationConfig::default());
        let seen = Rc::new(RefCell::new(Vec::new()));

        for t in [300, 100, 200] {
            let seen = seen.clone();
            let ctx = sim.clone();
            sim.schedule_at(t, "probe", move || seen.borrow_mut().push(ctx.now()));
        }
        let stats = sim.run();

        assert_eq!(*seen.borrow(), vec![100, 200, 300]);
        assert_eq!(stats.events_processed, 3);
        assert_eq!(stats.end_time, 300);
    }

    #[test]
    fn test_task_sleeps_in_virtual_time() {
        let sim = SimContext::new(SimulationConfig::default());
        let woke_at = Rc::new(Cell::new(0));

        let ctx = sim.clone();
        let out = woke_at.clone();
        sim.spawn("sleeper", async move {
            ctx.sleep(1_500).await;
            ctx.sleep(500).await;
            out.set(ctx.now());
        });
        let stats = sim.run();

        assert_eq!(woke_at.get(), 2_000);
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.tasks_pending, 0);
    }

    #[test]
    fn test_task_resumes_when_mailbox_filled_by_event() {
        let sim = SimContext::new(SimulationConfig::default());
        let mailbox = Mailbox::new();
        let received = Rc::new(RefCell::new(None));

        let rx = mailbox.clone();
        let ctx = sim.clone();
        let out = received.clone();
        sim.spawn("receiver", async move {
            let msg = rx.recv().await;
            *out.borrow_mut() = msg.map(|m: &str| (m, ctx.now()));
        });
        let tx = mailbox.clone();
        sim.schedule_at(42, "deliver", move || tx.push("ping"));
        sim.run();

        assert_eq!(*received.borrow(), Some(("ping", 42)));
    }

    #[test]
    fn test_suspended_tasks_are_reported() {
        let sim = SimContext::new(SimulationConfig::default());
        let mailbox: Mailbox<u8> = Mailbox::new();
        sim.spawn("forever", async move {
            let _ = mailbox.recv().await;
        });

        let stats = sim.run();
        assert_eq!(stats.tasks_pending, 1);
    }

    #[test]
    fn test_run_until_stops_at_deadline() {
        let sim = SimContext::new(SimulationConfig::default());
        let fired = Rc::new(Cell::new(0));
        for t in [10, 20, 30] {
            let fired = fired.clone();
            sim.schedule_at(t, "tick", move || fired.set(fired.get() + 1));
        }

        let stats = sim.run_until(25);
        assert_eq!(fired.get(), 2);
        assert_eq!(stats.end_time, 25);
        assert_eq!(sim.pending_events(), 1);
    }
}
