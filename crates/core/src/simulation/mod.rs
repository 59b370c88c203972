//! Deterministic discrete-event runtime for network simulations.
//!
//! # Architecture
//!
//! - **EventQueue**: time-ordered queue of deferred actions; the clock only
//!   moves when an event is stepped. Same-instant events run in enqueue order.
//! - **SimulationRng**: seeded RNG for every stochastic model.
//! - **SimContext**: cheap-clone handle combining the queue, the RNG and a
//!   cooperative executor for node programs.
//! - **Mailbox**: the named wait condition programs suspend on.
//!
//! Everything runs on the calling thread. Protocol objects mutate shared
//! state only from event actions or task polls, never concurrently, so the
//! run is reproducible from the seed alone.
//!
//! ```ignore
//! let sim = SimContext::new(SimulationConfig::with_seed(7));
//! let ctx = sim.clone();
//! sim.spawn("alice", async move {
//!     ctx.sleep(1_000).await;
//! });
//! let stats = sim.run();
//! assert_eq!(stats.end_time, 1_000);
//! ```

mod event_queue;
mod mailbox;
mod rng;
mod runtime;

pub use event_queue::{Event, EventAction, EventId, EventQueue, EventQueueConfig, EventRecord};
pub use mailbox::{Mailbox, Recv};
pub use rng::SimulationRng;
pub use runtime::{RunStats, SimContext, SimulationConfig, TaskId};
