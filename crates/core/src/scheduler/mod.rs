//! Hub schedulers: decide when each link of a hub may generate entanglement.
//!
//! A scheduler reserves time slots and tells the affected link about them.
//! The link only generates inside a slot it has been given.
//!
//! - [`fifo`]: reacts to requests, activating them in arrival order up to a
//!   multiplexing bound.
//! - [`static_schedule`]: cycles through a fixed timetable of windows, one
//!   group of links at a time.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    rc::{Rc, Weak},
};

use crate::{
    controller::{Lifecycle, ProtocolError},
    link::{LinkLayer, NodePair},
    node::{CreateId, NodeId, NodeRegistry},
    qlink::{ReqCreateAndKeep, ResCreateAndKeep, ResError},
    simulation::SimContext,
};

pub mod fifo;
pub mod static_schedule;

pub use fifo::{FifoScheduleBuilder, FifoScheduleConfig, FifoScheduleProtocol};
pub use static_schedule::{StaticScheduleBuilder, StaticScheduleConfig, StaticScheduleProtocol};

pub type SharedScheduler = Rc<RefCell<dyn ScheduleProtocol>>;

/// Requests are tracked by the node that issued them and its create id.
pub type RequestKey = (NodeId, CreateId);

/// Interval during which a link may generate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSlot {
    pub node: String,
    pub remote: String,
    pub start: u64,
    /// `None` while the slot is open-ended
    pub end: Option<u64>,
}

impl TimeSlot {
    pub fn pair(&self) -> NodePair {
        NodePair::new(&self.node, &self.remote)
    }

    pub fn contains(&self, time: u64) -> bool {
        time >= self.start && self.end.map_or(true, |end| time < end)
    }
}

/// A time slot handed to a link, optionally dedicated to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub slot: TimeSlot,
    pub request: Option<RequestKey>,
}

pub trait ScheduleProtocol: Lifecycle {
    fn name(&self) -> &str;

    /// A `CreateAndKeep` request entered one of the hub's links.
    fn register_request(
        &mut self,
        node_id: NodeId,
        request: &ReqCreateAndKeep,
        create_id: CreateId,
    );

    /// The request behind `result` has received all its pairs.
    fn register_result(&mut self, node_id: NodeId, result: &ResCreateAndKeep);

    /// The request behind `error` failed and will produce no more pairs.
    fn register_error(&mut self, node_id: NodeId, error: &ResError);

    /// Every reservation made so far, in issue order.
    fn reservations(&self) -> &[Reservation];

    /// Requests currently holding a slot.
    fn active_requests(&self) -> usize;

    /// Requests waiting for a slot.
    fn queued_requests(&self) -> usize;

    /// Length of the shortest slot this scheduler ever hands out, if slots
    /// are bounded.
    fn shortest_window(&self) -> Option<u64> {
        None
    }
}

/// State shared by all scheduler implementations: the hub's links, the slot
/// history and the running flag.
pub struct ScheduleCore {
    name: String,
    sim: SimContext,
    node_ids: Rc<NodeRegistry>,
    links: BTreeMap<NodePair, Weak<RefCell<LinkLayer>>>,
    reservations: Vec<Reservation>,
    running: bool,
}

impl ScheduleCore {
    pub fn new(
        name: impl Into<String>,
        sim: SimContext,
        node_ids: Rc<NodeRegistry>,
        links: BTreeMap<NodePair, Weak<RefCell<LinkLayer>>>,
    ) -> Self {
        Self {
            name: name.into(),
            sim,
            node_ids,
            links,
            reservations: Vec::new(),
            running: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sim(&self) -> &SimContext {
        &self.sim
    }

    pub fn now(&self) -> u64 {
        self.sim.now()
    }

    /// Link pairs of the hub in sorted order.
    pub fn pairs(&self) -> impl Iterator<Item = &NodePair> {
        self.links.keys()
    }

    pub fn node_name(&self, id: NodeId) -> String {
        match self.node_ids.name(id) {
            Some(name) => name.to_string(),
            None => {
                tracing::warn!(scheduler = %self.name, node = %id, "Unknown node id");
                format!("node-{id}")
            }
        }
    }

    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) -> Result<(), ProtocolError> {
        if self.running {
            return Err(ProtocolError::AlreadyRunning(self.name.clone()));
        }
        self.running = true;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), ProtocolError> {
        if !self.running {
            return Err(ProtocolError::NotRunning(self.name.clone()));
        }
        self.running = false;
        Ok(())
    }

    /// Records a reservation and hands it to the link of the slot's pair.
    /// The link receives it in a separate event at the current instant.
    pub fn reserve(&mut self, slot: TimeSlot, request: Option<RequestKey>) {
        let reservation = Reservation { slot, request };
        tracing::debug!(
            scheduler = %self.name,
            node = %reservation.slot.node,
            remote = %reservation.slot.remote,
            start = reservation.slot.start,
            end = ?reservation.slot.end,
            "Reserving time slot"
        );
        self.reservations.push(reservation.clone());
        let Some(link) = self.links.get(&reservation.slot.pair()).cloned() else {
            tracing::warn!(
                scheduler = %self.name,
                pair = %reservation.slot.pair(),
                "No link for reserved pair"
            );
            return;
        };
        self.sim.schedule_now("open-timeslot", move || {
            if let Some(link) = link.upgrade() {
                link.borrow_mut().open_timeslot(reservation);
            }
        });
    }

    /// Ends the open slot reserved for `request` at the current time and
    /// withdraws it from the link.
    pub fn release(&mut self, request: RequestKey) {
        let now = self.sim.now();
        let Some(reservation) = self
            .reservations
            .iter_mut()
            .rev()
            .find(|r| r.request == Some(request) && r.slot.end.is_none())
        else {
            return;
        };
        reservation.slot.end = Some(now);
        let pair = reservation.slot.pair();
        tracing::debug!(scheduler = %self.name, %pair, time = now, "Closing time slot");
        if let Some(link) = self.links.get(&pair).cloned() {
            self.sim.schedule_now("close-timeslot", move || {
                if let Some(link) = link.upgrade() {
                    link.borrow_mut().close_timeslot(request);
                }
            });
        }
    }
}

impl std::fmt::Debug for ScheduleCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleCore")
            .field("name", &self.name)
            .field("links", &self.links.keys().collect::<Vec<_>>())
            .field("reservations", &self.reservations.len())
            .field("running", &self.running)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_slot_contains() {
        let slot = TimeSlot {
            node: "Alice".into(),
            remote: "Bob".into(),
            start: 10,
            end: Some(20),
        };
        assert!(!slot.contains(9));
        assert!(slot.contains(10));
        assert!(slot.contains(19));
        assert!(!slot.contains(20));
        assert_eq!(slot.pair(), NodePair::new("Bob", "Alice"));

        let open = TimeSlot { end: None, ..slot };
        assert!(open.contains(u64::MAX));
    }

    #[test]
    fn test_release_closes_latest_open_slot_for_request() {
        let (sim, ids, links) = test_support::detached(2);
        let mut core = ScheduleCore::new("hub", sim.clone(), ids, links);
        let key = (NodeId::new(0), 4);
        core.reserve(
            TimeSlot {
                node: "node_0".into(),
                remote: "node_1".into(),
                start: 0,
                end: None,
            },
            Some(key),
        );
        sim.schedule_at(250, "noop", || {});
        sim.run();
        core.release(key);
        core.release(key);
        assert_eq!(core.reservations()[0].slot.end, Some(250));
    }
}
