//! Physical entanglement links.
//!
//! A [`LinkLayer`] serves one unordered node pair. It queues `CreateAndKeep`
//! requests from either end, runs generation attempts as simulation events
//! and reports delivered pairs to the EGPs at both ends.
//!
//! Links without a scheduler generate as soon as a request is at the head of
//! the queue and the peer accepts pairs. Links inside a hub additionally wait
//! for a reservation from the hub scheduler.

use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    rc::{Rc, Weak},
};

use crate::{
    controller::{Lifecycle, ProtocolError},
    egp::EgpSignals,
    node::{CreateId, NodeId, ProcessingNode},
    qlink::{EgpResult, ErrorCode, ReqCreateAndKeep, ResCreateAndKeep, ResError},
    scheduler::{RequestKey, Reservation, SharedScheduler},
    simulation::{EventId, SimContext, SimulationRng},
};

pub mod models;

pub use models::{
    DepolariseLinkBuilder, DepolariseLinkConfig, HeraldedLinkBuilder, HeraldedLinkConfig,
    PerfectLinkBuilder,
    PerfectLinkConfig,
};

/// Unordered pair of node names, stored sorted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodePair {
    first: String,
    second: String,
}

impl NodePair {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            Self { first: a, second: b }
        } else {
            Self { first: b, second: a }
        }
    }

    pub fn first(&self) -> &str {
        &self.first
    }

    pub fn second(&self) -> &str {
        &self.second
    }

    pub fn contains(&self, name: &str) -> bool {
        self.first == name || self.second == name
    }

    /// The member that is not `name`.
    pub fn other(&self, name: &str) -> Option<&str> {
        if self.first == name {
            Some(&self.second)
        } else if self.second == name {
            Some(&self.first)
        } else {
            None
        }
    }
}

impl fmt::Display for NodePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.first, self.second)
    }
}

/// Physical model behind a link.
pub trait LinkModel {
    fn kind(&self) -> &str;

    /// Duration of one generation attempt, in ns.
    fn cycle_time(&self) -> u64;

    fn success_probability(&self) -> f64;

    /// Attempts allowed per pair; `None` retries forever.
    fn max_attempts(&self) -> Option<u32> {
        None
    }

    fn fidelity(&self) -> f64;
}

pub type SharedLink = Rc<RefCell<LinkLayer>>;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link `{0}` is not running")]
    NotRunning(String),
    #[error("node {node} is not an end of link `{link}`")]
    NotAnEnd { link: String, node: NodeId },
    #[error("node {remote} is not reachable from node {node} over link `{link}`")]
    WrongPeer {
        link: String,
        node: NodeId,
        remote: NodeId,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub attempts: u64,
    pub pairs_delivered: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
}

struct LinkEnd {
    node: ProcessingNode,
    /// The peer may create pairs with this end
    accepting: bool,
    signals: Option<EgpSignals>,
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    node_id: NodeId,
    create_id: CreateId,
    request: ReqCreateAndKeep,
    delivered: u32,
    /// Attempts spent on the current pair
    attempts: u32,
}

impl PendingRequest {
    fn key(&self) -> RequestKey {
        (self.node_id, self.create_id)
    }
}

pub struct LinkLayer {
    name: String,
    pair: NodePair,
    ends: [LinkEnd; 2],
    model: Box<dyn LinkModel>,
    sim: SimContext,
    rng: SimulationRng,
    this: Weak<RefCell<LinkLayer>>,
    scheduler: Option<SharedScheduler>,
    running: bool,
    /// Bumped on stop; events from an older epoch are ignored
    epoch: u64,
    requests: VecDeque<PendingRequest>,
    reservations: VecDeque<Reservation>,
    attempt_pending: bool,
    wakeup: Option<(u64, EventId)>,
    stats: LinkStats,
}

impl LinkLayer {
    pub fn new_shared(
        sim: SimContext,
        rng: SimulationRng,
        node_a: ProcessingNode,
        node_b: ProcessingNode,
        model: Box<dyn LinkModel>,
    ) -> SharedLink {
        let pair = NodePair::new(node_a.name(), node_b.name());
        let (first, second) = if node_a.name() == pair.first() {
            (node_a, node_b)
        } else {
            (node_b, node_a)
        };
        let end = |node| LinkEnd {
            node,
            accepting: false,
            signals: None,
        };
        Rc::new_cyclic(|this| {
            RefCell::new(LinkLayer {
                name: format!("link_{}_{}", pair.first(), pair.second()),
                pair,
                ends: [end(first), end(second)],
                model,
                sim,
                rng,
                this: this.clone(),
                scheduler: None,
                running: false,
                epoch: 0,
                requests: VecDeque::new(),
                reservations: VecDeque::new(),
                attempt_pending: false,
                wakeup: None,
                stats: LinkStats::default(),
            })
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pair(&self) -> &NodePair {
        &self.pair
    }

    pub fn model_kind(&self) -> &str {
        self.model.kind()
    }

    /// Duration of one generation attempt, in ns.
    pub fn cycle_time(&self) -> u64 {
        self.model.cycle_time()
    }

    pub fn node_ids(&self) -> (NodeId, NodeId) {
        (self.ends[0].node.id(), self.ends[1].node.id())
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn queued_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn scheduler(&self) -> Option<&SharedScheduler> {
        self.scheduler.as_ref()
    }

    /// Puts the link under a hub scheduler; it then only generates inside
    /// reservations.
    pub fn set_scheduler(&mut self, scheduler: SharedScheduler) {
        self.scheduler = Some(scheduler);
    }

    /// Routes results for `node` to its EGP. Returns false if `node` is not
    /// an end of this link.
    pub fn attach_egp(&mut self, node: NodeId, signals: EgpSignals) -> bool {
        match self.end_index(node) {
            Some(idx) => {
                self.ends[idx].signals = Some(signals);
                true
            }
            None => false,
        }
    }

    fn end_index(&self, node: NodeId) -> Option<usize> {
        self.ends.iter().position(|end| end.node.id() == node)
    }

    fn peer_index(&self, node: NodeId, remote: NodeId) -> Result<usize, LinkError> {
        if !self.running {
            return Err(LinkError::NotRunning(self.name.clone()));
        }
        let idx = self.end_index(node).ok_or_else(|| LinkError::NotAnEnd {
            link: self.name.clone(),
            node,
        })?;
        let peer = 1 - idx;
        if self.ends[peer].node.id() != remote {
            return Err(LinkError::WrongPeer {
                link: self.name.clone(),
                node,
                remote,
            });
        }
        Ok(peer)
    }

    /// Queues a request from `node`. Scheduled links forward it to the
    /// scheduler before trying to generate.
    pub fn put_create(
        &mut self,
        node: NodeId,
        request: ReqCreateAndKeep,
        create_id: CreateId,
    ) -> Result<(), LinkError> {
        self.peer_index(node, request.remote_node_id)?;
        tracing::debug!(
            link = %self.name,
            node = %node,
            create_id,
            number = request.number,
            "Queueing create request"
        );
        self.requests.push_back(PendingRequest {
            node_id: node,
            create_id,
            request,
            delivered: 0,
            attempts: 0,
        });
        if let Some(scheduler) = &self.scheduler {
            scheduler.borrow_mut().register_request(node, &request, create_id);
        }
        self.try_generate();
        Ok(())
    }

    /// `node` accepts pairs created by `remote` from now on.
    pub fn put_receive(&mut self, node: NodeId, remote: NodeId) -> Result<(), LinkError> {
        let peer = self.peer_index(node, remote)?;
        self.ends[1 - peer].accepting = true;
        tracing::trace!(link = %self.name, node = %node, "Accepting pairs");
        self.try_generate();
        Ok(())
    }

    /// Reservation handed down by the scheduler.
    pub fn open_timeslot(&mut self, reservation: Reservation) {
        if !self.running {
            return;
        }
        self.reservations.push_back(reservation);
        self.try_generate();
    }

    /// Withdraws the reservation of `request`, if still held.
    pub fn close_timeslot(&mut self, request: RequestKey) {
        self.reservations.retain(|r| r.request != Some(request));
    }

    fn try_generate(&mut self) {
        if !self.running || self.attempt_pending {
            return;
        }
        let Some(head) = self.requests.front().copied() else {
            return;
        };
        let Some(requester) = self.end_index(head.node_id) else {
            return;
        };
        if !self.ends[1 - requester].accepting {
            return;
        }
        if self.scheduler.is_some() {
            let now = self.sim.now();
            let cycle = self.model.cycle_time();
            // windows too short for one more attempt are useless
            self.reservations
                .retain(|r| r.slot.end.map_or(true, |end| now.max(r.slot.start) + cycle <= end));
            let key = head.key();
            let Some(start) = self
                .reservations
                .iter()
                .find(|r| r.request.map_or(true, |k| k == key))
                .map(|r| r.slot.start)
            else {
                return;
            };
            if start > now {
                self.wake_at(start);
                return;
            }
        }
        self.begin_attempt();
    }

    fn wake_at(&mut self, time: u64) {
        if let Some((at, id)) = self.wakeup {
            if at == time {
                return;
            }
            self.sim.cancel(id);
        }
        let epoch = self.epoch;
        let this = self.this.clone();
        let id = self.sim.schedule_at(time, "link-wakeup", move || {
            if let Some(link) = this.upgrade() {
                link.borrow_mut().on_wakeup(epoch);
            }
        });
        self.wakeup = Some((time, id));
    }

    fn on_wakeup(&mut self, epoch: u64) {
        if epoch != self.epoch {
            return;
        }
        self.wakeup = None;
        self.try_generate();
    }

    fn begin_attempt(&mut self) {
        self.attempt_pending = true;
        let epoch = self.epoch;
        let this = self.this.clone();
        self.sim
            .schedule_after(self.model.cycle_time(), "link-attempt", move || {
                if let Some(link) = this.upgrade() {
                    link.borrow_mut().on_attempt(epoch);
                }
            });
    }

    fn on_attempt(&mut self, epoch: u64) {
        if epoch != self.epoch {
            return;
        }
        self.attempt_pending = false;
        self.stats.attempts += 1;
        let success = self.rng.gen_bool(self.model.success_probability());
        let Some(head) = self.requests.front_mut() else {
            return;
        };
        head.attempts += 1;
        let attempts = head.attempts;

        if success {
            self.deliver_pair();
        } else if self.model.max_attempts().is_some_and(|max| attempts >= max) {
            self.fail_head(ErrorCode::Timeout);
        }
        self.try_generate();
    }

    fn deliver_pair(&mut self) {
        let Some(head) = self.requests.front().copied() else {
            return;
        };
        let Some(requester) = self.end_index(head.node_id) else {
            return;
        };
        let receiver = 1 - requester;

        let local = self.ends[requester].node.qdevice().borrow_mut().allocate();
        let remote = self.ends[receiver].node.qdevice().borrow_mut().allocate();
        let (local, remote) = match (local, remote) {
            (Some(local), Some(remote)) => (local, remote),
            (local, remote) => {
                if let Some(position) = local {
                    self.ends[requester].node.qdevice().borrow_mut().free(position);
                }
                if let Some(position) = remote {
                    self.ends[receiver].node.qdevice().borrow_mut().free(position);
                }
                self.fail_head(ErrorCode::OutOfMemory);
                return;
            }
        };

        let delivered = head.delivered + 1;
        let result = ResCreateAndKeep {
            create_id: head.create_id,
            logical_qubit_id: local,
            remote_node_id: self.ends[receiver].node.id(),
            sequence_number: head.delivered,
            fidelity: self.model.fidelity(),
            attempts: head.attempts,
            time: self.sim.now(),
        };
        let peer_result = ResCreateAndKeep {
            logical_qubit_id: remote,
            remote_node_id: head.node_id,
            ..result.clone()
        };
        tracing::debug!(
            link = %self.name,
            create_id = head.create_id,
            sequence = head.delivered,
            attempts = head.attempts,
            time = result.time,
            "Delivered entangled pair"
        );
        self.stats.pairs_delivered += 1;
        self.signal(requester, EgpResult::CreateAndKeep(result.clone()));
        self.signal(receiver, EgpResult::CreateAndKeep(peer_result));

        if delivered < head.request.number {
            if let Some(head) = self.requests.front_mut() {
                head.delivered = delivered;
                head.attempts = 0;
            }
            return;
        }
        self.requests.pop_front();
        self.close_timeslot(head.key());
        self.stats.requests_completed += 1;
        if let Some(scheduler) = &self.scheduler {
            scheduler.borrow_mut().register_result(head.node_id, &result);
        }
    }

    fn fail_head(&mut self, code: ErrorCode) {
        let Some(head) = self.requests.pop_front() else {
            return;
        };
        self.close_timeslot(head.key());
        let error = ResError {
            create_id: head.create_id,
            remote_node_id: head.request.remote_node_id,
            code,
            time: self.sim.now(),
        };
        tracing::info!(
            link = %self.name,
            node = %head.node_id,
            create_id = head.create_id,
            delivered = head.delivered,
            %code,
            "Request failed"
        );
        self.stats.requests_failed += 1;
        if let Some(requester) = self.end_index(head.node_id) {
            self.signal(requester, EgpResult::Error(error));
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.borrow_mut().register_error(head.node_id, &error);
        }
    }

    fn signal(&self, end: usize, result: EgpResult) {
        match &self.ends[end].signals {
            Some(signals) => signals.deliver(result),
            None => tracing::trace!(
                link = %self.name,
                node = %self.ends[end].node.name(),
                label = %result.label(),
                "No EGP attached, dropping result"
            ),
        }
    }
}

impl Lifecycle for LinkLayer {
    fn start(&mut self) -> Result<(), ProtocolError> {
        if self.running {
            return Err(ProtocolError::AlreadyRunning(self.name.clone()));
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ProtocolError> {
        if !self.running {
            return Err(ProtocolError::NotRunning(self.name.clone()));
        }
        self.running = false;
        self.epoch += 1;
        if !self.requests.is_empty() {
            tracing::debug!(
                link = %self.name,
                dropped = self.requests.len(),
                "Dropping queued requests"
            );
        }
        self.requests.clear();
        self.reservations.clear();
        self.attempt_pending = false;
        if let Some((_, id)) = self.wakeup.take() {
            self.sim.cancel(id);
        }
        for end in &mut self.ends {
            end.accepting = false;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl fmt::Debug for LinkLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkLayer")
            .field("name", &self.name)
            .field("model", &self.model.kind())
            .field("scheduled", &self.scheduler.is_some())
            .field("running", &self.running)
            .field("requests", &self.requests.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;
    use crate::{
        builder::LinkModelBuilder,
        qdevice::QDevice,
        qlink::SignalLabel,
        simulation::SimulationConfig,
    };

    struct Fixture {
        sim: SimContext,
        link: SharedLink,
        alice: EgpSignals,
        bob: EgpSignals,
    }

    fn node(name: &str, id: u32, qubits: usize) -> ProcessingNode {
        let device = QDevice::new(format!("qdevice_{name}"), qubits);
        ProcessingNode::new(name, NodeId::new(id), "generic", device)
    }

    fn fixture(model: Box<dyn LinkModel>, qubits: usize) -> Fixture {
        let sim = SimContext::new(SimulationConfig::with_seed(11));
        let rng = sim.rng().child_with_index(0);
        let link = LinkLayer::new_shared(
            sim.clone(),
            rng,
            node("Bob", 1, qubits),
            node("Alice", 0, qubits),
            model,
        );
        let (alice, bob) = (EgpSignals::default(), EgpSignals::default());
        assert!(link.borrow_mut().attach_egp(NodeId::new(0), alice.clone()));
        assert!(link.borrow_mut().attach_egp(NodeId::new(1), bob.clone()));
        link.borrow_mut().start().unwrap();
        Fixture { sim, link, alice, bob }
    }

    fn perfect(state_delay: u64) -> Box<dyn LinkModel> {
        let a = node("x", 9, 1);
        PerfectLinkBuilder.build(&a, &a, &PerfectLinkConfig { state_delay })
    }

    fn next(signals: &EgpSignals, label: SignalLabel) -> Option<EgpResult> {
        signals.await_signal(label).now_or_never().flatten()
    }

    #[test]
    fn test_pair_is_sorted_and_symmetric() {
        assert_eq!(NodePair::new("Bob", "Alice"), NodePair::new("Alice", "Bob"));
        let pair = NodePair::new("Bob", "Alice");
        assert_eq!(pair.first(), "Alice");
        assert_eq!(pair.other("Alice"), Some("Bob"));
        assert_eq!(pair.other("Carol"), None);
        assert_eq!(pair.to_string(), "Alice<->Bob");
    }

    #[test_log::test]
    fn test_generation_waits_for_receive() {
        let f = fixture(perfect(100), 2);
        assert_eq!(f.link.borrow().name(), "link_Alice_Bob");

        f.link
            .borrow_mut()
            .put_create(NodeId::new(0), ReqCreateAndKeep::new(NodeId::new(1), 2), 0)
            .unwrap();
        f.sim.run();
        assert_eq!(f.link.borrow().stats().attempts, 0);

        f.link.borrow_mut().put_receive(NodeId::new(1), NodeId::new(0)).unwrap();
        let stats = f.sim.run();
        assert_eq!(stats.end_time, 200);

        let Some(EgpResult::CreateAndKeep(first)) = next(&f.alice, SignalLabel::CreateAndKeep)
        else {
            panic!("expected a pair for Alice");
        };
        assert_eq!((first.logical_qubit_id, first.sequence_number, first.time), (0, 0, 100));
        assert_eq!(first.remote_node_id, NodeId::new(1));
        let Some(EgpResult::CreateAndKeep(second)) = next(&f.bob, SignalLabel::CreateAndKeep) else {
            panic!("expected a pair for Bob");
        };
        assert_eq!(second.remote_node_id, NodeId::new(0));
        assert_eq!(second.create_id, 0);

        assert_eq!(f.link.borrow().stats().requests_completed, 1);
        assert_eq!(f.link.borrow().queued_requests(), 0);
    }

    #[test]
    fn test_rejects_foreign_peer_and_stopped_link() {
        let f = fixture(perfect(100), 2);
        let err = f
            .link
            .borrow_mut()
            .put_create(NodeId::new(0), ReqCreateAndKeep::new(NodeId::new(5), 1), 0)
            .unwrap_err();
        assert!(matches!(err, LinkError::WrongPeer { .. }));
        let err = f.link.borrow_mut().put_receive(NodeId::new(7), NodeId::new(0)).unwrap_err();
        assert!(matches!(err, LinkError::NotAnEnd { .. }));

        f.link.borrow_mut().stop().unwrap();
        let err = f
            .link
            .borrow_mut()
            .put_create(NodeId::new(0), ReqCreateAndKeep::new(NodeId::new(1), 1), 0)
            .unwrap_err();
        assert!(matches!(err, LinkError::NotRunning(_)));
    }

    #[test]
    fn test_memory_exhaustion_fails_request() {
        let f = fixture(perfect(10), 1);
        f.link.borrow_mut().put_receive(NodeId::new(1), NodeId::new(0)).unwrap();
        f.link
            .borrow_mut()
            .put_create(NodeId::new(0), ReqCreateAndKeep::new(NodeId::new(1), 2), 3)
            .unwrap();
        f.sim.run();

        assert!(next(&f.alice, SignalLabel::CreateAndKeep).is_some());
        let Some(EgpResult::Error(error)) = next(&f.alice, SignalLabel::Error) else {
            panic!("expected an error for Alice");
        };
        assert_eq!(error.code, ErrorCode::OutOfMemory);
        assert_eq!(error.create_id, 3);
        assert!(next(&f.bob, SignalLabel::Error).is_none());
        assert_eq!(f.link.borrow().stats().requests_failed, 1);
    }

    #[test]
    fn test_heralded_failure_after_max_attempts() {
        let a = node("x", 9, 1);
        let model = HeraldedLinkBuilder.build(
            &a,
            &a,
            &HeraldedLinkConfig {
                p_success: 0.0,
                t_cycle: 50,
                max_attempts: Some(4),
                fidelity: 1.0,
            },
        );
        let f = fixture(model, 2);
        f.link.borrow_mut().put_receive(NodeId::new(0), NodeId::new(1)).unwrap();
        f.link
            .borrow_mut()
            .put_create(NodeId::new(1), ReqCreateAndKeep::new(NodeId::new(0), 1), 0)
            .unwrap();
        let stats = f.sim.run();

        assert_eq!(stats.end_time, 200);
        assert_eq!(f.link.borrow().stats().attempts, 4);
        let Some(EgpResult::Error(error)) = next(&f.bob, SignalLabel::Error) else {
            panic!("expected a timeout for Bob");
        };
        assert_eq!(error.code, ErrorCode::Timeout);
    }

    #[test]
    fn test_stop_aborts_in_flight_attempt() {
        let f = fixture(perfect(100), 2);
        f.link.borrow_mut().put_receive(NodeId::new(1), NodeId::new(0)).unwrap();
        f.link
            .borrow_mut()
            .put_create(NodeId::new(0), ReqCreateAndKeep::new(NodeId::new(1), 1), 0)
            .unwrap();
        let link = f.link.clone();
        f.sim.schedule_at(50, "stop", move || {
            link.borrow_mut().stop().unwrap();
        });
        f.sim.run();
        assert_eq!(f.link.borrow().stats().attempts, 0);
        assert!(next(&f.alice, SignalLabel::CreateAndKeep).is_none());
    }
}
