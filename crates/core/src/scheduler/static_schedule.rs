//! Timetable scheduler.
//!
//! Link pairs are sorted and split into groups of `max_multiplexing`. One
//! cycle gives every group, in order, a window of `time_window` ns preceded
//! by `switch_time` ns of reconfiguration:
//!
//! ```text
//! cycle length T = groups * (switch_time + time_window)
//! group g, cycle c: [origin + c*T + g*(S+W) + S, ... + W)
//! ```
//!
//! The timetable depends only on elapsed time since start. Cycles are only
//! materialized while requests are outstanding, so an idle hub lets the
//! simulation drain.

use std::{
    cell::RefCell,
    collections::BTreeSet,
    rc::{Rc, Weak},
};

use serde::Deserialize;

use super::{RequestKey, Reservation, ScheduleCore, ScheduleProtocol, TimeSlot};
use crate::{
    builder::{ModelConfig, ScheduleBuilder, ScheduleContext},
    controller::{Lifecycle, ProtocolError},
    link::NodePair,
    node::{CreateId, NodeId},
    qlink::{ReqCreateAndKeep, ResCreateAndKeep, ResError},
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StaticScheduleConfig {
    /// Length of one window, in ns
    pub time_window: u64,
    /// Gap before every window, in ns
    pub switch_time: u64,
    /// Pairs sharing a window
    pub max_multiplexing: usize,
}

impl Default for StaticScheduleConfig {
    fn default() -> Self {
        Self {
            time_window: 1_000_000,
            switch_time: 0,
            max_multiplexing: 1,
        }
    }
}

impl ModelConfig for StaticScheduleConfig {
    fn validate(&self) -> Result<(), String> {
        if self.time_window == 0 {
            return Err("time_window must be positive".into());
        }
        if self.max_multiplexing == 0 {
            return Err("max_multiplexing must be at least 1".into());
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct StaticScheduleProtocol {
    core: ScheduleCore,
    config: StaticScheduleConfig,
    groups: Vec<Vec<NodePair>>,
    active: BTreeSet<RequestKey>,
    origin: u64,
    /// Next cycle boundary is scheduled
    armed: bool,
    epoch: u64,
    self_ref: Weak<RefCell<StaticScheduleProtocol>>,
}

impl StaticScheduleProtocol {
    pub fn new(
        core: ScheduleCore,
        config: StaticScheduleConfig,
        self_ref: Weak<RefCell<StaticScheduleProtocol>>,
    ) -> Self {
        let pairs: Vec<NodePair> = core.pairs().cloned().collect();
        let groups = pairs
            .chunks(config.max_multiplexing.max(1))
            .map(<[NodePair]>::to_vec)
            .collect();
        Self {
            core,
            config,
            groups,
            active: BTreeSet::new(),
            origin: 0,
            armed: false,
            epoch: 0,
            self_ref,
        }
    }

    pub fn config(&self) -> &StaticScheduleConfig {
        &self.config
    }

    pub fn groups(&self) -> &[Vec<NodePair>] {
        &self.groups
    }

    fn period(&self) -> u64 {
        self.groups.len() as u64 * (self.config.switch_time + self.config.time_window)
    }

    fn group_of(&self, pair: &NodePair) -> Option<usize> {
        self.groups.iter().position(|group| group.contains(pair))
    }

    fn window(&self, pair: &NodePair, group: usize, cycle: u64) -> TimeSlot {
        let start = self.origin
            + cycle * self.period()
            + group as u64 * (self.config.switch_time + self.config.time_window)
            + self.config.switch_time;
        TimeSlot {
            node: pair.first().to_string(),
            remote: pair.second().to_string(),
            start,
            end: Some(start + self.config.time_window),
        }
    }

    /// Window of `pair` covering time `t`, if the timetable has one.
    pub fn window_for(&self, pair: &NodePair, t: u64) -> Option<TimeSlot> {
        let group = self.group_of(pair)?;
        let period = self.period();
        if period == 0 || t < self.origin {
            return None;
        }
        let cycle = (t - self.origin) / period;
        let window = self.window(pair, group, cycle);
        window.contains(t).then_some(window)
    }

    fn reserve_cycle(&mut self, cycle: u64) {
        let now = self.core.now();
        let windows: Vec<TimeSlot> = self
            .groups
            .iter()
            .enumerate()
            .flat_map(|(g, group)| group.iter().map(move |pair| (g, pair)))
            .map(|(g, pair)| self.window(pair, g, cycle))
            .filter(|slot| slot.end.map_or(true, |end| end > now))
            .collect();
        for slot in windows {
            self.core.reserve(slot, None);
        }

        let boundary = self.origin + (cycle + 1) * self.period();
        let epoch = self.epoch;
        let this = self.self_ref.clone();
        self.core.sim().schedule_at(boundary, "static-cycle", move || {
            if let Some(this) = this.upgrade() {
                this.borrow_mut().on_cycle_boundary(epoch, cycle + 1);
            }
        });
        self.armed = true;
    }

    fn on_cycle_boundary(&mut self, epoch: u64, cycle: u64) {
        if epoch != self.epoch || !self.core.is_running() {
            return;
        }
        if self.active.is_empty() {
            tracing::trace!(scheduler = %self.core.name(), cycle, "Timetable idle");
            self.armed = false;
            return;
        }
        self.reserve_cycle(cycle);
    }

    fn arm(&mut self) {
        let period = self.period();
        if self.armed || period == 0 || !self.core.is_running() {
            return;
        }
        let cycle = self.core.now().saturating_sub(self.origin) / period;
        tracing::debug!(scheduler = %self.core.name(), cycle, "Resuming timetable");
        self.reserve_cycle(cycle);
    }
}

impl Lifecycle for StaticScheduleProtocol {
    fn start(&mut self) -> Result<(), ProtocolError> {
        self.core.start()?;
        self.origin = self.core.now();
        if !self.active.is_empty() {
            self.arm();
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ProtocolError> {
        self.epoch += 1;
        self.armed = false;
        self.active.clear();
        self.core.stop()
    }

    fn is_running(&self) -> bool {
        self.core.is_running()
    }
}

impl ScheduleProtocol for StaticScheduleProtocol {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn register_request(
        &mut self,
        node_id: NodeId,
        _request: &ReqCreateAndKeep,
        create_id: CreateId,
    ) {
        self.active.insert((node_id, create_id));
        self.arm();
    }

    fn register_result(&mut self, node_id: NodeId, result: &ResCreateAndKeep) {
        self.active.remove(&(node_id, result.create_id));
    }

    fn register_error(&mut self, node_id: NodeId, error: &ResError) {
        self.active.remove(&(node_id, error.create_id));
    }

    fn reservations(&self) -> &[Reservation] {
        self.core.reservations()
    }

    fn active_requests(&self) -> usize {
        self.active.len()
    }

    fn queued_requests(&self) -> usize {
        0
    }

    fn shortest_window(&self) -> Option<u64> {
        Some(self.config.time_window)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StaticScheduleBuilder;

impl ScheduleBuilder for StaticScheduleBuilder {
    type Config = StaticScheduleConfig;
    type Protocol = StaticScheduleProtocol;

    fn build(
        &self,
        context: ScheduleContext<'_>,
        config: &Self::Config,
    ) -> Rc<RefCell<Self::Protocol>> {
        let core = ScheduleCore::new(
            context.name,
            context.sim.clone(),
            context.node_ids.clone(),
            context.links,
        );
        Rc::new_cyclic(|this| {
            RefCell::new(StaticScheduleProtocol::new(
                core,
                config.clone(),
                this.clone(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        node::NodeRegistry,
        scheduler::test_support::{detached, request, result},
        simulation::SimContext,
    };

    fn scheduler(
        nodes: u32,
        config: StaticScheduleConfig,
    ) -> (SimContext, Rc<RefCell<StaticScheduleProtocol>>) {
        let (sim, ids, links): (SimContext, Rc<NodeRegistry>, _) = detached(nodes);
        let context = ScheduleContext {
            name: "hub",
            sim: &sim,
            node_ids: &ids,
            links,
        };
        let protocol = StaticScheduleBuilder.build(context, &config);
        protocol.borrow_mut().start().unwrap();
        (sim, protocol)
    }

    fn config(time_window: u64, switch_time: u64, max_multiplexing: usize) -> StaticScheduleConfig {
        StaticScheduleConfig {
            time_window,
            switch_time,
            max_multiplexing,
        }
    }

    #[test]
    fn test_timetable_layout() {
        // 3 nodes -> 3 pairs -> groups of 2 and 1
        let (_sim, protocol) = scheduler(3, config(100, 10, 2));
        let protocol = protocol.borrow();
        assert_eq!(protocol.groups().len(), 2);
        assert_eq!(protocol.period(), 220);

        let first = NodePair::new("node_0", "node_1");
        let last = NodePair::new("node_1", "node_2");
        assert_eq!(protocol.window_for(&first, 5), None);
        assert_eq!(
            protocol.window_for(&first, 10).map(|w| (w.start, w.end)),
            Some((10, Some(110)))
        );
        assert_eq!(protocol.window_for(&first, 110), None);
        assert_eq!(protocol.window_for(&last, 125).map(|w| w.start), Some(120));
        assert_eq!(protocol.window_for(&last, 345).map(|w| w.start), Some(340));
        assert_eq!(protocol.window_for(&NodePair::new("node_0", "node_9"), 10), None);
    }

    #[test]
    fn test_idle_scheduler_reserves_nothing() {
        let (sim, protocol) = scheduler(2, config(100, 0, 1));
        let stats = sim.run();
        assert_eq!(stats.end_time, 0);
        assert!(protocol.borrow().reservations().is_empty());
    }

    #[test]
    fn test_cycles_follow_outstanding_requests() {
        let (sim, protocol) = scheduler(3, config(100, 0, 1));
        let p = protocol.clone();
        sim.schedule_at(150, "request", move || {
            p.borrow_mut().register_request(NodeId::new(0), &request(1), 0);
        });
        let p = protocol.clone();
        sim.schedule_at(450, "result", move || {
            p.borrow_mut().register_result(NodeId::new(0), &result(0, 1));
        });
        sim.run();

        let protocol = protocol.borrow();
        let starts: Vec<u64> = protocol.reservations().iter().map(|r| r.slot.start).collect();
        // cycle 0 from t=150 skips the elapsed first window, cycle 1 is full,
        // the boundary at 600 finds the hub idle
        assert_eq!(starts, vec![100, 200, 300, 400, 500]);
        assert!(protocol.reservations().iter().all(|r| r.request.is_none()));
        assert_eq!(protocol.active_requests(), 0);
        assert!(!protocol.armed);
    }

    #[test]
    fn test_stop_disarms() {
        let (sim, protocol) = scheduler(2, config(100, 0, 1));
        protocol.borrow_mut().register_request(NodeId::new(0), &request(1), 0);
        protocol.borrow_mut().stop().unwrap();
        let stats = sim.run();
        assert_eq!(stats.end_time, 100);
        assert_eq!(protocol.borrow().reservations().len(), 1);
    }
}
