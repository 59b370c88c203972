use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    rc::Rc,
};

use serde::Deserialize;

use super::{RequestKey, Reservation, ScheduleCore, ScheduleProtocol, TimeSlot};
use crate::{
    builder::{ModelConfig, ScheduleBuilder, ScheduleContext},
    controller::{Lifecycle, ProtocolError},
    node::{CreateId, NodeId},
    qlink::{ReqCreateAndKeep, ResCreateAndKeep, ResError},
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FifoScheduleConfig {
    /// Delay between activating a request and its slot opening, in ns
    pub switch_time: u64,
    /// Requests allowed to hold a slot at the same time
    pub max_multiplexing: usize,
}

impl Default for FifoScheduleConfig {
    fn default() -> Self {
        Self {
            switch_time: 1_000,
            max_multiplexing: 1,
        }
    }
}

impl ModelConfig for FifoScheduleConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_multiplexing == 0 {
            return Err("max_multiplexing must be at least 1".into());
        }
        Ok(())
    }
}

/// Backlog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueItem {
    node_id: NodeId,
    request: ReqCreateAndKeep,
    create_id: CreateId,
}

/// Activates requests in arrival order, holding at most `max_multiplexing`
/// of them at once. Everything else waits in a single backlog shared by all
/// links of the hub.
#[derive(Debug)]
pub struct FifoScheduleProtocol {
    core: ScheduleCore,
    config: FifoScheduleConfig,
    backlog: VecDeque<QueueItem>,
    active: BTreeMap<RequestKey, ReqCreateAndKeep>,
}

impl FifoScheduleProtocol {
    pub fn new(core: ScheduleCore, config: FifoScheduleConfig) -> Self {
        Self {
            core,
            config,
            backlog: VecDeque::new(),
            active: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &FifoScheduleConfig {
        &self.config
    }

    pub fn is_active(&self, node_id: NodeId, create_id: CreateId) -> bool {
        self.active.contains_key(&(node_id, create_id))
    }

    /// Backlog keys, head first.
    pub fn backlog(&self) -> impl Iterator<Item = RequestKey> + '_ {
        self.backlog.iter().map(|item| (item.node_id, item.create_id))
    }

    fn activate(&mut self, item: QueueItem) {
        let key = (item.node_id, item.create_id);
        let slot = TimeSlot {
            node: self.core.node_name(item.node_id),
            remote: self.core.node_name(item.request.remote_node_id),
            start: self.core.now() + self.config.switch_time,
            end: None,
        };
        self.active.insert(key, item.request);
        self.core.reserve(slot, Some(key));
    }

    /// Frees the slot of `key` and moves the backlog head into it.
    fn release(&mut self, key: RequestKey) {
        if self.active.remove(&key).is_none() {
            tracing::trace!(
                scheduler = %self.core.name(),
                node = %key.0,
                create_id = key.1,
                "Ignoring stale callback"
            );
            return;
        }
        self.core.release(key);
        if let Some(next) = self.backlog.pop_front() {
            self.activate(next);
        }
    }
}

impl Lifecycle for FifoScheduleProtocol {
    fn start(&mut self) -> Result<(), ProtocolError> {
        self.core.start()
    }

    fn stop(&mut self) -> Result<(), ProtocolError> {
        self.backlog.clear();
        self.active.clear();
        self.core.stop()
    }

    fn is_running(&self) -> bool {
        self.core.is_running()
    }
}

impl ScheduleProtocol for FifoScheduleProtocol {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn register_request(
        &mut self,
        node_id: NodeId,
        request: &ReqCreateAndKeep,
        create_id: CreateId,
    ) {
        let item = QueueItem {
            node_id,
            request: *request,
            create_id,
        };
        if self.active.len() < self.config.max_multiplexing {
            self.activate(item);
        } else {
            tracing::debug!(
                scheduler = %self.core.name(),
                node = %node_id,
                create_id,
                backlog = self.backlog.len() + 1,
                "Queueing request"
            );
            self.backlog.push_back(item);
        }
    }

    fn register_result(&mut self, node_id: NodeId, result: &ResCreateAndKeep) {
        self.release((node_id, result.create_id));
    }

    fn register_error(&mut self, node_id: NodeId, error: &ResError) {
        tracing::debug!(
            scheduler = %self.core.name(),
            node = %node_id,
            create_id = error.create_id,
            code = %error.code,
            "Releasing slot of failed request"
        );
        self.release((node_id, error.create_id));
    }

    fn reservations(&self) -> &[Reservation] {
        self.core.reservations()
    }

    fn active_requests(&self) -> usize {
        self.active.len()
    }

    fn queued_requests(&self) -> usize {
        self.backlog.len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FifoScheduleBuilder;

impl ScheduleBuilder for FifoScheduleBuilder {
    type Config = FifoScheduleConfig;
    type Protocol = FifoScheduleProtocol;

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
        Rc::new(RefCell::new(FifoScheduleProtocol::new(core, config.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        qlink::ErrorCode,
        scheduler::test_support::{detached, request, result},
        simulation::SimContext,
    };

    fn scheduler(
        nodes: u32,
        switch_time: u64,
        max_multiplexing: usize,
    ) -> (SimContext, FifoScheduleProtocol) {
        let (sim, ids, links) = detached(nodes);
        let core = ScheduleCore::new("hub", sim.clone(), ids, links);
        let mut protocol = FifoScheduleProtocol::new(
            core,
            FifoScheduleConfig {
                switch_time,
                max_multiplexing,
            },
        );
        protocol.start().unwrap();
        (sim, protocol)
    }

    fn n(id: u32) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn test_single_slot_backlog_and_handover() {
        let (sim, mut fifo) = scheduler(2, 1_000, 1);
        for create_id in 0..3 {
            fifo.register_request(n(0), &request(1), create_id);
        }
        assert_eq!(fifo.active_requests(), 1);
        assert!(fifo.is_active(n(0), 0));
        assert_eq!(fifo.queued_requests(), 2);
        assert_eq!(fifo.reservations().len(), 1);
        assert_eq!(fifo.reservations()[0].slot.start, 1_000);
        assert_eq!(fifo.reservations()[0].slot.end, None);

        sim.run_until(500);
        fifo.register_result(n(0), &result(0, 1));

        assert!(fifo.is_active(n(0), 1));
        assert_eq!(fifo.queued_requests(), 1);
        let reservations = fifo.reservations();
        assert_eq!(reservations[0].slot.end, Some(500));
        assert_eq!(reservations[1].slot.start, 1_500);
        assert_eq!(reservations[1].request, Some((n(0), 1)));
    }

    #[test]
    fn test_independent_pairs_activate_together() {
        let (_sim, mut fifo) = scheduler(4, 1_000, 2);
        fifo.register_request(n(0), &request(1), 0);
        fifo.register_request(n(2), &request(3), 0);

        assert_eq!(fifo.active_requests(), 2);
        assert_eq!(fifo.queued_requests(), 0);
        let pairs: Vec<_> = fifo
            .reservations()
            .iter()
            .map(|r| (r.slot.node.clone(), r.slot.remote.clone()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("node_0".to_string(), "node_1".to_string()),
                ("node_2".to_string(), "node_3".to_string())
            ]
        );
    }

    #[test]
    fn test_active_table_never_exceeds_bound() {
        let (_sim, mut fifo) = scheduler(3, 0, 2);
        for create_id in 0..10 {
            fifo.register_request(n(create_id % 3), &request((create_id + 1) % 3), create_id);
            assert!(fifo.active_requests() <= 2);
        }
        assert_eq!(fifo.queued_requests(), 8);
        let backlog: Vec<_> = fifo.backlog().map(|(_, cid)| cid).collect();
        assert_eq!(backlog, (2..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_backlog_order_ignores_which_peer_is_free() {
        let (_sim, mut fifo) = scheduler(4, 0, 1);
        fifo.register_request(n(0), &request(1), 0);
        fifo.register_request(n(0), &request(1), 1);
        fifo.register_request(n(2), &request(3), 0);

        fifo.register_result(n(0), &result(0, 1));
        assert!(fifo.is_active(n(0), 1));
        assert!(!fifo.is_active(n(2), 0));

        fifo.register_result(n(0), &result(1, 1));
        assert!(fifo.is_active(n(2), 0));
    }

    #[test]
    fn test_unknown_and_repeated_results_are_ignored() {
        let (_sim, mut fifo) = scheduler(2, 0, 1);
        fifo.register_request(n(0), &request(1), 0);
        fifo.register_request(n(0), &request(1), 1);
        fifo.register_request(n(0), &request(1), 2);

        fifo.register_result(n(1), &result(0, 0));
        fifo.register_result(n(0), &result(7, 1));
        assert_eq!((fifo.active_requests(), fifo.queued_requests()), (1, 2));

        fifo.register_result(n(0), &result(0, 1));
        assert_eq!((fifo.active_requests(), fifo.queued_requests()), (1, 1));
        fifo.register_result(n(0), &result(0, 1));
        assert_eq!((fifo.active_requests(), fifo.queued_requests()), (1, 1));
        assert_eq!(fifo.reservations().len(), 2);
    }

    #[test]
    fn test_error_releases_slot() {
        let (_sim, mut fifo) = scheduler(2, 0, 1);
        fifo.register_request(n(0), &request(1), 0);
        fifo.register_request(n(1), &request(0), 0);

        fifo.register_error(
            n(0),
            &ResError {
                create_id: 0,
                remote_node_id: n(1),
                code: ErrorCode::Timeout,
                time: 0,
            },
        );
        assert!(fifo.is_active(n(1), 0));
        assert_eq!(fifo.queued_requests(), 0);
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config: FifoScheduleConfig = toml::from_str("").unwrap();
        assert_eq!(config, FifoScheduleConfig::default());
        assert_eq!(config.switch_time, 1_000);
        let zero: FifoScheduleConfig = toml::from_str("max_multiplexing = 0").unwrap();
        assert!(zero.validate().is_err());
    }
}
