//! Builders for the pieces every topology section shares: nodes, classical
//! ports, links and EGPs.

use std::{cell::RefCell, collections::BTreeMap, rc::Rc};

use super::{
    registry::{BuildError, PreparedCLinkModel, PreparedLinkModel, PreparedQDevice},
    ConnectionPlan, Prepared,
};
use crate::{
    clink::{self, CLinkModel, ClassicalPort, FixedDelay},
    controller::ProtocolController,
    egp::{EgpHandle, EgpProtocol},
    link::{LinkLayer, NodePair, SharedLink},
    node::{NodeId, ProcessingNode},
    simulation::SimContext,
};

/// Hands out node ids in build order.
#[derive(Debug, Default)]
pub(crate) struct NodeIdAllocator {
    next: u32,
}

impl NodeIdAllocator {
    pub fn next(&mut self) -> NodeId {
        let id = NodeId::new(self.next);
        self.next += 1;
        id
    }
}

pub(crate) struct StackPlan {
    pub name: String,
    pub qdevice: Prepared<PreparedQDevice>,
}

pub(crate) struct NodeBuilder;

impl NodeBuilder {
    /// Builds the end nodes in configuration order.
    pub fn build(
        stacks: &[StackPlan],
        ids: &mut NodeIdAllocator,
    ) -> BTreeMap<String, ProcessingNode> {
        stacks
            .iter()
            .map(|stack| {
                let device = (stack.qdevice.model)(&format!("qdevice_{}", stack.name));
                let node = ProcessingNode::new(
                    stack.name.clone(),
                    ids.next(),
                    stack.qdevice.kind.clone(),
                    device,
                );
                tracing::debug!(
                    node = %stack.name,
                    id = %node.id(),
                    kind = %stack.qdevice.kind,
                    "Built end node"
                );
                (stack.name.clone(), node)
            })
            .collect()
    }
}

pub(crate) struct ClassicalConnectionBuilder<'a> {
    sim: &'a SimContext,
    ports: BTreeMap<(String, String), ClassicalPort>,
}

impl<'a> ClassicalConnectionBuilder<'a> {
    pub fn new(sim: &'a SimContext) -> Self {
        Self {
            sim,
            ports: BTreeMap::new(),
        }
    }

    pub fn connect(&mut self, a: &str, b: &str, model: &dyn CLinkModel) {
        let (port_a, port_b) = clink::connect(self.sim, a, b, model);
        tracing::trace!(
            a,
            b,
            kind = model.kind(),
            delay = model.delay(),
            "Connected classical ports"
        );
        self.ports.insert((a.to_string(), b.to_string()), port_a);
        self.ports.insert((b.to_string(), a.to_string()), port_b);
    }

    pub fn connect_with_delay(&mut self, a: &str, b: &str, kind: &str, delay: u64) {
        self.connect(a, b, &FixedDelay::new(kind, delay));
    }

    pub fn build_direct(&mut self, plans: &[ConnectionPlan<PreparedCLinkModel>]) {
        for plan in plans {
            let [a, b] = &plan.nodes;
            let model = (plan.model.model)(a, b);
            self.connect(a, b, model.as_ref());
        }
    }

    pub fn finish(self) -> BTreeMap<(String, String), ClassicalPort> {
        self.ports
    }
}

pub(crate) struct LinkBuilder<'a> {
    sim: &'a SimContext,
    links: BTreeMap<NodePair, SharedLink>,
}

impl<'a> LinkBuilder<'a> {
    pub fn new(sim: &'a SimContext) -> Self {
        Self {
            sim,
            links: BTreeMap::new(),
        }
    }

    /// Builds the link between `a` and `b` and registers it for start/stop.
    /// Each link draws from its own RNG stream, numbered in build order.
    pub fn add(
        &mut self,
        a: &ProcessingNode,
        b: &ProcessingNode,
        model: &PreparedLinkModel,
        controller: &mut ProtocolController,
    ) -> SharedLink {
        let rng = self.sim.rng().child_with_index(self.links.len() as u64);
        let link = LinkLayer::new_shared(self.sim.clone(), rng, a.clone(), b.clone(), model(a, b));
        let (name, pair) = {
            let link = link.borrow();
            (link.name().to_string(), link.pair().clone())
        };
        tracing::debug!(link = %name, kind = %link.borrow().model_kind(), "Built link");
        controller.register(name, link.clone());
        self.links.insert(pair, link.clone());
        link
    }

    pub fn build_direct(
        &mut self,
        plans: &[ConnectionPlan<PreparedLinkModel>],
        end_nodes: &BTreeMap<String, ProcessingNode>,
        controller: &mut ProtocolController,
    ) -> Result<(), BuildError> {
        for plan in plans {
            let node = |name: &String| {
                end_nodes
                    .get(name)
                    .ok_or_else(|| BuildError::MissingNode(name.clone()))
            };
            let (a, b) = (node(&plan.nodes[0])?, node(&plan.nodes[1])?);
            self.add(a, b, &plan.model.model, controller);
        }
        Ok(())
    }

    pub fn links(&self) -> &BTreeMap<NodePair, SharedLink> {
        &self.links
    }

    pub fn finish(self) -> BTreeMap<NodePair, SharedLink> {
        self.links
    }
}

pub(crate) struct EgpBuilder;

impl EgpBuilder {
    /// Two EGPs, one per direction, for every link joining two end nodes.
    pub fn build(
        end_nodes: &BTreeMap<String, ProcessingNode>,
        links: &BTreeMap<NodePair, SharedLink>,
        controller: &mut ProtocolController,
    ) -> BTreeMap<(String, String), EgpHandle> {
        let mut egps = BTreeMap::new();
        for (pair, link) in links {
            let (Some(a), Some(b)) = (end_nodes.get(pair.first()), end_nodes.get(pair.second()))
            else {
                continue;
            };
            for (node, peer) in [(a, b), (b, a)] {
                let egp = Rc::new(RefCell::new(EgpProtocol::new(node.clone(), peer, link.clone())));
                let (name, signals) = {
                    let egp = egp.borrow();
                    (egp.name().to_string(), egp.signals().clone())
                };
                link.borrow_mut().attach_egp(node.id(), signals);
                controller.register(name, egp.clone());
                egps.insert(
                    (node.name().to_string(), peer.name().to_string()),
                    EgpHandle::new(egp),
                );
            }
        }
        egps
    }
}
