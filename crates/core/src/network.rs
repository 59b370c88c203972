//! The built network: flat maps of nodes, links, ports and protocols, keyed
//! by name or node pair.

use std::{collections::BTreeMap, rc::Rc};

use crate::{
    builder::{MetroHub, RepeaterChain},
    clink::ClassicalPort,
    controller::{ControllerError, ProtocolController},
    egp::EgpHandle,
    link::{NodePair, SharedLink},
    node::{NodeRegistry, ProcessingNode, Role},
    runner::ProtocolContext,
    scheduler::SharedScheduler,
    simulation::SimContext,
};

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("no node named `{0}` in the network")]
    UnknownNode(String),
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

pub struct Network {
    pub(crate) sim: SimContext,
    pub(crate) node_ids: Rc<NodeRegistry>,
    pub(crate) end_nodes: BTreeMap<String, ProcessingNode>,
    pub(crate) hubs: BTreeMap<String, MetroHub>,
    pub(crate) chains: BTreeMap<String, RepeaterChain>,
    pub(crate) links: BTreeMap<NodePair, SharedLink>,
    /// `(local, remote)` -> port of `local`
    pub(crate) ports: BTreeMap<(String, String), ClassicalPort>,
    /// `(node, peer)` -> EGP of `node` towards `peer`
    pub(crate) egps: BTreeMap<(String, String), EgpHandle>,
    pub(crate) controller: ProtocolController,
}

impl Network {
    pub fn sim(&self) -> &SimContext {
        &self.sim
    }

    pub fn node_ids(&self) -> &NodeRegistry {
        &self.node_ids
    }

    pub fn end_node(&self, name: &str) -> Option<&ProcessingNode> {
        self.end_nodes.get(name)
    }

    pub fn end_nodes(&self) -> impl Iterator<Item = &ProcessingNode> {
        self.end_nodes.values()
    }

    /// Any node, end node or repeater.
    pub fn node(&self, name: &str) -> Option<&ProcessingNode> {
        self.end_nodes.get(name).or_else(|| {
            self.chains
                .values()
                .flat_map(|chain| chain.repeaters())
                .find(|node| node.name() == name)
        })
    }

    pub fn find_role(&self, name: &str) -> Option<Role> {
        if self.end_nodes.contains_key(name) {
            Some(Role::EndNode)
        } else if self.node(name).is_some() {
            Some(Role::Repeater)
        } else {
            None
        }
    }

    pub fn hub(&self, name: &str) -> Option<&MetroHub> {
        self.hubs.get(name)
    }

    pub fn hubs(&self) -> impl Iterator<Item = &MetroHub> {
        self.hubs.values()
    }

    pub fn chain(&self, name: &str) -> Option<&RepeaterChain> {
        self.chains.get(name)
    }

    pub fn chains(&self) -> impl Iterator<Item = &RepeaterChain> {
        self.chains.values()
    }

    /// The link between `a` and `b`, in either order.
    pub fn link(&self, a: &str, b: &str) -> Option<&SharedLink> {
        self.links.get(&NodePair::new(a, b))
    }

    pub fn links(&self) -> impl Iterator<Item = (&NodePair, &SharedLink)> {
        self.links.iter()
    }

    /// Port of `local` on its channel to `remote`.
    pub fn port(&self, local: &str, remote: &str) -> Option<&ClassicalPort> {
        self.ports.get(&(local.to_string(), remote.to_string()))
    }

    /// EGP of `node` towards `peer`.
    pub fn egp(&self, node: &str, peer: &str) -> Option<&EgpHandle> {
        self.egps.get(&(node.to_string(), peer.to_string()))
    }

    pub fn scheduler(&self, hub: &str) -> Option<&SharedScheduler> {
        self.hubs.get(hub).and_then(MetroHub::scheduler)
    }

    pub fn controller(&self) -> &ProtocolController {
        &self.controller
    }

    /// Starts every link, scheduler and EGP, in that order.
    pub fn start(&mut self) -> Result<(), NetworkError> {
        tracing::info!(
            protocols = self.controller.len(),
            time = self.sim.now(),
            "Starting network"
        );
        self.controller.start_all()?;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), NetworkError> {
        tracing::info!(time = self.sim.now(), "Stopping network");
        self.controller.stop_all()?;
        Ok(())
    }

    /// Ports and EGPs of `node`, keyed by peer name.
    pub fn protocol_context(&self, node: &str) -> Result<ProtocolContext, NetworkError> {
        let processing_node = self
            .node(node)
            .cloned()
            .ok_or_else(|| NetworkError::UnknownNode(node.to_string()))?;
        let ports = self
            .ports
            .iter()
            .filter(|((local, _), _)| local == node)
            .map(|((_, remote), port)| (remote.clone(), port.clone()))
            .collect();
        let egp = self
            .egps
            .iter()
            .filter(|((local, _), _)| local == node)
            .map(|((_, peer), handle)| (peer.clone(), handle.clone()))
            .collect();
        Ok(ProtocolContext {
            node: processing_node,
            ports,
            egp,
            node_ids: self.node_ids.clone(),
            sim: self.sim.clone(),
        })
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("end_nodes", &self.end_nodes.keys().collect::<Vec<_>>())
            .field("hubs", &self.hubs.keys().collect::<Vec<_>>())
            .field("chains", &self.chains.keys().collect::<Vec<_>>())
            .field("links", &self.links.keys().collect::<Vec<_>>())
            .field("now", &self.sim.now())
            .finish()
    }
}
