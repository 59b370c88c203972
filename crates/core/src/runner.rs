//! Running node programs on a built network.

use std::{collections::BTreeMap, future::Future, rc::Rc};

use futures::{future::LocalBoxFuture, FutureExt};

use crate::{
    clink::ClassicalPort,
    egp::EgpHandle,
    network::{Network, NetworkError},
    node::{NodeId, NodeRegistry, ProcessingNode},
    simulation::{RunStats, SimContext},
};

/// What a node program sees of the network.
#[derive(Clone)]
pub struct ProtocolContext {
    pub node: ProcessingNode,
    /// Classical ports by peer name
    pub ports: BTreeMap<String, ClassicalPort>,
    /// EGPs by peer name
    pub egp: BTreeMap<String, EgpHandle>,
    pub node_ids: Rc<NodeRegistry>,
    pub sim: SimContext,
}

impl ProtocolContext {
    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn port(&self, peer: &str) -> Option<&ClassicalPort> {
        self.ports.get(peer)
    }

    pub fn egp(&self, peer: &str) -> Option<&EgpHandle> {
        self.egp.get(peer)
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.node_ids.id(name)
    }

    pub fn now(&self) -> u64 {
        self.sim.now()
    }
}

impl std::fmt::Debug for ProtocolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolContext")
            .field("node", &self.node.name())
            .field("ports", &self.ports.keys().collect::<Vec<_>>())
            .field("egp", &self.egp.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Application logic of one node.
pub trait Program {
    fn run(self: Box<Self>, context: ProtocolContext) -> LocalBoxFuture<'static, ()>;
}

impl<F, Fut> Program for F
where
    F: FnOnce(ProtocolContext) -> Fut,
    Fut: Future<Output = ()> + 'static,
{
    fn run(self: Box<Self>, context: ProtocolContext) -> LocalBoxFuture<'static, ()> {
        (*self)(context).boxed_local()
    }
}

/// Starts the network, runs one program per listed node until the event
/// queue drains, then stops the network.
///
/// Every node is resolved before anything starts, so an unknown name leaves
/// the network untouched.
pub fn run<I, S>(network: &mut Network, programs: I) -> Result<RunStats, NetworkError>
where
    I: IntoIterator<Item = (S, Box<dyn Program>)>,
    S: Into<String>,
{
    let programs = programs
        .into_iter()
        .map(|(node, program)| {
            let node = node.into();
            let context = network.protocol_context(&node)?;
            Ok((node, program, context))
        })
        .collect::<Result<Vec<_>, NetworkError>>()?;

    network.start()?;
    for (node, program, context) in programs {
        network.sim().spawn(node, program.run(context));
    }
    let stats = network.sim().run();
    tracing::info!(
        events = stats.events_processed,
        completed = stats.tasks_completed,
        pending = stats.tasks_pending,
        end_time = stats.end_time,
        "Simulation finished"
    );
    network.stop()?;
    Ok(stats)
}
