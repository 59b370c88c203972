//! Repeater chains: a line of repeater nodes between two end nodes.

use std::collections::BTreeMap;

use itertools::Itertools;

use super::{
    components::{ClassicalConnectionBuilder, LinkBuilder, NodeIdAllocator},
    registry::{BuildError, PreparedCLinkModel, PreparedLinkModel, PreparedQDevice},
    Prepared,
};
use crate::{config::repeater_name, controller::ProtocolController, node::ProcessingNode};

/// A built repeater chain.
#[derive(Debug, Clone)]
pub struct RepeaterChain {
    name: String,
    end_nodes: [String; 2],
    repeaters: Vec<ProcessingNode>,
    link_kind: String,
    clink_kind: String,
}

impl RepeaterChain {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn end_nodes(&self) -> &[String; 2] {
        &self.end_nodes
    }

    /// Repeaters from the first end node towards the second.
    pub fn repeaters(&self) -> &[ProcessingNode] {
        &self.repeaters
    }

    pub fn repeater(&self, index: usize) -> Option<&ProcessingNode> {
        self.repeaters.get(index)
    }

    pub fn link_kind(&self) -> &str {
        &self.link_kind
    }

    pub fn clink_kind(&self) -> &str {
        &self.clink_kind
    }

    /// Node names along the chain, end node to end node.
    pub fn path(&self) -> Vec<&str> {
        std::iter::once(self.end_nodes[0].as_str())
            .chain(self.repeaters.iter().map(ProcessingNode::name))
            .chain(std::iter::once(self.end_nodes[1].as_str()))
            .collect()
    }

    /// Consecutive node pairs joined by a physical link.
    pub fn hops(&self) -> Vec<(&str, &str)> {
        self.path().into_iter().tuple_windows().collect()
    }
}

pub(crate) struct ChainPlan {
    pub name: String,
    pub end_nodes: [String; 2],
    pub num_repeaters: usize,
    pub repeater: Prepared<PreparedQDevice>,
    pub link: Prepared<PreparedLinkModel>,
    pub clink: Prepared<PreparedCLinkModel>,
}

pub(crate) struct ChainBuilder<'p> {
    plans: &'p [ChainPlan],
    chains: BTreeMap<String, RepeaterChain>,
    /// End nodes plus repeaters, in chain order
    paths: BTreeMap<String, Vec<ProcessingNode>>,
}

impl<'p> ChainBuilder<'p> {
    pub fn new(plans: &'p [ChainPlan]) -> Self {
        let chains = plans
            .iter()
            .map(|plan| {
                let chain = RepeaterChain {
                    name: plan.name.clone(),
                    end_nodes: plan.end_nodes.clone(),
                    repeaters: Vec::with_capacity(plan.num_repeaters),
                    link_kind: plan.link.kind.clone(),
                    clink_kind: plan.clink.kind.clone(),
                };
                (plan.name.clone(), chain)
            })
            .collect();
        Self {
            plans,
            chains,
            paths: BTreeMap::new(),
        }
    }

    /// Builds the repeaters of every chain and links them to the end nodes.
    pub fn build_repeaters(
        &mut self,
        end_nodes: &BTreeMap<String, ProcessingNode>,
        ids: &mut NodeIdAllocator,
    ) -> Result<(), BuildError> {
        for plan in self.plans {
            let end = |name: &String| {
                end_nodes
                    .get(name)
                    .cloned()
                    .ok_or_else(|| BuildError::MissingNode(name.clone()))
            };
            let (first, last) = (end(&plan.end_nodes[0])?, end(&plan.end_nodes[1])?);

            let repeaters: Vec<ProcessingNode> = (0..plan.num_repeaters)
                .map(|index| {
                    let name = repeater_name(&plan.name, index);
                    let device = (plan.repeater.model)(&format!("qdevice_{name}"));
                    ProcessingNode::new(name, ids.next(), plan.repeater.kind.clone(), device)
                })
                .collect();
            tracing::debug!(
                chain = %plan.name,
                repeaters = repeaters.len(),
                "Built repeater nodes"
            );

            let mut path = Vec::with_capacity(repeaters.len() + 2);
            path.push(first);
            path.extend(repeaters.iter().cloned());
            path.push(last);
            self.paths.insert(plan.name.clone(), path);
            if let Some(chain) = self.chains.get_mut(&plan.name) {
                chain.repeaters = repeaters;
            }
        }
        Ok(())
    }

    pub fn repeaters(&self) -> impl Iterator<Item = &ProcessingNode> {
        self.chains.values().flat_map(|chain| chain.repeaters.iter())
    }

    fn hops(
        &self,
    ) -> impl Iterator<Item = (&'p ChainPlan, (&ProcessingNode, &ProcessingNode))> + '_ {
        self.plans.iter().flat_map(move |plan| {
            self.paths
                .get(&plan.name)
                .into_iter()
                .flat_map(|path| path.iter().tuple_windows())
                .map(move |hop| (plan, hop))
        })
    }

    /// One channel per hop, plus a direct channel between the two end nodes
    /// whose delay is the sum over the hops.
    pub fn build_classical_connections(&self, ports: &mut ClassicalConnectionBuilder<'_>) {
        let mut end_to_end: BTreeMap<&str, u64> = BTreeMap::new();
        for (plan, (a, b)) in self.hops() {
            let model = (plan.clink.model)(a.name(), b.name());
            *end_to_end.entry(plan.name.as_str()).or_default() += model.delay();
            ports.connect(a.name(), b.name(), model.as_ref());
        }
        for plan in self.plans.iter().filter(|plan| plan.num_repeaters > 0) {
            let delay = end_to_end.get(plan.name.as_str()).copied().unwrap_or_default();
            ports.connect_with_delay(
                &plan.end_nodes[0],
                &plan.end_nodes[1],
                &plan.clink.kind,
                delay,
            );
        }
    }

    pub fn build_links(&self, links: &mut LinkBuilder<'_>, controller: &mut ProtocolController) {
        for (plan, (a, b)) in self.hops() {
            links.add(a, b, &plan.link.model, controller);
        }
    }

    pub fn finish(self) -> BTreeMap<String, RepeaterChain> {
        self.chains
    }
}
