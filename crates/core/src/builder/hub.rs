//! Metropolitan hubs: stars of end nodes whose links share one scheduler.

use std::{collections::BTreeMap, rc::Rc};

use itertools::Itertools;

use super::{
    components::{ClassicalConnectionBuilder, LinkBuilder},
    registry::{BuildError, Category, PreparedScheduler, ScheduleContext},
    Prepared,
};
use crate::{
    builder::registry::{PreparedCLinkModel, PreparedLinkModel},
    controller::ProtocolController,
    link::{NodePair, SharedLink},
    node::{NodeRegistry, ProcessingNode},
    scheduler::SharedScheduler,
    simulation::SimContext,
};

/// A built hub.
#[derive(Clone)]
pub struct MetroHub {
    name: String,
    end_nodes: Vec<String>,
    link_kind: String,
    clink_kind: String,
    scheduler_kind: String,
    scheduler: Option<SharedScheduler>,
}

impl MetroHub {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Member end nodes, in configuration order.
    pub fn end_nodes(&self) -> &[String] {
        &self.end_nodes
    }

    pub fn link_kind(&self) -> &str {
        &self.link_kind
    }

    pub fn clink_kind(&self) -> &str {
        &self.clink_kind
    }

    pub fn scheduler_kind(&self) -> &str {
        &self.scheduler_kind
    }

    pub fn scheduler(&self) -> Option<&SharedScheduler> {
        self.scheduler.as_ref()
    }

    /// Every unordered pair of members.
    pub fn pairs(&self) -> Vec<NodePair> {
        self.end_nodes
            .iter()
            .tuple_combinations()
            .map(|(a, b)| NodePair::new(a.as_str(), b.as_str()))
            .collect()
    }
}

impl std::fmt::Debug for MetroHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetroHub")
            .field("name", &self.name)
            .field("end_nodes", &self.end_nodes)
            .field("link_kind", &self.link_kind)
            .field("scheduler_kind", &self.scheduler_kind)
            .finish()
    }
}

pub(crate) struct HubPlan {
    pub name: String,
    pub nodes: Vec<String>,
    pub link: Prepared<PreparedLinkModel>,
    pub clink: Prepared<PreparedCLinkModel>,
    pub scheduler: Prepared<PreparedScheduler>,
}

pub(crate) struct HubBuilder<'p> {
    plans: &'p [HubPlan],
    hubs: BTreeMap<String, MetroHub>,
    members: BTreeMap<String, Vec<ProcessingNode>>,
}

impl<'p> HubBuilder<'p> {
    pub fn new(plans: &'p [HubPlan]) -> Self {
        let hubs = plans
            .iter()
            .map(|plan| {
                let hub = MetroHub {
                    name: plan.name.clone(),
                    end_nodes: plan.nodes.clone(),
                    link_kind: plan.link.kind.clone(),
                    clink_kind: plan.clink.kind.clone(),
                    scheduler_kind: plan.scheduler.kind.clone(),
                    scheduler: None,
                };
                (plan.name.clone(), hub)
            })
            .collect();
        Self {
            plans,
            hubs,
            members: BTreeMap::new(),
        }
    }

    pub fn attach_end_nodes(
        &mut self,
        end_nodes: &BTreeMap<String, ProcessingNode>,
    ) -> Result<(), BuildError> {
        for plan in self.plans {
            let members = plan
                .nodes
                .iter()
                .map(|name| {
                    end_nodes
                        .get(name)
                        .cloned()
                        .ok_or_else(|| BuildError::MissingNode(name.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            self.members.insert(plan.name.clone(), members);
        }
        Ok(())
    }

    fn member_pairs(
        &self,
    ) -> impl Iterator<Item = (&'p HubPlan, (&ProcessingNode, &ProcessingNode))> + '_ {
        self.plans.iter().flat_map(move |plan| {
            self.members
                .get(&plan.name)
                .into_iter()
                .flat_map(|members| members.iter().tuple_combinations())
                .map(move |pair| (plan, pair))
        })
    }

    pub fn build_classical_connections(&self, ports: &mut ClassicalConnectionBuilder<'_>) {
        for (plan, (a, b)) in self.member_pairs() {
            let model = (plan.clink.model)(a.name(), b.name());
            ports.connect(a.name(), b.name(), model.as_ref());
        }
    }

    pub fn build_links(&self, links: &mut LinkBuilder<'_>, controller: &mut ProtocolController) {
        for (plan, (a, b)) in self.member_pairs() {
            links.add(a, b, &plan.link.model, controller);
        }
    }

    /// Builds one scheduler per hub and puts the hub's links under it.
    pub fn build_schedulers(
        &mut self,
        sim: &SimContext,
        node_ids: &Rc<NodeRegistry>,
        links: &BTreeMap<NodePair, SharedLink>,
        controller: &mut ProtocolController,
    ) -> Result<(), BuildError> {
        for plan in self.plans {
            let Some(hub) = self.hubs.get_mut(&plan.name) else {
                continue;
            };
            let hub_links: BTreeMap<NodePair, SharedLink> = hub
                .pairs()
                .into_iter()
                .filter_map(|pair| links.get(&pair).map(|link| (pair, link.clone())))
                .collect();
            let context = ScheduleContext {
                name: &plan.name,
                sim,
                node_ids,
                links: hub_links
                    .iter()
                    .map(|(pair, link)| (pair.clone(), Rc::downgrade(link)))
                    .collect(),
            };
            let scheduler = (plan.scheduler.model)(context);
            if let Some(window) = scheduler.borrow().shortest_window() {
                for link in hub_links.values() {
                    let link = link.borrow();
                    if link.cycle_time() > window {
                        return Err(BuildError::InvalidConfig {
                            category: Category::Scheduler,
                            kind: plan.scheduler.kind.clone(),
                            reason: format!(
                                "window of {window} ns cannot fit one {} ns attempt on {}",
                                link.cycle_time(),
                                link.name()
                            ),
                        });
                    }
                }
            }
            for link in hub_links.values() {
                link.borrow_mut().set_scheduler(scheduler.clone());
            }
            tracing::debug!(
                hub = %plan.name,
                kind = %plan.scheduler.kind,
                links = hub_links.len(),
                "Built hub scheduler"
            );
            controller.register(format!("scheduler_{}", plan.name), scheduler.clone());
            hub.scheduler = Some(scheduler);
        }
        Ok(())
    }

    pub fn finish(self) -> BTreeMap<String, MetroHub> {
        self.hubs
    }
}
