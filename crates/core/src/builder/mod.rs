//! Turns a [`TopologyConfig`] into a runnable [`Network`].
//!
//! Building happens in two phases. Planning resolves every model kind in the
//! registries and parses every model config; nothing is constructed until
//! the whole topology plans cleanly. Construction then runs in dependency
//! order:
//!
//! 1. hub and chain containers
//! 2. end nodes and their devices
//! 3. hub membership and chain repeaters
//! 4. the node name/id registry
//! 5. classical ports: direct, hub, chain
//! 6. links: direct, hub, chain
//! 7. hub schedulers, which need the links and the registry
//! 8. EGPs for every link joining two end nodes

use std::rc::Rc;

use crate::{
    clink::{DefaultCLinkBuilder, InstantCLinkBuilder},
    config::{ComponentConfig, TopologyConfig},
    controller::ProtocolController,
    link::{DepolariseLinkBuilder, HeraldedLinkBuilder, PerfectLinkBuilder},
    network::Network,
    node::{NodeRegistry, ProcessingNode},
    qdevice::{GenericQDeviceBuilder, NvQDeviceBuilder},
    scheduler::{FifoScheduleBuilder, StaticScheduleBuilder},
    simulation::{SimContext, SimulationConfig},
};

mod chain;
mod components;
mod hub;
mod registry;

pub use chain::RepeaterChain;
pub use hub::MetroHub;
pub use registry::{
    parse_model_config, BuildError, CLinkBuilder, Category, ErasedCLinkBuilder,
    ErasedLinkModelBuilder,
    ErasedQDeviceBuilder, ErasedScheduleBuilder, LinkModelBuilder, ModelConfig, PreparedCLinkModel,
    PreparedLinkModel, PreparedQDevice, PreparedScheduler, QDeviceBuilder, Registry,
    ScheduleBuilder,
    ScheduleContext,
};

use chain::{ChainBuilder, ChainPlan};
use components::{
    ClassicalConnectionBuilder, EgpBuilder, LinkBuilder, NodeBuilder, NodeIdAllocator, StackPlan,
};
use hub::{HubBuilder, HubPlan};

/// A resolved model: its key and the constructor prepared from its config.
pub(crate) struct Prepared<M> {
    pub kind: String,
    pub model: M,
}

pub(crate) struct ConnectionPlan<M> {
    pub nodes: [String; 2],
    pub model: Prepared<M>,
}

/// Everything `build` needs, checked against the registries.
struct BuildPlan {
    stacks: Vec<StackPlan>,
    links: Vec<ConnectionPlan<PreparedLinkModel>>,
    clinks: Vec<ConnectionPlan<PreparedCLinkModel>>,
    hubs: Vec<HubPlan>,
    chains: Vec<ChainPlan>,
}

pub struct NetworkBuilder {
    qdevices: Registry<dyn ErasedQDeviceBuilder>,
    links: Registry<dyn ErasedLinkModelBuilder>,
    clinks: Registry<dyn ErasedCLinkBuilder>,
    schedulers: Registry<dyn ErasedScheduleBuilder>,
    simulation: SimulationConfig,
}

impl Default for NetworkBuilder {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl NetworkBuilder {
    /// A builder with empty registries.
    pub fn new() -> Self {
        Self {
            qdevices: Registry::new(Category::QDevice),
            links: Registry::new(Category::Link),
            clinks: Registry::new(Category::CLink),
            schedulers: Registry::new(Category::Scheduler),
            simulation: SimulationConfig::default(),
        }
    }

    /// A builder with every built-in model registered.
    pub fn with_defaults() -> Self {
        let mut builder = Self::new();
        builder
            .register_qdevice("generic", GenericQDeviceBuilder)
            .register_qdevice("nv", NvQDeviceBuilder)
            .register_link("perfect", PerfectLinkBuilder)
            .register_link("depolarise", DepolariseLinkBuilder)
            .register_link("heralded", HeraldedLinkBuilder)
            .register_clink("instant", InstantCLinkBuilder)
            .register_clink("default", DefaultCLinkBuilder)
            .register_scheduler("fifo", FifoScheduleBuilder)
            .register_scheduler("static", StaticScheduleBuilder);
        builder
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.simulation.seed = seed;
        self
    }

    pub fn with_simulation_config(mut self, simulation: SimulationConfig) -> Self {
        self.simulation = simulation;
        self
    }

    pub fn simulation_config(&self) -> &SimulationConfig {
        &self.simulation
    }

    pub fn register_qdevice<B: QDeviceBuilder>(
        &mut self,
        key: impl Into<String>,
        builder: B,
    ) -> &mut Self {
        self.qdevices.insert(key, Rc::new(builder));
        self
    }

    pub fn register_link<B: LinkModelBuilder>(
        &mut self,
        key: impl Into<String>,
        builder: B,
    ) -> &mut Self {
        self.links.insert(key, Rc::new(builder));
        self
    }

    pub fn register_clink<B: CLinkBuilder>(
        &mut self,
        key: impl Into<String>,
        builder: B,
    ) -> &mut Self {
        self.clinks.insert(key, Rc::new(builder));
        self
    }

    pub fn register_scheduler<B: ScheduleBuilder>(
        &mut self,
        key: impl Into<String>,
        builder: B,
    ) -> &mut Self {
        self.schedulers.insert(key, Rc::new(builder));
        self
    }

    /// Registered keys of one category, sorted.
    pub fn registered(&self, category: Category) -> Vec<&str> {
        match category {
            Category::QDevice => self.qdevices.keys().collect(),
            Category::Link => self.links.keys().collect(),
            Category::CLink => self.clinks.keys().collect(),
            Category::Scheduler => self.schedulers.keys().collect(),
        }
    }

    fn plan(&self, config: &TopologyConfig) -> Result<BuildPlan, BuildError> {
        let qdevice = |c: &ComponentConfig| -> Result<Prepared<PreparedQDevice>, BuildError> {
            Ok(Prepared {
                kind: c.kind.clone(),
                model: self.qdevices.prepare(&c.kind, &c.config)?,
            })
        };
        let link = |c: &ComponentConfig| -> Result<Prepared<PreparedLinkModel>, BuildError> {
            Ok(Prepared {
                kind: c.kind.clone(),
                model: self.links.prepare(&c.kind, &c.config)?,
            })
        };
        let clink = |c: &ComponentConfig| -> Result<Prepared<PreparedCLinkModel>, BuildError> {
            Ok(Prepared {
                kind: c.kind.clone(),
                model: self.clinks.prepare(&c.kind, &c.config)?,
            })
        };
        let scheduler = |c: &ComponentConfig| -> Result<Prepared<PreparedScheduler>, BuildError> {
            Ok(Prepared {
                kind: c.kind.clone(),
                model: self.schedulers.prepare(&c.kind, &c.config)?,
            })
        };

        let stacks: Vec<StackPlan> = config
            .stacks
            .iter()
            .map(|stack| {
                Ok(StackPlan {
                    name: stack.name.clone(),
                    qdevice: qdevice(&stack.qdevice)?,
                })
            })
            .collect::<Result<_, BuildError>>()?;
        let links: Vec<ConnectionPlan<PreparedLinkModel>> = config
            .links
            .iter()
            .map(|l| {
                Ok(ConnectionPlan {
                    nodes: l.nodes.clone(),
                    model: link(&ComponentConfig::new(&l.kind).with_config(l.config.clone()))?,
                })
            })
            .collect::<Result<_, BuildError>>()?;
        let clinks: Vec<ConnectionPlan<PreparedCLinkModel>> = config
            .clinks
            .iter()
            .map(|l| {
                Ok(ConnectionPlan {
                    nodes: l.nodes.clone(),
                    model: clink(&ComponentConfig::new(&l.kind).with_config(l.config.clone()))?,
                })
            })
            .collect::<Result<_, BuildError>>()?;
        let hubs: Vec<HubPlan> = config
            .hubs
            .iter()
            .map(|hub| {
                Ok(HubPlan {
                    name: hub.name.clone(),
                    nodes: hub.nodes.clone(),
                    link: link(&hub.link)?,
                    clink: clink(&hub.clink)?,
                    scheduler: scheduler(&hub.scheduler)?,
                })
            })
            .collect::<Result<_, BuildError>>()?;
        let chains: Vec<ChainPlan> = config
            .repeater_chains
            .iter()
            .map(|chain| {
                Ok(ChainPlan {
                    name: chain.name.clone(),
                    end_nodes: chain.end_nodes.clone(),
                    num_repeaters: chain.num_repeaters,
                    repeater: qdevice(&chain.repeater_qdevice)?,
                    link: link(&chain.link)?,
                    clink: clink(&chain.clink)?,
                })
            })
            .collect::<Result<_, BuildError>>()?;

        Ok(BuildPlan {
            stacks,
            links,
            clinks,
            hubs,
            chains,
        })
    }

    /// Builds the network described by `config`.
    ///
    /// Fails before constructing anything if the topology is inconsistent,
    /// references an unregistered kind or carries an invalid model config.
    pub fn build(&self, config: &TopologyConfig) -> Result<Network, BuildError> {
        config.validate()?;
        let plan = self.plan(config)?;
        tracing::info!(
            end_nodes = plan.stacks.len(),
            links = plan.links.len(),
            hubs = plan.hubs.len(),
            chains = plan.chains.len(),
            seed = self.simulation.seed,
            "Building network"
        );

        let sim = SimContext::new(self.simulation.clone());
        let mut controller = ProtocolController::new();

        let mut hubs = HubBuilder::new(&plan.hubs);
        let mut chains = ChainBuilder::new(&plan.chains);

        let mut ids = NodeIdAllocator::default();
        let end_nodes = NodeBuilder::build(&plan.stacks, &mut ids);

        hubs.attach_end_nodes(&end_nodes)?;
        chains.build_repeaters(&end_nodes, &mut ids)?;

        let node_ids = Rc::new(node_registry(end_nodes.values().chain(chains.repeaters())));

        let mut ports = ClassicalConnectionBuilder::new(&sim);
        ports.build_direct(&plan.clinks);
        hubs.build_classical_connections(&mut ports);
        chains.build_classical_connections(&mut ports);

        let mut links = LinkBuilder::new(&sim);
        links.build_direct(&plan.links, &end_nodes, &mut controller)?;
        hubs.build_links(&mut links, &mut controller);
        chains.build_links(&mut links, &mut controller);

        hubs.build_schedulers(&sim, &node_ids, links.links(), &mut controller)?;

        let egps = EgpBuilder::build(&end_nodes, links.links(), &mut controller);

        let links = links.finish();
        let ports = ports.finish();
        let network = Network {
            sim,
            node_ids,
            end_nodes,
            hubs: hubs.finish(),
            chains: chains.finish(),
            links,
            ports,
            egps,
            controller,
        };
        tracing::debug!(protocols = network.controller.len(), "Network built");
        Ok(network)
    }
}

fn node_registry<'a>(nodes: impl Iterator<Item = &'a ProcessingNode>) -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    for node in nodes {
        if !registry.insert(node.name(), node.id()) {
            tracing::warn!(node = %node.name(), "Node registered twice");
        }
    }
    registry
}

impl std::fmt::Debug for NetworkBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkBuilder")
            .field("qdevices", &self.qdevices)
            .field("links", &self.links)
            .field("clinks", &self.clinks)
            .field("schedulers", &self.schedulers)
            .field("seed", &self.simulation.seed)
            .finish()
    }
}
