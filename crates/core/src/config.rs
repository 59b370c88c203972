use std::{
    collections::BTreeSet,
    fs,
    path::Path,
};

use serde::{Deserialize, Serialize};

/// Opaque, model-specific configuration. Converted into the model's typed
/// config once, when the network is built.
pub type RawConfig = toml::Table;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read topology file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse topology: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize topology: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("empty name in {0} section")]
    EmptyName(&'static str),
    #[error("duplicate {section} name `{name}`")]
    DuplicateName { section: &'static str, name: String },
    #[error("{context} references unknown node `{node}`")]
    UnknownNode { context: String, node: String },
    #[error("{context} connects `{node}` to itself")]
    SelfConnection { context: String, node: String },
    #[error("more than one {what} configured between `{a}` and `{b}`")]
    DuplicatePair { what: &'static str, a: String, b: String },
    #[error("hub `{hub}` needs at least two nodes, got {count}")]
    HubTooSmall { hub: String, count: usize },
}

/// A model kind plus its untyped settings, e.g.
/// `{ kind = "fifo", config = { switch_time = 1000 } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentConfig {
    pub kind: String,
    #[serde(default)]
    pub config: RawConfig,
}

impl ComponentConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            config: RawConfig::new(),
        }
    }

    pub fn with_config(mut self, config: RawConfig) -> Self {
        self.config = config;
        self
    }
}

/// One end node: a name and the device it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    pub name: String,
    pub qdevice: ComponentConfig,
}

/// Physical entanglement link between two end nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    pub nodes: [String; 2],
    pub kind: String,
    #[serde(default)]
    pub config: RawConfig,
}

/// Classical channel between two end nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CLinkConfig {
    pub nodes: [String; 2],
    pub kind: String,
    #[serde(default)]
    pub config: RawConfig,
}

/// Star of end nodes sharing one link model, one classical model and one
/// scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    pub name: String,
    pub nodes: Vec<String>,
    pub link: ComponentConfig,
    pub clink: ComponentConfig,
    pub scheduler: ComponentConfig,
}

/// Line of repeater nodes between two end nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepeaterChainConfig {
    pub name: String,
    pub end_nodes: [String; 2],
    #[serde(default)]
    pub num_repeaters: usize,
    pub repeater_qdevice: ComponentConfig,
    pub link: ComponentConfig,
    pub clink: ComponentConfig,
}

impl RepeaterChainConfig {
    /// Node names along the chain, end node to end node.
    pub fn node_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.num_repeaters + 2);
        names.push(self.end_nodes[0].clone());
        names.extend((0..self.num_repeaters).map(|i| repeater_name(&self.name, i)));
        names.push(self.end_nodes[1].clone());
        names
    }
}

/// Name given to the `index`-th repeater of `chain`.
pub fn repeater_name(chain: &str, index: usize) -> String {
    format!("{chain}_repeater_{index}")
}

/// Declarative description of a whole network. Immutable once validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyConfig {
    #[serde(default)]
    pub stacks: Vec<StackConfig>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub clinks: Vec<CLinkConfig>,
    #[serde(default)]
    pub hubs: Vec<HubConfig>,
    #[serde(default)]
    pub repeater_chains: Vec<RepeaterChainConfig>,
}

impl TopologyConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// Checks names and cross references.
    ///
    /// Model kinds and model settings are not checked here; they depend on
    /// what is registered with the builder.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut nodes = BTreeSet::new();
        for stack in &self.stacks {
            if stack.name.is_empty() {
                return Err(ConfigError::EmptyName("stacks"));
            }
            if !nodes.insert(stack.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    section: "stack",
                    name: stack.name.clone(),
                });
            }
        }

        let mut quantum_pairs = PairSet::new("link");
        for link in &self.links {
            let context = format!("link {}-{}", link.nodes[0], link.nodes[1]);
            check_pair(&nodes, &context, &link.nodes[0], &link.nodes[1])?;
            quantum_pairs.insert(&link.nodes[0], &link.nodes[1])?;
        }

        let mut classical_pairs = PairSet::new("classical link");
        for clink in &self.clinks {
            let context = format!("classical link {}-{}", clink.nodes[0], clink.nodes[1]);
            check_pair(&nodes, &context, &clink.nodes[0], &clink.nodes[1])?;
            classical_pairs.insert(&clink.nodes[0], &clink.nodes[1])?;
        }

        let mut hub_names = BTreeSet::new();
        for hub in &self.hubs {
            if hub.name.is_empty() {
                return Err(ConfigError::EmptyName("hubs"));
            }
            if !hub_names.insert(hub.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    section: "hub",
                    name: hub.name.clone(),
                });
            }
            if hub.nodes.len() < 2 {
                return Err(ConfigError::HubTooSmall {
                    hub: hub.name.clone(),
                    count: hub.nodes.len(),
                });
            }
            let mut members = BTreeSet::new();
            for node in &hub.nodes {
                if !nodes.contains(node.as_str()) {
                    return Err(ConfigError::UnknownNode {
                        context: format!("hub `{}`", hub.name),
                        node: node.clone(),
                    });
                }
                if !members.insert(node.as_str()) {
                    return Err(ConfigError::DuplicateName {
                        section: "hub member",
                        name: node.clone(),
                    });
                }
            }
            for (i, a) in hub.nodes.iter().enumerate() {
                for b in &hub.nodes[i + 1..] {
                    quantum_pairs.insert(a, b)?;
                    classical_pairs.insert(a, b)?;
                }
            }
        }

        let mut chain_names = BTreeSet::new();
        let mut repeaters = BTreeSet::new();
        for chain in &self.repeater_chains {
            if chain.name.is_empty() {
                return Err(ConfigError::EmptyName("repeater_chains"));
            }
            if !chain_names.insert(chain.name.as_str()) {
                return Err(ConfigError::DuplicateName {
                    section: "repeater chain",
                    name: chain.name.clone(),
                });
            }
            let context = format!("repeater chain `{}`", chain.name);
            check_pair(&nodes, &context, &chain.end_nodes[0], &chain.end_nodes[1])?;

            let names = chain.node_names();
            for repeater in &names[1..names.len() - 1] {
                if nodes.contains(repeater.as_str()) || !repeaters.insert(repeater.clone()) {
                    return Err(ConfigError::DuplicateName {
                        section: "node",
                        name: repeater.clone(),
                    });
                }
            }
            for hop in names.windows(2) {
                quantum_pairs.insert(&hop[0], &hop[1])?;
                classical_pairs.insert(&hop[0], &hop[1])?;
            }
            if chain.num_repeaters > 0 {
                classical_pairs.insert(&chain.end_nodes[0], &chain.end_nodes[1])?;
            }
        }

        Ok(())
    }
}

fn check_pair(nodes: &BTreeSet<&str>, context: &str, a: &str, b: &str) -> Result<(), ConfigError> {
    for node in [a, b] {
        if !nodes.contains(node) {
            return Err(ConfigError::UnknownNode {
                context: context.to_string(),
                node: node.to_string(),
            });
        }
    }
    if a == b {
        return Err(ConfigError::SelfConnection {
            context: context.to_string(),
            node: a.to_string(),
        });
    }
    Ok(())
}

/// Unordered node pairs seen so far, used to reject duplicate connections.
struct PairSet {
    what: &'static str,
    seen: BTreeSet<(String, String)>,
}

impl PairSet {
    fn new(what: &'static str) -> Self {
        Self {
            what,
            seen: BTreeSet::new(),
        }
    }

    fn insert(&mut self, a: &str, b: &str) -> Result<(), ConfigError> {
        let key = if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };
        if !self.seen.insert(key) {
            return Err(ConfigError::DuplicatePair {
                what: self.what,
                a: a.to_string(),
                b: b.to_string(),
            });
        }
        Ok(())
    }
}

/// Installs the global tracing subscriber once; later calls are ignored.
pub fn set_logger(level: Option<tracing::level_filters::LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        static LOGGER_SET: std::sync::atomic::AtomicBool =
            std::sync::atomic::AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::Release,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        if let Err(error) = crate::tracing::tracer::init_tracer(level) {
            eprintln!("failed tracing initialization: {error}");
        }
    }
    #[cfg(not(feature = "trace"))]
    {
        let _ = level;
    }
}
