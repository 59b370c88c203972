//! Per-category maps from a model key to its builder.
//!
//! Each builder declares a typed, deserializable config. The registry keeps
//! builders behind an erased interface whose `prepare` step parses and
//! validates the raw TOML table once and hands back a closure that only
//! constructs. A whole topology is prepared before anything is built.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    fmt::{self, Debug},
    rc::{Rc, Weak},
};

use serde::de::DeserializeOwned;

use crate::{
    clink::CLinkModel,
    config::{ConfigError, RawConfig},
    link::{LinkLayer, LinkModel, NodePair},
    node::{NodeRegistry, ProcessingNode},
    qdevice::QDevice,
    scheduler::{ScheduleProtocol, SharedScheduler},
    simulation::SimContext,
};

/// Typed settings of one model.
pub trait ModelConfig: DeserializeOwned + Debug + 'static {
    /// Checks value ranges serde cannot express.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    QDevice,
    Link,
    CLink,
    Scheduler,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::QDevice => write!(f, "qdevice"),
            Category::Link => write!(f, "link"),
            Category::CLink => write!(f, "clink"),
            Category::Scheduler => write!(f, "scheduler"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no {category} model registered under `{kind}`")]
    UnknownKind { category: Category, kind: String },
    #[error("invalid config for {category} model `{kind}`: {reason}")]
    InvalidConfig {
        category: Category,
        kind: String,
        reason: String,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("node `{0}` was not built")]
    MissingNode(String),
}

/// Converts a raw table into `C` and validates it.
pub fn parse_model_config<C: ModelConfig>(
    category: Category,
    kind: &str,
    raw: &RawConfig,
) -> Result<C, BuildError> {
    let invalid = |reason: String| BuildError::InvalidConfig {
        category,
        kind: kind.to_string(),
        reason,
    };
    let config: C = toml::Value::Table(raw.clone())
        .try_into()
        .map_err(|e: toml::de::Error| invalid(e.message().to_string()))?;
    config.validate().map_err(invalid)?;
    Ok(config)
}

pub trait QDeviceBuilder: 'static {
    type Config: ModelConfig;

    fn build(&self, name: &str, config: &Self::Config) -> QDevice;
}

pub trait LinkModelBuilder: 'static {
    type Config: ModelConfig;

    fn build(
        &self,
        node_a: &ProcessingNode,
        node_b: &ProcessingNode,
        config: &Self::Config,
    ) -> Box<dyn LinkModel>;
}

pub trait CLinkBuilder: 'static {
    type Config: ModelConfig;

    fn build(&self, node_a: &str, node_b: &str, config: &Self::Config) -> Box<dyn CLinkModel>;
}

/// Everything a scheduler gets to see of the hub it serves.
pub struct ScheduleContext<'a> {
    /// Hub name, used as the scheduler name
    pub name: &'a str,
    pub sim: &'a SimContext,
    pub node_ids: &'a Rc<NodeRegistry>,
    /// Links of the hub, keyed by node pair
    pub links: BTreeMap<NodePair, Weak<RefCell<LinkLayer>>>,
}

pub trait ScheduleBuilder: 'static {
    type Config: ModelConfig;
    type Protocol: ScheduleProtocol + 'static;

    fn build(
        &self,
        context: ScheduleContext<'_>,
        config: &Self::Config,
    ) -> Rc<RefCell<Self::Protocol>>;
}

pub type PreparedQDevice = Rc<dyn Fn(&str) -> QDevice>;
pub type PreparedLinkModel = Rc<dyn Fn(&ProcessingNode, &ProcessingNode) -> Box<dyn LinkModel>>;
pub type PreparedCLinkModel = Rc<dyn Fn(&str, &str) -> Box<dyn CLinkModel>>;
pub type PreparedScheduler = Rc<dyn Fn(ScheduleContext<'_>) -> SharedScheduler>;

pub trait ErasedQDeviceBuilder {
    fn prepare(self: Rc<Self>, kind: &str, raw: &RawConfig) -> Result<PreparedQDevice, BuildError>;
}

impl<B: QDeviceBuilder> ErasedQDeviceBuilder for B {
    fn prepare(self: Rc<Self>, kind: &str, raw: &RawConfig) -> Result<PreparedQDevice, BuildError> {
        let config = parse_model_config::<B::Config>(Category::QDevice, kind, raw)?;
        Ok(Rc::new(move |name: &str| self.build(name, &config)))
    }
}

pub trait ErasedLinkModelBuilder {
    fn prepare(
        self: Rc<Self>,
        kind: &str,
        raw: &RawConfig,
    ) -> Result<PreparedLinkModel, BuildError>;
}

impl<B: LinkModelBuilder> ErasedLinkModelBuilder for B {
    fn prepare(
        self: Rc<Self>,
        kind: &str,
        raw: &RawConfig,
    ) -> Result<PreparedLinkModel, BuildError> {
        let config = parse_model_config::<B::Config>(Category::Link, kind, raw)?;
        Ok(Rc::new(move |a: &ProcessingNode, b: &ProcessingNode| {
            self.build(a, b, &config)
        }))
    }
}

pub trait ErasedCLinkBuilder {
    fn prepare(
        self: Rc<Self>,
        kind: &str,
        raw: &RawConfig,
    ) -> Result<PreparedCLinkModel, BuildError>;
}

impl<B: CLinkBuilder> ErasedCLinkBuilder for B {
    fn prepare(
        self: Rc<Self>,
        kind: &str,
        raw: &RawConfig,
    ) -> Result<PreparedCLinkModel, BuildError> {
        let config = parse_model_config::<B::Config>(Category::CLink, kind, raw)?;
        Ok(Rc::new(move |a: &str, b: &str| self.build(a, b, &config)))
    }
}

pub trait ErasedScheduleBuilder {
    fn prepare(
        self: Rc<Self>,
        kind: &str,
        raw: &RawConfig,
    ) -> Result<PreparedScheduler, BuildError>;
}

impl<B: ScheduleBuilder> ErasedScheduleBuilder for B {
    fn prepare(
        self: Rc<Self>,
        kind: &str,
        raw: &RawConfig,
    ) -> Result<PreparedScheduler, BuildError> {
        let config = parse_model_config::<B::Config>(Category::Scheduler, kind, raw)?;
        Ok(Rc::new(move |context: ScheduleContext<'_>| {
            let protocol: SharedScheduler = self.build(context, &config);
            protocol
        }))
    }
}

/// Builders of one category, by key.
pub struct Registry<E: ?Sized> {
    category: Category,
    entries: BTreeMap<String, Rc<E>>,
}

impl<E: ?Sized> Registry<E> {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            entries: BTreeMap::new(),
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    /// Registers `builder` under `key`, replacing any previous entry.
    pub fn insert(&mut self, key: impl Into<String>, builder: Rc<E>) {
        let key = key.into();
        if self.entries.insert(key.clone(), builder).is_some() {
            tracing::warn!(category = %self.category, %key, "Replacing registered model builder");
        }
    }

    pub fn get(&self, kind: &str) -> Result<Rc<E>, BuildError> {
        self.entries
            .get(kind)
            .cloned()
            .ok_or_else(|| BuildError::UnknownKind {
                category: self.category,
                kind: kind.to_string(),
            })
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl<E: ?Sized> Debug for Registry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("category", &self.category)
            .field("keys", &self.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry<dyn ErasedQDeviceBuilder> {
    pub fn prepare(&self, kind: &str, raw: &RawConfig) -> Result<PreparedQDevice, BuildError> {
        self.get(kind)?.prepare(kind, raw)
    }
}

impl Registry<dyn ErasedLinkModelBuilder> {
    pub fn prepare(&self, kind: &str, raw: &RawConfig) -> Result<PreparedLinkModel, BuildError> {
        self.get(kind)?.prepare(kind, raw)
    }
}

impl Registry<dyn ErasedCLinkBuilder> {
    pub fn prepare(&self, kind: &str, raw: &RawConfig) -> Result<PreparedCLinkModel, BuildError> {
        self.get(kind)?.prepare(kind, raw)
    }
}

impl Registry<dyn ErasedScheduleBuilder> {
    pub fn prepare(&self, kind: &str, raw: &RawConfig) -> Result<PreparedScheduler, BuildError> {
        self.get(kind)?.prepare(kind, raw)
    }
}
