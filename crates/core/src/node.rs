use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fmt,
    rc::Rc,
};

use serde::{Deserialize, Serialize};

use crate::qdevice::QDevice;

/// Integer identity of a node, stable for the lifetime of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier a node assigns to each of its `CreateAndKeep` requests.
pub type CreateId = u32;

/// What part a node plays in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    EndNode,
    Repeater,
}

pub type SharedQDevice = Rc<RefCell<QDevice>>;

/// A node carrying a quantum device.
///
/// Cheap to clone: the device and the create id counter are shared between
/// clones, so every EGP of a node draws from one id sequence.
#[derive(Clone)]
pub struct ProcessingNode {
    name: String,
    id: NodeId,
    qdevice_kind: String,
    qdevice: SharedQDevice,
    next_create_id: Rc<Cell<CreateId>>,
}

impl ProcessingNode {
    pub fn new(
        name: impl Into<String>,
        id: NodeId,
        qdevice_kind: impl Into<String>,
        qdevice: QDevice,
    ) -> Self {
        Self {
            name: name.into(),
            id,
            qdevice_kind: qdevice_kind.into(),
            qdevice: Rc::new(RefCell::new(qdevice)),
            next_create_id: Rc::new(Cell::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn qdevice_kind(&self) -> &str {
        &self.qdevice_kind
    }

    pub fn qdevice(&self) -> &SharedQDevice {
        &self.qdevice
    }

    /// Hands out the next create id of this node.
    pub fn next_create_id(&self) -> CreateId {
        let id = self.next_create_id.get();
        self.next_create_id.set(id.wrapping_add(1));
        id
    }
}

impl fmt::Debug for ProcessingNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingNode")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("qdevice_kind", &self.qdevice_kind)
            .finish()
    }
}

/// Bidirectional node name <-> id lookup owned by a network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRegistry {
    ids: BTreeMap<String, NodeId>,
    names: BTreeMap<NodeId, String>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a node. Returns false if the name or the id is already taken.
    pub fn insert(&mut self, name: impl Into<String>, id: NodeId) -> bool {
        let name = name.into();
        if self.ids.contains_key(&name) || self.names.contains_key(&id) {
            return false;
        }
        self.names.insert(id, name.clone());
        self.ids.insert(name, id);
        true
    }

    pub fn id(&self, name: &str) -> Option<NodeId> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterates `(name, id)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.ids.iter().map(|(name, id)| (name.as_str(), *id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_round_trip_lookup() {
        let mut registry = NodeRegistry::new();
        assert!(registry.insert("Alice", NodeId::new(0)));
        assert!(registry.insert("Bob", NodeId::new(1)));

        assert_eq!(registry.id("Bob"), Some(NodeId::new(1)));
        assert_eq!(registry.name(NodeId::new(0)), Some("Alice"));
        assert_eq!(registry.id("Carol"), None);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_rejects_reuse() {
        let mut registry = NodeRegistry::new();
        assert!(registry.insert("Alice", NodeId::new(0)));
        assert!(!registry.insert("Alice", NodeId::new(1)));
        assert!(!registry.insert("Bob", NodeId::new(0)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_create_ids_shared_between_clones() {
        let device = QDevice::new("qdevice_Alice", 2);
        let node = ProcessingNode::new("Alice", NodeId::new(3), "generic", device);
        let clone = node.clone();

        assert_eq!(node.next_create_id(), 0);
        assert_eq!(clone.next_create_id(), 1);
        assert_eq!(node.next_create_id(), 2);
    }
}
