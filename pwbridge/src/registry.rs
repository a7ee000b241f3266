// SPDX-FileCopyrightText: 2025 Contributors to the pwbridge project.
// SPDX-License-Identifier: Apache-2.0

//! Catalog of objects discovered on the bus.
//!
//! The bus announces objects ("globals") asynchronously. The catalog keeps
//! the nodes and ports among them, in discovery order, and answers snapshot
//! queries from any thread. Only [`RegistryHandler`], driven from
//! [`crate::Bridge::update`], mutates it.
//!
//! A port may briefly reference a node that has already been removed: the
//! bus does not order the removal of a node and its ports. Resolve owners with
//! [`RegistryCatalog::port_owner`] and treat `None` as an orphaned port.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::{debug, trace};

/// Property keys read from global objects.
pub mod keys {
    /// Node name.
    pub const NODE_NAME: &str = "node.name";
    /// Node description.
    pub const NODE_DESCRIPTION: &str = "node.description";
    /// Short node name, used when no description is set.
    pub const NODE_NICK: &str = "node.nick";
    /// Media class, e.g. `Video/Source`.
    pub const MEDIA_CLASS: &str = "media.class";
    /// Session-unique serial of an object.
    pub const OBJECT_SERIAL: &str = "object.serial";
    /// Owning node of a port.
    pub const NODE_ID: &str = "node.id";
    /// Port name.
    pub const PORT_NAME: &str = "port.name";
    /// Port direction, `in` or `out`.
    pub const PORT_DIRECTION: &str = "port.direction";
    /// Port alias.
    pub const PORT_ALIAS: &str = "port.alias";
}

/// Kind of a global object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalType {
    /// A media node.
    Node,
    /// A port of a node.
    Port,
    /// Anything else (links, clients, devices, ...), ignored by the catalog.
    Other(String),
}

/// A global object as announced by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalObject {
    /// Bus-assigned id.
    pub id: u32,
    /// Object kind.
    pub object_type: GlobalType,
    /// String properties of the object.
    pub props: BTreeMap<String, String>,
}

impl GlobalObject {
    /// Creates a global with the given properties.
    pub fn new<K, V>(id: u32, object_type: GlobalType, props: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            id,
            object_type,
            props: props
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    fn prop(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    fn prop_string(&self, key: &str) -> String {
        self.prop(key).unwrap_or_default().to_string()
    }
}

/// Discovered node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Bus-assigned id, unique while the node exists.
    pub id: u32,
    /// `node.name`.
    pub name: String,
    /// `node.description` (or `node.nick`).
    pub description: String,
    /// `media.class`, e.g. `Video/Source`.
    pub media_class: String,
    /// `object.serial`, kept opaque.
    pub serial: Option<String>,
}

impl NodeInfo {
    fn from_global(global: &GlobalObject) -> Self {
        Self {
            id: global.id,
            name: global.prop_string(keys::NODE_NAME),
            description: global
                .prop(keys::NODE_DESCRIPTION)
                .or_else(|| global.prop(keys::NODE_NICK))
                .unwrap_or_default()
                .to_string(),
            media_class: global.prop_string(keys::MEDIA_CLASS),
            serial: global.prop(keys::OBJECT_SERIAL).map(str::to_string),
        }
    }

    /// Returns `true` if the media class names video.
    pub fn is_video(&self) -> bool {
        self.media_class.contains("Video")
    }

    /// Serial as a number, `0` if absent or not numeric.
    pub fn serial_number(&self) -> u64 {
        parse_or_default(self.serial.as_deref())
    }
}

/// Discovered port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Bus-assigned id.
    pub id: u32,
    /// Owning node id; may dangle for one notification cycle.
    pub node_id: u32,
    /// `port.name`.
    pub name: String,
    /// `port.direction`, `in` or `out`.
    pub direction: String,
    /// `port.alias`.
    pub alias: Option<String>,
}

impl PortInfo {
    fn from_global(global: &GlobalObject) -> Self {
        Self {
            id: global.id,
            node_id: parse_or_default(global.prop(keys::NODE_ID)),
            name: global.prop_string(keys::PORT_NAME),
            direction: global.prop_string(keys::PORT_DIRECTION),
            alias: global.prop(keys::PORT_ALIAS).map(str::to_string),
        }
    }
}

/// Soft numeric parse: absent or malformed values become the default.
fn parse_or_default<T: std::str::FromStr + Default>(value: Option<&str>) -> T {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_default()
}

#[derive(Debug, Default)]
struct Collections {
    nodes: Vec<NodeInfo>,
    ports: Vec<PortInfo>,
}

/// Thread-safe inventory of nodes and ports.
#[derive(Debug, Default)]
pub struct RegistryCatalog {
    inner: Mutex<Collections>,
}

impl RegistryCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Collections> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records an announced object. Objects other than nodes and ports are ignored.
    ///
    /// An object announced again under a known id replaces the old entry in place.
    pub fn insert(&self, global: &GlobalObject) {
        let mut inner = self.lock();
        match &global.object_type {
            GlobalType::Node => {
                let node = NodeInfo::from_global(global);
                debug!(id = node.id, name = %node.name, class = %node.media_class, "Node added");
                match inner.nodes.iter_mut().find(|n| n.id == node.id) {
                    Some(existing) => *existing = node,
                    None => inner.nodes.push(node),
                }
            }
            GlobalType::Port => {
                let port = PortInfo::from_global(global);
                trace!(id = port.id, node = port.node_id, name = %port.name, "Port added");
                match inner.ports.iter_mut().find(|p| p.id == port.id) {
                    Some(existing) => *existing = port,
                    None => inner.ports.push(port),
                }
            }
            GlobalType::Other(kind) => trace!(id = global.id, %kind, "Ignoring global"),
        }
    }

    /// Forgets any node or port with `id`.
    pub fn remove(&self, id: u32) {
        let mut inner = self.lock();
        let before = inner.nodes.len() + inner.ports.len();
        inner.nodes.retain(|n| n.id != id);
        inner.ports.retain(|p| p.id != id);
        if inner.nodes.len() + inner.ports.len() != before {
            debug!(id, "Global removed");
        }
    }

    /// Empties the catalog.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.nodes.clear();
        inner.ports.clear();
    }

    /// Snapshot of all nodes, in discovery order.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.lock().nodes.clone()
    }

    /// Snapshot of the nodes whose media class contains `Video`.
    pub fn video_nodes(&self) -> Vec<NodeInfo> {
        self.lock()
            .nodes
            .iter()
            .filter(|n| n.is_video())
            .cloned()
            .collect()
    }

    /// Snapshot of all ports, in discovery order.
    pub fn ports(&self) -> Vec<PortInfo> {
        self.lock().ports.clone()
    }

    /// Looks up a node by id.
    pub fn find_node(&self, id: u32) -> Option<NodeInfo> {
        self.lock().nodes.iter().find(|n| n.id == id).cloned()
    }

    /// Resolves the node owning `port`; `None` means the port is orphaned.
    pub fn port_owner(&self, port: &PortInfo) -> Option<NodeInfo> {
        self.find_node(port.node_id)
    }

    /// Snapshot of the ports owned by `node_id`.
    pub fn ports_of(&self, node_id: u32) -> Vec<PortInfo> {
        self.lock()
            .ports
            .iter()
            .filter(|p| p.node_id == node_id)
            .cloned()
            .collect()
    }
}

/// Registry notification handler bound to one catalog.
///
/// Backends call [`Self::global_added`] and [`Self::global_removed`] from
/// inside the event-loop iteration.
#[derive(Debug, Clone)]
pub struct RegistryHandler {
    catalog: Arc<RegistryCatalog>,
}

impl RegistryHandler {
    /// Creates a handler feeding `catalog`.
    pub fn new(catalog: Arc<RegistryCatalog>) -> Self {
        Self { catalog }
    }

    /// "Global added" notification.
    pub fn global_added(&self, global: &GlobalObject) {
        self.catalog.insert(global);
    }

    /// "Global removed" notification.
    pub fn global_removed(&self, id: u32) {
        self.catalog.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(id: u32) -> GlobalObject {
        GlobalObject::new(
            id,
            GlobalType::Node,
            [
                (keys::NODE_NAME, "cam"),
                (keys::NODE_DESCRIPTION, "USB Camera"),
                (keys::MEDIA_CLASS, "Video/Source"),
                (keys::OBJECT_SERIAL, "112"),
            ],
        )
    }

    #[test]
    fn add_then_remove_node() {
        let catalog = RegistryCatalog::new();
        catalog.insert(&camera(7));
        let video = catalog.video_nodes();
        assert_eq!(video.len(), 1);
        assert_eq!(video[0].id, 7);
        assert_eq!(video[0].serial_number(), 112);
        catalog.remove(7);
        assert!(catalog.nodes().is_empty());
        assert!(catalog.video_nodes().is_empty());
    }

    #[test]
    fn audio_nodes_are_not_video() {
        let catalog = RegistryCatalog::new();
        catalog.insert(&GlobalObject::new(
            3,
            GlobalType::Node,
            [(keys::MEDIA_CLASS, "Audio/Sink")],
        ));
        assert_eq!(catalog.nodes().len(), 1);
        assert!(catalog.video_nodes().is_empty());
    }

    #[test]
    fn unknown_types_are_ignored() {
        let catalog = RegistryCatalog::new();
        catalog.insert(&GlobalObject::new(
            9,
            GlobalType::Other("PipeWire:Interface:Link".into()),
            [(keys::NODE_NAME, "x")],
        ));
        assert!(catalog.nodes().is_empty());
        assert!(catalog.ports().is_empty());
    }

    #[test]
    fn malformed_numbers_fail_soft() {
        let catalog = RegistryCatalog::new();
        catalog.insert(&GlobalObject::new(
            11,
            GlobalType::Port,
            [
                (keys::NODE_ID, "not-a-number"),
                (keys::PORT_NAME, "output_0"),
                (keys::PORT_DIRECTION, "out"),
            ],
        ));
        let ports = catalog.ports();
        assert_eq!(ports[0].node_id, 0);
        assert_eq!(ports[0].alias, None);

        let mut node = camera(12);
        node.props.insert(keys::OBJECT_SERIAL.into(), "serial?".into());
        catalog.insert(&node);
        assert_eq!(catalog.find_node(12).unwrap().serial_number(), 0);
    }

    #[test]
    fn orphaned_port_has_no_owner() {
        let catalog = RegistryCatalog::new();
        catalog.insert(&camera(20));
        catalog.insert(&GlobalObject::new(
            21,
            GlobalType::Port,
            [(keys::NODE_ID, "20"), (keys::PORT_DIRECTION, "out")],
        ));
        let port = catalog.ports()[0].clone();
        assert_eq!(catalog.port_owner(&port).map(|n| n.id), Some(20));
        assert_eq!(catalog.ports_of(20).len(), 1);
        catalog.remove(20);
        assert_eq!(catalog.port_owner(&port), None);
        assert_eq!(catalog.ports().len(), 1);
    }

    #[test]
    fn reannounced_id_replaces_entry() {
        let catalog = RegistryCatalog::new();
        catalog.insert(&camera(5));
        let mut renamed = camera(5);
        renamed.props.insert(keys::NODE_NAME.into(), "cam2".into());
        catalog.insert(&renamed);
        let nodes = catalog.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "cam2");
    }
}
