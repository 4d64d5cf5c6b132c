use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::{NodeAddress, NodeIdentifier, RegionIdentifier};

/// Resolves a node to the address it listens on. `None` means the node is
/// not directly dialable, e.g. a client endpoint.
pub trait NodeLookupService: Send + Sync {
    fn lookup(&self, node: &NodeIdentifier) -> Option<NodeAddress>;
}

/// Resolves a node to the region it belongs to.
pub trait RegionLookupService: Send + Sync {
    fn region_of(&self, node: &NodeIdentifier) -> Option<RegionIdentifier>;
}

/// In-memory address table.
///
/// Entries can be registered after construction, which lets a node bind
/// an ephemeral port first and publish the real one afterwards.
#[derive(Default)]
pub struct StaticNodeLookup {
    entries: RwLock<HashMap<NodeIdentifier, NodeAddress>>,
}

impl StaticNodeLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, node: impl Into<NodeIdentifier>, address: NodeAddress) -> Self {
        self.register(node, address);
        self
    }

    pub fn register(&self, node: impl Into<NodeIdentifier>, address: NodeAddress) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(node.into(), address);
    }

    pub fn remove(&self, node: &NodeIdentifier) -> Option<NodeAddress> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(node)
    }
}

impl NodeLookupService for StaticNodeLookup {
    fn lookup(&self, node: &NodeIdentifier) -> Option<NodeAddress> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(node).cloned()
    }
}

/// In-memory node → region table.
#[derive(Debug, Default, Clone)]
pub struct StaticRegionLookup {
    regions: HashMap<NodeIdentifier, RegionIdentifier>,
}

impl StaticRegionLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        node: impl Into<NodeIdentifier>,
        region: impl Into<RegionIdentifier>,
    ) -> Self {
        self.insert(node, region);
        self
    }

    pub fn insert(&mut self, node: impl Into<NodeIdentifier>, region: impl Into<RegionIdentifier>) {
        self.regions.insert(node.into(), region.into());
    }
}

impl RegionLookupService for StaticRegionLookup {
    fn region_of(&self, node: &NodeIdentifier) -> Option<RegionIdentifier> {
        self.regions.get(node).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_lookup_register_later() {
        let lookup = StaticNodeLookup::new().with("a", NodeAddress::new("127.0.0.1", 0));
        lookup.register("A", NodeAddress::new("127.0.0.1", 4100));

        let addr = lookup.lookup(&NodeIdentifier::new("a")).unwrap();
        assert_eq!(addr.port, 4100);
        assert!(lookup.lookup(&NodeIdentifier::new("client")).is_none());
    }

    #[test]
    fn test_region_lookup_ignores_case() {
        let lookup = StaticRegionLookup::new().with("serverX", "east");
        assert_eq!(
            lookup.region_of(&NodeIdentifier::new("SERVERX")),
            Some(RegionIdentifier::new("east"))
        );
    }
}
