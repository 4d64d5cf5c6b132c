use chrono::{DateTime, Utc};
use regionmesh_protocol::{ContainerIdentifier, NodeIdentifier, RegionIdentifier, ServiceIdentifier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationWindow {
    Short,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAttribute {
    Cpu,
    Memory,
    TaskContainers,
    QueueLength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkAttribute {
    DatarateTx,
    DatarateRx,
}

pub type NodeAttributes = BTreeMap<NodeAttribute, f64>;
pub type LinkAttributes = BTreeMap<LinkAttribute, f64>;

// --- Report types ---

/// What one node measured over one estimation window.
///
/// Compute load and demand are keyed service → client node; network maps
/// are keyed by neighbor node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub node: NodeIdentifier,
    pub timestamp: DateTime<Utc>,
    pub window: EstimationWindow,
    #[serde(default)]
    pub compute_capacity: NodeAttributes,
    #[serde(default)]
    pub compute_load: BTreeMap<ServiceIdentifier, BTreeMap<NodeIdentifier, NodeAttributes>>,
    #[serde(default)]
    pub compute_demand: BTreeMap<ServiceIdentifier, BTreeMap<NodeIdentifier, NodeAttributes>>,
    #[serde(default)]
    pub network_capacity: BTreeMap<NodeIdentifier, LinkAttributes>,
    #[serde(default)]
    pub network_load: BTreeMap<NodeIdentifier, LinkAttributes>,
    #[serde(default)]
    pub network_demand: BTreeMap<NodeIdentifier, LinkAttributes>,
    /// Node-level mean processing time per service, in milliseconds.
    #[serde(default)]
    pub average_processing_time: BTreeMap<ServiceIdentifier, f64>,
}

impl ResourceReport {
    pub fn new(node: NodeIdentifier, timestamp: DateTime<Utc>, window: EstimationWindow) -> Self {
        Self {
            node,
            timestamp,
            window,
            compute_capacity: BTreeMap::new(),
            compute_load: BTreeMap::new(),
            compute_demand: BTreeMap::new(),
            network_capacity: BTreeMap::new(),
            network_load: BTreeMap::new(),
            network_demand: BTreeMap::new(),
            average_processing_time: BTreeMap::new(),
        }
    }
}

// --- Live service state ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Unknown,
}

impl ServiceStatus {
    pub fn is_active(self) -> bool {
        !matches!(self, ServiceStatus::Stopping | ServiceStatus::Stopped)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    pub service: ServiceIdentifier,
    pub status: ServiceStatus,
}

/// Containers currently deployed in a region, per node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionServiceState {
    pub region: RegionIdentifier,
    #[serde(default)]
    pub nodes: BTreeMap<NodeIdentifier, BTreeMap<ContainerIdentifier, ContainerState>>,
}

impl RegionServiceState {
    pub fn new(region: RegionIdentifier) -> Self {
        Self { region, nodes: BTreeMap::new() }
    }

    pub fn with_container(
        mut self,
        node: impl Into<NodeIdentifier>,
        container: impl Into<ContainerIdentifier>,
        service: impl Into<ServiceIdentifier>,
        status: ServiceStatus,
    ) -> Self {
        self.nodes.entry(node.into()).or_default().insert(
            container.into(),
            ContainerState { service: service.into(), status },
        );
        self
    }

    pub fn container(&self, node: &NodeIdentifier, container: &ContainerIdentifier) -> Option<&ContainerState> {
        self.nodes.get(node).and_then(|containers| containers.get(container))
    }

    /// Containers that are not stopping or stopped.
    pub fn active_containers(
        &self,
    ) -> impl Iterator<Item = (&NodeIdentifier, &ContainerIdentifier, &ContainerState)> {
        self.nodes.iter().flat_map(|(node, containers)| {
            containers
                .iter()
                .filter(|(_, state)| state.status.is_active())
                .map(move |(container, state)| (node, container, state))
        })
    }
}

// --- Plan types ---

/// One entry in a node's plan. `container == None` asks for a new
/// container of `service` to be created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub container: Option<ContainerIdentifier>,
    pub service: ServiceIdentifier,
    pub weight: f64,
    #[serde(default)]
    pub stop_traffic_to: bool,
    #[serde(default)]
    pub stop: bool,
}

impl ContainerInfo {
    pub fn existing(container: ContainerIdentifier, service: ServiceIdentifier) -> Self {
        Self {
            container: Some(container),
            service,
            weight: 1.0,
            stop_traffic_to: false,
            stop: false,
        }
    }

    pub fn to_create(service: ServiceIdentifier, weight: f64) -> Self {
        Self {
            container: None,
            service,
            weight,
            stop_traffic_to: false,
            stop: false,
        }
    }
}

/// service → neighbor region → fraction of traffic sent there.
pub type OverflowPlan = BTreeMap<ServiceIdentifier, BTreeMap<RegionIdentifier, f64>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerPlan {
    pub region: RegionIdentifier,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub service_plan: BTreeMap<NodeIdentifier, Vec<ContainerInfo>>,
    #[serde(default)]
    pub overflow_plan: OverflowPlan,
}

impl LoadBalancerPlan {
    /// A plan with nothing in it, used before the first real plan exists.
    pub fn null_plan(region: RegionIdentifier) -> Self {
        Self {
            region,
            timestamp: Utc::now(),
            service_plan: BTreeMap::new(),
            overflow_plan: BTreeMap::new(),
        }
    }

    pub fn containers(&self, node: &NodeIdentifier) -> &[ContainerInfo] {
        self.service_plan.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Same plan content, ignoring when it was built.
    pub fn equivalent_to(&self, other: &LoadBalancerPlan) -> bool {
        self.region == other.region
            && self.service_plan == other.service_plan
            && self.overflow_plan == other.overflow_plan
    }
}
