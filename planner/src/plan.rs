use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use regionmesh_protocol::{ContainerIdentifier, NodeIdentifier, RegionIdentifier, ServiceIdentifier};
use tracing::debug;

use crate::error::{PlannerError, Result};
use crate::models::{ContainerInfo, LoadBalancerPlan, OverflowPlan, RegionServiceState};

/// Mutable working copy of a region's plan.
///
/// Nothing is checked until [`to_load_balancer_plan`](Self::to_load_balancer_plan),
/// which either returns a complete plan or an error.
#[derive(Debug, Clone)]
pub struct LoadBalancerPlanBuilder {
    region: RegionIdentifier,
    service_plan: BTreeMap<NodeIdentifier, Vec<ContainerInfo>>,
}

impl LoadBalancerPlanBuilder {
    pub fn new(region: RegionIdentifier) -> Self {
        Self {
            region,
            service_plan: BTreeMap::new(),
        }
    }

    /// Seeds the builder with every active container in `live`, keeping
    /// weight and flags from `previous` where that plan already had the
    /// container.
    pub fn from_plan(previous: &LoadBalancerPlan, live: &RegionServiceState) -> Self {
        let mut builder = Self::new(live.region.clone());

        for (node, container, state) in live.active_containers() {
            let carried = previous
                .containers(node)
                .iter()
                .find(|info| info.container.as_ref() == Some(container));

            let info = match carried {
                Some(prev) => ContainerInfo {
                    container: Some(container.clone()),
                    service: state.service.clone(),
                    weight: prev.weight,
                    stop_traffic_to: prev.stop_traffic_to,
                    stop: prev.stop,
                },
                None => ContainerInfo::existing(container.clone(), state.service.clone()),
            };
            builder.service_plan.entry(node.clone()).or_default().push(info);
        }

        builder
    }

    pub fn region(&self) -> &RegionIdentifier {
        &self.region
    }

    pub fn containers(&self, node: &NodeIdentifier) -> &[ContainerInfo] {
        self.service_plan.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Requests a new container for `service` on `node`.
    pub fn add_service(
        &mut self,
        node: NodeIdentifier,
        service: ServiceIdentifier,
        weight: f64,
    ) -> Result<&mut Self> {
        check_weight(weight)?;
        self.service_plan
            .entry(node)
            .or_default()
            .push(ContainerInfo::to_create(service, weight));
        Ok(self)
    }

    pub fn stop_traffic_to_container(
        &mut self,
        node: &NodeIdentifier,
        container: &ContainerIdentifier,
    ) -> Result<&mut Self> {
        self.entry_mut(node, container)?.stop_traffic_to = true;
        Ok(self)
    }

    pub fn allow_traffic_to_container(
        &mut self,
        node: &NodeIdentifier,
        container: &ContainerIdentifier,
    ) -> Result<&mut Self> {
        self.entry_mut(node, container)?.stop_traffic_to = false;
        Ok(self)
    }

    pub fn stop_container(
        &mut self,
        node: &NodeIdentifier,
        container: &ContainerIdentifier,
    ) -> Result<&mut Self> {
        self.entry_mut(node, container)?.stop = true;
        Ok(self)
    }

    pub fn unstop_container(
        &mut self,
        node: &NodeIdentifier,
        container: &ContainerIdentifier,
    ) -> Result<&mut Self> {
        self.entry_mut(node, container)?.stop = false;
        Ok(self)
    }

    pub fn set_container_weight(
        &mut self,
        node: &NodeIdentifier,
        container: &ContainerIdentifier,
        weight: f64,
    ) -> Result<&mut Self> {
        check_weight(weight)?;
        self.entry_mut(node, container)?.weight = weight;
        Ok(self)
    }

    fn entry_mut(
        &mut self,
        node: &NodeIdentifier,
        container: &ContainerIdentifier,
    ) -> Result<&mut ContainerInfo> {
        self.service_plan
            .get_mut(node)
            .and_then(|infos| {
                infos
                    .iter_mut()
                    .find(|info| info.container.as_ref() == Some(container))
            })
            .ok_or_else(|| PlannerError::ContainerNotFound {
                node: node.clone(),
                container: container.clone(),
            })
    }

    fn validate(&self, live: &RegionServiceState) -> Result<()> {
        if live.region != self.region {
            return Err(PlannerError::PlanValidation(format!(
                "plan is for region {} but live state is for {}",
                self.region, live.region
            )));
        }

        for (node, infos) in &self.service_plan {
            let mut seen = HashSet::new();
            for container in infos.iter().filter_map(|info| info.container.as_ref()) {
                if !seen.insert(container) {
                    return Err(PlannerError::PlanValidation(format!(
                        "container {container} appears more than once on node {node}"
                    )));
                }
            }
        }

        for (node, container, _) in live.active_containers() {
            let planned = self
                .containers(node)
                .iter()
                .any(|info| info.container.as_ref() == Some(container));
            if !planned {
                return Err(PlannerError::PlanValidation(format!(
                    "container {container} on node {node} is missing from the plan"
                )));
            }
        }

        for (node, infos) in &self.service_plan {
            for info in infos {
                let Some(container) = &info.container else {
                    continue;
                };
                if let Some(state) = live.container(node, container) {
                    if state.service != info.service {
                        return Err(PlannerError::PlanValidation(format!(
                            "container {container} on node {node} runs {} but the plan assigns {}",
                            state.service, info.service
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Validates against the live state and freezes the plan.
    pub fn to_load_balancer_plan(
        &self,
        live: &RegionServiceState,
        overflow_plan: OverflowPlan,
    ) -> Result<LoadBalancerPlan> {
        self.validate(live)?;
        debug!(
            region = %self.region,
            nodes = self.service_plan.len(),
            "Load balancer plan built"
        );
        Ok(LoadBalancerPlan {
            region: self.region.clone(),
            timestamp: Utc::now(),
            service_plan: self.service_plan.clone(),
            overflow_plan,
        })
    }
}

fn check_weight(weight: f64) -> Result<()> {
    if weight.is_finite() && weight >= 0.0 {
        Ok(())
    } else {
        Err(PlannerError::InvalidWeight(weight))
    }
}
