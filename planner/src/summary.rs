//! Region-level resource summaries.
//!
//! Every node report is rewritten into a region-scoped summary, and
//! summaries for the same region and window are summed. All nested maps
//! merge with one rule: union of keys, leaf values added. Processing time
//! is kept as a numerator/denominator pair so the derived average does not
//! depend on merge order.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regionmesh_protocol::{NodeIdentifier, RegionIdentifier, RegionLookupService, ServiceIdentifier};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PlannerError, Result};
use crate::models::{EstimationWindow, LinkAttributes, NodeAttributes, ResourceReport};

/// Key-union, leaf-sum merge of nested numeric maps.
pub trait SumMerge {
    fn sum_merge(&mut self, other: &Self);
}

impl SumMerge for f64 {
    fn sum_merge(&mut self, other: &Self) {
        *self += *other;
    }
}

impl<K, V> SumMerge for BTreeMap<K, V>
where
    K: Ord + Clone,
    V: SumMerge + Clone,
{
    fn sum_merge(&mut self, other: &Self) {
        for (key, value) in other {
            match self.get_mut(key) {
                Some(mine) => mine.sum_merge(value),
                None => {
                    self.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

fn summed<T: SumMerge + Clone>(a: &T, b: &T) -> T {
    let mut out = a.clone();
    out.sum_merge(b);
    out
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

pub type ServiceRegionLoad = BTreeMap<ServiceIdentifier, BTreeMap<RegionIdentifier, NodeAttributes>>;
pub type RegionLinkLoad = BTreeMap<RegionIdentifier, LinkAttributes>;

/// Summed resource picture of one region over one window.
///
/// `None` timestamps mark a summary that has absorbed no report yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub region: RegionIdentifier,
    pub window: EstimationWindow,
    pub min_timestamp: Option<DateTime<Utc>>,
    pub max_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub server_capacity: NodeAttributes,
    #[serde(default)]
    pub server_load: ServiceRegionLoad,
    #[serde(default)]
    pub server_demand: ServiceRegionLoad,
    #[serde(default)]
    pub network_capacity: RegionLinkLoad,
    #[serde(default)]
    pub network_load: RegionLinkLoad,
    #[serde(default)]
    pub network_demand: RegionLinkLoad,
    #[serde(default)]
    pub processing_time_numerator: BTreeMap<ServiceIdentifier, f64>,
    #[serde(default)]
    pub processing_time_denominator: BTreeMap<ServiceIdentifier, f64>,
}

impl ResourceSummary {
    pub fn null(region: RegionIdentifier, window: EstimationWindow) -> Self {
        Self {
            region,
            window,
            min_timestamp: None,
            max_timestamp: None,
            server_capacity: BTreeMap::new(),
            server_load: BTreeMap::new(),
            server_demand: BTreeMap::new(),
            network_capacity: BTreeMap::new(),
            network_load: BTreeMap::new(),
            network_demand: BTreeMap::new(),
            processing_time_numerator: BTreeMap::new(),
            processing_time_denominator: BTreeMap::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.min_timestamp.is_none() && self.max_timestamp.is_none()
    }

    pub fn average_processing_time(&self, service: &ServiceIdentifier) -> Option<f64> {
        let numerator = self.processing_time_numerator.get(service)?;
        let denominator = self.processing_time_denominator.get(service)?;
        if *denominator == 0.0 {
            return None;
        }
        Some(numerator / denominator)
    }

    pub fn average_processing_times(&self) -> BTreeMap<ServiceIdentifier, f64> {
        self.processing_time_numerator
            .keys()
            .filter_map(|service| {
                self.average_processing_time(service)
                    .map(|average| (service.clone(), average))
            })
            .collect()
    }
}

/// Turns node reports into region summaries and merges them.
pub struct ResourceAggregator {
    regions: Arc<dyn RegionLookupService>,
}

impl ResourceAggregator {
    pub fn new(regions: Arc<dyn RegionLookupService>) -> Self {
        Self { regions }
    }

    pub fn null_summary(region: RegionIdentifier, window: EstimationWindow) -> ResourceSummary {
        ResourceSummary::null(region, window)
    }

    pub fn convert_to_summary(&self, report: &ResourceReport) -> Result<ResourceSummary> {
        let region = self
            .regions
            .region_of(&report.node)
            .ok_or_else(|| PlannerError::UnknownRegion(report.node.clone()))?;

        let mut summary = ResourceSummary::null(region, report.window);
        summary.min_timestamp = Some(report.timestamp);
        summary.max_timestamp = Some(report.timestamp);
        summary.server_capacity = report.compute_capacity.clone();
        summary.server_load = self.by_client_region(&report.node, &report.compute_load);
        summary.server_demand = self.by_client_region(&report.node, &report.compute_demand);
        summary.network_capacity = self.by_region(&report.node, &report.network_capacity);
        summary.network_load = self.by_region(&report.node, &report.network_load);
        summary.network_demand = self.by_region(&report.node, &report.network_demand);
        summary.processing_time_numerator = report.average_processing_time.clone();
        summary.processing_time_denominator = report
            .average_processing_time
            .keys()
            .map(|service| (service.clone(), 1.0))
            .collect();

        Ok(summary)
    }

    fn by_region<V: SumMerge + Clone + Default>(
        &self,
        reporter: &NodeIdentifier,
        by_node: &BTreeMap<NodeIdentifier, V>,
    ) -> BTreeMap<RegionIdentifier, V> {
        let mut out: BTreeMap<RegionIdentifier, V> = BTreeMap::new();
        for (node, values) in by_node {
            match self.regions.region_of(node) {
                Some(region) => out.entry(region).or_default().sum_merge(values),
                None => warn!(
                    reporter = %reporter,
                    node = %node,
                    "Dropping report entry for node with no region"
                ),
            }
        }
        out
    }

    fn by_client_region(
        &self,
        reporter: &NodeIdentifier,
        by_service: &BTreeMap<ServiceIdentifier, BTreeMap<NodeIdentifier, NodeAttributes>>,
    ) -> ServiceRegionLoad {
        by_service
            .iter()
            .map(|(service, by_node)| (service.clone(), self.by_region(reporter, by_node)))
            .collect()
    }

    /// Sums two summaries of the same region and window.
    pub fn merge(one: &ResourceSummary, two: &ResourceSummary) -> Result<ResourceSummary> {
        if one.region != two.region {
            return Err(PlannerError::ContractViolation(format!(
                "cannot merge summaries of regions {} and {}",
                one.region, two.region
            )));
        }
        if one.window != two.window {
            return Err(PlannerError::ContractViolation(format!(
                "cannot merge summaries of windows {:?} and {:?}",
                one.window, two.window
            )));
        }

        Ok(ResourceSummary {
            region: one.region.clone(),
            window: one.window,
            min_timestamp: earliest(one.min_timestamp, two.min_timestamp),
            max_timestamp: latest(one.max_timestamp, two.max_timestamp),
            server_capacity: summed(&one.server_capacity, &two.server_capacity),
            server_load: summed(&one.server_load, &two.server_load),
            server_demand: summed(&one.server_demand, &two.server_demand),
            network_capacity: summed(&one.network_capacity, &two.network_capacity),
            network_load: summed(&one.network_load, &two.network_load),
            network_demand: summed(&one.network_demand, &two.network_demand),
            processing_time_numerator: summed(
                &one.processing_time_numerator,
                &two.processing_time_numerator,
            ),
            processing_time_denominator: summed(
                &one.processing_time_denominator,
                &two.processing_time_denominator,
            ),
        })
    }

    pub fn merge_all<'a>(
        region: RegionIdentifier,
        window: EstimationWindow,
        summaries: impl IntoIterator<Item = &'a ResourceSummary>,
    ) -> Result<ResourceSummary> {
        summaries
            .into_iter()
            .try_fold(ResourceSummary::null(region, window), |acc, summary| {
                Self::merge(&acc, summary)
            })
    }
}
