use std::cmp::Reverse;
use std::collections::BTreeMap;

use regionmesh_protocol::{
    AggregateKernel, CodePath, GossipValue, Result, RoundContext, RoundOutput,
};

const VALUE_KEY: &str = "max/value";
const HOPS_KEY: &str = "max/hops";

/// Spreads the largest seed in the network, along with how many links
/// away its origin is.
pub struct MaxGossipKernel {
    seed: i64,
    best: i64,
    hops: i64,
}

impl MaxGossipKernel {
    pub fn new(seed: i64) -> Self {
        Self {
            seed,
            best: seed,
            hops: 0,
        }
    }
}

impl AggregateKernel for MaxGossipKernel {
    fn run_round(&mut self, ctx: &RoundContext<'_>) -> Result<RoundOutput> {
        let value_key = CodePath::from(VALUE_KEY);
        let hops_key = CodePath::from(HOPS_KEY);

        let heard = ctx.neighbors.values().filter_map(|payload| {
            let value = payload.get(&value_key).and_then(GossipValue::as_int)?;
            let hops = payload.get(&hops_key).and_then(GossipValue::as_int)?;
            Some((value, hops.saturating_add(1)))
        });

        // larger value wins, then the shorter route to it
        let (best, hops) = [(self.seed, 0), (self.best, self.hops)]
            .into_iter()
            .chain(heard)
            .max_by_key(|&(value, hops)| (value, Reverse(hops)))
            .unwrap_or((self.seed, 0));
        self.best = best;
        self.hops = hops;

        let mut outbound = BTreeMap::new();
        outbound.insert(value_key, GossipValue::Int(best));
        outbound.insert(hops_key, GossipValue::Int(hops));

        let mut local = BTreeMap::new();
        local.insert("value".to_string(), GossipValue::Int(best));
        local.insert("hops".to_string(), GossipValue::Int(hops));

        Ok(RoundOutput {
            local_value: GossipValue::Map(local),
            outbound,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regionmesh_protocol::{NodeIdentifier, SharePayload};

    fn announce(value: i64, hops: i64) -> SharePayload {
        let mut payload = SharePayload::new();
        payload.insert(VALUE_KEY.into(), GossipValue::Int(value));
        payload.insert(HOPS_KEY.into(), GossipValue::Int(hops));
        payload
    }

    fn round(kernel: &mut MaxGossipKernel, neighbors: &[(&str, SharePayload)]) -> (i64, i64) {
        let node = NodeIdentifier::new("self");
        let neighbors: BTreeMap<NodeIdentifier, SharePayload> = neighbors
            .iter()
            .map(|(name, payload)| (NodeIdentifier::new(*name), payload.clone()))
            .collect();
        let out = kernel
            .run_round(&RoundContext {
                node: &node,
                round: 0,
                neighbors: &neighbors,
            })
            .unwrap();
        (
            out.outbound[&CodePath::from(VALUE_KEY)].as_int().unwrap(),
            out.outbound[&CodePath::from(HOPS_KEY)].as_int().unwrap(),
        )
    }

    #[test]
    fn test_alone_publishes_seed() {
        let mut kernel = MaxGossipKernel::new(5);
        assert_eq!(round(&mut kernel, &[]), (5, 0));
    }

    #[test]
    fn test_adopts_larger_value_one_hop_further() {
        let mut kernel = MaxGossipKernel::new(5);
        let result = round(&mut kernel, &[("a", announce(9, 2)), ("b", announce(3, 0))]);
        assert_eq!(result, (9, 3));
    }

    #[test]
    fn test_prefers_shorter_route() {
        let mut kernel = MaxGossipKernel::new(1);
        round(&mut kernel, &[("a", announce(9, 4))]);
        let result = round(&mut kernel, &[("a", announce(9, 4)), ("b", announce(9, 0))]);
        assert_eq!(result, (9, 1));
    }

    #[test]
    fn test_keeps_maximum_after_neighbor_leaves() {
        let mut kernel = MaxGossipKernel::new(1);
        round(&mut kernel, &[("a", announce(7, 0))]);
        assert_eq!(round(&mut kernel, &[]), (7, 1));
    }

    #[test]
    fn test_ignores_malformed_payload() {
        let mut kernel = MaxGossipKernel::new(2);
        let mut junk = SharePayload::new();
        junk.insert(VALUE_KEY.into(), GossipValue::Text("big".into()));
        assert_eq!(round(&mut kernel, &[("a", junk)]), (2, 0));
    }
}
