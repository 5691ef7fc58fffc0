//! Test-only metrics synthesizer. The reference firmware's `DEMO_MODE`
//! fabricates per-node metrics from `node_id` so a cluster can be
//! exercised without real sensors. This is a harness affordance for
//! `wsn-core/tests/` scripted scenarios, never part of the production
//! path — hence `#[cfg(test)]` at the module root ([`crate::demo`]).

/// A deterministic, node_id-derived metrics profile for scripted
/// scenarios. Not randomized: the same `node_id` always synthesizes the
/// same profile, so scenario expectations stay reproducible.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeProfile {
    pub battery: f64,
    pub trust: f64,
    pub link_quality: f64,
}

/// Synthesize a profile from `node_id`. Low node_ids get strong
/// profiles, purely so scenario authors can reason about "node 1 should
/// win" without hand-picking floating point inputs.
pub fn synthesize(node_id: u32) -> NodeProfile {
    let mix = (node_id % 100) as f64 / 100.0;
    NodeProfile {
        battery: (0.95 - mix * 0.6).clamp(0.0, 1.0),
        trust: (0.9 - mix * 0.4).clamp(0.0, 1.0),
        link_quality: (0.9 - mix * 0.4).clamp(0.0, 1.0),
    }
}
