//! C5: Election.
//!
//! Candidate aggregation and winner selection, in both legacy
//! (sort-based) and STELLAR (Pareto/Nash) modes, plus the re-election
//! triggers used by the state machine (C6).

use crate::config::{Config, StellarTuning};
use crate::metrics::{utility_curves, NodeMetrics};
use crate::neighbor::{NeighborEntry, NeighborTable};

/// A single election candidate: either the local node or one verified,
/// in-cluster neighbor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub node_id: u32,
    pub score: f64,
    pub battery: f64,
    pub uptime_seconds: u64,
    pub trust: f64,
    pub link_quality: f64,
}

/// Build the candidate set: self plus every neighbor that is `verified`,
/// in-cluster (`rssi_ewma >= cluster_radius_rssi_dbm`), and above the
/// trust floor.
pub fn build_candidates(self_node_id: u32, self_metrics: &NodeMetrics, neighbors: &[NeighborEntry], cfg: &Config) -> Vec<Candidate> {
    let mut out = vec![Candidate {
        node_id: self_node_id,
        score: self_metrics.composite_score,
        battery: self_metrics.battery,
        uptime_seconds: self_metrics.uptime_seconds,
        trust: self_metrics.trust,
        link_quality: self_metrics.link_quality,
    }];
    for n in neighbors {
        if n.verified && n.rssi_ewma >= cfg.cluster_radius_rssi_dbm && n.trust >= cfg.trust_floor {
            out.push(Candidate {
                node_id: n.node_id,
                score: n.score,
                battery: n.battery,
                uptime_seconds: n.uptime_seconds,
                trust: n.trust,
                link_quality: n.link_quality,
            });
        }
    }
    out
}

/// Legacy sort: `(score, link_quality, battery, trust, -node_id)`
/// descending; the head is the winner.
fn legacy_winner(candidates: &[Candidate]) -> u32 {
    candidates
        .iter()
        .max_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.link_quality.partial_cmp(&b.link_quality).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.battery.partial_cmp(&b.battery).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.trust.partial_cmp(&b.trust).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| b.node_id.cmp(&a.node_id))
        })
        .map(|c| c.node_id)
        .unwrap_or(0)
}

struct StellarCandidate {
    candidate: Candidate,
    phis: [f64; 4],
    dominated_by_count: u32,
    on_frontier: bool,
}

/// `a` Pareto-dominates `b`: weakly better on every dimension, strictly
/// better on at least one.
fn dominates(a: &[f64; 4], b: &[f64; 4]) -> bool {
    let mut strictly_better = false;
    for i in 0..4 {
        if a[i] < b[i] {
            return false;
        }
        if a[i] > b[i] {
            strictly_better = true;
        }
    }
    strictly_better
}

/// STELLAR candidate selection: Pareto frontier, then Nash bargaining
/// over the frontier using the caller's own Lyapunov-adapted weight
/// vector, then the fallback cascade.
fn stellar_winner(candidates: &[Candidate], tuning: &StellarTuning, weights: &[f64; 4]) -> u32 {
    if candidates.is_empty() {
        return 0;
    }

    let mut scored: Vec<StellarCandidate> = candidates
        .iter()
        .map(|c| StellarCandidate {
            candidate: *c,
            phis: utility_curves(c.battery, c.uptime_seconds, c.trust, c.link_quality, tuning),
            dominated_by_count: 0,
            on_frontier: true,
        })
        .collect();

    for i in 0..scored.len() {
        for j in 0..scored.len() {
            if i == j {
                continue;
            }
            if dominates(&scored[j].phis, &scored[i].phis) {
                scored[i].dominated_by_count += 1;
                scored[i].on_frontier = false;
            }
        }
    }

    let frontier: Vec<&StellarCandidate> = scored.iter().filter(|s| s.on_frontier).collect();

    // Nash bargaining over the frontier: maximize sum(w_i * ln(phi_i - d_i)),
    // candidates with any phi_i <= d_i are ineligible.
    let d = tuning.disagreement_point;
    let mut best_nash: Option<(u32, f64)> = None;
    for s in &frontier {
        let eligible = (0..4).all(|i| s.phis[i] > d[i]);
        if !eligible {
            continue;
        }
        let value: f64 = (0..4).map(|i| weights[i] * (s.phis[i] - d[i]).ln()).sum();
        if best_nash.map(|(_, v)| value > v).unwrap_or(true) {
            best_nash = Some((s.candidate.node_id, value));
        }
    }
    if let Some((id, _)) = best_nash {
        return id;
    }

    // Fallback (a): highest Psi on the frontier.
    if let Some(s) = frontier.iter().max_by(|a, b| {
        a.candidate
            .score
            .partial_cmp(&b.candidate.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    }) {
        return s.candidate.node_id;
    }

    // Fallback (b): highest Psi overall.
    if let Some(s) = scored.iter().max_by(|a, b| {
        a.candidate
            .score
            .partial_cmp(&b.candidate.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    }) {
        return s.candidate.node_id;
    }

    // Fallback (c): lowest node_id among remaining.
    candidates.iter().map(|c| c.node_id).min().unwrap_or(0)
}

/// `run() -> node_id`. Returns `0` if no candidate exists. `weights` is
/// the caller's own (possibly Lyapunov-adapted) weight vector, consulted
/// only by the STELLAR Nash bargaining step.
pub fn run(self_node_id: u32, self_metrics: &NodeMetrics, neighbors: &[NeighborEntry], cfg: &Config, weights: &[f64; 4]) -> u32 {
    let candidates = build_candidates(self_node_id, self_metrics, neighbors, cfg);
    if candidates.is_empty() {
        return 0;
    }
    if cfg.stellar_enabled {
        stellar_winner(&candidates, &cfg.stellar, weights)
    } else {
        legacy_winner(&candidates)
    }
}

/// Which condition caused a CH to need re-election. The two causes drive
/// different state transitions: yielding to a superior neighbor steps
/// straight down to `MEMBER`, while self-degradation re-enters
/// `CANDIDATE` to stabilize before re-competing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChReelectionTrigger {
    /// Own battery/trust/link_quality dropped below its floor.
    SelfDegraded,
    /// A valid CH neighbor now has a higher (or tied, lower-node_id)
    /// score than this node's own.
    Yield(u32),
}

/// `check_reelection_needed()` for a node currently in `CH`. Returns
/// `None` when the CH should keep running, or the specific trigger that
/// fired otherwise.
pub fn ch_reelection_needed(self_node_id: u32, self_metrics: &NodeMetrics, neighbors: &NeighborTable, now_ms: u64, cfg: &Config) -> Option<ChReelectionTrigger> {
    if self_metrics.battery < cfg.battery_low_threshold
        || self_metrics.trust < cfg.trust_floor
        || self_metrics.link_quality < cfg.link_quality_floor
    {
        return Some(ChReelectionTrigger::SelfDegraded);
    }
    let entries = neighbors.get_all(usize::MAX);
    for n in entries {
        if !n.is_valid_ch(now_ms, cfg.trust_floor, cfg.ch_beacon_timeout_ms) {
            continue;
        }
        let delta = n.score - self_metrics.composite_score;
        if delta > 0.01 {
            return Some(ChReelectionTrigger::Yield(n.node_id));
        }
        if delta.abs() <= 0.01 && n.node_id < self_node_id {
            return Some(ChReelectionTrigger::Yield(n.node_id));
        }
    }
    None
}

/// `check_reelection_needed()` for a node currently in `MEMBER`. Returns
/// `true` when no valid CH exists, or the CH's own reported
/// battery/trust/link_quality dips below its floor.
pub fn member_reelection_needed(neighbors: &NeighborTable, now_ms: u64, cfg: &Config) -> bool {
    let entries = neighbors.get_all(usize::MAX);
    let ch = entries
        .iter()
        .find(|n| n.is_valid_ch(now_ms, cfg.trust_floor, cfg.ch_beacon_timeout_ms));
    match ch {
        None => true,
        Some(ch) => {
            ch.battery < cfg.battery_low_threshold
                || ch.trust < cfg.trust_floor
                || ch.link_quality < cfg.link_quality_floor
        }
    }
}
