//! C2: Metrics Engine.
//!
//! EWMA smoothing of link signals, composite trust/link-quality, the
//! legacy linear score, and the STELLAR score (non-linear utility curves,
//! Lyapunov-stable adaptive weights, Pareto/Nash-ready output). The
//! reference design uses a recursive mutex because `metrics_update`
//! re-enters public recorders; this implementation instead factors the
//! recomputation path as a private helper (`recompute_locked`) that the
//! public recorders call while already holding the lock, so a plain
//! (non-recursive) mutex suffices.

use crate::config::{Config, EwmaCoefficients, StellarTuning};
use std::sync::Mutex;

/// Trust composite weight: `trust = a_HSR*HSR + a_PDR*PDR +
/// a_REPUTATION*REPUTATION`. `a_HSR` and `a_REPUTATION` reuse the EWMA
/// smoothing coefficients of the same name; `a_PDR` is fixed here so the
/// three composite weights sum to 1.
const TRUST_WEIGHT_PDR: f64 = 0.30;

/// Self metrics snapshot. A plain value type — no shared mutable state
/// escapes the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeMetrics {
    pub battery: f64,
    pub uptime_seconds: u64,
    pub trust: f64,
    pub link_quality: f64,
    pub composite_score: f64,
    pub var_battery: f64,
    pub var_trust: f64,
    pub var_link_quality: f64,
    /// Entropy-confidence vector, `[battery, uptime, trust, link_quality]`,
    /// summing to 1.
    pub confidence: [f64; 4],
    pub pareto_rank: u32,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self {
            battery: 0.0,
            uptime_seconds: 0,
            trust: 0.5,
            link_quality: 0.0,
            composite_score: 0.0,
            var_battery: 1e-3,
            var_trust: 1e-3,
            var_link_quality: 1e-3,
            confidence: [0.25; 4],
            pareto_rank: 0,
        }
    }
}

impl NodeMetrics {
    /// Clamp every fraction field to `[0, 1]`.
    pub fn clamp(&mut self) {
        self.battery = self.battery.clamp(0.0, 1.0);
        self.trust = self.trust.clamp(0.0, 1.0);
        self.link_quality = self.link_quality.clamp(0.0, 1.0);
    }
}

/// Four non-linear utility values, in the fixed order
/// `[battery, uptime, trust, link_quality]`, used by both the STELLAR
/// weighted sum and the election's Pareto/Nash pipeline.
pub fn utility_curves(
    battery: f64,
    uptime_seconds: u64,
    trust: f64,
    link_quality: f64,
    tuning: &StellarTuning,
) -> [f64; 4] {
    let phi_b = {
        let lb = tuning.lambda_battery;
        (1.0 - (-lb * battery).exp()) / (1.0 - (-lb).exp())
    };
    let phi_u = {
        let u_norm = (uptime_seconds as f64 / (tuning.uptime_max_days * 86_400.0)).min(1.0);
        (tuning.lambda_uptime * u_norm).tanh()
    };
    let phi_t = trust * trust * (3.0 - 2.0 * trust);
    let phi_l = if link_quality <= 0.0 {
        0.0
    } else {
        link_quality.powf(1.0 / tuning.gamma_linkq)
    };
    [phi_b, phi_u, phi_t, phi_l]
}

struct Ewmas {
    rssi: f64,
    per: f64,
    hsr: f64,
    reputation: f64,
    prev_battery: f64,
    prev_trust: f64,
    prev_link_quality: f64,
}

impl Ewmas {
    fn new() -> Self {
        Self {
            rssi: -70.0,
            per: 0.1,
            hsr: 0.5,
            reputation: 0.5,
            prev_battery: 0.0,
            prev_trust: 0.5,
            prev_link_quality: 0.0,
        }
    }
}

struct Inner {
    ewma: Ewmas,
    battery: f64,
    uptime_seconds: u64,
    weights: [f64; 4],
    metrics: NodeMetrics,
}

pub struct MetricsEngine {
    inner: Mutex<Inner>,
    coeffs: EwmaCoefficients,
    stellar: StellarTuning,
    stellar_enabled: bool,
}

impl MetricsEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ewma: Ewmas::new(),
                battery: 1.0,
                uptime_seconds: 0,
                weights: config.weights.as_array(),
                metrics: NodeMetrics::default(),
            }),
            coeffs: config.ewma,
            stellar: config.stellar,
            stellar_enabled: config.stellar_enabled,
        }
    }

    /// Push a fresh battery reading. By convention, a reading equivalent
    /// to "on USB/external power" is represented as `1.0` by the caller.
    pub fn set_battery(&self, battery_fraction: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.battery = battery_fraction.clamp(0.0, 1.0);
        self.recompute_locked(&mut inner);
    }

    pub fn set_uptime_seconds(&self, uptime_seconds: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.uptime_seconds = uptime_seconds;
        self.recompute_locked(&mut inner);
    }

    pub fn update_rssi(&self, rssi_dbm: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.ewma.rssi = self.coeffs.rssi * rssi_dbm + (1.0 - self.coeffs.rssi) * inner.ewma.rssi;
        self.recompute_locked(&mut inner);
    }

    /// `record_ble_reception(received, missed)` — one successful reception
    /// plus an inferred count of packets missed since the last one, fed by
    /// the neighbor table's sequence-gap inference.
    pub fn record_ble_reception(&self, received: u32, missed: u32) {
        let mut inner = self.inner.lock().unwrap();
        let total = (received + missed) as f64;
        let per_sample = if total > 0.0 { missed as f64 / total } else { 0.0 };
        inner.ewma.per = self.coeffs.per * per_sample + (1.0 - self.coeffs.per) * inner.ewma.per;
        self.recompute_locked(&mut inner);
    }

    pub fn record_hmac_success(&self, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        let sample = if success { 1.0 } else { 0.0 };
        inner.ewma.hsr = self.coeffs.hsr * sample + (1.0 - self.coeffs.hsr) * inner.ewma.hsr;
        self.recompute_locked(&mut inner);
    }

    pub fn update_reputation(&self, external_reputation: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.ewma.reputation = self.coeffs.reputation * external_reputation
            + (1.0 - self.coeffs.reputation) * inner.ewma.reputation;
        self.recompute_locked(&mut inner);
    }

    /// Discrete success/failure nudge to the reputation signal, mirroring
    /// the neighbor table's own `update_trust` nudge:
    /// `trust <- 0.9*trust + 0.1*(success?1:0)`.
    pub fn update_trust(&self, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        let sample = if success { 1.0 } else { 0.0 };
        inner.ewma.reputation = 0.9 * inner.ewma.reputation + 0.1 * sample;
        self.recompute_locked(&mut inner);
    }

    pub fn get_current(&self) -> NodeMetrics {
        self.inner.lock().unwrap().metrics
    }

    pub fn weights(&self) -> [f64; 4] {
        self.inner.lock().unwrap().weights
    }

    pub fn set_weights(&self, weights: [f64; 4]) {
        let mut inner = self.inner.lock().unwrap();
        inner.weights = weights;
        self.recompute_locked(&mut inner);
    }

    /// Lyapunov potential `V` evaluated against the current target
    /// weights, for external convergence monitoring / tests.
    pub fn lyapunov_v(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        let target = target_weights(&inner.metrics.confidence, &inner.weights, &self.stellar);
        lyapunov_potential(&inner.weights, &target, &self.stellar)
    }

    fn recompute_locked(&self, inner: &mut Inner) {
        let per = inner.ewma.per;
        let pdr = 1.0 - per;
        let trust = (self.coeffs.hsr * inner.ewma.hsr
            + TRUST_WEIGHT_PDR * pdr
            + self.coeffs.reputation * inner.ewma.reputation)
            .clamp(0.0, 1.0);

        let rssi_q = ((inner.ewma.rssi + 100.0) / 50.0).clamp(0.0, 1.0);
        let per_q = (1.0 - per).clamp(0.0, 1.0);
        let link_quality = (0.7 * rssi_q + 0.3 * per_q).clamp(0.0, 1.0);

        let battery = inner.battery.clamp(0.0, 1.0);

        // Variance EWMAs from successive deltas.
        let d_battery = battery - inner.ewma.prev_battery;
        let d_trust = trust - inner.ewma.prev_trust;
        let d_linkq = link_quality - inner.ewma.prev_link_quality;
        inner.ewma.prev_battery = battery;
        inner.ewma.prev_trust = trust;
        inner.ewma.prev_link_quality = link_quality;

        let alpha_v = self.coeffs.variance;
        let mut m = inner.metrics;
        m.var_battery = alpha_v * d_battery * d_battery + (1.0 - alpha_v) * m.var_battery;
        m.var_trust = alpha_v * d_trust * d_trust + (1.0 - alpha_v) * m.var_trust;
        m.var_link_quality = alpha_v * d_linkq * d_linkq + (1.0 - alpha_v) * m.var_link_quality;
        // floor variances away from zero: ln(var) below is undefined at 0.
        m.var_battery = m.var_battery.max(1e-9);
        m.var_trust = m.var_trust.max(1e-9);
        m.var_link_quality = m.var_link_quality.max(1e-9);

        m.battery = battery;
        m.trust = trust;
        m.link_quality = link_quality;
        m.uptime_seconds = inner.uptime_seconds;

        let confidence = confidence_vector(
            m.var_battery,
            m.var_trust,
            m.var_link_quality,
            self.stellar.gamma_confidence,
        );
        m.confidence = confidence;

        if self.stellar_enabled {
            let target = target_weights(&confidence, &inner.weights, &self.stellar);
            inner.weights = lyapunov_step(&inner.weights, &target, &self.stellar);
            let phis = utility_curves(battery, m.uptime_seconds, trust, link_quality, &self.stellar);
            let weighted: f64 = inner
                .weights
                .iter()
                .zip(phis.iter())
                .map(|(w, p)| w * p)
                .sum();
            // Absent cluster-wide topology data this node only ever sees
            // candidates already present in its own neighbor table, so
            // centrality is fixed at 1 (fully central from this node's
            // local perspective; see DESIGN.md).
            let kappa = 1.0 / (1.0 + self.stellar.epsilon_centrality * (1.0 - 1.0));
            let rho = self.stellar.delta_pareto * (m.pareto_rank as f64 / 10.0);
            m.composite_score = weighted * kappa + rho;
        } else {
            m.composite_score = inner.weights[0] * battery
                + inner.weights[1] * (m.uptime_seconds as f64 / 86_400.0)
                + inner.weights[2] * trust
                + inner.weights[3] * link_quality;
        }

        m.clamp();
        inner.metrics = m;
    }
}

/// `H_i = 0.5 * ln(2*pi*e*sigma2_i)`, `uptime` uses a fixed tiny variance.
/// Confidence is the softmax of `-gamma*H_i`.
fn confidence_vector(var_battery: f64, var_trust: f64, var_linkq: f64, gamma: f64) -> [f64; 4] {
    const UPTIME_FIXED_VARIANCE: f64 = 1e-6;
    let two_pi_e = 2.0 * std::f64::consts::PI * std::f64::consts::E;
    let h = [
        0.5 * (two_pi_e * var_battery).ln(),
        0.5 * (two_pi_e * UPTIME_FIXED_VARIANCE).ln(),
        0.5 * (two_pi_e * var_trust).ln(),
        0.5 * (two_pi_e * var_linkq).ln(),
    ];
    let exps: [f64; 4] = [
        (-gamma * h[0]).exp(),
        (-gamma * h[1]).exp(),
        (-gamma * h[2]).exp(),
        (-gamma * h[3]).exp(),
    ];
    let sum: f64 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return [0.25; 4];
    }
    [
        exps[0] / sum,
        exps[1] / sum,
        exps[2] / sum,
        exps[3] / sum,
    ]
}

/// `w*_i = base_i * (1 + 0.5*(c_i - 0.25))`, floored at `w_min` and
/// renormalized to the simplex. `base` is the current weight vector
/// prior to this adaptation step.
fn target_weights(confidence: &[f64; 4], base: &[f64; 4], tuning: &StellarTuning) -> [f64; 4] {
    let mut w = [0.0; 4];
    for i in 0..4 {
        w[i] = base[i] * (1.0 + 0.5 * (confidence[i] - 0.25));
        if w[i] < tuning.w_min || !w[i].is_finite() {
            w[i] = tuning.w_min;
        }
    }
    let sum: f64 = w.iter().sum();
    if sum > 0.0 {
        for v in w.iter_mut() {
            *v /= sum;
        }
    }
    w
}

/// One Lyapunov gradient step toward `target`, then projected back onto
/// the simplex.
fn lyapunov_step(current: &[f64; 4], target: &[f64; 4], tuning: &StellarTuning) -> [f64; 4] {
    let mut next = [0.0; 4];
    for i in 0..4 {
        let grad = (1.0 + tuning.beta) * (current[i] - target[i]);
        next[i] = current[i] - tuning.eta * grad;
        if next[i] < tuning.w_min || !next[i].is_finite() {
            next[i] = tuning.w_min;
        }
    }
    let sum: f64 = next.iter().sum();
    if sum > 0.0 {
        for v in next.iter_mut() {
            *v /= sum;
        }
    }
    next
}

/// `V = 0.5*sum((w_i - w*_i)^2) + lambda*sum(grad_i^2)`.
fn lyapunov_potential(current: &[f64; 4], target: &[f64; 4], tuning: &StellarTuning) -> f64 {
    let mut quad = 0.0;
    let mut grad_sq = 0.0;
    for i in 0..4 {
        let diff = current[i] - target[i];
        quad += diff * diff;
        let grad = (1.0 + tuning.beta) * diff;
        grad_sq += grad * grad;
    }
    0.5 * quad + tuning.lambda * grad_sq
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use proptest::prelude::*;

    fn engine_with_stellar(enabled: bool) -> MetricsEngine {
        let mut cfg = Config::default();
        cfg.stellar_enabled = enabled;
        MetricsEngine::new(&cfg)
    }

    #[test]
    fn clamping_holds_for_any_input() {
        let engine = engine_with_stellar(false);
        engine.set_battery(5.0);
        engine.update_rssi(50.0);
        engine.record_ble_reception(0, 100);
        let m = engine.get_current();
        assert!((0.0..=1.0).contains(&m.battery));
        assert!((0.0..=1.0).contains(&m.trust));
        assert!((0.0..=1.0).contains(&m.link_quality));
    }

    #[test]
    fn weight_simplex_holds_after_stellar_update() {
        let engine = engine_with_stellar(true);
        for i in 0..50 {
            engine.set_battery(0.1 + (i as f64 * 0.01) % 0.9);
            engine.update_rssi(-60.0 - (i as f64));
            engine.record_hmac_success(i % 3 != 0);
        }
        let w = engine.weights();
        let sum: f64 = w.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6, "sum={sum}");
        for x in w {
            assert!(x >= 0.05 - 1e-9);
        }
    }

    #[test]
    fn lyapunov_descent_is_non_increasing_at_fixed_signal() {
        let engine = engine_with_stellar(true);
        engine.set_battery(0.9);
        engine.update_rssi(-50.0);
        engine.record_hmac_success(true);
        let mut prev = engine.lyapunov_v();
        for _ in 0..30 {
            // hold signals constant, only the weight adaptation runs
            engine.set_battery(0.9);
            let v = engine.lyapunov_v();
            assert!(v <= prev + 1e-9, "V increased: {v} > {prev}");
            prev = v;
        }
    }

    #[test]
    fn beacon_round_trip_fractions_survive_quantization() {
        // battery/trust/link_quality match to within 1/10000 — exercised
        // fully in beacon.rs; here we just confirm get_current is stable
        // under repeated reads with no writes in between.
        let engine = engine_with_stellar(false);
        engine.set_battery(0.42);
        let a = engine.get_current();
        let b = engine.get_current();
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn prop_clamping_always_holds(battery in -10.0f64..10.0, rssi in -200.0f64..50.0, missed in 0u32..500) {
            let engine = engine_with_stellar(false);
            engine.set_battery(battery);
            engine.update_rssi(rssi);
            engine.record_ble_reception(1, missed);
            let m = engine.get_current();
            prop_assert!((0.0..=1.0).contains(&m.battery));
            prop_assert!((0.0..=1.0).contains(&m.trust));
            prop_assert!((0.0..=1.0).contains(&m.link_quality));
        }

        #[test]
        fn prop_weight_simplex_always_holds(battery in 0.0f64..1.0, rssi in -100.0f64..-40.0) {
            let engine = engine_with_stellar(true);
            engine.set_battery(battery);
            engine.update_rssi(rssi);
            let w = engine.weights();
            let sum: f64 = w.iter().sum();
            prop_assert!((sum - 1.0).abs() < 1e-6);
            for x in w {
                prop_assert!(x >= 0.05 - 1e-9);
            }
        }
    }
}
