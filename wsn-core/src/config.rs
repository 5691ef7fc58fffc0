//! Configuration surface and tuning defaults.
//!
//! Every field here is initialized from [`defaults`] and then overridden,
//! key by key, from whatever [`crate::persistence::PersistenceStore`] the
//! engine was built with. A key that is missing or fails to parse keeps
//! its previous value.

use crate::persistence::PersistenceStore;

/// Linear-score weight vector, `(battery, uptime, trust, link_quality)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub battery: f64,
    pub uptime: f64,
    pub trust: f64,
    pub link_quality: f64,
}

impl Weights {
    /// Renormalize so the four weights sum to 1, flooring each at
    /// `w_min` first: the weight vector lives on the simplex, with every
    /// weight >= w_min.
    pub fn renormalize(&mut self, w_min: f64) {
        let mut v = [self.battery, self.uptime, self.trust, self.link_quality];
        for w in v.iter_mut() {
            if *w < w_min || !w.is_finite() {
                *w = w_min;
            }
        }
        let sum: f64 = v.iter().sum();
        if sum > 0.0 {
            for w in v.iter_mut() {
                *w /= sum;
            }
        }
        self.battery = v[0];
        self.uptime = v[1];
        self.trust = v[2];
        self.link_quality = v[3];
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.battery, self.uptime, self.trust, self.link_quality]
    }
}

/// Tuning constants for the STELLAR score, treated as configuration
/// rather than code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StellarTuning {
    /// Confidence sharpness, γ in `c_i = exp(-γ H_i) / Σ exp(-γ H_j)`.
    pub gamma_confidence: f64,
    /// Lyapunov gradient step size η.
    pub eta: f64,
    /// Lyapunov gradient damping β.
    pub beta: f64,
    /// Lyapunov potential's gradient-norm weight λ.
    pub lambda: f64,
    /// Convergence threshold ε on V.
    pub epsilon: f64,
    /// Minimum weight floor (also used for the legacy weight simplex).
    pub w_min: f64,
    /// Battery utility curvature λ_b.
    pub lambda_battery: f64,
    /// Uptime utility curvature λ_u.
    pub lambda_uptime: f64,
    /// Link-quality utility exponent γ_L (applied as `l^(1/γ_L)`).
    pub gamma_linkq: f64,
    /// Uptime normalization horizon, in days.
    pub uptime_max_days: f64,
    /// Centrality sensitivity ε_c.
    pub epsilon_centrality: f64,
    /// Pareto-rank bonus scale δ.
    pub delta_pareto: f64,
    /// Nash bargaining disagreement point, per-dimension
    /// `(battery, uptime, trust, link_quality)`.
    pub disagreement_point: [f64; 4],
}

impl Default for StellarTuning {
    fn default() -> Self {
        Self {
            gamma_confidence: 1.5,
            eta: 0.1,
            beta: 0.1,
            lambda: 0.05,
            epsilon: 1e-4,
            w_min: 0.05,
            lambda_battery: 2.5,
            lambda_uptime: 1.0,
            gamma_linkq: 0.85,
            uptime_max_days: 30.0,
            epsilon_centrality: 0.5,
            delta_pareto: 0.02,
            disagreement_point: [0.05, 0.0, 0.05, 0.05],
        }
    }
}

/// EWMA smoothing coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EwmaCoefficients {
    pub rssi: f64,
    pub per: f64,
    pub hsr: f64,
    pub reputation: f64,
    pub variance: f64,
}

impl Default for EwmaCoefficients {
    fn default() -> Self {
        Self {
            rssi: 0.2,
            per: 0.1,
            hsr: 0.4,
            reputation: 0.3,
            variance: 0.1,
        }
    }
}

/// The full persisted configuration surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    pub weights: Weights,
    pub stellar_enabled: bool,
    pub election_window_ms: u64,
    pub ch_beacon_timeout_ms: u64,
    pub neighbor_timeout_ms: u64,
    pub trust_floor: f64,
    pub link_quality_floor: f64,
    pub battery_low_threshold: f64,
    pub cluster_radius_rssi_dbm: f64,
    pub beacon_interval_ms: u32,
    pub beacon_offset_ms: u32,
    pub ewma: EwmaCoefficients,
    pub stellar: StellarTuning,
}

pub mod defaults {
    pub const MAX_NEIGHBORS: usize = 16;
    pub const NEIGHBOR_TIMEOUT_MS: u64 = 25_000;
    pub const CH_BEACON_TIMEOUT_MS: u64 = 10_000;
    pub const ELECTION_WINDOW_MS: u64 = 10_000;
    pub const TRUST_FLOOR: f64 = 0.4;
    pub const LINK_QUALITY_FLOOR: f64 = 0.3;
    pub const BATTERY_LOW_THRESHOLD: f64 = 0.15;
    pub const CLUSTER_RADIUS_RSSI_DBM: f64 = -85.0;
    pub const BEACON_INTERVAL_MS: u32 = 1_000;
    pub const REPLAY_WINDOW_MS: u64 = 5_000;
    pub const REPLAY_TABLE_CAPACITY: usize = 32;
    pub const INIT_SETTLE_MS: u64 = 2_000;
    pub const DISCOVER_MIN_MS: u64 = 2_000;
    pub const DISCOVER_DEADLINE_MS: u64 = 5_000;
    pub const LED_HYSTERESIS_MS: u64 = 60_000;
    pub const UPTIME_PERSIST_INTERVAL_MS: u64 = 60_000;
    pub const SCHEDULE_PERIOD_MS: u64 = 10_000;
    pub const SLOT_DURATION_SEC: u8 = 1;
    pub const SCHEDULE_LEAD_US: i64 = 5_000_000;
    pub const SLOT_SLEEP_THRESHOLD_MS: i64 = 2_000;
    pub const SLOT_BURST_HEADROOM_MS: u64 = 1_000;
}

impl Default for Config {
    fn default() -> Self {
        use defaults::*;
        Self {
            weights: Weights {
                battery: 0.25,
                uptime: 0.25,
                trust: 0.30,
                link_quality: 0.20,
            },
            stellar_enabled: false,
            election_window_ms: ELECTION_WINDOW_MS,
            ch_beacon_timeout_ms: CH_BEACON_TIMEOUT_MS,
            neighbor_timeout_ms: NEIGHBOR_TIMEOUT_MS,
            trust_floor: TRUST_FLOOR,
            link_quality_floor: LINK_QUALITY_FLOOR,
            battery_low_threshold: BATTERY_LOW_THRESHOLD,
            cluster_radius_rssi_dbm: CLUSTER_RADIUS_RSSI_DBM,
            beacon_interval_ms: BEACON_INTERVAL_MS,
            beacon_offset_ms: 0,
            ewma: EwmaCoefficients::default(),
            stellar: StellarTuning::default(),
        }
    }
}

impl Config {
    /// Load defaults, then apply every recognized key found in `store`.
    /// Unknown keys are ignored; malformed values keep the default.
    pub fn from_store(store: &dyn PersistenceStore) -> Self {
        let mut cfg = Self::default();
        cfg.refresh_from_store(store);
        cfg
    }

    /// Re-apply all recognized keys from `store` onto an existing config,
    /// leaving any key that is absent or unparseable untouched.
    pub fn refresh_from_store(&mut self, store: &dyn PersistenceStore) {
        if let Some(v) = get_f64(store, "w_battery") {
            self.weights.battery = v;
        }
        if let Some(v) = get_f64(store, "w_uptime") {
            self.weights.uptime = v;
        }
        if let Some(v) = get_f64(store, "w_trust") {
            self.weights.trust = v;
        }
        if let Some(v) = get_f64(store, "w_linkq") {
            self.weights.link_quality = v;
        }
        self.weights.renormalize(self.stellar.w_min);

        if let Some(v) = get_u64(store, "stellar_enabled") {
            self.stellar_enabled = v != 0;
        }
        if let Some(v) = get_u64(store, "election_window_ms") {
            self.election_window_ms = v;
        }
        if let Some(v) = get_u64(store, "ch_beacon_timeout_ms") {
            self.ch_beacon_timeout_ms = v;
        }
        if let Some(v) = get_u64(store, "neighbor_timeout_ms") {
            self.neighbor_timeout_ms = v;
        }
        if let Some(v) = get_f64(store, "trust_floor") {
            self.trust_floor = v;
        }
        if let Some(v) = get_f64(store, "link_quality_floor") {
            self.link_quality_floor = v;
        }
        if let Some(v) = get_f64(store, "battery_low_threshold") {
            self.battery_low_threshold = v;
        }
        if let Some(v) = get_f64(store, "cluster_radius_rssi_dbm") {
            self.cluster_radius_rssi_dbm = v;
        }
        if let Some(v) = get_u64(store, "beacon_interval_ms") {
            self.beacon_interval_ms = v as u32;
        }
        if let Some(v) = get_u64(store, "beacon_offset_ms") {
            self.beacon_offset_ms = v as u32;
        }
    }

    /// Apply a single `CONFIG key=value` administrative command.
    /// Returns `true` if the key was recognized and the value parsed.
    pub fn apply_override(&mut self, key: &str, value: &str) -> bool {
        let parsed_f64 = value.parse::<f64>().ok();
        let parsed_u64 = value.parse::<u64>().ok();
        match (key, parsed_f64, parsed_u64) {
            ("w_battery", Some(v), _) => {
                self.weights.battery = v;
                self.weights.renormalize(self.stellar.w_min);
                true
            }
            ("w_uptime", Some(v), _) => {
                self.weights.uptime = v;
                self.weights.renormalize(self.stellar.w_min);
                true
            }
            ("w_trust", Some(v), _) => {
                self.weights.trust = v;
                self.weights.renormalize(self.stellar.w_min);
                true
            }
            ("w_linkq", Some(v), _) => {
                self.weights.link_quality = v;
                self.weights.renormalize(self.stellar.w_min);
                true
            }
            ("stellar_enabled", _, Some(v)) => {
                self.stellar_enabled = v != 0;
                true
            }
            ("election_window_ms", _, Some(v)) => {
                self.election_window_ms = v;
                true
            }
            ("ch_beacon_timeout_ms", _, Some(v)) => {
                self.ch_beacon_timeout_ms = v;
                true
            }
            ("neighbor_timeout_ms", _, Some(v)) => {
                self.neighbor_timeout_ms = v;
                true
            }
            ("trust_floor", Some(v), _) => {
                self.trust_floor = v;
                true
            }
            ("link_quality_floor", Some(v), _) => {
                self.link_quality_floor = v;
                true
            }
            ("battery_low_threshold", Some(v), _) => {
                self.battery_low_threshold = v;
                true
            }
            ("cluster_radius_rssi_dbm", Some(v), _) => {
                self.cluster_radius_rssi_dbm = v;
                true
            }
            ("beacon_interval_ms", _, Some(v)) => {
                self.beacon_interval_ms = v as u32;
                true
            }
            ("beacon_offset_ms", _, Some(v)) => {
                self.beacon_offset_ms = v as u32;
                true
            }
            _ => {
                log::warn!("CONFIG: unrecognized or unparseable key={key} value={value}");
                false
            }
        }
    }

    /// `SET_WEIGHTS b u t l` administrative command.
    pub fn set_weights(&mut self, battery: f64, uptime: f64, trust: f64, link_quality: f64) {
        self.weights = Weights {
            battery,
            uptime,
            trust,
            link_quality,
        };
        self.weights.renormalize(self.stellar.w_min);
    }

    /// Derive the beacon advertising offset from `addr[5]` when the
    /// persisted offset is 0: `addr[5]*10 mod 1000`.
    pub fn effective_beacon_offset_ms(&self, addr_tail_byte: u8) -> u32 {
        if self.beacon_offset_ms != 0 {
            self.beacon_offset_ms
        } else {
            (addr_tail_byte as u32 * 10) % 1000
        }
    }
}

fn get_f64(store: &dyn PersistenceStore, key: &str) -> Option<f64> {
    let bytes = store.get(key)?;
    std::str::from_utf8(&bytes).ok()?.trim().parse::<f64>().ok()
}

fn get_u64(store: &dyn PersistenceStore, key: &str) -> Option<u64> {
    let bytes = store.get(key)?;
    std::str::from_utf8(&bytes).ok()?.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    #[test]
    fn unknown_key_is_ignored() {
        let mut cfg = Config::default();
        let before = cfg;
        assert!(!cfg.apply_override("not_a_real_key", "123"));
        assert_eq!(cfg, before);
    }

    #[test]
    fn malformed_value_keeps_previous() {
        let mut cfg = Config::default();
        let prev = cfg.election_window_ms;
        assert!(!cfg.apply_override("election_window_ms", "not-a-number"));
        assert_eq!(cfg.election_window_ms, prev);
    }

    #[test]
    fn weights_renormalize_to_simplex() {
        let mut cfg = Config::default();
        cfg.set_weights(10.0, 0.0, 0.0, 0.0);
        let sum: f64 = cfg.weights.as_array().iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        for w in cfg.weights.as_array() {
            assert!(w >= cfg.stellar.w_min - 1e-12);
        }
    }

    #[test]
    fn store_overrides_defaults() {
        let store = MemoryStore::new();
        store.put("stellar_enabled", b"1").unwrap();
        store.put("trust_floor", b"0.6").unwrap();
        let cfg = Config::from_store(&store);
        assert!(cfg.stellar_enabled);
        assert!((cfg.trust_floor - 0.6).abs() < 1e-9);
    }

    #[test]
    fn beacon_offset_auto_derived_when_zero() {
        let cfg = Config::default();
        assert_eq!(cfg.effective_beacon_offset_ms(7), 70);
        assert_eq!(cfg.effective_beacon_offset_ms(150), (150u32 * 10) % 1000);
    }
}
