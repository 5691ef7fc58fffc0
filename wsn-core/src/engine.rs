//! Engine wiring: replaces the reference firmware's module-level
//! statics and duplicate modules with a single value owning its state,
//! instantiated once at startup.
//!
//! `Engine<R, P, C>` is parameterized over the three external
//! collaborators: the radio driver, the persistence store, and the
//! clock. It never links against a concrete radio or flash stack —
//! `wsn-node` and `wsn-linux` each supply their own.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::auth::Authenticator;
use crate::beacon;
use crate::clock::Clock;
use crate::config::defaults::{REPLAY_WINDOW_MS, SCHEDULE_PERIOD_MS, UPTIME_PERSIST_INTERVAL_MS};
use crate::config::Config;
use crate::election;
use crate::error::{EngineError, EngineResult};
use crate::metrics::MetricsEngine;
use crate::neighbor::NeighborTable;
use crate::persistence::{self, PersistenceStore};
use crate::radio::RadioDriver;
use crate::scheduler::{self, Schedule};
use crate::state_machine::{ElectionOutcome, Role, StateMachine, Visual};

/// Derive the 32-bit `node_id` from a 48-bit hardware address: the
/// low-order 32 bits.
pub fn derive_node_id(addr: [u8; 6]) -> u32 {
    u32::from_be_bytes([addr[2], addr[3], addr[4], addr[5]])
}

pub struct Engine<R: RadioDriver, P: PersistenceStore, C: Clock> {
    node_id: u32,
    addr: [u8; 6],
    cluster_key: Vec<u8>,
    clock: C,
    persistence: P,
    radio: R,
    authenticator: Authenticator,
    metrics: MetricsEngine,
    neighbors: NeighborTable,
    state_machine: Mutex<StateMachine>,
    config: Mutex<Config>,
    seq_num: AtomicU8,
    last_beacon_ms: AtomicU64,
    last_schedule_broadcast_ms: AtomicU64,
    last_uptime_persist_ms: AtomicU64,
    uptime_base_ms: u64,
    boot_uptime_seconds: u64,
    battery_critical: AtomicBool,
    cached_schedule: Mutex<Option<Schedule>>,
}

impl<R: RadioDriver, P: PersistenceStore, C: Clock> Engine<R, P, C> {
    /// Wire up a new engine. Fails only on the two conditions treated as
    /// fatal: the radio or persistence layer refusing to start.
    pub fn new(radio: R, persistence: P, clock: C, addr: [u8; 6], cluster_key: impl Into<Vec<u8>>) -> EngineResult<Self> {
        let node_id = derive_node_id(addr);
        if node_id == 0 || node_id == 0xFFFF_FFFF {
            return Err(EngineError::InvalidNodeId(node_id));
        }

        let config = Config::from_store(&persistence);
        let uptime_seconds = persistence::load_uptime(&persistence);
        let metrics = MetricsEngine::new(&config);
        metrics.set_uptime_seconds(uptime_seconds);

        radio.scan_start().map_err(EngineError::RadioInit)?;
        radio.advertise_start().map_err(EngineError::RadioInit)?;

        let now_ms = clock.now_ms();
        let cluster_key = cluster_key.into();

        Ok(Self {
            node_id,
            addr,
            authenticator: Authenticator::new(cluster_key.clone(), REPLAY_WINDOW_MS),
            cluster_key,
            clock,
            persistence,
            radio,
            metrics,
            neighbors: NeighborTable::new(),
            state_machine: Mutex::new(StateMachine::new(now_ms)),
            config: Mutex::new(config),
            seq_num: AtomicU8::new(0),
            last_beacon_ms: AtomicU64::new(0),
            last_schedule_broadcast_ms: AtomicU64::new(0),
            last_uptime_persist_ms: AtomicU64::new(now_ms),
            uptime_base_ms: now_ms,
            boot_uptime_seconds: uptime_seconds,
            battery_critical: AtomicBool::new(false),
            cached_schedule: Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn role(&self) -> Role {
        self.state_machine.lock().unwrap().role()
    }

    pub fn visual(&self) -> Visual {
        self.state_machine.lock().unwrap().visual()
    }

    pub fn metrics_snapshot(&self) -> crate::metrics::NodeMetrics {
        self.metrics.get_current()
    }

    /// Push a fresh battery reading. `None` represents "on USB/external
    /// power" (interpreted as `1.0`).
    pub fn set_battery(&self, fraction: Option<f64>) {
        self.metrics.set_battery(fraction.unwrap_or(1.0));
    }

    /// Injected by the caller's power-management collaborator (out of
    /// scope for this crate); forces a transition to `SLEEP` on the next
    /// tick.
    pub fn set_battery_critical(&self, critical: bool) {
        self.battery_critical.store(critical, Ordering::Relaxed);
    }

    pub fn update_reputation(&self, external_reputation: f64) {
        self.metrics.update_reputation(external_reputation);
    }

    /// `SET_WEIGHTS b u t l` / `CONFIG key=value` administrative surface.
    /// Returns `"OK"` or `"ERROR"` as the console response.
    pub fn handle_admin_command(&self, line: &str) -> &'static str {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("SET_WEIGHTS ") {
            let parts: Vec<f64> = rest.split_whitespace().filter_map(|p| p.parse::<f64>().ok()).collect();
            if parts.len() != 4 {
                return "ERROR";
            }
            let mut cfg = self.config.lock().unwrap();
            cfg.set_weights(parts[0], parts[1], parts[2], parts[3]);
            self.metrics.set_weights(cfg.weights.as_array());
            "OK"
        } else if let Some(rest) = line.strip_prefix("CONFIG ") {
            match rest.split_once('=') {
                Some((key, value)) => {
                    let mut cfg = self.config.lock().unwrap();
                    if cfg.apply_override(key.trim(), value.trim()) {
                        if let Err(e) = self.persistence.put(key.trim(), value.trim().as_bytes()) {
                            log::warn!("CONFIG: failed to persist {key}: {e}");
                        }
                        "OK"
                    } else {
                        "ERROR"
                    }
                }
                None => "ERROR",
            }
        } else {
            "ERROR"
        }
    }

    /// One full engine tick: drains radio ingress, (re)broadcasts the
    /// beacon, runs the state machine and election, performs CH/member
    /// scheduling duties, and flushes uptime periodically. Callers
    /// drive this from their own task loop — a single call is cheap
    /// enough to run at sub-second cadence.
    pub fn tick(&self) {
        let now_us = self.clock.now_us();
        let now_ms = now_us / 1_000;

        self.update_uptime(now_ms);
        self.ingest_radio(now_ms);
        self.maybe_send_beacon(now_ms);
        self.run_election_and_transition(now_ms);
        self.ch_duties(now_us, now_ms);
        self.member_duties(now_us, now_ms);
        self.persist_uptime_if_due(now_ms);
    }

    fn update_uptime(&self, now_ms: u64) {
        let elapsed_s = now_ms.saturating_sub(self.uptime_base_ms) / 1_000;
        self.metrics.set_uptime_seconds(self.boot_uptime_seconds + elapsed_s);
    }

    fn ingest_radio(&self, now_ms: u64) {
        for ingress in self.radio.poll_beacons() {
            self.handle_beacon(&ingress.raw_adv_bytes, ingress.rssi_dbm, ingress.src_addr, now_ms);
        }
        for ingress in self.radio.poll_unicast() {
            self.handle_unicast(&ingress.bytes, ingress.src_addr, now_ms);
        }
    }

    fn handle_beacon(&self, bytes: &[u8], rssi_dbm: i8, src_addr: [u8; 6], now_ms: u64) {
        match beacon::decode_and_validate(bytes, self.node_id, &self.cluster_key) {
            Some(b) => {
                self.metrics.record_hmac_success(true);
                let outcome = self.neighbors.update(
                    b.node_id,
                    src_addr,
                    rssi_dbm as f64,
                    b.score as f64,
                    b.battery,
                    0, // uptime is not carried on the wire
                    b.trust,
                    b.link_quality,
                    b.is_ch,
                    b.seq_num,
                    now_ms,
                );
                if outcome.admitted && !outcome.replay {
                    self.metrics.record_ble_reception(1, outcome.missed);
                }
            }
            None => {
                self.metrics.record_hmac_success(false);
            }
        }
    }

    fn handle_unicast(&self, bytes: &[u8], src_addr: [u8; 6], now_ms: u64) {
        let Some(schedule) = scheduler::decode_schedule(bytes, now_ms) else {
            return;
        };
        let cfg = *self.config.lock().unwrap();
        if let Some(ch_mac) = self.neighbors.get_ch_mac(now_ms, cfg.trust_floor, cfg.ch_beacon_timeout_ms) {
            if ch_mac == src_addr {
                *self.cached_schedule.lock().unwrap() = Some(schedule);
            }
        }
    }

    fn maybe_send_beacon(&self, now_ms: u64) {
        let cfg = *self.config.lock().unwrap();
        let interval = cfg.beacon_interval_ms as u64;
        let offset = cfg.effective_beacon_offset_ms(self.addr[5]) as u64;
        let last = self.last_beacon_ms.load(Ordering::Relaxed);
        let due = if last == 0 { now_ms >= offset } else { now_ms.saturating_sub(last) >= interval };
        if !due {
            return;
        }

        let m = self.metrics.get_current();
        let seq = self.seq_num.fetch_add(1, Ordering::Relaxed);
        let is_ch = self.role() == Role::Ch;
        let mac_tail = [self.addr[4], self.addr[5]];
        let bytes = beacon::encode(
            self.node_id,
            m.composite_score as f32,
            m.battery,
            m.trust,
            m.link_quality,
            mac_tail,
            is_ch,
            seq,
            &self.cluster_key,
        );
        if let Err(e) = self.radio.advertise_set(&bytes) {
            log::warn!("beacon: advertise_set failed: {e}");
        }
        self.last_beacon_ms.store(now_ms, Ordering::Relaxed);
    }

    fn run_election_and_transition(&self, now_ms: u64) {
        let cfg = *self.config.lock().unwrap();
        self.neighbors.cleanup_stale(now_ms, cfg.neighbor_timeout_ms);
        let m = self.metrics.get_current();
        let has_valid_ch = self.neighbors.get_current_ch(now_ms, cfg.trust_floor, cfg.ch_beacon_timeout_ms) != 0;
        let role = self.role();

        let ch_trigger = match role {
            Role::Ch => election::ch_reelection_needed(self.node_id, &m, &self.neighbors, now_ms, &cfg),
            _ => None,
        };
        let member_reelection_needed = match role {
            Role::Member => election::member_reelection_needed(&self.neighbors, now_ms, &cfg),
            _ => false,
        };

        let election_outcome = if role == Role::Candidate {
            let neighbors = self.neighbors.get_all(usize::MAX);
            let weights = self.metrics.weights();
            let winner = election::run(self.node_id, &m, &neighbors, &cfg, &weights);
            Some(if winner == 0 {
                ElectionOutcome::None
            } else if winner == self.node_id {
                ElectionOutcome::Self_
            } else {
                ElectionOutcome::Other(winner)
            })
        } else {
            None
        };

        let battery_critical = self.battery_critical.load(Ordering::Relaxed);
        let mut sm = self.state_machine.lock().unwrap();
        let prev_role = sm.role();
        sm.tick(now_ms, self.node_id, has_valid_ch, battery_critical, ch_trigger, member_reelection_needed, election_outcome, &cfg);
        let new_role = sm.role();
        drop(sm);

        if prev_role != new_role {
            match new_role {
                Role::Sleep => {
                    let _ = self.radio.advertise_stop();
                    let _ = self.radio.scan_stop();
                }
                Role::Init => {
                    let _ = self.radio.scan_start();
                    let _ = self.radio.advertise_start();
                }
                _ => {}
            }
        }
    }

    fn ch_duties(&self, now_us: u64, now_ms: u64) {
        if self.role() != Role::Ch {
            return;
        }
        let last = self.last_schedule_broadcast_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < SCHEDULE_PERIOD_MS {
            return;
        }
        let neighbors = self.neighbors.get_all(usize::MAX);
        for assignment in scheduler::build_assignments(&neighbors, now_us) {
            if let Err(e) = self.radio.send_unicast(assignment.addr, &assignment.bytes) {
                log::warn!("scheduler: send_unicast to peer failed: {e}");
            }
        }
        self.last_schedule_broadcast_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Decide this tick's member action from the cached schedule. Actual
    /// application payload framing/queuing is the caller's business;
    /// this only tells the caller how much slot time remains to burst
    /// into.
    fn member_duties(&self, now_us: u64, now_ms: u64) -> scheduler::MemberAction {
        if self.role() != Role::Member {
            return scheduler::MemberAction::NoSchedule;
        }
        let cached = self.cached_schedule.lock().unwrap();
        scheduler::member_action(cached.as_ref(), now_us, now_ms)
    }

    fn persist_uptime_if_due(&self, now_ms: u64) {
        let last = self.last_uptime_persist_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < UPTIME_PERSIST_INTERVAL_MS {
            return;
        }
        let uptime = self.metrics.get_current().uptime_seconds;
        persistence::persist_uptime(&self.persistence, uptime);
        self.last_uptime_persist_ms.store(now_ms, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_node_id_takes_low_order_32_bits() {
        let id = derive_node_id([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(id, 0x0304_0506);
    }
}
