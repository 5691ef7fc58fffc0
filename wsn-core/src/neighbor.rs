//! C3: Neighbor Table.
//!
//! A fixed-capacity set keyed by `node_id`, holding RSSI/PER-derived link
//! stats and CH-liveness bookkeeping for every peer this node currently
//! hears. Two defects in the reference implementation are deliberately
//! avoided: a second, unsynchronized copy of this table, and getters
//! that hand back a pointer into storage still covered by the lock. This
//! implementation has exactly one table, serialized on a single mutex,
//! and every getter returns by value.

use crate::config::defaults::MAX_NEIGHBORS;

/// One tracked peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborEntry {
    pub node_id: u32,
    pub addr: [u8; 6],
    pub last_rssi: f64,
    pub rssi_ewma: f64,
    pub last_seq_num: u8,
    pub score: f64,
    pub battery: f64,
    pub uptime_seconds: u64,
    pub trust: f64,
    pub link_quality: f64,
    pub is_ch: bool,
    pub ch_announce_timestamp_ms: u64,
    pub last_seen_ms: u64,
    pub verified: bool,
}

impl NeighborEntry {
    /// A neighbor is "a valid CH" only under this conjunction.
    pub fn is_valid_ch(&self, now_ms: u64, trust_floor: f64, ch_beacon_timeout_ms: u64) -> bool {
        self.is_ch
            && self.verified
            && self.trust >= trust_floor
            && now_ms.saturating_sub(self.ch_announce_timestamp_ms) < ch_beacon_timeout_ms
    }
}

const RSSI_EWMA_ALPHA: f64 = 0.2;
const MAX_PLAUSIBLE_MISSED: u8 = 20;

pub struct NeighborTable {
    entries: std::sync::Mutex<heapless::Vec<NeighborEntry, MAX_NEIGHBORS>>,
}

/// Outcome of [`NeighborTable::update`], used by the caller to feed the
/// metrics engine via `metrics.record_ble_reception(1, missed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceptionOutcome {
    pub missed: u32,
    pub is_new: bool,
    /// `false` when the table was full and the peer was silently dropped.
    pub admitted: bool,
    /// `true` when `seq_num` exactly repeats the last-seen sequence
    /// number for this peer — treated as a replay and not applied: a
    /// replayed beacon must not refresh `last_seen_ms` or otherwise
    /// perturb neighbor state.
    pub replay: bool,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self {
            entries: std::sync::Mutex::new(heapless::Vec::new()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        node_id: u32,
        addr: [u8; 6],
        rssi_dbm: f64,
        score: f64,
        battery: f64,
        uptime_seconds: u64,
        trust: f64,
        link_quality: f64,
        is_ch: bool,
        seq_num: u8,
        now_ms: u64,
    ) -> ReceptionOutcome {
        let mut entries = self.entries.lock().unwrap();

        if let Some(e) = entries.iter_mut().find(|e| e.node_id == node_id) {
            if seq_num == e.last_seq_num {
                return ReceptionOutcome {
                    missed: 0,
                    is_new: false,
                    admitted: true,
                    replay: true,
                };
            }

            let missed_raw = (seq_num.wrapping_sub(e.last_seq_num)) as i32 - 1;
            let missed = if missed_raw < 0 || missed_raw as u8 > MAX_PLAUSIBLE_MISSED {
                0
            } else {
                missed_raw as u32
            };

            e.last_rssi = rssi_dbm;
            e.rssi_ewma = RSSI_EWMA_ALPHA * rssi_dbm + (1.0 - RSSI_EWMA_ALPHA) * e.rssi_ewma;
            e.last_seq_num = seq_num;
            e.score = score;
            e.battery = battery;
            e.uptime_seconds = uptime_seconds;
            e.trust = trust;
            e.link_quality = link_quality;
            e.is_ch = is_ch;
            if is_ch {
                e.ch_announce_timestamp_ms = now_ms;
            }
            e.last_seen_ms = now_ms;
            e.verified = true;

            return ReceptionOutcome {
                missed,
                is_new: false,
                admitted: true,
                replay: false,
            };
        }

        if entries.is_full() {
            log::warn!("neighbor table full ({MAX_NEIGHBORS}); dropping node_id={node_id:#x}");
            return ReceptionOutcome {
                missed: 0,
                is_new: false,
                admitted: false,
                replay: false,
            };
        }

        let entry = NeighborEntry {
            node_id,
            addr,
            last_rssi: rssi_dbm,
            rssi_ewma: rssi_dbm,
            last_seq_num: seq_num,
            score,
            battery,
            uptime_seconds,
            trust,
            link_quality,
            is_ch,
            ch_announce_timestamp_ms: if is_ch { now_ms } else { 0 },
            last_seen_ms: now_ms,
            verified: true,
        };
        entries.push(entry).expect("capacity checked above");

        ReceptionOutcome {
            missed: 0,
            is_new: true,
            admitted: true,
            replay: false,
        }
    }

    /// Returns the `node_id` of the highest-scoring valid CH, or `0` if
    /// none qualifies.
    pub fn get_current_ch(&self, now_ms: u64, trust_floor: f64, ch_beacon_timeout_ms: u64) -> u32 {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|e| e.is_valid_ch(now_ms, trust_floor, ch_beacon_timeout_ms))
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
            .map(|e| e.node_id)
            .unwrap_or(0)
    }

    /// Hardware address of any valid CH, if one exists.
    pub fn get_ch_mac(&self, now_ms: u64, trust_floor: f64, ch_beacon_timeout_ms: u64) -> Option<[u8; 6]> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .find(|e| e.is_valid_ch(now_ms, trust_floor, ch_beacon_timeout_ms))
            .map(|e| e.addr)
    }

    /// Evict entries whose `last_seen_ms` is older than `timeout_ms`.
    /// Returns the number of entries evicted.
    pub fn cleanup_stale(&self, now_ms: u64, timeout_ms: u64) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        let mut kept: heapless::Vec<NeighborEntry, MAX_NEIGHBORS> = heapless::Vec::new();
        for e in entries.iter() {
            if now_ms.saturating_sub(e.last_seen_ms) < timeout_ms {
                let _ = kept.push(*e);
            }
        }
        *entries = kept;
        before - entries.len()
    }

    /// Copy out up to `max` entries.
    pub fn get_all(&self, max: usize) -> Vec<NeighborEntry> {
        let entries = self.entries.lock().unwrap();
        entries.iter().take(max).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `trust <- 0.9*trust + 0.1*(success?1:0)`; `verified` is set once
    /// `trust > 0.3`.
    pub fn update_trust(&self, node_id: u32, success: bool) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(e) = entries.iter_mut().find(|e| e.node_id == node_id) {
            let sample = if success { 1.0 } else { 0.0 };
            e.trust = 0.9 * e.trust + 0.1 * sample;
            if e.trust > 0.3 {
                e.verified = true;
            }
        }
    }
}

impl Default for NeighborTable {
    fn default() -> Self {
        Self::new()
    }
}
