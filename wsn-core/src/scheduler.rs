//! C7: Scheduler.
//!
//! CH-side slot assignment and broadcast, plus the member-side slot
//! detection and in-slot burst logic.

use crate::config::defaults::{SCHEDULE_LEAD_US, SLOT_BURST_HEADROOM_MS, SLOT_DURATION_SEC, SLOT_SLEEP_THRESHOLD_MS};
use crate::neighbor::NeighborEntry;

/// Wire layout of a CH-issued schedule frame.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct ScheduleWire {
    epoch_us: u64,
    slot_index: u8,
    slot_duration_seconds: u8,
    magic: u32,
}

/// Sentinel identifying a schedule frame on the wire.
const SCHEDULE_MAGIC: u32 = 0x5C4E_DAC5;

impl ScheduleWire {
    const SIZE: usize = core::mem::size_of::<Self>();

    fn as_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let src = unsafe { core::slice::from_raw_parts((self as *const Self) as *const u8, Self::SIZE) };
        out.copy_from_slice(src);
        out
    }
}

/// A decoded schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    pub epoch_us: u64,
    pub slot_index: u8,
    pub slot_duration_seconds: u8,
    pub received_at_ms: u64,
}

/// Decode a schedule frame received over unicast. Rejects malformed
/// length or a bad magic sentinel.
pub fn decode_schedule(bytes: &[u8], now_ms: u64) -> Option<Schedule> {
    if bytes.len() != ScheduleWire::SIZE {
        return None;
    }
    let wire: ScheduleWire = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const ScheduleWire) };
    if { wire.magic } != SCHEDULE_MAGIC {
        return None;
    }
    Some(Schedule {
        epoch_us: wire.epoch_us,
        slot_index: wire.slot_index,
        slot_duration_seconds: wire.slot_duration_seconds,
        received_at_ms: now_ms,
    })
}

/// One per-member schedule-frame assignment the CH broadcasts.
pub struct Assignment {
    pub addr: [u8; 6],
    pub bytes: [u8; ScheduleWire::SIZE],
}

/// CH side: sort the current neighbor snapshot by priority `P =
/// 100*link_quality + (100 - 100*battery)` descending, and assign slot
/// `i` to the i-th neighbor.
pub fn build_assignments(neighbors: &[NeighborEntry], now_us: u64) -> Vec<Assignment> {
    let mut ordered: Vec<&NeighborEntry> = neighbors.iter().collect();
    ordered.sort_by(|a, b| priority(b).partial_cmp(&priority(a)).unwrap_or(std::cmp::Ordering::Equal));

    let epoch_us = now_us.saturating_add(SCHEDULE_LEAD_US as u64);
    ordered
        .iter()
        .enumerate()
        .map(|(i, n)| {
            let wire = ScheduleWire {
                epoch_us,
                slot_index: i as u8,
                slot_duration_seconds: SLOT_DURATION_SEC,
                magic: SCHEDULE_MAGIC,
            };
            Assignment {
                addr: n.addr,
                bytes: wire.as_bytes(),
            }
        })
        .collect()
}

fn priority(n: &NeighborEntry) -> f64 {
    100.0 * n.link_quality + (100.0 - 100.0 * n.battery)
}

/// A schedule older than `SLOT_DURATION_SEC * 10` is stale.
pub fn is_stale(schedule: &Schedule, now_ms: u64) -> bool {
    let max_age_ms = schedule.slot_duration_seconds as u64 * 10 * 1_000;
    now_ms.saturating_sub(schedule.received_at_ms) > max_age_ms
}

/// What the member should do this tick, given the cached schedule (or
/// lack of one) and the current monotonic time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberAction {
    /// In slot: transmit, then burst backlog leaving `headroom_ms`.
    Burst { headroom_ms: u64 },
    /// Out of slot, next one is far away: sleep until it begins.
    SleepUntilSlot { slot_start_ms: u64 },
    /// Out of slot, next one is imminent: stay awake and idle.
    Idle,
    /// No usable schedule: fall back to once-per-second transmission.
    NoSchedule,
}

/// Decide the member's action for `now_us` against `schedule`, or
/// `None` if there is no schedule or it is stale.
pub fn member_action(schedule: Option<&Schedule>, now_us: u64, now_ms: u64) -> MemberAction {
    let schedule = match schedule {
        Some(s) if !is_stale(s, now_ms) => s,
        _ => return MemberAction::NoSchedule,
    };

    let slot_dur_us = schedule.slot_duration_seconds as u64 * 1_000_000;
    let slot_start_us = schedule.epoch_us + (schedule.slot_index as u64) * slot_dur_us;
    let slot_end_us = slot_start_us + slot_dur_us;

    if now_us >= slot_start_us && now_us < slot_end_us {
        let remaining_ms = (slot_end_us - now_us) / 1_000;
        let headroom_ms = remaining_ms.min(SLOT_BURST_HEADROOM_MS);
        return MemberAction::Burst { headroom_ms };
    }

    if now_us < slot_start_us {
        let until_ms = (slot_start_us - now_us) / 1_000;
        if until_ms as i64 > SLOT_SLEEP_THRESHOLD_MS {
            return MemberAction::SleepUntilSlot {
                slot_start_ms: slot_start_us / 1_000,
            };
        }
        return MemberAction::Idle;
    }

    // Past this slot's window within the same schedule: wait for the
    // next period (caller will have refreshed the schedule by then, or
    // this one will go stale).
    MemberAction::Idle
}

/// Given `slot_remaining_ms` and a per-record size, how many queued
/// records of `record_len` bytes can be burst out while leaving at
/// least `SLOT_BURST_HEADROOM_MS` of headroom, assuming `us_per_byte`
/// transmission cost.
pub fn burst_capacity(slot_remaining_ms: u64, record_len_us: u64, queued: usize) -> usize {
    if slot_remaining_ms <= SLOT_BURST_HEADROOM_MS {
        return 0;
    }
    let usable_us = (slot_remaining_ms - SLOT_BURST_HEADROOM_MS) * 1_000;
    if record_len_us == 0 {
        return queued;
    }
    ((usable_us / record_len_us) as usize).min(queued)
}
