//! C6: State Machine.
//!
//! Role transitions, re-election triggers, and LED hysteresis. The
//! underlying state machine transitions immediately on every trigger;
//! the LED/visual channel is a separate debounced projection of it — the
//! underlying state machine itself is never debounced.

use crate::config::Config;
use crate::election::ChReelectionTrigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Init,
    Discover,
    Candidate,
    Ch,
    Member,
    Sleep,
}

/// Visual/LED projection of [`Role`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visual {
    Searching,
    Member,
    Ch,
    Sleep,
}

fn visual_for(role: Role) -> Visual {
    match role {
        Role::Init | Role::Discover | Role::Candidate => Visual::Searching,
        Role::Member => Visual::Member,
        Role::Ch => Visual::Ch,
        Role::Sleep => Visual::Sleep,
    }
}

/// Outcome of `election.run()` as consumed by the `CANDIDATE` state
/// (self, other non-zero, zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    Self_,
    Other(u32),
    None,
}

pub struct StateMachine {
    role: Role,
    entered_at_ms: u64,
    discover_ch_seen_at_ms: Option<u64>,
    visual: Visual,
    visual_candidate: Option<(Visual, u64)>,
}

impl StateMachine {
    pub fn new(now_ms: u64) -> Self {
        Self {
            role: Role::Init,
            entered_at_ms: now_ms,
            discover_ch_seen_at_ms: None,
            visual: Visual::Searching,
            visual_candidate: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn visual(&self) -> Visual {
        self.visual
    }

    fn enter(&mut self, role: Role, now_ms: u64) {
        if self.role != role {
            log::info!("state machine: {:?} -> {:?}", self.role, role);
        }
        self.role = role;
        self.entered_at_ms = now_ms;
        if role != Role::Discover {
            self.discover_ch_seen_at_ms = None;
        }
        self.update_visual(now_ms);
    }

    /// Debounced LED projection: once `MEMBER`, brief reversions to a
    /// searching role are suppressed unless they persist for
    /// `LED_HYSTERESIS_MS`.
    fn update_visual(&mut self, now_ms: u64) {
        let target = visual_for(self.role);
        if target == self.visual {
            self.visual_candidate = None;
            return;
        }
        if self.visual == Visual::Member && target == Visual::Searching {
            match self.visual_candidate {
                Some((candidate, since)) if candidate == target => {
                    if now_ms.saturating_sub(since) >= crate::config::defaults::LED_HYSTERESIS_MS {
                        self.visual = target;
                        self.visual_candidate = None;
                    }
                }
                _ => {
                    self.visual_candidate = Some((target, now_ms));
                }
            }
        } else {
            self.visual = target;
            self.visual_candidate = None;
        }
    }

    /// One state-machine tick. `has_valid_ch`, `ch_trigger` and
    /// `member_reelection_needed` are evaluated by the caller against the
    /// current neighbor table and metrics snapshot; `election_outcome` is
    /// only consulted while in `CANDIDATE`.
    #[allow(clippy::too_many_arguments)]
    pub fn tick(
        &mut self,
        now_ms: u64,
        self_node_id: u32,
        has_valid_ch: bool,
        battery_critical: bool,
        ch_trigger: Option<ChReelectionTrigger>,
        member_reelection_needed: bool,
        election_outcome: Option<ElectionOutcome>,
        cfg: &Config,
    ) {
        use crate::config::defaults::*;

        if battery_critical && self.role != Role::Sleep {
            self.enter(Role::Sleep, now_ms);
            return;
        }

        let elapsed = now_ms.saturating_sub(self.entered_at_ms);

        match self.role {
            Role::Sleep => {
                if !battery_critical {
                    self.enter(Role::Init, now_ms);
                }
            }
            Role::Init => {
                if elapsed >= INIT_SETTLE_MS {
                    self.enter(Role::Discover, now_ms);
                }
            }
            Role::Discover => {
                if has_valid_ch {
                    self.discover_ch_seen_at_ms.get_or_insert(now_ms);
                }
                let ch_seen_long_enough = self
                    .discover_ch_seen_at_ms
                    .map(|t| now_ms.saturating_sub(t) >= 0 && elapsed >= DISCOVER_MIN_MS)
                    .unwrap_or(false);
                if has_valid_ch && ch_seen_long_enough {
                    self.enter(Role::Member, now_ms);
                } else if elapsed >= DISCOVER_DEADLINE_MS {
                    if has_valid_ch {
                        self.enter(Role::Member, now_ms);
                    } else {
                        self.enter(Role::Candidate, now_ms);
                    }
                }
            }
            Role::Candidate => {
                if elapsed >= cfg.election_window_ms {
                    match election_outcome.unwrap_or(ElectionOutcome::None) {
                        ElectionOutcome::Self_ => self.enter(Role::Ch, now_ms),
                        ElectionOutcome::Other(id) if id == self_node_id => self.enter(Role::Ch, now_ms),
                        ElectionOutcome::Other(_) => self.enter(Role::Member, now_ms),
                        ElectionOutcome::None => self.enter(Role::Discover, now_ms),
                    }
                }
            }
            Role::Ch => match ch_trigger {
                Some(ChReelectionTrigger::Yield(_)) => self.enter(Role::Member, now_ms),
                Some(ChReelectionTrigger::SelfDegraded) => self.enter(Role::Candidate, now_ms),
                None => {}
            },
            Role::Member => {
                if member_reelection_needed {
                    self.enter(Role::Candidate, now_ms);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_settles_into_discover() {
        let mut sm = StateMachine::new(0);
        sm.tick(0, 1, false, false, None, false, None, &Config::default());
        assert_eq!(sm.role(), Role::Init);
        sm.tick(2_001, 1, false, false, None, false, None, &Config::default());
        assert_eq!(sm.role(), Role::Discover);
    }

    #[test]
    fn discover_goes_to_candidate_at_deadline_with_no_ch() {
        let mut sm = StateMachine::new(0);
        sm.tick(2_001, 1, false, false, None, false, None, &Config::default());
        assert_eq!(sm.role(), Role::Discover);
        sm.tick(2_001 + 5_001, 1, false, false, None, false, None, &Config::default());
        assert_eq!(sm.role(), Role::Candidate);
    }

    #[test]
    fn discover_goes_to_member_when_ch_present() {
        let mut sm = StateMachine::new(0);
        sm.tick(2_001, 1, true, false, None, false, None, &Config::default());
        sm.tick(2_001 + 2_001, 1, true, false, None, false, None, &Config::default());
        assert_eq!(sm.role(), Role::Member);
    }

    #[test]
    fn candidate_becomes_ch_on_self_win() {
        let cfg = Config::default();
        let mut sm = StateMachine::new(0);
        sm.tick(2_001, 1, false, false, None, false, None, &cfg);
        sm.tick(2_001 + 5_001, 1, false, false, None, false, None, &cfg);
        assert_eq!(sm.role(), Role::Candidate);
        sm.tick(2_001 + 5_001 + cfg.election_window_ms + 1, 1, false, false, None, false, Some(ElectionOutcome::Self_), &cfg);
        assert_eq!(sm.role(), Role::Ch);
    }

    #[test]
    fn ch_yields_to_member_on_conflict() {
        let cfg = Config::default();
        let mut sm = StateMachine::new(0);
        sm.tick(2_001, 1, false, false, None, false, None, &cfg);
        sm.tick(2_001 + 5_001, 1, false, false, None, false, None, &cfg);
        sm.tick(2_001 + 5_001 + cfg.election_window_ms + 1, 1, false, false, None, false, Some(ElectionOutcome::Self_), &cfg);
        assert_eq!(sm.role(), Role::Ch);
        sm.tick(99_999, 1, true, false, Some(ChReelectionTrigger::Yield(2)), false, None, &cfg);
        assert_eq!(sm.role(), Role::Member);
    }

    #[test]
    fn ch_self_degrades_without_conflict_goes_to_candidate() {
        let cfg = Config::default();
        let mut sm = StateMachine::new(0);
        sm.tick(2_001, 1, false, false, None, false, None, &cfg);
        sm.tick(2_001 + 5_001, 1, false, false, None, false, None, &cfg);
        sm.tick(2_001 + 5_001 + cfg.election_window_ms + 1, 1, false, false, None, false, Some(ElectionOutcome::Self_), &cfg);
        assert_eq!(sm.role(), Role::Ch);
        // Self-degradation with no conflicting neighbor must stabilize
        // through CANDIDATE, not jump straight to MEMBER.
        sm.tick(99_999, 1, false, false, Some(ChReelectionTrigger::SelfDegraded), false, None, &cfg);
        assert_eq!(sm.role(), Role::Candidate);
    }

    #[test]
    fn battery_critical_forces_sleep_from_any_role() {
        let mut sm = StateMachine::new(0);
        sm.tick(100_000, 1, false, true, None, false, None, &Config::default());
        assert_eq!(sm.role(), Role::Sleep);
        sm.tick(100_100, 1, false, false, None, false, None, &Config::default());
        assert_eq!(sm.role(), Role::Init);
    }

    #[test]
    fn led_hysteresis_suppresses_brief_member_to_searching_flicker() {
        let mut sm = StateMachine::new(0);
        sm.tick(2_001, 1, true, false, None, false, None, &Config::default());
        sm.tick(2_001 + 2_001, 1, true, false, None, false, None, &Config::default());
        assert_eq!(sm.role(), Role::Member);
        assert_eq!(sm.visual(), Visual::Member);

        // brief loss of CH -> Candidate, but visual stays Member under hysteresis
        sm.tick(5_000, 1, false, false, None, true, None, &Config::default());
        assert_eq!(sm.role(), Role::Candidate);
        assert_eq!(sm.visual(), Visual::Member);

        // still within 60s window
        sm.tick(5_000 + 30_000, 1, false, false, None, false, Some(ElectionOutcome::None), &Config::default());
        assert_eq!(sm.visual(), Visual::Member);
    }
}
