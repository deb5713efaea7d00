//! Global stage machine: iteration and stage transitions, cross-host
//! barrier, iteration sequencing. Grounded on
//! `original_source/controller/main.cpp` (`stage_transition`,
//! `try_buildup`, `allow_connect`) and `const.hpp` for the timing
//! constants.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

pub const BUILDUP_TRY_INTERVAL_NS: i64 = 1_000_000_000;
pub const CONVERGE_TIMEOUT_NS: i64 = 3_500_000_000;
pub const KEEPBUSY_INTERVAL_NS: i64 = 100_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Stage {
    Buildup = 1,
    Restore = 2,
    Converge = 3,
    Teardown = 4,
    End = 5,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Buildup => "STAGE_BUILDUP",
            Stage::Restore => "STAGE_RESTORE",
            Stage::Converge => "STAGE_CONVERGE",
            Stage::Teardown => "STAGE_TEARDOWN",
            Stage::End => "STAGE_END",
        }
    }

    fn from_i32(v: i32) -> Stage {
        match v {
            1 => Stage::Buildup,
            2 => Stage::Restore,
            3 => Stage::Converge,
            4 => Stage::Teardown,
            _ => Stage::End,
        }
    }
}

/// What the engine should do in response to a stage-machine tick. The
/// machine itself performs no I/O; the caller (the reactor/engine loop)
/// carries these out and reports results back via the `note_*` methods.
#[derive(Debug, Clone)]
pub enum StageAction {
    TryConnect { self_id: i32, peer_id: i32 },
    SendEosToAllPeers { stage: i32 },
    BroadcastKeepBusy,
    /// Emitted once, right as CONVERGE's barrier completes, carrying the
    /// timestamp of the last observed event — the `converge_end_ts.txt`
    /// line is this value, not "now".
    ConvergeEnded { last_event_ns: i64 },
    /// Emitted once per completed iteration: export a route dump tagged
    /// either with the running counter or `"final"` once globally
    /// converged, record the `switch_pods_ts.txt` boundary, then stop
    /// this partition's routers.
    EndIteration { idx: usize, tag: u32, globally_converged: bool },
    StartPartition { idx: usize, restart: bool },
    TransitionedTo(Stage),
    ForceTeardownMaxRuntime,
}

/// Per-iteration topology facts the stage machine needs but does not own:
/// supplied by the engine each tick.
pub struct StageTickInput<'a> {
    pub now_ns: i64,
    pub n_hosts: u32,
    pub cut_nchannel: i64,
    pub partition_target_nchannel: i64,
    pub local_edges_to_try: &'a [(i32, i32)],
    pub max_runtime_ns: Option<i64>,
    pub start_ts_ns: i64,
    pub n_parts: usize,
    /// Process-wide established-channel count, read off `Engine::n_channel`.
    pub current_n_channel: i64,
}

pub struct StageMachine {
    stage: AtomicI32,
    n_ready_host: AtomicU32,
    local_stage_end: std::sync::atomic::AtomicBool,
    last_event_ns: AtomicI64,
    last_keepbusy_ns: AtomicI64,
    last_buildup_try_ns: AtomicI64,
    /// Running export-tag counter, mirroring the original's file-scoped
    /// `static int tag = 1`. Bumped once per completed iteration
    /// regardless of convergence; only consulted for the label when the
    /// iteration did not globally converge.
    export_tag: AtomicU32,
    iteration: Mutex<IterationState>,
}

struct IterationState {
    round: u32,
    idx: usize,
    delta: i32,
    idle_parts: std::collections::HashSet<usize>,
}

impl StageMachine {
    pub fn new(n_parts: usize) -> Self {
        StageMachine {
            stage: AtomicI32::new(Stage::Buildup as i32),
            n_ready_host: AtomicU32::new(0),
            local_stage_end: std::sync::atomic::AtomicBool::new(false),
            last_event_ns: AtomicI64::new(0),
            last_keepbusy_ns: AtomicI64::new(0),
            last_buildup_try_ns: AtomicI64::new(i64::MIN / 2),
            export_tag: AtomicU32::new(1),
            iteration: Mutex::new(IterationState {
                round: 0,
                idx: 0,
                delta: 1,
                idle_parts: std::collections::HashSet::new(),
            }),
        }
    }

    pub fn stage(&self) -> Stage {
        Stage::from_i32(self.stage.load(Ordering::SeqCst))
    }

    fn set_stage(&self, s: Stage) {
        self.stage.store(s as i32, Ordering::SeqCst);
    }

    pub fn iteration_idx(&self) -> usize {
        self.iteration.lock().unwrap().idx
    }

    pub fn iteration_round(&self) -> u32 {
        self.iteration.lock().unwrap().round
    }

    /// Any new message/PAYLOAD event resets the quiescence clock.
    pub fn record_event(&self, now_ns: i64) {
        self.last_event_ns.store(now_ns, Ordering::SeqCst);
    }

    pub fn note_peer_end_of_stage(&self) {
        self.n_ready_host.fetch_add(1, Ordering::SeqCst);
    }

    fn declare_local_end_of_stage(&self) -> bool {
        // Returns true only the first time this is called since the last
        // reset, so the caller sends exactly one EOS per stage.
        self.local_stage_end
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn reset_barrier(&self) {
        self.local_stage_end.store(false, Ordering::SeqCst);
        self.n_ready_host.store(0, Ordering::SeqCst);
    }

    fn barrier_satisfied(&self, n_hosts: u32) -> bool {
        self.local_stage_end.load(Ordering::SeqCst) && self.n_ready_host.load(Ordering::SeqCst) == n_hosts
    }

    fn globally_converged(&self, n_parts: usize) -> bool {
        self.iteration.lock().unwrap().idle_parts.len() == n_parts
    }

    /// Advances `iteration_idx` with boomerang wrap, skipping indices in
    /// `idle_parts`, and bumps `round`/flips `delta` at each boundary.
    fn advance_iteration_locked(it: &mut IterationState, n_parts: usize) {
        if n_parts == 0 {
            return;
        }
        loop {
            let next = it.idx as i32 + it.delta;
            if next >= n_parts as i32 {
                it.delta = -1;
                it.round += 1;
                it.idx = (n_parts as i32 - 2).max(0) as usize;
            } else if next < 0 {
                it.delta = 1;
                it.round += 1;
                it.idx = (1).min(n_parts - 1);
            } else {
                it.idx = next as usize;
            }
            if !it.idle_parts.contains(&it.idx) {
                break;
            }
        }
    }

    /// Drives one stage-transition tick.
    pub fn tick(&self, input: &StageTickInput, has_new_msg: bool, replay_done: impl Fn(&mut dyn FnMut(usize))) -> Vec<StageAction> {
        let _ = replay_done; // placeholder for future per-node draining hook
        let mut actions = Vec::new();

        if let Some(max_runtime) = input.max_runtime_ns {
            if input.now_ns - input.start_ts_ns > max_runtime && self.stage() != Stage::End {
                self.set_stage(Stage::Teardown);
                actions.push(StageAction::ForceTeardownMaxRuntime);
                actions.push(StageAction::TransitionedTo(Stage::Teardown));
                return actions;
            }
        }

        match self.stage() {
            Stage::Buildup => {
                let last_try = self.last_buildup_try_ns.load(Ordering::SeqCst);
                if input.now_ns - last_try >= BUILDUP_TRY_INTERVAL_NS {
                    self.last_buildup_try_ns.store(input.now_ns, Ordering::SeqCst);
                    for &(self_id, peer_id) in input.local_edges_to_try {
                        actions.push(StageAction::TryConnect { self_id, peer_id });
                    }
                }

                let target = input.partition_target_nchannel + input.cut_nchannel;
                if input.current_n_channel >= target {
                    if self.declare_local_end_of_stage() {
                        actions.push(StageAction::SendEosToAllPeers { stage: Stage::Buildup as i32 });
                    }
                    if self.barrier_satisfied(input.n_hosts) {
                        self.reset_barrier();
                        let next = if self.iteration_round() == 0 { Stage::Converge } else { Stage::Restore };
                        self.set_stage(next);
                        actions.push(StageAction::TransitionedTo(next));
                    }
                }
            }
            Stage::Restore => {
                if input.now_ns - self.last_event_ns.load(Ordering::SeqCst) > CONVERGE_TIMEOUT_NS {
                    if self.declare_local_end_of_stage() {
                        actions.push(StageAction::SendEosToAllPeers { stage: Stage::Restore as i32 });
                    }
                    if self.barrier_satisfied(input.n_hosts) {
                        self.reset_barrier();
                        self.set_stage(Stage::Converge);
                        actions.push(StageAction::TransitionedTo(Stage::Converge));
                    }
                }
            }
            Stage::Converge => {
                let since_event = input.now_ns - self.last_event_ns.load(Ordering::SeqCst);
                let since_keepbusy = input.now_ns - self.last_keepbusy_ns.load(Ordering::SeqCst);
                if since_keepbusy >= KEEPBUSY_INTERVAL_NS && since_event < CONVERGE_TIMEOUT_NS {
                    self.last_keepbusy_ns.store(input.now_ns, Ordering::SeqCst);
                    actions.push(StageAction::BroadcastKeepBusy);
                }
                if since_event > CONVERGE_TIMEOUT_NS {
                    if self.declare_local_end_of_stage() {
                        actions.push(StageAction::SendEosToAllPeers { stage: Stage::Converge as i32 });
                    }
                    if self.barrier_satisfied(input.n_hosts) {
                        self.reset_barrier();
                        let last_event_ns = self.last_event_ns.load(Ordering::SeqCst);
                        let (idx, globally_converged) = {
                            let mut it = self.iteration.lock().unwrap();
                            if has_new_msg {
                                it.idle_parts.clear();
                            } else {
                                it.idle_parts.insert(it.idx);
                            }
                            (it.idx, it.idle_parts.len() == input.n_parts)
                        };
                        let tag = self.export_tag.fetch_add(1, Ordering::SeqCst);
                        self.set_stage(Stage::Teardown);
                        actions.push(StageAction::ConvergeEnded { last_event_ns });
                        actions.push(StageAction::EndIteration { idx, tag, globally_converged });
                        actions.push(StageAction::TransitionedTo(Stage::Teardown));
                    }
                }
            }
            Stage::Teardown => {
                if input.current_n_channel == input.cut_nchannel {
                    if self.declare_local_end_of_stage() {
                        actions.push(StageAction::SendEosToAllPeers { stage: Stage::Teardown as i32 });
                    }
                    if self.barrier_satisfied(input.n_hosts) {
                        self.reset_barrier();
                        if self.globally_converged(input.n_parts) {
                            self.set_stage(Stage::End);
                            actions.push(StageAction::TransitionedTo(Stage::End));
                        } else {
                            let (idx, round) = {
                                let mut it = self.iteration.lock().unwrap();
                                Self::advance_iteration_locked(&mut it, input.n_parts);
                                (it.idx, it.round)
                            };
                            actions.push(StageAction::StartPartition { idx, restart: round >= 1 });
                            self.set_stage(Stage::Buildup);
                            actions.push(StageAction::TransitionedTo(Stage::Buildup));
                        }
                    }
                }
            }
            Stage::End => {}
        }

        actions
    }
}

/// Build-direction rule for which side of an edge initiates the
/// connection; the symmetric (non-cut-boundary) tie-break is `self_id <
/// peer_id` — see the Open Question resolution in DESIGN.md.
pub fn should_initiate(self_id: i32, self_is_cut: bool, peer_id: i32, peer_is_cut: bool, self_seen: bool) -> bool {
    if self_is_cut == peer_is_cut {
        self_id < peer_id
    } else if !self_is_cut && peer_is_cut {
        self_seen
    } else {
        // self is cut, peer is normal: normal endpoint initiates.
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_direction_is_exactly_one_sided() {
        // both normal
        assert!(should_initiate(1, false, 2, false, true));
        assert!(!should_initiate(2, false, 1, false, true));
        // both cut
        assert!(should_initiate(1, true, 2, true, true));
        assert!(!should_initiate(2, true, 1, true, true));
        // normal -> cut, only initiates once seen
        assert!(should_initiate(5, false, 9, true, true));
        assert!(!should_initiate(5, false, 9, true, false));
        assert!(!should_initiate(9, true, 5, false, true));
    }

    #[test]
    fn buildup_transitions_to_converge_on_round_zero() {
        let sm = StageMachine::new(2);
        let input = StageTickInput {
            now_ns: BUILDUP_TRY_INTERVAL_NS,
            n_hosts: 1,
            cut_nchannel: 0,
            partition_target_nchannel: 0,
            local_edges_to_try: &[],
            max_runtime_ns: None,
            start_ts_ns: 0,
            n_parts: 2,
            current_n_channel: 0,
        };
        let actions = sm.tick(&input, false, |_| {});
        assert!(actions.iter().any(|a| matches!(a, StageAction::TransitionedTo(Stage::Converge))));
        assert_eq!(sm.stage(), Stage::Converge);
    }

    #[test]
    fn converge_times_out_after_quiescence() {
        let sm = StageMachine::new(1);
        sm.set_stage(Stage::Converge);
        sm.record_event(0);
        let input = StageTickInput {
            now_ns: CONVERGE_TIMEOUT_NS + 1,
            n_hosts: 1,
            cut_nchannel: 0,
            partition_target_nchannel: 0,
            local_edges_to_try: &[],
            max_runtime_ns: None,
            start_ts_ns: 0,
            n_parts: 1,
            current_n_channel: 0,
        };
        let actions = sm.tick(&input, false, |_| {});
        assert!(actions.iter().any(|a| matches!(a, StageAction::TransitionedTo(Stage::Teardown))));
    }

    #[test]
    fn idle_parts_accumulate_when_no_new_messages() {
        let sm = StageMachine::new(2);
        sm.set_stage(Stage::Converge);
        sm.record_event(0);
        let input = StageTickInput {
            now_ns: CONVERGE_TIMEOUT_NS + 1,
            n_hosts: 1,
            cut_nchannel: 0,
            partition_target_nchannel: 0,
            local_edges_to_try: &[],
            max_runtime_ns: None,
            start_ts_ns: 0,
            n_parts: 2,
            current_n_channel: 0,
        };
        sm.tick(&input, false, |_| {});
        assert!(!sm.globally_converged(2));
        assert!(sm.iteration.lock().unwrap().idle_parts.contains(&0));
    }

    #[test]
    fn keepbusy_reset_delays_converge_timeout() {
        // S6: a KEEPBUSY received at t=2.5s resets the quiescence clock,
        // so the timeout that would otherwise fire at t=3s (3s since the
        // last local event at t=0) doesn't fire until 3.5s after it.
        let sm = StageMachine::new(1);
        sm.set_stage(Stage::Converge);
        sm.record_event(0);

        let tick_at = |sm: &StageMachine, now_ns: i64| {
            let input = StageTickInput {
                now_ns,
                n_hosts: 1,
                cut_nchannel: 0,
                partition_target_nchannel: 0,
                local_edges_to_try: &[],
                max_runtime_ns: None,
                start_ts_ns: 0,
                n_parts: 1,
                current_n_channel: 0,
            };
            sm.tick(&input, false, |_| {})
        };

        let two_point_five_s = 2_500_000_000i64;
        sm.record_event(two_point_five_s); // simulated KEEPBUSY from a peer

        let actions = tick_at(&sm, 3_000_000_000);
        assert!(!actions.iter().any(|a| matches!(a, StageAction::TransitionedTo(Stage::Teardown))));

        let actions = tick_at(&sm, two_point_five_s + CONVERGE_TIMEOUT_NS + 1);
        assert!(actions.iter().any(|a| matches!(a, StageAction::TransitionedTo(Stage::Teardown))));
    }
}
