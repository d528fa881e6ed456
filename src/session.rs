//! The session: an ordered set of check lists sharing one local
//! ufrag/password, one role, one tie-breaker, and the Ta pacing timer that
//! round-robins connectivity checks across them (§2.3, §4, §5).

use std::time::{Duration, Instant};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::candidate::{CandidateKind, LocalCandidateId, RemoteCandidateId};
use crate::checklist::{
    CheckList, CheckListState, CheckListSuccessHandler, ComponentId, IceEvent, Outcome, ReceivedPkt, SessionContext,
};
use crate::error::{is_ascii_printable, IceError};
use crate::pair::PairFoundation;
use crate::role::IceRole;
use crate::TransportAddress;

/// Aggregate session state (§4.4): `Completed` once every check list is
/// completed, `Failed` once every check list has failed, `Running`
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceSessionState {
    Running,
    Completed,
    Failed,
}

pub struct IceSession {
    check_lists: Vec<CheckList>,

    local_ufrag: String,
    local_pwd: String,
    role: IceRole,
    tie_breaker: u64,

    max_connectivity_checks: usize,
    keepalive_timeout: Duration,

    /// Last time any check list was given its Ta turn, and which index goes
    /// next. The session-wide Ta pacing timer and round-robin cursor
    /// (§4.2: at most one new request session-wide per Ta period).
    last_ta: Option<Instant>,
    ta_cursor: usize,
}

/// §4.2 default Ta: the minimum interval between new connectivity checks,
/// session-wide.
const TA_INTERVAL: Duration = Duration::from_millis(20);

fn random_credential(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

impl IceSession {
    /// Creates a session with freshly randomized local credentials and
    /// tie-breaker. `spec.md` leaves "who generates local credentials and
    /// when" as an Open Question; this crate always randomizes at
    /// construction (see `DESIGN.md`). `set_local_credentials` remains
    /// available for tests that need deterministic values.
    pub fn new(role: IceRole) -> Self {
        Self {
            check_lists: Vec::new(),
            local_ufrag: random_credential(8),
            local_pwd: random_credential(24),
            role,
            tie_breaker: rand::random(),
            max_connectivity_checks: 100,
            keepalive_timeout: Duration::from_secs(15),
            last_ta: None,
            ta_cursor: 0,
        }
    }

    pub fn role(&self) -> IceRole {
        self.role
    }

    pub fn local_ufrag(&self) -> &str {
        &self.local_ufrag
    }

    pub fn local_pwd(&self) -> &str {
        &self.local_pwd
    }

    /// Test-only escape hatch (§9 Open Question resolution): production
    /// callers should rely on the randomized credentials from `new`.
    pub fn set_local_credentials(&mut self, ufrag: impl Into<String>, pwd: impl Into<String>) -> Result<(), IceError> {
        let ufrag = ufrag.into();
        let pwd = pwd.into();

        if ufrag.len() < 4 || !is_ascii_printable(&ufrag) {
            return Err(IceError::InvalidUfrag);
        }
        if pwd.len() < 22 || !is_ascii_printable(&pwd) {
            return Err(IceError::InvalidPwd);
        }

        self.local_ufrag = ufrag;
        self.local_pwd = pwd;
        Ok(())
    }

    /// Switching role outside of §4.3's role-conflict resolution (e.g. the
    /// host asserting "we made the offer, so we are controlling") still
    /// needs every check list's pair priorities recomputed.
    pub fn set_role(&mut self, role: IceRole) {
        self.role = role;
        for cl in &mut self.check_lists {
            cl.recompute_pair_priorities(role);
        }
    }

    pub fn tie_breaker(&self) -> u64 {
        self.tie_breaker
    }

    pub fn set_max_connectivity_checks(&mut self, value: usize) -> Result<(), IceError> {
        if !(1..=255).contains(&value) {
            return Err(IceError::InvalidMaxConnectivityChecks);
        }
        self.max_connectivity_checks = value;
        Ok(())
    }

    pub fn set_keepalive_timeout(&mut self, secs: u64) -> Result<(), IceError> {
        if !(1..=255).contains(&secs) {
            return Err(IceError::InvalidKeepaliveTimeout);
        }
        self.keepalive_timeout = Duration::from_secs(secs);
        Ok(())
    }

    pub fn add_check_list(&mut self) -> usize {
        self.check_lists.push(CheckList::new());
        self.check_lists.len() - 1
    }

    pub fn check_list(&self, index: usize) -> Result<&CheckList, IceError> {
        self.check_lists.get(index).ok_or(IceError::CheckListIndexOutOfRange(index))
    }

    pub fn check_list_mut(&mut self, index: usize) -> Result<&mut CheckList, IceError> {
        self.check_lists
            .get_mut(index)
            .ok_or(IceError::CheckListIndexOutOfRange(index))
    }

    pub fn check_list_count(&self) -> usize {
        self.check_lists.len()
    }

    pub fn register_success_cb(&mut self, index: usize, cb: impl CheckListSuccessHandler + 'static) -> Result<(), IceError> {
        self.check_list_mut(index)?.register_success_cb(cb);
        Ok(())
    }

    pub fn state(&self) -> IceSessionState {
        if self.check_lists.is_empty() {
            return IceSessionState::Running;
        }

        if self.check_lists.iter().all(|cl| cl.state() == CheckListState::Completed) {
            IceSessionState::Completed
        } else if self.check_lists.iter().all(|cl| cl.state() == CheckListState::Failed) {
            IceSessionState::Failed
        } else {
            IceSessionState::Running
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_local_candidate(
        &mut self,
        check_list_index: usize,
        kind: CandidateKind,
        addr: TransportAddress,
        component_id: ComponentId,
        base: Option<LocalCandidateId>,
    ) -> Result<LocalCandidateId, IceError> {
        let role = self.role;
        let max_checks = self.max_connectivity_checks;
        self.check_list_mut(check_list_index)?
            .add_local_candidate(kind, addr, component_id, base, role, max_checks)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_remote_candidate(
        &mut self,
        check_list_index: usize,
        kind: CandidateKind,
        addr: TransportAddress,
        component_id: ComponentId,
        priority: u32,
        foundation: String,
    ) -> Result<RemoteCandidateId, IceError> {
        let role = self.role;
        let max_checks = self.max_connectivity_checks;
        self.check_list_mut(check_list_index)?
            .add_remote_candidate(kind, addr, component_id, priority, foundation, role, max_checks)
    }

    /// §6 session-wide helper: must be called after local gathering
    /// completes and before candidates are sent to the peer.
    pub fn compute_candidates_foundations(&mut self) {
        for cl in &mut self.check_lists {
            cl.compute_foundations();
        }
    }

    /// §6 session-wide helper: marks, per check list and component, the
    /// candidate most likely to work as default.
    pub fn choose_default_candidates(&mut self) {
        for cl in &mut self.check_lists {
            cl.choose_default_candidates();
        }
    }

    /// Drive the engine forward by one tick: retransmissions, the Ta
    /// round-robin across check lists, keepalives on completed lists, and
    /// nomination scheduling. Returns outbound packets for the host to
    /// send.
    pub fn poll(&mut self, now: Instant) -> Vec<IceEvent> {
        let mut events = Vec::new();

        let ta_due = match self.last_ta {
            Some(last) => now >= last + TA_INTERVAL,
            None => true,
        };
        let turn = if ta_due { self.next_ta_turn() } else { None };
        if ta_due {
            self.last_ta = Some(now);
        }

        for i in 0..self.check_lists.len() {
            let outcome = {
                let ctx = self.context();
                self.check_lists[i].process(now, &ctx, &mut events, turn == Some(i))
            };
            self.apply_outcome(outcome, i);
        }

        events
    }

    /// Round-robins which Running check list may issue a new connectivity
    /// check this Ta period (§4.2: "only ever performs [this] on one
    /// Running check list ... at a time"). Retransmissions, keepalives and
    /// nomination are unaffected and still run on every check list every
    /// tick. Advances the cursor past whichever list is chosen, even if
    /// that list turns out to have nothing queued, so the turn doesn't
    /// starve lists later in the rotation.
    fn next_ta_turn(&mut self) -> Option<usize> {
        let len = self.check_lists.len();
        if len == 0 {
            return None;
        }

        for offset in 0..len {
            let i = (self.ta_cursor + offset) % len;
            if self.check_lists[i].state() == CheckListState::Running && self.check_lists[i].has_pending_check() {
                self.ta_cursor = (i + 1) % len;
                return Some(i);
            }
        }

        None
    }

    /// Feed a packet received on the socket belonging to `check_list_index`
    /// into the engine. Returns outbound packets (STUN responses, or
    /// nothing if the packet was not for this engine at all).
    pub fn receive(&mut self, now: Instant, check_list_index: usize, pkt: ReceivedPkt) -> Result<Vec<IceEvent>, IceError> {
        if check_list_index >= self.check_lists.len() {
            return Err(IceError::CheckListIndexOutOfRange(check_list_index));
        }

        let mut events = Vec::new();
        let outcome = {
            let ctx = self.context();
            self.check_lists[check_list_index].handle_stun_packet(now, &ctx, &pkt, &mut events)
        };
        self.apply_outcome(outcome, check_list_index);

        Ok(events)
    }

    fn context(&self) -> SessionContext<'_> {
        SessionContext {
            role: self.role,
            tie_breaker: self.tie_breaker,
            local_ufrag: &self.local_ufrag,
            local_pwd: &self.local_pwd,
            max_connectivity_checks: self.max_connectivity_checks,
            keepalive_timeout: self.keepalive_timeout,
        }
    }

    /// Apply the cross-check-list effects of processing check list
    /// `originating_index`: a role switch is applied session-wide (every
    /// check list's pair priorities are stale the moment the role
    /// changes), and a newly succeeded pair's foundation unfreezes the
    /// matching foundation group in every *other* still-running check list
    /// (§8 property 4).
    fn apply_outcome(&mut self, outcome: Outcome, originating_index: usize) {
        if let Some(new_role) = outcome.role_switch {
            log::debug!("role switched to {new_role:?}");
            self.role = new_role;
            for cl in &mut self.check_lists {
                cl.recompute_pair_priorities(new_role);
            }
        }

        let foundations: Vec<PairFoundation> = outcome.succeeded_foundations;
        for foundation in &foundations {
            for (i, cl) in self.check_lists.iter_mut().enumerate() {
                if i != originating_index {
                    cl.unfreeze_foundation(foundation);
                }
            }
        }
    }

    pub fn dump_session(&self) {
        log::debug!(
            "session: role={:?} state={:?} check_lists={}",
            self.role,
            self.state(),
            self.check_lists.len()
        );
        for (i, cl) in self.check_lists.iter().enumerate() {
            log::debug!("-- check list {i} --");
            cl.dump_check_list();
        }
    }
}
