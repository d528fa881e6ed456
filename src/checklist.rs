//! The per-media-stream check list: candidate/pair arenas, the triggered
//! check queue, the valid list, and the STUN binding-check engine that
//! drives pair state transitions (§2.4, §2.5, §4).

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use slotmap::SlotMap;
use stun_types::{Class, TransactionId};

use crate::addr::{families_compatible, TransportAddress};
use crate::candidate::{CandidateKind, LocalCandidate, LocalCandidateId, RemoteCandidate, RemoteCandidateId};
use crate::error::{is_ascii_printable, IceError};
use crate::pair::{CandidatePair, CandidatePairState, PairFoundation, PairId, ValidPair};
use crate::priority::{candidate_priority, pair_priority, INITIAL_LOCAL_PREFERENCE};
use crate::role::IceRole;
use crate::stun;

/// RFC 5245 §4.2/§4.2.1 "component" of a data stream. RTP is always
/// component 1; RTCP, when not muxed, is component 2.
pub type ComponentId = u16;

/// Event emitted by [`CheckList`]/[`IceSession`](crate::session::IceSession)
/// processing: an outbound packet for the host's socket layer to send.
/// This and [`ReceivedPkt`] are the entire contract with the socket I/O
/// collaborator named in §1/§6.
#[derive(Debug, Clone)]
pub struct IceEvent {
    pub component_id: ComponentId,
    pub data: Vec<u8>,
    pub source: SocketAddr,
    pub target: SocketAddr,
}

/// A packet received on a UDP socket, handed to
/// [`CheckList::handle_stun_packet`] by the host.
pub struct ReceivedPkt {
    pub data: Vec<u8>,
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub component_id: ComponentId,
}

/// RFC 5245 §5.7.4 / §7.1.3.3 check list state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckListState {
    Running,
    Completed,
    Failed,
}

/// The "small interface with a single method" called out in `DESIGN.md`'s
/// notes on replacing the source's `void (*success_cb)(void*, IceCheckList*)`
/// function-pointer-plus-opaque-pointer pair: the opaque pointer becomes
/// this trait's own captured state.
pub trait CheckListSuccessHandler {
    fn on_success(&mut self, check_list: &CheckList);
}

impl<F: FnMut(&CheckList)> CheckListSuccessHandler for F {
    fn on_success(&mut self, check_list: &CheckList) {
        self(check_list)
    }
}

/// Context a [`CheckList`] needs from its owning
/// [`IceSession`](crate::session::IceSession) on every call. Kept narrow so
/// the check list never duplicates session-wide state.
pub(crate) struct SessionContext<'a> {
    pub role: IceRole,
    pub tie_breaker: u64,
    pub local_ufrag: &'a str,
    pub local_pwd: &'a str,
    pub max_connectivity_checks: usize,
    pub keepalive_timeout: Duration,
}

/// Cross-cutting effects of a `process`/`handle_stun_packet` call that only
/// the owning session can act on: a role switch must be applied (and pair
/// priorities recomputed) across every check list, a newly succeeded pair's
/// foundation must unfreeze same-foundation pairs in *other* running check
/// lists (§8 property 4), and a fresh Completed transition must fire the
/// success callback exactly once.
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    pub role_switch: Option<IceRole>,
    pub succeeded_foundations: Vec<PairFoundation>,
    pub newly_completed: bool,
    pub newly_failed: bool,
}

impl Outcome {
    pub(crate) fn merge(&mut self, other: Outcome) {
        if other.role_switch.is_some() {
            self.role_switch = other.role_switch;
        }
        self.succeeded_foundations.extend(other.succeeded_foundations);
        self.newly_completed |= other.newly_completed;
        self.newly_failed |= other.newly_failed;
    }
}

pub struct CheckList {
    local_candidates: SlotMap<LocalCandidateId, LocalCandidate>,
    remote_candidates: SlotMap<RemoteCandidateId, RemoteCandidate>,
    pairs: SlotMap<PairId, CandidatePair>,

    triggered: VecDeque<PairId>,
    valid: Vec<ValidPair>,
    foundation_groups: HashMap<PairFoundation, Vec<PairId>>,
    component_ids: BTreeSet<ComponentId>,

    state: CheckListState,
    last_keepalive: HashMap<ComponentId, Instant>,
    foundation_generator: u32,

    remote_ufrag: String,
    remote_pwd: String,

    success_cb: Option<Box<dyn CheckListSuccessHandler>>,
}

impl CheckList {
    pub fn new() -> Self {
        Self {
            local_candidates: SlotMap::with_key(),
            remote_candidates: SlotMap::with_key(),
            pairs: SlotMap::with_key(),
            triggered: VecDeque::new(),
            valid: Vec::new(),
            foundation_groups: HashMap::new(),
            component_ids: BTreeSet::new(),
            state: CheckListState::Running,
            last_keepalive: HashMap::new(),
            foundation_generator: 0,
            remote_ufrag: String::new(),
            remote_pwd: String::new(),
            success_cb: None,
        }
    }

    pub fn register_success_cb(&mut self, cb: impl CheckListSuccessHandler + 'static) {
        self.success_cb = Some(Box::new(cb));
    }

    pub fn state(&self) -> CheckListState {
        self.state
    }

    pub fn remote_ufrag(&self) -> &str {
        &self.remote_ufrag
    }

    pub fn remote_pwd(&self) -> &str {
        &self.remote_pwd
    }

    pub fn set_remote_credentials(&mut self, ufrag: impl Into<String>, pwd: impl Into<String>) -> Result<(), IceError> {
        let ufrag = ufrag.into();
        let pwd = pwd.into();

        if ufrag.len() < 4 || !is_ascii_printable(&ufrag) {
            return Err(IceError::InvalidUfrag);
        }
        if pwd.len() < 22 || !is_ascii_printable(&pwd) {
            return Err(IceError::InvalidPwd);
        }

        self.remote_ufrag = ufrag;
        self.remote_pwd = pwd;
        Ok(())
    }

    /// The candidate chosen, per component, as most-likely-to-work by
    /// `choose_default_candidates` (§4.1). Returns the first one found if
    /// several components' defaults are requested; callers typically want
    /// `default_local_candidate_for(component_id)`.
    pub fn default_local_candidate(&self) -> Option<&LocalCandidate> {
        self.local_candidates.values().find(|c| c.is_default)
    }

    pub fn default_local_candidate_for(&self, component_id: ComponentId) -> Option<&LocalCandidate> {
        self.local_candidates
            .values()
            .find(|c| c.is_default && c.component_id == component_id)
    }

    // ---- Candidate & pair construction (§4.1) ----------------------------

    pub fn add_local_candidate(
        &mut self,
        kind: CandidateKind,
        addr: TransportAddress,
        component_id: ComponentId,
        base: Option<LocalCandidateId>,
        role: IceRole,
        max_connectivity_checks: usize,
    ) -> Result<LocalCandidateId, IceError> {
        if !(1..=256).contains(&component_id) {
            return Err(IceError::InvalidComponentId(component_id));
        }

        if let Some(base_id) = base {
            if !self.local_candidates.contains_key(base_id) {
                return Err(IceError::UnknownBaseCandidate);
            }
        }

        let already_exists = self.local_candidates.values().any(|c| {
            c.kind == kind
                && c.addr == addr
                && c.component_id == component_id
                && base.map(|b| c.base == b).unwrap_or(kind == CandidateKind::Host)
        });
        if already_exists {
            return Err(IceError::DuplicateCandidate);
        }

        let local_preference = INITIAL_LOCAL_PREFERENCE
            - self.local_candidates.values().filter(|c| c.kind == kind).count() as u32;
        let priority = candidate_priority(kind, local_preference, component_id);

        self.component_ids.insert(component_id);

        let id = self.local_candidates.insert_with_key(|id| LocalCandidate {
            foundation: String::new(),
            addr,
            kind,
            priority,
            component_id,
            base: base.unwrap_or(id),
            is_default: false,
        });

        log::debug!("added local candidate {}", self.local_candidates[id]);

        self.form_pairs(role, max_connectivity_checks);

        Ok(id)
    }

    pub fn add_remote_candidate(
        &mut self,
        kind: CandidateKind,
        addr: TransportAddress,
        component_id: ComponentId,
        priority: u32,
        foundation: String,
        role: IceRole,
        max_connectivity_checks: usize,
    ) -> Result<RemoteCandidateId, IceError> {
        if !(1..=256).contains(&component_id) {
            return Err(IceError::InvalidComponentId(component_id));
        }
        if foundation.len() > 31 {
            return Err(IceError::FoundationTooLong);
        }

        let already_exists = self
            .remote_candidates
            .values()
            .any(|c| c.kind == kind && c.addr == addr && c.component_id == component_id);
        if already_exists {
            return Err(IceError::DuplicateCandidate);
        }

        self.component_ids.insert(component_id);

        let id = self.remote_candidates.insert(RemoteCandidate {
            foundation,
            addr,
            kind,
            priority,
            component_id,
            base: None,
            is_default: false,
        });

        log::debug!("added remote candidate {}", self.remote_candidates[id]);

        self.form_pairs(role, max_connectivity_checks);

        Ok(id)
    }

    /// Insert a remote candidate discovered via the triggered-check rule
    /// (§4.3): paired directly with the local candidate that received the
    /// request, never through the general `form_pairs` cross product.
    fn insert_synthesized_remote_candidate(
        &mut self,
        addr: TransportAddress,
        component_id: ComponentId,
        priority: u32,
    ) -> RemoteCandidateId {
        self.foundation_generator += 1;
        let foundation = format!("~{}", self.foundation_generator);

        self.remote_candidates.insert(RemoteCandidate {
            foundation,
            addr,
            kind: CandidateKind::PeerReflexive,
            priority,
            component_id,
            base: None,
            is_default: false,
        })
    }

    /// RFC 5245 §4.1.1.3: assign identical foundations to local candidates
    /// sharing `(kind, base.addr.ip)`. Must be called after gathering,
    /// before pairing/sending SDP (§6).
    pub fn compute_foundations(&mut self) {
        let mut groups: HashMap<(CandidateKind, String), String> = HashMap::new();

        let ids: Vec<LocalCandidateId> = self.local_candidates.keys().collect();
        for id in ids {
            let base_id = self.local_candidates[id].base;
            let key = (
                self.local_candidates[id].kind,
                self.local_candidates[base_id].addr.ip().to_string(),
            );

            let foundation = groups.entry(key).or_insert_with(|| {
                self.foundation_generator += 1;
                self.foundation_generator.to_string()
            });

            self.local_candidates[id].foundation = foundation.clone();
        }
    }

    /// RFC 5245 §4.1.4 (intent): mark, per component, the candidate most
    /// likely to work as default. Resolves the Open Question in
    /// `spec.md` §9 as Relayed > ServerReflexive > Host, PeerReflexive never
    /// default (see `DESIGN.md`).
    pub fn choose_default_candidates(&mut self) {
        for c in self.local_candidates.values_mut() {
            c.is_default = false;
        }

        let components: Vec<ComponentId> = self.component_ids.iter().copied().collect();
        for component_id in components {
            let best = self
                .local_candidates
                .iter()
                .filter(|(_, c)| c.component_id == component_id && c.kind != CandidateKind::PeerReflexive)
                .max_by_key(|(_, c)| c.kind.default_rank())
                .map(|(id, _)| id);

            if let Some(id) = best {
                self.local_candidates[id].is_default = true;
            }
        }
    }

    fn form_pairs(&mut self, role: IceRole, max_connectivity_checks: usize) {
        let local_ids: Vec<LocalCandidateId> = self.local_candidates.keys().collect();
        let remote_ids: Vec<RemoteCandidateId> = self.remote_candidates.keys().collect();

        let mut created = Vec::new();

        for local_id in local_ids {
            let pairing_local_id = self.local_candidates[local_id].base;

            for &remote_id in &remote_ids {
                let remote = &self.remote_candidates[remote_id];
                if remote.kind == CandidateKind::PeerReflexive && remote.foundation.starts_with('~') {
                    // Synthesized via the triggered-check rule: already paired
                    // directly with its discovering local candidate.
                    continue;
                }

                let local = &self.local_candidates[pairing_local_id];
                if local.component_id != remote.component_id {
                    continue;
                }
                if !families_compatible(&local.addr, &remote.addr) {
                    continue;
                }

                let already_exists = self
                    .pairs
                    .values()
                    .any(|p| p.local == pairing_local_id && p.remote == remote_id);
                if already_exists {
                    continue;
                }

                let priority = pair_priority(local.priority, remote.priority, role.is_controlling());
                let mut pair = CandidatePair::new(pairing_local_id, remote_id, priority);
                pair.is_default = local.is_default && remote.is_default;

                let pair_id = self.pairs.insert(pair);
                created.push(pair_id);
            }
        }

        self.prune_pairs(max_connectivity_checks);
        self.seed_frozen_groups(&created);
    }

    /// Keep only the `max_connectivity_checks` highest-priority pairs
    /// (§4.1, RFC 5245 §5.7.3).
    fn prune_pairs(&mut self, max_connectivity_checks: usize) {
        if self.pairs.len() <= max_connectivity_checks {
            return;
        }

        let mut ids: Vec<PairId> = self.pairs.keys().collect();
        ids.sort_unstable_by_key(|id| std::cmp::Reverse(self.pairs[*id].priority));

        for id in ids.into_iter().skip(max_connectivity_checks) {
            log::debug!("pruned pair {id:?}, exceeds max_connectivity_checks");
            self.pairs.remove(id);
        }
    }

    fn pair_foundation(&self, pair: &CandidatePair) -> PairFoundation {
        PairFoundation {
            local: self.local_candidates[pair.local].foundation.clone(),
            remote: self.remote_candidates[pair.remote].foundation.clone(),
        }
    }

    /// RFC 5245 §5.7.4: freeze every pair except one (the highest-priority)
    /// per foundation group. Only groups with no pre-existing active member
    /// get a freshly-chosen `Waiting` representative; re-pairing later
    /// (new candidates trickling in) must not disturb in-progress work.
    fn seed_frozen_groups(&mut self, created: &[PairId]) {
        for &id in created {
            let foundation = self.pair_foundation(&self.pairs[id]);
            self.foundation_groups.entry(foundation).or_default().push(id);
        }

        let foundations: Vec<PairFoundation> = self.foundation_groups.keys().cloned().collect();
        for foundation in foundations {
            let members = &self.foundation_groups[&foundation];

            let has_active_member = members.iter().any(|id| {
                self.pairs
                    .get(*id)
                    .is_some_and(|p| p.state != CandidatePairState::Frozen)
            });
            if has_active_member {
                continue;
            }

            let best = members
                .iter()
                .copied()
                .filter(|id| self.pairs.contains_key(*id))
                .max_by_key(|id| self.pairs[*id].priority);

            if let Some(id) = best {
                self.pairs[id].state = CandidatePairState::Waiting;
            }
        }
    }

    /// RFC 5245 §7.1.3.2.3: unfreeze pairs in this (other) check list that
    /// share `foundation` with a pair that just succeeded elsewhere.
    pub(crate) fn unfreeze_foundation(&mut self, foundation: &PairFoundation) {
        if let Some(members) = self.foundation_groups.get(foundation) {
            for &id in members {
                if let Some(pair) = self.pairs.get_mut(id) {
                    if pair.state == CandidatePairState::Frozen {
                        pair.state = CandidatePairState::Waiting;
                    }
                }
            }
        }
    }

    /// Recompute every pair's priority for a new role (§4.3: a role switch
    /// invalidates the RFC 5245 §5.7.2 formula's controlling/controlled
    /// assignment for every pair in every check list).
    pub(crate) fn recompute_pair_priorities(&mut self, role: IceRole) {
        for pair in self.pairs.values_mut() {
            let local_priority = self.local_candidates[pair.local].priority;
            let remote_priority = self.remote_candidates[pair.remote].priority;
            pair.priority = pair_priority(local_priority, remote_priority, role.is_controlling());
        }
    }

    // ---- STUN binding-check engine (§4.2-§4.5) ----------------------------

    /// `allow_new_check` gates whether this call may issue a brand new
    /// request via `poll_ta` (§4.2 Ta pacing: at most one new request
    /// session-wide per Ta period, round-robin across running check lists).
    /// Retransmits, keepalives and nomination are independent of that
    /// pacing and always run.
    pub(crate) fn process(
        &mut self,
        now: Instant,
        ctx: &SessionContext<'_>,
        events: &mut Vec<IceEvent>,
        allow_new_check: bool,
    ) -> Outcome {
        let mut outcome = Outcome::default();

        self.poll_retransmit(now, ctx, events, &mut outcome);
        self.poll_keepalives(now, ctx, events);
        self.poll_nomination(ctx, &mut outcome);
        if allow_new_check {
            self.poll_ta(now, ctx, events, &mut outcome);
        }

        self.finalize(&mut outcome);
        outcome
    }

    fn poll_ta(&mut self, now: Instant, ctx: &SessionContext<'_>, events: &mut Vec<IceEvent>, outcome: &mut Outcome) {
        let Some(pair_id) = self.next_check_candidate() else {
            return;
        };

        self.send_check(pair_id, now, ctx, events, outcome);
    }

    /// Whether this check list has a candidate ready for a new check right
    /// now. Used by the owning session to decide whether this list's turn
    /// in the Ta round-robin would actually produce a request.
    pub(crate) fn has_pending_check(&self) -> bool {
        self.triggered.iter().any(|id| self.pairs.contains_key(*id))
            || self
                .pairs
                .values()
                .any(|p| matches!(p.state, CandidatePairState::Waiting | CandidatePairState::Frozen))
    }

    /// Selection order (§4.2): triggered queue head first, else the
    /// highest-priority `Waiting` pair, else the highest-priority `Frozen`
    /// pair.
    fn next_check_candidate(&mut self) -> Option<PairId> {
        while let Some(id) = self.triggered.pop_front() {
            if self.pairs.contains_key(id) {
                return Some(id);
            }
        }

        if let Some(id) = self
            .pairs
            .iter()
            .filter(|(_, p)| p.state == CandidatePairState::Waiting)
            .max_by_key(|(_, p)| p.priority)
            .map(|(id, _)| id)
        {
            return Some(id);
        }

        self.pairs
            .iter()
            .filter(|(_, p)| p.state == CandidatePairState::Frozen)
            .max_by_key(|(_, p)| p.priority)
            .map(|(id, _)| id)
    }

    fn send_check(
        &mut self,
        pair_id: PairId,
        now: Instant,
        ctx: &SessionContext<'_>,
        events: &mut Vec<IceEvent>,
        outcome: &mut Outcome,
    ) {
        let Some(pair) = self.pairs.get_mut(pair_id) else {
            return;
        };

        let local = &self.local_candidates[pair.local];
        let remote = &self.remote_candidates[pair.remote];

        let Some(source) = local.addr.to_socket_addr() else {
            log::warn!("local candidate address {} does not parse, dropping check", local.addr);
            return;
        };
        let Some(target) = remote.addr.to_socket_addr() else {
            log::warn!("remote candidate address {} does not parse, dropping check", remote.addr);
            return;
        };

        let component_id = local.component_id;
        let peer_reflexive_priority =
            candidate_priority(CandidateKind::PeerReflexive, INITIAL_LOCAL_PREFERENCE, component_id);

        let tid = TransactionId::random();
        let use_candidate = pair.is_nominated && ctx.role.is_controlling();

        let request = stun::make_binding_request(
            tid,
            ctx.local_ufrag,
            &self.remote_ufrag,
            &self.remote_pwd,
            peer_reflexive_priority,
            ctx.role,
            ctx.tie_breaker,
            use_candidate,
        );

        pair.state = CandidatePairState::InProgress;
        pair.tid = Some(tid);
        pair.tx_time = Some(now);
        pair.rto = stun::INITIAL_RTO;
        pair.retransmissions = 1;
        pair.sent_source = Some(source);
        pair.sent_target = Some(target);
        pair.role_at_send = Some(ctx.role);
        pair.wait_timeout = false;
        pair.last_sent_priority = Some(peer_reflexive_priority);

        log::debug!("sent connectivity check for pair {pair_id:?}, nominate={use_candidate}");

        events.push(IceEvent {
            component_id,
            data: request,
            source,
            target,
        });

        let _ = outcome;
    }

    fn poll_retransmit(&mut self, now: Instant, ctx: &SessionContext<'_>, events: &mut Vec<IceEvent>, outcome: &mut Outcome) {
        let ids: Vec<PairId> = self
            .pairs
            .iter()
            .filter(|(_, p)| p.state == CandidatePairState::InProgress)
            .map(|(id, _)| id)
            .collect();

        for id in ids {
            let tx_time = self.pairs[id].tx_time.expect("InProgress pair always has tx_time");
            let rto = self.pairs[id].rto;
            if now < tx_time + rto {
                continue;
            }

            if self.pairs[id].wait_timeout {
                // Triggered pair: start a fresh check rather than
                // retransmitting the stale one (§4.2).
                self.send_check(id, now, ctx, events, outcome);
                continue;
            }

            if self.pairs[id].retransmissions >= stun::MAX_RETRANSMITS {
                log::debug!("pair {id:?} failed: retransmission budget exhausted");
                self.pairs[id].state = CandidatePairState::Failed;
                continue;
            }

            let pair = &mut self.pairs[id];
            pair.retransmissions += 1;
            pair.rto = stun::next_rto(pair.rto);
            pair.tx_time = Some(now);

            let local = &self.local_candidates[pair.local];
            let remote = &self.remote_candidates[pair.remote];
            let (Some(source), Some(target)) = (local.addr.to_socket_addr(), remote.addr.to_socket_addr()) else {
                continue;
            };
            let component_id = local.component_id;
            let use_candidate = pair.is_nominated && ctx.role.is_controlling();
            let tid = pair.tid.expect("InProgress pair always has a tid");
            let priority = pair.last_sent_priority.unwrap_or_else(|| {
                candidate_priority(CandidateKind::PeerReflexive, INITIAL_LOCAL_PREFERENCE, component_id)
            });

            let request = stun::make_binding_request(
                tid,
                ctx.local_ufrag,
                &self.remote_ufrag,
                &self.remote_pwd,
                priority,
                ctx.role,
                ctx.tie_breaker,
                use_candidate,
            );

            events.push(IceEvent {
                component_id,
                data: request,
                source,
                target,
            });
        }
    }

    fn poll_keepalives(&mut self, now: Instant, ctx: &SessionContext<'_>, events: &mut Vec<IceEvent>) {
        if self.state != CheckListState::Completed {
            return;
        }

        for component_id in self.component_ids.clone() {
            let due = self
                .last_keepalive
                .get(&component_id)
                .map(|last| now >= *last + ctx.keepalive_timeout)
                .unwrap_or(true);
            if !due {
                continue;
            }

            let Some(pair) = self.valid.iter().find_map(|vp| {
                let p = self.pairs.get(vp.valid)?;
                (p.is_nominated && self.local_candidates[p.local].component_id == component_id).then_some(p)
            }) else {
                continue;
            };

            let local = &self.local_candidates[pair.local];
            let remote = &self.remote_candidates[pair.remote];
            let (Some(source), Some(target)) = (local.addr.to_socket_addr(), remote.addr.to_socket_addr()) else {
                continue;
            };

            let data = stun::make_keepalive_indication(TransactionId::random());
            events.push(IceEvent {
                component_id,
                data,
                source,
                target,
            });
            self.last_keepalive.insert(component_id, now);
        }
    }

    /// §4.4 regular nomination: once every component has at least one
    /// valid pair, schedule one triggered check with `USE-CANDIDATE` per
    /// component lacking a nomination.
    fn poll_nomination(&mut self, ctx: &SessionContext<'_>, _outcome: &mut Outcome) {
        if !ctx.role.is_controlling() {
            return;
        }
        if self.component_ids.is_empty() {
            return;
        }

        let all_components_ready = self.component_ids.iter().all(|component_id| {
            self.valid
                .iter()
                .any(|vp| self.pairs.get(vp.valid).is_some_and(|p| self.local_candidates[p.local].component_id == *component_id))
        });
        if !all_components_ready {
            return;
        }

        for component_id in self.component_ids.clone() {
            let already_nominated = self.pairs.values().any(|p| {
                p.is_nominated && self.local_candidates[p.local].component_id == component_id
            });
            if already_nominated {
                continue;
            }

            let best = self
                .valid
                .iter()
                .filter(|vp| {
                    self.pairs
                        .get(vp.valid)
                        .is_some_and(|p| self.local_candidates[p.local].component_id == component_id)
                })
                .max_by_key(|vp| self.pairs[vp.valid].priority)
                .map(|vp| vp.valid);

            let Some(pair_id) = best else { continue };

            log::debug!("nominating pair {pair_id:?} for component {component_id}");
            self.pairs[pair_id].is_nominated = true;
            self.triggered.push_front(pair_id);
        }
    }

    pub(crate) fn handle_stun_packet(
        &mut self,
        now: Instant,
        ctx: &SessionContext<'_>,
        pkt: &ReceivedPkt,
        events: &mut Vec<IceEvent>,
    ) -> Outcome {
        let mut outcome = Outcome::default();

        let Some(mut msg) = stun::parse(pkt.data.clone()) else {
            log::trace!("dropping STUN packet that failed the fingerprint check");
            return outcome;
        };

        match stun::class(&msg) {
            Class::Request => self.handle_request(now, ctx, pkt, &mut msg, events, &mut outcome),
            Class::Indication => { /* keepalives from the peer require no action */ }
            Class::Success => self.handle_success(ctx, pkt, &mut msg, events, &mut outcome),
            Class::Error => self.handle_error(ctx, &mut msg, &mut outcome),
        }

        self.finalize(&mut outcome);
        outcome
    }

    fn handle_success(&mut self, ctx: &SessionContext<'_>, pkt: &ReceivedPkt, msg: &mut stun_types::Message, events: &mut Vec<IceEvent>, outcome: &mut Outcome) {
        let tid = stun::transaction_id(msg);

        let Some(pair_id) = self
            .pairs
            .iter()
            .find(|(_, p)| p.state == CandidatePairState::InProgress && p.tid == Some(tid))
            .map(|(id, _)| id)
        else {
            log::debug!("no in-progress pair for STUN success transaction {tid:?}, discarding");
            return;
        };

        if !stun::verify_response(&self.remote_pwd, msg) {
            log::warn!("STUN success response failed integrity check, discarding");
            return;
        }

        // §7.1.3.1 symmetry check: the response must have come from the
        // address the request was sent to, and be addressed back to the
        // address the request was sent from. Anything else fails the pair
        // outright rather than validating it.
        let sent_source = self.pairs[pair_id].sent_source;
        let sent_target = self.pairs[pair_id].sent_target;
        let symmetric = sent_target.is_some_and(|target| pkt.source == target)
            || sent_source.is_some_and(|source| pkt.destination.ip() == source.ip());
        if !symmetric {
            log::debug!("pair {pair_id:?} failed: asymmetric STUN success response from {}", pkt.source);
            self.pairs[pair_id].state = CandidatePairState::Failed;
            self.pairs[pair_id].is_nominated = false;
            return;
        }

        let Some(mapped) = stun::xor_mapped_address_attr(msg) else {
            log::warn!("STUN success response missing XOR-MAPPED-ADDRESS, discarding");
            return;
        };
        let Ok(mapped_addr) = TransportAddress::new(mapped.ip().to_string(), mapped.port()) else {
            return;
        };

        let original_local_id = self.pairs[pair_id].local;
        let original_remote_id = self.pairs[pair_id].remote;
        let component_id = self.local_candidates[original_local_id].component_id;
        let sent_priority = self.pairs[pair_id]
            .last_sent_priority
            .unwrap_or_else(|| candidate_priority(CandidateKind::PeerReflexive, INITIAL_LOCAL_PREFERENCE, component_id));

        let valid_pair_id = if mapped_addr == self.local_candidates[original_local_id].addr {
            pair_id
        } else {
            let discovered_id = self.find_or_insert_peer_reflexive_local(
                mapped_addr,
                component_id,
                original_local_id,
                sent_priority,
            );

            self.find_or_insert_pair(discovered_id, original_remote_id, ctx.role)
        };

        self.pairs[pair_id].state = CandidatePairState::Succeeded;
        // A Controlled agent may have received USE-CANDIDATE on this pair
        // before its own check completed (§4.3); honor it now.
        if self.pairs[pair_id].received_use_candidate {
            self.pairs[pair_id].is_nominated = true;
        }
        let nominated = self.pairs[pair_id].is_nominated;

        if valid_pair_id != pair_id {
            self.pairs[valid_pair_id].state = CandidatePairState::Succeeded;
        }
        if nominated {
            self.pairs[valid_pair_id].is_nominated = true;
        }

        let already_valid = self.valid.iter().any(|vp| vp.valid == valid_pair_id);
        if !already_valid {
            self.valid.push(ValidPair {
                valid: valid_pair_id,
                generated_from: pair_id,
            });
        }

        let foundation = self.pair_foundation(&self.pairs[valid_pair_id]);
        outcome.succeeded_foundations.push(foundation);

        log::debug!(
            "pair {pair_id:?} succeeded (valid pair {valid_pair_id:?}), nominated={}",
            self.pairs[valid_pair_id].is_nominated
        );

        let _ = events;
    }

    fn find_or_insert_peer_reflexive_local(
        &mut self,
        addr: TransportAddress,
        component_id: ComponentId,
        base: LocalCandidateId,
        priority: u32,
    ) -> LocalCandidateId {
        if let Some((id, _)) = self.local_candidates.iter().find(|(_, c)| {
            c.kind == CandidateKind::PeerReflexive && c.base == base && c.addr == addr && c.component_id == component_id
        }) {
            return id;
        }

        self.foundation_generator += 1;
        let foundation = format!("~{}", self.foundation_generator);

        let id = self.local_candidates.insert(LocalCandidate {
            foundation,
            addr,
            kind: CandidateKind::PeerReflexive,
            priority,
            component_id,
            base,
            is_default: false,
        });

        log::debug!("discovered peer-reflexive local candidate {}", self.local_candidates[id]);

        id
    }

    fn find_or_insert_pair(&mut self, local: LocalCandidateId, remote: RemoteCandidateId, role: IceRole) -> PairId {
        if let Some(id) = self.pairs.iter().find(|(_, p)| p.local == local && p.remote == remote).map(|(id, _)| id) {
            return id;
        }

        let priority = pair_priority(
            self.local_candidates[local].priority,
            self.remote_candidates[remote].priority,
            role.is_controlling(),
        );
        let mut pair = CandidatePair::new(local, remote, priority);
        pair.state = CandidatePairState::Succeeded;
        let id = self.pairs.insert(pair);

        let foundation = self.pair_foundation(&self.pairs[id]);
        self.foundation_groups.entry(foundation).or_default().push(id);

        id
    }

    fn handle_error(&mut self, ctx: &SessionContext<'_>, msg: &mut stun_types::Message, outcome: &mut Outcome) {
        let tid = stun::transaction_id(msg);

        let Some(pair_id) = self
            .pairs
            .iter()
            .find(|(_, p)| p.state == CandidatePairState::InProgress && p.tid == Some(tid))
            .map(|(id, _)| id)
        else {
            log::debug!("no in-progress pair for STUN error transaction {tid:?}, discarding");
            return;
        };

        if !stun::verify_response(&self.remote_pwd, msg) {
            log::warn!("STUN error response failed integrity check, discarding");
            return;
        }

        let Some(code) = stun::error_code_attr(msg) else {
            self.pairs[pair_id].state = CandidatePairState::Failed;
            return;
        };

        if code != stun::ERROR_ROLE_CONFLICT {
            log::debug!("pair {pair_id:?} failed with STUN error {code}");
            self.pairs[pair_id].state = CandidatePairState::Failed;
            return;
        }

        // The peer's new role is embedded in the error response; we take
        // the opposite, per §4.3.
        let new_role = if stun::ice_controlled_attr(msg).is_some() {
            IceRole::Controlling
        } else if stun::ice_controlling_attr(msg).is_some() {
            IceRole::Controlled
        } else {
            ctx.role
        };

        self.pairs[pair_id].state = CandidatePairState::Waiting;
        self.pairs[pair_id].tid = None;
        self.triggered.push_back(pair_id);

        if new_role != ctx.role {
            outcome.role_switch = Some(new_role);
        }
    }

    fn handle_request(
        &mut self,
        now: Instant,
        ctx: &SessionContext<'_>,
        pkt: &ReceivedPkt,
        msg: &mut stun_types::Message,
        events: &mut Vec<IceEvent>,
        outcome: &mut Outcome,
    ) {
        if !stun::verify_request(ctx.local_ufrag, ctx.local_pwd, &self.remote_ufrag, msg) {
            log::warn!("STUN request failed username/integrity validation, rejecting");
            let data = stun::make_generic_error(stun::transaction_id(msg), stun::ERROR_UNAUTHORIZED, "Unauthorized");
            events.push(IceEvent {
                component_id: pkt.component_id,
                data,
                source: pkt.destination,
                target: pkt.source,
            });
            return;
        }

        let Some(priority) = stun::priority_attr(msg) else {
            log::warn!("STUN request missing PRIORITY attribute, rejecting");
            let data = stun::make_generic_error(stun::transaction_id(msg), stun::ERROR_BAD_REQUEST, "Bad Request");
            events.push(IceEvent {
                component_id: pkt.component_id,
                data,
                source: pkt.destination,
                target: pkt.source,
            });
            return;
        };
        let use_candidate = stun::use_candidate_attr(msg);

        // Role conflict, §4.3/§7.2.1.1: peer declares the same role as us.
        let peer_declares_controlling = stun::ice_controlling_attr(msg);
        let peer_declares_controlled = stun::ice_controlled_attr(msg);

        let conflict = match ctx.role {
            IceRole::Controlling => peer_declares_controlling,
            IceRole::Controlled => peer_declares_controlled,
        };

        if let Some(peer_tie_breaker) = conflict {
            if ctx.tie_breaker >= peer_tie_breaker {
                let response = stun::make_role_conflict_error(stun::transaction_id(msg), ctx.local_pwd, ctx.role, ctx.tie_breaker);
                events.push(IceEvent {
                    component_id: pkt.component_id,
                    data: response,
                    source: pkt.destination,
                    target: pkt.source,
                });
                return;
            }

            // We lose: switch role and continue processing normally.
            outcome.role_switch = Some(ctx.role.flipped());
        }

        let effective_role = outcome.role_switch.unwrap_or(ctx.role);

        let Some(local_id) = self
            .local_candidates
            .iter()
            .find(|(_, c)| c.kind == CandidateKind::Host && c.addr.to_socket_addr() == Some(pkt.destination))
            .map(|(id, _)| id)
        else {
            log::warn!("no local host candidate for destination {}", pkt.destination);
            return;
        };

        let remote_id = self
            .remote_candidates
            .iter()
            .find(|(_, c)| c.addr.to_socket_addr() == Some(pkt.source))
            .map(|(id, _)| id)
            .unwrap_or_else(|| {
                let Ok(source_addr) = TransportAddress::new(pkt.source.ip().to_string(), pkt.source.port()) else {
                    unreachable!("SocketAddr always yields a short ip string")
                };
                let id = self.insert_synthesized_remote_candidate(source_addr, pkt.component_id, priority);

                let pair_id = self.find_or_insert_pair(local_id, id, effective_role);
                self.pairs[pair_id].state = CandidatePairState::Waiting;
                self.triggered.push_back(pair_id);

                id
            });

        let pair_id = self.find_or_insert_pair(local_id, remote_id, effective_role);

        // Recorded unconditionally, mirroring the teacher: even if this
        // pair's own check hasn't completed yet, the nomination is honored
        // once it later succeeds (see `handle_success`).
        self.pairs[pair_id].received_use_candidate = use_candidate;

        match self.pairs[pair_id].state {
            CandidatePairState::Waiting | CandidatePairState::Frozen => {
                self.pairs[pair_id].wait_timeout = true;
                self.triggered.retain(|id| *id != pair_id);
                self.triggered.push_front(pair_id);
            }
            CandidatePairState::InProgress => {
                // Do not cancel the outstanding transaction: its success
                // response must still be able to match in `handle_success`.
                // Just schedule a triggered re-check alongside it.
                log::debug!("scheduling triggered re-check for in-progress pair {pair_id:?}");
                self.pairs[pair_id].wait_timeout = true;
                self.triggered.retain(|id| *id != pair_id);
                self.triggered.push_front(pair_id);
            }
            CandidatePairState::Succeeded => {
                if use_candidate {
                    if let Some(vp) = self.valid.iter().find(|vp| vp.valid == pair_id) {
                        self.pairs[vp.valid].is_nominated = true;
                        let foundation = self.pair_foundation(&self.pairs[vp.valid]);
                        outcome.succeeded_foundations.push(foundation);
                    }
                }
            }
            CandidatePairState::Failed => {}
        }

        let response = stun::make_success_response(stun::transaction_id(msg), ctx.local_pwd, pkt.source);
        events.push(IceEvent {
            component_id: pkt.component_id,
            data: response,
            source: pkt.destination,
            target: pkt.source,
        });

        let _ = now;
    }

    fn completed_components(&self) -> BTreeSet<ComponentId> {
        self.valid
            .iter()
            .filter_map(|vp| {
                let pair = self.pairs.get(vp.valid)?;
                (pair.is_nominated && pair.state == CandidatePairState::Succeeded)
                    .then(|| self.local_candidates[pair.local].component_id)
            })
            .collect()
    }

    /// §4.4 completion/failure bookkeeping, run after every processing
    /// step regardless of what triggered it.
    fn update_state(&mut self, outcome: &mut Outcome) {
        if self.state != CheckListState::Running {
            return;
        }

        let completed = self.completed_components();

        if !self.component_ids.is_empty() && completed == self.component_ids {
            self.state = CheckListState::Completed;
            outcome.newly_completed = true;

            // Cancel any still in-progress pair on an already-covered
            // component (§4.4).
            let local_components: HashMap<PairId, ComponentId> = self
                .pairs
                .iter()
                .map(|(id, p)| (id, self.local_candidates[p.local].component_id))
                .collect();

            for (id, component_id) in local_components {
                if completed.contains(&component_id) {
                    if let Some(pair) = self.pairs.get_mut(id) {
                        if pair.state == CandidatePairState::InProgress {
                            pair.state = CandidatePairState::Failed;
                        }
                    }
                }
            }

            log::debug!("check list completed");
            return;
        }

        let any_active = self.pairs.values().any(|p| {
            matches!(
                p.state,
                CandidatePairState::Waiting | CandidatePairState::Frozen | CandidatePairState::InProgress
            )
        });

        if !any_active && completed != self.component_ids {
            self.state = CheckListState::Failed;
            outcome.newly_failed = true;
            log::debug!("check list failed: no pairs left and not every component is nominated");
        }
    }

    fn finalize(&mut self, outcome: &mut Outcome) {
        self.update_state(outcome);

        if outcome.newly_completed {
            if let Some(mut cb) = self.success_cb.take() {
                cb.on_success(self);
                self.success_cb = Some(cb);
            }
        }
    }

    /// Remote addresses/ports for the nominated pair of components 1 and 2
    /// (§6 `get_remote_addr_and_ports_from_valid_pairs`).
    pub fn remote_addr_and_ports(&self) -> Option<(String, u16, u16)> {
        let rtp = self.nominated_remote_addr(1)?;
        let rtcp_port = self.nominated_remote_addr(2).map(|(_, port)| port).unwrap_or(0);
        Some((rtp.0, rtp.1, rtcp_port))
    }

    fn nominated_remote_addr(&self, component_id: ComponentId) -> Option<(String, u16)> {
        self.valid.iter().find_map(|vp| {
            let pair = self.pairs.get(vp.valid)?;
            if !pair.is_nominated || pair.state != CandidatePairState::Succeeded {
                return None;
            }
            if self.local_candidates[pair.local].component_id != component_id {
                return None;
            }
            let remote = &self.remote_candidates[pair.remote];
            Some((remote.addr.ip().to_string(), remote.addr.port()))
        })
    }

    // ---- Debug dumps (§6 "dump (debug)", §11) -----------------------------

    pub fn dump_candidates(&self) {
        for c in self.local_candidates.values() {
            log::debug!("local candidate: {c} foundation={} prio={}", c.foundation, c.priority);
        }
        for c in self.remote_candidates.values() {
            log::debug!("remote candidate: {c} foundation={} prio={}", c.foundation, c.priority);
        }
    }

    pub fn dump_candidate_pairs(&self) {
        for (id, pair) in &self.pairs {
            log::debug!("pair {id:?}: state={:?} priority={} nominated={}", pair.state, pair.priority, pair.is_nominated);
        }
    }

    pub fn dump_valid_list(&self) {
        for vp in &self.valid {
            log::debug!("valid pair: {:?} (from {:?})", vp.valid, vp.generated_from);
        }
    }

    pub fn dump_candidate_pairs_foundations(&self) {
        for (foundation, members) in &self.foundation_groups {
            log::debug!("foundation group {foundation:?}: {} members", members.len());
        }
    }

    pub fn dump_component_ids(&self) {
        log::debug!("component ids: {:?}", self.component_ids);
    }

    pub fn dump_triggered_checks_queue(&self) {
        log::debug!("triggered queue: {:?}", self.triggered);
    }

    pub fn dump_check_list(&self) {
        self.dump_candidates();
        self.dump_candidate_pairs();
        self.dump_valid_list();
        self.dump_candidate_pairs_foundations();
        self.dump_component_ids();
        self.dump_triggered_checks_queue();
    }
}

impl Default for CheckList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::CandidateKind;

    const LOCAL_UFRAG: &str = "localufrag01";
    const LOCAL_PWD: &str = "localpasswordlocalpassword1";
    const PEER_UFRAG: &str = "peerufrag01";
    const PEER_PWD: &str = "peerpasswordpeerpassword1";

    fn ctx() -> SessionContext<'static> {
        SessionContext {
            role: IceRole::Controlled,
            tie_breaker: 1,
            local_ufrag: LOCAL_UFRAG,
            local_pwd: LOCAL_PWD,
            max_connectivity_checks: 100,
            keepalive_timeout: Duration::from_secs(15),
        }
    }

    fn host_addr(ip: &str, port: u16) -> TransportAddress {
        TransportAddress::new(ip, port).unwrap()
    }

    /// §8 S2: an inbound Binding Request from an address not in the check
    /// list's remote candidate set discovers a peer-reflexive remote
    /// candidate and immediately schedules a triggered check for it.
    #[test]
    fn unlisted_source_becomes_peer_reflexive_candidate() {
        let mut cl = CheckList::new();
        let ctx = ctx();

        let local_id = cl
            .add_local_candidate(
                CandidateKind::Host,
                host_addr("10.0.0.1", 5000),
                1,
                None,
                ctx.role,
                ctx.max_connectivity_checks,
            )
            .unwrap();
        cl.compute_foundations();
        cl.set_remote_credentials(PEER_UFRAG, PEER_PWD).unwrap();

        assert_eq!(cl.remote_candidates.len(), 0);

        let tid = TransactionId::random();
        let request = stun::make_binding_request(
            tid,
            PEER_UFRAG,
            LOCAL_UFRAG,
            LOCAL_PWD,
            candidate_priority(CandidateKind::PeerReflexive, INITIAL_LOCAL_PREFERENCE, 1),
            IceRole::Controlling,
            99,
            false,
        );

        let pkt = ReceivedPkt {
            data: request,
            source: "10.0.0.2:7777".parse().unwrap(),
            destination: "10.0.0.1:5000".parse().unwrap(),
            component_id: 1,
        };

        let mut events = Vec::new();
        let now = Instant::now();
        cl.handle_stun_packet(now, &ctx, &pkt, &mut events);

        assert_eq!(cl.remote_candidates.len(), 1);
        let (remote_id, remote) = cl.remote_candidates.iter().next().unwrap();
        assert_eq!(remote.kind, CandidateKind::PeerReflexive);
        assert!(remote.foundation.starts_with('~'));
        assert_eq!(remote.addr, host_addr("10.0.0.2", 7777));

        let pair = cl
            .pairs
            .values()
            .find(|p| p.local == local_id && p.remote == remote_id)
            .expect("pair for the discovered candidate");
        assert_eq!(pair.state, CandidatePairState::Waiting);
        assert!(pair.wait_timeout);

        assert_eq!(events.len(), 1, "a success response must always be sent");
    }

    /// §8 S6: with two valid pairs for the same component at different
    /// priorities, regular nomination schedules exactly one triggered
    /// check, on the higher-priority pair.
    #[test]
    fn nomination_prefers_the_higher_priority_valid_pair() {
        let mut cl = CheckList::new();
        let ctx = SessionContext {
            role: IceRole::Controlling,
            ..ctx()
        };

        let local_a = cl
            .add_local_candidate(CandidateKind::Host, host_addr("10.0.0.1", 5000), 1, None, ctx.role, ctx.max_connectivity_checks)
            .unwrap();
        let local_b = cl
            .add_local_candidate(CandidateKind::Host, host_addr("10.0.0.1", 5001), 1, None, ctx.role, ctx.max_connectivity_checks)
            .unwrap();
        cl.compute_foundations();
        cl.set_remote_credentials(PEER_UFRAG, PEER_PWD).unwrap();

        let remote = cl
            .add_remote_candidate(
                CandidateKind::Host,
                host_addr("10.0.0.2", 6000),
                1,
                2130706431,
                "r1".into(),
                ctx.role,
                ctx.max_connectivity_checks,
            )
            .unwrap();

        // local_a was added first, so it keeps the higher local preference
        // (§4.1) and therefore the higher pair priority.
        let pair_hi = cl.find_or_insert_pair(local_a, remote, ctx.role);
        let pair_lo = cl.find_or_insert_pair(local_b, remote, ctx.role);
        assert!(cl.pairs[pair_hi].priority > cl.pairs[pair_lo].priority);

        cl.valid.push(ValidPair {
            valid: pair_hi,
            generated_from: pair_hi,
        });
        cl.valid.push(ValidPair {
            valid: pair_lo,
            generated_from: pair_lo,
        });

        let mut outcome = Outcome::default();
        cl.poll_nomination(&ctx, &mut outcome);

        assert!(cl.pairs[pair_hi].is_nominated);
        assert!(!cl.pairs[pair_lo].is_nominated);
        assert_eq!(cl.triggered.front(), Some(&pair_hi));
    }

    #[test]
    fn bad_integrity_request_gets_unauthorized_and_no_new_candidate() {
        let mut cl = CheckList::new();
        let ctx = ctx();

        cl.add_local_candidate(
            CandidateKind::Host,
            host_addr("10.0.0.1", 5000),
            1,
            None,
            ctx.role,
            ctx.max_connectivity_checks,
        )
        .unwrap();
        cl.set_remote_credentials(PEER_UFRAG, PEER_PWD).unwrap();

        let tid = TransactionId::random();
        let request = stun::make_binding_request(
            tid,
            PEER_UFRAG,
            LOCAL_UFRAG,
            "wrong-password-wrong-password",
            candidate_priority(CandidateKind::PeerReflexive, INITIAL_LOCAL_PREFERENCE, 1),
            IceRole::Controlling,
            99,
            false,
        );

        let pkt = ReceivedPkt {
            data: request,
            source: "10.0.0.2:7777".parse().unwrap(),
            destination: "10.0.0.1:5000".parse().unwrap(),
            component_id: 1,
        };

        let mut events = Vec::new();
        cl.handle_stun_packet(Instant::now(), &ctx, &pkt, &mut events);

        assert_eq!(events.len(), 1);
        assert_eq!(cl.remote_candidates.len(), 0);
    }
}
