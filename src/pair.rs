//! Candidate pairs, pair state and the foundation-grouping key (§3, §4.1).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use slotmap::new_key_type;
use stun_types::TransactionId;

use crate::candidate::{LocalCandidateId, RemoteCandidateId};
use crate::role::IceRole;

new_key_type! {
    /// Key into a [`CheckList`](crate::checklist::CheckList)'s pair arena.
    /// Stable across the pair's lifetime so the valid list and the
    /// triggered-check queue can reference pairs without holding borrows.
    pub struct PairId;
}

/// RFC 5245 §5.7.4 candidate pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePairState {
    /// Grouped with other pairs sharing a foundation; only one pair per
    /// foundation group starts out `Waiting`, the rest start `Frozen`.
    Frozen,
    /// Eligible to be checked; not yet sent.
    Waiting,
    /// A check has been sent and a response is outstanding.
    InProgress,
    /// The most recent check for this pair produced a success response
    /// with symmetric source/destination addresses.
    Succeeded,
    /// The retransmission budget was exhausted, or a non-487 error
    /// response was received, or an asymmetric response was received.
    Failed,
}

/// One `(local candidate, remote candidate)` tuple under connectivity
/// testing, per §3's `CandidatePair`.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub local: LocalCandidateId,
    pub remote: RemoteCandidateId,
    pub state: CandidatePairState,
    /// RFC 5245 §5.7.2 pair priority; recomputed on every role switch.
    pub priority: u64,

    /// Transaction id of the in-flight (or most recently sent) check.
    pub tid: Option<TransactionId>,
    pub tx_time: Option<Instant>,
    pub rto: Duration,
    pub retransmissions: u8,
    /// Source/destination the most recent check was sent from/to, recorded
    /// so the matching success response can be checked for symmetry (§7.1.3.1:
    /// the response must come from the address the request was sent to, and
    /// be addressed back to the address it was sent from).
    pub sent_source: Option<SocketAddr>,
    pub sent_target: Option<SocketAddr>,
    /// The role this agent held at the time the in-flight check was sent.
    pub role_at_send: Option<IceRole>,
    /// The PRIORITY attribute value most recently sent for this pair,
    /// reused verbatim as a peer-reflexive candidate's priority if the
    /// response reveals one (§4.3: "priority = the PRIORITY attribute
    /// previously sent").
    pub last_sent_priority: Option<u32>,

    pub is_default: bool,
    /// Nominated by this agent (Controlling) or confirmed via a received
    /// USE-CANDIDATE (Controlled).
    pub is_nominated: bool,
    /// Set when a triggered check must use a fresh transaction id on
    /// retransmit rather than resending the original request (§4.2).
    pub wait_timeout: bool,
    /// Whether the most recent inbound Binding Request for this pair
    /// carried USE-CANDIDATE (§4.3). Recorded even while the pair hasn't
    /// succeeded yet, so a Controlled agent still nominates it once its own
    /// check later succeeds, instead of only acting on USE-CANDIDATE seen
    /// while the pair was already `Succeeded`.
    pub received_use_candidate: bool,
}

impl CandidatePair {
    pub(crate) fn new(local: LocalCandidateId, remote: RemoteCandidateId, priority: u64) -> Self {
        Self {
            local,
            remote,
            state: CandidatePairState::Frozen,
            priority,
            tid: None,
            tx_time: None,
            rto: Duration::ZERO,
            retransmissions: 0,
            sent_source: None,
            sent_target: None,
            role_at_send: None,
            last_sent_priority: None,
            is_default: false,
            is_nominated: false,
            wait_timeout: false,
            received_use_candidate: false,
        }
    }
}

/// `(local_foundation, remote_foundation)`, the grouping key used by the
/// freeze/unfreeze algorithm (RFC 5245 §5.7.4, §7.1.3.2.3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairFoundation {
    pub local: String,
    pub remote: String,
}

/// A pair that has produced (or stands in for) a successful connectivity
/// check. Kept distinct from the owning pair because a successful check
/// can synthesize a peer-reflexive pair that never appeared in the
/// original check list (§3).
#[derive(Debug, Clone, Copy)]
pub struct ValidPair {
    pub valid: PairId,
    pub generated_from: PairId,
}
