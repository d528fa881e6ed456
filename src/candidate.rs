//! The candidate value type (§3) and its arena keys.

use std::fmt;

use slotmap::new_key_type;

use crate::addr::TransportAddress;

new_key_type! {
    /// Key into a [`CheckList`](crate::checklist::CheckList)'s local candidate arena.
    pub struct LocalCandidateId;
    /// Key into a [`CheckList`](crate::checklist::CheckList)'s remote candidate arena.
    pub struct RemoteCandidateId;
}

/// RFC 5245 §4.1.1.1 candidate types. `Relayed` is carried in the data
/// model (§3) even though this crate does not gather relayed candidates
/// itself (TURN allocation management is a Non-goal, §1) — nothing stops a
/// caller from inserting one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relayed,
}

impl CandidateKind {
    /// RFC 5245 §4.1.2.1 type preference.
    pub(crate) fn type_preference(self) -> u32 {
        match self {
            CandidateKind::Host => 126,
            CandidateKind::PeerReflexive => 110,
            CandidateKind::ServerReflexive => 100,
            CandidateKind::Relayed => 0,
        }
    }

    /// RFC 5245 §4.1.4 "likely to work" ordering used by
    /// `choose_default_candidates` (§4.1, the Open Question resolved in
    /// `DESIGN.md`): higher is more likely to work and so preferred as the
    /// default. `PeerReflexive` is never chosen as a default.
    pub(crate) fn default_rank(self) -> u32 {
        match self {
            CandidateKind::Relayed => 3,
            CandidateKind::ServerReflexive => 2,
            CandidateKind::Host => 1,
            CandidateKind::PeerReflexive => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::Relayed => "relay",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "host" => Some(CandidateKind::Host),
            "srflx" => Some(CandidateKind::ServerReflexive),
            "prflx" => Some(CandidateKind::PeerReflexive),
            "relay" => Some(CandidateKind::Relayed),
            _ => None,
        }
    }
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One candidate, local or remote, owned by a check list's arena (§3).
#[derive(Debug, Clone)]
pub struct Candidate<Base> {
    pub foundation: String,
    pub addr: TransportAddress,
    pub kind: CandidateKind,
    pub priority: u32,
    pub component_id: u16,
    /// The candidate that is this candidate's base. Self for `Host`.
    pub base: Base,
    pub is_default: bool,
}

pub type LocalCandidate = Candidate<LocalCandidateId>;

/// Remote candidates have no local base of their own; they are only ever
/// paired against a local candidate's base, so there is nothing for `base`
/// to point to within the remote arena. We still keep the field (mirroring
/// the source's `struct _IceCandidate *base` on every candidate) so display
/// and foundation-grouping code can treat local/remote candidates
/// uniformly; for remote candidates it is always `None`.
pub type RemoteCandidate = Candidate<Option<RemoteCandidateId>>;

impl<Base> fmt::Display for Candidate<Base> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.addr)
    }
}
