//! Pure priority and pair-priority formulas (RFC 5245 §4.1.2.1, §5.7.2).
//!
//! Kept separate from `candidate`/`pair` so the arithmetic invariants
//! (§8 property 1) can be exercised directly without touching a check
//! list's arenas.

use std::cmp::{max, min};

use crate::candidate::CandidateKind;

/// The local preference a check list assigns to the first candidate of a
/// given kind, before any per-kind decrements for uniqueness (§4.1).
pub(crate) const INITIAL_LOCAL_PREFERENCE: u32 = 65535;

/// RFC 5245 §4.1.2.1:
/// `priority = (2^24)*type_preference + (2^8)*local_preference + (256 - component_id)`
pub(crate) fn candidate_priority(kind: CandidateKind, local_preference: u32, component_id: u16) -> u32 {
    debug_assert!((1..=256).contains(&component_id));

    (1u32 << 24) * kind.type_preference()
        + (1u32 << 8) * local_preference
        + (256 - component_id as u32)
}

/// RFC 5245 §5.7.2: `priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)`
/// where G is the controlling agent's candidate priority and D is the
/// controlled agent's.
pub(crate) fn pair_priority(local_priority: u32, remote_priority: u32, is_controlling: bool) -> u64 {
    let (g, d) = if is_controlling {
        (local_priority as u64, remote_priority as u64)
    } else {
        (remote_priority as u64, local_priority as u64)
    };

    (1u64 << 32) * min(g, d) + 2 * max(g, d) + u64::from(g > d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_beats_server_reflexive_beats_relayed() {
        let host = candidate_priority(CandidateKind::Host, INITIAL_LOCAL_PREFERENCE, 1);
        let srflx = candidate_priority(CandidateKind::ServerReflexive, INITIAL_LOCAL_PREFERENCE, 1);
        let relay = candidate_priority(CandidateKind::Relayed, INITIAL_LOCAL_PREFERENCE, 1);
        assert!(host > srflx);
        assert!(srflx > relay);
    }

    #[test]
    fn component_id_breaks_ties_within_a_kind() {
        let rtp = candidate_priority(CandidateKind::Host, INITIAL_LOCAL_PREFERENCE, 1);
        let rtcp = candidate_priority(CandidateKind::Host, INITIAL_LOCAL_PREFERENCE, 2);
        assert!(rtp > rtcp);
    }

    #[test]
    fn pair_priority_is_symmetric_up_to_the_role_tiebreak_bit() {
        let a = pair_priority(100, 200, true);
        let b = pair_priority(200, 100, false);
        assert_eq!(a, b);
    }

    #[test]
    fn pair_priority_favors_controlling_candidate_in_low_bit() {
        let higher_local = pair_priority(200, 100, true);
        let higher_remote = pair_priority(100, 200, true);
        // Same (min, max) pair, but G>D differs, so the low bit differs.
        assert_eq!(higher_local - 1, higher_remote);
    }
}
