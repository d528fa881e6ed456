//! Errors surfaced at the fallible accessor boundary.
//!
//! Internal protocol errors (failed STUN integrity, unknown
//! comprehension-required attributes, ...) are handled per RFC 5245 §7 by
//! dropping the offending packet and logging at `warn!`; they never reach
//! this type. `IceError` only covers invalid use of the external interface
//! surface (duplicate candidates, malformed credentials, ...), so that
//! nothing in this crate ever panics on caller-supplied input.

/// Errors returned by the external interface surface (`capi`, `CheckList`,
/// `IceSession` setters).
#[derive(Debug, thiserror::Error)]
pub enum IceError {
    #[error("a candidate with the same (type, base, address, component) already exists")]
    DuplicateCandidate,

    #[error("unknown candidate type {0:?}, expected one of host/srflx/prflx/relay")]
    UnknownCandidateType(String),

    #[error("component id {0} out of range, must be in [1, 256]")]
    InvalidComponentId(u16),

    #[error("ufrag must be at least 4 ASCII printable bytes")]
    InvalidUfrag,

    #[error("pwd must be at least 22 ASCII printable bytes")]
    InvalidPwd,

    #[error("max_connectivity_checks must be in [1, 255]")]
    InvalidMaxConnectivityChecks,

    #[error("keepalive_timeout must be in [1, 255]")]
    InvalidKeepaliveTimeout,

    #[error("check list index {0} out of range")]
    CheckListIndexOutOfRange(usize),

    #[error("referenced base candidate does not belong to this check list")]
    UnknownBaseCandidate,

    #[error("ip address must be at most 63 bytes")]
    IpTooLong,

    #[error("foundation must be at most 31 bytes")]
    FoundationTooLong,
}

pub(crate) fn is_ascii_printable(s: &str) -> bool {
    s.bytes().all(|b| (0x20..=0x7e).contains(&b))
}
