//! Thin glue between the engine and the external STUN wire codec
//! (`ezk-stun-types`). The engine never hand-rolls STUN bytes; every
//! message the state machine needs to build or read goes through one of
//! the functions below. This module is private, mirroring how the crate
//! this engine was grounded on keeps its own STUN glue as a private `mod
//! stun`.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;

use stun_types::{
    attributes::{
        ErrorCode, Fingerprint, IceControlled, IceControlling, MessageIntegrity,
        MessageIntegrityKey, Priority, UseCandidate, Username, XorMappedAddress,
    },
    Class, Message, MessageBuilder, Method, TransactionId,
};

use crate::role::IceRole;

/// RFC 5245 §7.1.3.1 / RFC 5389 default retransmission schedule. The
/// spec's default first RTO is 500ms, doubling on each retransmit, capped
/// at 7 attempts total.
pub(crate) const INITIAL_RTO: Duration = Duration::from_millis(500);
pub(crate) const MAX_RETRANSMITS: u8 = 7;
/// Ceiling applied to the doubling RTO so a single pair can't block the
/// rest of the check list for minutes; matches the cap commonly used by
/// other ICE implementations (see `DESIGN.md`).
pub(crate) const MAX_RTO: Duration = Duration::from_secs(8);

pub(crate) fn next_rto(current: Duration) -> Duration {
    std::cmp::min(current * 2, MAX_RTO)
}

/// Role conflict error code (RFC 5245 §7.1.3.3).
pub(crate) const ERROR_ROLE_CONFLICT: u16 = 487;
pub(crate) const ERROR_BAD_REQUEST: u16 = 400;
pub(crate) const ERROR_UNAUTHORIZED: u16 = 401;

fn username(ufrag_first: &str, ufrag_second: &str) -> String {
    format!("{ufrag_first}:{ufrag_second}")
}

/// Build a Binding Request per §4.2: `USERNAME = remote_ufrag:local_ufrag`,
/// `MESSAGE-INTEGRITY` keyed by the remote (responder's) password,
/// `PRIORITY` as if the sending candidate were peer-reflexive,
/// `ICE-CONTROLLING`/`ICE-CONTROLLED`, and `USE-CANDIDATE` only when asked.
#[allow(clippy::too_many_arguments)]
pub(crate) fn make_binding_request(
    tid: TransactionId,
    local_ufrag: &str,
    remote_ufrag: &str,
    remote_pwd: &str,
    peer_reflexive_priority: u32,
    role: IceRole,
    tie_breaker: u64,
    use_candidate: bool,
) -> Vec<u8> {
    let mut msg = MessageBuilder::new(Class::Request, Method::Binding, tid);

    msg.add_attr(&Username::new(&username(remote_ufrag, local_ufrag)))
        .unwrap();
    msg.add_attr(&Priority(peer_reflexive_priority)).unwrap();

    match role {
        IceRole::Controlling => msg.add_attr(&IceControlling(tie_breaker)).unwrap(),
        IceRole::Controlled => msg.add_attr(&IceControlled(tie_breaker)).unwrap(),
    }

    if use_candidate {
        msg.add_attr(&UseCandidate).unwrap();
    }

    msg.add_attr_with(
        &MessageIntegrity::default(),
        &MessageIntegrityKey::new_raw(Cow::Borrowed(remote_pwd.as_bytes())),
    )
    .unwrap();

    msg.add_attr(&Fingerprint).unwrap();

    msg.finish()
}

/// Build a Binding Success response echoing `tid`, per §4.3: `XOR-MAPPED-
/// ADDRESS` set to the request's source address, `MESSAGE-INTEGRITY` keyed
/// by our own (the responder's) local password.
pub(crate) fn make_success_response(tid: TransactionId, local_pwd: &str, source: SocketAddr) -> Vec<u8> {
    let mut msg = MessageBuilder::new(Class::Success, Method::Binding, tid);

    msg.add_attr(&XorMappedAddress(source)).unwrap();

    msg.add_attr_with(
        &MessageIntegrity::default(),
        &MessageIntegrityKey::new_raw(Cow::Borrowed(local_pwd.as_bytes())),
    )
    .unwrap();

    msg.add_attr(&Fingerprint).unwrap();

    msg.finish()
}

/// Build a 487 (Role Conflict) error response carrying our new role's
/// tie-breaker attribute, per §4.3.
pub(crate) fn make_role_conflict_error(
    tid: TransactionId,
    local_pwd: &str,
    new_role: IceRole,
    tie_breaker: u64,
) -> Vec<u8> {
    let mut msg = MessageBuilder::new(Class::Error, Method::Binding, tid);

    msg.add_attr(&ErrorCode {
        number: ERROR_ROLE_CONFLICT,
        reason: "Role Conflict".into(),
    })
    .unwrap();

    match new_role {
        IceRole::Controlling => msg.add_attr(&IceControlling(tie_breaker)).unwrap(),
        IceRole::Controlled => msg.add_attr(&IceControlled(tie_breaker)).unwrap(),
    }

    msg.add_attr_with(
        &MessageIntegrity::default(),
        &MessageIntegrityKey::new_raw(Cow::Borrowed(local_pwd.as_bytes())),
    )
    .unwrap();

    msg.add_attr(&Fingerprint).unwrap();

    msg.finish()
}

/// Build a 400/401 error response for a request that failed validation
/// (§4.3, §7). No integrity is added since we may not have validated the
/// sender's credentials at all (e.g. bad username).
pub(crate) fn make_generic_error(tid: TransactionId, number: u16, reason: &str) -> Vec<u8> {
    let mut msg = MessageBuilder::new(Class::Error, Method::Binding, tid);

    msg.add_attr(&ErrorCode {
        number,
        reason: reason.into(),
    })
    .unwrap();

    msg.finish()
}

/// Build a Binding Indication used for keepalives (§4.5). No integrity is
/// required for indications.
pub(crate) fn make_keepalive_indication(tid: TransactionId) -> Vec<u8> {
    let mut msg = MessageBuilder::new(Class::Indication, Method::Binding, tid);
    msg.add_attr(&Fingerprint).unwrap();
    msg.finish()
}

/// Parse raw bytes into a STUN message, discarding anything that fails the
/// FINGERPRINT check (§4, "nothing in the engine panics": malformed input
/// is just dropped).
pub(crate) fn parse(data: Vec<u8>) -> Option<Message> {
    let mut msg = Message::parse(data).ok()?;

    let passed_fingerprint = msg.attribute::<Fingerprint>().is_some_and(|r| r.is_ok());
    if !passed_fingerprint {
        return None;
    }

    Some(msg)
}

/// Verify `MESSAGE-INTEGRITY` and `USERNAME` on a received Binding Request,
/// per §4.3: the expected username is `local_ufrag:remote_ufrag` and the
/// key is our own local password (we are the responder).
pub(crate) fn verify_request(local_ufrag: &str, local_pwd: &str, remote_ufrag: &str, msg: &mut Message) -> bool {
    let integrity_ok = msg
        .attribute_with::<MessageIntegrity>(&MessageIntegrityKey::new_raw(Cow::Borrowed(
            local_pwd.as_bytes(),
        )))
        .is_some_and(|r| r.is_ok());

    let Some(Ok(got_username)) = msg.attribute::<Username>() else {
        return false;
    };

    integrity_ok && got_username.0 == username(local_ufrag, remote_ufrag)
}

/// Verify `MESSAGE-INTEGRITY` on a received Binding Success/Error response,
/// keyed by the remote (peer's) password since the peer signed it with its
/// own local password.
pub(crate) fn verify_response(remote_pwd: &str, msg: &mut Message) -> bool {
    msg.attribute_with::<MessageIntegrity>(&MessageIntegrityKey::new_raw(Cow::Borrowed(
        remote_pwd.as_bytes(),
    )))
    .is_some_and(|r| r.is_ok())
}

pub(crate) fn class(msg: &Message) -> Class {
    msg.class()
}

pub(crate) fn transaction_id(msg: &Message) -> TransactionId {
    msg.transaction_id()
}

pub(crate) fn priority_attr(msg: &mut Message) -> Option<u32> {
    msg.attribute::<Priority>().and_then(|r| r.ok()).map(|p| p.0)
}

pub(crate) fn use_candidate_attr(msg: &mut Message) -> bool {
    msg.attribute::<UseCandidate>().is_some()
}

pub(crate) fn ice_controlling_attr(msg: &mut Message) -> Option<u64> {
    msg.attribute::<IceControlling>().and_then(|r| r.ok()).map(|a| a.0)
}

pub(crate) fn ice_controlled_attr(msg: &mut Message) -> Option<u64> {
    msg.attribute::<IceControlled>().and_then(|r| r.ok()).map(|a| a.0)
}

pub(crate) fn error_code_attr(msg: &mut Message) -> Option<u16> {
    msg.attribute::<ErrorCode>().and_then(|r| r.ok()).map(|e| e.number)
}

pub(crate) fn xor_mapped_address_attr(msg: &mut Message) -> Option<SocketAddr> {
    msg.attribute::<XorMappedAddress>().and_then(|r| r.ok()).map(|a| a.0)
}
