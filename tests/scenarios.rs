//! End-to-end scenarios from `spec.md` §8, driven through the public
//! `IceSession` surface with an in-memory loopback harness shaped like the
//! teacher crate's own `tests/self_test.rs` (`poll_agent`/`feed_agent_events`):
//! both agents are ticked, every outbound packet is handed straight to the
//! peer, and responses are drained until neither side has anything left to
//! send for the current tick.

use std::mem::take;
use std::time::{Duration, Instant};

use ice_session::{CandidateKind, IceEvent, IceRole, IceSession, IceSessionState, ReceivedPkt, TransportAddress};

/// RFC 5245's canonical host-candidate priority for component 1
/// (`126<<24 | 65535<<8 | (256-1)`), used whenever a test needs to hand a
/// remote host candidate's priority to `add_remote_candidate` directly
/// (the value a real peer would have put on the wire in its SDP).
const HOST_PRIORITY_COMPONENT_1: u32 = 2_130_706_431;

fn add_host_pair(
    a: &mut IceSession,
    b: &mut IceSession,
    a_ufrag: &str,
    a_pwd: &str,
    b_ufrag: &str,
    b_pwd: &str,
    a_addr: &str,
    a_port: u16,
    b_addr: &str,
    b_port: u16,
) {
    a.set_local_credentials(a_ufrag, a_pwd).unwrap();
    b.set_local_credentials(b_ufrag, b_pwd).unwrap();

    a.add_check_list();
    b.add_check_list();

    a.check_list_mut(0).unwrap().set_remote_credentials(b_ufrag, b_pwd).unwrap();
    b.check_list_mut(0).unwrap().set_remote_credentials(a_ufrag, a_pwd).unwrap();

    a.add_local_candidate(0, CandidateKind::Host, TransportAddress::new(a_addr, a_port).unwrap(), 1, None)
        .unwrap();
    b.add_local_candidate(0, CandidateKind::Host, TransportAddress::new(b_addr, b_port).unwrap(), 1, None)
        .unwrap();

    a.add_remote_candidate(
        0,
        CandidateKind::Host,
        TransportAddress::new(b_addr, b_port).unwrap(),
        1,
        HOST_PRIORITY_COMPONENT_1,
        "1".into(),
    )
    .unwrap();
    b.add_remote_candidate(
        0,
        CandidateKind::Host,
        TransportAddress::new(a_addr, a_port).unwrap(),
        1,
        HOST_PRIORITY_COMPONENT_1,
        "1".into(),
    )
    .unwrap();

    a.compute_candidates_foundations();
    a.choose_default_candidates();
    b.compute_candidates_foundations();
    b.choose_default_candidates();
}

fn to_pkt(ev: IceEvent) -> ReceivedPkt {
    ReceivedPkt {
        data: ev.data,
        source: ev.source,
        destination: ev.target,
        component_id: ev.component_id,
    }
}

/// One tick: poll both agents, then keep handing each side's outbound
/// packets to the other (and the responses those generate) until nothing
/// is left in flight.
fn tick(a: &mut IceSession, b: &mut IceSession, now: Instant) {
    let mut to_b: Vec<ReceivedPkt> = a.poll(now).into_iter().map(to_pkt).collect();
    let mut to_a: Vec<ReceivedPkt> = b.poll(now).into_iter().map(to_pkt).collect();

    while !to_a.is_empty() || !to_b.is_empty() {
        for pkt in take(&mut to_b) {
            if let Ok(events) = b.receive(now, 0, pkt) {
                to_a.extend(events.into_iter().map(to_pkt));
            }
        }
        for pkt in take(&mut to_a) {
            if let Ok(events) = a.receive(now, 0, pkt) {
                to_b.extend(events.into_iter().map(to_pkt));
            }
        }
    }
}

fn run_until<F: Fn(&IceSession, &IceSession) -> bool>(a: &mut IceSession, b: &mut IceSession, done: F) -> Instant {
    let mut now = Instant::now();
    for _ in 0..2_000 {
        if done(a, b) {
            return now;
        }
        tick(a, b, now);
        now += Duration::from_millis(20);
    }
    panic!("scenario did not converge within the iteration budget");
}

/// §8 S1: two host-only agents complete and each resolves the other's
/// address through `get_remote_addr_and_ports_from_valid_pairs`.
#[test]
fn s1_host_only_happy_path() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut a = IceSession::new(IceRole::Controlling);
    let mut b = IceSession::new(IceRole::Controlled);

    add_host_pair(
        &mut a,
        &mut b,
        "aufrag01",
        "apasswordapasswordapassword",
        "bufrag01",
        "bpasswordbpasswordbpassword",
        "10.0.0.1",
        5000,
        "10.0.0.2",
        6000,
    );

    run_until(&mut a, &mut b, |a, b| {
        a.state() == IceSessionState::Completed && b.state() == IceSessionState::Completed
    });

    assert_eq!(a.state(), IceSessionState::Completed);
    assert_eq!(b.state(), IceSessionState::Completed);

    let (ip, rtp_port, rtcp_port) = a
        .check_list(0)
        .unwrap()
        .remote_addr_and_ports()
        .expect("controlling side has a nominated route");
    assert_eq!((ip.as_str(), rtp_port, rtcp_port), ("10.0.0.2", 6000, 0));

    let (ip, rtp_port, rtcp_port) = b
        .check_list(0)
        .unwrap()
        .remote_addr_and_ports()
        .expect("controlled side has a nominated route");
    assert_eq!((ip.as_str(), rtp_port, rtcp_port), ("10.0.0.1", 5000, 0));
}

/// §8 S3: both agents start Controlling; the one with the smaller
/// tie-breaker loses the conflict and switches to Controlled, and the
/// session still completes.
#[test]
fn s3_simultaneous_controlling_resolves_via_tie_breaker() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut a = IceSession::new(IceRole::Controlling);
    let mut b = IceSession::new(IceRole::Controlling);

    add_host_pair(
        &mut a,
        &mut b,
        "aufrag01",
        "apasswordapasswordapassword",
        "bufrag01",
        "bpasswordbpasswordbpassword",
        "10.0.0.1",
        5000,
        "10.0.0.2",
        6000,
    );

    run_until(&mut a, &mut b, |a, b| {
        a.state() == IceSessionState::Completed && b.state() == IceSessionState::Completed
    });

    // Exactly one side switched: the one with the smaller tie-breaker.
    let (smaller, larger) = if a.tie_breaker() < b.tie_breaker() {
        (a.role(), b.role())
    } else {
        (b.role(), a.role())
    };
    assert_eq!(smaller, IceRole::Controlled, "smaller tie-breaker must lose the conflict");
    assert_eq!(larger, IceRole::Controlling, "larger tie-breaker keeps its role");
}

/// §8 S5: a pair with no reachable peer exhausts its retransmission budget
/// and fails; with only one pair for the only component, the check list
/// (and session) fail too.
#[test]
fn s5_retransmission_timeout_fails_the_check_list() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut a = IceSession::new(IceRole::Controlling);
    a.add_check_list();
    a.check_list_mut(0)
        .unwrap()
        .set_remote_credentials("peerufrag1", "peerpasswordpeerpasswordpeer")
        .unwrap();

    a.add_local_candidate(0, CandidateKind::Host, TransportAddress::new("10.0.0.1", 5000).unwrap(), 1, None)
        .unwrap();
    // A remote candidate at an address nothing ever answers on.
    a.add_remote_candidate(
        0,
        CandidateKind::Host,
        TransportAddress::new("10.0.0.9", 9999).unwrap(),
        1,
        HOST_PRIORITY_COMPONENT_1,
        "1".into(),
    )
    .unwrap();

    a.compute_candidates_foundations();
    a.choose_default_candidates();

    let mut now = Instant::now();
    for _ in 0..4_000 {
        let _ = a.poll(now);
        if a.check_list(0).unwrap().state() != ice_session::CheckListState::Running {
            break;
        }
        now += Duration::from_millis(50);
    }

    assert_eq!(a.check_list(0).unwrap().state(), ice_session::CheckListState::Failed);
    assert_eq!(a.state(), IceSessionState::Failed);
}
