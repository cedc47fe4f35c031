use common::*;
use raft::log::Log;
use raft::message::{LogIndex, Rpc, ServerId, Term, VoteRequest};
use raft::node::{Config, ProposeError};

mod common;

use rand_chacha::ChaChaRng;
use rand_core::SeedableRng;

use raft::core::State;

fn vote_request(candidate_id: u64, last: (u64, u64)) -> Rpc {
    Rpc::VoteRequest(VoteRequest {
        candidate_id: ServerId(candidate_id),
        last_log_idx: LogIndex(last.0),
        last_log_term: Term(last.1),
    })
}

#[test]
pub fn booting_is_inert() {
    let mut state: State<ChaChaRng> = State::new(
        ServerId(1),
        vec![ServerId(2), ServerId(3)].into_iter().collect(),
        ChaChaRng::seed_from_u64(0),
        Config {
            election_timeout_ticks: 10,
            heartbeat_interval_ticks: 3,
        },
    );

    assert!(state.timer_tick().is_empty());
    assert!(state.timeout().is_empty());
    assert_eq!(state.propose("x".into()), Err(ProposeError::Booting));
    assert!(send(&mut state, 2, Term(1), vote_request(2, (0, 0))).is_none());
    assert_eq!(state.leader(), (None, Term(0)));
}

#[test]
pub fn restore_enters_follower() {
    let log = Log::from_entries(vec![entry(2, "a"), entry(4, "b")]);
    let raft = raft_with(1, vec![7, 9], Term(4), Some(7), log, &mut init_random());

    assert!(!raft.is_leader());
    assert_eq!(raft.current_term(), Term(4));
    assert_eq!(raft.voted_for(), Some(ServerId(7)));
    assert_eq!(raft.log().len(), LogIndex(2));
    assert_eq!(raft.commit_idx(), LogIndex(0));
    assert_eq!(raft.last_applied(), LogIndex(0));
}

#[test]
pub fn restore_only_happens_once() {
    let log = Log::from_entries(vec![entry(2, "a")]);
    let mut raft = raft_with(1, vec![2], Term(4), Some(2), log, &mut init_random());

    raft.restore(Term(9), None, Log::new());
    assert_eq!(raft.current_term(), Term(4));
    assert_eq!(raft.log().len(), LogIndex(1));
}

#[test]
pub fn recovered_vote_still_binds() {
    // a restart must not allow a second grant in the same term
    let log = Log::from_entries(vec![entry(2, "a"), entry(4, "b")]);
    let mut raft = raft_with(1, vec![7, 9], Term(4), Some(7), log, &mut init_random());

    let reply = send(&mut raft, 9, Term(4), vote_request(9, (2, 4))).unwrap();
    assert!(matches!(
        reply.message.rpc,
        Rpc::VoteResponse(raft::message::VoteResponse { vote_granted: false })
    ));
    assert_eq!(raft.voted_for(), Some(ServerId(7)));

    let reply = send(&mut raft, 7, Term(4), vote_request(7, (2, 4))).unwrap();
    assert!(matches!(
        reply.message.rpc,
        Rpc::VoteResponse(raft::message::VoteResponse { vote_granted: true })
    ));
}

#[test]
pub fn outdated_candidate_denied_after_term_bump() {
    let log = Log::from_entries(vec![entry(1, "a"), entry(2, "b")]);
    let mut raft = raft_with(1, vec![9], Term(2), None, log, &mut init_random());

    // the prelude adopts term 3 and clears the vote, but the up-to-date rule still denies
    let reply = send(&mut raft, 9, Term(3), vote_request(9, (2, 1))).unwrap();
    assert_eq!(reply.message.term, Term(3));
    assert!(matches!(
        reply.message.rpc,
        Rpc::VoteResponse(raft::message::VoteResponse { vote_granted: false })
    ));
    assert_eq!(raft.current_term(), Term(3));
    assert_eq!(raft.voted_for(), None);
}

#[test]
pub fn durable_changes_raise_the_dirty_flag() {
    let mut raft = raft(1, vec![2], &mut init_random());
    assert!(!raft.take_dirty());

    // volatile activity alone stays clean
    raft.timer_tick();
    assert!(!raft.take_dirty());

    // an election changes term and vote
    raft.timeout();
    assert!(raft.take_dirty());
    assert!(!raft.take_dirty());

    // adopting a higher term is durable
    send(
        &mut raft,
        2,
        Term(9),
        Rpc::AppendRequest(Default::default()),
    );
    assert!(raft.take_dirty());

    // an append is durable; the duplicate delivery after it is not
    let log_append = |raft: &mut TestRaft| {
        send(
            raft,
            2,
            Term(9),
            Rpc::AppendRequest(raft::message::AppendRequest {
                leader_id: ServerId(2),
                prev_log_idx: LogIndex(0),
                prev_log_term: Term(0),
                entries: vec![entry(9, "x")],
                leader_commit: LogIndex(0),
            }),
        )
    };
    log_append(&mut raft);
    assert!(raft.take_dirty());
    log_append(&mut raft);
    assert!(!raft.take_dirty());

    // a granted vote is durable
    send(&mut raft, 2, Term(10), vote_request(2, (5, 9)));
    assert!(raft.take_dirty());
}
