#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};

use rand_chacha::ChaChaRng;
use rand_core::{RngCore, SeedableRng};

use raft::core::State;
use raft::log::Log;
use raft::message::{
    LogEntry, LogIndex, Message, MessageId, Rpc, SendableMessage, ServerId, Term, VoteResponse,
};
use raft::node::Config;

pub const CONFIG: Config = Config {
    election_timeout_ticks: 10,
    heartbeat_interval_ticks: 3,
};
const RANDOM_SEED: u64 = 0;
const MAX_TICKS: u32 = 100_000;

pub type TestRaft = State<ChaChaRng>;

pub struct TestRaftGroup {
    pub nodes: Vec<TestRaft>,
    pub tick: u32,
    pub config: TestRaftGroupConfig,
}

#[derive(Clone, Default)]
pub struct TestRaftGroupConfig {
    pub drops: BTreeSet<(Option<ServerId>, Option<ServerId>)>,
    pub down: BTreeSet<ServerId>,
}

pub struct TestLogger;

pub struct TestLoggerContext {
    server_id: Option<ServerId>,
    tick: Option<u32>,
}

pub fn rpc_types() -> [Rpc; 4] {
    [
        Rpc::VoteRequest(Default::default()),
        Rpc::VoteResponse(Default::default()),
        Rpc::AppendRequest(Default::default()),
        Rpc::AppendResponse(Default::default()),
    ]
}

pub fn init_random() -> ChaChaRng {
    ChaChaRng::seed_from_u64(RANDOM_SEED)
}

pub fn entry(term: u64, data: &'static str) -> LogEntry {
    LogEntry {
        term: Term(term),
        data: data.into(),
    }
}

/// A server restored with the default durable triple.
pub fn raft(server_id: u64, peers: Vec<u64>, random: &mut impl RngCore) -> TestRaft {
    raft_with(server_id, peers, Term(0), None, Log::new(), random)
}

/// A server restored with an explicit durable triple, as if recovering from a crash.
pub fn raft_with(
    server_id: u64,
    peers: Vec<u64>,
    term: Term,
    voted_for: Option<u64>,
    log: Log,
    random: &mut impl RngCore,
) -> TestRaft {
    TestLogger::init();
    let mut state = State::new(
        ServerId(server_id),
        peers.into_iter().map(ServerId).collect(),
        ChaChaRng::seed_from_u64(random.next_u64()),
        CONFIG,
    );
    state.restore(term, voted_for.map(ServerId), log);
    state
}

pub fn config() -> TestRaftGroupConfig {
    TestRaftGroupConfig::default()
}

/// Feeds a fabricated request into a server. Requests carry the sender's ids, so any `msg_id`
/// will do; the reply echoes it.
pub fn send(raft: &mut TestRaft, from: u64, term: Term, rpc: Rpc) -> Option<SendableMessage> {
    raft.receive(
        Message {
            msg_id: MessageId(0),
            term,
            rpc,
        },
        ServerId(from),
    )
}

/// Answers a captured outbound request, echoing its correlation id from its destination.
pub fn respond(
    raft: &mut TestRaft,
    request: &SendableMessage,
    term: Term,
    rpc: Rpc,
) -> Option<SendableMessage> {
    raft.receive(
        Message {
            msg_id: request.message.msg_id,
            term,
            rpc,
        },
        request.to,
    )
}

pub fn grant_vote(raft: &mut TestRaft, request: &SendableMessage) -> Option<SendableMessage> {
    let term = request.message.term;
    respond(
        raft,
        request,
        term,
        Rpc::VoteResponse(VoteResponse { vote_granted: true }),
    )
}

pub fn deny_vote(raft: &mut TestRaft, request: &SendableMessage) -> Option<SendableMessage> {
    let term = request.message.term;
    respond(
        raft,
        request,
        term,
        Rpc::VoteResponse(VoteResponse {
            vote_granted: false,
        }),
    )
}

/// Flushes the pending leader sends of one server toward every peer.
pub fn append_entries<'a>(
    node: &'a mut TestRaft,
    peers: impl IntoIterator<Item = ServerId> + 'a,
) -> impl Iterator<Item = SendableMessage> + 'a {
    let server_id = node.server_id();
    peers.into_iter().flat_map(move |to| {
        if to != server_id {
            node.append_entries(to)
        } else {
            None
        }
    })
}

pub fn run_group<'a>(
    nodes: impl Iterator<Item = &'a mut TestRaft> + ExactSizeIterator,
    initial_messages: impl IntoIterator<Item = (ServerId, SendableMessage)>,
    start_tick: u32,
    ticks: Option<u32>,
    config: &TestRaftGroupConfig,
) {
    let mut nodes: Vec<_> = nodes.collect();
    let node_ids: Vec<_> = nodes.iter().map(|node| node.server_id()).collect();
    let mut messages = VecDeque::with_capacity(nodes.len() * nodes.len());
    messages.extend(initial_messages.into_iter());

    for tick in 0..ticks.unwrap_or(1) {
        TestLogger::set_tick(Some(start_tick + tick));
        if ticks.is_some() {
            for node in &mut nodes {
                let server_id = node.server_id();
                if !config.is_node_down(server_id) {
                    TestLogger::set_server_id(Some(server_id));
                    messages.extend(node.timer_tick().into_iter().map(|m| (server_id, m)));
                    messages.extend(
                        append_entries(node, node_ids.iter().cloned()).map(|m| (server_id, m)),
                    );
                }
            }
        }

        while let Some((from, sendable)) = messages.pop_front() {
            let to = sendable.to;
            let node = match nodes.iter_mut().find(|node| node.server_id() == to) {
                Some(node) => node,
                None => continue,
            };
            TestLogger::set_server_id(Some(to));
            if config.should_drop(from, to) {
                log::info!("<- {} DROPPED {}", from, sendable.message);
                continue;
            }
            log::info!("<- {} {}", from, sendable.message);
            messages.extend(node.receive(sendable.message, from).map(|m| (to, m)));
            messages.extend(append_entries(node, node_ids.iter().cloned()).map(|m| (to, m)));
        }
    }
    TestLogger::set_tick(None);
    TestLogger::set_server_id(None);
}

//
// TestRaftGroup impls
//

impl TestRaftGroup {
    /// A group of `size` servers with ids `1..=size`, each restored with the default triple.
    pub fn new(size: u64, random: &mut impl RngCore, config: TestRaftGroupConfig) -> Self {
        let ids: Vec<u64> = (1..=size).collect();
        Self {
            nodes: ids
                .iter()
                .map(|server_id| raft(*server_id, ids.clone(), random))
                .collect(),
            tick: 0,
            config,
        }
    }

    pub fn run_until(&mut self, mut until_fun: impl FnMut(&mut Self) -> bool) -> &mut Self {
        let mut ticks_remaining = MAX_TICKS;
        while !until_fun(self) {
            ticks_remaining = ticks_remaining
                .checked_sub(1)
                .expect("condition failed after maximum simulation length");
            self.tick += 1;
            run_group(self.nodes.iter_mut(), None, self.tick, Some(1), &self.config);
        }
        self
    }

    pub fn run_until_commit(&mut self, mut until_fun: impl FnMut(&LogEntry) -> bool) -> &mut Self {
        self.run_until(|group| {
            let result = group
                .take_committed()
                .any(|(_, commit)| !commit.data.is_empty() && until_fun(&commit));
            group.take_committed().for_each(drop);
            result
        })
    }

    pub fn run_for(&mut self, ticks: u32) -> &mut Self {
        self.run_for_inspect(ticks, |_| ())
    }

    pub fn run_for_inspect(&mut self, ticks: u32, mut fun: impl FnMut(&mut Self)) -> &mut Self {
        let mut ticks_remaining = ticks;
        while let Some(new_ticks_remaining) = ticks_remaining.checked_sub(1) {
            ticks_remaining = new_ticks_remaining;
            self.tick += 1;
            run_group(self.nodes.iter_mut(), None, self.tick, Some(1), &self.config);
            fun(self);
        }
        self
    }

    pub fn run_on_all(
        &mut self,
        mut fun: impl FnMut(&mut TestRaft) -> Vec<SendableMessage>,
    ) -> &mut Self {
        let messages = self
            .nodes
            .iter_mut()
            .flat_map(|node| {
                let server_id = node.server_id();
                fun(node).into_iter().map(move |m| (server_id, m))
            })
            .collect::<Vec<_>>();
        run_group(self.nodes.iter_mut(), messages, self.tick, None, &self.config);
        self
    }

    pub fn run_on_node(
        &mut self,
        node_idx: usize,
        fun: impl FnOnce(&mut TestRaft) -> Vec<SendableMessage>,
    ) -> &mut Self {
        let server_id = self.nodes[node_idx].server_id();
        let messages: Vec<_> = fun(&mut self.nodes[node_idx])
            .into_iter()
            .map(|m| (server_id, m))
            .collect();
        run_group(self.nodes.iter_mut(), messages, self.tick, None, &self.config);
        self
    }

    pub fn inspect(&mut self, fun: impl FnOnce(&Self)) -> &mut Self {
        fun(self);
        self
    }

    pub fn modify(&mut self, fun: impl FnOnce(&mut Self)) -> &mut Self {
        fun(self);
        self
    }

    pub fn take_committed(&mut self) -> impl Iterator<Item = (LogIndex, LogEntry)> + '_ {
        self.nodes.iter_mut().flat_map(|node| node.take_committed())
    }

    pub fn has_leader(&self) -> bool {
        self.nodes.iter().any(|node| node.is_leader())
    }

    pub fn leader_idx(&self) -> Option<usize> {
        self.nodes.iter().position(|node| node.is_leader())
    }
}

//
// TestRaftGroupConfig impls
//

impl TestRaftGroupConfig {
    pub fn node_down(mut self, server_id: u64) -> Self {
        self.down.insert(ServerId(server_id));
        self
    }

    pub fn isolate(mut self, server_id: u64) -> Self {
        self.drops.insert((Some(ServerId(server_id)), None));
        self.drops.insert((None, Some(ServerId(server_id))));
        self
    }

    pub fn drop_between(mut self, a: u64, b: u64) -> Self {
        self.drops.insert((Some(ServerId(a)), Some(ServerId(b))));
        self.drops.insert((Some(ServerId(b)), Some(ServerId(a))));
        self
    }

    pub fn drop_to(mut self, server_id: u64) -> Self {
        self.drops.insert((None, Some(ServerId(server_id))));
        self
    }

    pub fn is_node_down(&self, server_id: ServerId) -> bool {
        self.down.contains(&server_id)
    }

    pub fn should_drop(&self, from: ServerId, to: ServerId) -> bool {
        self.drops.contains(&(Some(from), Some(to)))
            || self.drops.contains(&(Some(from), None))
            || self.drops.contains(&(None, Some(to)))
            || self.down.contains(&from)
            || self.down.contains(&to)
    }
}

//
// TestLogger impls
//

thread_local! {
    static LOGGER_CONTEXT: RefCell<TestLoggerContext> = RefCell::new(TestLoggerContext::new());
}

impl TestLogger {
    pub fn init() {
        let _ignore = log::set_logger(&Self);
        log::set_max_level(log::LevelFilter::Debug);
    }
    pub fn set_server_id(server_id: Option<ServerId>) {
        LOGGER_CONTEXT.with(|context| {
            context.borrow_mut().server_id = server_id;
        });
    }
    pub fn set_tick(tick: Option<u32>) {
        LOGGER_CONTEXT.with(|context| {
            context.borrow_mut().tick = tick;
        });
    }
}

impl log::Log for TestLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        LOGGER_CONTEXT.with(|context| {
            let context = context.borrow();
            if let Some(server_id) = context.server_id {
                if let Some(tick) = context.tick {
                    eprintln!("tick {:03} {} {}", tick, server_id, record.args());
                } else {
                    eprintln!("tick ??? {} {}", server_id, record.args());
                }
            } else {
                eprintln!("{}", record.args());
            }
        })
    }

    fn flush(&self) {}
}

//
// TestLoggerContext impls
//

impl TestLoggerContext {
    const fn new() -> Self {
        Self {
            server_id: None,
            tick: None,
        }
    }
}
