//! Consensus core for a cluster of servers agreeing on a replicated log.
//!
//! Each server runs the same state machine over an ordered log of opaque command entries, staying
//! consistent through network delays, message loss, restarts, and minority failures. Optional
//! protocol extensions such as membership changes, snapshots, pre-voting, and leadership transfer
//! are not implemented.
//!
//! The state machine is pure: it performs no I/O and reads no clocks. A driver feeds it in three
//! ways:
//!
//! * When a message arrives from a peer: [`receive`](node::Node::receive) is called.
//! * Every time a fixed tick interval has elapsed: [`timer_tick`](node::Node::timer_tick) is
//!   called.
//! * When a client submits a command: [`propose`](node::Node::propose) is called.
//!
//! Each call mutates the server state and returns [messages](message::SendableMessage) for the
//! driver to deliver. Two contracts bind the driver: whenever
//! [`take_dirty`](node::Node::take_dirty) reports a durable change, the triple from
//! [`persistent_state`](node::Node::persistent_state) must reach stable storage before any of the
//! returned messages are sent; and calls for one server must never run concurrently. Committed
//! entries are handed to the application through
//! [`take_committed`](node::Node::take_committed).
//!
//! # Example
//!
//! ```
//! use raft::log::Log;
//! use raft::message::{SendableMessage, ServerId, Term};
//! use raft::node::{Config, Node};
//! use rand_chacha::ChaChaRng;
//! use rand_core::SeedableRng;
//! use std::collections::VecDeque;
//!
//! // Construct 3 servers
//! let mut servers: Vec<Node<ChaChaRng>> = (1..=3)
//!     .map(|id| {
//!         let mut node = Node::new(
//!             ServerId(id),
//!             (1..=3).map(ServerId).collect(),
//!             ChaChaRng::seed_from_u64(id),
//!             Config {
//!                 election_timeout_ticks: 10,
//!                 heartbeat_interval_ticks: 3,
//!             },
//!         );
//!         node.restore(Term(0), None, Log::new());
//!         node
//!     })
//!     .collect();
//!
//! // Simulate reliably delivering messages instantaneously between servers
//! let mut inboxes: Vec<VecDeque<_>> = vec![VecDeque::new(); servers.len()];
//! let route = |from: ServerId, sendable: SendableMessage, inboxes: &mut Vec<VecDeque<_>>| {
//!     inboxes[sendable.to.0 as usize - 1].push_back((from, sendable.message));
//! };
//!
//! // Loop until a command is committed on all servers
//! let mut proposed = false;
//! let mut committed = vec![false; servers.len()];
//! while !committed.iter().all(|seen| *seen) {
//!     for (index, server) in servers.iter_mut().enumerate() {
//!         let from = ServerId(index as u64 + 1);
//!         let new_messages: Vec<_> = server.timer_tick().collect();
//!         new_messages.into_iter().for_each(|m| route(from, m, &mut inboxes));
//!
//!         if !proposed && server.is_leader() {
//!             if let Ok((_, new_messages)) = server.propose("hello") {
//!                 let new_messages: Vec<_> = new_messages.collect();
//!                 new_messages.into_iter().for_each(|m| route(from, m, &mut inboxes));
//!                 proposed = true;
//!             }
//!         }
//!
//!         while let Some((src, message)) = inboxes[index].pop_front() {
//!             let new_messages: Vec<_> = server.receive(message, src).collect();
//!             new_messages.into_iter().for_each(|m| route(from, m, &mut inboxes));
//!         }
//!
//!         for (_, entry) in server.take_committed() {
//!             if !entry.data.is_empty() {
//!                 committed[index] = true;
//!             }
//!         }
//!     }
//! }
//! ```

#![no_std]
#![allow(unused_parens)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod core;
pub mod log;
pub mod message;
pub mod node;
