//! The timer-driven loop that owns one server's consensus state machine.
//!
//! The loop serializes everything: inbound envelopes, timer ticks, and client submissions all
//! funnel through one thread, so exactly one handler transforms the state at a time. After every
//! state transition the durable triple is persisted *before* any resulting message leaves the
//! process, and freshly committed entries are handed to the application state machine in order.


use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use log::{debug, info};
use rand::RngCore;

use raft::message::{LogIndex, Message, SendableMessage, ServerId};
use raft::node::Node;

use crate::cluster::Transport;
use crate::config::{ClusterConfig, Timing};
use crate::error::Error;
use crate::protocol::WireError;
use crate::storage::{PersistedState, Storage};

/// The application the committed commands drive.
pub trait StateMachine: Send {
    /// Executes one committed command. Entries arrive in index order, each exactly once.
    fn apply(&mut self, index: LogIndex, data: &[u8]);
}

enum Control {
    Propose(Bytes, Sender<Result<LogIndex, Error>>),
    Stop,
}

/// A handle for submitting commands to a running server and stopping it.
#[derive(Clone)]
pub struct Handle {
    control: Sender<Control>,
}

/// One cluster server: the consensus core plus its storage, transport, and application.
pub struct Server<S, M, R> {
    server_id: ServerId,
    node: Node<R>,
    storage: S,
    machine: M,
    transport: Transport,
    timing: Timing,
    self_inbox: VecDeque<Message>,
    control: Receiver<Control>,
    control_sender: Sender<Control>,
}

impl<S, M, R> Server<S, M, R>
where
    S: Storage,
    M: StateMachine,
    R: RngCore,
{
    /// Wires up a server: binds its own address and prepares its consensus state, still booting.
    /// Nothing moves until [`run`](Self::run).
    pub fn new(
        config: &ClusterConfig,
        server_id: ServerId,
        timing: Timing,
        storage: S,
        machine: M,
        random: R,
    ) -> Result<Self, Error> {
        config.validate()?;
        let own = config
            .server(server_id)
            .ok_or_else(|| Error::Config(format!("{} is not in the cluster", server_id)))?;
        let peer_entries: Vec<_> = config.peer_entries(server_id).cloned().collect();
        let transport = Transport::start(own, &peer_entries)?;
        let node = Node::new(
            server_id,
            config.server_ids().collect(),
            random,
            timing.raft_config(),
        );
        let (control_sender, control) = unbounded();
        Ok(Self {
            server_id,
            node,
            storage,
            machine,
            transport,
            timing,
            self_inbox: VecDeque::new(),
            control,
            control_sender,
        })
    }

    /// A handle usable from any thread to submit commands or stop the loop.
    pub fn handle(&self) -> Handle {
        Handle {
            control: self.control_sender.clone(),
        }
    }

    /// The address this server accepts peer connections on.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.transport.local_addr()
    }

    /// Restores the durable triple and drives the server until stopped.
    ///
    /// # Errors
    ///
    /// Only stable storage failures end the loop: continuing past one would let in-memory state
    /// diverge from what a restart will see.
    pub fn run(mut self) -> Result<(), Error> {
        let recovered = self.storage.read()?;
        info!(
            "starting {} at {} with {} log entries",
            self.server_id,
            recovered.current_term,
            recovered.log.len()
        );
        self.node
            .restore(recovered.current_term, recovered.voted_for, recovered.log);

        let control = self.control.clone();
        let inbox = self.transport.inbox().clone();
        let mut next_tick = Instant::now() + self.timing.tick_interval;
        loop {
            self.drain_self_inbox()?;

            let timeout = next_tick.saturating_duration_since(Instant::now());
            select! {
                recv(control) -> request => match request {
                    Ok(Control::Propose(data, reply)) => self.propose(data, reply)?,
                    Ok(Control::Stop) | Err(_) => break,
                },
                recv(inbox) -> inbound => match inbound {
                    Ok((from, message)) => {
                        let outputs: Vec<_> = self.node.receive(message, from).collect();
                        self.sync_and_send(outputs)?;
                    }
                    Err(_) => break,
                },
                default(timeout) => {
                    let outputs: Vec<_> = self.node.timer_tick().collect();
                    self.sync_and_send(outputs)?;
                    next_tick = Instant::now() + self.timing.tick_interval;
                }
            }

            self.apply_committed();
        }
        info!("{} stopped", self.server_id);
        Ok(())
    }

    fn propose(&mut self, data: Bytes, reply: Sender<Result<LogIndex, Error>>) -> Result<(), Error> {
        if serde_json::from_slice::<serde_json::Value>(&data).is_err() {
            let _ = reply.send(Err(Error::Wire(WireError::BadPayload)));
            return Ok(());
        }
        let staged = match self.node.propose(data) {
            Ok((index, outputs)) => Ok((index, outputs.collect::<Vec<_>>())),
            Err(err) => Err(err),
        };
        match staged {
            Ok((index, outputs)) => {
                self.sync_and_send(outputs)?;
                let _ = reply.send(Ok(index));
            }
            Err(err) => {
                let _ = reply.send(Err(Error::Propose(err)));
            }
        }
        Ok(())
    }

    /// Messages this server addressed to itself take the in-process queue, under the same
    /// persist-before-send discipline as everything else.
    fn drain_self_inbox(&mut self) -> Result<(), Error> {
        while let Some(message) = self.self_inbox.pop_front() {
            let outputs: Vec<_> = self.node.receive(message, self.server_id).collect();
            self.sync_and_send(outputs)?;
        }
        Ok(())
    }

    /// Persists any durable change, then flushes messages in emission order. The write strictly
    /// precedes the sends: no message may reflect state a restart could lose.
    fn sync_and_send(&mut self, outputs: Vec<SendableMessage>) -> Result<(), Error> {
        if self.node.take_dirty() {
            let (current_term, voted_for, log) = self.node.persistent_state();
            let state = PersistedState {
                current_term,
                voted_for,
                log: log.clone(),
            };
            self.storage.write(&state)?;
        }
        for sendable in outputs {
            if sendable.to == self.server_id {
                self.self_inbox.push_back(sendable.message);
            } else {
                self.transport.send(self.server_id, &sendable);
            }
        }
        Ok(())
    }

    fn apply_committed(&mut self) {
        for (index, entry) in self.node.take_committed() {
            debug!("applying {}", index);
            self.machine.apply(index, &entry.data);
        }
    }
}

//
// Handle impls
//

impl Handle {
    /// Submits a command, returning the log index it was staged at.
    ///
    /// Staged is not committed: a leader change may still cancel the entry. `data` must be a
    /// JSON document, the one representation every server derives identical bytes from.
    pub fn propose(&self, data: Bytes) -> Result<LogIndex, Error> {
        let (reply, response) = bounded(1);
        self.control
            .send(Control::Propose(data, reply))
            .map_err(|_| Error::Stopped)?;
        match response.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::Stopped),
        }
    }

    /// Asks the server loop to exit after the current iteration.
    pub fn stop(&self) {
        let _ = self.control.send(Control::Stop);
    }
}
