//! TCP plumbing between cluster servers.
//!
//! Envelopes travel as single lines of JSON. Inbound connections are accepted on the server's
//! own address and read on a small thread pool; every decoded message funnels into one channel
//! the driver drains, preserving per-connection arrival order. Outbound links are lazy and
//! best-effort: a failed send counts as message loss, which the consensus layer tolerates.


pub mod peer;

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Error as IoError, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};

use raft::message::{Message, SendableMessage, ServerId};

use crate::config::ServerEntry;
use crate::error::Error;
use crate::protocol;

use self::peer::Peer;

/// The network face of one server: a listener feeding an inbox, and one outbound link per peer.
pub struct Transport {
    peers: HashMap<ServerId, Peer>,
    inbox: Receiver<(ServerId, Message)>,
    local_addr: SocketAddr,
}

impl Transport {
    /// Binds the server's own address and prepares lazy connections to every peer.
    pub fn start(own: &ServerEntry, peers: &[ServerEntry]) -> Result<Self, Error> {
        let (sender, inbox) = unbounded();
        let local_addr = listen(&own.addr(), sender)?;
        let peers = peers
            .iter()
            .map(|entry| (ServerId(entry.id), Peer::new(entry.addr())))
            .collect();
        Ok(Self {
            peers,
            inbox,
            local_addr,
        })
    }

    /// The messages decoded off inbound connections.
    pub fn inbox(&self) -> &Receiver<(ServerId, Message)> {
        &self.inbox
    }

    /// The address the listener actually bound; differs from the configured one when port 0 was
    /// requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Encodes and sends one message, treating every failure as message loss.
    pub fn send(&mut self, from: ServerId, sendable: &SendableMessage) {
        let peer = match self.peers.get_mut(&sendable.to) {
            Some(peer) => peer,
            None => {
                warn!("no route to {}", sendable.to);
                return;
            }
        };
        match protocol::encode(&sendable.message, from) {
            Ok(line) => peer.send(&line),
            Err(err) => warn!("cannot encode message to {}: {}", sendable.to, err),
        }
    }
}

fn listen(addr: &str, sender: Sender<(ServerId, Message)>) -> Result<SocketAddr, Error> {
    let listener = TcpListener::bind(addr)?;
    let local_addr = listener.local_addr()?;
    let thread_pool = rayon::ThreadPoolBuilder::new()
        .thread_name(|_| "peer reader".to_string())
        .num_threads(4)
        .build()
        .map_err(|err| IoError::new(ErrorKind::Other, err.to_string()))?;

    let _ = thread::spawn(move || {
        info!("listening on {}", local_addr);
        for stream in listener.incoming() {
            match stream {
                Ok(tcp_stream) => {
                    let sender = sender.clone();
                    thread_pool.spawn(move || read_connection(tcp_stream, sender));
                }
                Err(err) => {
                    warn!("accept on {} failed: {}", local_addr, err);
                    break;
                }
            }
        }
    });
    Ok(local_addr)
}

fn read_connection(stream: TcpStream, sender: Sender<(ServerId, Message)>) {
    let peer_addr = match stream.peer_addr() {
        Ok(addr) => addr.to_string(),
        Err(_) => "unknown".to_string(),
    };
    debug!("connection from {}", peer_addr);

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => match protocol::decode(line.trim_end()) {
                Ok((from, message)) => {
                    if sender.send((from, message)).is_err() {
                        break;
                    }
                }
                Err(err) => warn!("dropped malformed envelope from {}: {}", peer_addr, err),
            },
            Err(err) => {
                debug!("read from {} failed: {}", peer_addr, err);
                break;
            }
        }
    }
    debug!("connection from {} closed", peer_addr);
}
