//! A lazily-connected outbound link to one peer.

use std::io::Write;
use std::net::TcpStream;

use log::debug;

/// Best-effort sender to one peer address.
///
/// The connection is opened on first use. A failed connect or write drops the link and the
/// message; the next send reconnects. Replication's heartbeat-driven retries absorb the loss.
pub struct Peer {
    addr: String,
    stream: Option<TcpStream>,
}

impl Peer {
    pub fn new(addr: String) -> Self {
        Self { addr, stream: None }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends one envelope line, appending the frame delimiter.
    pub fn send(&mut self, line: &str) {
        if self.stream.is_none() {
            match TcpStream::connect(&self.addr) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    self.stream = Some(stream);
                }
                Err(err) => {
                    debug!("cannot connect to {}: {}", self.addr, err);
                    return;
                }
            }
        }
        if let Some(stream) = &mut self.stream {
            let result = stream
                .write_all(line.as_bytes())
                .and_then(|()| stream.write_all(b"\n"));
            if let Err(err) = result {
                debug!("send to {} failed: {}", self.addr, err);
                self.stream = None;
            }
        }
    }
}
