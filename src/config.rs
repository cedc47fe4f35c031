//! Cluster configuration.
//!
//! The topology is one JSON document identical on every server at startup; a server finds its
//! own identity by matching a startup parameter against the `servers` list. Timing knobs live
//! beside it and must also be identical across the cluster.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use raft::message::ServerId;
use raft::node::Config as RaftConfig;

use crate::error::Error;

/// The address of one network endpoint.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// One server of the cluster.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServerEntry {
    pub id: u64,
    pub host: String,
    pub port: u16,
}

/// The cluster topology: the client-facing endpoint and every server's identity and address.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ClusterConfig {
    pub client: Endpoint,
    pub servers: Vec<ServerEntry>,
}

/// Timing knobs for the driver.
///
/// The defaults randomize election timeouts over 150–300 ms with 45 ms heartbeats, keeping the
/// heartbeat interval well below the minimum election timeout and the timeout well above a
/// loopback round trip.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Timing {
    /// How much wall-clock time one timer tick represents.
    pub tick_interval: Duration,

    /// The minimum number of ticks before an election timeout fires.
    pub election_timeout_ticks: u32,

    /// The number of ticks between leader heartbeats.
    pub heartbeat_interval_ticks: u32,
}

impl ClusterConfig {
    /// Reads and validates the topology document at `path`.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("cannot read {}: {}", path.display(), err)))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|err| Error::Config(format!("cannot parse {}: {}", path.display(), err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.servers.is_empty() {
            return Err(Error::Config("no servers in the cluster".to_string()));
        }
        for (index, server) in self.servers.iter().enumerate() {
            if self.servers[..index].iter().any(|other| other.id == server.id) {
                return Err(Error::Config(format!("duplicate server id {}", server.id)));
            }
        }
        Ok(())
    }

    /// The entry describing the server with the given id.
    pub fn server(&self, id: ServerId) -> Option<&ServerEntry> {
        self.servers.iter().find(|server| server.id == id.0)
    }

    /// Every server id in the cluster, own id included.
    pub fn server_ids(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.servers.iter().map(|server| ServerId(server.id))
    }

    /// The entries for every server except `own`.
    pub fn peer_entries(&self, own: ServerId) -> impl Iterator<Item = &ServerEntry> {
        self.servers.iter().filter(move |server| server.id != own.0)
    }
}

impl ServerEntry {
    /// The `host:port` string the server listens on.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Timing {
    /// The tick counts handed to the consensus core.
    pub fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            election_timeout_ticks: self.election_timeout_ticks,
            heartbeat_interval_ticks: self.heartbeat_interval_ticks,
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(15),
            election_timeout_ticks: 10,
            heartbeat_interval_ticks: 3,
        }
    }
}
