use std::path::Path;

use clap::{App, Arg};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use raft::message::{LogIndex, ServerId};
use raftd::config::{ClusterConfig, Timing};
use raftd::storage::file::FileStorage;
use raftd::{Error, Server, StateMachine};

/// Logs applied commands; stands in for a real application state machine.
struct AppliedLog;

impl StateMachine for AppliedLog {
    fn apply(&mut self, index: LogIndex, data: &[u8]) {
        info!("applied {}: {}", index, String::from_utf8_lossy(data));
    }
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("raftd: {}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Error> {
    let matches = App::new("raftd")
        .version("0.1.0")
        .about("A replicated-log consensus server.")
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("PATH")
                .required(true)
                .help("Location of the cluster topology file."),
        )
        .arg(
            Arg::with_name("id")
                .long("id")
                .value_name("SERVER_ID")
                .required(true)
                .help("This server's id within the cluster."),
        )
        .arg(
            Arg::with_name("data-dir")
                .long("data-dir")
                .value_name("PATH")
                .default_value(".")
                .help("Directory holding the durable state file."),
        )
        .get_matches();

    let config = ClusterConfig::from_file(Path::new(matches.value_of("config").unwrap()))?;
    let id: u64 = matches
        .value_of("id")
        .unwrap()
        .parse()
        .map_err(|err| Error::Config(format!("bad server id: {}", err)))?;
    let data_dir = Path::new(matches.value_of("data-dir").unwrap());

    let storage = FileStorage::from_name(data_dir, &format!("server-{}", id));
    let server = Server::new(
        &config,
        ServerId(id),
        Timing::default(),
        storage,
        AppliedLog,
        StdRng::from_entropy(),
    )?;
    server.run()
}
