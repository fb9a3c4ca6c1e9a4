//! Starts one replica. Run as:
//!     RUST_LOG=kvpaxos=info cargo run --bin kvpaxos-server -- \
//!         "my_addr:127.0.0.1:8001 my_paxos:127.0.0.1:9001 fail_rate:0.1 \
//!          replica:127.0.0.1:9001 replica:127.0.0.1:9002 replica:127.0.0.1:9003"
//!
//! The single positional argument is the `key:value` configuration record
//! parsed by `kvpaxos::configurations::ReplicaConfig`.

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate kvpaxos;

use std::env;
use std::thread;

use kvpaxos::configurations::ReplicaConfig;
use kvpaxos::replica::Replica;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Expected exactly one argument: the key:value configuration record");
        std::process::exit(1);
    }

    let config = match ReplicaConfig::parse(&args[1]) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error parsing configuration: {}", e);
            std::process::exit(1);
        }
    };

    let replica = Replica::new(config, None);
    if let Err(e) = replica.serve() {
        eprintln!("Error binding listeners: {}", e);
        std::process::exit(1);
    }

    match replica.initialize() {
        Ok(()) => info!("replica initialized"),
        Err(e) => warn!("initialization failed, continuing to serve anyway: {}", e),
    }

    loop {
        thread::park();
    }
}
