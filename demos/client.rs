//! An interactive client REPL. Run as:
//!     RUST_LOG=kvpaxos=info cargo run --bin kvpaxos-client -- 127.0.0.1:8001
//!
//! Reads commands from standard input in a loop, matching
//! `examples/start_client.rs`'s `read!()`-driven style: `get <key>`,
//! `put <key> <value>`, `delete <key>`, or `quit`.

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate kvpaxos;
#[macro_use]
extern crate text_io;

use std::env;
use std::io;
use std::io::prelude::*;
use std::net::SocketAddr;
use std::time::Duration;

use kvpaxos::message::{FrontEndRequest, FrontEndResponse};
use kvpaxos::rpc::RpcClient;

const CLIENT_DEADLINE: Duration = Duration::from_secs(5);

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Expected exactly one argument: the front-end address to connect to");
        std::process::exit(1);
    }

    let address: SocketAddr = match args[1].parse() {
        Ok(address) => address,
        Err(_) => {
            eprintln!("Not a valid socket address: {}", args[1]);
            std::process::exit(1);
        }
    };
    let stub = RpcClient::new(address);

    loop {
        print!("kvpaxos> ");
        io::stdout().flush().ok().expect("Could not flush stdout");

        let line: String = read!("{}\n");
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.splitn(3, ' ');
        let command = parts.next().unwrap_or("");

        let request = match command {
            "get" => match parts.next() {
                Some(key) => FrontEndRequest::Get { key: key.to_string() },
                None => {
                    eprintln!("usage: get <key>");
                    continue;
                }
            },
            "put" => match (parts.next(), parts.next()) {
                (Some(key), Some(value)) => FrontEndRequest::Put {
                    key: key.to_string(),
                    value: value.to_string(),
                },
                _ => {
                    eprintln!("usage: put <key> <value>");
                    continue;
                }
            },
            "delete" => match parts.next() {
                Some(key) => FrontEndRequest::Delete { key: key.to_string() },
                None => {
                    eprintln!("usage: delete <key>");
                    continue;
                }
            },
            "quit" | "exit" => break,
            _ => {
                eprintln!("unknown command {:?}, expected get/put/delete/quit", command);
                continue;
            }
        };

        match stub.call::<FrontEndRequest, FrontEndResponse>(&request, CLIENT_DEADLINE) {
            Ok(FrontEndResponse::Value { value }) => println!("{}", value),
            Ok(FrontEndResponse::Empty) => println!("OK"),
            Err(e) => {
                warn!("request failed: {}", e);
                println!("ERROR: {}", e);
            }
        }
    }
}
