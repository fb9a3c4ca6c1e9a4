extern crate bincode;
extern crate env_logger;
#[macro_use]
extern crate log;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate thiserror;

pub mod configurations;
pub mod error;
pub mod front_end;
pub mod message;
pub mod peer_registry;
pub mod replica;
pub mod replication;
pub mod rpc;
pub mod store;
