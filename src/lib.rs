#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

pub mod encoding;
pub mod error;
pub mod kv;
pub mod raft;

pub use error::{Error, Result};
pub use raft::{Client, Server};
