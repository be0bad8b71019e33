//! switchboard: a Redis-protocol command-dispatch server.
//!
//! A [`Handler`] declares its commands once; the [`Server`] turns them into
//! a case-insensitive [`Registry`], accepts TCP or Unix-socket connections
//! and runs one request loop per connection. Command results are encoded
//! into [`Reply`] values, including pub/sub sinks that keep streaming to
//! the subscriber after the first response.
//!
//! Modules:
//! - `resp`: wire frames and request decoding
//! - `checker`, `command`, `registry`: declaring and dispatching commands
//! - `reply`, `pubsub`: reply variants and streaming sinks
//! - `server`, `session`, `drain`: connection lifecycle and graceful stop
//! - `config`, `demo`: what the binary runs

pub mod checker;
pub mod command;
pub mod config;
pub mod demo;
pub mod drain;
pub mod error;
pub mod handler;
pub mod pubsub;
pub mod registry;
pub mod reply;
pub mod request;
pub mod resp;
pub mod server;
pub mod session;

pub use checker::{Arg, CheckerFactory, ParamType, StandardCheckers};
pub use command::{Command, CommandError, Invocation};
pub use drain::DrainManager;
pub use error::{Error, Result};
pub use handler::Handler;
pub use registry::{Registry, RegistryError};
pub use reply::{Reply, SeqMap, Value};
pub use request::Request;
pub use server::{Listener, Server};
pub use session::Session;
