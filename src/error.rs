use crate::config::ConfigError;
use crate::registry::RegistryError;
use crate::resp::ReadError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("fail to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Registration failed: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error("Unsupported type: {rendered} ({kind})")]
    UnsupportedType { rendered: String, kind: &'static str },

    #[error("Stop server timeout")]
    StopTimeout,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
