//! Argument checkers.
//!
//! Every declared parameter of a command gets one checker at registration
//! time. At dispatch the checker sees the raw argument in its slot (`None`
//! for a missing trailing argument or a null bulk string) and either
//! produces a typed [`Arg`] or an error [`Reply`] that is sent back as is.

use crate::registry::RegistryError;
use crate::reply::Reply;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// Declared type of one command parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    /// Required byte string.
    Bytes,
    /// Byte string that may be missing.
    OptionalBytes,
    /// Required UTF-8 string.
    Str,
    /// Required signed integer.
    Int,
    /// Signed integer that may be missing.
    OptionalInt,
    /// Every remaining argument as byte strings. Must be the last parameter;
    /// its checker runs once per surplus argument.
    Rest,
    /// A checker looked up by name in the checker factory.
    Custom(&'static str),
}

/// A checked argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Nil,
    Bytes(Bytes),
    Str(String),
    Int(i64),
    Many(Vec<Bytes>),
}

pub type Checker = Arc<dyn Fn(Option<&Bytes>) -> Result<Arg, Reply> + Send + Sync>;

/// Builds checkers from declared parameter types.
pub trait CheckerFactory {
    fn checker(&self, command: &str, param: &ParamType) -> Result<Checker, RegistryError>;
}

/// The built-in checkers plus any named custom ones.
#[derive(Clone, Default)]
pub struct StandardCheckers {
    custom: HashMap<&'static str, Checker>,
}

impl StandardCheckers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a checker for `ParamType::Custom(name)`.
    pub fn with<F>(mut self, name: &'static str, check: F) -> Self
    where
        F: Fn(Option<&Bytes>) -> Result<Arg, Reply> + Send + Sync + 'static,
    {
        self.custom.insert(name, Arc::new(check));
        self
    }
}

impl CheckerFactory for StandardCheckers {
    fn checker(&self, command: &str, param: &ParamType) -> Result<Checker, RegistryError> {
        let checker: Checker = match param {
            ParamType::Bytes | ParamType::Rest => {
                Arc::new(|raw: Option<&Bytes>| required(raw).map(|b| Arg::Bytes(b.clone())))
            }
            ParamType::OptionalBytes => {
                Arc::new(|raw: Option<&Bytes>| Ok(raw.map_or(Arg::Nil, |b| Arg::Bytes(b.clone()))))
            }
            ParamType::Str => Arc::new(|raw: Option<&Bytes>| {
                let raw = required(raw)?;
                std::str::from_utf8(raw)
                    .map(|s| Arg::Str(s.to_string()))
                    .map_err(|_| Reply::error("invalid UTF-8 string"))
            }),
            ParamType::Int => Arc::new(|raw: Option<&Bytes>| integer(required(raw)?)),
            ParamType::OptionalInt => {
                Arc::new(|raw: Option<&Bytes>| raw.map_or(Ok(Arg::Nil), integer))
            }
            ParamType::Custom(name) => {
                self.custom
                    .get(name)
                    .cloned()
                    .ok_or_else(|| RegistryError::UnknownParamType {
                        command: command.to_string(),
                        param: (*name).to_string(),
                    })?
            }
        };
        Ok(checker)
    }
}

fn required(raw: Option<&Bytes>) -> Result<&Bytes, Reply> {
    raw.ok_or_else(Reply::wrong_number_of_arguments)
}

fn integer(raw: &Bytes) -> Result<Arg, Reply> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .map(Arg::Int)
        .ok_or_else(|| Reply::error("value is not an integer or out of range"))
}
