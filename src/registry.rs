//! The command table.
//!
//! Built once from a [`Handler`]'s declared commands and never modified
//! afterwards. Lookups are case-insensitive. A single bad declaration fails
//! the whole build, so a partially registered handler is never served.

use crate::checker::{Arg, Checker, CheckerFactory, ParamType};
use crate::command::{CommandError, Invocation};
use crate::error::Result;
use crate::handler::Handler;
use crate::reply::{encode, Reply, Value};
use crate::request::Request;
use crate::session::Session;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("command name is empty")]
    EmptyName,

    #[error("command {0:?} is registered more than once")]
    Duplicate(String),

    #[error("command {command:?} has an invalid signature: {reason}")]
    InvalidSignature { command: String, reason: String },

    #[error("command {command:?} declares unknown parameter type {param:?}")]
    UnknownParamType { command: String, param: String },
}

type BoundFn =
    Box<dyn Fn(Invocation<'_>) -> std::result::Result<Option<Value>, CommandError> + Send + Sync>;

struct Entry {
    name: String,
    checkers: Vec<Checker>,
    rest: Option<Checker>,
    session: bool,
    invoke: BoundFn,
}

impl Entry {
    fn call(&self, request: &Request, session: &mut Session) -> Result<Reply> {
        let fixed = self.checkers.len();
        let supplied = request.args.len();
        if self.rest.is_none() && fixed < supplied {
            return Ok(Reply::wrong_number_of_arguments());
        }

        // Missing trailing arguments reach their checkers as `None`.
        let mut args = Vec::with_capacity(fixed + usize::from(self.rest.is_some()));
        for (i, check) in self.checkers.iter().enumerate() {
            match check(request.args.get(i).and_then(Option::as_ref)) {
                Ok(arg) => args.push(arg),
                Err(reply) => return Ok(reply),
            }
        }

        if let Some(check) = &self.rest {
            let surplus = request.args.get(fixed..).unwrap_or_default();
            let mut many = Vec::with_capacity(surplus.len());
            for raw in surplus {
                match check(raw.as_ref()) {
                    Ok(arg) => many.extend(arg_bytes(arg)),
                    Err(reply) => return Ok(reply),
                }
            }
            args.push(Arg::Many(many));
        }

        info!(target: "switchboard::audit", "{}", request.padded_monitor_line(fixed));

        let session = self.session.then_some(session);
        match (self.invoke)(Invocation::new(session, args)) {
            Err(e) => {
                debug!(command = %self.name, error = %e, "Command failed");
                Ok(Reply::error(e.to_string()))
            }
            Ok(None) => Ok(Reply::ok()),
            Ok(Some(value)) => encode(request, value),
        }
    }
}

fn arg_bytes(arg: Arg) -> Vec<Bytes> {
    match arg {
        Arg::Nil => vec![],
        Arg::Bytes(b) => vec![b],
        Arg::Str(s) => vec![Bytes::from(s)],
        Arg::Int(n) => vec![Bytes::from(n.to_string())],
        Arg::Many(items) => items,
    }
}

pub struct Registry {
    entries: HashMap<String, Entry>,
}

impl Registry {
    /// Build the table for `handler`, creating checkers with `factory`.
    ///
    /// Commands the handler shields are skipped. Any other command that
    /// cannot be registered aborts the build.
    pub fn build<H: Handler>(
        handler: &Arc<H>,
        factory: &dyn CheckerFactory,
    ) -> std::result::Result<Self, RegistryError> {
        let mut entries = HashMap::new();

        for command in handler.commands() {
            if command.name.is_empty() {
                return Err(RegistryError::EmptyName);
            }
            if handler.check_shield(&command.name) {
                debug!(command = %command.name, "Shielded");
                continue;
            }

            let key = command.name.to_ascii_lowercase();
            if entries.contains_key(&key) {
                return Err(RegistryError::Duplicate(command.name));
            }

            let mut checkers = Vec::with_capacity(command.params.len());
            let mut rest = None;
            for (i, param) in command.params.iter().enumerate() {
                if *param == ParamType::Rest && i + 1 != command.params.len() {
                    return Err(RegistryError::InvalidSignature {
                        command: command.name,
                        reason: "variadic parameter must come last".to_string(),
                    });
                }
                let checker = factory.checker(&command.name, param)?;
                if *param == ParamType::Rest {
                    rest = Some(checker);
                } else {
                    checkers.push(checker);
                }
            }

            let target = Arc::clone(handler);
            let invoke = command.invoke;
            debug!(command = %command.name, params = command.params.len(), "Registered");
            entries.insert(
                key,
                Entry {
                    name: command.name,
                    checkers,
                    rest,
                    session: command.session,
                    invoke: Box::new(move |call: Invocation<'_>| invoke(&*target, call)),
                },
            );
        }

        Ok(Self { entries })
    }

    /// Resolve and run the command named by `request`.
    ///
    /// Unknown names get the "method not supported" reply. The `Err` side
    /// only carries failures to encode a command's result.
    pub fn apply(&self, request: &Request, session: &mut Session) -> Result<Reply> {
        match self.entries.get(&request.name.to_ascii_lowercase()) {
            Some(entry) => entry.call(request, session),
            None => Ok(Reply::method_not_supported()),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered names, lowercased.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("Registry").field("commands", &names).finish()
    }
}
