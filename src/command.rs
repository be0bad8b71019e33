//! Command declarations.
//!
//! A handler describes each command it serves with a [`Command`]: the name
//! clients use, the parameter types its checkers are built from, whether it
//! wants the connection's [`Session`], and the function to run. The function
//! always returns `Result<_, CommandError>`; a command built with
//! [`Command::status`] replies `+OK` on success, one built with
//! [`Command::value`] replies with its encoded value.

use crate::checker::{Arg, ParamType};
use crate::reply::Value;
use crate::session::Session;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Failure reported by command logic. Sent to the client as `-ERR <message>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CommandError(pub String);

impl CommandError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for CommandError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for CommandError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

pub(crate) type InvokeFn<H> =
    Box<dyn Fn(&H, Invocation<'_>) -> Result<Option<Value>, CommandError> + Send + Sync>;

pub struct Command<H> {
    pub(crate) name: String,
    pub(crate) params: Vec<ParamType>,
    pub(crate) session: bool,
    pub(crate) invoke: InvokeFn<H>,
}

impl<H: 'static> Command<H> {
    /// A command that only reports success or failure.
    pub fn status<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&H, Invocation<'_>) -> Result<(), CommandError> + Send + Sync + 'static,
    {
        Self::build(name.into(), Box::new(move |h: &H, call: Invocation<'_>| f(h, call).map(|()| None)))
    }

    /// A command that returns a value on success.
    pub fn value<F, T>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&H, Invocation<'_>) -> Result<T, CommandError> + Send + Sync + 'static,
        T: Into<Value>,
    {
        Self::build(
            name.into(),
            Box::new(move |h: &H, call: Invocation<'_>| f(h, call).map(|v| Some(v.into()))),
        )
    }

    fn build(name: String, invoke: InvokeFn<H>) -> Self {
        Self {
            name,
            params: Vec::new(),
            session: false,
            invoke,
        }
    }

    /// Declare the next parameter.
    pub fn arg(mut self, param: ParamType) -> Self {
        self.params.push(param);
        self
    }

    pub fn args(mut self, params: impl IntoIterator<Item = ParamType>) -> Self {
        self.params.extend(params);
        self
    }

    /// Pass the connection's session to the command. It does not count as
    /// an argument.
    pub fn with_session(mut self) -> Self {
        self.session = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ParamType] {
        &self.params
    }

    pub fn takes_session(&self) -> bool {
        self.session
    }
}

impl<H> fmt::Debug for Command<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// The checked arguments of one call, plus the session when requested.
pub struct Invocation<'a> {
    session: Option<&'a mut Session>,
    args: Vec<Arg>,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(session: Option<&'a mut Session>, args: Vec<Arg>) -> Self {
        Self { session, args }
    }

    pub fn session(&mut self) -> Result<&mut Session, CommandError> {
        self.session
            .as_deref_mut()
            .ok_or_else(|| CommandError::new("command does not take a session"))
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn arg(&self, index: usize) -> Option<&Arg> {
        self.args.get(index)
    }

    pub fn bytes(&self, index: usize) -> Result<Bytes, CommandError> {
        match self.args.get(index) {
            Some(Arg::Bytes(b)) => Ok(b.clone()),
            Some(Arg::Str(s)) => Ok(Bytes::from(s.clone())),
            other => Err(mismatch(index, "a byte string", other)),
        }
    }

    pub fn opt_bytes(&self, index: usize) -> Result<Option<Bytes>, CommandError> {
        match self.args.get(index) {
            Some(Arg::Nil) | None => Ok(None),
            _ => self.bytes(index).map(Some),
        }
    }

    pub fn str(&self, index: usize) -> Result<&str, CommandError> {
        match self.args.get(index) {
            Some(Arg::Str(s)) => Ok(s),
            other => Err(mismatch(index, "a string", other)),
        }
    }

    pub fn int(&self, index: usize) -> Result<i64, CommandError> {
        match self.args.get(index) {
            Some(Arg::Int(n)) => Ok(*n),
            other => Err(mismatch(index, "an integer", other)),
        }
    }

    pub fn opt_int(&self, index: usize) -> Result<Option<i64>, CommandError> {
        match self.args.get(index) {
            Some(Arg::Nil) | None => Ok(None),
            _ => self.int(index).map(Some),
        }
    }

    /// The variadic tail at `index`.
    pub fn rest(&self, index: usize) -> Result<&[Bytes], CommandError> {
        match self.args.get(index) {
            Some(Arg::Many(items)) => Ok(items),
            other => Err(mismatch(index, "a variadic argument", other)),
        }
    }
}

fn mismatch(index: usize, expected: &str, found: Option<&Arg>) -> CommandError {
    CommandError(format!(
        "argument {index} is not {expected} (found {found:?})"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    #[test]
    fn test_builder_records_signature() {
        let cmd: Command<Nothing> = Command::status("Set", |_, _| Ok(()))
            .arg(ParamType::Bytes)
            .arg(ParamType::Bytes);
        assert_eq!(cmd.name(), "Set");
        assert_eq!(cmd.params(), &[ParamType::Bytes, ParamType::Bytes]);
        assert!(!cmd.takes_session());

        let cmd: Command<Nothing> =
            Command::value("select", |_, _| Ok("x")).with_session();
        assert!(cmd.takes_session());
    }

    #[test]
    fn test_status_and_value_results() {
        let status: Command<Nothing> = Command::status("s", |_, _| Ok(()));
        assert!(matches!(
            (status.invoke)(&Nothing, Invocation::new(None, vec![])),
            Ok(None)
        ));

        let value: Command<Nothing> = Command::value("v", |_, call| call.int(0));
        assert!(matches!(
            (value.invoke)(&Nothing, Invocation::new(None, vec![Arg::Int(9)])),
            Ok(Some(Value::Int(9)))
        ));

        let failing: Command<Nothing> =
            Command::value("f", |_, _| Err::<i64, _>(CommandError::new("boom")));
        assert_eq!(
            (failing.invoke)(&Nothing, Invocation::new(None, vec![])).unwrap_err(),
            CommandError::new("boom")
        );
    }

    #[test]
    fn test_invocation_accessors() {
        let mut call = Invocation::new(
            None,
            vec![
                Arg::Bytes(Bytes::from_static(b"k")),
                Arg::Nil,
                Arg::Many(vec![Bytes::from_static(b"a")]),
            ],
        );
        assert_eq!(call.bytes(0).unwrap(), Bytes::from_static(b"k"));
        assert_eq!(call.opt_bytes(1).unwrap(), None);
        assert_eq!(call.rest(2).unwrap().len(), 1);
        assert!(call.int(0).is_err());
        assert!(call.session().is_err());
    }
}
