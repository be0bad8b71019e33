//! A small in-memory key/value handler.
//!
//! Serves the binary and exercises every reply shape: status, bulk, nil,
//! integer, hash, ordered map, and the pub/sub sinks.

use crate::checker::ParamType;
use crate::command::{Command, CommandError, Invocation};
use crate::handler::Handler;
use crate::pubsub::Hub;
use crate::reply::{Reply, SeqMap, Value};
use crate::resp::Frame;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Db {
    strings: HashMap<Bytes, Bytes>,
    hashes: HashMap<Bytes, HashMap<String, Bytes>>,
}

impl Db {
    fn remove(&mut self, key: &Bytes) -> bool {
        let a = self.strings.remove(key).is_some();
        let b = self.hashes.remove(key).is_some();
        a || b
    }

    fn contains(&self, key: &Bytes) -> bool {
        self.strings.contains_key(key) || self.hashes.contains_key(key)
    }
}

pub struct KvHandler {
    dbs: Vec<RwLock<Db>>,
    hub: Arc<Hub>,
    shielded: Vec<String>,
}

impl KvHandler {
    pub fn new(hub: Arc<Hub>, databases: usize) -> Self {
        Self {
            dbs: (0..databases.max(1)).map(|_| RwLock::default()).collect(),
            hub,
            shielded: Vec::new(),
        }
    }

    /// Keep the named commands out of the registry.
    pub fn with_shielded<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shielded.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Database `index`; a session may hold one that does not exist.
    fn db(&self, index: usize) -> Result<&RwLock<Db>, CommandError> {
        self.dbs
            .get(index)
            .ok_or_else(|| CommandError::new("DB index is out of range"))
    }

    fn read(&self, call: &mut Invocation<'_>) -> Result<RwLockReadGuard<'_, Db>, CommandError> {
        let db = self.db(call.session()?.db())?;
        Ok(db.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write(&self, call: &mut Invocation<'_>) -> Result<RwLockWriteGuard<'_, Db>, CommandError> {
        let db = self.db(call.session()?.db())?;
        Ok(db.write().unwrap_or_else(PoisonError::into_inner))
    }

    fn ping(&self, call: Invocation<'_>) -> Result<Value, CommandError> {
        Ok(match call.opt_bytes(0)? {
            Some(message) => Value::Bytes(message),
            None => Reply::status("PONG").into(),
        })
    }

    fn set(&self, mut call: Invocation<'_>) -> Result<(), CommandError> {
        let (key, value) = (call.bytes(0)?, call.bytes(1)?);
        let mut db = self.write(&mut call)?;
        db.hashes.remove(&key);
        db.strings.insert(key, value);
        Ok(())
    }

    fn get(&self, mut call: Invocation<'_>) -> Result<Option<Bytes>, CommandError> {
        let key = call.bytes(0)?;
        let db = self.read(&mut call)?;
        if db.hashes.contains_key(&key) {
            return Err(wrong_type());
        }
        Ok(db.strings.get(&key).cloned())
    }

    fn del(&self, mut call: Invocation<'_>) -> Result<i64, CommandError> {
        let keys = keys(&call)?;
        let mut db = self.write(&mut call)?;
        Ok(keys.iter().filter(|key| db.remove(key)).count() as i64)
    }

    fn exists(&self, mut call: Invocation<'_>) -> Result<i64, CommandError> {
        let keys = keys(&call)?;
        let db = self.read(&mut call)?;
        Ok(keys.iter().filter(|key| db.contains(key)).count() as i64)
    }

    fn select(&self, mut call: Invocation<'_>) -> Result<(), CommandError> {
        let index = usize::try_from(call.int(0)?)
            .ok()
            .filter(|&i| i < self.dbs.len())
            .ok_or_else(|| CommandError::new("DB index is out of range"))?;
        call.session()?.select(index);
        Ok(())
    }

    fn hset(&self, mut call: Invocation<'_>) -> Result<i64, CommandError> {
        let (key, field, value) = (call.bytes(0)?, call.str(1)?.to_string(), call.bytes(2)?);
        let mut db = self.write(&mut call)?;
        if db.strings.contains_key(&key) {
            return Err(wrong_type());
        }
        let hash = db.hashes.entry(key).or_default();
        Ok(i64::from(hash.insert(field, value).is_none()))
    }

    fn hgetall(&self, mut call: Invocation<'_>) -> Result<HashMap<String, Bytes>, CommandError> {
        let key = call.bytes(0)?;
        let db = self.read(&mut call)?;
        if db.strings.contains_key(&key) {
            return Err(wrong_type());
        }
        Ok(db.hashes.get(&key).cloned().unwrap_or_default())
    }

    fn info(&self, mut call: Invocation<'_>) -> Result<SeqMap, CommandError> {
        let session = call.session()?;
        let keys = {
            let db = self
                .db(session.db())?
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            db.strings.len() + db.hashes.len()
        };

        Ok(SeqMap::new()
            .with("version", Frame::bulk(env!("CARGO_PKG_VERSION")))
            .with("host", Frame::bulk(session.host().to_string()))
            .with("connected_since", Frame::bulk(session.created_at().to_rfc3339()))
            .with("db", Frame::integer(session.db() as i64))
            .with("keys", Frame::integer(keys as i64))
            .with("subscribed", Frame::integer(i64::from(session.is_subscribed()))))
    }

    fn subscribe(&self, mut call: Invocation<'_>) -> Result<Reply, CommandError> {
        let channels = call.rest(0)?.to_vec();
        let session = call.session()?;
        if !channels.is_empty() {
            session.set_subscribed(true);
        }
        Ok(self.hub.subscribe(session.host(), channels))
    }

    fn publish(&self, call: Invocation<'_>) -> Result<i64, CommandError> {
        Ok(self.hub.publish(&call.bytes(0)?, call.bytes(1)?))
    }
}

fn keys(call: &Invocation<'_>) -> Result<Vec<Bytes>, CommandError> {
    let mut keys = vec![call.bytes(0)?];
    keys.extend_from_slice(call.rest(1)?);
    Ok(keys)
}

fn wrong_type() -> CommandError {
    CommandError::new("Operation against a key holding the wrong kind of value")
}

impl Handler for KvHandler {
    fn commands(&self) -> Vec<Command<Self>> {
        use ParamType::{Bytes as B, Int, OptionalBytes, Rest, Str};

        vec![
            Command::value("PING", Self::ping).arg(OptionalBytes),
            Command::value("ECHO", |_, call| call.bytes(0)).arg(B),
            Command::status("SET", Self::set).args([B, B]).with_session(),
            Command::value("GET", Self::get).arg(B).with_session(),
            Command::value("DEL", Self::del).args([B, Rest]).with_session(),
            Command::value("EXISTS", Self::exists).args([B, Rest]).with_session(),
            Command::status("SELECT", Self::select).arg(Int).with_session(),
            Command::value("HSET", Self::hset).args([B, Str, B]).with_session(),
            Command::value("HGETALL", Self::hgetall).arg(B).with_session(),
            Command::value("INFO", Self::info).with_session(),
            Command::value("SUBSCRIBE", Self::subscribe).arg(Rest).with_session(),
            Command::value("PUBLISH", Self::publish).args([B, B]),
        ]
    }

    fn check_shield(&self, name: &str) -> bool {
        self.shielded.iter().any(|s| s.eq_ignore_ascii_case(name))
    }

    fn clear_subscribe(&self, host: &str) {
        self.hub.clear_subscribe(host);
    }
}
