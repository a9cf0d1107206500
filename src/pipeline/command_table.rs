//! Command metadata
//!
//! Built once, shared through an `Arc`, and handed to every pipeline and
//! client that needs to know where a command keeps its key or whether it
//! blocks server-side.

use std::collections::HashMap;

/// Where a command's first key sits among its arguments (name excluded)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPosition {
    /// No key: routed to any node
    Keyless,
    /// Fixed argument index
    At(usize),
    /// `EVAL script numkeys key...`: first key after the key count
    AfterNumKeys,
    /// `XREAD ... STREAMS key...`: first key after the STREAMS keyword
    AfterStreams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub key: KeyPosition,
    pub read_only: bool,
    /// Waits server-side for data; needs an unbounded read timeout
    pub blocking: bool,
}

impl CommandSpec {
    pub const fn read(key: KeyPosition) -> Self {
        Self {
            key,
            read_only: true,
            blocking: false,
        }
    }

    pub const fn write(key: KeyPosition) -> Self {
        Self {
            key,
            read_only: false,
            blocking: false,
        }
    }

    pub const fn blocking(key: KeyPosition) -> Self {
        Self {
            key,
            read_only: false,
            blocking: true,
        }
    }
}

/// Unknown commands are treated as writes keyed on their first argument
const DEFAULT_SPEC: CommandSpec = CommandSpec::write(KeyPosition::At(0));

/// Command name → metadata
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    commands: HashMap<String, CommandSpec>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the commands this crate knows about
    pub fn standard() -> Self {
        use KeyPosition::*;

        let mut table = Self::new();
        for name in [
            "GET", "MGET", "STRLEN", "GETRANGE", "EXISTS", "TTL", "PTTL", "TYPE", "HGET", "HMGET",
            "HGETALL", "HKEYS", "HVALS", "HLEN", "HEXISTS", "LRANGE", "LLEN", "LINDEX", "SMEMBERS",
            "SCARD", "SISMEMBER", "ZRANGE", "ZSCORE", "ZCARD", "ZRANK",
        ] {
            table.register(name, CommandSpec::read(At(0)));
        }
        for name in [
            "SET", "SETNX", "SETEX", "GETSET", "GETDEL", "APPEND", "INCR", "INCRBY", "DECR",
            "DECRBY", "DEL", "UNLINK", "EXPIRE", "PEXPIRE", "PERSIST", "LPUSH", "RPUSH", "LPOP",
            "RPOP", "LSET", "LREM", "LTRIM", "HSET", "HSETNX", "HDEL", "HINCRBY", "SADD", "SREM",
            "SPOP", "ZADD", "ZREM", "ZINCRBY",
        ] {
            table.register(name, CommandSpec::write(At(0)));
        }
        for name in ["BLPOP", "BRPOP", "BZPOPMIN", "BZPOPMAX", "BLMOVE"] {
            table.register(name, CommandSpec::blocking(At(0)));
        }
        for name in [
            "PING", "ECHO", "INFO", "DBSIZE", "CLUSTER", "CONFIG", "CLIENT", "COMMAND", "TIME",
            "RANDOMKEY", "FLUSHALL", "FLUSHDB", "SCRIPT",
        ] {
            table.register(name, CommandSpec::write(Keyless));
        }
        table.register("EVAL", CommandSpec::write(AfterNumKeys));
        table.register("EVALSHA", CommandSpec::write(AfterNumKeys));
        table.register("XREAD", CommandSpec::read(AfterStreams));
        table.register("XREADGROUP", CommandSpec::write(AfterStreams));
        table
    }

    /// Add or replace a command
    pub fn register(&mut self, name: &str, spec: CommandSpec) -> &mut Self {
        self.commands.insert(name.to_ascii_uppercase(), spec);
        self
    }

    /// Metadata for a command (case-insensitive); unknown commands get the default
    pub fn spec(&self, name: &[u8]) -> CommandSpec {
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();
        self.commands.get(&name).copied().unwrap_or(DEFAULT_SPEC)
    }

    pub fn is_known(&self, name: &[u8]) -> bool {
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();
        self.commands.contains_key(&name)
    }

    pub fn is_read_only(&self, name: &[u8]) -> bool {
        self.spec(name).read_only
    }

    /// Whether this invocation waits server-side
    ///
    /// Stream reads block only when `BLOCK` appears before `STREAMS`.
    pub fn blocks(&self, name: &[u8], args: &[&[u8]]) -> bool {
        let spec = self.spec(name);
        if spec.blocking {
            return true;
        }
        spec.key == KeyPosition::AfterStreams
            && args
                .iter()
                .take_while(|a| !a.eq_ignore_ascii_case(b"STREAMS"))
                .any(|a| a.eq_ignore_ascii_case(b"BLOCK"))
    }

    /// The routing key of a command, if it has one
    pub fn key_of<'a>(&self, name: &[u8], args: &[&'a [u8]]) -> Option<&'a [u8]> {
        match self.spec(name).key {
            KeyPosition::Keyless => None,
            KeyPosition::At(i) => args.get(i).copied(),
            KeyPosition::AfterNumKeys => {
                let numkeys: usize = std::str::from_utf8(args.get(1)?).ok()?.parse().ok()?;
                if numkeys == 0 {
                    return None;
                }
                args.get(2).copied()
            }
            KeyPosition::AfterStreams => args
                .iter()
                .position(|a| a.eq_ignore_ascii_case(b"STREAMS"))
                .and_then(|i| args.get(i + 1).copied()),
        }
    }
}
