//! Command families
//!
//! Each family is a capability trait with default methods written against
//! the single `Queue` primitive, and blanket-implemented for every `Queue`.
//! `ClusterPipeline` queues into a batch; `ClusterClient` runs each call
//! straight away and hands back an already-resolved `Response`.

use std::collections::HashMap;

use super::builders;
use super::response::{Builder, Reply, Response};
use crate::utils::{ClientError, Result};

/// Core primitive: route by `key` and queue `name args...`
pub trait Queue {
    fn queue<T>(
        &mut self,
        name: &[u8],
        key: &[u8],
        args: &[&[u8]],
        builder: Builder<T>,
    ) -> Result<Response<T>>
    where
        T: Clone + Into<Reply> + Send + 'static;
}

fn as_slices<V: AsRef<[u8]>>(values: &[V]) -> Vec<&[u8]> {
    values.iter().map(|v| v.as_ref()).collect()
}

fn first_key<'a>(command: &str, keys: &[&'a [u8]]) -> Result<&'a [u8]> {
    keys.first()
        .copied()
        .ok_or_else(|| ClientError::PipelineState(format!("{} requires at least one key", command)))
}

/// String commands
pub trait StringCommands: Queue {
    fn get(&mut self, key: impl AsRef<[u8]>) -> Result<Response<Option<Vec<u8>>>> {
        let key = key.as_ref();
        self.queue(b"GET", key, &[key], builders::optional_bytes)
    }

    fn set(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<Response<()>> {
        let key = key.as_ref();
        self.queue(b"SET", key, &[key, value.as_ref()], builders::status_ok)
    }

    fn incr(&mut self, key: impl AsRef<[u8]>) -> Result<Response<i64>> {
        let key = key.as_ref();
        self.queue(b"INCR", key, &[key], builders::integer)
    }

    fn incr_by(&mut self, key: impl AsRef<[u8]>, by: i64) -> Result<Response<i64>> {
        let key = key.as_ref();
        let mut buf = itoa::Buffer::new();
        let by = buf.format(by);
        self.queue(b"INCRBY", key, &[key, by.as_bytes()], builders::integer)
    }

    fn append(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<Response<i64>> {
        let key = key.as_ref();
        self.queue(b"APPEND", key, &[key, value.as_ref()], builders::integer)
    }

    fn strlen(&mut self, key: impl AsRef<[u8]>) -> Result<Response<i64>> {
        let key = key.as_ref();
        self.queue(b"STRLEN", key, &[key], builders::integer)
    }

    /// All keys must hash to the same slot
    fn mget<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> Result<Response<Vec<Option<Vec<u8>>>>> {
        let keys = as_slices(keys);
        let key = first_key("MGET", &keys)?;
        self.queue(b"MGET", key, &keys, builders::optional_bytes_list)
    }
}

/// Generic key commands
pub trait KeyCommands: Queue {
    /// All keys must hash to the same slot
    fn del<K: AsRef<[u8]>>(&mut self, keys: &[K]) -> Result<Response<i64>> {
        let keys = as_slices(keys);
        let key = first_key("DEL", &keys)?;
        self.queue(b"DEL", key, &keys, builders::integer)
    }

    fn exists(&mut self, key: impl AsRef<[u8]>) -> Result<Response<bool>> {
        let key = key.as_ref();
        self.queue(b"EXISTS", key, &[key], builders::boolean)
    }

    fn expire(&mut self, key: impl AsRef<[u8]>, seconds: u64) -> Result<Response<bool>> {
        let key = key.as_ref();
        let mut buf = itoa::Buffer::new();
        let seconds = buf.format(seconds);
        self.queue(b"EXPIRE", key, &[key, seconds.as_bytes()], builders::boolean)
    }

    fn ttl(&mut self, key: impl AsRef<[u8]>) -> Result<Response<i64>> {
        let key = key.as_ref();
        self.queue(b"TTL", key, &[key], builders::integer)
    }

    fn key_type(&mut self, key: impl AsRef<[u8]>) -> Result<Response<String>> {
        let key = key.as_ref();
        self.queue(b"TYPE", key, &[key], builders::status)
    }
}

/// List commands
pub trait ListCommands: Queue {
    fn lpush<V: AsRef<[u8]>>(&mut self, key: impl AsRef<[u8]>, values: &[V]) -> Result<Response<i64>> {
        let key = key.as_ref();
        let mut args = vec![key];
        args.extend(as_slices(values));
        self.queue(b"LPUSH", key, &args, builders::integer)
    }

    fn rpush<V: AsRef<[u8]>>(&mut self, key: impl AsRef<[u8]>, values: &[V]) -> Result<Response<i64>> {
        let key = key.as_ref();
        let mut args = vec![key];
        args.extend(as_slices(values));
        self.queue(b"RPUSH", key, &args, builders::integer)
    }

    fn lpop(&mut self, key: impl AsRef<[u8]>) -> Result<Response<Option<Vec<u8>>>> {
        let key = key.as_ref();
        self.queue(b"LPOP", key, &[key], builders::optional_bytes)
    }

    fn lrange(
        &mut self,
        key: impl AsRef<[u8]>,
        start: i64,
        stop: i64,
    ) -> Result<Response<Vec<Vec<u8>>>> {
        let key = key.as_ref();
        let mut start_buf = itoa::Buffer::new();
        let mut stop_buf = itoa::Buffer::new();
        let args = [
            key,
            start_buf.format(start).as_bytes(),
            stop_buf.format(stop).as_bytes(),
        ];
        self.queue(b"LRANGE", key, &args, builders::bytes_list)
    }

    fn llen(&mut self, key: impl AsRef<[u8]>) -> Result<Response<i64>> {
        let key = key.as_ref();
        self.queue(b"LLEN", key, &[key], builders::integer)
    }

    /// Blocks server-side up to `timeout_secs` (0 = forever); keys must share a slot
    fn blpop<K: AsRef<[u8]>>(
        &mut self,
        keys: &[K],
        timeout_secs: u64,
    ) -> Result<Response<Option<(Vec<u8>, Vec<u8>)>>> {
        let mut buf = itoa::Buffer::new();
        let mut args = as_slices(keys);
        let key = first_key("BLPOP", &args)?;
        args.push(buf.format(timeout_secs).as_bytes());
        self.queue(b"BLPOP", key, &args, builders::key_value)
    }
}

/// Hash commands
pub trait HashCommands: Queue {
    fn hset(
        &mut self,
        key: impl AsRef<[u8]>,
        field: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<Response<i64>> {
        let key = key.as_ref();
        self.queue(b"HSET", key, &[key, field.as_ref(), value.as_ref()], builders::integer)
    }

    fn hget(
        &mut self,
        key: impl AsRef<[u8]>,
        field: impl AsRef<[u8]>,
    ) -> Result<Response<Option<Vec<u8>>>> {
        let key = key.as_ref();
        self.queue(b"HGET", key, &[key, field.as_ref()], builders::optional_bytes)
    }

    fn hgetall(&mut self, key: impl AsRef<[u8]>) -> Result<Response<HashMap<Vec<u8>, Vec<u8>>>> {
        let key = key.as_ref();
        self.queue(b"HGETALL", key, &[key], builders::byte_map)
    }

    fn hdel<F: AsRef<[u8]>>(&mut self, key: impl AsRef<[u8]>, fields: &[F]) -> Result<Response<i64>> {
        let key = key.as_ref();
        let mut args = vec![key];
        args.extend(as_slices(fields));
        self.queue(b"HDEL", key, &args, builders::integer)
    }
}

impl<Q: Queue + ?Sized> StringCommands for Q {}
impl<Q: Queue + ?Sized> KeyCommands for Q {}
impl<Q: Queue + ?Sized> ListCommands for Q {}
impl<Q: Queue + ?Sized> HashCommands for Q {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::response::PendingReply;
    use crate::utils::{encode, RespValue};

    /// Records what would be sent and answers from a script
    struct Recorder {
        sent: Vec<(Vec<u8>, Vec<u8>)>,
        replies: Vec<RespValue>,
    }

    impl Queue for Recorder {
        fn queue<T>(
            &mut self,
            name: &[u8],
            key: &[u8],
            args: &[&[u8]],
            builder: Builder<T>,
        ) -> Result<Response<T>>
        where
            T: Clone + Into<Reply> + Send + 'static,
        {
            self.sent.push((key.to_vec(), encode(name, args)));
            let response = Response::new(builder);
            response.resolve(self.replies.remove(0))?;
            Ok(response)
        }
    }

    fn recorder(replies: Vec<RespValue>) -> Recorder {
        Recorder {
            sent: Vec::new(),
            replies,
        }
    }

    #[test]
    fn test_string_family_encoding() {
        let mut q = recorder(vec![
            RespValue::Status("OK".into()),
            RespValue::Integer(15),
            RespValue::Array(Some(vec![RespValue::Bulk(None)])),
        ]);
        q.set("k", "v").unwrap();
        assert_eq!(q.incr_by("k", 5).unwrap().get(), Ok(15));
        q.mget(&["{t}a", "{t}b"]).unwrap();

        assert_eq!(q.sent[0].1, encode(b"SET", &[b"k", b"v"]));
        assert_eq!(q.sent[1].1, encode(b"INCRBY", &[b"k", b"5"]));
        assert_eq!(q.sent[2].0, b"{t}a".to_vec());
        assert_eq!(q.sent[2].1, encode(b"MGET", &[b"{t}a", b"{t}b"]));
    }

    #[test]
    fn test_multi_key_commands_need_a_key() {
        let mut q = recorder(vec![]);
        let none: [&str; 0] = [];
        assert!(matches!(q.mget(&none), Err(ClientError::PipelineState(_))));
        assert!(matches!(q.del(&none), Err(ClientError::PipelineState(_))));
        assert!(matches!(q.blpop(&none, 0), Err(ClientError::PipelineState(_))));
        assert!(q.sent.is_empty());
    }

    #[test]
    fn test_list_and_hash_encoding() {
        let mut q = recorder(vec![
            RespValue::Integer(2),
            RespValue::Array(Some(vec![])),
            RespValue::Array(None),
            RespValue::Integer(1),
        ]);
        q.rpush("q", &["a", "b"]).unwrap();
        q.lrange("q", 0, -1).unwrap();
        assert_eq!(q.blpop(&["q"], 3).unwrap().get(), Ok(None));
        q.hdel("h", &["f1"]).unwrap();

        assert_eq!(q.sent[0].1, encode(b"RPUSH", &[b"q", b"a", b"b"]));
        assert_eq!(q.sent[1].1, encode(b"LRANGE", &[b"q", b"0", b"-1"]));
        assert_eq!(q.sent[2].1, encode(b"BLPOP", &[b"q", b"3"]));
        assert_eq!(q.sent[3].1, encode(b"HDEL", &[b"h", b"f1"]));
    }
}
