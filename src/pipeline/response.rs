//! Deferred command results
//!
//! A `Response<T>` is handed out when a command is recorded, long before
//! its reply exists. The executor stores the raw reply once it arrives;
//! the typed value is built lazily on the first `get()` and memoized.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::utils::{ClientError, CommandError, RespValue, Result};

/// Converts a raw reply into a command's typed value
pub type Builder<T> = fn(RespValue) -> std::result::Result<T, CommandError>;

enum State<T> {
    Unset,
    Raw(RespValue),
    Built(std::result::Result<T, CommandError>),
}

struct Inner<T> {
    state: State<T>,
    builder: Builder<T>,
}

/// Deferred result of one pipelined command
pub struct Response<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Response<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Response<T> {
    pub(crate) fn new(builder: Builder<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Unset,
                builder,
            })),
        }
    }

    /// Typed value of the reply
    ///
    /// Error replies from the server come back as `CommandError::Server`;
    /// reading before the batch was synced gives `CommandError::Pending`.
    pub fn get(&self) -> std::result::Result<T, CommandError> {
        let mut inner = self.inner.lock();
        let builder = inner.builder;
        let built = match std::mem::replace(&mut inner.state, State::Unset) {
            State::Unset => return Err(CommandError::Pending),
            State::Raw(RespValue::Error(msg)) => Err(CommandError::Server(msg)),
            State::Raw(raw) => builder(raw),
            State::Built(result) => result,
        };
        inner.state = State::Built(built.clone());
        built
    }

    /// Whether the reply (or a terminal failure) has been stored
    pub fn is_ready(&self) -> bool {
        !matches!(self.inner.lock().state, State::Unset)
    }
}

impl<T> fmt::Debug for Response<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.lock().state {
            State::Unset => "unset",
            State::Raw(_) => "raw",
            State::Built(Ok(_)) => "built",
            State::Built(Err(_)) => "failed",
        };
        f.debug_struct("Response").field("state", &state).finish()
    }
}

/// Type-erased view of a `Response<T>` used by the executor
pub(crate) trait PendingReply: Send {
    /// Store the raw reply; a second call is a contract violation
    fn resolve(&self, raw: RespValue) -> Result<()>;

    /// Store a terminal failure unless a reply already arrived
    fn fail(&self, error: CommandError);

    fn is_resolved(&self) -> bool;

    /// Typed value converted into the common `Reply` shape
    fn reply(&self) -> std::result::Result<Reply, CommandError>;
}

impl<T> PendingReply for Response<T>
where
    T: Clone + Into<Reply> + Send + 'static,
{
    fn resolve(&self, raw: RespValue) -> Result<()> {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, State::Unset) {
            return Err(ClientError::PipelineState(
                "response resolved twice".to_string(),
            ));
        }
        inner.state = State::Raw(raw);
        Ok(())
    }

    fn fail(&self, error: CommandError) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, State::Unset) {
            inner.state = State::Built(Err(error));
        }
    }

    fn is_resolved(&self) -> bool {
        self.is_ready()
    }

    fn reply(&self) -> std::result::Result<Reply, CommandError> {
        self.get().map(Into::into)
    }
}

/// Value of any command, as collected by `sync_and_return_all`
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Nil,
    Integer(i64),
    Boolean(bool),
    Text(String),
    Bytes(Vec<u8>),
    Array(Vec<Reply>),
    Map(Vec<(Vec<u8>, Vec<u8>)>),
}

impl Reply {
    /// UTF-8 view of text or byte replies
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::Text(s) => Some(s),
            Reply::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<()> for Reply {
    fn from(_: ()) -> Self {
        Reply::Ok
    }
}

impl From<i64> for Reply {
    fn from(n: i64) -> Self {
        Reply::Integer(n)
    }
}

impl From<bool> for Reply {
    fn from(b: bool) -> Self {
        Reply::Boolean(b)
    }
}

impl From<String> for Reply {
    fn from(s: String) -> Self {
        Reply::Text(s)
    }
}

impl From<Vec<u8>> for Reply {
    fn from(b: Vec<u8>) -> Self {
        Reply::Bytes(b)
    }
}

impl<T: Into<Reply>> From<Option<T>> for Reply {
    fn from(value: Option<T>) -> Self {
        value.map_or(Reply::Nil, Into::into)
    }
}

impl From<Vec<Vec<u8>>> for Reply {
    fn from(items: Vec<Vec<u8>>) -> Self {
        Reply::Array(items.into_iter().map(Reply::Bytes).collect())
    }
}

impl From<Vec<Option<Vec<u8>>>> for Reply {
    fn from(items: Vec<Option<Vec<u8>>>) -> Self {
        Reply::Array(items.into_iter().map(Reply::from).collect())
    }
}

impl From<(Vec<u8>, Vec<u8>)> for Reply {
    fn from((a, b): (Vec<u8>, Vec<u8>)) -> Self {
        Reply::Array(vec![Reply::Bytes(a), Reply::Bytes(b)])
    }
}

impl From<HashMap<Vec<u8>, Vec<u8>>> for Reply {
    fn from(map: HashMap<Vec<u8>, Vec<u8>>) -> Self {
        let mut pairs: Vec<_> = map.into_iter().collect();
        pairs.sort();
        Reply::Map(pairs)
    }
}

impl From<RespValue> for Reply {
    fn from(value: RespValue) -> Self {
        match value {
            RespValue::Status(s) if s == "OK" => Reply::Ok,
            RespValue::Status(s) | RespValue::Error(s) => Reply::Text(s),
            RespValue::Integer(n) => Reply::Integer(n),
            RespValue::Bulk(Some(b)) => Reply::Bytes(b),
            RespValue::Bulk(None) | RespValue::Array(None) => Reply::Nil,
            RespValue::Array(Some(items)) => {
                Reply::Array(items.into_iter().map(Reply::from).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::builders;

    #[test]
    fn test_pending_until_resolved() {
        let response = Response::new(builders::integer);
        assert!(!response.is_ready());
        assert_eq!(response.get(), Err(CommandError::Pending));

        response.resolve(RespValue::Integer(3)).unwrap();
        assert!(response.is_ready());
        assert_eq!(response.get(), Ok(3));
        // Memoized
        assert_eq!(response.get(), Ok(3));
    }

    #[test]
    fn test_resolve_twice_is_contract_violation() {
        let response = Response::new(builders::integer);
        response.resolve(RespValue::Integer(1)).unwrap();
        assert!(matches!(
            response.resolve(RespValue::Integer(2)),
            Err(ClientError::PipelineState(_))
        ));
        assert_eq!(response.get(), Ok(1));
    }

    #[test]
    fn test_error_reply_is_data() {
        let response = Response::new(builders::optional_bytes);
        response
            .resolve(RespValue::Error("WRONGTYPE Operation".into()))
            .unwrap();
        assert_eq!(
            response.get(),
            Err(CommandError::Server("WRONGTYPE Operation".into()))
        );
        assert_eq!(
            response.reply(),
            Err(CommandError::Server("WRONGTYPE Operation".into()))
        );
    }

    #[test]
    fn test_builder_mismatch() {
        let response = Response::new(builders::integer);
        response.resolve(RespValue::Status("OK".into())).unwrap();
        assert!(matches!(
            response.get(),
            Err(CommandError::UnexpectedReply { .. })
        ));
    }

    #[test]
    fn test_fail_only_when_unset() {
        let failed = Response::new(builders::integer);
        failed.fail(CommandError::Aborted("protocol error".into()));
        assert!(failed.is_resolved());
        assert_eq!(
            failed.get(),
            Err(CommandError::Aborted("protocol error".into()))
        );

        let resolved = Response::new(builders::integer);
        resolved.resolve(RespValue::Integer(9)).unwrap();
        resolved.fail(CommandError::Aborted("late".into()));
        assert_eq!(resolved.get(), Ok(9));
    }

    #[test]
    fn test_clones_share_state() {
        let response = Response::new(builders::status_ok);
        let handle = response.clone();
        response.resolve(RespValue::Status("OK".into())).unwrap();
        assert_eq!(handle.get(), Ok(()));
        assert_eq!(handle.reply(), Ok(Reply::Ok));
    }

    #[test]
    fn test_reply_conversions() {
        assert_eq!(Reply::from(None::<Vec<u8>>), Reply::Nil);
        assert_eq!(
            Reply::from(vec![Some(b"a".to_vec()), None]),
            Reply::Array(vec![Reply::Bytes(b"a".to_vec()), Reply::Nil])
        );
        let mut map = HashMap::new();
        map.insert(b"f2".to_vec(), b"2".to_vec());
        map.insert(b"f1".to_vec(), b"1".to_vec());
        assert_eq!(
            Reply::from(map),
            Reply::Map(vec![
                (b"f1".to_vec(), b"1".to_vec()),
                (b"f2".to_vec(), b"2".to_vec())
            ])
        );
        assert_eq!(Reply::from(RespValue::Status("OK".into())), Reply::Ok);
        assert_eq!(Reply::Bytes(b"hi".to_vec()).as_str(), Some("hi"));
    }
}
