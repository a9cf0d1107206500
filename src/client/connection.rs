//! Node connection trait
//!
//! A `NodeConnection` owns one link to one cluster node. Commands are
//! buffered by `send` and go out on the next `flush` (or implicitly on the
//! next `read_reply`), which is what lets a pipeline put many commands on
//! the wire before reading anything back.
//!
//! Implementations:
//! - `RawConnection`: TCP/TLS with the crate's RESP codec
//! - The in-process fake cluster used by the test suite

use std::time::Duration;

use crate::cluster::NodeAddress;
use crate::utils::{encode, ConnectionError, ProtocolError, RespValue, Result};

/// One connection to one node
pub trait NodeConnection: Send {
    /// Node this connection talks to
    fn address(&self) -> &NodeAddress;

    /// Append an encoded command to the outbound buffer (no flush)
    fn send(&mut self, command: &[u8]) -> Result<()>;

    /// Write everything buffered so far
    fn flush(&mut self) -> Result<()>;

    /// Read exactly one reply frame, flushing pending output first
    fn read_reply(&mut self) -> Result<RespValue>;

    /// Current read timeout (`None` = wait forever)
    fn read_timeout(&self) -> Option<Duration>;

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// True once an I/O or framing failure left the stream unusable
    fn is_broken(&self) -> bool;

    /// Shut the link down; the connection is broken afterwards
    fn close(&mut self);
}

/// Extension trait with common node operations
///
/// These are convenience methods built on top of the base `NodeConnection` trait.
pub trait NodeConnectionExt: NodeConnection {
    /// Send one command and wait for its reply
    fn execute(&mut self, name: &[u8], args: &[&[u8]]) -> Result<RespValue> {
        self.send(&encode(name, args))?;
        self.read_reply()
    }

    /// Run CLUSTER SLOTS and return the raw reply
    fn cluster_slots(&mut self) -> Result<RespValue> {
        match self.execute(b"CLUSTER", &[b"SLOTS"])? {
            RespValue::Error(e) => Err(ProtocolError::ServerError(e).into()),
            other => Ok(other),
        }
    }

    /// Queue the one-shot ASKING directive; its reply must be read by the caller
    fn send_asking(&mut self) -> Result<()> {
        self.send(&encode(b"ASKING", &[]))
    }

    /// Send AUTH command
    fn authenticate(&mut self, password: &str, username: Option<&str>) -> Result<()> {
        let response = match username {
            Some(user) => self.execute(b"AUTH", &[user.as_bytes(), password.as_bytes()])?,
            None => self.execute(b"AUTH", &[password.as_bytes()])?,
        };

        match response {
            RespValue::Status(s) if s == "OK" => Ok(()),
            RespValue::Error(e) => Err(ConnectionError::AuthFailed(e).into()),
            other => Err(ConnectionError::AuthFailed(format!(
                "Unexpected response: {:?}",
                other
            ))
            .into()),
        }
    }

    /// Send SELECT command
    fn select_db(&mut self, db: u32) -> Result<()> {
        let db_str = db.to_string();
        match self.execute(b"SELECT", &[db_str.as_bytes()])? {
            RespValue::Status(s) if s == "OK" => Ok(()),
            RespValue::Error(e) => Err(ProtocolError::ServerError(e).into()),
            other => Err(ProtocolError::UnexpectedResponse {
                expected: "OK".to_string(),
                actual: format!("{:?}", other),
            }
            .into()),
        }
    }

    /// Run `f` with the read timeout switched to `timeout`
    ///
    /// The previous timeout is restored whether `f` succeeds or fails.
    /// A failure to restore is reported only when `f` itself succeeded.
    fn with_temporary_timeout<R, F>(&mut self, timeout: Option<Duration>, f: F) -> Result<R>
    where
        F: FnOnce(&mut Self) -> Result<R>,
    {
        let previous = self.read_timeout();
        self.set_read_timeout(timeout)?;
        let result = f(self);
        let restored = self.set_read_timeout(previous);
        match (result, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), _) => Err(e),
        }
    }
}

// Blanket implementation: any NodeConnection automatically gets NodeConnectionExt
impl<T: NodeConnection + ?Sized> NodeConnectionExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ClientError;

    // Mock implementation for testing
    struct MockConnection {
        address: NodeAddress,
        sent: Vec<Vec<u8>>,
        responses: Vec<RespValue>,
        call_count: usize,
        timeout: Option<Duration>,
    }

    impl MockConnection {
        fn new(responses: Vec<RespValue>) -> Self {
            Self {
                address: NodeAddress::new("mock", 6379),
                sent: Vec::new(),
                responses,
                call_count: 0,
                timeout: Some(Duration::from_secs(2)),
            }
        }
    }

    impl NodeConnection for MockConnection {
        fn address(&self) -> &NodeAddress {
            &self.address
        }

        fn send(&mut self, command: &[u8]) -> Result<()> {
            self.sent.push(command.to_vec());
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }

        fn read_reply(&mut self) -> Result<RespValue> {
            if self.call_count < self.responses.len() {
                let resp = self.responses[self.call_count].clone();
                self.call_count += 1;
                Ok(resp)
            } else {
                Err(ConnectionError::Closed(self.address.key()).into())
            }
        }

        fn read_timeout(&self) -> Option<Duration> {
            self.timeout
        }

        fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
            self.timeout = timeout;
            Ok(())
        }

        fn is_broken(&self) -> bool {
            false
        }

        fn close(&mut self) {}
    }

    #[test]
    fn test_execute() {
        let mut mock = MockConnection::new(vec![RespValue::Status("PONG".to_string())]);
        assert_eq!(
            mock.execute(b"PING", &[]).unwrap(),
            RespValue::Status("PONG".to_string())
        );
        assert_eq!(mock.sent[0], b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn test_authenticate_rejected() {
        let mut mock =
            MockConnection::new(vec![RespValue::Error("WRONGPASS invalid".to_string())]);
        let err = mock.authenticate("secret", Some("app")).unwrap_err();
        assert!(matches!(
            err,
            ClientError::Connection(ConnectionError::AuthFailed(_))
        ));
        assert_eq!(mock.sent[0], encode(b"AUTH", &[b"app", b"secret"]));
    }

    #[test]
    fn test_cluster_slots_error_reply() {
        let mut mock = MockConnection::new(vec![RespValue::Error(
            "ERR This instance has cluster support disabled".to_string(),
        )]);
        assert!(mock.cluster_slots().is_err());
    }

    #[test]
    fn test_temporary_timeout_restored_on_success() {
        let mut mock = MockConnection::new(vec![RespValue::Integer(1)]);
        let value = mock
            .with_temporary_timeout(None, |conn| {
                assert_eq!(conn.read_timeout(), None);
                conn.read_reply()
            })
            .unwrap();
        assert_eq!(value, RespValue::Integer(1));
        assert_eq!(mock.read_timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_temporary_timeout_restored_on_error() {
        let mut mock = MockConnection::new(vec![]);
        let result = mock.with_temporary_timeout(None, |conn| conn.read_reply());
        assert!(result.is_err());
        assert_eq!(mock.read_timeout(), Some(Duration::from_secs(2)));
    }
}
