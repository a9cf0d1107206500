//! Raw TCP connection to a cluster node
//!
//! This module provides direct TCP (and TLS) connections with
//! pre-allocated buffers. Writes are buffered until flushed so a
//! pipeline can put a whole batch on the wire in one go.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use super::connection::{NodeConnection, NodeConnectionExt};
use super::pool::Connector;
use crate::cluster::NodeAddress;
use crate::config::TlsConfig;
use crate::utils::{ClientError, ConnectionError, ProtocolError, RespDecoder, RespValue, Result};

const BUFFER_SIZE: usize = 65536;

/// Underlying byte stream (TCP or TLS)
///
/// For TCP, we split into separate reader/writer for better performance.
/// For TLS, we use a single stream since native-tls doesn't support cloning.
enum Transport {
    Tcp {
        writer: BufWriter<TcpStream>,
        reader: BufReader<TcpStream>,
    },
    #[cfg(feature = "native-tls-backend")]
    NativeTls {
        stream: BufReader<native_tls::TlsStream<TcpStream>>,
        write_buf: Vec<u8>,
    },
}

/// Connection to one node
pub struct RawConnection {
    address: NodeAddress,
    transport: Transport,
    read_timeout: Option<Duration>,
    broken: bool,
}

impl RawConnection {
    /// Create new TCP connection
    pub fn connect_tcp(
        address: &NodeAddress,
        connect_timeout: Duration,
    ) -> std::result::Result<Self, ConnectionError> {
        let stream = open_socket(address, connect_timeout)?;

        let writer = BufWriter::with_capacity(
            BUFFER_SIZE,
            stream
                .try_clone()
                .map_err(|e| ConnectionError::ConnectFailed {
                    host: address.host.clone(),
                    port: address.port,
                    source: e,
                })?,
        );
        let reader = BufReader::with_capacity(BUFFER_SIZE, stream);

        Ok(Self {
            address: address.clone(),
            transport: Transport::Tcp { writer, reader },
            read_timeout: None,
            broken: false,
        })
    }

    /// Create new TLS connection
    #[cfg(feature = "native-tls-backend")]
    pub fn connect_tls(
        address: &NodeAddress,
        connect_timeout: Duration,
        tls_config: &TlsConfig,
    ) -> std::result::Result<Self, ConnectionError> {
        use native_tls::{Certificate, Identity, TlsConnector};

        let mut builder = TlsConnector::builder();

        if tls_config.skip_verify {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }

        if let Some(ref ca_path) = tls_config.ca_cert {
            let ca_data = std::fs::read(ca_path).map_err(|e| {
                ConnectionError::TlsFailed(format!("Failed to read CA cert: {}", e))
            })?;
            let cert = Certificate::from_pem(&ca_data)
                .map_err(|e| ConnectionError::TlsFailed(format!("Invalid CA cert: {}", e)))?;
            builder.add_root_certificate(cert);
        }

        if let (true, Some(cert_path), Some(key_path)) = (
            tls_config.has_client_cert(),
            &tls_config.client_cert,
            &tls_config.client_key,
        ) {
            let cert_data = std::fs::read(cert_path).map_err(|e| {
                ConnectionError::TlsFailed(format!("Failed to read client cert: {}", e))
            })?;
            let key_data = std::fs::read(key_path).map_err(|e| {
                ConnectionError::TlsFailed(format!("Failed to read client key: {}", e))
            })?;

            // native-tls wants PKCS8 cert + key
            let identity = Identity::from_pkcs8(&cert_data, &key_data).map_err(|e| {
                ConnectionError::TlsFailed(format!("Invalid client identity: {}", e))
            })?;
            builder.identity(identity);
        }

        let connector = builder.build().map_err(|e| {
            ConnectionError::TlsFailed(format!("Failed to build TLS connector: {}", e))
        })?;

        let tcp_stream = open_socket(address, connect_timeout)?;

        let sni_host = tls_config.server_name(&address.host);
        let tls_stream = connector
            .connect(sni_host, tcp_stream)
            .map_err(|e| ConnectionError::TlsFailed(format!("TLS handshake failed: {}", e)))?;

        Ok(Self {
            address: address.clone(),
            transport: Transport::NativeTls {
                stream: BufReader::with_capacity(BUFFER_SIZE, tls_stream),
                write_buf: Vec::with_capacity(BUFFER_SIZE),
            },
            read_timeout: None,
            broken: false,
        })
    }

    /// Set write timeout
    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match &mut self.transport {
            Transport::Tcp { writer, .. } => writer.get_ref().set_write_timeout(timeout),
            #[cfg(feature = "native-tls-backend")]
            Transport::NativeTls { stream, .. } => {
                stream.get_ref().get_ref().set_write_timeout(timeout)
            }
        }
    }

    /// Record a failure and classify it; the stream is unusable afterwards
    fn fail(&mut self, err: io::Error) -> ClientError {
        self.broken = true;
        if err.kind() == io::ErrorKind::InvalidData {
            ProtocolError::Malformed {
                address: self.address.key(),
                message: err.to_string(),
            }
            .into()
        } else {
            ConnectionError::Io {
                address: self.address.key(),
                source: err,
            }
            .into()
        }
    }

    fn closed(&self) -> ClientError {
        ConnectionError::Closed(self.address.key()).into()
    }

    fn write_flush(&mut self) -> io::Result<()> {
        match &mut self.transport {
            Transport::Tcp { writer, .. } => writer.flush(),
            #[cfg(feature = "native-tls-backend")]
            Transport::NativeTls { stream, write_buf } => {
                if !write_buf.is_empty() {
                    stream.get_mut().write_all(write_buf)?;
                    write_buf.clear();
                }
                stream.get_mut().flush()
            }
        }
    }

    fn decode(&mut self) -> io::Result<RespValue> {
        match &mut self.transport {
            Transport::Tcp { reader, .. } => RespDecoder::new(reader).decode(),
            #[cfg(feature = "native-tls-backend")]
            Transport::NativeTls { stream, .. } => RespDecoder::new(stream).decode(),
        }
    }
}

impl NodeConnection for RawConnection {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    fn send(&mut self, command: &[u8]) -> Result<()> {
        if self.broken {
            return Err(self.closed());
        }
        let written = match &mut self.transport {
            Transport::Tcp { writer, .. } => writer.write_all(command),
            #[cfg(feature = "native-tls-backend")]
            Transport::NativeTls { write_buf, .. } => {
                write_buf.extend_from_slice(command);
                Ok(())
            }
        };
        written.map_err(|e| self.fail(e))
    }

    fn flush(&mut self) -> Result<()> {
        if self.broken {
            return Err(self.closed());
        }
        self.write_flush().map_err(|e| self.fail(e))
    }

    fn read_reply(&mut self) -> Result<RespValue> {
        self.flush()?;
        self.decode().map_err(|e| self.fail(e))
    }

    fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        let applied = match &mut self.transport {
            Transport::Tcp { reader, .. } => reader.get_ref().set_read_timeout(timeout),
            #[cfg(feature = "native-tls-backend")]
            Transport::NativeTls { stream, .. } => {
                stream.get_ref().get_ref().set_read_timeout(timeout)
            }
        };
        applied.map_err(|e| self.fail(e))?;
        self.read_timeout = timeout;
        Ok(())
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    fn close(&mut self) {
        if self.broken {
            return;
        }
        self.broken = true;
        let _ = self.write_flush();
        let shutdown = match &mut self.transport {
            Transport::Tcp { reader, .. } => reader.get_ref().shutdown(std::net::Shutdown::Both),
            #[cfg(feature = "native-tls-backend")]
            Transport::NativeTls { stream, .. } => stream.get_mut().shutdown(),
        };
        if let Err(e) = shutdown {
            debug!("Error closing connection to {}: {}", self.address, e);
        }
    }
}

impl Drop for RawConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Resolve and connect a socket with nodelay and default timeouts
fn open_socket(
    address: &NodeAddress,
    connect_timeout: Duration,
) -> std::result::Result<TcpStream, ConnectionError> {
    let connect_failed = |source: io::Error| ConnectionError::ConnectFailed {
        host: address.host.clone(),
        port: address.port,
        source,
    };

    let addr = (address.host.as_str(), address.port)
        .to_socket_addrs()
        .map_err(connect_failed)?
        .next()
        .ok_or_else(|| {
            connect_failed(io::Error::new(io::ErrorKind::NotFound, "No addresses found"))
        })?;

    let stream = TcpStream::connect_timeout(&addr, connect_timeout).map_err(connect_failed)?;

    // Disable Nagle's algorithm
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Connection factory for creating connections with common config
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub tls_config: Option<TlsConfig>,
    pub auth_password: Option<String>,
    pub auth_username: Option<String>,
    pub dbnum: Option<u32>,
}

impl Default for ConnectionFactory {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            tls_config: None,
            auth_password: None,
            auth_username: None,
            dbnum: None,
        }
    }
}

impl ConnectionFactory {
    /// Create a new connection to the specified node
    pub fn create(&self, address: &NodeAddress) -> Result<RawConnection> {
        let mut conn = match &self.tls_config {
            #[cfg(feature = "native-tls-backend")]
            Some(tls) => RawConnection::connect_tls(address, self.connect_timeout, tls)?,
            #[cfg(not(feature = "native-tls-backend"))]
            Some(_) => {
                return Err(ConnectionError::TlsFailed(
                    "TLS support not compiled in".to_string(),
                )
                .into());
            }
            None => RawConnection::connect_tcp(address, self.connect_timeout)?,
        };

        conn.set_read_timeout(Some(self.read_timeout))?;
        conn.set_write_timeout(Some(self.write_timeout)).ok();

        if let Some(ref password) = self.auth_password {
            conn.authenticate(password, self.auth_username.as_deref())?;
        }

        if let Some(db) = self.dbnum {
            conn.select_db(db)?;
        }

        debug!("Connected to {}", address);
        Ok(conn)
    }
}

impl Connector for ConnectionFactory {
    fn connect(&self, address: &NodeAddress) -> Result<Box<dyn NodeConnection>> {
        Ok(Box::new(self.create(address)?))
    }
}
