//! The transport seam: what the stream engine needs from a byte
//! transport, plus the default TCP client implementation.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ConnectionError;

/// TCP connection timeout for outbound connections. The OS default
/// can run to 30-120 seconds for unreachable hosts; 15 seconds is
/// generous for high-latency links but still gives timely failure
/// feedback.
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Read chunk size for a single `recv` poll.
const RECV_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Outcome of one `recv` poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvStatus {
    /// Bytes arrived.
    Data(Vec<u8>),
    /// The timeout elapsed without data.
    Idle,
    /// The peer closed the transport.
    Closed,
}

/// A byte transport the engine can drive. The engine pulls with
/// `recv`; ordering of `send` calls is preserved on the wire.
pub trait Connection: Send {
    fn connect(&mut self) -> Result<(), ConnectionError>;

    /// Poll for inbound bytes, blocking up to `timeout` (`None` blocks
    /// until data or close).
    fn recv(&mut self, timeout: Option<Duration>) -> Result<RecvStatus, ConnectionError>;

    fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    fn disconnect(&mut self);

    /// Release per-connection resources; the object stays reusable for
    /// a later `connect`.
    fn cleanup(&mut self);

    fn state(&self) -> ConnectionState;

    /// `(bytes_received, bytes_sent)` over the lifetime of the object.
    fn statistics(&self) -> (u64, u64);
}

/// Blocking TCP client transport with read-timeout polling.
pub struct TcpClientConnection {
    server: String,
    port: u16,
    stream: Option<TcpStream>,
    state: ConnectionState,
    bytes_in: u64,
    bytes_out: u64,
}

impl TcpClientConnection {
    pub fn new(server: &str, port: u16) -> TcpClientConnection {
        TcpClientConnection {
            server: server.to_string(),
            port,
            stream: None,
            state: ConnectionState::Disconnected,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    pub fn set_server(&mut self, server: &str, port: u16) {
        self.server = server.to_string();
        self.port = port;
    }
}

impl Connection for TcpClientConnection {
    fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.state >= ConnectionState::Connecting {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;

        let mut addrs = (self.server.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| {
                warn!(server = %self.server, error = %e, "address resolution failed");
                self.state = ConnectionState::Disconnected;
                ConnectionError::DnsError
            })?;
        let addr = match addrs.next() {
            Some(a) => a,
            None => {
                self.state = ConnectionState::Disconnected;
                return Err(ConnectionError::DnsError);
            }
        };

        let stream = TcpStream::connect_timeout(&addr, TCP_CONNECT_TIMEOUT).map_err(|e| {
            warn!(server = %self.server, port = self.port, error = %e, "TCP connect failed");
            self.state = ConnectionState::Disconnected;
            ConnectionError::IoError
        })?;
        stream.set_nodelay(true).ok();

        debug!(server = %self.server, port = self.port, "TCP connection established");
        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        Ok(())
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<RecvStatus, ConnectionError> {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Err(ConnectionError::NotConnected),
        };

        stream.set_read_timeout(timeout).map_err(|_| ConnectionError::IoError)?;

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        match stream.read(&mut buf) {
            Ok(0) => {
                self.state = ConnectionState::Disconnected;
                Ok(RecvStatus::Closed)
            }
            Ok(n) => {
                self.bytes_in += n as u64;
                Ok(RecvStatus::Data(buf[..n].to_vec()))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(RecvStatus::Idle)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(RecvStatus::Idle),
            Err(e) => {
                warn!(error = %e, "TCP read failed");
                self.state = ConnectionState::Disconnected;
                Err(ConnectionError::IoError)
            }
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Err(ConnectionError::NotConnected),
        };
        stream.write_all(data).map_err(|e| {
            warn!(error = %e, "TCP write failed");
            self.state = ConnectionState::Disconnected;
            ConnectionError::IoError
        })?;
        self.bytes_out += data.len() as u64;
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.as_ref() {
            stream.shutdown(std::net::Shutdown::Both).ok();
        }
        self.state = ConnectionState::Disconnected;
    }

    fn cleanup(&mut self) {
        self.stream = None;
        self.state = ConnectionState::Disconnected;
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn statistics(&self) -> (u64, u64) {
        (self.bytes_in, self.bytes_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_connect_send_recv_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).unwrap();
            sock.write_all(&buf[..n]).unwrap();
        });

        let mut conn = TcpClientConnection::new("127.0.0.1", addr.port());
        conn.connect().unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.send(b"<presence/>").unwrap();
        let mut received = Vec::new();
        loop {
            match conn.recv(Some(Duration::from_secs(5))).unwrap() {
                RecvStatus::Data(d) => {
                    received.extend_from_slice(&d);
                    if received.len() >= 11 {
                        break;
                    }
                }
                RecvStatus::Idle => continue,
                RecvStatus::Closed => break,
            }
        }
        assert_eq!(received, b"<presence/>");

        let (bytes_in, bytes_out) = conn.statistics();
        assert_eq!(bytes_in, 11);
        assert_eq!(bytes_out, 11);

        conn.disconnect();
        server.join().unwrap();
    }

    #[test]
    fn test_recv_before_connect_fails() {
        let mut conn = TcpClientConnection::new("127.0.0.1", 1);
        assert_eq!(
            conn.recv(Some(Duration::from_millis(10))),
            Err(ConnectionError::NotConnected)
        );
    }

    #[test]
    fn test_unresolvable_host_is_dns_error() {
        let mut conn = TcpClientConnection::new("invalid.invalid.invalid.", 5222);
        assert_eq!(conn.connect(), Err(ConnectionError::DnsError));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
