use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Poll interval used for blocking reads on real transports
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not resolve address {0}")]
    UnresolvedAddress(String),

    #[error("Connection closed by peer")]
    Closed,
}

/// A byte stream to a device.
///
/// `read` waits at most one poll interval and returns `Ok(0)` when nothing
/// arrived, so callers can enforce their own deadlines and check for
/// cancellation between reads.
pub trait Transport: Send {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Discard any buffered input
    fn clear(&mut self) -> Result<(), TransportError>;

    /// Human readable location, e.g. the port path
    fn describe(&self) -> String;
}

fn is_timeout(error: &std::io::Error) -> bool {
    matches!(error.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

pub struct SerialTransport {
    serial: Box<dyn SerialPort>,
    port: String,
}

impl SerialTransport {
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let serial = serialport::new(port, baud_rate)
            .timeout(POLL_INTERVAL)
            .open()?;

        let mut transport = Self {
            serial,
            port: port.to_string(),
        };
        transport.clear()?;
        Ok(transport)
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.serial.write_all(bytes)?;
        self.serial.flush()?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.serial.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if is_timeout(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&mut self) -> Result<(), TransportError> {
        self.serial.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.port.clone()
    }
}

pub struct TcpTransport {
    stream: TcpStream,
    address: String,
}

impl TcpTransport {
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, TransportError> {
        let address = format!("{}:{}", host, port);
        let socket_address = address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::UnresolvedAddress(address.clone()))?;

        log::debug!("Connecting to analyzer at {}", socket_address);
        let stream = TcpStream::connect_timeout(&socket_address, timeout)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        stream.set_nodelay(true)?;

        Ok(Self { stream, address })
    }
}

impl Transport for TcpTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes)?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.stream.read(buf) {
            Ok(0) if !buf.is_empty() => Err(TransportError::Closed),
            Ok(n) => Ok(n),
            Err(e) if is_timeout(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&mut self) -> Result<(), TransportError> {
        let mut scratch = [0u8; 256];
        loop {
            match self.read(&mut scratch)? {
                0 => return Ok(()),
                n => log::debug!("Discarded {} stale bytes from {}", n, self.address),
            }
        }
    }

    fn describe(&self) -> String {
        self.address.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_tcp_transport_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 3];
            socket.read_exact(&mut buf).unwrap();
            socket.write_all(&buf).unwrap();
        });

        let mut transport =
            TcpTransport::connect("127.0.0.1", port, Duration::from_secs(1)).unwrap();
        transport.write_all(b"abc").unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 8];
        while received.len() < 3 {
            let n = transport.read(&mut buf).unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"abc");
        assert_eq!(transport.describe(), format!("127.0.0.1:{}", port));
        server.join().unwrap();
    }

    #[test]
    fn test_serial_open_missing_port_fails() {
        assert!(SerialTransport::open("/dev/does-not-exist-analyzer", 115_200).is_err());
    }
}
