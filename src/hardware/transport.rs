//! Line-oriented SCPI transports.
//!
//! Abstracts the link to a SCPI instrument so drivers only deal in command strings.
//! Resource identifiers use the VISA spelling:
//!
//! | Resource | Transport |
//! |----------|-----------|
//! | `TCPIP0::192.168.0.7::5025::SOCKET` | [`TcpScpiTransport`] (raw socket) |
//! | `ASRL/dev/ttyUSB0::INSTR`, `ASRL3::INSTR` | [`SerialScpiTransport`] (`instrument_serial` feature) |

use crate::hardware::port::InstrumentError;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace};

/// Default raw-socket SCPI port.
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// Trait for SCPI communication transports.
pub trait ScpiTransport: Send {
    /// Send a command without expecting a response.
    fn command(&mut self, command: &str) -> Result<(), InstrumentError>;

    /// Send a query command and return the trimmed response line.
    fn query(&mut self, command: &str) -> Result<String, InstrumentError>;
}

/// Parsed bus resource identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Raw TCP socket
    TcpSocket {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
    /// Serial port
    Serial {
        /// Device path or COM name
        path: String,
    },
}

impl Resource {
    /// Parse a VISA-style resource string.
    pub fn parse(resource: &str) -> Result<Self, InstrumentError> {
        let parts: Vec<&str> = resource.trim().split("::").collect();
        let head = parts.first().copied().unwrap_or_default().to_ascii_uppercase();

        if head.starts_with("TCPIP") {
            let host = parts
                .get(1)
                .filter(|h| !h.is_empty())
                .ok_or_else(|| invalid(resource, "missing host"))?;
            let port = match parts.get(2) {
                Some(p) if p.eq_ignore_ascii_case("SOCKET") || p.eq_ignore_ascii_case("INSTR") => {
                    DEFAULT_SCPI_PORT
                }
                Some(p) => p.parse().map_err(|_| invalid(resource, "bad port"))?,
                None => DEFAULT_SCPI_PORT,
            };
            return Ok(Resource::TcpSocket {
                host: (*host).to_string(),
                port,
            });
        }

        if head.starts_with("ASRL") {
            // Keep the original case of the path after the prefix.
            let raw = parts.first().copied().unwrap_or_default();
            let suffix = &raw[4..];
            let path = if suffix.chars().all(|c| c.is_ascii_digit()) && !suffix.is_empty() {
                if cfg!(windows) {
                    format!("COM{suffix}")
                } else {
                    format!("/dev/ttyS{}", suffix.parse::<u32>().unwrap_or(1).saturating_sub(1))
                }
            } else {
                suffix.to_string()
            };
            if path.is_empty() {
                return Err(invalid(resource, "missing serial path"));
            }
            return Ok(Resource::Serial { path });
        }

        Err(invalid(resource, "unsupported resource type"))
    }
}

fn invalid(resource: &str, reason: &str) -> InstrumentError {
    InstrumentError::ProtocolError(format!("invalid resource '{resource}': {reason}"))
}

/// Open the transport a resource string names.
pub fn connect(resource: &str, timeout: Duration) -> Result<Box<dyn ScpiTransport>, InstrumentError> {
    match Resource::parse(resource)? {
        Resource::TcpSocket { host, port } => {
            Ok(Box::new(TcpScpiTransport::connect(&host, port, timeout)?))
        }
        #[cfg(feature = "instrument_serial")]
        Resource::Serial { path } => Ok(Box::new(SerialScpiTransport::open(&path, 9600, timeout)?)),
        #[cfg(not(feature = "instrument_serial"))]
        Resource::Serial { .. } => Err(InstrumentError::ConnectionLost(
            "serial support not enabled. Rebuild with --features instrument_serial".into(),
        )),
    }
}

// =============================================================================
// TCP
// =============================================================================

/// SCPI over a raw TCP socket (LXI port 5025).
pub struct TcpScpiTransport {
    reader: BufReader<TcpStream>,
}

impl TcpScpiTransport {
    /// Connect with `timeout` applied to connect, read and write.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, InstrumentError> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| InstrumentError::ConnectionLost(format!("cannot resolve {host}")))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        debug!(%addr, "SCPI socket connected");
        Ok(Self {
            reader: BufReader::new(stream),
        })
    }
}

impl ScpiTransport for TcpScpiTransport {
    fn command(&mut self, command: &str) -> Result<(), InstrumentError> {
        trace!(command, "SCPI write");
        let stream = self.reader.get_mut();
        stream.write_all(command.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()?;
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, InstrumentError> {
        self.command(command)?;
        read_response(&mut self.reader)
    }
}

fn read_response<R: BufRead>(reader: &mut R) -> Result<String, InstrumentError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Err(InstrumentError::ConnectionLost("connection closed by peer".into()));
    }
    let response = line.trim().to_string();
    trace!(response = %response, "SCPI read");
    Ok(response)
}

// =============================================================================
// Serial
// =============================================================================

/// SCPI over an RS-232 / USB-serial port.
#[cfg(feature = "instrument_serial")]
pub struct SerialScpiTransport {
    reader: BufReader<Box<dyn serialport::SerialPort>>,
}

#[cfg(feature = "instrument_serial")]
impl SerialScpiTransport {
    /// Open `path` at `baud_rate`, 8N1, no flow control.
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self, InstrumentError> {
        let port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| {
                InstrumentError::ConnectionLost(format!("failed to open serial port {path}: {e}"))
            })?;
        debug!(path, baud_rate, "SCPI serial port opened");
        Ok(Self {
            reader: BufReader::new(port),
        })
    }
}

#[cfg(feature = "instrument_serial")]
impl ScpiTransport for SerialScpiTransport {
    fn command(&mut self, command: &str) -> Result<(), InstrumentError> {
        trace!(command, "SCPI write");
        let port = self.reader.get_mut();
        port.write_all(command.as_bytes())?;
        port.write_all(b"\n")?;
        port.flush()?;
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, InstrumentError> {
        self.command(command)?;
        read_response(&mut self.reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_socket_resources() {
        assert_eq!(
            Resource::parse("TCPIP0::192.168.0.7::5025::SOCKET").unwrap(),
            Resource::TcpSocket {
                host: "192.168.0.7".into(),
                port: 5025
            }
        );
        assert_eq!(
            Resource::parse("tcpip::dmm.lab.local::SOCKET").unwrap(),
            Resource::TcpSocket {
                host: "dmm.lab.local".into(),
                port: DEFAULT_SCPI_PORT
            }
        );
    }

    #[test]
    fn parses_serial_resources() {
        assert_eq!(
            Resource::parse("ASRL/dev/ttyUSB0::INSTR").unwrap(),
            Resource::Serial {
                path: "/dev/ttyUSB0".into()
            }
        );
    }

    #[test]
    fn rejects_unknown_resources() {
        assert!(matches!(
            Resource::parse("USB0::0x05E6::0x2110::1234::INSTR"),
            Err(InstrumentError::ProtocolError(_))
        ));
        assert!(Resource::parse("TCPIP0::").is_err());
    }

    #[test]
    fn empty_read_is_a_lost_connection() {
        let mut empty: &[u8] = b"";
        assert!(matches!(
            read_response(&mut empty),
            Err(InstrumentError::ConnectionLost(_))
        ));

        let mut reply: &[u8] = b"+1.0E-09\r\n";
        assert_eq!(read_response(&mut reply).unwrap(), "+1.0E-09");
    }
}
