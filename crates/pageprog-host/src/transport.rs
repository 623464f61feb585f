//! Byte-stream link to the programmer
//!
//! The protocol only needs an ordered byte pipe; everything here hides
//! whether that pipe is a local USB-CDC serial device or a TCP socket
//! (a remote serial port forwarded by ser2net, or a simulator).

use std::time::Duration;

use crate::error::{HostError, Result};

/// How long a blocking read or write may stall before the link is
/// considered dead
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// An ordered, lossless byte pipe to the device
pub trait Transport {
    /// Send all of `data`
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Fill `buf` completely, failing if the device stops talking
    fn read(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Read whatever arrives within `timeout_ms` milliseconds
    ///
    /// Returns the number of bytes placed in `buf`; 0 means the timeout
    /// elapsed with nothing available.
    fn read_nonblock(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize>;

    /// Push any locally buffered bytes onto the wire
    fn flush(&mut self) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).read(buf)
    }

    fn read_nonblock(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        (**self).read_nonblock(buf, timeout_ms)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

pub mod serial {
    //! Serial device transport

    use super::*;
    use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
    use std::io::{Read, Write};

    /// A local serial port, typically the programmer's USB-CDC endpoint
    pub struct SerialTransport {
        port: Box<dyn SerialPort>,
    }

    impl SerialTransport {
        /// Open `device` in 8N1 mode.
        ///
        /// The baud rate is cosmetic on USB-CDC endpoints but the OS
        /// still wants one; 115200 is used when none is given.
        pub fn open(device: &str, baud: Option<u32>) -> Result<Self> {
            let baud_rate = baud.unwrap_or(115200);

            let port = serialport::new(device, baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(IO_TIMEOUT)
                .open()?;

            log::info!("opened serial port {} at {} baud", device, baud_rate);

            Ok(Self { port })
        }
    }

    impl Transport for SerialTransport {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.port.write_all(data)?;
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<()> {
            self.port.read_exact(buf)?;
            Ok(())
        }

        fn read_nonblock(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
            // the port holds one global timeout, so swap it around the read
            self.port
                .set_timeout(Duration::from_millis(timeout_ms as u64))?;

            let result = match self.port.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
                Err(e) => Err(HostError::from(e)),
            };

            self.port.set_timeout(IO_TIMEOUT)?;
            result
        }

        fn flush(&mut self) -> Result<()> {
            self.port.flush()?;
            Ok(())
        }
    }
}

pub mod tcp {
    //! TCP socket transport
    //!
    //! Reaches a programmer over the network, e.g. a serial device
    //! forwarded by ser2net or an in-simulator device.

    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    /// A connected TCP stream carrying the programmer protocol
    pub struct TcpTransport {
        stream: TcpStream,
    }

    impl TcpTransport {
        /// Connect to `host:port`
        pub fn connect(host: &str, port: u16) -> Result<Self> {
            let addr = format!("{}:{}", host, port);

            let stream = TcpStream::connect(&addr)
                .map_err(|e| HostError::ConnectionFailed(e.to_string()))?;

            // command frames are tiny and latency-bound; they must not
            // sit in Nagle's buffer
            stream.set_nodelay(true).map_err(|e| {
                HostError::ConnectionFailed(format!("failed to set TCP_NODELAY: {}", e))
            })?;

            stream.set_read_timeout(Some(IO_TIMEOUT)).map_err(|e| {
                HostError::ConnectionFailed(format!("failed to set read timeout: {}", e))
            })?;
            stream.set_write_timeout(Some(IO_TIMEOUT)).map_err(|e| {
                HostError::ConnectionFailed(format!("failed to set write timeout: {}", e))
            })?;

            log::info!("connected to programmer at {}", addr);

            Ok(Self { stream })
        }
    }

    impl Transport for TcpTransport {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.stream.write_all(data)?;
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<()> {
            self.stream.read_exact(buf)?;
            Ok(())
        }

        fn read_nonblock(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
            self.stream
                .set_read_timeout(Some(Duration::from_millis(timeout_ms as u64)))?;

            // a timed-out socket read surfaces as TimedOut or WouldBlock
            // depending on the platform
            let result = match self.stream.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(HostError::from(e)),
            };

            self.stream.set_read_timeout(Some(IO_TIMEOUT))?;
            result
        }

        fn flush(&mut self) -> Result<()> {
            self.stream.flush()?;
            Ok(())
        }
    }
}

/// Open a transport from a connection string.
///
/// Accepted forms:
/// - `dev=/dev/ttyACM0` or `dev=/dev/ttyACM0:baud` for a serial device
/// - `ip=host:port` for a TCP endpoint
pub fn open(spec: &str) -> Result<Box<dyn Transport>> {
    if let Some(dev) = spec.strip_prefix("dev=") {
        let (path, baud) = match dev.rsplit_once(':') {
            // a colon followed by digits is a baud rate, anything else is
            // part of the device path
            Some((path, baud)) if baud.chars().all(|c| c.is_ascii_digit()) && !baud.is_empty() => {
                let baud = baud
                    .parse::<u32>()
                    .map_err(|_| HostError::InvalidParameter(format!("bad baud rate in {}", dev)))?;
                (path, Some(baud))
            }
            _ => (dev, None),
        };
        return Ok(Box::new(serial::SerialTransport::open(path, baud)?));
    }

    if let Some(addr) = spec.strip_prefix("ip=") {
        let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
            HostError::InvalidParameter(format!("expected ip=host:port, got {}", spec))
        })?;
        let port = port
            .parse::<u16>()
            .map_err(|_| HostError::InvalidParameter(format!("bad port in {}", addr)))?;
        return Ok(Box::new(tcp::TcpTransport::connect(host, port)?));
    }

    Err(HostError::InvalidParameter(format!(
        "unknown connection string {:?}, expected dev=... or ip=...",
        spec
    )))
}
