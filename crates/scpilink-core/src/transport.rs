//! Character-stream transport
//!
//! One line-oriented byte channel between the engine and the instrument.
//! The transport knows nothing about commands or replies beyond the line
//! terminator; retry policy lives in the layers above it.

use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::error::ScpiError;
use crate::serial::{open_port, SerialOptions};

/// Line terminator for outgoing commands and incoming replies
pub const TERMINATOR: u8 = b'\n';

/// Interval between polls of the receive buffer while waiting for a reply
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Abstraction over the byte-oriented serial line.
///
/// The engine and the negotiation handshake speak to the instrument only
/// through this trait; a session corresponds to exactly one baud rate and
/// one read timeout, and closing it is dropping the value.
pub trait Transport: Send {
    /// Write raw bytes, blocking until the line has clocked them out.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ScpiError>;

    /// Read one newline-terminated line, without the terminator.
    ///
    /// Returns as soon as a terminator is observed. If none arrives within
    /// `max_wait` this fails with [`ScpiError::Timeout`] and discards any
    /// partial data, so the caller can tell "no reply yet" apart from
    /// "malformed reply".
    fn read_line(&mut self, max_wait: Duration) -> Result<String, ScpiError>;

    /// Discard anything pending in the receive buffer.
    fn clear_input(&mut self) -> Result<(), ScpiError>;
}

/// Serial-port backed transport at a fixed baud rate.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    baud_rate: u32,
}

impl SerialTransport {
    /// Open `name` at `baud`, applying `options` to the line.
    pub fn open(
        name: &str,
        baud: u32,
        read_timeout: Duration,
        options: &SerialOptions,
    ) -> Result<Self, ScpiError> {
        let port = open_port(name, baud, read_timeout, options)?;
        debug!(port = name, baud, "serial transport opened");
        Ok(Self {
            port,
            baud_rate: baud,
        })
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), ScpiError> {
        self.port
            .write_all(bytes)
            .map_err(|e| ScpiError::Serial(e.to_string()))?;

        // write_all lands the data in the kernel tty buffer; flush() would
        // tcdrain and can block indefinitely on some USB adapters, so wait
        // out the transmit time instead. Each byte is 10 bits on the wire
        // (1 start + 8 data + 1 stop).
        let bits = (bytes.len() as u64) * 10;
        let transmit_ms = bits * 1_000 / u64::from(self.baud_rate.max(1));
        let wait_ms = (transmit_ms + 5).max(10);

        trace!(len = bytes.len(), wait_ms, "wrote bytes, draining line");
        std::thread::sleep(Duration::from_millis(wait_ms));
        Ok(())
    }

    fn read_line(&mut self, max_wait: Duration) -> Result<String, ScpiError> {
        let mut line: Vec<u8> = Vec::new();
        let mut buffer = [0u8; 256];
        let start = Instant::now();

        loop {
            if start.elapsed() > max_wait {
                if !line.is_empty() {
                    warn!(
                        partial = %String::from_utf8_lossy(&line),
                        "discarding partial reply on timeout"
                    );
                }
                return Err(ScpiError::Timeout);
            }

            // Check how many bytes are available without blocking
            let available = self
                .port
                .bytes_to_read()
                .map_err(|e| ScpiError::Serial(e.to_string()))?;

            if available == 0 {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }

            let to_read = std::cmp::min(available as usize, buffer.len());
            match self.port.read(&mut buffer[..to_read]) {
                Ok(0) => return Err(ScpiError::Serial("serial port closed".to_string())),
                Ok(n) => {
                    for &byte in &buffer[..n] {
                        if byte == TERMINATOR {
                            let text = String::from_utf8_lossy(&line)
                                .trim_end_matches('\r')
                                .to_string();
                            trace!(reply = %text, "reply line complete");
                            return Ok(text);
                        }
                        line.push(byte);
                    }
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    // Non-blocking, keep polling
                }
                Err(e) => return Err(ScpiError::Serial(e.to_string())),
            }
        }
    }

    fn clear_input(&mut self) -> Result<(), ScpiError> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| ScpiError::Serial(e.to_string()))
    }
}
