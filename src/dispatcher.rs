//! Command dispatcher: send a command, collect response lines until a
//! sentinel or a timeout. `send` takes the sentinel substring and the
//! timeout as parameters, since scan/join/register flows each wait on a
//! different line.

use std::time::{Duration, Instant};

use crate::cancel::Cancel;
use crate::error::{Error, Result};
use crate::tty::SerialLine;

/// Default command wait.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Dispatcher<'a, T: SerialLine> {
    line: &'a mut T,
}

impl<'a, T: SerialLine> Dispatcher<'a, T> {
    pub fn new(line: &'a mut T) -> Self {
        Dispatcher { line }
    }

    /// Writes `cmd` followed by CRLF, then collects lines until one
    /// contains `wait_for`, `timeout` elapses, or EOF is reached. The
    /// sentinel line itself is included in the result.
    pub fn send(&mut self, cmd: &str, wait_for: &str, timeout: Duration) -> Result<Vec<String>> {
        self.write_command(cmd)?;
        self.collect_until(wait_for, timeout, &Cancel::new())
    }

    pub fn send_cancellable(
        &mut self,
        cmd: &str,
        wait_for: &str,
        timeout: Duration,
        cancel: &Cancel,
    ) -> Result<Vec<String>> {
        self.write_command(cmd)?;
        self.collect_until(wait_for, timeout, cancel)
    }

    pub fn write_command(&mut self, cmd: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(cmd.len() + 2);
        bytes.extend_from_slice(cmd.as_bytes());
        bytes.extend_from_slice(b"\r\n");
        self.line.write_all(&bytes)?;
        Ok(())
    }

    /// Binary-payload variant used by the UDP exchange: the header
    /// (through its single trailing space) is written as ASCII, then the
    /// raw frame bytes follow. No CRLF is appended after the payload. This
    /// is a hard contract of the dongle's command parser.
    pub fn write_binary_command(&mut self, header: &str, payload: &[u8]) -> Result<()> {
        debug_assert!(header.ends_with(' '), "binary command header must end with a space");
        self.line.write_all(header.as_bytes())?;
        self.line.write_all(payload)?;
        Ok(())
    }

    /// Reads lines until one contains `wait_for`, `timeout` elapses, or
    /// EOF. Never retries; retrying is a supervisor concern.
    pub fn collect_until(
        &mut self,
        wait_for: &str,
        timeout: Duration,
        cancel: &Cancel,
    ) -> Result<Vec<String>> {
        let deadline = Instant::now() + timeout;
        let mut lines = Vec::new();
        loop {
            match self.read_line_before(deadline, cancel)? {
                None => return Ok(lines),
                Some(line) => {
                    let hit = line.contains(wait_for);
                    lines.push(line);
                    if hit {
                        return Ok(lines);
                    }
                }
            }
        }
    }

    /// Reads a single line, polling every 100ms while no bytes are
    /// available, until `deadline` passes, `cancel` is set, or EOF is
    /// reached. The primitive underneath `collect_until`, and reused
    /// directly by the join and UDP exchange code for the multi-sentinel
    /// waits (`EVENT 25` vs `EVENT 24`, `ERXUDP` vs `EVENT 21/29`) that a
    /// single substring match can't express.
    pub fn read_line_before(
        &mut self,
        deadline: Instant,
        cancel: &Cancel,
    ) -> Result<Option<String>> {
        loop {
            if cancel.is_set() || Instant::now() >= deadline {
                return Ok(None);
            }
            if !self.line.bytes_available() {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
            return Ok(self.line.read_line()?);
        }
    }

    pub fn drain(&mut self) {
        self.line.drain();
    }
}

/// Convenience used by callers that just want `OK`-sentinel commands to
/// fail loudly instead of silently timing out with a partial transcript.
pub fn require_ok(lines: &[String]) -> Result<()> {
    if lines.iter().any(|l| l == "OK") {
        Ok(())
    } else {
        Err(Error::UnexpectedResponse(lines.join(" | ")))
    }
}
