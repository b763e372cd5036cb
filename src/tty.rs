//! Byte-level serial transport: opens the dongle's TTY, frames lines on
//! CR/LF, and exposes a non-blocking probe plus a drain used by the
//! supervisor when recovering from a reset.

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::prelude::*;
use std::path::Path;
use std::slice;
use std::time::Duration;

use libc::{cfsetspeed, speed_t};
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags};
use nix::{self, libc, unistd};

/// Inactivity read timeout for a line read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

fn close(fd: RawFd) {
    let _ = unistd::close(fd);
}

#[derive(Debug)]
pub struct Error(io::Error);

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        match err {
            nix::Error::InvalidPath => Error(io::Error::new(io::ErrorKind::InvalidInput, err)),
            nix::Error::InvalidUtf8 => Error(io::Error::new(io::ErrorKind::Other, err)),
            nix::Error::UnsupportedOperation => Error(io::Error::new(io::ErrorKind::Other, err)),
            nix::Error::Sys(errno) => Error(io::Error::from_raw_os_error(errno as i32)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self(err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        err.0
    }
}

/// Transport seam so the supervisor and codec tests can run against a
/// scripted transcript instead of a real dongle.
pub trait SerialLine {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), Error>;
    /// Reads one line, stripping the CR/LF terminator(s). Returns `Ok(None)`
    /// on timeout/EOF with nothing buffered; empty lines are skipped.
    fn read_line(&mut self) -> Result<Option<String>, Error>;
    fn bytes_available(&mut self) -> bool;
    /// Reads and discards whatever is currently buffered, without blocking.
    fn drain(&mut self);
}

#[derive(Debug)]
pub struct TTYPort {
    fd: RawFd,
    #[allow(dead_code)]
    port_name: Option<String>,
    #[allow(dead_code)]
    baud_rate: u32,
    timeout: Duration,
    buf: Vec<u8>,
}

impl TTYPort {
    pub fn open(path_str: String, baud_rate: u32, timeout: Duration) -> Result<TTYPort, Error> {
        use nix::libc::{tcgetattr, tcsetattr};

        let path = Path::new(&path_str);
        let fd = nix::fcntl::open(
            path,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            nix::sys::stat::Mode::empty(),
        )?;

        let mut termios = MaybeUninit::uninit();
        let res = unsafe { tcgetattr(fd, termios.as_mut_ptr()) };
        if let Err(e) = nix::errno::Errno::result(res) {
            close(fd);
            return Err(e.into());
        }
        let mut termios = unsafe { termios.assume_init() };

        {
            termios.c_cflag = libc::CS8 | libc::CREAD | libc::CLOCAL | libc::HUPCL;
            termios.c_lflag &= !(libc::ICANON
                | libc::ECHO
                | libc::ECHOE
                | libc::ECHOK
                | libc::ECHONL
                | libc::ISIG
                | libc::IEXTEN);
            termios.c_oflag &= !(libc::OPOST | libc::ONLCR | libc::OCRNL);
            termios.c_iflag &= !(libc::INLCR | libc::IGNCR | libc::ICRNL | libc::IGNBRK);
            termios.c_cc[libc::VTIME] = 0;
            unsafe { cfsetspeed(&mut termios, baud_rate as speed_t) };
            unsafe { tcsetattr(fd, libc::TCSANOW, &termios) };
            unsafe { libc::tcflush(fd, libc::TCIOFLUSH) };
            nix::fcntl::fcntl(fd, nix::fcntl::F_SETFL(nix::fcntl::OFlag::empty()))?;

            Ok(())
        }
        .map_err(|e: Error| {
            close(fd);
            e
        })?;

        Ok(TTYPort {
            fd,
            port_name: Some(path_str),
            baud_rate,
            timeout,
            buf: Vec::new(),
        })
    }

    fn fill_from_fd(&mut self) -> Result<usize, Error> {
        let mut chunk = [0u8; 256];
        let n = io::Read::read(self, &mut chunk)?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

impl Drop for TTYPort {
    fn drop(&mut self) {
        close(self.fd);
    }
}

impl io::Read for TTYPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Err(e) = wait_read_fd(self.fd, self.timeout) {
            return Err(Error::from(e).into());
        }
        nix::unistd::read(self.fd, buf).map_err(|e| Error::from(e).into())
    }
}

impl io::Write for TTYPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        nix::unistd::write(self.fd, buf).map_err(|e| Error::from(e).into())
    }

    fn flush(&mut self) -> io::Result<()> {
        nix::sys::termios::tcdrain(self.fd)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "flush failed"))
    }
}

impl SerialLine for TTYPort {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        io::Write::write_all(self, buf)?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>, Error> {
        loop {
            if let Some(pos) = memchr::memchr2(b'\r', b'\n', &self.buf) {
                let content_len = pos;
                let mut consume = pos + 1;
                if consume < self.buf.len()
                    && ((self.buf[pos] == b'\r' && self.buf[consume] == b'\n')
                        || (self.buf[pos] == b'\n' && self.buf[consume] == b'\r'))
                {
                    consume += 1;
                }
                let line: Vec<u8> = self.buf.drain(..consume).collect();
                let text = String::from_utf8_lossy(&line[..content_len]).into_owned();
                if text.is_empty() {
                    continue;
                }
                return Ok(Some(text));
            }
            match self.fill_from_fd() {
                Ok(0) => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let text = String::from_utf8_lossy(&self.buf).into_owned();
                    self.buf.clear();
                    if text.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(text));
                }
                Ok(_) => continue,
                Err(Error(io_err)) if io_err.kind() == io::ErrorKind::TimedOut => {
                    return Ok(None)
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn bytes_available(&mut self) -> bool {
        if !self.buf.is_empty() {
            return true;
        }
        matches!(poll_readable(self.fd, Duration::from_millis(0)), Ok(true))
    }

    fn drain(&mut self) {
        self.buf.clear();
        while let Ok(true) = poll_readable(self.fd, Duration::from_millis(0)) {
            let mut chunk = [0u8; 256];
            match nix::unistd::read(self.fd, &mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }
}

fn wait_read_fd(fd: RawFd, timeout: Duration) -> Result<(), Error> {
    wait_fd(fd, PollFlags::POLLIN, timeout)
}

fn wait_fd(fd: RawFd, events: PollFlags, timeout: Duration) -> Result<(), Error> {
    use nix::errno::Errno::{EIO, EPIPE};

    let mut fd = PollFd::new(fd, events);

    let milliseconds =
        timeout.as_secs() as i64 * 1000 + i64::from(timeout.subsec_nanos()) / 1_000_000;
    let wait_res = nix::poll::poll(slice::from_mut(&mut fd), milliseconds as nix::libc::c_int);

    let wait = match wait_res {
        Ok(r) => r,
        Err(e) => return Err(Error::from(e)),
    };
    if wait == 0 {
        return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out").into());
    }

    match fd.revents() {
        Some(e) if e.contains(events) => Ok(()),
        Some(e) if e.contains(PollFlags::POLLHUP) || e.contains(PollFlags::POLLNVAL) => {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, EPIPE.desc()).into())
        }
        _ => Err(io::Error::new(io::ErrorKind::Other, EIO.desc()).into()),
    }
}

fn poll_readable(fd: RawFd, timeout: Duration) -> Result<bool, Error> {
    let mut fd = PollFd::new(fd, PollFlags::POLLIN);
    let milliseconds =
        timeout.as_secs() as i64 * 1000 + i64::from(timeout.subsec_nanos()) / 1_000_000;
    let wait = nix::poll::poll(slice::from_mut(&mut fd), milliseconds as nix::libc::c_int)?;
    Ok(wait > 0 && fd.revents().map_or(false, |e| e.contains(PollFlags::POLLIN)))
}

/// In-memory [`SerialLine`] driven by a scripted transcript, for tests that
/// exercise the dispatcher/codec/supervisor without a dongle.
#[cfg(test)]
pub struct ScriptedSerial {
    pub inbox: std::collections::VecDeque<String>,
    pub written: Vec<u8>,
}

#[cfg(test)]
impl ScriptedSerial {
    pub fn new(lines: Vec<&str>) -> Self {
        ScriptedSerial {
            inbox: lines.into_iter().map(|l| l.to_string()).collect(),
            written: Vec::new(),
        }
    }

    pub fn push_line(&mut self, line: &str) {
        self.inbox.push_back(line.to_string());
    }
}

#[cfg(test)]
impl SerialLine for ScriptedSerial {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.written.extend_from_slice(buf);
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>, Error> {
        Ok(self.inbox.pop_front())
    }

    fn bytes_available(&mut self) -> bool {
        !self.inbox.is_empty()
    }

    /// No-op: unlike a real serial buffer, a scripted transcript never
    /// contains noise the test didn't put there deliberately, so draining
    /// it would just discard the next expected reply. Tests that want to
    /// verify noise gets discarded push it explicitly and assert on it.
    fn drain(&mut self) {}
}
