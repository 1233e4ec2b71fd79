//! Test utilities for driving a real `molt-server` process.
//!
//! Starts the binary on a free loopback port, talks HTTP/1.1 to it over
//! plain std sockets and delivers signals with `libc::kill`.

#![allow(dead_code)]

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Reserve a loopback port that is free right now.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

pub fn send_signal(pid: u32, signal: libc::c_int) {
    // SAFETY: kill has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    assert_eq!(rc, 0, "kill({pid}, {signal}) failed: {}", io::Error::last_os_error());
}

pub fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// A `molt-server` started by the test, plus any replacements it spawned.
pub struct ServerProcess {
    child: Child,
    addr: SocketAddr,
    pid_file: PathBuf,
    adopted: Vec<u32>,
}

impl ServerProcess {
    /// Start the server and wait until it has written its pid file.
    pub fn start(dir: &Path) -> Self {
        Self::start_program(Path::new(env!("CARGO_BIN_EXE_molt-server")), dir)
    }

    /// Like [`ServerProcess::start`], running `program` instead of the built binary.
    pub fn start_program(program: &Path, dir: &Path) -> Self {
        let addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().unwrap();
        let pid_file = dir.join("molt.pid");

        let mut command = Command::new(program);
        command
            .arg("--listen")
            .arg(addr.to_string())
            .arg("--pid-file")
            .arg(&pid_file)
            .arg("--drain-timeout-secs")
            .arg("20")
            .env_remove("MOLT_SPAWNED")
            .env("RUST_LOG", "info")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // A freshly copied binary can be briefly busy while another test
        // thread's fork still holds the write descriptor.
        let mut attempts = 0;
        let child = loop {
            match command.spawn() {
                Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempts < 20 => {
                    attempts += 1;
                    thread::sleep(POLL_INTERVAL);
                }
                result => break result.expect("Failed to start molt-server"),
            }
        };

        let server = Self {
            child,
            addr,
            pid_file,
            adopted: Vec::new(),
        };
        let pid = server.pid();
        server.wait_for_pid_file(|current| current == Some(pid));
        server
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn read_pid_file(&self) -> Option<u32> {
        std::fs::read_to_string(&self.pid_file)
            .ok()
            .and_then(|contents| contents.trim().parse().ok())
    }

    /// Poll the pid file until `pred` holds, returning its final contents.
    pub fn wait_for_pid_file(&self, pred: impl Fn(Option<u32>) -> bool) -> Option<u32> {
        let deadline = Instant::now() + DEFAULT_TIMEOUT;
        loop {
            let current = self.read_pid_file();
            if pred(current) {
                return current;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting on pid file, last contents: {current:?}"
            );
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Kill `pid` on teardown if the test fails before it exits on its own.
    pub fn adopt(&mut self, pid: u32) {
        self.adopted.push(pid);
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub fn wait_exit(&mut self, timeout: Duration) -> ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait().expect("try_wait") {
                return status;
            }
            assert!(Instant::now() < deadline, "server did not exit within {timeout:?}");
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if thread::panicking() {
            for &pid in &self.adopted {
                if process_alive(pid) {
                    // SAFETY: as in send_signal.
                    unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
                }
            }
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    /// The pid the server reported in the body.
    pub fn pid(&self) -> u32 {
        self.body.trim().parse().expect("body should be a pid")
    }
}

/// A client connection that can issue several keep-alive requests.
pub struct Connection {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Connection {
    pub fn open(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2))?;
        stream.set_read_timeout(Some(DEFAULT_TIMEOUT))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            writer: stream,
            reader,
        })
    }

    /// Send `GET /` and read one response. With `close`, asks the server to
    /// end the connection afterwards.
    pub fn get(&mut self, close: bool) -> io::Result<Response> {
        self.begin()?;
        self.finish(close)
    }

    /// Send the request line and first header only, leaving a request in
    /// progress on the server.
    pub fn begin(&mut self) -> io::Result<()> {
        self.writer.write_all(b"GET / HTTP/1.1\r\nHost: molt\r\n")?;
        self.writer.flush()
    }

    /// Complete a request started with [`Connection::begin`] and read the response.
    pub fn finish(&mut self, close: bool) -> io::Result<Response> {
        let connection = if close { "close" } else { "keep-alive" };
        write!(self.writer, "Connection: {connection}\r\n\r\n")?;
        self.writer.flush()?;

        let mut line = String::new();
        self.reader.read_line(&mut line)?;
        let status = line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, format!("bad status line {line:?}"))
            })?;

        let mut content_length = 0;
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            let header = line.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }

        let mut body = vec![0; content_length];
        self.reader.read_exact(&mut body)?;
        Ok(Response {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    /// Read until the server closes the connection; returns the bytes seen.
    pub fn read_to_end(&mut self) -> io::Result<usize> {
        let mut rest = Vec::new();
        self.reader.read_to_end(&mut rest)
    }
}
