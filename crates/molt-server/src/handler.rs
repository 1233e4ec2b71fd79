//! Default connection handler: a small HTTP/1.1 responder.
//!
//! Every request is answered with `200 OK` and the pid of the serving process
//! as the body, which makes handoffs visible from outside. Connections are
//! kept alive until the client sends `Connection: close`, speaks HTTP/1.0
//! without asking for keep-alive, or hangs up.
//!
//! Once the process starts draining, an idle connection is closed right away
//! and a request already on the wire is answered with `Connection: close`.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use molt_ecdysis::ConnectionHandler;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const MAX_LINE_LEN: usize = 8 * 1024;
const MAX_HEADERS: usize = 100;

#[derive(Debug, Default)]
pub struct StatusHandler {
    served: AtomicU64,
}

impl StatusHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }
}

impl ConnectionHandler for StatusHandler {
    async fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        draining: CancellationToken,
    ) -> anyhow::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        loop {
            // Idle between requests: bytes already buffered win over draining.
            tokio::select! {
                biased;
                ready = reader.fill_buf() => {
                    if ready?.is_empty() {
                        break;
                    }
                }
                () = draining.cancelled() => {
                    debug!(%peer, "Closing idle connection, server is draining");
                    break;
                }
            }

            let Some(request) = read_request_head(&mut reader).await? else {
                break;
            };
            self.served.fetch_add(1, Ordering::Relaxed);

            let keep_alive = request.keep_alive && !draining.is_cancelled();
            debug!(
                %peer,
                method = %request.method,
                path = %request.path,
                keep_alive,
                "Request"
            );

            writer
                .write_all(render_response(std::process::id(), keep_alive).as_bytes())
                .await?;

            if !keep_alive {
                break;
            }
        }

        writer.shutdown().await?;
        Ok(())
    }

    fn on_reload(&self) {
        info!(served = self.served(), "Reload requested");
    }

    fn on_shutdown(&self) {
        info!(served = self.served(), "Application shutting down");
    }
}

#[derive(Debug, PartialEq, Eq)]
struct RequestHead {
    method: String,
    path: String,
    keep_alive: bool,
}

/// Read a request line and headers. `None` on a clean EOF between requests.
async fn read_request_head<R>(reader: &mut R) -> io::Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if read_line(reader, &mut line).await? == 0 {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid_data("malformed request line"));
    };
    let method = method.to_owned();
    let path = path.to_owned();
    let mut keep_alive = version.eq_ignore_ascii_case("HTTP/1.1");

    for _ in 0..MAX_HEADERS {
        line.clear();
        if read_line(reader, &mut line).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let header = line.trim_end();
        if header.is_empty() {
            return Ok(Some(RequestHead {
                method,
                path,
                keep_alive,
            }));
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("connection") {
                let value = value.trim();
                if value.eq_ignore_ascii_case("close") {
                    keep_alive = false;
                } else if value.eq_ignore_ascii_case("keep-alive") {
                    keep_alive = true;
                }
            }
        }
    }
    Err(invalid_data("too many headers"))
}

async fn read_line<R>(reader: &mut R, buf: &mut String) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64)
        .read_line(buf)
        .await?;
    if n == MAX_LINE_LEN && !buf.ends_with('\n') {
        return Err(invalid_data("line too long"));
    }
    Ok(n)
}

fn render_response(pid: u32, keep_alive: bool) -> String {
    let body = format!("{pid}\n");
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n{}",
        body.len(),
        if keep_alive { "keep-alive" } else { "close" },
        body
    )
}

fn invalid_data(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
