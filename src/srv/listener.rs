//! Built-in listener hosted by each worker.
//!
//! It accepts TCP connections and answers every request with a short plain-text HTTP/1.1
//! response identifying the worker. Translating requests into application responses is not
//! done here.

use crate::srv::event::event;
use anyhow::Context as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const MAX_HEAD_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerOptions {
    pub root_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub env: String,
    pub standalone: bool,
    pub apc: bool,
    pub cache: bool,
}

pub fn configure(opts: ListenerOptions) -> ListenerBuilder {
    ListenerBuilder { opts }
}

#[derive(Debug)]
pub struct ListenerBuilder {
    opts: ListenerOptions,
}

impl ListenerBuilder {
    /// Bind the socket. Must be called inside a tokio runtime.
    pub async fn build(self) -> anyhow::Result<Listener> {
        let addr = format!("{}:{}", self.opts.host, self.opts.port);
        let socket = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        Ok(Listener {
            socket,
            opts: Arc::new(self.opts),
            next_request_id: Arc::new(AtomicU64::new(1)),
        })
    }
}

/// Per-connection values handed down the call chain.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub peer: SocketAddr,
    pub request_id: u64,
}

#[derive(Debug)]
pub struct Listener {
    socket: TcpListener,
    opts: Arc<ListenerOptions>,
    next_request_id: Arc<AtomicU64>,
}

impl Listener {
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socket.local_addr().context("listener local_addr")
    }

    /// Serve until the accept loop fails. Each connection runs on its own task.
    pub async fn run(self) -> anyhow::Result<()> {
        let target = Some((self.opts.host.as_str(), self.opts.port));
        event(
            "listener",
            target,
            format!(
                "serving root_dir={} env={} standalone={} apc={} cache={}",
                self.opts.root_dir.display(),
                self.opts.env,
                self.opts.standalone,
                self.opts.apc,
                self.opts.cache
            ),
        );
        loop {
            let (stream, peer) = match self.socket.accept().await {
                Ok(v) => v,
                Err(e) => {
                    event("listener", target, format!("accept error: {e}"));
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    continue;
                }
            };
            let ctx = RequestContext {
                peer,
                request_id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            };
            let opts = Arc::clone(&self.opts);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, ctx.clone(), &opts).await {
                    event(
                        "listener",
                        Some((opts.host.as_str(), opts.port)),
                        format!("request_id={} peer={} error: {e}", ctx.request_id, ctx.peer),
                    );
                }
            });
        }
    }
}

async fn handle_connection(mut stream: TcpStream, ctx: RequestContext, opts: &ListenerOptions) -> anyhow::Result<()> {
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < MAX_HEAD_BYTES {
        let n = stream.read(&mut buf).await.context("read request")?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    let request_line = String::from_utf8_lossy(&head)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    let response = render_response(&request_line, &ctx, opts);
    stream.write_all(response.as_bytes()).await.context("write response")?;
    stream.shutdown().await.ok();
    Ok(())
}

fn render_response(request_line: &str, ctx: &RequestContext, opts: &ListenerOptions) -> String {
    let mut parts = request_line.split_whitespace();
    let (status, body) = match (parts.next(), parts.next()) {
        (Some(method), Some(path)) => (
            "200 OK",
            format!(
                "reactd worker {}:{} env={} {method} {path}\n",
                opts.host, opts.port, opts.env
            ),
        ),
        _ => ("400 Bad Request", "bad request\n".to_string()),
    };
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nX-Request-Id: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
        ctx.request_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(port: u16) -> ListenerOptions {
        ListenerOptions {
            root_dir: PathBuf::from("."),
            host: "127.0.0.1".into(),
            port,
            env: "test".into(),
            standalone: false,
            apc: false,
            cache: false,
        }
    }

    #[test]
    fn malformed_request_line_gets_400() {
        let ctx = RequestContext {
            peer: "127.0.0.1:1".parse().unwrap(),
            request_id: 9,
        };
        let r = render_response("", &ctx, &opts(80));
        assert!(r.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(r.contains("X-Request-Id: 9\r\n"));
    }

    #[tokio::test]
    async fn serves_requests_with_distinct_ids() {
        let listener = configure(opts(0)).build().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(listener.run());

        let mut ids = Vec::new();
        for _ in 0..2 {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
            let mut out = String::new();
            s.read_to_string(&mut out).await.unwrap();
            assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
            assert!(out.contains("env=test GET /health"), "{out}");
            let id = out
                .lines()
                .find_map(|l| l.strip_prefix("X-Request-Id: "))
                .unwrap()
                .to_string();
            ids.push(id);
        }
        assert_ne!(ids[0], ids[1]);
        server.abort();
    }

    #[tokio::test]
    async fn bind_conflict_is_an_error() {
        let first = configure(opts(0)).build().await.unwrap();
        let port = first.local_addr().unwrap().port();
        let err = configure(opts(port)).build().await.unwrap_err();
        assert!(err.to_string().contains("bind 127.0.0.1:"), "{err}");
    }
}
