//! Scripted loopback servers for the integration suites: a keep-alive
//! HTTP/1.1 server and a `CONNECT` proxy, each on its own thread with a
//! current-thread runtime.

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc as std_mpsc, Arc,
    },
    thread,
    time::Duration,
};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime;
use tokio::sync::oneshot;

pub struct Server {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    panic_rx: std_mpsc::Receiver<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Server {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// TCP connections accepted so far.
    pub fn accepted_connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if !thread::panicking() {
            self.panic_rx
                .recv_timeout(Duration::from_secs(3))
                .expect("test server should not panic");
        }
    }
}

/// One parsed request as the scripted handler sees it: the raw head plus
/// the body bytes.
pub struct ScriptedRequest {
    pub head: String,
    pub body: Vec<u8>,
}

impl ScriptedRequest {
    pub fn path(&self) -> &str {
        self.head.split_whitespace().nth(1).unwrap_or("/")
    }
}

/// Start an HTTP/1.1 server; `func` maps each request to raw response
/// bytes. Connections are kept alive until the peer closes or the response
/// says `Connection: close`.
pub fn http1<F>(func: F) -> Server
where
    F: Fn(ScriptedRequest) -> Vec<u8> + Clone + Send + 'static,
{
    http1_delayed(Duration::ZERO, func)
}

/// Like [`http1`], sleeping `delay` before each response.
pub fn http1_delayed<F>(delay: Duration, func: F) -> Server
where
    F: Fn(ScriptedRequest) -> Vec<u8> + Clone + Send + 'static,
{
    serve(move |mut sock, accepted| {
        let func = func.clone();
        async move {
            let _ = accepted;
            loop {
                let request = match read_request(&mut sock).await {
                    Some(request) => request,
                    None => break,
                };
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                let response = func(request);
                let close = response_says_close(&response);
                if sock.write_all(&response).await.is_err() {
                    break;
                }
                if close {
                    break;
                }
            }
        }
    })
}

/// Start a `CONNECT` proxy that requires the given `Proxy-Authorization`
/// value, then answers one tunneled HTTP/1.1 request with `response`.
///
/// `close_on_challenge` makes the 407 hang up, forcing the client onto a
/// fresh socket for the authenticated retry.
pub fn connect_proxy(
    expected_authorization: &'static str,
    close_on_challenge: bool,
    response: &'static [u8],
) -> Server {
    serve(move |mut sock, _accepted| async move {
        loop {
            let request = match read_request(&mut sock).await {
                Some(request) => request,
                None => return,
            };
            assert!(
                request.head.starts_with("CONNECT "),
                "expected CONNECT, got: {}",
                request.head
            );

            let authorized = request
                .head
                .lines()
                .any(|line| line.eq_ignore_ascii_case(&format!("proxy-authorization: {expected_authorization}")));

            if !authorized {
                let challenge = if close_on_challenge {
                    "HTTP/1.1 407 Proxy Authentication Required\r\n\
                     Proxy-Authenticate: Basic realm=\"test\"\r\n\
                     Connection: close\r\n\
                     Content-Length: 0\r\n\r\n"
                } else {
                    "HTTP/1.1 407 Proxy Authentication Required\r\n\
                     Proxy-Authenticate: Basic realm=\"test\"\r\n\
                     Content-Length: 0\r\n\r\n"
                };
                if sock.write_all(challenge.as_bytes()).await.is_err() {
                    return;
                }
                if close_on_challenge {
                    return;
                }
                continue;
            }

            if sock.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.is_err() {
                return;
            }

            // Tunneled bytes: one plain HTTP/1.1 exchange.
            if let Some(_tunneled) = read_request(&mut sock).await {
                let _ = sock.write_all(response).await;
            }
            return;
        }
    })
}

/// A proxy that always challenges, to exercise the attempt ceiling.
pub fn endless_challenge_proxy() -> Server {
    serve(move |mut sock, _accepted| async move {
        while read_request(&mut sock).await.is_some() {
            let challenge = "HTTP/1.1 407 Proxy Authentication Required\r\n\
                 Proxy-Authenticate: Basic realm=\"test\"\r\n\
                 Content-Length: 0\r\n\r\n";
            if sock.write_all(challenge.as_bytes()).await.is_err() {
                return;
            }
        }
    })
}

fn serve<F, Fut>(handler: F) -> Server
where
    F: Fn(TcpStream, usize) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = ()> + 'static,
{
    let accepted = Arc::new(AtomicUsize::new(0));
    let accepted_outer = accepted.clone();
    let (addr_tx, addr_rx) = std_mpsc::channel();
    let (panic_tx, panic_rx) = std_mpsc::channel();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let test_name = thread::current().name().unwrap_or("<unknown>").to_string();
    thread::Builder::new()
        .name(format!("test({test_name})-support-server"))
        .spawn(move || {
            let rt = runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("new rt");
            let local = tokio::task::LocalSet::new();
            local.block_on(&rt, async move {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                addr_tx.send(listener.local_addr().unwrap()).unwrap();

                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        accepted_conn = listener.accept() => {
                            let (sock, _) = accepted_conn.expect("accept");
                            let n = accepted.fetch_add(1, Ordering::SeqCst);
                            let handler = handler.clone();
                            tokio::task::spawn_local(handler(sock, n));
                        }
                    }
                }
            });
            let _ = panic_tx.send(());
        })
        .expect("thread spawn");

    Server {
        addr: addr_rx.recv().expect("server addr"),
        accepted: accepted_outer,
        panic_rx,
        shutdown_tx: Some(shutdown_tx),
    }
}

async fn read_request(sock: &mut TcpStream) -> Option<ScriptedRequest> {
    let mut buf = Vec::new();
    loop {
        if let Some(pos) = find_blank_line(&buf) {
            let head = String::from_utf8_lossy(&buf[..pos]).to_string();
            let mut body: Vec<u8> = buf[pos + 4..].to_vec();
            let length = content_length(&head);
            while body.len() < length {
                let mut chunk = [0u8; 4096];
                let n = sock.read(&mut chunk).await.ok()?;
                if n == 0 {
                    return None;
                }
                body.extend_from_slice(&chunk[..n]);
            }
            return Some(ScriptedRequest { head, body });
        }
        let mut chunk = [0u8; 4096];
        let n = sock.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn content_length(head: &str) -> usize {
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0)
}

fn response_says_close(response: &[u8]) -> bool {
    let text = String::from_utf8_lossy(response);
    text.lines()
        .take_while(|line| !line.is_empty())
        .any(|line| line.eq_ignore_ascii_case("connection: close"))
}
