mod support;

use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier::{Callback, Client, Error, Request, Response};
use support::fakes::{FakeTls, RecordingListener, ScriptedSocketFactory};
use support::server;

fn hello_server() -> server::Server {
    server::http1(|_req| b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec())
}

#[tokio::test]
async fn simple_get_over_plaintext() {
    let _ = env_logger::try_init();
    let server = hello_server();

    let client = Client::builder().build().unwrap();
    let url = format!("http://{}/", server.addr());

    let response = client
        .new_call(Request::get(&url).unwrap())
        .execute()
        .await
        .unwrap();
    assert_eq!(response.status(), courier::StatusCode::OK);
    assert!(response.handshake().is_none());
    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], b"hello");

    assert_eq!(client.pool().connection_count(), 1);
    assert_eq!(client.pool().idle_connection_count(), 1);
}

#[tokio::test]
async fn simple_get_over_injected_tls() {
    let _ = env_logger::try_init();
    let server = hello_server();

    let tls = FakeTls::new(Some("http/1.1"), &["h1.example"]);
    let handshakes = tls.handshake_counter();
    let listener = RecordingListener::new();
    let log = listener.log();

    let client = Client::builder()
        .dns(courier::dns::StaticResolver::new().insert(
            "h1.example",
            vec!["127.0.0.1".parse::<IpAddr>().unwrap()],
        ))
        .socket_factory(ScriptedSocketFactory::new(server.addr()))
        .tls_socket_factory(tls)
        .event_listener(listener)
        .build()
        .unwrap();

    let response = client
        .new_call(Request::get("https://h1.example/").unwrap())
        .execute()
        .await
        .unwrap();
    assert_eq!(response.status(), courier::StatusCode::OK);

    // The injected handshake is reported back on the response, with the
    // fields the collaborator filled in and nothing synthesized.
    let handshake = response.handshake().expect("tls handshake");
    assert_eq!(handshake.tls_version(), Some(courier::TlsVersion::Tls13));
    assert!(handshake.peer_certificates()[0].covers("h1.example"));

    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], b"hello");
    assert_eq!(handshakes.load(Ordering::SeqCst), 1);
    assert_eq!(client.pool().idle_connection_count(), 1);

    let events = log.lock().unwrap().clone();
    let expected_order = [
        "call_start",
        "dns_start",
        "dns_end",
        "connect_start",
        "secure_connect_start",
        "secure_connect_end",
        "connect_end",
        "connection_acquired",
        "request_headers_start",
        "request_headers_end",
        "response_headers_start",
        "response_headers_end",
        "response_body_end",
        "connection_released",
        "call_end",
    ];
    let mut last = 0;
    for expected in expected_order {
        let position = events[last..]
            .iter()
            .position(|e| e == expected)
            .unwrap_or_else(|| panic!("missing {expected} after index {last} in {events:?}"));
        last += position + 1;
    }
}

#[tokio::test]
async fn tls_negotiation_failure_falls_back_to_the_next_spec() {
    let _ = env_logger::try_init();
    let server = hello_server();

    // The first handshake fails generically; the retry under the
    // compatible profile succeeds on a fresh socket.
    let tls = FakeTls::new(Some("http/1.1"), &["h1.example"])
        .fail_next(courier::tls::TlsFailure::Handshake);
    let handshakes = tls.handshake_counter();

    let client = Client::builder()
        .dns(courier::dns::StaticResolver::new().insert(
            "h1.example",
            vec!["127.0.0.1".parse::<IpAddr>().unwrap()],
        ))
        .socket_factory(ScriptedSocketFactory::new(server.addr()))
        .tls_socket_factory(tls)
        .build()
        .unwrap();

    let response = client
        .new_call(Request::get("https://h1.example/").unwrap())
        .execute()
        .await
        .unwrap();
    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], b"hello");
    assert_eq!(handshakes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn certificate_chain_rejection_never_falls_back() {
    let _ = env_logger::try_init();
    let server = hello_server();

    // A rejected chain would be rejected under every profile; no weaker
    // spec is attempted.
    let tls = FakeTls::new(Some("http/1.1"), &["h1.example"])
        .fail_next(courier::tls::TlsFailure::CertificateChain);
    let handshakes = tls.handshake_counter();

    let client = Client::builder()
        .dns(courier::dns::StaticResolver::new().insert(
            "h1.example",
            vec!["127.0.0.1".parse::<IpAddr>().unwrap()],
        ))
        .socket_factory(ScriptedSocketFactory::new(server.addr()))
        .tls_socket_factory(tls)
        .build()
        .unwrap();

    let err = client
        .new_call(Request::get("https://h1.example/").unwrap())
        .execute()
        .await
        .unwrap_err();
    assert!(err.is_tls(), "{err:?}");
    assert_eq!(handshakes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sequential_calls_reuse_the_connection() {
    let server = hello_server();
    let client = Client::builder().build().unwrap();
    let url = format!("http://{}/", server.addr());

    for _ in 0..3 {
        let response = client
            .new_call(Request::get(&url).unwrap())
            .execute()
            .await
            .unwrap();
        let body = response.bytes().await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    assert_eq!(server.accepted_connections(), 1);
    assert_eq!(client.pool().connection_count(), 1);
}

#[tokio::test]
async fn post_round_trips_the_body() {
    let server = server::http1(|req| {
        assert_eq!(req.body, b"ping");
        b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong".to_vec()
    });
    let client = Client::builder().build().unwrap();
    let url = format!("http://{}/echo", server.addr());

    let response = client
        .new_call(Request::post(&url, "ping").unwrap())
        .execute()
        .await
        .unwrap();
    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], b"pong");
}

struct ChannelCallback {
    tx: Mutex<Option<std::sync::mpsc::Sender<Result<u16, Error>>>>,
}

impl ChannelCallback {
    fn pair() -> (ChannelCallback, std::sync::mpsc::Receiver<Result<u16, Error>>) {
        let (tx, rx) = std::sync::mpsc::channel();
        (
            ChannelCallback {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn deliver(&self, outcome: Result<u16, Error>) {
        let tx = self
            .tx
            .lock()
            .unwrap()
            .take()
            .expect("exactly one terminal callback per call");
        tx.send(outcome).unwrap();
    }
}

impl Callback for ChannelCallback {
    fn on_response(&self, _call: courier::Call, response: Response) {
        self.deliver(Ok(response.status().as_u16()));
    }

    fn on_failure(&self, _call: courier::Call, error: Error) {
        self.deliver(Err(error));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn enqueue_delivers_exactly_one_callback() {
    let server = hello_server();
    let client = Client::builder().build().unwrap();
    let url = format!("http://{}/", server.addr());

    let (callback, rx) = ChannelCallback::pair();
    client.new_call(Request::get(&url).unwrap()).enqueue(callback);

    let outcome = tokio::task::spawn_blocking(move || {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    })
    .await
    .unwrap();
    assert_eq!(outcome.unwrap(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn canceled_call_fails_through_on_failure() {
    let server = server::http1_delayed(Duration::from_secs(5), |_req| {
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()
    });
    let client = Client::builder().build().unwrap();
    let url = format!("http://{}/", server.addr());

    let (callback, rx) = ChannelCallback::pair();
    let call = client.new_call(Request::get(&url).unwrap());
    call.enqueue(callback);

    tokio::time::sleep(Duration::from_millis(200)).await;
    call.cancel();
    // Idempotent from any thread.
    call.cancel();
    assert!(call.is_canceled());

    let outcome = tokio::task::spawn_blocking(move || {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    })
    .await
    .unwrap();
    assert!(outcome.unwrap_err().is_canceled());
}

#[tokio::test]
async fn call_executes_at_most_once() {
    let server = hello_server();
    let client = Client::builder().build().unwrap();
    let url = format!("http://{}/", server.addr());

    let call = client.new_call(Request::get(&url).unwrap());
    assert!(!call.is_executed());
    let response = call.execute().await.unwrap();
    drop(response.bytes().await.unwrap());
    assert!(call.is_executed());

    let err = call.execute().await.unwrap_err();
    assert!(err.is_builder());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatcher_enforces_per_host_limit() {
    let server = server::http1_delayed(Duration::from_millis(400), |_req| {
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()
    });

    let idle_fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let idle_counter = idle_fired.clone();
    let client = Client::builder()
        .max_requests_per_host(2)
        .idle_callback(move || {
            idle_counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    let url = format!("http://{}/", server.addr());

    let mut receivers = Vec::new();
    for _ in 0..4 {
        let (callback, rx) = ChannelCallback::pair();
        client.new_call(Request::get(&url).unwrap()).enqueue(callback);
        receivers.push(rx);
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(client.dispatcher().running_calls_count(), 2);
    assert_eq!(client.dispatcher().queued_calls_count(), 2);

    for rx in receivers {
        let outcome = tokio::task::spawn_blocking(move || {
            rx.recv_timeout(Duration::from_secs(5)).unwrap()
        })
        .await
        .unwrap();
        assert_eq!(outcome.unwrap(), 200);
    }
    // All four completed; the dispatcher drained exactly once.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(idle_fired.load(Ordering::SeqCst), 1);
    assert_eq!(client.dispatcher().running_calls_count(), 0);
}

#[tokio::test]
async fn dispatcher_shutdown_rejects_queued_and_new_calls() {
    let server = hello_server();
    let client = Client::builder().build().unwrap();
    let url = format!("http://{}/", server.addr());

    client.dispatcher().shutdown();

    let (callback, rx) = ChannelCallback::pair();
    client.new_call(Request::get(&url).unwrap()).enqueue(callback);
    let outcome = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(outcome.unwrap_err().is_rejected());
}
