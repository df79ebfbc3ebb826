mod support;

use std::time::Duration;

use courier::{AddressPolicy, Client, Request};
use support::server;

fn hello_server() -> server::Server {
    server::http1(|_req| b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec())
}

#[tokio::test]
async fn zero_idle_budget_closes_connections_immediately() {
    let _ = env_logger::try_init();
    let server = hello_server();

    let client = Client::builder()
        .max_idle_connections(0)
        .keep_alive_duration(Duration::from_millis(1))
        .build()
        .unwrap();
    let url = format!("http://{}/", server.addr());

    let response = client
        .new_call(Request::get(&url).unwrap())
        .execute()
        .await
        .unwrap();
    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], b"hello");

    // The carrier has no idle budget: it is released for closure as soon
    // as the exchange completes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.pool().connection_count(), 0);
}

#[tokio::test]
async fn keep_alive_expiry_evicts_the_longest_idle_connection() {
    let server = hello_server();
    let client = Client::builder()
        .keep_alive_duration(Duration::from_millis(60))
        .build()
        .unwrap();
    let url = format!("http://{}/", server.addr());

    let response = client
        .new_call(Request::get(&url).unwrap())
        .execute()
        .await
        .unwrap();
    drop(response.bytes().await.unwrap());
    assert_eq!(client.pool().connection_count(), 1);
    assert_eq!(client.pool().idle_connection_count(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.pool().connection_count(), 0);
}

#[tokio::test]
async fn evict_all_closes_idle_connections() {
    let server = hello_server();
    let client = Client::builder().build().unwrap();
    let url = format!("http://{}/", server.addr());

    let response = client
        .new_call(Request::get(&url).unwrap())
        .execute()
        .await
        .unwrap();
    drop(response.bytes().await.unwrap());
    assert_eq!(client.pool().connection_count(), 1);

    client.pool().evict_all();
    assert_eq!(client.pool().connection_count(), 0);
    assert_eq!(client.pool().idle_connection_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn address_policy_keeps_minimum_connections_warm() {
    let _ = env_logger::try_init();
    let server = hello_server();
    let client = Client::builder().build().unwrap();

    let uri: courier::Uri = format!("http://{}/", server.addr()).parse().unwrap();
    let address = client.address(&uri).unwrap();

    client.pool().set_policy(
        address,
        AddressPolicy {
            minimum_concurrent_calls: 2,
            backoff_delay_millis: 100,
            backoff_jitter_millis: 10,
        },
    );

    // Within the backoff budget after quiescence the pool holds the
    // minimum.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if client.pool().connection_count() >= 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "policy never warmed the pool: {} connections",
            client.pool().connection_count()
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(server.accepted_connections() >= 2);
}
