//! Integration tests for the long-polling flow over real TCP: handshake,
//! session claim, event dispatch with acknowledgments, and server-initiated
//! calls answered by the client.

use std::{net::SocketAddr, sync::Arc, sync::OnceLock, time::Duration};

use rift_core::{Ack, Context, Server};
use testresult::TestResult;
use tokio::net::TcpListener;

fn init_tracing() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .init();
    });
}

async fn start_server(server: &Arc<Server>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local_addr");
    let app = server.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    address
}

async fn handshake(client: &reqwest::Client, address: SocketAddr) -> String {
    let body = client
        .get(format!("http://{address}/net.io/1/"))
        .send()
        .await
        .expect("handshake request")
        .text()
        .await
        .expect("handshake body");
    body.split(':').next().expect("sid").to_string()
}

async fn poll(client: &reqwest::Client, address: SocketAddr, sid: &str) -> String {
    client
        .get(format!("http://{address}/net.io/1/xhr-polling/{sid}"))
        .send()
        .await
        .expect("poll request")
        .text()
        .await
        .expect("poll body")
}

async fn post(client: &reqwest::Client, address: SocketAddr, sid: &str, body: &str) {
    let response = client
        .post(format!("http://{address}/net.io/1/xhr-polling/{sid}"))
        .body(body.to_string())
        .send()
        .await
        .expect("post request");
    assert!(
        response.status().is_success(),
        "post failed: {}",
        response.status()
    );
}

#[tokio::test]
async fn handshake_and_claim_deliver_the_connect_packet() -> TestResult {
    init_tracing();

    let server = Server::new();
    let address = start_server(&server).await;
    let client = reqwest::Client::new();

    let body = client
        .get(format!("http://{address}/net.io/1/"))
        .send()
        .await?
        .text()
        .await?;
    let parts: Vec<&str> = body.split(':').collect();
    assert_eq!(parts.len(), 4);
    let sid = parts[0];

    assert_eq!(poll(&client, address, sid).await, "1::");
    assert_eq!(server.session_count(), 1);

    Ok(())
}

#[tokio::test]
async fn acknowledged_event_roundtrip() -> TestResult {
    init_tracing();

    let server = Server::new();
    server.on("echo", |_ns: Context, message: String, ack: Ack| {
        let _ = ack.send((message,));
    });

    let address = start_server(&server).await;
    let client = reqwest::Client::new();
    let sid = handshake(&client, address).await;
    assert_eq!(poll(&client, address, &sid).await, "1::");

    post(
        &client,
        address,
        &sid,
        r#"5:7::{"name":"echo","args":["hello"]}"#,
    )
    .await;

    assert_eq!(poll(&client, address, &sid).await, r#"6:::7+["hello"]"#);
    Ok(())
}

#[tokio::test]
async fn burst_of_broadcasts_coalesces_into_one_framed_payload() -> TestResult {
    init_tracing();

    let server = Server::new();
    let address = start_server(&server).await;
    let client = reqwest::Client::new();
    let sid = handshake(&client, address).await;
    assert_eq!(poll(&client, address, &sid).await, "1::");

    server.broadcast("news", ("first",));
    server.broadcast("news", ("second",));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let body = poll(&client, address, &sid).await;
    assert!(body.contains("first"), "missing first event: {body}");
    assert!(body.contains("second"), "missing second event: {body}");
    assert!(
        body.starts_with('\u{FFFD}'),
        "expected a framed multi-packet payload: {body}"
    );
    Ok(())
}

#[tokio::test]
async fn server_call_is_answered_by_the_client() -> TestResult {
    init_tracing();

    let server = Server::new();
    let address = start_server(&server).await;
    let client = reqwest::Client::new();
    let sid = handshake(&client, address).await;
    assert_eq!(poll(&client, address, &sid).await, "1::");

    let conn = server.session(&sid).expect("session");
    let ns = conn.of("");
    let call = tokio::spawn(async move {
        ns.call::<_, (String,)>("ask", Duration::from_secs(2), ("question",))
            .await
    });

    // The client sees the acknowledged event, then answers it.
    let body = poll(&client, address, &sid).await;
    assert!(body.starts_with("5:1::"), "unexpected event frame: {body}");
    assert!(body.contains(r#""name":"ask""#));

    post(&client, address, &sid, r#"6:::1+["answer"]"#).await;

    let reply = call.await??;
    assert_eq!(reply.0, "answer");
    Ok(())
}

#[tokio::test]
async fn idle_poll_returns_the_keepalive_frame() -> TestResult {
    init_tracing();

    let server = Server::builder()
        .polling_timeout(Duration::from_millis(100))
        .build()?;
    let address = start_server(&server).await;
    let client = reqwest::Client::new();
    let sid = handshake(&client, address).await;
    assert_eq!(poll(&client, address, &sid).await, "1::");

    assert_eq!(poll(&client, address, &sid).await, "8::");
    Ok(())
}

#[tokio::test]
async fn plain_message_dispatches_under_message() -> TestResult {
    init_tracing();

    let server = Server::new();
    let (tx, rx) = async_channel::unbounded();
    server.on("message", move |_ns: Context, text: String| {
        let _ = tx.try_send(text);
    });

    let address = start_server(&server).await;
    let client = reqwest::Client::new();
    let sid = handshake(&client, address).await;
    assert_eq!(poll(&client, address, &sid).await, "1::");

    post(&client, address, &sid, "3:::hi there").await;

    let received = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await??;
    assert_eq!(received, "hi there");
    Ok(())
}

#[tokio::test]
async fn client_disconnect_packet_tears_the_session_down() -> TestResult {
    init_tracing();

    let server = Server::new();
    let address = start_server(&server).await;
    let client = reqwest::Client::new();
    let sid = handshake(&client, address).await;
    assert_eq!(poll(&client, address, &sid).await, "1::");

    post(&client, address, &sid, "0::").await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while server.session_count() != 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "session was never removed"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}
