//! Connection state machine tests over in-memory streams.

use std::sync::Arc;
use std::time::Duration;
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::Instant;

use bmcweb_core::http::Connection;
use bmcweb_core::net::tls::{CertificateProvider, PemCertificateProvider};
use bmcweb_core::security::session::SessionStore;

mod common;
use common::{context, context_with, read_response, read_to_close, MockHandler, MockHttp2, MockStream, TestContext};

fn start(t: &TestContext) -> DuplexStream {
    let (stream, client) = MockStream::pair();
    tokio::spawn(Connection::new(stream, None, &t.ctx).start());
    client
}

const AUTHED_GET: &[u8] = b"GET /redfish/v1/Systems HTTP/1.1\r\nHost: bmc\r\nX-Auth-Token: good-token\r\n\r\n";

#[tokio::test]
async fn keep_alive_serves_sequential_requests() {
    let t = context(MockHandler::default());
    let mut client = start(&t);

    for _ in 0..2 {
        client.write_all(AUTHED_GET).await.unwrap();
        let res = read_response(&mut client, false).await.unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.body, b"ok");
        assert_eq!(res.header("connection"), Some("keep-alive"));
        assert!(res.header("date").is_some());
        assert_eq!(res.header("content-length"), Some("2"));
    }
    assert_eq!(t.handler.calls(), 2);
    assert_eq!(t.handler.users.lock().unwrap()[0].as_deref(), Some("admin"));
}

#[tokio::test]
async fn pipelined_requests_are_answered_in_order() {
    let t = context(MockHandler::default());
    let mut client = start(&t);

    let mut both = AUTHED_GET.to_vec();
    both.extend_from_slice(b"GET /redfish/v1 HTTP/1.1\r\nHost: bmc\r\nConnection: close\r\n\r\n");
    client.write_all(&both).await.unwrap();

    let first = read_response(&mut client, false).await.unwrap();
    let second = read_response(&mut client, false).await.unwrap();
    assert_eq!(first.status, 200);
    assert_eq!(second.status, 200);
    assert_eq!(second.header("connection"), Some("close"));
    assert!(read_to_close(&mut client).await.is_empty());
    assert_eq!(t.handler.calls(), 2);
}

#[tokio::test]
async fn http11_without_host_is_rejected_before_dispatch() {
    let t = context(MockHandler::default());
    let mut client = start(&t);

    client
        .write_all(b"GET /redfish/v1/Systems HTTP/1.1\r\nX-Auth-Token: good-token\r\n\r\n")
        .await
        .unwrap();
    let res = read_response(&mut client, false).await.unwrap();
    assert_eq!(res.status, 400);
    assert_eq!(t.handler.calls(), 0);
}

#[tokio::test]
async fn http10_without_host_is_dispatched_and_closed() {
    let t = context(MockHandler::default());
    let mut client = start(&t);

    client
        .write_all(b"GET /redfish/v1 HTTP/1.0\r\n\r\n")
        .await
        .unwrap();
    let res = read_response(&mut client, false).await.unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.header("connection"), Some("close"));
    assert!(read_to_close(&mut client).await.is_empty());
}

#[tokio::test]
async fn unauthenticated_large_upload_is_closed_without_reading_body() {
    let t = context(MockHandler::default());
    let mut client = start(&t);

    client
        .write_all(b"POST /login HTTP/1.1\r\nHost: bmc\r\nContent-Length: 5000\r\n\r\n")
        .await
        .unwrap();
    assert!(read_to_close(&mut client).await.is_empty());
    assert_eq!(t.handler.calls(), 0);
}

#[tokio::test]
async fn unauthenticated_chunked_body_is_capped() {
    let t = context(MockHandler::default());
    let mut client = start(&t);

    let chunk = vec![b'a'; 0x1400];
    let mut req = b"POST /login HTTP/1.1\r\nHost: bmc\r\nTransfer-Encoding: chunked\r\n\r\n1400\r\n".to_vec();
    req.extend_from_slice(&chunk);
    req.extend_from_slice(b"\r\n0\r\n\r\n");
    client.write_all(&req).await.unwrap();

    let res = read_response(&mut client, false).await.unwrap();
    assert_eq!(res.status, 413);
    assert_eq!(res.header("connection"), Some("close"));
    assert_eq!(t.handler.calls(), 0);
}

#[tokio::test]
async fn chunked_body_is_decoded_for_the_handler() {
    let t = context(MockHandler::default());
    let mut client = start(&t);

    client
        .write_all(
            b"POST /redfish/v1/Systems HTTP/1.1\r\nHost: bmc\r\nX-Auth-Token: good-token\r\n\
              Transfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .await
        .unwrap();
    let res = read_response(&mut client, false).await.unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(t.handler.bodies.lock().unwrap()[0].as_ref(), b"hello world");
}

#[tokio::test]
async fn protected_path_without_session_is_unauthorized_and_connection_stays_open() {
    let t = context(MockHandler::default());
    let mut client = start(&t);

    client
        .write_all(b"GET /redfish/v1/Systems HTTP/1.1\r\nHost: bmc\r\n\r\n")
        .await
        .unwrap();
    let res = read_response(&mut client, false).await.unwrap();
    assert_eq!(res.status, 401);
    assert_eq!(res.header("www-authenticate"), Some("Basic"));
    assert_eq!(res.header("connection"), Some("keep-alive"));

    client
        .write_all(b"GET /redfish/v1 HTTP/1.1\r\nHost: bmc\r\n\r\n")
        .await
        .unwrap();
    let res = read_response(&mut client, false).await.unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(t.handler.calls(), 1);
}

#[tokio::test]
async fn browser_is_redirected_to_login() {
    let t = context(MockHandler::default());
    let mut client = start(&t);

    client
        .write_all(b"GET /dashboard HTTP/1.1\r\nHost: bmc\r\nAccept: text/html\r\n\r\n")
        .await
        .unwrap();
    let res = read_response(&mut client, false).await.unwrap();
    assert_eq!(res.status, 307);
    assert_eq!(res.header("location"), Some("/#/login?next=/dashboard"));
}

#[tokio::test]
async fn named_basic_user_goes_to_lockout_handler() {
    let t = context(MockHandler::default());
    let mut client = start(&t);

    // "locked:pw"
    client
        .write_all(b"GET /redfish/v1/Systems HTTP/1.1\r\nHost: bmc\r\nAuthorization: Basic bG9ja2VkOnB3\r\n\r\n")
        .await
        .unwrap();
    let res = read_response(&mut client, false).await.unwrap();
    assert_eq!(res.status, common::LOCKED_STATUS.as_u16());
    assert_eq!(t.auth.locked.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(t.handler.calls(), 0);
}

#[tokio::test]
async fn body_limit_is_restored_after_keep_alive_reset() {
    let t = context(MockHandler::default());
    let mut client = start(&t);

    // Unauthenticated: the limit drops to 4 KiB for this request only.
    client
        .write_all(b"POST /login HTTP/1.1\r\nHost: bmc\r\nContent-Length: 4\r\n\r\nuser")
        .await
        .unwrap();
    assert_eq!(read_response(&mut client, false).await.unwrap().status, 200);

    let body = vec![b'x'; 8192];
    let mut req = format!(
        "POST /redfish/v1/Systems HTTP/1.1\r\nHost: bmc\r\nX-Auth-Token: good-token\r\n\
         Transfer-Encoding: chunked\r\n\r\n{:x}\r\n",
        body.len()
    )
    .into_bytes();
    req.extend_from_slice(&body);
    req.extend_from_slice(b"\r\n0\r\n\r\n");
    client.write_all(&req).await.unwrap();

    let res = read_response(&mut client, false).await.unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(t.handler.bodies.lock().unwrap()[1].len(), 8192);
}

#[tokio::test]
async fn declared_body_over_limit_is_payload_too_large() {
    let t = context_with(MockHandler::default(), 1024, Duration::from_secs(60), 200);
    let mut client = start(&t);

    client
        .write_all(
            b"POST /redfish/v1/Systems HTTP/1.1\r\nHost: bmc\r\nX-Auth-Token: good-token\r\nContent-Length: 2048\r\n\r\n",
        )
        .await
        .unwrap();
    let res = read_response(&mut client, false).await.unwrap();
    assert_eq!(res.status, 413);
    assert!(read_to_close(&mut client).await.is_empty());
}

#[tokio::test]
async fn oversized_header_section_is_rejected() {
    let t = context(MockHandler::default());
    let mut client = start(&t);

    let filler = "a".repeat(9000);
    let req = format!("GET / HTTP/1.1\r\nHost: bmc\r\nX-Filler: {filler}\r\n\r\n");
    client.write_all(req.as_bytes()).await.unwrap();

    let res = read_response(&mut client, false).await.unwrap();
    assert_eq!(res.status, 431);
    assert_eq!(t.handler.calls(), 0);
}

#[tokio::test]
async fn malformed_request_line_is_bad_request() {
    let t = context(MockHandler::default());
    let mut client = start(&t);

    client.write_all(b"NOT A REQUEST\r\n\r\n").await.unwrap();
    let res = read_response(&mut client, false).await.unwrap();
    assert_eq!(res.status, 400);
    assert!(read_to_close(&mut client).await.is_empty());
}

#[tokio::test]
async fn head_response_has_no_body() {
    let t = context(MockHandler::default());
    let mut client = start(&t);

    client
        .write_all(b"HEAD /redfish/v1 HTTP/1.1\r\nHost: bmc\r\nX-Auth-Token: good-token\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let rest = read_to_close(&mut client).await;
    let text = String::from_utf8(rest).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.to_ascii_lowercase().contains("content-length: 2\r\n"));
    assert!(text.ends_with("\r\n\r\n"));
}

#[tokio::test(start_paused = true)]
async fn idle_unauthenticated_connection_times_out() {
    let timeout = Duration::from_secs(5);
    let t = context_with(MockHandler::default(), 1024 * 1024, timeout, 200);
    let mut client = start(&t);

    let started = Instant::now();
    assert!(read_to_close(&mut client).await.is_empty());
    assert!(started.elapsed() >= timeout);
}

#[tokio::test(start_paused = true)]
async fn stalled_unauthenticated_body_times_out() {
    let timeout = Duration::from_secs(5);
    let t = context_with(MockHandler::default(), 1024 * 1024, timeout, 200);
    let mut client = start(&t);

    client
        .write_all(b"POST /login HTTP/1.1\r\nHost: bmc\r\nContent-Length: 10\r\n\r\nhalf")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    client.write_all(b"f").await.unwrap();

    // The timer restarts with each read, so the cut-off is measured from the last byte.
    let last_byte = Instant::now();
    assert!(read_to_close(&mut client).await.is_empty());
    assert!(last_byte.elapsed() >= timeout);
    assert_eq!(t.handler.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn steady_unauthenticated_body_is_not_cut_off() {
    let timeout = Duration::from_secs(5);
    let t = context_with(MockHandler::default(), 1024 * 1024, timeout, 200);
    let mut client = start(&t);

    client
        .write_all(b"POST /login HTTP/1.1\r\nHost: bmc\r\nContent-Length: 4\r\n\r\n")
        .await
        .unwrap();
    for byte in b"user" {
        tokio::time::sleep(Duration::from_secs(3)).await;
        client.write_all(&[*byte]).await.unwrap();
    }

    let res = read_response(&mut client, false).await.unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(t.handler.bodies.lock().unwrap()[0].as_ref(), b"user");
}

#[tokio::test(start_paused = true)]
async fn authenticated_body_outlives_the_deadline() {
    let timeout = Duration::from_secs(5);
    let t = context_with(MockHandler::default(), 1024 * 1024, timeout, 200);
    let mut client = start(&t);

    client
        .write_all(
            b"POST /redfish/v1/Systems HTTP/1.1\r\nHost: bmc\r\nX-Auth-Token: good-token\r\nContent-Length: 10\r\n\r\nhello",
        )
        .await
        .unwrap();
    tokio::time::sleep(timeout * 3).await;
    client.write_all(b"world").await.unwrap();

    let res = read_response(&mut client, false).await.unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(t.handler.bodies.lock().unwrap()[0].as_ref(), b"helloworld");
}

#[tokio::test]
async fn connection_count_returns_to_zero() {
    let t = context(MockHandler::default());
    let tracker = t.ctx.tracker.clone();

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(start(&t));
    }
    for client in &mut clients {
        client.write_all(b"GET /redfish/v1 HTTP/1.1\r\nHost: bmc\r\nConnection: close\r\n\r\n").await.unwrap();
        assert_eq!(read_response(client, false).await.unwrap().status, 200);
        assert!(read_to_close(client).await.is_empty());
    }
    assert!(tracker.wait_for_drain(Duration::from_secs(5)).await);
    assert_eq!(tracker.active_count(), 0);
}

#[tokio::test]
async fn connection_past_ceiling_is_dropped_without_starting() {
    let t = context_with(MockHandler::default(), 1024, Duration::from_secs(60), 2);
    let tracker = t.ctx.tracker.clone();
    let _held = [tracker.track(), tracker.track()];

    let mut client = start(&t);
    client
        .write_all(b"GET /redfish/v1 HTTP/1.1\r\nHost: bmc\r\n\r\n")
        .await
        .unwrap_or(());
    assert!(read_to_close(&mut client).await.is_empty());
    assert_eq!(t.handler.calls(), 0);

    tokio::time::timeout(Duration::from_secs(5), async {
        while tracker.active_count() != 2 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn websocket_upgrade_hands_over_the_stream() {
    let t = context(MockHandler::default());
    let mut client = start(&t);

    client
        .write_all(
            b"GET /kvm/0 HTTP/1.1\r\nHost: bmc\r\nX-Auth-Token: good-token\r\n\
              Connection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap();
    assert_eq!(read_to_close(&mut client).await, b"upgraded");
    assert_eq!(t.handler.upgrades(), 1);
    assert_eq!(t.handler.calls(), 0);
}

#[tokio::test]
async fn rejected_upgrade_writes_error_and_closes() {
    let t = context(MockHandler::rejecting_upgrades());
    let mut client = start(&t);

    client
        .write_all(
            b"GET /redfish/v1/EventService/SSE HTTP/1.1\r\nHost: bmc\r\nX-Auth-Token: good-token\r\n\
              Accept: text/event-stream\r\n\r\n",
        )
        .await
        .unwrap();
    let res = read_response(&mut client, false).await.unwrap();
    assert_eq!(res.status, 503);
    assert_eq!(res.header("connection"), Some("close"));
    assert!(read_to_close(&mut client).await.is_empty());
    assert_eq!(t.handler.upgrades(), 1);
}

#[tokio::test]
async fn alpn_h2_hands_off_before_any_header_read() {
    let (http2, mut rx) = MockHttp2::new();
    let mut t = context(MockHandler::default());
    t.ctx.http2 = Some(Arc::new(http2));

    let provider = PemCertificateProvider::new(None, true, false);
    let tls = Arc::new(provider.ensure_key_present_encrypted_and_valid(&common::fixture()).unwrap());

    let (stream, mut client) = MockStream::pair();
    let stream = stream.with_alpn(b"h2");
    client.write_all(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n").await.unwrap();
    tokio::spawn(Connection::new(stream, Some(tls), &t.ctx).start());

    let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert!(seen.preface.starts_with(b"PRI * HTTP/2.0"));
    assert_eq!(seen.user, None);
    assert_eq!(t.handler.calls(), 0);

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn alpn_http11_stays_on_the_state_machine() {
    let (http2, mut rx) = MockHttp2::new();
    let mut t = context(MockHandler::default());
    t.ctx.http2 = Some(Arc::new(http2));

    let provider = PemCertificateProvider::new(None, true, false);
    let tls = Arc::new(provider.ensure_key_present_encrypted_and_valid(&common::fixture()).unwrap());

    let (stream, mut client) = MockStream::pair();
    tokio::spawn(Connection::new(stream.with_alpn(b"http/1.1"), Some(tls), &t.ctx).start());

    client.write_all(AUTHED_GET).await.unwrap();
    assert_eq!(read_response(&mut client, false).await.unwrap().status, 200);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn sessions_of_other_callers_survive_close() {
    let t = context(MockHandler::default());
    let mut client = start(&t);

    client.write_all(AUTHED_GET).await.unwrap();
    assert_eq!(read_response(&mut client, false).await.unwrap().status, 200);
    drop(client);

    assert!(t.ctx.tracker.wait_for_drain(Duration::from_secs(5)).await);
    assert_eq!(t.auth.sessions.len(), 1);
}

#[tokio::test]
async fn trusted_client_certificate_binds_a_session_until_close() {
    let t = context(MockHandler::default());
    let (stream, mut client) = MockStream::pair();
    let stream = stream
        .with_alpn(b"http/1.1")
        .with_certificates(common::fixture_chain());
    tokio::spawn(Connection::new(stream, Some(common::mutual_tls_context()), &t.ctx).start());

    // No token: the certificate alone authenticates both requests.
    for _ in 0..2 {
        client
            .write_all(b"GET /redfish/v1/Systems HTTP/1.1\r\nHost: bmc\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(read_response(&mut client, false).await.unwrap().status, 200);
    }
    let users = t.handler.users.lock().unwrap().clone();
    assert_eq!(users, vec![Some("localhost".to_string()); 2]);
    assert_eq!(t.auth.sessions.len(), 2);

    drop(client);
    assert!(t.ctx.tracker.wait_for_drain(Duration::from_secs(5)).await);
    assert_eq!(t.auth.sessions.len(), 1);
}

#[tokio::test]
async fn untrusted_client_certificate_gets_no_session() {
    let t = context(MockHandler::default());
    let (stream, mut client) = MockStream::pair();
    let stream = stream
        .with_alpn(b"http/1.1")
        .with_certificates(vec![CertificateDer::from(vec![0x30, 0x00])]);
    tokio::spawn(Connection::new(stream, Some(common::mutual_tls_context()), &t.ctx).start());

    client
        .write_all(b"GET /redfish/v1/Systems HTTP/1.1\r\nHost: bmc\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(read_response(&mut client, false).await.unwrap().status, 401);
    assert_eq!(t.auth.sessions.len(), 1);
    assert_eq!(t.handler.calls(), 0);
}

#[tokio::test]
async fn h2_hand_off_carries_the_certificate_session() {
    let (http2, mut rx) = MockHttp2::new();
    let mut t = context(MockHandler::default());
    t.ctx.http2 = Some(Arc::new(http2));

    let (stream, mut client) = MockStream::pair();
    let stream = stream.with_alpn(b"h2").with_certificates(common::fixture_chain());
    client.write_all(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n").await.unwrap();
    tokio::spawn(Connection::new(stream, Some(common::mutual_tls_context()), &t.ctx).start());

    let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(seen.user.as_deref(), Some("localhost"));

    // Released once the HTTP/2 side lets go of the stream.
    assert!(t.ctx.tracker.wait_for_drain(Duration::from_secs(5)).await);
    assert_eq!(t.auth.sessions.len(), 1);
}
