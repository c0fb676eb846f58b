//! Integration tests for stdiowire.
//!
//! Each test wires a transport (or a pair of them) over fresh pipes via
//! `with_raw_fds`, standing in for the process's standard streams.

#![cfg(unix)]

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use serde_json::json;

use stdiowire::{Notification, Request, RequestId, Response, StdioTransport};

/// A unidirectional pipe: (read end, write end).
fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0, "pipe() failed");
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// Write the whole buffer to a (blocking) descriptor.
fn write_all(fd: RawFd, mut data: &[u8]) {
    while !data.is_empty() {
        let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            panic!("write failed: {err}");
        }
        data = &data[n as usize..];
    }
}

fn frame(payload: &str) -> Vec<u8> {
    let mut bytes = format!("Content-Length: {}\r\n\r\n", payload.len()).into_bytes();
    bytes.extend_from_slice(payload.as_bytes());
    bytes
}

/// Transport endpoint plus the peer ends of its two pipes.
struct Endpoint {
    transport: Arc<StdioTransport>,
    /// Write end feeding the transport's stdin.
    peer_in: OwnedFd,
    /// Read end consuming the transport's stdout; held so the pipe
    /// stays open even in tests that never read it.
    _peer_out: OwnedFd,
}

fn endpoint() -> Endpoint {
    let (stdin_read, peer_in) = pipe();
    let (peer_out, stdout_write) = pipe();
    let transport = Arc::new(StdioTransport::with_raw_fds(
        stdin_read.as_raw_fd(),
        stdout_write.as_raw_fd(),
    ));
    // The transport borrows the descriptors; keep them alive for the
    // duration of the test by leaking the OwnedFds into the endpoint.
    std::mem::forget(stdin_read);
    std::mem::forget(stdout_write);
    Endpoint {
        transport,
        peer_in,
        _peer_out: peer_out,
    }
}

fn collecting_error_handler(transport: &StdioTransport) -> Receiver<String> {
    let (tx, rx) = unbounded();
    transport.set_error_handler(move |message| {
        let _ = tx.send(message.to_string());
    });
    rx
}

fn collecting_notification_handler(transport: &StdioTransport) -> Receiver<Notification> {
    let (tx, rx) = unbounded();
    transport.set_notification_handler(move |notification| {
        let _ = tx.send(notification);
    });
    rx
}

fn wait_for_disconnect(transport: &StdioTransport, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while transport.is_connected() {
        assert!(Instant::now() < deadline, "transport still connected");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Echo round-trip between two fully wired transports.
#[test]
fn test_echo_round_trip() {
    let (a_in_read, a_in_write) = pipe();
    let (b_in_read, b_in_write) = pipe();

    // a's stdout feeds b's stdin and vice versa.
    let a = Arc::new(StdioTransport::with_raw_fds(
        a_in_read.as_raw_fd(),
        b_in_write.as_raw_fd(),
    ));
    let b = Arc::new(StdioTransport::with_raw_fds(
        b_in_read.as_raw_fd(),
        a_in_write.as_raw_fd(),
    ));

    b.set_request_handler(|request| {
        assert_eq!(request.method, "ping");
        Ok(Response::success(request.id.clone(), json!("pong")))
    });

    a.start().unwrap();
    b.start().unwrap();

    let slot = a.send_request(Request::with_id(42, "ping", Some(json!({}))));
    let response = slot
        .recv_timeout(Duration::from_millis(1000))
        .expect("response not received");
    assert_eq!(response.id, RequestId::Num(42));
    assert_eq!(response.result, Some(json!("pong")));

    a.close();
    b.close();
}

/// Generated ids are preserved end to end.
#[test]
fn test_generated_request_id_correlates() {
    let (a_in_read, a_in_write) = pipe();
    let (b_in_read, b_in_write) = pipe();
    let a = StdioTransport::with_raw_fds(a_in_read.as_raw_fd(), b_in_write.as_raw_fd());
    let b = StdioTransport::with_raw_fds(b_in_read.as_raw_fd(), a_in_write.as_raw_fd());

    b.set_request_handler(|request| Ok(Response::success(request.id.clone(), json!(1))));
    a.start().unwrap();
    b.start().unwrap();

    let response = a
        .send_request(Request::new("ping", None))
        .recv_timeout(Duration::from_millis(1000))
        .expect("response not received");
    assert_eq!(response.id, RequestId::Str("req-1".into()));

    a.close();
    b.close();
}

/// A request against a silent peer resolves with "Request timeout".
#[test]
fn test_request_timeout() {
    let ep = endpoint();
    ep.transport.set_request_timeout_ms(50);
    ep.transport.start().unwrap();

    let started = Instant::now();
    let response = ep
        .transport
        .send_request(Request::new("ping", None))
        .recv_timeout(Duration::from_millis(1000))
        .expect("timeout response not delivered");
    let elapsed = started.elapsed();

    let error = response.error.expect("expected an error response");
    assert_eq!(error.code, -32603);
    assert_eq!(error.message, "Request timeout");
    assert!(elapsed >= Duration::from_millis(45), "expired too early: {elapsed:?}");

    ep.transport.close();
}

/// Overflowing the write queue is fatal; pending requests then fail with
/// "Transport closed".
#[test]
fn test_backpressure_overflow_disconnects() {
    let ep = endpoint();
    let errors = collecting_error_handler(&ep.transport);
    ep.transport.set_write_queue_max_bytes(1024);
    ep.transport.start().unwrap();

    let slot = ep.transport.send_request(Request::new("ping", None));

    // One frame larger than the whole budget; the peer consumes nothing.
    let big = "x".repeat(2000);
    ep.transport
        .send_notification(Notification::new("flood", Some(json!(big))));

    let error = errors
        .recv_timeout(Duration::from_millis(1000))
        .expect("overflow not reported");
    assert_eq!(error, "write queue overflow");
    wait_for_disconnect(&ep.transport, Duration::from_millis(1000));

    ep.transport.close();
    let response = slot
        .recv_timeout(Duration::from_millis(1000))
        .expect("pending request did not resolve");
    assert_eq!(response.error.unwrap().message, "Transport closed");
}

/// A frame split across two writes arrives as one notification.
#[test]
fn test_partial_frame_reassembly() {
    let ep = endpoint();
    let notifications = collecting_notification_handler(&ep.transport);
    ep.transport.start().unwrap();

    let payload = r#"{"jsonrpc":"2.0","method":"hello"}"#;
    let bytes = frame(payload);
    let split = bytes.len() - 5;

    write_all(ep.peer_in.as_raw_fd(), &bytes[..split]);
    thread::sleep(Duration::from_millis(10));
    write_all(ep.peer_in.as_raw_fd(), &bytes[split..]);

    let notification = notifications
        .recv_timeout(Duration::from_millis(1000))
        .expect("notification not delivered");
    assert_eq!(notification.method, "hello");
    assert!(notifications.try_recv().is_err(), "expected exactly one message");

    ep.transport.close();
}

/// Close under load returns within its bounded grace windows.
#[test]
fn test_graceful_close_under_load() {
    let ep = endpoint();
    ep.transport.start().unwrap();

    for i in 0..100 {
        ep.transport
            .send_notification(Notification::new("tick", Some(json!(i))));
    }

    let started = Instant::now();
    ep.transport.close();
    assert!(
        started.elapsed() < Duration::from_millis(1500),
        "close took {:?}",
        started.elapsed()
    );
    assert!(!ep.transport.is_connected());
}

/// Frames written before the peer closes are all delivered, then EOF is
/// reported and the transport disconnects.
#[test]
fn test_peer_eof_after_three_frames() {
    let ep = endpoint();
    let notifications = collecting_notification_handler(&ep.transport);
    let errors = collecting_error_handler(&ep.transport);
    ep.transport.start().unwrap();

    for i in 1..=3 {
        let payload = format!(r#"{{"jsonrpc":"2.0","method":"n{}"}}"#, i);
        write_all(ep.peer_in.as_raw_fd(), &frame(&payload));
    }
    drop(ep.peer_in);

    for i in 1..=3 {
        let notification = notifications
            .recv_timeout(Duration::from_millis(1000))
            .expect("notification missing");
        assert_eq!(notification.method, format!("n{}", i));
    }

    let error = errors
        .recv_timeout(Duration::from_millis(1000))
        .expect("EOF not reported");
    assert_eq!(error, "EOF on stdin");
    wait_for_disconnect(&ep.transport, Duration::from_millis(1000));

    ep.transport.close();
}

/// Requests after close resolve immediately with an internal error.
#[test]
fn test_send_request_after_close() {
    let ep = endpoint();
    ep.transport.start().unwrap();
    ep.transport.close();

    let started = Instant::now();
    let response = ep
        .transport
        .send_request(Request::new("ping", None))
        .recv_timeout(Duration::from_millis(100))
        .expect("slot did not resolve");
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(response.error.unwrap().message, "Transport not connected");
}

/// Notifications after close are silently dropped.
#[test]
fn test_send_notification_after_close_is_silent() {
    let ep = endpoint();
    let errors = collecting_error_handler(&ep.transport);
    ep.transport.start().unwrap();
    ep.transport.close();

    ep.transport
        .send_notification(Notification::new("late", None));
    assert!(errors.try_recv().is_err());
}

/// A peer that stops consuming stdout trips the per-frame write deadline.
#[test]
fn test_write_timeout_on_stalled_peer() {
    let ep = endpoint();
    let errors = collecting_error_handler(&ep.transport);
    ep.transport.set_write_timeout_ms(100);
    ep.transport.start().unwrap();

    // Far beyond pipe capacity, and nobody reads peer_out.
    let big = "y".repeat(200 * 1024);
    ep.transport
        .send_notification(Notification::new("bulk", Some(json!(big))));

    let error = errors
        .recv_timeout(Duration::from_secs(2))
        .expect("write timeout not reported");
    assert_eq!(error, "write timeout");
    wait_for_disconnect(&ep.transport, Duration::from_millis(1000));

    ep.transport.close();
}

/// A silent peer trips the idle-read timeout.
#[test]
fn test_idle_read_timeout() {
    let ep = endpoint();
    let errors = collecting_error_handler(&ep.transport);
    ep.transport.set_idle_read_timeout_ms(50);
    ep.transport.start().unwrap();

    let error = errors
        .recv_timeout(Duration::from_millis(1000))
        .expect("idle timeout not reported");
    assert_eq!(error, "idle read timeout");
    wait_for_disconnect(&ep.transport, Duration::from_millis(1000));

    ep.transport.close();
}

/// A handler returning Err is translated into an internal-error response
/// carrying the request id.
#[test]
fn test_request_handler_error_becomes_internal_error() {
    let (a_in_read, a_in_write) = pipe();
    let (b_in_read, b_in_write) = pipe();
    let a = StdioTransport::with_raw_fds(a_in_read.as_raw_fd(), b_in_write.as_raw_fd());
    let b = StdioTransport::with_raw_fds(b_in_read.as_raw_fd(), a_in_write.as_raw_fd());

    b.set_request_handler(|_request| Err("database unavailable".into()));
    a.start().unwrap();
    b.start().unwrap();

    let response = a
        .send_request(Request::with_id("job-1", "work", None))
        .recv_timeout(Duration::from_millis(1000))
        .expect("no response");
    assert_eq!(response.id, RequestId::Str("job-1".into()));
    let error = response.error.unwrap();
    assert_eq!(error.code, -32603);
    assert_eq!(error.message, "database unavailable");

    a.close();
    b.close();
}

/// A panicking handler still produces a response, and the reader keeps
/// delivering notifications while handlers run.
#[test]
fn test_request_handler_panic_is_captured() {
    let (a_in_read, a_in_write) = pipe();
    let (b_in_read, b_in_write) = pipe();
    let a = StdioTransport::with_raw_fds(a_in_read.as_raw_fd(), b_in_write.as_raw_fd());
    let b = StdioTransport::with_raw_fds(b_in_read.as_raw_fd(), a_in_write.as_raw_fd());

    b.set_request_handler(|_request| panic!("handler blew up"));
    a.start().unwrap();
    b.start().unwrap();

    let response = a
        .send_request(Request::with_id(9, "work", None))
        .recv_timeout(Duration::from_millis(1000))
        .expect("no response");
    assert_eq!(response.id, RequestId::Num(9));
    assert_eq!(response.error.unwrap().message, "handler blew up");

    a.close();
    b.close();
}

/// Close invoked from the notification handler (reader thread) must not
/// deadlock on a self-join.
#[test]
fn test_close_from_notification_handler() {
    let ep = endpoint();
    let transport = ep.transport.clone();
    ep.transport.set_notification_handler(move |_notification| {
        transport.close();
    });
    ep.transport.start().unwrap();

    write_all(
        ep.peer_in.as_raw_fd(),
        &frame(r#"{"jsonrpc":"2.0","method":"shutdown"}"#),
    );

    wait_for_disconnect(&ep.transport, Duration::from_millis(2000));
}

/// Concurrent outstanding requests correlate by id regardless of response
/// order on the wire.
#[test]
fn test_out_of_order_responses_correlate() {
    let ep = endpoint();
    ep.transport.start().unwrap();

    let slot_a = ep.transport.send_request(Request::with_id(1, "first", None));
    let slot_b = ep.transport.send_request(Request::with_id(2, "second", None));

    // Respond in reverse order.
    write_all(
        ep.peer_in.as_raw_fd(),
        &frame(r#"{"jsonrpc":"2.0","id":2,"result":"two"}"#),
    );
    write_all(
        ep.peer_in.as_raw_fd(),
        &frame(r#"{"jsonrpc":"2.0","id":1,"result":"one"}"#),
    );

    let b = slot_b
        .recv_timeout(Duration::from_millis(1000))
        .expect("second response missing");
    assert_eq!(b.result, Some(json!("two")));
    let a = slot_a
        .recv_timeout(Duration::from_millis(1000))
        .expect("first response missing");
    assert_eq!(a.result, Some(json!("one")));

    ep.transport.close();
}

/// An oversized inbound frame is skipped and the stream keeps going.
#[test]
fn test_oversized_inbound_frame_recovered() {
    let ep = endpoint();
    let notifications = collecting_notification_handler(&ep.transport);
    let errors = collecting_error_handler(&ep.transport);
    ep.transport.start().unwrap();

    write_all(
        ep.peer_in.as_raw_fd(),
        format!("Content-Length: {}\r\n\r\n", 2 * 1024 * 1024).as_bytes(),
    );
    write_all(
        ep.peer_in.as_raw_fd(),
        &frame(r#"{"jsonrpc":"2.0","method":"after"}"#),
    );

    assert_eq!(
        errors.recv_timeout(Duration::from_millis(1000)).unwrap(),
        "body too large"
    );
    let notification = notifications
        .recv_timeout(Duration::from_millis(1000))
        .expect("stream did not continue after oversized frame");
    assert_eq!(notification.method, "after");

    ep.transport.close();
}
