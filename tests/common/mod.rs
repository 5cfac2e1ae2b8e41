//! A minimal FastCGI client for driving the server in tests.

#![allow(dead_code)]

use fastcgi_host::*;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use std::future::Future;
use std::io;
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub async fn send<S: AsyncWrite + Unpin>(client: &mut S, request_id: u16, body: FastcgiRecordBody) {
    write_record(client, FastcgiRecord { request_id, body }).await.unwrap();
}

pub async fn recv<S: AsyncRead + Unpin>(client: &mut S) -> FastcgiRecord {
    tokio::time::timeout(TIMEOUT, read_record(client)).await
        .expect("timed out waiting for a record")
        .unwrap()
        .expect("connection closed instead of a record")
}

/// Whether the server closed the connection (a clean EOF, or a reset).
pub async fn is_closed<S: AsyncRead + Unpin>(client: &mut S) -> bool {
    match tokio::time::timeout(TIMEOUT, read_record(client)).await {
        Ok(Ok(None)) | Ok(Err(_)) => true,
        Ok(Ok(Some(record))) => panic!("expected the connection to close, got {:?}", record),
        Err(_) => false,
    }
}

pub fn params(pairs: &[(&str, &str)]) -> Bytes {
    let mut buf = BytesMut::new();
    write_params(pairs, &mut buf).unwrap();
    buf.freeze()
}

pub async fn begin<S: AsyncWrite + Unpin>(client: &mut S, id: u16, role: Role, keep: bool) {
    send(client, id, FastcgiRecordBody::BeginRequest(BeginRequest::new(role, keep))).await;
}

/// A complete Responder request: begin, params, empty params, stdin, empty stdin.
pub async fn send_request<S: AsyncWrite + Unpin>(
    client: &mut S,
    id: u16,
    keep: bool,
    pairs: &[(&str, &str)],
    body: &[u8],
) {
    begin(client, id, Role::Responder, keep).await;
    send(client, id, FastcgiRecordBody::Params(params(pairs))).await;
    send(client, id, FastcgiRecordBody::Params(Bytes::new())).await;
    if !body.is_empty() {
        send(client, id, FastcgiRecordBody::Stdin(Bytes::copy_from_slice(body))).await;
    }
    send(client, id, FastcgiRecordBody::Stdin(Bytes::new())).await;
}

#[derive(Debug)]
pub struct Response {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub end: EndRequest,
    /// Number of non-empty stdout records.
    pub stdout_records: usize,
}

impl Response {
    /// The part of stdout after the CGI headers.
    pub fn body(&self) -> &[u8] {
        match self.stdout.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(pos) => &self.stdout[pos + 4..],
            None => &self.stdout,
        }
    }

    pub fn head(&self) -> String {
        let end = self.stdout.len() - self.body().len();
        String::from_utf8_lossy(&self.stdout[..end]).into_owned()
    }
}

/// Read records for request `id` up to and including its end-request, checking that the
/// stdout stream was terminated before it.
pub async fn read_response<S: AsyncRead + Unpin>(client: &mut S, id: u16) -> Response {
    let mut stdout = vec![];
    let mut stderr = vec![];
    let mut stdout_records = 0;
    let mut stdout_done = false;
    loop {
        let record = recv(client).await;
        assert_eq!(id, record.request_id, "record for the wrong request: {:?}", record);
        match record.body {
            FastcgiRecordBody::Stdout(data) => {
                assert!(!stdout_done, "stdout after its terminator");
                assert!(data.len() <= MAX_CONTENT_LEN);
                if data.is_empty() {
                    stdout_done = true;
                } else {
                    stdout_records += 1;
                    stdout.extend_from_slice(&data);
                }
            },
            FastcgiRecordBody::Stderr(data) => stderr.extend_from_slice(&data),
            FastcgiRecordBody::EndRequest(end) => {
                if end.protocol_status == ProtocolStatus::RequestComplete && !stdout.is_empty() {
                    assert!(stdout_done, "end-request before the stdout terminator");
                }
                return Response { stdout, stderr, end, stdout_records };
            },
            other => panic!("unexpected record {:?}", other),
        }
    }
}

/// Responds with the request's `REQUEST_URI` and body echoed back.
pub async fn echo(request: FastcgiRequest) -> io::Result<FastcgiResponse> {
    let mut response = FastcgiResponse::new();
    response.set_header("Content-Type", "text/plain");
    response.body.extend_from_slice(request.param("REQUEST_URI").unwrap_or("").as_bytes());
    response.body.extend_from_slice(b"|");
    response.body.extend_from_slice(&request.body);
    Ok(response)
}

/// Poll `condition` until it holds, or panic after `TIMEOUT`.
pub async fn wait_for<F: FnMut() -> bool>(mut condition: F, what: &str) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, future).await.expect("timed out")
}
