use super::super::*;

use bytes::{BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::{Future, FutureExt};

use std::io;

/// A fully received request, as handed to a `FastcgiResponder`.
#[derive(Debug, Clone)]
pub struct FastcgiRequest {
    pub request_id: u16,
    pub role: Role,
    pub keep_connection: bool,
    /// Parameters in the order the client sent them.
    pub params: Vec<(String, String)>,
    /// The stdin stream.
    pub body: Bytes,
    /// The data stream (Filter role only).
    pub data: Bytes,
}

impl FastcgiRequest {
    /// Value of the first parameter called `name`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct FastcgiResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Written to the stderr stream.
    pub errors: Vec<u8>,
    pub app_status: u32,
    headers: Vec<(String, String)>,
}

impl Default for FastcgiResponse {
    fn default() -> FastcgiResponse {
        FastcgiResponse::new()
    }
}

impl FastcgiResponse {
    pub fn new() -> FastcgiResponse {
        FastcgiResponse {
            status: 200,
            body: Vec::new(),
            errors: Vec::new(),
            app_status: 0,
            headers: vec![(
                "X-Powered-By".to_owned(),
                concat!("fastcgi-host/", env!("CARGO_PKG_VERSION")).to_owned())],
        }
    }

    /// Set a header, replacing the value of any existing header of the same name
    /// (case-insensitively). The name keeps the spelling it was first set with.
    pub fn set_header<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) {
        let name = name.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    pub fn clear_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// The CGI-style stdout stream: a `Status` line, headers, a blank line, then the body.
    pub fn encode_stdout(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.body.len() + 128);
        out.put_slice(format!("Status: {} {}\r\n", self.status, reason_phrase(self.status))
                      .as_bytes());
        for (key, value) in &self.headers {
            out.put_slice(key.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out.put_slice(&self.body);
        out.freeze()
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}

/// Turns a request into a response. This is where application logic plugs in.
///
/// Any `Fn(FastcgiRequest) -> impl Future<Output = io::Result<FastcgiResponse>>` closure is a
/// responder. An `Err` is reported to the client on stderr with application status 1.
pub trait FastcgiResponder: Send + Sync + 'static {
    fn respond(&self, request: FastcgiRequest) -> BoxFuture<'static, io::Result<FastcgiResponse>>;
}

impl<F, Fut> FastcgiResponder for F
    where F: Fn(FastcgiRequest) -> Fut + Send + Sync + 'static,
          Fut: Future<Output = io::Result<FastcgiResponse>> + Send + 'static,
{
    fn respond(&self, request: FastcgiRequest) -> BoxFuture<'static, io::Result<FastcgiResponse>> {
        (self)(request).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdout_layout() {
        let mut response = FastcgiResponse::new();
        response.status = 404;
        response.set_header("Content-Type", "text/plain");
        response.set_header("content-type", "text/html");
        response.clear_header("X-Powered-By");
        response.body.extend_from_slice(b"nope");

        assert_eq!(&b"Status: 404 Not Found\r\nContent-Type: text/html\r\n\r\nnope"[..],
                   &response.encode_stdout()[..]);
        assert_eq!(1, response.headers().len());
    }

    #[test]
    fn first_param_wins() {
        let request = FastcgiRequest {
            request_id: 1,
            role: Role::Responder,
            keep_connection: false,
            params: vec![("A".to_owned(), "1".to_owned()), ("A".to_owned(), "2".to_owned())],
            body: Bytes::new(),
            data: Bytes::new(),
        };
        assert_eq!(Some("1"), request.param("A"));
        assert_eq!(None, request.param("B"));
    }
}
