use super::super::*;
use super::super::lowlevel::read_params;

use bytes::{Bytes, BytesMut};

use std::io;

/// One of the three client-to-server streams of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Params,
    Stdin,
    Data,
}

#[derive(Debug, Default)]
struct InputStream {
    buf: BytesMut,
    done: bool,
}

impl InputStream {
    /// Append a chunk; an empty chunk ends the stream.
    fn push(&mut self, chunk: &Bytes) -> bool {
        if self.done {
            return false;
        }
        if chunk.is_empty() {
            self.done = true;
        } else {
            self.buf.extend_from_slice(chunk);
        }
        true
    }
}

/// How far a request has got in receiving its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    ParamsOpen,
    StdinOpen,
    DataOpen,
    /// Everything the role needs has arrived; the responder can run.
    Ready,
}

/// Input accumulated so far for one in-flight request id.
#[derive(Debug)]
pub struct RequestState {
    pub role: Role,
    pub keep_connection: bool,
    params: InputStream,
    stdin: InputStream,
    data: InputStream,
}

impl RequestState {
    pub fn new(role: Role, keep_connection: bool) -> RequestState {
        RequestState {
            role,
            keep_connection,
            params: InputStream::default(),
            stdin: InputStream::default(),
            data: InputStream::default(),
        }
    }

    /// Add a chunk to one of the input streams. Returns false if that stream had already
    /// ended, in which case the chunk is dropped.
    pub fn push(&mut self, kind: InputKind, chunk: &Bytes) -> bool {
        match kind {
            InputKind::Params => self.params.push(chunk),
            InputKind::Stdin => self.stdin.push(chunk),
            InputKind::Data => self.data.push(chunk),
        }
    }

    pub fn phase(&self) -> RequestPhase {
        if !self.params.done {
            return RequestPhase::ParamsOpen;
        }
        match self.role {
            Role::Authorizer => RequestPhase::Ready,
            Role::Responder if !self.stdin.done => RequestPhase::StdinOpen,
            Role::Responder => RequestPhase::Ready,
            Role::Filter if !self.stdin.done => RequestPhase::StdinOpen,
            Role::Filter if !self.data.done => RequestPhase::DataOpen,
            Role::Filter => RequestPhase::Ready,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == RequestPhase::Ready
    }

    /// Decode the params stream and package everything for the responder. A params stream
    /// that doesn't decode is `InvalidData`.
    pub fn into_request(self, request_id: u16) -> io::Result<FastcgiRequest> {
        let mut raw = self.params.buf.freeze();
        let params = read_params(&mut raw)?
            .into_iter()
            .map(|(name, value)| {
                (String::from_utf8_lossy(&name).into_owned(),
                 String::from_utf8_lossy(&value).into_owned())
            })
            .collect();

        Ok(FastcgiRequest {
            request_id,
            role: self.role,
            keep_connection: self.keep_connection,
            params,
            body: self.stdin.buf.freeze(),
            data: self.data.buf.freeze(),
        })
    }
}
