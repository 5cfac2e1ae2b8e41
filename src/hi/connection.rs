use super::super::*;
use super::super::s11n::*;
use super::request::{InputKind, RequestState};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

/// Identifies a connection within one server.
pub type ConnectionId = u64;

/// One accepted socket and the requests in flight on it.
///
/// Records are handled strictly in arrival order. The responder runs inline, so while one
/// request is being answered no further records are read from this connection.
pub struct FastcgiConnection {
    id: ConnectionId,
    framed: Framed<FastcgiStream, FastcgiLowlevelCodec>,
    config: Arc<ServerConfig>,
    responder: Arc<dyn FastcgiResponder>,
    requests: HashMap<u16, RequestState>,
}

impl FastcgiConnection {
    pub fn new(
        id: ConnectionId,
        stream: FastcgiStream,
        config: Arc<ServerConfig>,
        responder: Arc<dyn FastcgiResponder>,
    ) -> FastcgiConnection {
        FastcgiConnection {
            id,
            framed: Framed::new(stream, FastcgiLowlevelCodec),
            config,
            responder,
            requests: HashMap::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Serve until the peer closes, a request without keep-connection finishes, an
    /// unrecoverable error occurs, or `cancel` fires. The socket is closed in every case, and
    /// requests still open at that point get no response.
    pub async fn run(mut self, cancel: CancellationToken) {
        let id = self.id;
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("connection {}: cancelled", id);
                Ok(())
            },
            result = self.serve() => result,
        };

        if let Err(e) = result {
            warn!("connection {}: {}", self.id, e);
        }
        if !self.requests.is_empty() {
            debug!("connection {}: abandoning {} open requests", self.id, self.requests.len());
        }
        if let Err(e) = self.framed.get_mut().close().await {
            debug!("connection {}: error closing socket: {}", self.id, e);
        }
        debug!("connection {}: closed", self.id);
    }

    async fn serve(&mut self) -> io::Result<()> {
        while let Some(record) = self.framed.next().await {
            let record = record?;
            debug!("connection {}: record type {} for request {}",
                   self.id, record.body.type_code(), record.request_id);
            if !self.handle_record(record).await? {
                debug!("connection {}: closing after last request", self.id);
                return Ok(());
            }
        }
        debug!("connection {}: closed by peer", self.id);
        Ok(())
    }

    /// Returns false once the connection should be closed.
    async fn handle_record(&mut self, record: FastcgiRecord) -> io::Result<bool> {
        let id = record.request_id;
        match record.body {
            FastcgiRecordBody::GetValues(names) => {
                self.get_values(names).await?;
                Ok(true)
            },
            FastcgiRecordBody::Unrecognized(code, _) => {
                warn!("connection {}: unknown record type {}", self.id, code);
                self.send(NULL_REQUEST_ID, FastcgiRecordBody::UnknownType(code)).await?;
                Ok(true)
            },
            _ if id == NULL_REQUEST_ID => {
                warn!("connection {}: ignoring application record type {} on the management id",
                      self.id, record.body.type_code());
                Ok(true)
            },
            FastcgiRecordBody::BeginRequest(begin) => {
                self.begin_request(id, begin).await?;
                Ok(true)
            },
            FastcgiRecordBody::AbortRequest => self.abort_request(id).await,
            FastcgiRecordBody::Params(chunk) => self.input(id, InputKind::Params, chunk).await,
            FastcgiRecordBody::Stdin(chunk) => self.input(id, InputKind::Stdin, chunk).await,
            FastcgiRecordBody::Data(chunk) => self.input(id, InputKind::Data, chunk).await,
            FastcgiRecordBody::EndRequest(_)
                | FastcgiRecordBody::Stdout(_)
                | FastcgiRecordBody::Stderr(_)
                | FastcgiRecordBody::GetValuesResult(_)
                | FastcgiRecordBody::UnknownType(_) =>
            {
                Err(io::Error::new(io::ErrorKind::InvalidData,
                    format!("client sent a server-to-client record (type {})",
                            record.body.type_code())))
            },
        }
    }

    async fn get_values(&mut self, names: Vec<Bytes>) -> io::Result<()> {
        let mut pairs = vec![];
        for name in names {
            let value = if name == FCGI_MAX_CONNS.as_bytes() {
                self.config.max_connections.to_string()
            } else if name == FCGI_MAX_REQS.as_bytes() {
                self.config.max_requests.to_string()
            } else if name == FCGI_MPXS_CONNS.as_bytes() {
                (if self.config.multiplex { "1" } else { "0" }).to_owned()
            } else {
                debug!("connection {}: no value for {:?}", self.id, name);
                continue;
            };
            pairs.push((name, Bytes::from(value)));
        }
        self.send(NULL_REQUEST_ID, FastcgiRecordBody::GetValuesResult(pairs)).await
    }

    async fn begin_request(&mut self, id: u16, begin: BeginRequest) -> io::Result<()> {
        if self.requests.contains_key(&id) {
            warn!("connection {}: duplicate begin-request for request {}; ignoring", self.id, id);
            return Ok(());
        }

        if !self.config.multiplex && !self.requests.is_empty() {
            warn!("connection {}: rejecting request {}: multiplexing is disabled", self.id, id);
            return self.end_request(id, 0, ProtocolStatus::CantMultiplexConnections).await;
        }

        if self.requests.len() >= self.config.max_requests {
            warn!("connection {}: rejecting request {}: {} requests already in flight",
                  self.id, id, self.requests.len());
            return self.end_request(id, 0, ProtocolStatus::Overloaded).await;
        }

        let role = match begin.role() {
            Some(role) => role,
            None => {
                warn!("connection {}: rejecting request {}: unknown role {}",
                      self.id, id, begin.role);
                return self.end_request(id, 0, ProtocolStatus::UnknownRole).await;
            },
        };

        debug!("connection {}: begin request {} as {:?}", self.id, id, role);
        self.requests.insert(id, RequestState::new(role, begin.keep_connection));
        Ok(())
    }

    async fn abort_request(&mut self, id: u16) -> io::Result<bool> {
        match self.requests.remove(&id) {
            Some(state) => {
                info!("connection {}: request {} aborted by client", self.id, id);
                self.end_request(id, 0, ProtocolStatus::RequestComplete).await?;
                Ok(state.keep_connection || !self.requests.is_empty())
            },
            None => {
                debug!("connection {}: abort for unknown request {}", self.id, id);
                Ok(true)
            },
        }
    }

    async fn input(&mut self, id: u16, kind: InputKind, chunk: Bytes) -> io::Result<bool> {
        let ready = match self.requests.get_mut(&id) {
            Some(state) => {
                if !state.push(kind, &chunk) {
                    warn!("connection {}: {:?} record after end of stream for request {}",
                          self.id, kind, id);
                }
                state.is_ready()
            },
            None => {
                debug!("connection {}: {:?} record for unknown request {}", self.id, kind, id);
                return Ok(true);
            },
        };

        if !ready {
            return Ok(true);
        }
        match self.requests.remove(&id) {
            Some(state) => self.dispatch(id, state).await,
            None => Ok(true),
        }
    }

    async fn dispatch(&mut self, id: u16, state: RequestState) -> io::Result<bool> {
        let keep_connection = state.keep_connection;
        let request = state.into_request(id)?;

        info!("connection {}: request {}: {} {}", self.id, id,
              request.param("REQUEST_METHOD").unwrap_or("-"),
              request.param("REQUEST_URI").unwrap_or("-"));

        let responder = Arc::clone(&self.responder);
        let (stdout, stderr, app_status) = match responder.respond(request).await {
            Ok(response) => {
                (response.encode_stdout(), Bytes::from(response.errors), response.app_status)
            },
            Err(e) => {
                error!("connection {}: request {}: responder failed: {}", self.id, id, e);
                (Bytes::new(), Bytes::from(format!("responder failed: {}\n", e)), 1)
            },
        };

        self.feed_stream(id, stdout, FastcgiRecordBody::Stdout).await?;
        if !stderr.is_empty() {
            self.feed_stream(id, stderr, FastcgiRecordBody::Stderr).await?;
        }
        self.end_request(id, app_status, ProtocolStatus::RequestComplete).await?;
        debug!("connection {}: request {} complete", self.id, id);

        Ok(keep_connection || !self.requests.is_empty())
    }

    /// Queue `data` as records of one output stream, split to fit the 16-bit length field,
    /// followed by the empty record that ends the stream.
    async fn feed_stream(&mut self, id: u16, mut data: Bytes, make: fn(Bytes) -> FastcgiRecordBody)
        -> io::Result<()>
    {
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(MAX_CONTENT_LEN));
            self.framed.feed(FastcgiRecord { request_id: id, body: make(chunk) }).await?;
        }
        self.framed.feed(FastcgiRecord { request_id: id, body: make(Bytes::new()) }).await
    }

    async fn end_request(&mut self, id: u16, app_status: u32, protocol_status: ProtocolStatus)
        -> io::Result<()>
    {
        self.send(id, FastcgiRecordBody::EndRequest(EndRequest { app_status, protocol_status }))
            .await
    }

    /// Write a record and flush everything queued before it.
    async fn send(&mut self, request_id: u16, body: FastcgiRecordBody) -> io::Result<()> {
        self.framed.send(FastcgiRecord { request_id, body }).await
    }
}
