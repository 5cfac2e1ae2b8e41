use super::s11n::*;

use byteorder::{ByteOrder, NetworkEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use enum_primitive::FromPrimitive;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use std::io;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastcgiRecord {
    pub request_id: u16,
    pub body: FastcgiRecordBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastcgiRecordBody {
    BeginRequest(BeginRequest),
    AbortRequest,
    EndRequest(EndRequest),
    /// Raw bytes of the params stream. Name/value pairs may straddle record boundaries, so
    /// they are decoded once the stream is complete (see `read_params`).
    Params(Bytes),
    Stdin(Bytes),
    Stdout(Bytes),
    Stderr(Bytes),
    Data(Bytes),
    GetValues(Vec<Bytes>),
    GetValuesResult(Vec<(Bytes, Bytes)>),
    UnknownType(u8), // the management response
    Unrecognized(u8, Bytes), // a record whose type code we don't know
}

impl FastcgiRecordBody {
    pub fn type_code(&self) -> u8 {
        match *self {
            FastcgiRecordBody::BeginRequest(_) => RecordType::BeginRequest as u8,
            FastcgiRecordBody::AbortRequest => RecordType::AbortRequest as u8,
            FastcgiRecordBody::EndRequest(_) => RecordType::EndRequest as u8,
            FastcgiRecordBody::Params(_) => RecordType::Params as u8,
            FastcgiRecordBody::Stdin(_) => RecordType::Stdin as u8,
            FastcgiRecordBody::Stdout(_) => RecordType::Stdout as u8,
            FastcgiRecordBody::Stderr(_) => RecordType::Stderr as u8,
            FastcgiRecordBody::Data(_) => RecordType::Data as u8,
            FastcgiRecordBody::GetValues(_) => RecordType::GetValues as u8,
            FastcgiRecordBody::GetValuesResult(_) => RecordType::GetValuesResult as u8,
            FastcgiRecordBody::UnknownType(_) => RecordType::UnknownType as u8,
            FastcgiRecordBody::Unrecognized(code, _) => code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    /// Raw role code; see `role()`.
    pub role: u16,
    pub keep_connection: bool,
}

impl BeginRequest {
    pub fn new(role: Role, keep_connection: bool) -> BeginRequest {
        BeginRequest {
            role: role as u16,
            keep_connection,
        }
    }

    /// The role, or `None` if the client asked for one we don't implement.
    pub fn role(&self) -> Option<Role> {
        Role::from_u16(self.role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FastcgiLowlevelCodec;

fn invalid_data<T: Into<String>>(msg: T) -> io::Error {
    let msg = msg.into();
    error!("{}", msg);
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn read_len(buf: &mut Bytes) -> io::Result<usize> {
    if buf.is_empty() {
        return Err(invalid_data("name-value pair truncated in length prefix"));
    }
    let first_byte = buf[0];
    if first_byte < 0x80 {
        Ok(buf.split_to(1)[0] as usize)
    } else if buf.len() < 4 {
        Err(invalid_data("name-value pair truncated in 4-byte length prefix"))
    } else {
        Ok(NetworkEndian::read_u32(&buf.split_to(4)) as usize & !0x8000_0000)
    }
}

fn write_len(buf: &mut BytesMut, len: usize) -> io::Result<()> {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else if len < 0x8000_0000 {
        let mut bytes = [0u8; 4];
        NetworkEndian::write_u32(bytes.as_mut(), len as u32 | 0x8000_0000);
        buf.extend_from_slice(bytes.as_ref());
    } else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("un-encodable name-value pair length: {:#x}", len)));
    }
    Ok(())
}

/// Decode back-to-back name/value pairs, consuming exactly the whole buffer.
pub fn read_params(buf: &mut Bytes) -> io::Result<Vec<(Bytes, Bytes)>> {
    let mut params = vec![];
    while !buf.is_empty() {
        let name_len = read_len(buf)?;
        let value_len = read_len(buf)?;
        if buf.len() < name_len + value_len {
            return Err(invalid_data(format!(
                "name-value pair of {} + {} bytes overruns the {} bytes left",
                name_len, value_len, buf.len())));
        }
        let name = buf.split_to(name_len);
        let value = buf.split_to(value_len);
        debug!("param ({}, {})",
               String::from_utf8_lossy(&name),
               String::from_utf8_lossy(&value));
        params.push((name, value));
    }
    Ok(params)
}

/// Encode name/value pairs, appending them to `out`.
pub fn write_params<N, V>(params: &[(N, V)], out: &mut BytesMut) -> io::Result<()>
    where N: AsRef<[u8]>,
          V: AsRef<[u8]>,
{
    for (name, value) in params {
        let (name, value) = (name.as_ref(), value.as_ref());
        write_len(out, name.len())?;
        write_len(out, value.len())?;
        out.extend_from_slice(name);
        out.extend_from_slice(value);
    }
    Ok(())
}

fn read_begin_request_body(buf: &Bytes) -> io::Result<BeginRequest> {
    if buf.len() < BEGIN_REQUEST_BODY_LEN {
        return Err(invalid_data(format!("BeginRequest body is only {} bytes", buf.len())));
    }
    Ok(BeginRequest {
        role: NetworkEndian::read_u16(&buf[0..2]),
        keep_connection: (buf[2] & FCGI_KEEP_CONN) == FCGI_KEEP_CONN,
    })
}

fn read_end_request_body(buf: &Bytes) -> io::Result<EndRequest> {
    if buf.len() < END_REQUEST_BODY_LEN {
        return Err(invalid_data(format!("EndRequest body is only {} bytes", buf.len())));
    }
    let protocol_status = ProtocolStatus::from_u8(buf[4])
        .ok_or_else(|| invalid_data(format!("unknown protocol status {}", buf[4])))?;
    Ok(EndRequest {
        app_status: NetworkEndian::read_u32(&buf[0..4]),
        protocol_status,
    })
}

impl Decoder for FastcgiLowlevelCodec {
    type Item = FastcgiRecord;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < HEADER_LEN {
            debug!("insufficient buffer for header");
            return Ok(None);
        }

        // Only peek at the header until the whole record is buffered.
        let header = RecordHeader::parse(&buf[..HEADER_LEN]);
        if header.version != FASTCGI_VERSION {
            return Err(invalid_data(format!("unexpected FCGI version {}", header.version)));
        }

        let record_len = HEADER_LEN + header.trailing_len();
        if buf.len() < record_len {
            debug!("insufficient buffer for message: have {}, need {}", buf.len(), record_len);
            buf.reserve(record_len - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let content_len = header.content_length as usize;
        let mut content = buf.split_to(content_len).freeze();
        buf.advance(header.padding_length as usize);

        let request_id = header.request_id;
        let record_type = RecordType::from_u8(header.record_type);
        debug!("request id: {}; record type: {:?} ({}), {} bytes of content",
               request_id, record_type, header.record_type, content_len);

        let body = match record_type {
            Some(RecordType::BeginRequest) => {
                FastcgiRecordBody::BeginRequest(read_begin_request_body(&content)?)
            },
            Some(RecordType::AbortRequest) => {
                if content_len != 0 {
                    warn!("ignoring {} bytes of AbortRequest content", content_len);
                }
                FastcgiRecordBody::AbortRequest
            },
            Some(RecordType::EndRequest) => {
                FastcgiRecordBody::EndRequest(read_end_request_body(&content)?)
            },
            Some(RecordType::Params) => FastcgiRecordBody::Params(content),
            Some(RecordType::Stdin) => FastcgiRecordBody::Stdin(content),
            Some(RecordType::Stdout) => FastcgiRecordBody::Stdout(content),
            Some(RecordType::Stderr) => FastcgiRecordBody::Stderr(content),
            Some(RecordType::Data) => FastcgiRecordBody::Data(content),
            Some(RecordType::GetValues) => {
                let params = read_params(&mut content)?;
                let names = params.into_iter().map(|(name, _value)| name).collect();
                FastcgiRecordBody::GetValues(names)
            },
            Some(RecordType::GetValuesResult) => {
                FastcgiRecordBody::GetValuesResult(read_params(&mut content)?)
            },
            Some(RecordType::UnknownType) => {
                if content.is_empty() {
                    return Err(invalid_data("empty UnknownType record"));
                }
                FastcgiRecordBody::UnknownType(content[0])
            },
            None => {
                warn!("unknown record type {}", header.record_type);
                FastcgiRecordBody::Unrecognized(header.record_type, content)
            },
        };

        Ok(Some(FastcgiRecord {
            request_id,
            body,
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(record) => Ok(Some(record)),
            None if buf.is_empty() => Ok(None),
            None => {
                let msg = format!("connection closed in the middle of a record ({} bytes buffered)",
                                  buf.len());
                error!("{}", msg);
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, msg))
            },
        }
    }
}

impl Encoder<FastcgiRecord> for FastcgiLowlevelCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: FastcgiRecord, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let record_type = msg.body.type_code();
        let data: Bytes = match msg.body {
            FastcgiRecordBody::Params(data)
                | FastcgiRecordBody::Stdin(data)
                | FastcgiRecordBody::Stdout(data)
                | FastcgiRecordBody::Stderr(data)
                | FastcgiRecordBody::Data(data)
                | FastcgiRecordBody::Unrecognized(_, data) => data,
            FastcgiRecordBody::AbortRequest => Bytes::new(),
            FastcgiRecordBody::BeginRequest(begin) => {
                let mut out = BytesMut::with_capacity(BEGIN_REQUEST_BODY_LEN);
                out.put_u16(begin.role);
                out.put_u8(if begin.keep_connection { FCGI_KEEP_CONN } else { 0 });
                out.put_bytes(0, 5);
                out.freeze()
            },
            FastcgiRecordBody::EndRequest(end_body) => {
                let mut out = BytesMut::with_capacity(END_REQUEST_BODY_LEN);
                out.put_u32(end_body.app_status);
                out.put_u8(end_body.protocol_status as u8);
                out.put_bytes(0, 3);
                out.freeze()
            },
            FastcgiRecordBody::GetValues(names) => {
                let pairs: Vec<(Bytes, &[u8])> = names.into_iter().map(|n| (n, &b""[..])).collect();
                let mut out = BytesMut::new();
                write_params(&pairs, &mut out)?;
                out.freeze()
            },
            FastcgiRecordBody::GetValuesResult(values) => {
                let mut out = BytesMut::new();
                write_params(&values, &mut out)?;
                out.freeze()
            },
            FastcgiRecordBody::UnknownType(typ) => {
                let mut out = BytesMut::with_capacity(UNKNOWN_TYPE_BODY_LEN);
                out.put_u8(typ);
                out.put_bytes(0, 7);
                out.freeze()
            },
        };

        if data.len() > MAX_CONTENT_LEN {
            let msg = format!("type {} record is too long: {}", record_type, data.len());
            error!("{}", msg);
            return Err(io::Error::new(io::ErrorKind::InvalidInput, msg));
        }

        let header = RecordHeader::new(record_type, msg.request_id, data.len() as u16);
        buf.reserve(HEADER_LEN + header.trailing_len());
        header.write(buf);
        buf.extend_from_slice(&data);
        buf.put_bytes(0, header.padding_length as usize);

        Ok(())
    }
}

/// Read one whole record from `reader`.
///
/// Returns `Ok(None)` if the peer closed the connection cleanly at a record boundary. A
/// connection that closes partway through a header or body is an `UnexpectedEof` error.
pub async fn read_record<R>(reader: &mut R) -> io::Result<Option<FastcgiRecord>>
    where R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::zeroed(HEADER_LEN);
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof,
                format!("connection closed after {} of {} header bytes", filled, HEADER_LEN)));
        }
        filled += n;
    }

    let header = RecordHeader::parse(&buf);
    buf.resize(HEADER_LEN + header.trailing_len(), 0);
    reader.read_exact(&mut buf[HEADER_LEN..]).await?;

    FastcgiLowlevelCodec.decode(&mut buf)?
        .map(Some)
        .ok_or_else(|| invalid_data("record incomplete after reading its declared length"))
}

/// Serialize `record` and write it out in full.
pub async fn write_record<W>(writer: &mut W, record: FastcgiRecord) -> io::Result<()>
    where W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    FastcgiLowlevelCodec.encode(record, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(record: FastcgiRecord) -> BytesMut {
        let mut buf = BytesMut::new();
        FastcgiLowlevelCodec.encode(record, &mut buf).unwrap();
        buf
    }

    fn round_trip(record: FastcgiRecord) {
        let mut buf = encode(record.clone());
        assert_eq!(0, buf.len() % 8);
        let decoded = FastcgiLowlevelCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(record, decoded);
        assert!(buf.is_empty());
    }

    #[test]
    fn stream_records_round_trip() {
        for len in [0usize, 1, 7, 8, 127, 128, 4093, MAX_CONTENT_LEN] {
            let body: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            round_trip(FastcgiRecord {
                request_id: 0xBEEF,
                body: FastcgiRecordBody::Stdout(Bytes::from(body)),
            });
        }
    }

    #[test]
    fn management_records_round_trip() {
        round_trip(FastcgiRecord {
            request_id: 1,
            body: FastcgiRecordBody::BeginRequest(BeginRequest::new(Role::Filter, true)),
        });
        round_trip(FastcgiRecord {
            request_id: 1,
            body: FastcgiRecordBody::EndRequest(EndRequest {
                app_status: 0xDEAD_BEEF,
                protocol_status: ProtocolStatus::Overloaded,
            }),
        });
        round_trip(FastcgiRecord { request_id: 3, body: FastcgiRecordBody::AbortRequest });
        round_trip(FastcgiRecord {
            request_id: NULL_REQUEST_ID,
            body: FastcgiRecordBody::GetValues(vec![
                Bytes::from_static(FCGI_MAX_CONNS.as_bytes()),
                Bytes::from_static(FCGI_MPXS_CONNS.as_bytes()),
            ]),
        });
        round_trip(FastcgiRecord {
            request_id: NULL_REQUEST_ID,
            body: FastcgiRecordBody::GetValuesResult(vec![
                (Bytes::from_static(b"FCGI_MAX_REQS"), Bytes::from_static(b"10")),
            ]),
        });
        round_trip(FastcgiRecord {
            request_id: NULL_REQUEST_ID,
            body: FastcgiRecordBody::UnknownType(42),
        });
        round_trip(FastcgiRecord {
            request_id: 9,
            body: FastcgiRecordBody::Unrecognized(200, Bytes::from_static(b"mystery")),
        });
    }

    #[test]
    fn padding_is_zero_filled() {
        let buf = encode(FastcgiRecord {
            request_id: 1,
            body: FastcgiRecordBody::Stderr(Bytes::from_static(b"abc")),
        });
        assert_eq!(&buf[..], b"\x01\x07\x00\x01\x00\x03\x05\x00abc\0\0\0\0\0");
    }

    #[test]
    fn begin_request_wire_format() {
        let buf = encode(FastcgiRecord {
            request_id: 1,
            body: FastcgiRecordBody::BeginRequest(BeginRequest::new(Role::Responder, true)),
        });
        assert_eq!(&buf[..], b"\x01\x01\x00\x01\x00\x08\x00\x00\x00\x01\x01\0\0\0\0\0");
    }

    #[test]
    fn unknown_role_still_decodes() {
        let mut buf = BytesMut::from(&b"\x01\x01\x00\x01\x00\x08\x00\x00\x00\x09\x00\0\0\0\0\0"[..]);
        let record = FastcgiLowlevelCodec.decode(&mut buf).unwrap().unwrap();
        match record.body {
            FastcgiRecordBody::BeginRequest(begin) => {
                assert_eq!(9, begin.role);
                assert_eq!(None, begin.role());
                assert!(!begin.keep_connection);
            },
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn partial_records_wait_for_more_bytes() {
        let full = encode(FastcgiRecord {
            request_id: 7,
            body: FastcgiRecordBody::Stdin(Bytes::from_static(b"hello world")),
        });

        let mut buf = BytesMut::from(&full[..5]);
        assert!(FastcgiLowlevelCodec.decode(&mut buf).unwrap().is_none());
        assert_eq!(5, buf.len());

        // Body present but padding still missing.
        let mut buf = BytesMut::from(&full[..HEADER_LEN + 11]);
        assert!(FastcgiLowlevelCodec.decode(&mut buf).unwrap().is_none());

        let err = FastcgiLowlevelCodec.decode_eof(&mut buf).unwrap_err();
        assert_eq!(io::ErrorKind::UnexpectedEof, err.kind());

        let mut buf = BytesMut::new();
        assert!(FastcgiLowlevelCodec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn back_to_back_records() {
        let mut buf = encode(FastcgiRecord {
            request_id: 1,
            body: FastcgiRecordBody::Params(Bytes::from_static(b"\x01\x01ab")),
        });
        buf.extend_from_slice(&encode(FastcgiRecord {
            request_id: 1,
            body: FastcgiRecordBody::Params(Bytes::new()),
        }));
        let first = FastcgiLowlevelCodec.decode(&mut buf).unwrap().unwrap();
        let second = FastcgiLowlevelCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(FastcgiRecordBody::Params(Bytes::from_static(b"\x01\x01ab")), first.body);
        assert_eq!(FastcgiRecordBody::Params(Bytes::new()), second.body);
        assert!(buf.is_empty());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut buf = BytesMut::from(&b"\x02\x05\x00\x01\x00\x00\x00\x00"[..]);
        let err = FastcgiLowlevelCodec.decode(&mut buf).unwrap_err();
        assert_eq!(io::ErrorKind::InvalidData, err.kind());
    }

    #[test]
    fn oversized_body_is_rejected() {
        let mut buf = BytesMut::new();
        let err = FastcgiLowlevelCodec.encode(FastcgiRecord {
            request_id: 1,
            body: FastcgiRecordBody::Stdout(Bytes::from(vec![0u8; MAX_CONTENT_LEN + 1])),
        }, &mut buf).unwrap_err();
        assert_eq!(io::ErrorKind::InvalidInput, err.kind());
        assert!(buf.is_empty());
    }

    #[test]
    fn params_codec_short_and_long() {
        let long_value = "v".repeat(300);
        let long_name = "N".repeat(128);
        let pairs = vec![
            ("REQUEST_METHOD".to_owned(), "GET".to_owned()),
            ("EMPTY".to_owned(), String::new()),
            ("QUERY_STRING".to_owned(), long_value.clone()),
            (long_name.clone(), "x".to_owned()),
        ];

        let mut out = BytesMut::new();
        write_params(&pairs, &mut out).unwrap();
        // 1-byte lengths for short fields, 4-byte lengths with the high bit for long ones.
        assert_eq!(&out[..2], &[14, 3]);

        let mut encoded = out.freeze();
        let decoded = read_params(&mut encoded).unwrap();
        let decoded: Vec<(String, String)> = decoded.iter()
            .map(|(n, v)| (String::from_utf8(n.to_vec()).unwrap(),
                           String::from_utf8(v.to_vec()).unwrap()))
            .collect();
        assert_eq!(pairs, decoded);
    }

    #[test]
    fn params_codec_rejects_overrun() {
        let mut truncated = Bytes::from_static(b"\x04\x05abcdxy");
        assert_eq!(io::ErrorKind::InvalidData, read_params(&mut truncated).unwrap_err().kind());

        let mut truncated_len = Bytes::from_static(b"\x80\x00");
        assert!(read_params(&mut truncated_len).is_err());
    }

    #[tokio::test]
    async fn read_and_write_over_a_socket() {
        let (mut a, mut b) = tokio::net::UnixStream::pair().unwrap();
        let record = FastcgiRecord {
            request_id: 2,
            body: FastcgiRecordBody::Data(Bytes::from(vec![0x5f; 1000])),
        };
        write_record(&mut a, record.clone()).await.unwrap();
        assert_eq!(Some(record), read_record(&mut b).await.unwrap());

        drop(a);
        assert_eq!(None, read_record(&mut b).await.unwrap());
    }

    #[tokio::test]
    async fn short_header_is_an_error() {
        let (mut a, mut b) = tokio::net::UnixStream::pair().unwrap();
        a.write_all(b"\x01\x05\x00").await.unwrap();
        drop(a);
        let err = read_record(&mut b).await.unwrap_err();
        assert_eq!(io::ErrorKind::UnexpectedEof, err.kind());
    }
}
