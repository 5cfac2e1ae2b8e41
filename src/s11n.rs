//! s11n == serialization. Constants and layouts that make up FastCGI records on the wire.

use byteorder::{ByteOrder, NetworkEndian};
use bytes::{BufMut, BytesMut};

pub const FASTCGI_VERSION: u8 = 1;

/// Size of the fixed record header.
pub const HEADER_LEN: usize = 8;

/// Largest body a single record can carry (16-bit length field).
pub const MAX_CONTENT_LEN: usize = 0xFFFF;

/// Request id reserved for management records.
pub const NULL_REQUEST_ID: u16 = 0;

/// `flags` bit in a BeginRequest body asking the application to keep the connection open.
pub const FCGI_KEEP_CONN: u8 = 1;

// Variables for the RecordType::GetValues and GetValuesResult records.
pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

enum_from_primitive! {
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RecordType {
        BeginRequest = 1,
        AbortRequest = 2,
        EndRequest = 3,
        Params = 4,
        Stdin = 5,
        Stdout = 6,
        Stderr = 7,
        Data = 8,
        GetValues = 9,
        GetValuesResult = 10,
        UnknownType = 11,
    }
}

enum_from_primitive! {
    #[repr(u16)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Role {
        Responder = 1,
        Authorizer = 2,
        Filter = 3,
    }
}

enum_from_primitive! {
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ProtocolStatus {
        RequestComplete = 0,
        CantMultiplexConnections = 1,
        Overloaded = 2,
        UnknownRole = 3,
    }
}

/// Number of zero bytes that follow a body of `content_len` bytes so the whole record is a
/// multiple of 8 bytes long.
pub fn padding_for(content_len: usize) -> u8 {
    ((8 - (content_len % 8)) % 8) as u8
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub fn new(record_type: u8, request_id: u16, content_length: u16) -> RecordHeader {
        RecordHeader {
            version: FASTCGI_VERSION,
            record_type,
            request_id,
            content_length,
            padding_length: padding_for(content_length as usize),
        }
    }

    /// Parse a header from the first `HEADER_LEN` bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> RecordHeader {
        assert!(bytes.len() >= HEADER_LEN);
        RecordHeader {
            version: bytes[0],
            record_type: bytes[1],
            request_id: NetworkEndian::read_u16(&bytes[2..4]),
            content_length: NetworkEndian::read_u16(&bytes[4..6]),
            padding_length: bytes[6],
        }
    }

    /// Body plus padding: the number of bytes following the header.
    pub fn trailing_len(&self) -> usize {
        self.content_length as usize + self.padding_length as usize
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN);
        buf.put_u8(self.version);
        buf.put_u8(self.record_type);
        buf.put_u16(self.request_id);
        buf.put_u16(self.content_length);
        buf.put_u8(self.padding_length);
        buf.put_u8(0); // reserved
    }
}

/// Body of a BeginRequest record.
pub const BEGIN_REQUEST_BODY_LEN: usize = 8;

/// Body of an EndRequest record.
pub const END_REQUEST_BODY_LEN: usize = 8;

/// Body of an UnknownType record.
pub const UNKNOWN_TYPE_BODY_LEN: usize = 8;

#[cfg(test)]
mod tests {
    use super::*;
    use enum_primitive::FromPrimitive;

    #[test]
    fn padding_aligns_to_eight() {
        for len in [0usize, 1, 7, 8, 9, 127, 128, 65535] {
            let padding = padding_for(len) as usize;
            assert!(padding < 8);
            assert_eq!(0, (HEADER_LEN + len + padding) % 8, "len {}", len);
        }
    }

    #[test]
    fn header_layout() {
        let header = RecordHeader::new(RecordType::Stdout as u8, 0x0102, 5);
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        assert_eq!(&buf[..], b"\x01\x06\x01\x02\x00\x05\x03\x00");
        assert_eq!(header, RecordHeader::parse(&buf));
        assert_eq!(8, header.trailing_len());
    }

    #[test]
    fn enum_codes() {
        assert_eq!(Some(RecordType::GetValuesResult), RecordType::from_u8(10));
        assert_eq!(None, RecordType::from_u8(12));
        assert_eq!(Some(Role::Filter), Role::from_u16(3));
        assert_eq!(None, Role::from_u16(0));
        assert_eq!(Some(ProtocolStatus::Overloaded), ProtocolStatus::from_u8(2));
    }
}
