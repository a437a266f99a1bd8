// Copyright 2020 Joyent, Inc.

use std::io;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Code, Error, Result};

/*
 * Fixed prefix of every message.  All integers are little-endian.  The
 * header_len byte records the full (possibly padded or extended) header size
 * so that peers can skip fields they do not understand.
 */
const OFF_VERSION: usize = 0x0;
const OFF_HEADER_LEN: usize = 0x1;
const OFF_ALIGNMENT: usize = 0x2;
const OFF_FLAGS: usize = 0x3;
const OFF_GID: usize = 0x4;
const OFF_TOTAL_LEN: usize = 0x8;
const OFF_TIMEOUT: usize = 0xc;
const OFF_COMMAND: usize = 0x10;

pub const HEADER_LENGTH: usize = 0x12;

pub const PROTOCOL_VERSION_1: u8 = 0x1;
pub const PROTOCOL_VERSION_CURRENT: u8 = PROTOCOL_VERSION_1;

pub const FLAGS_BIT_REQUEST: u8 = 0x01;
pub const FLAGS_BIT_IGNORE_RESPONSE: u8 = 0x02;
pub const FLAGS_BIT_URGENT: u8 = 0x04;
pub const FLAGS_MASK_REQUEST: u8 = !FLAGS_BIT_REQUEST;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommHeader {
    pub version: u8,
    pub header_len: u8,
    pub alignment: u8,
    pub flags: u8,
    pub gid: u32,
    pub total_len: u32,
    pub timeout_ms: u32,
    pub command: u16,
}

impl Default for CommHeader {
    fn default() -> CommHeader {
        CommHeader {
            version: PROTOCOL_VERSION_CURRENT,
            header_len: HEADER_LENGTH as u8,
            alignment: 0,
            flags: 0,
            gid: 0,
            total_len: HEADER_LENGTH as u32,
            timeout_ms: 0,
            command: 0,
        }
    }
}

impl CommHeader {
    pub fn new(command: u16) -> CommHeader {
        CommHeader {
            command,
            ..Default::default()
        }
    }

    pub fn with_flags(command: u16, flags: u8) -> CommHeader {
        CommHeader {
            command,
            flags,
            ..Default::default()
        }
    }

    /// Builds the header of a response to `request`, keeping its gid and
    /// command so the sender can correlate it.
    pub fn response_to(request: &CommHeader) -> CommHeader {
        CommHeader {
            flags: request.flags & FLAGS_MASK_REQUEST,
            gid: request.gid,
            command: request.command,
            ..Default::default()
        }
    }

    pub fn is_request(&self) -> bool {
        self.flags & FLAGS_BIT_REQUEST != 0
    }

    pub fn ignore_response(&self) -> bool {
        self.flags & FLAGS_BIT_IGNORE_RESPONSE != 0
    }

    pub fn is_urgent(&self) -> bool {
        self.flags & FLAGS_BIT_URGENT != 0
    }

    /// Size of the encoded header once padded to `alignment`.
    pub fn encoded_length(&self) -> usize {
        padded_length(self.alignment)
    }

    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(self.header_len as usize)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let len = self.header_len as usize;
        let start = buf.len();
        buf.resize(start + len, 0);
        let out = &mut buf[start..start + len];
        out[OFF_VERSION] = self.version;
        out[OFF_HEADER_LEN] = self.header_len;
        out[OFF_ALIGNMENT] = self.alignment;
        out[OFF_FLAGS] = self.flags;
        LittleEndian::write_u32(&mut out[OFF_GID..OFF_GID + 4], self.gid);
        LittleEndian::write_u32(
            &mut out[OFF_TOTAL_LEN..OFF_TOTAL_LEN + 4],
            self.total_len,
        );
        LittleEndian::write_u32(
            &mut out[OFF_TIMEOUT..OFF_TIMEOUT + 4],
            self.timeout_ms,
        );
        LittleEndian::write_u16(
            &mut out[OFF_COMMAND..OFF_COMMAND + 2],
            self.command,
        );
    }

    /// Decodes a header from the front of `buf`.  Bytes between the fixed
    /// fields and `header_len` are ignored.
    pub fn decode(buf: &[u8]) -> Result<CommHeader> {
        if buf.len() < HEADER_LENGTH {
            return Err(Error::new(
                Code::CommBadHeader,
                format!("header truncated ({} bytes)", buf.len()),
            ));
        }
        let version = buf[OFF_VERSION];
        if version == 0 || version > PROTOCOL_VERSION_CURRENT {
            return Err(Error::new(
                Code::CommBadHeader,
                format!("unsupported protocol version {}", version),
            ));
        }
        let header = CommHeader {
            version,
            header_len: buf[OFF_HEADER_LEN],
            alignment: buf[OFF_ALIGNMENT],
            flags: buf[OFF_FLAGS],
            gid: LittleEndian::read_u32(&buf[OFF_GID..OFF_GID + 4]),
            total_len: LittleEndian::read_u32(
                &buf[OFF_TOTAL_LEN..OFF_TOTAL_LEN + 4],
            ),
            timeout_ms: LittleEndian::read_u32(
                &buf[OFF_TIMEOUT..OFF_TIMEOUT + 4],
            ),
            command: LittleEndian::read_u16(
                &buf[OFF_COMMAND..OFF_COMMAND + 2],
            ),
        };
        if (header.header_len as usize) < HEADER_LENGTH {
            return Err(Error::new(
                Code::CommBadHeader,
                format!("header length {} too small", header.header_len),
            ));
        }
        if header.total_len < u32::from(header.header_len) {
            return Err(Error::new(
                Code::CommBadHeader,
                format!(
                    "total length {} smaller than header length {}",
                    header.total_len, header.header_len
                ),
            ));
        }
        Ok(header)
    }
}

fn padded_length(alignment: u8) -> usize {
    let alignment = alignment as usize;
    if alignment <= 1 {
        HEADER_LENGTH
    } else {
        (HEADER_LENGTH + alignment - 1) / alignment * alignment
    }
}

/// An outbound message: a header plus an immutable payload.
#[derive(Debug, Clone)]
pub struct CommBuf {
    pub header: CommHeader,
    pub payload: Bytes,
}

impl CommBuf {
    pub fn new(mut header: CommHeader, payload: Bytes) -> CommBuf {
        header.header_len = padded_length(header.alignment) as u8;
        header.total_len = header.header_len as u32 + payload.len() as u32;
        CommBuf { header, payload }
    }

    pub fn response(request: &CommHeader, payload: Bytes) -> CommBuf {
        CommBuf::new(CommHeader::response_to(request), payload)
    }

    pub fn len(&self) -> usize {
        self.header.total_len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Recomputes the length fields after the header was edited in place.
    pub fn write_header_and_reset(&mut self) {
        self.header.header_len = padded_length(self.header.alignment) as u8;
        self.header.total_len =
            self.header.header_len as u32 + self.payload.len() as u32;
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// A framed inbound message.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: CommHeader,
    pub payload: Bytes,
}

impl Message {
    /// Parses a whole datagram: exactly one header and its payload.
    pub fn parse_datagram(buf: &[u8]) -> Result<Message> {
        let header = CommHeader::decode(buf)?;
        if header.total_len as usize != buf.len() {
            return Err(Error::new(
                Code::CommBadHeader,
                format!(
                    "datagram length {} does not match total length {}",
                    buf.len(),
                    header.total_len
                ),
            ));
        }
        let payload = Bytes::copy_from_slice(&buf[header.header_len as usize..]);
        Ok(Message { header, payload })
    }
}

enum DecodeState {
    Header,
    Payload(CommHeader),
}

/// Stream framing: [reading header] -> [reading payload] -> emit, reset.
pub struct CommCodec {
    state: DecodeState,
    max_message_size: usize,
}

impl CommCodec {
    pub fn new(max_message_size: usize) -> CommCodec {
        CommCodec {
            state: DecodeState::Header,
            max_message_size,
        }
    }
}

impl Default for CommCodec {
    fn default() -> CommCodec {
        CommCodec::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

fn protocol_error(err: Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

impl Decoder for CommCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_LENGTH {
                        buf.reserve(HEADER_LENGTH - buf.len());
                        return Ok(None);
                    }
                    let header_len = buf[OFF_HEADER_LEN] as usize;
                    if buf.len() < header_len {
                        buf.reserve(header_len - buf.len());
                        return Ok(None);
                    }
                    let header = CommHeader::decode(&buf[..]).map_err(protocol_error)?;
                    if header.total_len as usize > self.max_message_size {
                        let msg = format!(
                            "message length {} exceeds limit {}",
                            header.total_len, self.max_message_size
                        );
                        return Err(protocol_error(Error::new(
                            Code::CommBadHeader,
                            msg,
                        )));
                    }
                    let _ = buf.split_to(header.header_len as usize);
                    self.state = DecodeState::Payload(header);
                }
                DecodeState::Payload(header) => {
                    let payload_len = header.payload_len();
                    if buf.len() < payload_len {
                        buf.reserve(payload_len - buf.len());
                        return Ok(None);
                    }
                    let payload = buf.split_to(payload_len).freeze();
                    self.state = DecodeState::Header;
                    return Ok(Some(Message { header, payload }));
                }
            }
        }
    }
}

impl Encoder<CommBuf> for CommCodec {
    type Error = io::Error;

    fn encode(&mut self, item: CommBuf, buf: &mut BytesMut) -> io::Result<()> {
        if item.len() > self.max_message_size {
            let msg = format!(
                "message length {} exceeds limit {}",
                item.len(),
                self.max_message_size
            );
            return Err(protocol_error(Error::new(Code::CommSendError, msg)));
        }
        buf.reserve(item.len());
        item.header.encode(buf);
        buf.put_slice(&item.payload);
        Ok(())
    }
}

/// Recovers the `Code` carried by an I/O error produced by the codec.
pub fn error_code(err: &io::Error) -> Code {
    match err.get_ref().and_then(|e| e.downcast_ref::<Error>()) {
        Some(e) => e.code(),
        None => Code::CommBrokenConnection,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{quickcheck, Arbitrary, Gen};

    impl Arbitrary for CommHeader {
        fn arbitrary(g: &mut Gen) -> CommHeader {
            let alignment = u8::arbitrary(g);
            let header_len = padded_length(alignment) as u8;
            let payload = u32::arbitrary(g) % 4096;
            CommHeader {
                version: PROTOCOL_VERSION_CURRENT,
                header_len,
                alignment,
                flags: u8::arbitrary(g),
                gid: u32::arbitrary(g),
                total_len: u32::from(header_len) + payload,
                timeout_ms: u32::arbitrary(g),
                command: u16::arbitrary(g),
            }
        }
    }

    quickcheck! {
        fn header_round_trip(header: CommHeader) -> bool {
            let mut buf = BytesMut::new();
            header.encode(&mut buf);
            buf.len() == header.header_len as usize
                && CommHeader::decode(&buf).ok() == Some(header)
        }
    }

    #[test]
    fn layout_matches_wire_table() {
        let header = CommHeader {
            version: 1,
            header_len: HEADER_LENGTH as u8,
            alignment: 0,
            flags: FLAGS_BIT_REQUEST,
            gid: 0x0403_0201,
            total_len: 0x20,
            timeout_ms: 0x0807_0605,
            command: 0x0a09,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(
            &buf[..],
            &[
                1, 18, 0, 1, 0x01, 0x02, 0x03, 0x04, 0x20, 0, 0, 0, 0x05, 0x06,
                0x07, 0x08, 0x09, 0x0a
            ]
        );
    }

    #[test]
    fn alignment_pads_header() {
        let mut header = CommHeader::new(7);
        header.alignment = 16;
        let cbuf = CommBuf::new(header, Bytes::from_static(b"abc"));
        assert_eq!(cbuf.header.header_len, 32);
        assert_eq!(cbuf.len(), 35);
        let bytes = cbuf.to_bytes();
        let msg = Message::parse_datagram(&bytes).unwrap();
        assert_eq!(&msg.payload[..], b"abc");
        assert_eq!(msg.header.command, 7);
    }

    #[test]
    fn decoder_handles_partial_frames() {
        let mut codec = CommCodec::default();
        let first = CommBuf::new(CommHeader::new(1), Bytes::from_static(b"hello"));
        let second = CommBuf::new(CommHeader::new(2), Bytes::from_static(b""));
        let mut wire = BytesMut::new();
        codec.encode(first, &mut wire).unwrap();
        codec.encode(second, &mut wire).unwrap();

        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for byte in wire.iter() {
            buf.put_u8(*byte);
            while let Some(msg) = codec.decode(&mut buf).unwrap() {
                out.push(msg);
            }
        }
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].header.command, 1);
        assert_eq!(&out[0].payload[..], b"hello");
        assert_eq!(out[1].header.command, 2);
        assert!(out[1].payload.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn unsupported_version_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        CommHeader::new(1).encode(&mut buf);
        buf[OFF_VERSION] = 9;
        let err = CommCodec::default().decode(&mut buf).unwrap_err();
        assert_eq!(error_code(&err), Code::CommBadHeader);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let mut codec = CommCodec::new(64);
        let mut buf = BytesMut::new();
        let mut header = CommHeader::new(1);
        header.total_len = 1000;
        header.encode(&mut buf);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(error_code(&err), Code::CommBadHeader);
    }

    #[test]
    fn response_clears_request_bit() {
        let mut req = CommHeader::with_flags(3, FLAGS_BIT_REQUEST | FLAGS_BIT_URGENT);
        req.gid = 42;
        let resp = CommHeader::response_to(&req);
        assert!(!resp.is_request());
        assert!(resp.is_urgent());
        assert_eq!(resp.gid, 42);
        assert_eq!(resp.command, 3);
    }

    #[test]
    fn framed_stream_reassembles_split_reads() {
        use futures::StreamExt;
        use tokio_util::codec::FramedRead;

        let mut codec = CommCodec::default();
        let mut wire = BytesMut::new();
        for (command, payload) in &[(5u16, &b"first"[..]), (6, &b"second"[..])] {
            let cbuf = CommBuf::new(CommHeader::new(*command), Bytes::from_static(payload));
            codec.encode(cbuf, &mut wire).unwrap();
        }
        let socket = tokio_test::io::Builder::new()
            .read(&wire[..7])
            .read(&wire[7..30])
            .read(&wire[30..])
            .build();

        let messages: Vec<Message> = tokio_test::block_on(async {
            FramedRead::new(socket, CommCodec::default())
                .map(|msg| msg.unwrap())
                .collect()
                .await
        });
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].header.command, 5);
        assert_eq!(&messages[0].payload[..], b"first");
        assert_eq!(&messages[1].payload[..], b"second");
    }
}
