//! Frame layout: a 9-byte header (24-bit length, 8-bit type, 8-bit flags,
//! 31-bit stream id with a reserved high bit) followed by the payload.
//! The reader assembles HEADERS/PUSH_PROMISE with their CONTINUATION
//! frames into one complete header block before surfacing them.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::hpack;
use super::H2Error;

pub(crate) const FRAME_HEADER_LEN: usize = 9;
pub(crate) const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub(crate) const MAX_FRAME_SIZE_CEILING: u32 = (1 << 24) - 1;
pub(crate) const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub(crate) const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;
pub(crate) const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const TYPE_DATA: u8 = 0x0;
const TYPE_HEADERS: u8 = 0x1;
const TYPE_PRIORITY: u8 = 0x2;
const TYPE_RST_STREAM: u8 = 0x3;
const TYPE_SETTINGS: u8 = 0x4;
const TYPE_PUSH_PROMISE: u8 = 0x5;
const TYPE_PING: u8 = 0x6;
const TYPE_GOAWAY: u8 = 0x7;
const TYPE_WINDOW_UPDATE: u8 = 0x8;
const TYPE_CONTINUATION: u8 = 0x9;

pub(crate) const FLAG_END_STREAM: u8 = 0x1;
pub(crate) const FLAG_ACK: u8 = 0x1;
pub(crate) const FLAG_END_HEADERS: u8 = 0x4;
pub(crate) const FLAG_PADDED: u8 = 0x8;
pub(crate) const FLAG_PRIORITY: u8 = 0x20;

/// A canonical HTTP/2 error code, as carried by RST_STREAM and GOAWAY.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub(crate) u32);

impl ErrorCode {
    /// Graceful shutdown.
    pub const NO_ERROR: ErrorCode = ErrorCode(0x0);
    /// Protocol error detected.
    pub const PROTOCOL_ERROR: ErrorCode = ErrorCode(0x1);
    /// Implementation fault.
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(0x2);
    /// Flow-control limits exceeded.
    pub const FLOW_CONTROL_ERROR: ErrorCode = ErrorCode(0x3);
    /// Settings not acknowledged.
    pub const SETTINGS_TIMEOUT: ErrorCode = ErrorCode(0x4);
    /// Frame received for closed stream.
    pub const STREAM_CLOSED: ErrorCode = ErrorCode(0x5);
    /// Frame size incorrect.
    pub const FRAME_SIZE_ERROR: ErrorCode = ErrorCode(0x6);
    /// Stream not processed. Retryable on a fresh connection.
    pub const REFUSED_STREAM: ErrorCode = ErrorCode(0x7);
    /// Stream canceled.
    pub const CANCEL: ErrorCode = ErrorCode(0x8);
    /// Compression state not updated.
    pub const COMPRESSION_ERROR: ErrorCode = ErrorCode(0x9);
    /// TCP connection error for CONNECT method.
    pub const CONNECT_ERROR: ErrorCode = ErrorCode(0xa);
    /// Processing capacity exceeded.
    pub const ENHANCE_YOUR_CALM: ErrorCode = ErrorCode(0xb);
    /// Negotiated TLS parameters not acceptable.
    pub const INADEQUATE_SECURITY: ErrorCode = ErrorCode(0xc);
    /// Use HTTP/1.1 for the request.
    pub const HTTP_1_1_REQUIRED: ErrorCode = ErrorCode(0xd);

    /// The wire value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    fn name(&self) -> Option<&'static str> {
        Some(match self.0 {
            0x0 => "NO_ERROR",
            0x1 => "PROTOCOL_ERROR",
            0x2 => "INTERNAL_ERROR",
            0x3 => "FLOW_CONTROL_ERROR",
            0x4 => "SETTINGS_TIMEOUT",
            0x5 => "STREAM_CLOSED",
            0x6 => "FRAME_SIZE_ERROR",
            0x7 => "REFUSED_STREAM",
            0x8 => "CANCEL",
            0x9 => "COMPRESSION_ERROR",
            0xa => "CONNECT_ERROR",
            0xb => "ENHANCE_YOUR_CALM",
            0xc => "INADEQUATE_SECURITY",
            0xd => "HTTP_1_1_REQUIRED",
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "UNKNOWN({:#x})", self.0),
        }
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// SETTINGS as a sparse parameter set: only fields present on the wire (or
/// explicitly configured) are `Some`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
}

const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
const SETTINGS_ENABLE_PUSH: u16 = 0x2;
const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

impl Settings {
    /// The SETTINGS a client sends with its preface: push disabled.
    pub(crate) fn client_default() -> Settings {
        Settings {
            enable_push: Some(false),
            ..Settings::default()
        }
    }

    /// Merge `other` on top of this parameter set.
    pub(crate) fn apply(&mut self, other: &Settings) {
        macro_rules! merge {
            ($field:ident) => {
                if let Some(v) = other.$field {
                    self.$field = Some(v);
                }
            };
        }
        merge!(header_table_size);
        merge!(enable_push);
        merge!(max_concurrent_streams);
        merge!(initial_window_size);
        merge!(max_frame_size);
        merge!(max_header_list_size);
    }

    pub(crate) fn initial_window_size(&self) -> u32 {
        self.initial_window_size
            .unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub(crate) fn max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    pub(crate) fn max_concurrent_streams(&self) -> u32 {
        self.max_concurrent_streams.unwrap_or(u32::MAX)
    }

    pub(crate) fn header_table_size(&self) -> u32 {
        self.header_table_size.unwrap_or(hpack::DEFAULT_TABLE_SIZE)
    }

    fn entries(&self) -> Vec<(u16, u32)> {
        let mut out = Vec::new();
        if let Some(v) = self.header_table_size {
            out.push((SETTINGS_HEADER_TABLE_SIZE, v));
        }
        if let Some(v) = self.enable_push {
            out.push((SETTINGS_ENABLE_PUSH, v as u32));
        }
        if let Some(v) = self.max_concurrent_streams {
            out.push((SETTINGS_MAX_CONCURRENT_STREAMS, v));
        }
        if let Some(v) = self.initial_window_size {
            out.push((SETTINGS_INITIAL_WINDOW_SIZE, v));
        }
        if let Some(v) = self.max_frame_size {
            out.push((SETTINGS_MAX_FRAME_SIZE, v));
        }
        if let Some(v) = self.max_header_list_size {
            out.push((SETTINGS_MAX_HEADER_LIST_SIZE, v));
        }
        out
    }

    fn parse(mut payload: &[u8]) -> Result<Settings, H2Error> {
        let mut settings = Settings::default();
        while payload.remaining() >= 6 {
            let id = payload.get_u16();
            let value = payload.get_u32();
            match id {
                SETTINGS_HEADER_TABLE_SIZE => settings.header_table_size = Some(value),
                SETTINGS_ENABLE_PUSH => match value {
                    0 => settings.enable_push = Some(false),
                    1 => settings.enable_push = Some(true),
                    _ => return Err(H2Error::protocol("ENABLE_PUSH must be 0 or 1")),
                },
                SETTINGS_MAX_CONCURRENT_STREAMS => settings.max_concurrent_streams = Some(value),
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(H2Error::protocol("INITIAL_WINDOW_SIZE exceeds 2^31-1"));
                    }
                    settings.initial_window_size = Some(value);
                }
                SETTINGS_MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE_CEILING).contains(&value) {
                        return Err(H2Error::protocol("MAX_FRAME_SIZE out of range"));
                    }
                    settings.max_frame_size = Some(value);
                }
                SETTINGS_MAX_HEADER_LIST_SIZE => settings.max_header_list_size = Some(value),
                // Unknown identifiers must be ignored.
                _ => {}
            }
        }
        Ok(settings)
    }
}

/// A fully-assembled frame, padding stripped and header blocks complete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    Data {
        stream_id: u32,
        end_stream: bool,
        data: Bytes,
    },
    Headers {
        stream_id: u32,
        end_stream: bool,
        block: Bytes,
    },
    Priority {
        stream_id: u32,
    },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
        settings: Settings,
    },
    PushPromise {
        stream_id: u32,
        promised_id: u32,
        block: Bytes,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
}

struct FrameHeader {
    length: u32,
    kind: u8,
    flags: u8,
    stream_id: u32,
}

impl FrameHeader {
    fn parse(buf: &[u8; FRAME_HEADER_LEN]) -> FrameHeader {
        FrameHeader {
            length: u32::from_be_bytes([0, buf[0], buf[1], buf[2]]),
            kind: buf[3],
            flags: buf[4],
            // High bit is reserved and must be masked off.
            stream_id: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff,
        }
    }

    fn encode(length: usize, kind: u8, flags: u8, stream_id: u32) -> [u8; FRAME_HEADER_LEN] {
        debug_assert!(length <= MAX_FRAME_SIZE_CEILING as usize);
        let len = (length as u32).to_be_bytes();
        let id = (stream_id & 0x7fff_ffff).to_be_bytes();
        [
            len[1], len[2], len[3], kind, flags, id[0], id[1], id[2], id[3],
        ]
    }
}

/// Reads frames off the transport. Single owner: the connection's reader
/// task.
pub(crate) struct FrameReader<R> {
    io: R,
    hpack: hpack::Decoder,
    max_frame_size: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(io: R) -> FrameReader<R> {
        FrameReader {
            io,
            hpack: hpack::Decoder::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// The header-decompression half, fed with each complete header block.
    pub(crate) fn hpack_mut(&mut self) -> &mut hpack::Decoder {
        &mut self.hpack
    }

    /// Raise the acceptable frame size after our SETTINGS were acked.
    pub(crate) fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    async fn read_payload(&mut self, length: u32) -> Result<BytesMut, H2Error> {
        let mut payload = BytesMut::zeroed(length as usize);
        self.io.read_exact(&mut payload).await?;
        Ok(payload)
    }

    /// Read one logical frame; HEADERS and PUSH_PROMISE are returned only
    /// once their CONTINUATION frames completed the header block.
    pub(crate) async fn read_frame(&mut self) -> Result<Frame, H2Error> {
        let mut head = [0u8; FRAME_HEADER_LEN];
        self.io.read_exact(&mut head).await?;
        let head = FrameHeader::parse(&head);

        if head.length > self.max_frame_size {
            return Err(H2Error::FrameSize);
        }

        match head.kind {
            TYPE_DATA => {
                if head.stream_id == 0 {
                    return Err(H2Error::protocol("DATA on stream 0"));
                }
                let payload = self.read_payload(head.length).await?;
                let data = strip_padding(payload, head.flags)?.freeze();
                Ok(Frame::Data {
                    stream_id: head.stream_id,
                    end_stream: head.flags & FLAG_END_STREAM != 0,
                    data,
                })
            }
            TYPE_HEADERS => {
                if head.stream_id == 0 {
                    return Err(H2Error::protocol("HEADERS on stream 0"));
                }
                let payload = self.read_payload(head.length).await?;
                let mut fragment = strip_padding(payload, head.flags)?;
                if head.flags & FLAG_PRIORITY != 0 {
                    if fragment.len() < 5 {
                        return Err(H2Error::FrameSize);
                    }
                    fragment.advance(5);
                }
                let block = self
                    .finish_header_block(head.stream_id, fragment, head.flags)
                    .await?;
                Ok(Frame::Headers {
                    stream_id: head.stream_id,
                    end_stream: head.flags & FLAG_END_STREAM != 0,
                    block,
                })
            }
            TYPE_PRIORITY => {
                if head.length != 5 {
                    return Err(H2Error::FrameSize);
                }
                let _ = self.read_payload(head.length).await?;
                Ok(Frame::Priority {
                    stream_id: head.stream_id,
                })
            }
            TYPE_RST_STREAM => {
                if head.length != 4 {
                    return Err(H2Error::FrameSize);
                }
                if head.stream_id == 0 {
                    return Err(H2Error::protocol("RST_STREAM on stream 0"));
                }
                let mut payload = self.read_payload(head.length).await?;
                Ok(Frame::RstStream {
                    stream_id: head.stream_id,
                    error_code: ErrorCode(payload.get_u32()),
                })
            }
            TYPE_SETTINGS => {
                if head.stream_id != 0 {
                    return Err(H2Error::protocol("SETTINGS on nonzero stream"));
                }
                let ack = head.flags & FLAG_ACK != 0;
                if ack {
                    if head.length != 0 {
                        return Err(H2Error::FrameSize);
                    }
                    return Ok(Frame::Settings {
                        ack: true,
                        settings: Settings::default(),
                    });
                }
                if head.length % 6 != 0 {
                    return Err(H2Error::FrameSize);
                }
                let payload = self.read_payload(head.length).await?;
                Ok(Frame::Settings {
                    ack: false,
                    settings: Settings::parse(&payload)?,
                })
            }
            TYPE_PUSH_PROMISE => {
                if head.stream_id == 0 {
                    return Err(H2Error::protocol("PUSH_PROMISE on stream 0"));
                }
                let payload = self.read_payload(head.length).await?;
                let mut fragment = strip_padding(payload, head.flags)?;
                if fragment.len() < 4 {
                    return Err(H2Error::FrameSize);
                }
                let promised_id = fragment.get_u32() & 0x7fff_ffff;
                let block = self
                    .finish_header_block(head.stream_id, fragment, head.flags)
                    .await?;
                Ok(Frame::PushPromise {
                    stream_id: head.stream_id,
                    promised_id,
                    block,
                })
            }
            TYPE_PING => {
                if head.length != 8 {
                    return Err(H2Error::FrameSize);
                }
                if head.stream_id != 0 {
                    return Err(H2Error::protocol("PING on nonzero stream"));
                }
                let payload = self.read_payload(head.length).await?;
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Ok(Frame::Ping {
                    ack: head.flags & FLAG_ACK != 0,
                    payload: data,
                })
            }
            TYPE_GOAWAY => {
                if head.length < 8 {
                    return Err(H2Error::FrameSize);
                }
                if head.stream_id != 0 {
                    return Err(H2Error::protocol("GOAWAY on nonzero stream"));
                }
                let mut payload = self.read_payload(head.length).await?;
                let last_stream_id = payload.get_u32() & 0x7fff_ffff;
                let error_code = ErrorCode(payload.get_u32());
                Ok(Frame::GoAway {
                    last_stream_id,
                    error_code,
                    debug_data: payload.freeze(),
                })
            }
            TYPE_WINDOW_UPDATE => {
                if head.length != 4 {
                    return Err(H2Error::FrameSize);
                }
                let mut payload = self.read_payload(head.length).await?;
                let increment = payload.get_u32() & 0x7fff_ffff;
                if increment == 0 {
                    return Err(H2Error::protocol("WINDOW_UPDATE with zero increment"));
                }
                Ok(Frame::WindowUpdate {
                    stream_id: head.stream_id,
                    increment,
                })
            }
            TYPE_CONTINUATION => Err(H2Error::protocol("CONTINUATION without open header block")),
            // Unknown frame types must be ignored: skip and read the next.
            _ => {
                let _ = self.read_payload(head.length).await?;
                Box::pin(self.read_frame()).await
            }
        }
    }

    async fn finish_header_block(
        &mut self,
        stream_id: u32,
        first_fragment: BytesMut,
        first_flags: u8,
    ) -> Result<Bytes, H2Error> {
        let mut block = first_fragment;
        let mut done = first_flags & FLAG_END_HEADERS != 0;
        while !done {
            let mut head = [0u8; FRAME_HEADER_LEN];
            self.io.read_exact(&mut head).await?;
            let head = FrameHeader::parse(&head);
            if head.kind != TYPE_CONTINUATION || head.stream_id != stream_id {
                return Err(H2Error::protocol("expected CONTINUATION"));
            }
            if head.length > self.max_frame_size {
                return Err(H2Error::FrameSize);
            }
            let fragment = self.read_payload(head.length).await?;
            block.extend_from_slice(&fragment);
            done = head.flags & FLAG_END_HEADERS != 0;
        }
        Ok(block.freeze())
    }
}

fn strip_padding(mut payload: BytesMut, flags: u8) -> Result<BytesMut, H2Error> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(H2Error::FrameSize);
    }
    let pad_len = payload.get_u8() as usize;
    if pad_len > payload.len() {
        return Err(H2Error::protocol("padding exceeds payload"));
    }
    payload.truncate(payload.len() - pad_len);
    Ok(payload)
}

/// Writes frames onto the transport. Owned by the connection's writer lock;
/// the header-compression encoder lives here so header emission is
/// serialized with frame emission.
pub(crate) struct FrameWriter<W> {
    io: W,
    hpack: hpack::Encoder,
    max_frame_size: u32,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub(crate) fn new(io: W) -> FrameWriter<W> {
        FrameWriter {
            io,
            hpack: hpack::Encoder::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Lower or raise the outgoing frame size after the peer's SETTINGS.
    pub(crate) fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    /// Cap the encoder's dynamic table after the peer's SETTINGS.
    pub(crate) fn set_header_table_size(&mut self, size: u32) {
        self.hpack.set_max_table_size(size as usize);
    }

    /// The client connection preface: the magic string and our SETTINGS.
    pub(crate) async fn connection_preface(&mut self, settings: &Settings) -> Result<(), H2Error> {
        self.io.write_all(CONNECTION_PREFACE).await?;
        self.settings(settings).await
    }

    pub(crate) async fn settings(&mut self, settings: &Settings) -> Result<(), H2Error> {
        let entries = settings.entries();
        let mut payload = BytesMut::with_capacity(entries.len() * 6);
        for (id, value) in entries {
            payload.put_u16(id);
            payload.put_u32(value);
        }
        self.io
            .write_all(&FrameHeader::encode(payload.len(), TYPE_SETTINGS, 0, 0))
            .await?;
        self.io.write_all(&payload).await?;
        Ok(())
    }

    pub(crate) async fn settings_ack(&mut self) -> Result<(), H2Error> {
        self.io
            .write_all(&FrameHeader::encode(0, TYPE_SETTINGS, FLAG_ACK, 0))
            .await?;
        Ok(())
    }

    /// Encode and write a header block, splitting into HEADERS plus
    /// CONTINUATION frames when it exceeds the frame size.
    pub(crate) async fn headers(
        &mut self,
        stream_id: u32,
        headers: &[hpack::Header],
        end_stream: bool,
    ) -> Result<(), H2Error> {
        let block = self.hpack.encode(headers);
        let max = self.max_frame_size as usize;
        let mut flags = if end_stream { FLAG_END_STREAM } else { 0 };

        if block.len() <= max {
            flags |= FLAG_END_HEADERS;
            self.io
                .write_all(&FrameHeader::encode(
                    block.len(),
                    TYPE_HEADERS,
                    flags,
                    stream_id,
                ))
                .await?;
            self.io.write_all(&block).await?;
            return Ok(());
        }

        let mut chunks = block.chunks(max).peekable();
        let first = chunks.next().expect("block is non-empty");
        self.io
            .write_all(&FrameHeader::encode(
                first.len(),
                TYPE_HEADERS,
                flags,
                stream_id,
            ))
            .await?;
        self.io.write_all(first).await?;
        while let Some(chunk) = chunks.next() {
            let flags = if chunks.peek().is_none() {
                FLAG_END_HEADERS
            } else {
                0
            };
            self.io
                .write_all(&FrameHeader::encode(
                    chunk.len(),
                    TYPE_CONTINUATION,
                    flags,
                    stream_id,
                ))
                .await?;
            self.io.write_all(chunk).await?;
        }
        Ok(())
    }

    /// Write one DATA frame. The caller is responsible for flow-control
    /// accounting; this only enforces the frame-size ceiling.
    pub(crate) async fn data(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        chunk: &[u8],
    ) -> Result<(), H2Error> {
        debug_assert!(chunk.len() <= self.max_frame_size as usize);
        let flags = if end_stream { FLAG_END_STREAM } else { 0 };
        self.io
            .write_all(&FrameHeader::encode(
                chunk.len(),
                TYPE_DATA,
                flags,
                stream_id,
            ))
            .await?;
        self.io.write_all(chunk).await?;
        Ok(())
    }

    pub(crate) async fn rst_stream(
        &mut self,
        stream_id: u32,
        error_code: ErrorCode,
    ) -> Result<(), H2Error> {
        self.io
            .write_all(&FrameHeader::encode(4, TYPE_RST_STREAM, 0, stream_id))
            .await?;
        self.io.write_all(&error_code.0.to_be_bytes()).await?;
        Ok(())
    }

    pub(crate) async fn ping(&mut self, ack: bool, payload: [u8; 8]) -> Result<(), H2Error> {
        let flags = if ack { FLAG_ACK } else { 0 };
        self.io
            .write_all(&FrameHeader::encode(8, TYPE_PING, flags, 0))
            .await?;
        self.io.write_all(&payload).await?;
        Ok(())
    }

    pub(crate) async fn goaway(
        &mut self,
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: &[u8],
    ) -> Result<(), H2Error> {
        let mut payload = BytesMut::with_capacity(8 + debug_data.len());
        payload.put_u32(last_stream_id & 0x7fff_ffff);
        payload.put_u32(error_code.0);
        payload.put_slice(debug_data);
        self.io
            .write_all(&FrameHeader::encode(payload.len(), TYPE_GOAWAY, 0, 0))
            .await?;
        self.io.write_all(&payload).await?;
        Ok(())
    }

    pub(crate) async fn window_update(
        &mut self,
        stream_id: u32,
        increment: u32,
    ) -> Result<(), H2Error> {
        debug_assert!(increment > 0 && increment <= MAX_WINDOW_SIZE);
        self.io
            .write_all(&FrameHeader::encode(4, TYPE_WINDOW_UPDATE, 0, stream_id))
            .await?;
        self.io.write_all(&increment.to_be_bytes()).await?;
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> Result<(), H2Error> {
        self.io.flush().await?;
        Ok(())
    }

    /// Flush and shut the write side down.
    pub(crate) async fn shutdown(&mut self) -> Result<(), H2Error> {
        self.io.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_back(buf: Vec<u8>) -> Frame {
        let mut reader = FrameReader::new(&buf[..]);
        reader.read_frame().await.unwrap()
    }

    #[tokio::test]
    async fn roundtrip_data() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.data(3, true, b"hello world").await.unwrap();
        assert_eq!(
            read_back(writer.io).await,
            Frame::Data {
                stream_id: 3,
                end_stream: true,
                data: Bytes::from_static(b"hello world"),
            }
        );
    }

    #[tokio::test]
    async fn roundtrip_rst_stream() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.rst_stream(5, ErrorCode::CANCEL).await.unwrap();
        assert_eq!(
            read_back(writer.io).await,
            Frame::RstStream {
                stream_id: 5,
                error_code: ErrorCode::CANCEL,
            }
        );
    }

    #[tokio::test]
    async fn roundtrip_settings() {
        let settings = Settings {
            enable_push: Some(false),
            max_concurrent_streams: Some(100),
            initial_window_size: Some(1 << 20),
            max_frame_size: Some(1 << 15),
            ..Settings::default()
        };
        let mut writer = FrameWriter::new(Vec::new());
        writer.settings(&settings).await.unwrap();
        assert_eq!(
            read_back(writer.io).await,
            Frame::Settings {
                ack: false,
                settings,
            }
        );
    }

    #[tokio::test]
    async fn roundtrip_settings_ack() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.settings_ack().await.unwrap();
        assert_eq!(
            read_back(writer.io).await,
            Frame::Settings {
                ack: true,
                settings: Settings::default(),
            }
        );
    }

    #[tokio::test]
    async fn roundtrip_ping() {
        let mut writer = FrameWriter::new(Vec::new());
        writer
            .ping(true, *b"\x00\x01\x02\x03\x04\x05\x06\x07")
            .await
            .unwrap();
        assert_eq!(
            read_back(writer.io).await,
            Frame::Ping {
                ack: true,
                payload: *b"\x00\x01\x02\x03\x04\x05\x06\x07",
            }
        );
    }

    #[tokio::test]
    async fn roundtrip_goaway() {
        let mut writer = FrameWriter::new(Vec::new());
        writer
            .goaway(7, ErrorCode::ENHANCE_YOUR_CALM, b"calm down")
            .await
            .unwrap();
        assert_eq!(
            read_back(writer.io).await,
            Frame::GoAway {
                last_stream_id: 7,
                error_code: ErrorCode::ENHANCE_YOUR_CALM,
                debug_data: Bytes::from_static(b"calm down"),
            }
        );
    }

    #[tokio::test]
    async fn roundtrip_window_update() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.window_update(0, 65_535).await.unwrap();
        assert_eq!(
            read_back(writer.io).await,
            Frame::WindowUpdate {
                stream_id: 0,
                increment: 65_535,
            }
        );
    }

    #[tokio::test]
    async fn roundtrip_headers_through_hpack() {
        let headers = vec![
            hpack::Header::new(":method", "GET"),
            hpack::Header::new(":scheme", "https"),
            hpack::Header::new(":path", "/index.html"),
            hpack::Header::new(":authority", "h2.example"),
            hpack::Header::new("accept", "*/*"),
        ];
        let mut writer = FrameWriter::new(Vec::new());
        writer.headers(1, &headers, true).await.unwrap();
        match read_back(writer.io).await {
            Frame::Headers {
                stream_id,
                end_stream,
                block,
            } => {
                assert_eq!(stream_id, 1);
                assert!(end_stream);
                let mut decoder = hpack::Decoder::new();
                let decoded = decoder.decode(&block).unwrap();
                assert_eq!(decoded, headers);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn header_block_splits_into_continuations() {
        // A value big enough to exceed one frame once the writer's frame
        // size is lowered.
        let headers = vec![
            hpack::Header::new(":method", "GET"),
            hpack::Header::new("x-large", &"v".repeat(40_000)),
        ];
        let mut writer = FrameWriter::new(Vec::new());
        writer.set_max_frame_size(DEFAULT_MAX_FRAME_SIZE);
        writer.headers(9, &headers, false).await.unwrap();
        let buf = writer.io;

        let mut reader = FrameReader::new(&buf[..]);
        match reader.read_frame().await.unwrap() {
            Frame::Headers {
                stream_id, block, ..
            } => {
                assert_eq!(stream_id, 9);
                let mut decoder = hpack::Decoder::new();
                assert_eq!(decoder.decode(&block).unwrap(), headers);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.set_max_frame_size(1 << 20);
        writer.data(1, false, &vec![0u8; 20_000]).await.unwrap();
        let buf = writer.io;

        let mut reader = FrameReader::new(&buf[..]);
        match reader.read_frame().await {
            Err(H2Error::FrameSize) => {}
            other => panic!("expected frame size error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_frame_types_are_skipped() {
        let mut buf = Vec::new();
        // An unknown type 0xfa frame, then a PING.
        buf.extend_from_slice(&FrameHeader::encode(3, 0xfa, 0, 0));
        buf.extend_from_slice(b"???");
        buf.extend_from_slice(&FrameHeader::encode(8, TYPE_PING, 0, 0));
        buf.extend_from_slice(&[0u8; 8]);

        let mut reader = FrameReader::new(&buf[..]);
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Frame::Ping {
                ack: false,
                payload: [0u8; 8],
            }
        );
    }

    #[tokio::test]
    async fn zero_window_increment_is_a_protocol_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&FrameHeader::encode(4, TYPE_WINDOW_UPDATE, 0, 1));
        buf.extend_from_slice(&0u32.to_be_bytes());

        let mut reader = FrameReader::new(&buf[..]);
        assert!(matches!(
            reader.read_frame().await,
            Err(H2Error::Protocol(_))
        ));
    }
}
