use crate::{Error, FRAME_HEADER_SIZE, MAGIC, MAX_MESSAGE_SIZE};

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;

/// Header type identifiers.
///
/// Values below 1000 are channel-level (request/reply plumbing); the 1000
/// range belongs to the edge layer and is interpreted per logical
/// connection.
pub mod header {
    /// Sequence number of the message this one replies to.
    pub const REPLY_FOR: u32 = 1;
    /// One byte, non-zero when the replied-to operation succeeded.
    pub const RESULT_SUCCESS: u32 = 2;

    /// Logical connection the message belongs to.
    pub const CONN_ID: u32 = 1000;
    /// Per-connection sequence of DATA frames.
    pub const SEQ: u32 = 1001;
    /// Session or net-session token, UTF-8.
    pub const SESSION_TOKEN: u32 = 1002;
    /// X25519 public key for the per-stream key exchange.
    pub const PUBLIC_KEY: u32 = 1003;
    /// Identity name of the dialing side, UTF-8.
    pub const CALLER_ID: u32 = 1004;
    /// Router software version, UTF-8. Carried on the HELLO reply.
    pub const ROUTER_INFO: u32 = 1005;
    /// Present (any value) when the sender will write no further data.
    pub const FIN: u32 = 1006;
    /// Terminator identity offered by a binding listener, UTF-8.
    pub const TERMINATOR_IDENTITY: u32 = 1007;
    /// Routing cost of a bound terminator.
    pub const COST: u32 = 1008;
    /// Routing precedence of a bound terminator.
    pub const PRECEDENCE: u32 = 1009;
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum ContentType {
    Hello = 256,
    HelloReply = 257,
    Ping = 258,
    PingReply = 259,
    Latency = 260,
    LatencyResponse = 261,

    Connect = 60783,
    StateConnected = 60784,
    StateClosed = 60785,
    Data = 60786,
    Dial = 60787,
    DialSuccess = 60788,
    DialFailed = 60789,
    Bind = 60790,
    Unbind = 60791,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub kind: u32,
    pub value: Bytes,
}

/// A single frame of the edge protocol.
///
/// `seq` is assigned by the channel when the message is written; messages
/// built by higher layers leave it at zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub content: ContentType,
    pub seq: u32,
    pub headers: Vec<Header>,
    pub body: Bytes,
}

impl Message {
    pub fn new(content: ContentType) -> Self {
        Self {
            content,
            seq: 0,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, kind: u32, value: impl Into<Bytes>) -> Self {
        self.headers.push(Header {
            kind,
            value: value.into(),
        });

        self
    }

    pub fn with_u32(self, kind: u32, value: u32) -> Self {
        self.with_header(kind, value.to_le_bytes().to_vec())
    }

    /// Adds a one-byte flag header, non-zero meaning set.
    pub fn with_flag(self, kind: u32, value: bool) -> Self {
        self.with_header(kind, vec![value as u8])
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Gets a header value.
    ///
    /// Note: only the first header of a given type is returned.
    pub fn header(&self, kind: u32) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|it| it.kind == kind)
            .map(|it| it.value.as_ref())
    }

    pub fn u32_header(&self, kind: u32) -> Option<u32> {
        self.header(kind)
            .and_then(|it| it.try_into().ok())
            .map(u32::from_le_bytes)
    }

    pub fn str_header(&self, kind: u32) -> Option<&str> {
        self.header(kind).and_then(|it| std::str::from_utf8(it).ok())
    }

    pub fn conn_id(&self) -> Option<u32> {
        self.u32_header(header::CONN_ID)
    }

    pub fn reply_for(&self) -> Option<u32> {
        self.u32_header(header::REPLY_FOR)
    }

    pub fn edge_seq(&self) -> Option<u32> {
        self.u32_header(header::SEQ)
    }

    pub fn is_fin(&self) -> bool {
        self.header(header::FIN).is_some()
    }

    pub fn is_success(&self) -> bool {
        self.header(header::RESULT_SUCCESS)
            .is_some_and(|it| it.first().copied().unwrap_or(0) != 0)
    }

    /// Total encoded size of the frame.
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.headers_size() + self.body.len()
    }

    fn headers_size(&self) -> usize {
        self.headers.iter().map(|it| 8 + it.value.len()).sum()
    }

    /// Encodes the frame into `dst`.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use veil_sdk_codec::{ContentType, Message, header};
    ///
    /// let msg = Message::new(ContentType::Data)
    ///     .with_u32(header::CONN_ID, 7)
    ///     .with_body(&b"hi"[..]);
    ///
    /// let mut buf = BytesMut::new();
    /// msg.encode(&mut buf).unwrap();
    ///
    /// assert_eq!(
    ///     &buf[..],
    ///     &[
    ///         0x76, 0x65, 0x69, 0x6c, // magic
    ///         0x72, 0xed, 0x00, 0x00, // content
    ///         0x02, 0x00, 0x00, 0x00, // body len
    ///         0x0c, 0x00, 0x00, 0x00, // headers len
    ///         0x00, 0x00, 0x00, 0x00, // seq
    ///         0xe8, 0x03, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x07, 0x00,
    ///         0x00, 0x00, // conn id header
    ///         0x68, 0x69, // body
    ///     ][..],
    /// );
    /// ```
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), Error> {
        let hdrs_len = self.headers_size();
        if hdrs_len + self.body.len() > MAX_MESSAGE_SIZE {
            return Err(Error::Oversized(hdrs_len + self.body.len()));
        }

        dst.reserve(self.encoded_size());
        dst.put_slice(&MAGIC);
        dst.put_u32_le(self.content as u32);
        dst.put_u32_le(self.body.len() as u32);
        dst.put_u32_le(hdrs_len as u32);
        dst.put_u32_le(self.seq);

        for it in &self.headers {
            dst.put_u32_le(it.kind);
            dst.put_u32_le(it.value.len() as u32);
            dst.put_slice(&it.value);
        }

        dst.put_slice(&self.body);
        Ok(())
    }

    /// Peeks the total frame size from a possibly partial buffer.
    ///
    /// Returns `None` when not enough bytes have arrived to know the size
    /// yet. Frame boundary errors (bad magic, oversized declaration) are
    /// fatal to the transport and reported as errors.
    pub fn message_size(bytes: &[u8]) -> Result<Option<usize>, Error> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        if bytes[..4] != MAGIC {
            return Err(Error::NotFoundMagicNumber);
        }

        let body_len = get_u32(bytes, 8)? as usize;
        let hdrs_len = get_u32(bytes, 12)? as usize;
        if body_len + hdrs_len > MAX_MESSAGE_SIZE {
            return Err(Error::Oversized(body_len + hdrs_len));
        }

        Ok(Some(FRAME_HEADER_SIZE + hdrs_len + body_len))
    }

    /// Decodes one complete frame.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use veil_sdk_codec::{ContentType, Message, header};
    ///
    /// let msg = Message::new(ContentType::Connect)
    ///     .with_u32(header::CONN_ID, 3)
    ///     .with_body(&b"token"[..]);
    ///
    /// let mut buf = BytesMut::new();
    /// msg.encode(&mut buf).unwrap();
    ///
    /// let decoded = Message::decode(&buf).unwrap();
    /// assert_eq!(decoded.content, ContentType::Connect);
    /// assert_eq!(decoded.conn_id(), Some(3));
    /// assert_eq!(&decoded.body[..], b"token");
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let size = Self::message_size(bytes)?.ok_or(Error::InvalidInput)?;
        if bytes.len() < size {
            return Err(Error::InvalidInput);
        }

        let content = get_u32(bytes, 4)?;
        let content =
            ContentType::try_from(content).map_err(|_| Error::UnknownContentType(content))?;

        let body_len = get_u32(bytes, 8)? as usize;
        let hdrs_len = get_u32(bytes, 12)? as usize;
        let seq = get_u32(bytes, 16)?;

        let mut headers = Vec::new();
        let mut offset = FRAME_HEADER_SIZE;
        let hdrs_end = FRAME_HEADER_SIZE + hdrs_len;
        while offset < hdrs_end {
            if hdrs_end - offset < 8 {
                return Err(Error::InvalidInput);
            }

            let kind = get_u32(bytes, offset)?;
            let len = get_u32(bytes, offset + 4)? as usize;
            offset += 8;
            if hdrs_end - offset < len {
                return Err(Error::InvalidInput);
            }

            headers.push(Header {
                kind,
                value: Bytes::copy_from_slice(&bytes[offset..offset + len]),
            });

            offset += len;
        }

        Ok(Self {
            content,
            seq,
            headers,
            body: Bytes::copy_from_slice(&bytes[hdrs_end..hdrs_end + body_len]),
        })
    }
}

fn get_u32(bytes: &[u8], offset: usize) -> Result<u32, Error> {
    Ok(u32::from_le_bytes(bytes[offset..offset + 4].try_into()?))
}
