use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    error::{Error, Result},
    topic::TopicHash,
};

/// kind | seq | topic_hash | sent_at
pub const HEADER_LEN: usize = 1 + 8 + 8 + 8;

/// Frames larger than this are refused unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Frame kinds. Client-originated kinds live below 16, peer-originated kinds
/// at 16 and above.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// A request expecting exactly one `Response` or `Failure`.
    Call = 1,
    /// A one-way send; the peer never answers.
    Publish = 2,
    /// Opens a push stream. `seq` is the subscription id.
    Subscribe = 3,
    /// Closes the push stream opened under the same `seq`.
    Unsubscribe = 4,
    Response = 16,
    /// Body is a codec envelope of (message, diagnostic payload).
    Failure = 17,
    /// A pushed message for the subscription named by `seq`.
    Push = 18,
}

impl FrameKind {
    pub fn is_reply(self) -> bool {
        matches!(self, FrameKind::Response | FrameKind::Failure)
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => FrameKind::Call,
            2 => FrameKind::Publish,
            3 => FrameKind::Subscribe,
            4 => FrameKind::Unsubscribe,
            16 => FrameKind::Response,
            17 => FrameKind::Failure,
            18 => FrameKind::Push,
            other => Err(Error::protocol(format!("unknown frame kind {other}")))?,
        })
    }
}

/// One length-prefixed message on a connection.
///
/// On the wire: `len:u32 | kind:u8 | seq:u64 | topic_hash:u64 | sent_at:i64 |
/// body`, all little endian, where `len` covers everything after itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub seq: u64,
    pub topic_hash: TopicHash,
    /// Microseconds since the epoch at which the originating request was
    /// sent. Replies echo the request's value.
    pub sent_at: i64,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(
        kind: FrameKind,
        seq: u64,
        topic_hash: TopicHash,
        body: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            seq,
            topic_hash,
            sent_at: Utc::now().timestamp_micros(),
            body,
        }
    }

    /// Builds an answer correlated to `self`.
    pub fn reply(&self, kind: FrameKind, body: Vec<u8>) -> Self {
        Self {
            kind,
            seq: self.seq,
            topic_hash: self.topic_hash,
            sent_at: self.sent_at,
            body,
        }
    }

    /// Microseconds elapsed since `sent_at`.
    pub fn age_micros(&self) -> i64 {
        Utc::now().timestamp_micros().saturating_sub(self.sent_at)
    }

    /// What the length prefix will say: header plus body.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Refuses frames the peer would reject under the same bound that
    /// [`read_frame`] applies.
    pub fn ensure_within(&self, max_len: usize) -> Result<()> {
        let len = self.wire_len();
        if len > max_len {
            Err(Error::protocol(format!("frame length {len} exceeds {max_len}")))?
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = u32::try_from(self.wire_len()).map_err(|_| {
            Error::protocol(format!(
                "frame length {} does not fit the length prefix",
                self.wire_len()
            ))
        })?;
        let mut buf = Vec::with_capacity(4 + self.wire_len());
        buf.resize(4 + HEADER_LEN, 0);
        LittleEndian::write_u32(&mut buf[0..4], len);
        buf[4] = self.kind as u8;
        LittleEndian::write_u64(&mut buf[5..13], self.seq);
        LittleEndian::write_u64(&mut buf[13..21], self.topic_hash);
        LittleEndian::write_i64(&mut buf[21..29], self.sent_at);
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    /// Decodes everything after the length prefix.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            Err(Error::protocol(format!("short frame of {} bytes", buf.len())))?
        }
        Ok(Self {
            kind: FrameKind::try_from(buf[0])?,
            seq: u64::from_le_bytes(*array_ref![buf, 1, 8]),
            topic_hash: u64::from_le_bytes(*array_ref![buf, 9, 8]),
            sent_at: i64::from_le_bytes(*array_ref![buf, 17, 8]),
            body: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Reads one frame. Returns `Ok(None)` when the peer closed the stream
/// cleanly between frames.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None)
        }
        Err(e) => Err(e)?,
    }
    let len = LittleEndian::read_u32(&len_buf) as usize;
    if len < HEADER_LEN {
        Err(Error::protocol(format!("frame length {len} below header size")))?
    }
    if len > max_len {
        Err(Error::protocol(format!("frame length {len} exceeds {max_len}")))?
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Frame::decode(&buf).map(Some)
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&frame.encode()?).await?;
    writer.flush().await?;
    Ok(())
}
