// Codecs turn a (topic, payload) pair into the body of a frame and back. The
// client treats the result as opaque bytes: framing, correlation and routing
// all happen outside the codec, so any deterministic, symmetric encoding can
// be plugged in.

use std::io::Read;

use rkyv::{AlignedVec, Archive, Deserialize, Serialize};

use super::{
    error::{Error, Result},
    wire::DEFAULT_MAX_FRAME_LEN,
};

pub trait Codec: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn encode(&self, topic: &str, payload: &[u8]) -> Result<Vec<u8>>;

    /// Recovers the topic and payload from an encoded body.
    fn decode_topic(&self, bytes: &[u8]) -> Result<(String, Vec<u8>)>;

    /// Recovers only the payload.
    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        self.decode_topic(bytes).map(|(_, payload)| payload)
    }
}

#[derive(Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
struct Envelope {
    topic: String,
    payload: Vec<u8>,
}

/// Archives the pair with rkyv and validates archives on the way in.
#[derive(Clone, Copy, Debug, Default)]
pub struct RkyvCodec;

impl Codec for RkyvCodec {
    fn name(&self) -> &'static str {
        "rkyv"
    }

    fn encode(&self, topic: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let envelope = Envelope {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
        };
        rkyv::to_bytes::<_, 256>(&envelope)
            .map(|bytes| bytes.to_vec())
            .map_err(|_| Error::protocol("could not archive envelope"))
    }

    fn decode_topic(&self, bytes: &[u8]) -> Result<(String, Vec<u8>)> {
        // archives must be aligned; frame bodies come off the socket unaligned
        let mut aligned = AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        let archived = rkyv::check_archived_root::<Envelope>(&aligned)
            .map_err(|_| Error::protocol("malformed rkyv envelope"))?;
        Ok((archived.topic.as_str().to_owned(), archived.payload.to_vec()))
    }
}

/// `varint(topic_len) | topic | payload`. No validation beyond UTF-8.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn encode(&self, topic: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let mut len_buf = unsigned_varint::encode::usize_buffer();
        let len = unsigned_varint::encode::usize(topic.len(), &mut len_buf);
        let mut buf = Vec::with_capacity(len.len() + topic.len() + payload.len());
        buf.extend_from_slice(len);
        buf.extend_from_slice(topic.as_bytes());
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    fn decode_topic(&self, bytes: &[u8]) -> Result<(String, Vec<u8>)> {
        let (len, rest) = unsigned_varint::decode::usize(bytes)
            .map_err(|e| Error::protocol(format!("bad topic length: {e}")))?;
        if rest.len() < len {
            Err(Error::protocol("topic runs past the end of the body"))?
        }
        let (topic, payload) = rest.split_at(len);
        let topic = std::str::from_utf8(topic)
            .map_err(|_| Error::protocol("topic is not UTF-8"))?;
        Ok((topic.to_owned(), payload.to_vec()))
    }
}

/// Wraps another codec and zstd-compresses its output. Bodies that would
/// inflate past `max_decoded` bytes are refused.
#[derive(Clone, Debug)]
pub struct ZstdCodec<C> {
    inner: C,
    level: i32,
    max_decoded: usize,
}

impl<C: Codec> ZstdCodec<C> {
    pub fn new(inner: C) -> Self {
        Self::with_level(inner, zstd::DEFAULT_COMPRESSION_LEVEL)
    }

    pub fn with_level(inner: C, level: i32) -> Self {
        Self {
            inner,
            level,
            max_decoded: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn max_decoded(mut self, limit: usize) -> Self {
        self.max_decoded = limit;
        self
    }
}

impl<C: Codec> Codec for ZstdCodec<C> {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn encode(&self, topic: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let plain = self.inner.encode(topic, payload)?;
        zstd::bulk::compress(&plain, self.level)
            .map_err(|e| Error::protocol(format!("zstd compress: {e}")))
    }

    fn decode_topic(&self, bytes: &[u8]) -> Result<(String, Vec<u8>)> {
        let corrupt = |e| Error::protocol(format!("zstd decompress: {e}"));
        let decoder = zstd::stream::read::Decoder::new(bytes).map_err(corrupt)?;
        let mut plain = Vec::new();
        decoder
            .take(self.max_decoded as u64 + 1)
            .read_to_end(&mut plain)
            .map_err(corrupt)?;
        if plain.len() > self.max_decoded {
            Err(Error::protocol(format!(
                "zstd body inflates past {} bytes",
                self.max_decoded
            )))?
        }
        self.inner.decode_topic(&plain)
    }
}
