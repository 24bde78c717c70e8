//! Newline-delimited JSON framing.
//!
//! ## Frame format
//! Each envelope is serialized as compact JSON followed by a single `\n`.
//! `serde_json` escapes newlines inside strings, so the terminator never
//! appears inside a payload and a reader can split the stream on `\n` no
//! matter how the transport coalesces or fragments writes.
//!
//! ## Decoding
//! [`FrameDecoder`] is a push-style buffer: feed it whatever bytes arrived and
//! pull complete frames out; a partial frame stays buffered until the rest
//! shows up. [`FrameReader`] drives a decoder from any `AsyncRead`.
//! A malformed frame is reported as [`ChatError::Decode`] and discarded; the
//! next frame decodes normally.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{ChatError, Result};

/// Byte that terminates every frame.
pub const FRAME_TERMINATOR: u8 = b'\n';

/// Largest payload accepted before the decoder gives up on a frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// Serialize an envelope into one terminated frame.
pub fn encode<T: Serialize>(envelope: &T) -> Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(envelope)
        .map_err(|e| ChatError::Decode(format!("encode failed: {}", e)))?;
    frame.push(FRAME_TERMINATOR);
    Ok(frame)
}

/// Decode a single frame. The terminator and a trailing `\r` are optional.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    let payload = trim_frame(frame);
    if payload.is_empty() {
        return Err(ChatError::Decode("empty frame".to_string()));
    }
    Ok(serde_json::from_slice(payload)?)
}

fn trim_frame(frame: &[u8]) -> &[u8] {
    let mut end = frame.len();
    while end > 0 && matches!(frame[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &frame[..end]
}

/// Encode `envelope` and write it to `writer` in one `write_all`.
pub async fn write_frame<W, T>(writer: &mut W, envelope: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Push decoder
// ---------------------------------------------------------------------------

/// Incremental frame splitter with a bounded buffer.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_bytes: usize,
    /// Set after an oversized frame was reported; bytes are dropped until the
    /// next terminator.
    discarding: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        FrameDecoder {
            buf: Vec::new(),
            max_frame_bytes: max_frame_bytes.max(1),
            discarding: false,
        }
    }

    /// Append raw bytes read from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.discarding {
            // Only the part after the next terminator is worth keeping.
            if let Some(pos) = bytes.iter().position(|&b| b == FRAME_TERMINATOR) {
                self.discarding = false;
                self.buf.extend_from_slice(&bytes[pos + 1..]);
            }
            return;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently held waiting for a terminator.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pull the next complete frame.
    ///
    /// Returns `None` when more bytes are needed. `Some(Err(Decode))` means a
    /// frame was discarded; calling again continues with the following frame.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Option<Result<T>> {
        loop {
            match self.buf.iter().position(|&b| b == FRAME_TERMINATOR) {
                Some(pos) => {
                    let line: Vec<u8> = self.buf.drain(..=pos).collect();
                    let payload = trim_frame(&line);
                    if payload.is_empty() {
                        continue;
                    }
                    if payload.len() > self.max_frame_bytes {
                        return Some(Err(self.oversized(payload.len())));
                    }
                    return Some(decode(payload));
                }
                None => {
                    if self.buf.len() > self.max_frame_bytes {
                        let len = self.buf.len();
                        self.buf.clear();
                        self.discarding = true;
                        return Some(Err(self.oversized(len)));
                    }
                    return None;
                }
            }
        }
    }

    /// Flush at end of stream: leftover bytes form a truncated frame.
    pub fn finish<T: DeserializeOwned>(&mut self) -> Option<Result<T>> {
        self.discarding = false;
        if trim_frame(&self.buf).iter().all(|b| b.is_ascii_whitespace()) {
            self.buf.clear();
            return None;
        }
        let len = self.buf.len();
        self.buf.clear();
        Some(Err(ChatError::Decode(format!(
            "truncated frame of {} byte(s) at end of stream",
            len
        ))))
    }

    fn oversized(&self, len: usize) -> ChatError {
        ChatError::Decode(format!(
            "frame of {} byte(s) exceeds limit of {}",
            len, self.max_frame_bytes
        ))
    }
}

// ---------------------------------------------------------------------------
// Async reader
// ---------------------------------------------------------------------------

/// Reads frames from an `AsyncRead`, keeping partial frames across reads.
///
/// Reads are cancel-safe: dropping a pending `read_frame` future loses no
/// bytes that were already buffered.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
    eof: bool,
    skipped: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_bytes: usize) -> Self {
        FrameReader {
            inner,
            decoder: FrameDecoder::new(max_frame_bytes),
            chunk: vec![0u8; READ_CHUNK],
            eof: false,
            skipped: 0,
        }
    }

    /// Next frame, undecoded errors included.
    ///
    /// `None` once the stream has closed and everything buffered is drained.
    /// `Some(Err(Decode))` is a skipped frame; `Some(Err(Io))` is a transport
    /// failure after which only `None` follows.
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Option<Result<T>> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Some(frame);
            }
            if self.eof {
                return self.decoder.finish();
            }
            match self.inner.read(&mut self.chunk).await {
                Ok(0) => self.eof = true,
                Ok(n) => self.decoder.push(&self.chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.eof = true;
                    return Some(Err(ChatError::Io(e)));
                }
            }
        }
    }

    /// Next successfully decoded envelope, skipping malformed frames.
    ///
    /// `Ok(None)` means the peer closed the stream.
    pub async fn next_envelope<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            match self.read_frame().await {
                None => return Ok(None),
                Some(Ok(envelope)) => return Ok(Some(envelope)),
                Some(Err(e)) if e.is_recoverable() => {
                    self.skipped += 1;
                    warn!(error = %e, skipped = self.skipped, "skipping frame");
                }
                Some(Err(e)) => {
                    debug!(error = %e, "frame reader stopped");
                    return Err(e);
                }
            }
        }
    }

    /// Number of frames discarded by [`next_envelope`](Self::next_envelope).
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{MessageEnvelope, OutboundEnvelope};

    fn env(sender: &str, message: &str) -> MessageEnvelope {
        MessageEnvelope {
            sender: sender.into(),
            message: message.into(),
            timestamp: "10:00:00".into(),
        }
    }

    #[test]
    fn test_encode_ends_with_single_newline() {
        let frame = encode(&env("a", "line one\nline two")).unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(frame.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn test_decoder_handles_two_frames_in_one_push() {
        let mut bytes = encode(&env("a", "1")).unwrap();
        bytes.extend(encode(&env("b", "2")).unwrap());
        let mut dec = FrameDecoder::default();
        dec.push(&bytes);
        let first: MessageEnvelope = dec.next_frame().unwrap().unwrap();
        let second: MessageEnvelope = dec.next_frame().unwrap().unwrap();
        assert_eq!(first.sender, "a");
        assert_eq!(second.sender, "b");
        assert!(dec.next_frame::<MessageEnvelope>().is_none());
    }

    #[test]
    fn test_decoder_reassembles_byte_by_byte() {
        let bytes = encode(&env("alice", "hello")).unwrap();
        let mut dec = FrameDecoder::default();
        for (i, b) in bytes.iter().enumerate() {
            dec.push(std::slice::from_ref(b));
            let got = dec.next_frame::<MessageEnvelope>();
            if i + 1 < bytes.len() {
                assert!(got.is_none());
            } else {
                assert_eq!(got.unwrap().unwrap(), env("alice", "hello"));
            }
        }
    }

    #[test]
    fn test_malformed_frame_is_skipped_not_fatal() {
        let mut dec = FrameDecoder::default();
        dec.push(b"{not json}\n");
        dec.push(&encode(&OutboundEnvelope::new("ok")).unwrap());
        assert!(matches!(
            dec.next_frame::<OutboundEnvelope>(),
            Some(Err(ChatError::Decode(_)))
        ));
        let next: OutboundEnvelope = dec.next_frame().unwrap().unwrap();
        assert_eq!(next.message, "ok");
    }

    #[test]
    fn test_blank_lines_and_crlf_tolerated() {
        let mut dec = FrameDecoder::default();
        dec.push(b"\n\r\n{\"message\":\"hi\"}\r\n");
        let out: OutboundEnvelope = dec.next_frame().unwrap().unwrap();
        assert_eq!(out.message, "hi");
    }

    #[test]
    fn test_oversized_frame_discarded_until_terminator() {
        let mut dec = FrameDecoder::new(16);
        dec.push(&[b'x'; 32]);
        assert!(matches!(
            dec.next_frame::<OutboundEnvelope>(),
            Some(Err(ChatError::Decode(_)))
        ));
        assert_eq!(dec.buffered(), 0);
        dec.push(b"more junk\n{\"message\":\"a\"}\n");
        let out: OutboundEnvelope = dec.next_frame().unwrap().unwrap();
        assert_eq!(out.message, "a");
    }

    #[test]
    fn test_finish_reports_truncated_tail() {
        let mut dec = FrameDecoder::default();
        dec.push(b"{\"message\":\"cut");
        assert!(dec.next_frame::<OutboundEnvelope>().is_none());
        assert!(matches!(
            dec.finish::<OutboundEnvelope>(),
            Some(Err(ChatError::Decode(_)))
        ));
        assert!(dec.finish::<OutboundEnvelope>().is_none());
    }

    #[test]
    fn test_decode_without_terminator() {
        let out: OutboundEnvelope = decode(br#"{"message":"x"}"#).unwrap();
        assert_eq!(out.message, "x");
    }

    #[tokio::test]
    async fn test_reader_skips_garbage_and_stops_at_eof() {
        let mut data = b"garbage\n".to_vec();
        data.extend(encode(&env("a", "1")).unwrap());
        data.extend(b"{\"sender\":");
        let mut reader = FrameReader::new(&data[..], DEFAULT_MAX_FRAME_BYTES);
        let got: Option<MessageEnvelope> = reader.next_envelope().await.unwrap();
        assert_eq!(got.unwrap().sender, "a");
        let end: Option<MessageEnvelope> = reader.next_envelope().await.unwrap();
        assert!(end.is_none());
        assert_eq!(reader.skipped(), 2);
    }

    #[tokio::test]
    async fn test_write_frame_then_read_back() {
        let (client, server) = tokio::io::duplex(64);
        let (_, mut w) = tokio::io::split(client);
        let writer = tokio::spawn(async move {
            for i in 0..5 {
                write_frame(&mut w, &OutboundEnvelope::new(format!("m{}", i)))
                    .await
                    .unwrap();
            }
        });
        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_BYTES);
        for i in 0..5 {
            let out: OutboundEnvelope = reader.next_envelope().await.unwrap().unwrap();
            assert_eq!(out.message, format!("m{}", i));
        }
        writer.await.unwrap();
    }
}
