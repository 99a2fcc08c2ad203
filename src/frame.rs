//! Message framing over a byte stream.
//!
//! Every frame is an 8-byte big-endian payload length followed by that
//! many bytes of zlib-compressed UTF-8 JSON. Reads and writes are each
//! atomic with respect to the underlying socket; concurrent writers
//! must serialize through a session's send queue.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Result, SyncError};
use crate::message::Message;

/// Size of the length prefix preceding every payload.
pub const LEN_PREFIX_BYTES: usize = 8;

/// Encode a message into a standalone frame.
///
/// # Errors
///
/// Returns `Frame` if serialization fails or the compressed payload
/// exceeds `max_frame_bytes`.
pub fn encode(msg: &Message, max_frame_bytes: u64) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)
        .map_err(|e| SyncError::Frame(format!("serialize {}: {e}", msg.kind())))?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let payload = encoder.finish()?;

    let len = payload.len() as u64;
    if len > max_frame_bytes {
        return Err(SyncError::Frame(format!(
            "payload of {len} bytes exceeds cap of {max_frame_bytes}"
        )));
    }

    let mut frame = Vec::with_capacity(LEN_PREFIX_BYTES + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one message as a frame.
///
/// # Errors
///
/// Returns `Frame` on encoding failure and `Io` on write failure.
pub fn write_message<W: Write>(writer: &mut W, msg: &Message, max_frame_bytes: u64) -> Result<()> {
    let frame = encode(msg, max_frame_bytes)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one message frame.
///
/// # Errors
///
/// Returns `Io` when the stream ends before a complete frame arrives
/// (a closed peer surfaces as `UnexpectedEof`), and `Frame` when the
/// length exceeds `max_frame_bytes` or the payload fails to decompress
/// or parse.
pub fn read_message<R: Read>(reader: &mut R, max_frame_bytes: u64) -> Result<Message> {
    let mut len_buf = [0u8; LEN_PREFIX_BYTES];
    reader.read_exact(&mut len_buf)?;
    let len = u64::from_be_bytes(len_buf);

    if len > max_frame_bytes {
        return Err(SyncError::Frame(format!(
            "announced length {len} exceeds cap of {max_frame_bytes}"
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;

    let mut json = Vec::new();
    ZlibDecoder::new(payload.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| SyncError::Frame(format!("decompression failed: {e}")))?;

    serde_json::from_slice(&json).map_err(|e| SyncError::Frame(format!("bad payload: {e}")))
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    const CAP: u64 = 64 * 1024 * 1024;

    proptest! {
        /// decode(encode(m)) == m for content-bearing messages.
        #[test]
        fn round_trip(
            path in "[a-zA-Z0-9_./-]{1,40}",
            mtime in 0.0f64..2_000_000_000.0,
            bytes in prop::collection::vec(any::<u8>(), 0..2000)
        ) {
            let msg = Message::Create { path, mtime, bytes };
            let frame = encode(&msg, CAP).unwrap();
            let back = read_message(&mut Cursor::new(frame), CAP).unwrap();
            prop_assert_eq!(msg, back);
        }

        /// Frames survive concatenation: a stream of frames decodes in
        /// order with no residue between them.
        #[test]
        fn stream_of_frames(ports in prop::collection::vec(any::<u16>(), 1..10)) {
            let mut buf = Vec::new();
            for &port in &ports {
                write_message(&mut buf, &Message::Hello { port }, CAP).unwrap();
            }
            let mut cursor = Cursor::new(buf);
            for &port in &ports {
                let got = read_message(&mut cursor, CAP).unwrap();
                prop_assert_eq!(Message::Hello { port }, got);
            }
        }
    }
}
