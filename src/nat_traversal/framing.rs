/**
 * nat_traversal/framing.rs
 *
 * Length-prefixed message framing shared by the control and application streams
 *
 * ┌─────────────────┬────────────────────┐
 * │ Length (4 bytes)│ Payload (N bytes)  │
 * │  big-endian u32 │                    │
 * └─────────────────┴────────────────────┘
 */

use super::error::FrameError;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length prefix size in bytes
pub const LEN_PREFIX: usize = 4;

/// Prefix `payload` with its big-endian u32 length.
///
/// Empty payloads are a caller bug, not a wire condition, and are refused
/// before anything is produced.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::EmptyPayload);
    }
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Write one framed message and flush it
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(payload)?;
    writer
        .write_all(&frame)
        .await
        .map_err(FrameError::TruncatedWrite)?;
    writer.flush().await.map_err(FrameError::TruncatedWrite)?;
    Ok(())
}

/// Read one framed message. No upper bound is placed on the declared length.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    read_frame_bounded(reader, usize::MAX).await
}

/// Read one framed message, refusing declared lengths above `limit`
pub async fn read_frame_bounded<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_PREFIX];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(truncated_read)?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > limit {
        return Err(FrameError::ExceedsLimit { len, limit });
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(truncated_read)?;
    Ok(payload)
}

fn truncated_read(e: std::io::Error) -> FrameError {
    if e.kind() != ErrorKind::UnexpectedEof {
        log::debug!("Frame read failed: {}", e);
    }
    FrameError::TruncatedRead(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio_test::io::Builder;

    #[test]
    fn encode_prefixes_big_endian_length() {
        let frame = encode(b"hello").unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 5]);
        assert_eq!(&frame[4..], b"hello");
    }

    #[test]
    fn encode_refuses_empty_payload() {
        assert!(matches!(encode(b""), Err(FrameError::EmptyPayload)));
    }

    #[tokio::test]
    async fn write_refuses_empty_payload_without_writing() {
        // The mock fails the test if anything is written to it
        let mut writer = Builder::new().build();
        let err = write_frame(&mut writer, b"").await.unwrap_err();
        assert!(matches!(err, FrameError::EmptyPayload));
    }

    #[tokio::test]
    async fn write_emits_single_frame() {
        let mut writer = Builder::new().write(&[0, 0, 0, 3, b'a', b'9', b'1']).build();
        write_frame(&mut writer, b"a91").await.unwrap();
    }

    #[tokio::test]
    async fn roundtrip_through_buffer() {
        let payloads: [&[u8]; 3] = [b"x", b"hello", &[0xff; 4096]];
        for payload in payloads {
            let mut buf = Vec::new();
            write_frame(&mut buf, payload).await.unwrap();
            let decoded = read_frame(&mut Cursor::new(buf)).await.unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[tokio::test]
    async fn read_across_split_chunks() {
        let mut reader = Builder::new()
            .read(&[0, 0])
            .read(&[0, 5, b'h', b'e'])
            .read(b"llo")
            .build();
        assert_eq!(read_frame(&mut reader).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn short_payload_is_truncation_error() {
        let mut reader = Builder::new().read(&[0, 0, 0, 5]).read(b"hel").build();
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::TruncatedRead(_)));
    }

    #[tokio::test]
    async fn short_prefix_is_truncation_error() {
        let mut reader = Builder::new().read(&[0, 0]).build();
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::TruncatedRead(_)));
    }

    #[tokio::test]
    async fn bounded_read_rejects_oversized_length() {
        let mut reader = Builder::new().read(&[0, 0, 1, 0]).build();
        let err = read_frame_bounded(&mut reader, 64).await.unwrap_err();
        assert!(matches!(err, FrameError::ExceedsLimit { len: 256, limit: 64 }));
    }
}
