//! Length-prefixed framing for attach streaming.
//!
//! A frame is one type byte, a big-endian u32 payload length, and the
//! payload. `DATA` carries keystrokes host→agent and terminal bytes
//! agent→host; `RESIZE` carries BE u16 cols then BE u16 rows; `DETACH` has
//! no payload and ends the session.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Terminal bytes in either direction.
pub const FRAME_DATA: u8 = 1;
/// 4-byte payload: BE u16 cols, BE u16 rows.
pub const FRAME_RESIZE: u8 = 2;
/// Host→server, no payload; the server closes the attach session.
pub const FRAME_DETACH: u8 = 3;

/// Upper bound on a single frame payload. Anything larger is a protocol
/// error, not a legitimate burst of terminal output.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Write one frame.
pub async fn write_frame<W>(w: &mut W, frame_type: u8, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame payload too large: {} bytes", payload.len()),
        ));
    }
    let mut header = [0u8; 5];
    header[0] = frame_type;
    header[1..5].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    w.write_all(&header).await?;
    if !payload.is_empty() {
        w.write_all(payload).await?;
    }
    w.flush().await
}

/// Read one frame, returning its type and payload.
pub async fn read_frame<R>(r: &mut R) -> io::Result<(u8, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    r.read_exact(&mut header).await?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame payload too large: {len} bytes"),
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok((header[0], payload))
}

/// Encode a `RESIZE` payload.
pub fn resize_payload(cols: u16, rows: u16) -> [u8; 4] {
    let mut payload = [0u8; 4];
    payload[0..2].copy_from_slice(&cols.to_be_bytes());
    payload[2..4].copy_from_slice(&rows.to_be_bytes());
    payload
}

/// Decode a `RESIZE` payload; `None` if malformed.
pub fn parse_resize(payload: &[u8]) -> Option<(u16, u16)> {
    if payload.len() != 4 {
        return None;
    }
    let cols = u16::from_be_bytes([payload[0], payload[1]]);
    let rows = u16::from_be_bytes([payload[2], payload[3]]);
    Some((cols, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let cases: Vec<(u8, Vec<u8>)> = vec![
            (FRAME_DATA, b"hello world".to_vec()),
            (FRAME_RESIZE, vec![0, 80, 0, 24]),
            (FRAME_DETACH, vec![]),
            (FRAME_DATA, vec![]),
        ];

        for (frame_type, payload) in cases {
            let mut buf = Vec::new();
            write_frame(&mut buf, frame_type, &payload).await.unwrap();

            let mut reader = buf.as_slice();
            let (ft, got) = read_frame(&mut reader).await.unwrap();
            assert_eq!(ft, frame_type);
            assert_eq!(got, payload);
        }
    }

    #[tokio::test]
    async fn two_frames_read_in_order() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FRAME_DATA, b"first").await.unwrap();
        write_frame(&mut buf, FRAME_DATA, b"second").await.unwrap();

        let mut reader = buf.as_slice();
        let (_, p1) = read_frame(&mut reader).await.unwrap();
        assert_eq!(p1, b"first");
        let (_, p2) = read_frame(&mut reader).await.unwrap();
        assert_eq!(p2, b"second");
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let mut buf = Vec::new();
        // Header claiming a 2 MiB payload.
        buf.push(FRAME_DATA);
        buf.extend_from_slice(&(2u32 * 1024 * 1024).to_be_bytes());
        let mut reader = buf.as_slice();
        assert!(read_frame(&mut reader).await.is_err());

        let big = vec![0u8; MAX_FRAME_LEN + 1];
        let mut out = Vec::new();
        assert!(write_frame(&mut out, FRAME_DATA, &big).await.is_err());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FRAME_DATA, b"payload").await.unwrap();
        buf.truncate(buf.len() - 3);
        let mut reader = buf.as_slice();
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[test]
    fn resize_payload_round_trip() {
        let payload = resize_payload(120, 40);
        assert_eq!(parse_resize(&payload), Some((120, 40)));
        assert_eq!(parse_resize(&payload[..3]), None);
        assert_eq!(parse_resize(&[]), None);
    }
}
