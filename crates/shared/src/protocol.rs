use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Terminator that closes the host -> guest strategy payload stream.
///
/// The payload is an opaque byte string; neither side parses it, they only
/// scan for this literal.
pub const PAYLOAD_TERMINATOR: &[u8] = b"__END__";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("length header truncated")]
    HeaderTruncated,
    #[error("payload truncated")]
    PayloadTruncated,
}

/// Send a length-prefixed frame: `[4-byte big-endian length][bytes]`.
///
/// Warning: private wire format, do not write raw bytes without going
/// through this function on either end.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    data: &[u8],
) -> Result<(), ProtocolError> {
    stream.write_u32(data.len() as u32).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// Receive a length-prefixed frame written by [`write_frame`].
///
/// Distinguishes a short header from a short body so callers can report
/// `ProtocolError::HeaderTruncated` vs `PayloadTruncated` per the wire spec.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut header = [0u8; 4];
    read_exact_or(stream, &mut header, ProtocolError::HeaderTruncated).await?;
    let len = u32::from_be_bytes(header) as usize;

    let mut buf = vec![0u8; len];
    read_exact_or(stream, &mut buf, ProtocolError::PayloadTruncated).await?;
    Ok(buf)
}

async fn read_exact_or<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut [u8],
    short_read: ProtocolError,
) -> Result<(), ProtocolError> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(short_read),
        Err(e) => Err(e.into()),
    }
}

/// Write `data` followed by [`PAYLOAD_TERMINATOR`], then shut down the write
/// half (or just stop writing, if the stream doesn't support half-close).
pub async fn write_terminated<W: AsyncWrite + Unpin>(
    stream: &mut W,
    data: &[u8],
) -> Result<(), ProtocolError> {
    stream.write_all(data).await?;
    stream.write_all(PAYLOAD_TERMINATOR).await?;
    stream.flush().await?;
    let _ = stream.shutdown().await;
    Ok(())
}

/// Read chunks from `stream` until [`PAYLOAD_TERMINATOR`] is observed,
/// returning the bytes with the terminator stripped. Returns `Ok(None)` if
/// the peer closed the connection before sending any bytes.
pub async fn read_until_terminated<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subslice(&buf, PAYLOAD_TERMINATOR) {
            buf.truncate(pos);
            return Ok(Some(buf));
        }
    }

    if buf.is_empty() { Ok(None) } else { Ok(Some(buf)) }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = duplex(4096);
        let payload = br#"{"status":"success","report":{}}"#;

        write_frame(&mut a, payload).await.unwrap();
        let got = read_frame(&mut b).await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn frame_header_truncated() {
        let (mut a, mut b) = duplex(4096);
        a.write_all(&[0u8, 1]).await.unwrap();
        drop(a);

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::HeaderTruncated));
    }

    #[tokio::test]
    async fn frame_payload_truncated() {
        let (mut a, mut b) = duplex(4096);
        a.write_all(&10_000_000u32.to_be_bytes()).await.unwrap();
        a.write_all(&[0u8; 100]).await.unwrap();
        drop(a);

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTruncated));
    }

    #[tokio::test]
    async fn terminator_round_trip() {
        let (mut a, mut b) = duplex(8192);
        let code = b"class Strategy:\n    def step(self, h, p):\n        return 0\n".to_vec();

        write_terminated(&mut a, &code).await.unwrap();
        let got = read_until_terminated(&mut b).await.unwrap();
        assert_eq!(got, Some(code));
    }

    #[tokio::test]
    async fn terminator_empty_stream_yields_none() {
        let (a, mut b) = duplex(64);
        drop(a);
        let got = read_until_terminated(&mut b).await.unwrap();
        assert_eq!(got, None);
    }

    proptest::proptest! {
        // For any byte string, encoding as `[len32][bytes]` and decoding
        // recovers it exactly.
        #[test]
        fn frame_round_trip_is_lossless(body in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..8192)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let got = runtime.block_on(async {
                let (mut a, mut b) = duplex(body.len() + 4096);
                write_frame(&mut a, &body).await.unwrap();
                read_frame(&mut b).await.unwrap()
            });
            prop_assert_eq!(got, body);
        }

        // A header claiming more bytes than the peer ever sends must always
        // surface as a deterministic `PayloadTruncated`, never a hang or a
        // silently short read.
        #[test]
        fn frame_header_overclaiming_length_truncates_deterministically(
            claimed in 101u32..10_000_000u32,
            actual in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..100),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let err = runtime.block_on(async {
                let (mut a, mut b) = duplex(actual.len() + 16);
                a.write_all(&claimed.to_be_bytes()).await.unwrap();
                a.write_all(&actual).await.unwrap();
                drop(a);
                read_frame(&mut b).await.unwrap_err()
            });
            prop_assert!(matches!(err, ProtocolError::PayloadTruncated));
        }
    }
}
