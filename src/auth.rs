//! The EXTERNAL authentication handshake.
//!
//! Authentication is line-oriented ASCII over the raw stream, strictly in
//! order: a single NUL byte, `AUTH EXTERNAL <hex>` where `<hex>` is the
//! ASCII of the decimal uid encoded as hex digits, one `OK <guid>` response,
//! then `BEGIN`. From that point the stream carries binary frames.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::error::{ErrorKind, Result};

/// Timeout applied to each handshake read.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a handshake line; a server that exceeds it is not speaking
/// the protocol.
const MAX_LINE: usize = 4096;

/// Drive the handshake over `stream` and return the server GUID.
pub(crate) async fn authenticate(stream: &mut UnixStream, uid: u32) -> Result<String> {
    stream.write_all(b"\0").await?;

    let mut auth = Vec::with_capacity(32);
    auth.extend_from_slice(b"AUTH EXTERNAL ");
    auth.extend_from_slice(uid_hex(uid).as_bytes());
    auth.extend_from_slice(b"\r\n");
    stream.write_all(&auth).await?;

    let line = read_line(stream).await?;
    let guid = parse_ok(&line)?;

    stream.write_all(b"BEGIN\r\n").await?;
    Ok(guid)
}

/// Encode a uid the way EXTERNAL expects it: the decimal digits of the uid,
/// each as two lowercase hex digits of its ASCII code.
///
/// Uid `1000` encodes as `31303030`.
pub(crate) fn uid_hex(uid: u32) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    let decimal = uid.to_string();
    let mut out = String::with_capacity(decimal.len() * 2);

    for b in decimal.bytes() {
        out.push(HEX[usize::from(b >> 4)] as char);
        out.push(HEX[usize::from(b & 0xf)] as char);
    }

    out
}

/// Read one CRLF-terminated line.
///
/// Reads byte-at-a-time so nothing past the line terminator is consumed; the
/// bytes after `BEGIN` belong to the binary protocol.
async fn read_line(stream: &mut UnixStream) -> Result<Vec<u8>> {
    let mut line = Vec::new();

    loop {
        let mut byte = [0u8; 1];

        let n = match timeout(HANDSHAKE_TIMEOUT, stream.read(&mut byte)).await {
            Ok(n) => n?,
            Err(..) => return Err(ErrorKind::AuthTimedOut.into()),
        };

        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        if byte[0] == b'\n' {
            return Ok(line);
        }

        line.push(byte[0]);

        if line.len() > MAX_LINE {
            return Err(ErrorKind::InvalidAuth.into());
        }
    }
}

/// Parse the `OK <guid>` response; anything else fails the handshake.
fn parse_ok(line: &[u8]) -> Result<String> {
    let line = crate::utils::trim_end(line);

    let Some((command, guid)) = crate::utils::split_once(line, b' ') else {
        return Err(ErrorKind::InvalidAuth.into());
    };

    if command != b"OK" || guid.is_empty() || !guid.iter().all(u8::is_ascii_hexdigit) {
        return Err(ErrorKind::InvalidAuth.into());
    }

    Ok(std::str::from_utf8(guid)?.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_hex() {
        assert_eq!(uid_hex(1000), "31303030");
        assert_eq!(uid_hex(0), "30");
        assert_eq!(uid_hex(u32::MAX), "34323934393637323935");
    }

    #[test]
    fn test_parse_ok() {
        assert_eq!(
            parse_ok(b"OK 1f0a86d2f9d1b23c4a9d1e2f00112233\r").unwrap(),
            "1f0a86d2f9d1b23c4a9d1e2f00112233"
        );

        assert!(parse_ok(b"REJECTED EXTERNAL").is_err());
        assert!(parse_ok(b"OK").is_err());
        assert!(parse_ok(b"OK not-hex!").is_err());
        assert!(parse_ok(b"OK ").is_err());
    }
}
