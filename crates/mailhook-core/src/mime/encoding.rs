//! Content-Transfer-Encoding helpers

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use super::MimeError;

const LINE_LIMIT: usize = 76;

/// Decode a body according to its transfer encoding.
///
/// `7bit`, `8bit`, `binary` and unknown encodings are returned unchanged.
pub fn decode_transfer(encoding: &str, raw: &[u8]) -> Result<Vec<u8>, MimeError> {
    match encoding.to_ascii_lowercase().as_str() {
        "base64" => {
            let compact: Vec<u8> = raw
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            BASE64.decode(compact).map_err(|e| MimeError::Decode {
                encoding: "base64".to_string(),
                message: e.to_string(),
            })
        }
        "quoted-printable" => Ok(decode_quoted_printable(raw)),
        _ => Ok(raw.to_vec()),
    }
}

/// Encode a body for the given transfer encoding, using CRLF line breaks
pub fn encode_transfer(encoding: &str, data: &[u8]) -> Vec<u8> {
    match encoding.to_ascii_lowercase().as_str() {
        "base64" => {
            let encoded = BASE64.encode(data);
            encoded
                .as_bytes()
                .chunks(LINE_LIMIT)
                .collect::<Vec<_>>()
                .join(&b"\r\n"[..])
        }
        "quoted-printable" => encode_quoted_printable(data),
        _ => data.to_vec(),
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn decode_quoted_printable(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;

    while i < raw.len() {
        let b = raw[i];
        if b != b'=' {
            out.push(b);
            i += 1;
            continue;
        }

        // Soft line break
        if raw.get(i + 1) == Some(&b'\r') && raw.get(i + 2) == Some(&b'\n') {
            i += 3;
            continue;
        }
        if raw.get(i + 1) == Some(&b'\n') {
            i += 2;
            continue;
        }

        match (
            raw.get(i + 1).copied().and_then(hex_value),
            raw.get(i + 2).copied().and_then(hex_value),
        ) {
            (Some(hi), Some(lo)) => {
                out.push(hi << 4 | lo);
                i += 3;
            }
            _ => {
                // Malformed escape, keep it literally
                out.push(b);
                i += 1;
            }
        }
    }

    out
}

fn encode_quoted_printable(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    let mut line_len = 0;

    let mut i = 0;
    while i < data.len() {
        let b = data[i];

        if b == b'\r' && data.get(i + 1) == Some(&b'\n') {
            out.extend_from_slice(b"\r\n");
            line_len = 0;
            i += 2;
            continue;
        }
        if b == b'\n' {
            out.extend_from_slice(b"\r\n");
            line_len = 0;
            i += 1;
            continue;
        }

        // Trailing whitespace before a line break must be escaped
        let before_break = matches!(data.get(i + 1), None | Some(b'\r') | Some(b'\n'));
        let literal = match b {
            b' ' | b'\t' => !before_break,
            b'=' => false,
            33..=126 => true,
            _ => false,
        };

        let width = if literal { 1 } else { 3 };
        if line_len + width > LINE_LIMIT - 1 {
            out.extend_from_slice(b"=\r\n");
            line_len = 0;
        }

        if literal {
            out.push(b);
        } else {
            out.extend_from_slice(format!("={:02X}", b).as_bytes());
        }
        line_len += width;
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_base64_decode_with_line_breaks() {
        let raw = b"SGVsbG8g\r\nd29ybGQ=";
        assert_eq!(decode_transfer("BASE64", raw).unwrap(), b"Hello world".to_vec());
    }

    #[test]
    fn test_base64_decode_error() {
        let err = decode_transfer("base64", b"@@@").unwrap_err();
        assert!(matches!(err, MimeError::Decode { .. }));
    }

    #[test]
    fn test_base64_encode_wraps_lines() {
        let data = vec![b'a'; 120];
        let encoded = encode_transfer("base64", &data);
        let text = String::from_utf8(encoded.clone()).unwrap();
        assert!(text.lines().all(|l| l.len() <= 76));
        assert_eq!(decode_transfer("base64", &encoded).unwrap(), data);
    }

    #[test]
    fn test_quoted_printable_decode() {
        let raw = b"caf=C3=A9 =\r\nau lait=3D";
        assert_eq!(
            decode_transfer("quoted-printable", raw).unwrap(),
            "café au lait=".as_bytes().to_vec()
        );
    }

    #[test]
    fn test_quoted_printable_encode() {
        let encoded = encode_transfer("quoted-printable", "naïve = ok \r\nnext".as_bytes());
        assert_eq!(encoded, b"na=C3=AFve =3D ok=20\r\nnext".to_vec());
        assert_eq!(
            decode_transfer("quoted-printable", &encoded).unwrap(),
            "naïve = ok \r\nnext".as_bytes().to_vec()
        );
    }

    #[test]
    fn test_quoted_printable_soft_breaks() {
        let data = vec![b'x'; 200];
        let encoded = encode_transfer("quoted-printable", &data);
        let text = String::from_utf8(encoded.clone()).unwrap();
        assert!(text.split("\r\n").all(|l| l.len() <= 76));
        assert_eq!(decode_transfer("quoted-printable", &encoded).unwrap(), data);
    }

    #[test]
    fn test_identity_encodings() {
        assert_eq!(decode_transfer("7bit", b"plain").unwrap(), b"plain".to_vec());
        assert_eq!(encode_transfer("8bit", b"plain"), b"plain".to_vec());
    }
}
