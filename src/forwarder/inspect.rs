//! Response inspection: bounded decompression of a body prefix and
//! detection of upstream auth-failure envelopes.

use std::borrow::Cow;
use std::io::Read;

use flate2::read::{GzDecoder, ZlibDecoder};

/// The MIME type rewritten for clients that cannot render it
pub const WMS_CONTENT_TYPE: &str = "application/vnd.ogc.wms_xml";

/// Replacement applied to `Content-Type` values carrying the WMS XML type
pub fn rewrite_content_type(value: &str) -> String {
    value.replace(WMS_CONTENT_TYPE, "text/xml")
}

/// Decompress at most `max_out` bytes of a response prefix. Supports
/// `gzip` and `deflate`; unknown or absent encodings pass the input
/// through untouched. Decoder errors yield whatever was recovered so far,
/// which is enough for envelope detection.
pub fn decompress_prefix<'a>(
    encoding: Option<&str>,
    input: &'a [u8],
    max_out: usize,
) -> Cow<'a, [u8]> {
    let normalized = encoding
        .map(|e| {
            e.split(',')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase()
        })
        .unwrap_or_default();

    match normalized.as_str() {
        "gzip" | "x-gzip" => Cow::Owned(drain_bounded(GzDecoder::new(input), max_out)),
        "deflate" => Cow::Owned(drain_bounded(ZlibDecoder::new(input), max_out)),
        _ => Cow::Borrowed(input),
    }
}

fn drain_bounded<R: Read>(mut reader: R, max_out: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(max_out.min(8192));
    let mut buf = [0u8; 8192];
    while out.len() < max_out {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let take = n.min(max_out - out.len());
                out.extend_from_slice(&buf[..take]);
                if take < n {
                    break;
                }
            }
        }
    }
    out
}

/// Extract the numeric code from an error envelope of the form
/// `{"error":{"code":N,...}}`. A full JSON parse is attempted first; a
/// positional scan covers truncated prefixes of larger bodies.
pub fn error_envelope_code(body: &[u8]) -> Option<u16> {
    let text = String::from_utf8_lossy(body);

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
        return value["error"]["code"]
            .as_u64()
            .and_then(|code| u16::try_from(code).ok());
    }

    // Truncated or mixed payload: locate "error" then the first "code"
    // after it.
    let error_idx = text.find("\"error\"")?;
    let rest = &text[error_idx..];
    let code_idx = rest.find("\"code\"")?;
    let rest = rest[code_idx + "\"code\"".len()..].trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
