use serde_json::Value;

use crate::error::DecodeError;

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// One part of a `multipart/mixed` body.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MultipartPart {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl MultipartPart {
    /// Looks up a part header by name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _value)| key.eq_ignore_ascii_case(name))
            .map(|(_key, value)| value.as_str())
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    fn is_json(&self) -> bool {
        self.header("content-type")
            .is_some_and(|value| value.to_ascii_lowercase().starts_with("application/json"))
    }
}

/// A readImageBlock reply split into metadata and payload.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockBody {
    /// Decoded JSON part, if the reply had one.
    pub metadata: Option<Value>,
    /// Binary image payload.
    pub payload: Vec<u8>,
}

/// Extracts the `boundary` parameter from a `multipart/*` content type.
#[must_use]
pub fn boundary(content_type: &str) -> Option<&str> {
    let mut params = content_type.split(';');
    let media_type = params.next()?.trim();
    if !media_type.to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }
    params
        .filter_map(|param| param.split_once('='))
        .find(|(name, _value)| name.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_name, value)| value.trim().trim_matches('"'))
        .filter(|value| !value.is_empty())
}

/// Splits a multipart body into its parts.
///
/// Part bodies are sized by `Content-Length` when present, otherwise they
/// run to the next delimiter.
pub fn parse(body: &[u8], boundary: &str) -> Result<Vec<MultipartPart>, DecodeError> {
    let delimiter = [b"--".as_slice(), boundary.as_bytes()].concat();
    let mut cursor = find(body, &delimiter, 0).ok_or(DecodeError::Multipart {
        reason: "opening boundary not found",
    })?;
    let mut parts = Vec::new();

    loop {
        cursor += delimiter.len();
        if body[cursor..].starts_with(b"--") {
            break;
        }
        if !body[cursor..].starts_with(CRLF) {
            return Err(DecodeError::Multipart {
                reason: "boundary not followed by a line break",
            });
        }
        cursor += CRLF.len();

        let header_end = find(body, HEADER_END, cursor).ok_or(DecodeError::Multipart {
            reason: "part headers are not terminated",
        })?;
        let headers = parse_headers(&body[cursor..header_end])?;
        cursor = header_end + HEADER_END.len();

        let content_length = headers
            .iter()
            .find(|(name, _value)| name.eq_ignore_ascii_case("content-length"))
            .map(|(_name, value)| value.parse::<usize>())
            .transpose()
            .map_err(|_invalid| DecodeError::Multipart {
                reason: "invalid part Content-Length",
            })?;

        let body_end = match content_length {
            Some(length) => {
                let end = cursor.checked_add(length).filter(|end| *end <= body.len());
                end.ok_or(DecodeError::Multipart {
                    reason: "part is shorter than its Content-Length",
                })?
            }
            None => find(body, &[CRLF, delimiter.as_slice()].concat(), cursor).ok_or(
                DecodeError::Multipart {
                    reason: "closing boundary not found",
                },
            )?,
        };
        parts.push(MultipartPart {
            headers,
            body: body[cursor..body_end].to_vec(),
        });

        cursor = find(body, &delimiter, body_end).ok_or(DecodeError::Multipart {
            reason: "closing boundary not found",
        })?;
    }

    Ok(parts)
}

/// Decodes a readImageBlock reply into metadata and image payload.
pub fn decode_block(content_type: &str, body: &[u8]) -> Result<BlockBody, DecodeError> {
    let boundary = boundary(content_type).ok_or(DecodeError::Multipart {
        reason: "content type has no boundary",
    })?;
    let parts = parse(body, boundary)?;

    let metadata = parts
        .iter()
        .find(|part| part.is_json())
        .map(|part| serde_json::from_slice(part.body()))
        .transpose()?;
    let payload = parts
        .into_iter()
        .find(|part| !part.is_json())
        .ok_or(DecodeError::Multipart {
            reason: "no image part",
        })?
        .body;

    Ok(BlockBody { metadata, payload })
}

/// Encodes a JSON part and an image part as `multipart/mixed`.
#[must_use]
pub fn encode_block(boundary: &str, metadata: &Value, payload: &[u8], payload_type: &str) -> Vec<u8> {
    let json = metadata.to_string();
    let mut out = Vec::with_capacity(json.len() + payload.len() + 256);
    for (content_type, part) in [
        ("application/json; charset=UTF-8", json.as_bytes()),
        (payload_type, payload),
    ] {
        out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        out.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", part.len()).as_bytes());
        out.extend_from_slice(part);
        out.extend_from_slice(CRLF);
    }
    out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    out
}

fn parse_headers(block: &[u8]) -> Result<Vec<(String, String)>, DecodeError> {
    let text = std::str::from_utf8(block).map_err(|_invalid| DecodeError::Multipart {
        reason: "part headers are not UTF-8",
    })?;
    text.split("\r\n")
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .ok_or(DecodeError::Multipart {
                    reason: "malformed part header",
                })
        })
        .collect()
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|position| position + from)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case("multipart/mixed; boundary=abc", Some("abc"))]
    #[case("multipart/mixed; charset=x; boundary=\"q r\"", Some("q r"))]
    #[case("Multipart/Mixed;BOUNDARY=up", Some("up"))]
    #[case("application/json", None)]
    #[case("multipart/mixed", None)]
    fn boundary_reads_parameter(#[case] content_type: &str, #[case] expected: Option<&str>) {
        assert_eq!(expected, boundary(content_type));
    }

    #[test]
    fn decode_splits_metadata_and_payload() {
        let metadata = json!({"results": {"success": true}});
        let payload = b"%PDF-\r\n--boundary-lookalike\r\nbinary".to_vec();
        let body = encode_block("abc123", &metadata, &payload, "application/pdf");

        let decoded = decode_block("multipart/mixed; boundary=abc123", &body).expect("decodes");

        assert_eq!(Some(metadata), decoded.metadata);
        assert_eq!(payload, decoded.payload);
    }

    #[test]
    fn parts_without_length_run_to_next_delimiter() {
        let body = b"--b\r\nContent-Type: application/pdf\r\n\r\nPDFDATA\r\n--b--\r\n";

        let parts = parse(body, "b").expect("parses");

        assert_eq!(1, parts.len());
        assert_eq!(b"PDFDATA".as_slice(), parts[0].body());
        assert_eq!(Some("application/pdf"), parts[0].header("content-type"));
    }

    #[test]
    fn truncated_part_is_rejected() {
        let body = b"--b\r\nContent-Length: 50\r\n\r\nshort\r\n--b--\r\n";

        assert_matches!(
            parse(body, "b"),
            Err(DecodeError::Multipart { reason: "part is shorter than its Content-Length" })
        );
    }

    #[test]
    fn reply_without_image_part_is_rejected() {
        let body = b"--b\r\nContent-Type: application/json\r\n\r\n{}\r\n--b--\r\n";

        assert_matches!(
            decode_block("multipart/mixed; boundary=b", body),
            Err(DecodeError::Multipart { reason: "no image part" })
        );
    }
}
