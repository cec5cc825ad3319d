//! Request header validation.
//!
//! Splits a decoded field section into pseudo-headers and regular fields,
//! enforcing the RFC 9114 field-validity rules. Malformed messages are stream
//! errors of type `H3_MESSAGE_ERROR`.

use http::Method;

use h3_codec::Code;

use crate::qpack::Field;
use crate::StreamError;

/// Request pseudo-headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pseudo {
    pub method: Method,
    pub scheme: String,
    pub authority: Option<String>,
    pub path: Option<String>,
}

/// Fields that carry connection-level semantics and are forbidden in HTTP/3.
///
/// <https://www.rfc-editor.org/rfc/rfc9114#section-4.2>
const FORBIDDEN: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

fn message_error(reason: &'static str) -> StreamError {
    StreamError {
        code: Code::H3_MESSAGE_ERROR,
        reason: reason.into(),
    }
}

/// Validates a request field section.
///
/// Returns the pseudo-headers, the regular fields in arrival order, and the
/// declared `content-length` if one is present.
pub fn parse_request(
    fields: Vec<Field>,
) -> Result<(Pseudo, Vec<Field>, Option<u64>), StreamError> {
    let mut method = None;
    let mut scheme = None;
    let mut authority = None;
    let mut path = None;
    let mut regular: Vec<Field> = Vec::with_capacity(fields.len());
    let mut content_length = None;
    let mut seen_regular = false;

    for field in fields {
        validate_name(&field.name)?;

        if field.name.starts_with(b":") {
            if seen_regular {
                return Err(message_error("pseudo-header after regular field"));
            }
            let slot = match &field.name[..] {
                b":method" => &mut method,
                b":scheme" => &mut scheme,
                b":authority" => &mut authority,
                b":path" => &mut path,
                _ => return Err(message_error("unknown pseudo-header")),
            };
            if slot.is_some() {
                return Err(message_error("duplicate pseudo-header"));
            }
            *slot = Some(into_string(&field)?);
            continue;
        }

        seen_regular = true;
        if FORBIDDEN.iter().any(|f| f.as_bytes() == &field.name[..]) {
            return Err(message_error("connection-specific field"));
        }
        if field.name[..] == b"content-length"[..] {
            let value = std::str::from_utf8(&field.value)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or_else(|| message_error("malformed content-length"))?;
            match content_length {
                None => content_length = Some(value),
                Some(prev) if prev == value => (),
                Some(_) => return Err(message_error("conflicting content-length")),
            }
        }
        regular.push(field);
    }

    let method = method.ok_or_else(|| message_error("missing :method"))?;
    let method =
        Method::from_bytes(method.as_bytes()).map_err(|_| message_error("invalid :method"))?;
    let scheme = scheme.ok_or_else(|| message_error("missing :scheme"))?;

    Ok((
        Pseudo {
            method,
            scheme,
            authority,
            path,
        },
        regular,
        content_length,
    ))
}

/// Validates a trailer field section: regular, valid fields only.
pub fn parse_trailers(fields: Vec<Field>) -> Result<Vec<Field>, StreamError> {
    for field in &fields {
        validate_name(&field.name)?;
        if field.name.starts_with(b":") {
            return Err(message_error("pseudo-header in trailers"));
        }
    }
    Ok(fields)
}

fn validate_name(name: &[u8]) -> Result<(), StreamError> {
    if name.is_empty() {
        return Err(message_error("empty field name"));
    }
    //= https://www.rfc-editor.org/rfc/rfc9114#section-4.2
    //# Characters in field names MUST be converted to lowercase prior to
    //# their encoding.
    if name.iter().any(|b| b.is_ascii_uppercase()) {
        return Err(message_error("uppercase field name"));
    }
    Ok(())
}

fn into_string(field: &Field) -> Result<String, StreamError> {
    String::from_utf8(field.value.to_vec()).map_err(|_| message_error("invalid field value"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, value: &str) -> Field {
        Field::new(name.as_bytes().to_vec(), value.as_bytes().to_vec())
    }

    fn get_request() -> Vec<Field> {
        vec![
            field(":method", "GET"),
            field(":scheme", "https"),
            field(":authority", "example.com"),
            field(":path", "/"),
        ]
    }

    #[test]
    fn valid_request() {
        let (pseudo, regular, len) = parse_request(get_request()).unwrap();
        assert_eq!(pseudo.method, Method::GET);
        assert_eq!(pseudo.scheme, "https");
        assert_eq!(pseudo.authority.as_deref(), Some("example.com"));
        assert_eq!(pseudo.path.as_deref(), Some("/"));
        assert!(regular.is_empty());
        assert_eq!(len, None);
    }

    #[test]
    fn content_length_parsed() {
        let mut fields = get_request();
        fields.push(field("content-length", "42"));
        let (_, _, len) = parse_request(fields).unwrap();
        assert_eq!(len, Some(42));
    }

    #[test]
    fn conflicting_content_length() {
        let mut fields = get_request();
        fields.push(field("content-length", "42"));
        fields.push(field("content-length", "43"));
        let err = parse_request(fields).unwrap_err();
        assert_eq!(err.code, Code::H3_MESSAGE_ERROR);
    }

    #[test]
    fn missing_method() {
        let err = parse_request(vec![field(":scheme", "https")]).unwrap_err();
        assert_eq!(err.code, Code::H3_MESSAGE_ERROR);
    }

    #[test]
    fn pseudo_after_regular() {
        let err = parse_request(vec![
            field(":method", "GET"),
            field(":scheme", "https"),
            field("accept", "*/*"),
            field(":path", "/"),
        ])
        .unwrap_err();
        assert_eq!(err.code, Code::H3_MESSAGE_ERROR);
    }

    #[test]
    fn duplicate_pseudo() {
        let mut fields = get_request();
        fields.push(field(":method", "POST"));
        assert!(parse_request(fields).is_err());
    }

    #[test]
    fn uppercase_name_rejected() {
        let mut fields = get_request();
        fields.push(field("X-Custom", "1"));
        assert!(parse_request(fields).is_err());
    }

    #[test]
    fn connection_header_rejected() {
        let mut fields = get_request();
        fields.push(field("connection", "close"));
        assert!(parse_request(fields).is_err());
    }

    #[test]
    fn trailers_reject_pseudo() {
        assert!(parse_trailers(vec![field(":status", "200")]).is_err());
        assert!(parse_trailers(vec![field("grpc-status", "0")]).is_ok());
    }
}
