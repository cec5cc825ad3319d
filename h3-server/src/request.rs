//! Turns decoded request headers into a [`Request`] value.

use std::net::SocketAddr;

use http::header::Entry;
use http::uri::Authority;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};

use h3_codec::Code;
use h3_machine::{RequestHeaders, StreamError, StreamId};

use crate::transport::ConnectionHandle;

/// An assembled HTTP/3 request, as handed to [`Handler::init`].
///
/// [`Handler::init`]: crate::handler::Handler::init
#[derive(Debug)]
pub struct Request {
    /// Connection-scoped stream identifier.
    pub stream_id: StreamId,
    /// Address of the owning connection task.
    pub conn: ConnectionHandle,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub method: Method,
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub query: Option<String>,
    pub version: Version,
    /// Request headers, values of repeated names merged.
    pub headers: HeaderMap,
    /// Whether body data will follow.
    pub has_body: bool,
    /// The declared `content-length`, if any.
    pub body_length: Option<u64>,
}

fn message_error(reason: &'static str) -> StreamError {
    StreamError {
        code: Code::H3_MESSAGE_ERROR,
        reason: reason.into(),
    }
}

pub(crate) fn build(
    id: StreamId,
    conn: ConnectionHandle,
    peer: SocketAddr,
    local: SocketAddr,
    headers: RequestHeaders,
) -> Result<Request, StreamError> {
    let RequestHeaders {
        fin,
        pseudo,
        fields,
        body_len,
        ..
    } = headers;

    //= https://www.rfc-editor.org/rfc/rfc9114#section-4.3.1
    //# If the :scheme pseudo-header field identifies a scheme that has a
    //# mandatory authority component (including "http" and "https"), the
    //# request MUST contain either an :authority pseudo-header field or a
    //# Host header field.
    let authority = match &pseudo.authority {
        Some(authority) => authority.clone(),
        None => fields
            .iter()
            .find(|f| f.name == &b"host"[..])
            .and_then(|f| std::str::from_utf8(&f.value).ok())
            .map(str::to_owned)
            .ok_or_else(|| message_error("missing authority"))?,
    };

    let authority: Authority = authority
        .parse()
        .map_err(|_| message_error("invalid authority"))?;
    let host = authority.host().to_owned();
    let port = match authority.port_u16() {
        Some(port) => Some(port),
        None => match pseudo.scheme.as_str() {
            "http" => Some(80),
            "https" => Some(443),
            _ => None,
        },
    };

    let full_path = pseudo.path.as_deref().unwrap_or("");
    if full_path.is_empty() {
        return Err(message_error("empty path"));
    }
    let (path, query) = match full_path.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (full_path.to_owned(), None),
    };
    if !(path.starts_with('/') || path == "*") {
        return Err(message_error("invalid path"));
    }

    let mut header_map = HeaderMap::with_capacity(fields.len());
    for field in &fields {
        let name =
            HeaderName::from_bytes(&field.name).map_err(|_| message_error("invalid field name"))?;
        let value = HeaderValue::from_bytes(&field.value)
            .map_err(|_| message_error("invalid field value"))?;
        match header_map.entry(name) {
            Entry::Vacant(entry) => {
                entry.insert(value);
            }
            Entry::Occupied(mut entry) => {
                //= https://www.rfc-editor.org/rfc/rfc9110#section-5.2
                //# A recipient MAY combine multiple field lines within a field
                //# section that have the same field name into one field line.
                let separator: &[u8] = if entry.key() == &http::header::COOKIE {
                    b"; "
                } else {
                    b", "
                };
                let mut merged =
                    Vec::with_capacity(entry.get().len() + separator.len() + value.len());
                merged.extend_from_slice(entry.get().as_bytes());
                merged.extend_from_slice(separator);
                merged.extend_from_slice(value.as_bytes());
                entry.insert(
                    HeaderValue::from_bytes(&merged)
                        .map_err(|_| message_error("invalid field value"))?,
                );
            }
        }
    }

    Ok(Request {
        stream_id: id,
        conn,
        peer,
        local,
        method: pseudo.method,
        scheme: pseudo.scheme,
        host,
        port,
        path,
        query,
        version: Version::HTTP_3,
        headers: header_map,
        has_body: !fin,
        body_length: body_len,
    })
}
