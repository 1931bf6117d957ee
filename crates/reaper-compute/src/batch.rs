//! `multipart/mixed` framing for the Compute batch endpoint.
//!
//! A batch request carries one `application/http` part per inner call,
//! tagged with a `Content-ID`. The response carries one part per inner
//! call, tagged `response-<id>`, each holding a complete HTTP response.

use std::fmt::Write;

/// Boundary used for outgoing batch bodies.
pub(crate) const BOUNDARY: &str = "reaper_delete_batch";

/// One inner response of a batch.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PartResponse {
    pub content_id: String,
    pub status: u16,
    pub body: String,
}

/// Encode inner `DELETE` calls as `(content_id, path)` pairs.
pub(crate) fn encode_deletes<'a>(parts: impl IntoIterator<Item = (&'a str, String)>) -> String {
    let mut body = String::new();
    for (id, path) in parts {
        let _ = write!(
            body,
            "--{BOUNDARY}\r\n\
             Content-Type: application/http\r\n\
             Content-ID: <{id}>\r\n\
             \r\n\
             DELETE {path} HTTP/1.1\r\n\
             \r\n"
        );
    }
    let _ = write!(body, "--{BOUNDARY}--\r\n");
    body
}

/// Boundary parameter of a `multipart/mixed` content type.
pub(crate) fn boundary_of(content_type: &str) -> Option<String> {
    let (mime, params) = content_type.split_once(';')?;
    if !mime.trim().eq_ignore_ascii_case("multipart/mixed") {
        return None;
    }
    params
        .split(';')
        .map(str::trim)
        .find_map(|p| p.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
}

/// Split a batch response body into its inner responses. Parts that
/// cannot be read are left out.
pub(crate) fn decode(body: &str, boundary: &str) -> Vec<PartResponse> {
    let delimiter = format!("--{boundary}");
    body.split(delimiter.as_str()).filter_map(parse_part).collect()
}

fn parse_part(raw: &str) -> Option<PartResponse> {
    let raw = raw.trim_start_matches(['\r', '\n']);
    if raw.is_empty() || raw.starts_with("--") {
        return None;
    }

    let (headers, http) = split_head(raw)?;
    let id = header(headers, "content-id")?.trim_matches(['<', '>']);
    let content_id = id.strip_prefix("response-").unwrap_or(id).to_string();

    let (head, body) = split_head(http).unwrap_or((http, ""));
    let status = head
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()?;

    Some(PartResponse {
        content_id,
        status,
        body: body.trim().to_string(),
    })
}

fn split_head(s: &str) -> Option<(&str, &str)> {
    s.split_once("\r\n\r\n").or_else(|| s.split_once("\n\n"))
}

fn header<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    headers.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}
