//! Response building (spec §4.6, §6): ICAP status line and the
//! standard response headers, plus the OPTIONS response and the
//! `ALLOW_204_AS_200_ZERO_ENCAPS` compatibility rewrite.

use chrono::Utc;

use crate::protocol::encapsulated::{compute_offsets, EncapsulatedList};
use crate::protocol::headers::HeaderList;
use crate::protocol::common::EntityKind;
use crate::service::ServiceDescriptor;

pub const SERVER_TOKEN: &str = concat!("ICAP-core/", env!("CARGO_PKG_VERSION"));

/// Maps an ICAP status code to its reason phrase (spec §6: "Status
/// codes used: 100, 200, 204, 206, 400, 403, 404, 405, 407, 408, 500").
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        204 => "No Modification",
        206 => "Partial Content",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Service Not Found",
        405 => "Method Not Allowed For Service",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        500 => "Server Error",
        _ => "Unknown",
    }
}

/// Current date formatted per RFC 822 GMT, as required on every ICAP
/// response (spec §4.6).
pub fn rfc822_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Builds the standard response header block shared by every ICAP
/// response: status line, `Server:`, `Date:`, `Connection:`, `ISTag:`,
/// and any `Encapsulated:` line the caller supplies.
pub struct ResponseBuilder {
    pub status: u16,
    pub keepalive: bool,
    pub istag: String,
    pub encapsulated: Option<String>,
    pub extra_headers: Vec<String>,
}

impl ResponseBuilder {
    pub fn new(status: u16, keepalive: bool, istag: impl Into<String>) -> Self {
        ResponseBuilder {
            status,
            keepalive,
            istag: istag.into(),
            encapsulated: None,
            extra_headers: Vec::new(),
        }
    }

    pub fn with_encapsulated(mut self, value: impl Into<String>) -> Self {
        self.encapsulated = Some(value.into());
        self
    }

    pub fn with_header(mut self, line: impl Into<String>) -> Self {
        self.extra_headers.push(line.into());
        self
    }

    /// Applies the `ALLOW_204_AS_200_ZERO_ENCAPS` compatibility rewrite
    /// (spec §4.6, §9 Open Question): a 204 becomes a 200 with an
    /// `Encapsulated:` indicating zero-length headers, for clients that
    /// reject bare 204s.
    pub fn rewrite_204_as_200_zero_encaps(mut self) -> Self {
        if self.status == 204 {
            self.status = 200;
            self.encapsulated = Some("null-body=0".to_string());
        }
        self
    }

    pub fn build(self) -> HeaderList {
        let mut headers = HeaderList::new();
        headers.set_start_line(format!("ICAP/1.0 {} {}", self.status, reason_phrase(self.status)));
        headers.add(format!("Server: {SERVER_TOKEN}"));
        headers.add(format!("Date: {}", rfc822_date()));
        headers.add(format!("Connection: {}", if self.keepalive { "keep-alive" } else { "close" }));
        headers.add(format!("ISTag: \"{}\"", self.istag));
        if let Some(encaps) = self.encapsulated {
            headers.add(format!("Encapsulated: {encaps}"));
        }
        for line in self.extra_headers {
            headers.add(line);
        }
        headers
    }
}

/// Builds the fixed OPTIONS response headers from a service descriptor
/// (spec §4.6 "OPTIONS response"). The body is always empty
/// (`Encapsulated: null-body=0`).
pub fn build_options_response(descriptor: &ServiceDescriptor, keepalive: bool) -> HeaderList {
    let methods = descriptor
        .supported_methods
        .iter()
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let entities = compute_offsets(&[(EntityKind::NullBody, None)]);
    let encaps = EncapsulatedList::build(&entities);

    let mut builder = ResponseBuilder::new(200, keepalive, descriptor.istag.clone())
        .with_encapsulated(encaps)
        .with_header(format!("Methods: {methods}"))
        .with_header(format!("Service: {}", descriptor.name))
        .with_header(format!("Max-Connections: {}", descriptor.max_connections))
        .with_header(format!("Options-TTL: {}", descriptor.options_ttl_secs));

    if let Some(preview) = descriptor.preview_size {
        builder = builder.with_header(format!("Preview: {preview}"));
    }
    let mut allow = Vec::new();
    if descriptor.allow_204 {
        allow.push("204");
    }
    if descriptor.allow_206 {
        allow.push("206");
    }
    if !allow.is_empty() {
        builder = builder.with_header(format!("Allow: {}", allow.join(", ")));
    }
    if !descriptor.transfer_preview.is_empty() {
        builder = builder.with_header(format!("Transfer-Preview: {}", descriptor.transfer_preview.join(", ")));
    }
    if !descriptor.transfer_ignore.is_empty() {
        builder = builder.with_header(format!("Transfer-Ignore: {}", descriptor.transfer_ignore.join(", ")));
    }
    if !descriptor.transfer_complete.is_empty() {
        builder = builder.with_header(format!("Transfer-Complete: {}", descriptor.transfer_complete.join(", ")));
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::common::IcapMethod;

    #[test]
    fn status_line_uses_correct_reason_phrase() {
        let headers = ResponseBuilder::new(204, true, "v1").build();
        assert_eq!(headers.start_line(), Some("ICAP/1.0 204 No Modification"));
        assert_eq!(headers.search("Connection"), Some("keep-alive"));
    }

    #[test]
    fn rewrite_204_produces_200_with_zero_encaps() {
        let headers = ResponseBuilder::new(204, true, "v1").rewrite_204_as_200_zero_encaps().build();
        assert_eq!(headers.start_line(), Some("ICAP/1.0 200 OK"));
        assert_eq!(headers.search("Encapsulated"), Some("null-body=0"));
    }

    #[test]
    fn options_response_lists_methods_and_preview() {
        let descriptor = ServiceDescriptor {
            name: "echo".to_string(),
            description: "echoes input".to_string(),
            supported_methods: vec![IcapMethod::Reqmod, IcapMethod::Respmod],
            istag: "ECHO-1".to_string(),
            preview_size: Some(1024),
            allow_204: true,
            allow_206: true,
            max_connections: 100,
            options_ttl_secs: 3600,
            transfer_preview: vec!["*".to_string()],
            transfer_ignore: vec![],
            transfer_complete: vec![],
        };
        let headers = build_options_response(&descriptor, true);
        assert_eq!(headers.search("Methods"), Some("REQMOD, RESPMOD"));
        assert_eq!(headers.search("Preview"), Some("1024"));
        assert_eq!(headers.search("Allow"), Some("204, 206"));
        assert_eq!(headers.search("Encapsulated"), Some("null-body=0"));
    }
}
