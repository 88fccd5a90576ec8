//! Format Interpolation (C9): expands `%`-directives into log strings
//! (spec §4.9), grounded in `original_source/txt_format.c`'s
//! `GlobalTable` of directives and its `ci_format_text` interpolator.
//!
//! A directive is `%[-][width]<code>[{param}]`, e.g. `%a`, `%-20is`,
//! `%Sa{user-agent}`. Left-align is selected by a `%-` prefix; the
//! trailing `{param}` supplies the directive's argument (a header or
//! attribute name for `%Sa`/`%>ho` etc) and follows the code, per
//! spec §4.9. Unknown directives are left uninterpreted (copied
//! through verbatim).

use std::net::IpAddr;

use chrono::{Local, Utc};

use crate::protocol::common::IcapMethod;

/// Everything a directive might read. Built by the server/client state
/// machines at log time from an [`crate::protocol::request::IcapRequest`];
/// kept as a plain struct so format tests don't need a live connection.
#[derive(Debug, Clone, Default)]
pub struct FormatContext {
    pub remote_ip: Option<IpAddr>,
    pub local_ip: Option<IpAddr>,
    pub local_port: Option<u16>,
    pub http_client_ip: Option<IpAddr>,
    pub http_server_ip: Option<IpAddr>,

    pub icap_method: Option<IcapMethod>,
    pub icap_status: Option<u16>,
    pub service_name: Option<String>,
    pub service_args: Option<String>,
    pub username: Option<String>,

    pub icap_request_header: Option<String>,
    pub icap_response_header: Option<String>,
    pub http_request_header_modified: Option<String>,
    pub http_request_url_modified: Option<String>,
    pub http_response_header_modified: Option<String>,

    pub preview_len: Option<i64>,
    pub preview_data: Vec<u8>,

    pub bytes_in: u64,
    pub bytes_out: u64,
    pub http_bytes_in: u64,
    pub http_bytes_out: u64,
    pub body_bytes_in: u64,
    pub body_bytes_out: u64,

    /// `%Sl`: a log string a service may set on the request for this
    /// transaction (spec §4.9 "services may supply an override format
    /// string... and may attach named attributes").
    pub service_log_string: Option<String>,
    /// `%Sa{name}`: named attributes a service attached to the request.
    pub attributes: std::collections::HashMap<String, String>,
}

/// One row of the directive table: the code following `%` (e.g. `"a"`,
/// `"Sa"`, `">ho"`), a human description, and the formatter.
struct FormatEntry {
    code: &'static str,
    #[allow(dead_code)]
    description: &'static str,
    formatter: fn(&FormatContext, Option<&str>) -> String,
}

/// Mirrors `original_source/txt_format.c`'s `GlobalTable`, including
/// the directives it marks "Not yet implemented" (kept here as
/// `fmt_none`, which renders `"-"`, matching the original's
/// `fmt_none`).
const TABLE: &[FormatEntry] = &[
    FormatEntry { code: "a", description: "Remote IP-Address", formatter: fmt_remote_ip },
    FormatEntry { code: "la", description: "Local IP Address", formatter: fmt_local_ip },
    FormatEntry { code: "lp", description: "Local port", formatter: fmt_local_port },
    FormatEntry { code: ">a", description: "Http Client IP Address", formatter: fmt_http_client_ip },
    FormatEntry { code: "<A", description: "Http Server IP Address", formatter: fmt_http_server_ip },
    FormatEntry { code: "ts", description: "Seconds since epoch", formatter: fmt_seconds },
    FormatEntry { code: "tl", description: "Local time", formatter: fmt_localtime },
    FormatEntry { code: "tg", description: "GMT time", formatter: fmt_gmttime },
    FormatEntry { code: "tr", description: "Response time", formatter: fmt_none },
    FormatEntry { code: ">hi", description: "Http request header", formatter: fmt_none },
    FormatEntry { code: ">ho", description: "Modified Http request header", formatter: fmt_http_req_head_o },
    FormatEntry { code: "huo", description: "Modified Http request url", formatter: fmt_http_req_url_o },
    FormatEntry { code: "hu", description: "Http request url", formatter: fmt_none },
    FormatEntry { code: "<hi", description: "Http reply header", formatter: fmt_none },
    FormatEntry { code: "<ho", description: "Modified Http reply header", formatter: fmt_http_res_head_o },
    FormatEntry { code: "Hs", description: "Http reply status", formatter: fmt_none },
    FormatEntry { code: "Hso", description: "Modified Http reply status", formatter: fmt_none },
    FormatEntry { code: "iu", description: "Icap request url", formatter: fmt_request },
    FormatEntry { code: "im", description: "Icap method", formatter: fmt_icap_method },
    FormatEntry { code: "is", description: "Icap status code", formatter: fmt_icap_status },
    FormatEntry { code: ">ih", description: "Icap request header", formatter: fmt_icap_req_head },
    FormatEntry { code: "<ih", description: "Icap response header", formatter: fmt_icap_res_head },
    FormatEntry { code: "ipl", description: "Icap preview length", formatter: fmt_preview_len },
    FormatEntry { code: "Ih", description: "Http bytes received", formatter: fmt_http_bytes_in },
    FormatEntry { code: "Oh", description: "Http bytes sent", formatter: fmt_http_bytes_out },
    FormatEntry { code: "Ib", description: "Http body bytes received", formatter: fmt_body_bytes_in },
    FormatEntry { code: "Ob", description: "Http body bytes sent", formatter: fmt_body_bytes_out },
    FormatEntry { code: "I", description: "Bytes received", formatter: fmt_bytes_in },
    FormatEntry { code: "O", description: "Bytes sent", formatter: fmt_bytes_out },
    FormatEntry { code: "bph", description: "Body data preview", formatter: fmt_preview_hex },
    FormatEntry { code: "un", description: "Username", formatter: fmt_username },
    FormatEntry { code: "Sl", description: "Service log string", formatter: fmt_log_string },
    FormatEntry { code: "Sa", description: "Attribute set by service", formatter: fmt_attribute },
    FormatEntry { code: "%", description: "% sign", formatter: fmt_percent },
];

fn fmt_none(_ctx: &FormatContext, _param: Option<&str>) -> String {
    "-".to_string()
}

fn fmt_percent(_ctx: &FormatContext, _param: Option<&str>) -> String {
    "%".to_string()
}

fn fmt_remote_ip(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.remote_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".to_string())
}

fn fmt_local_ip(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.local_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".to_string())
}

fn fmt_local_port(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.local_port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
}

fn fmt_http_client_ip(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.http_client_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".to_string())
}

fn fmt_http_server_ip(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.http_server_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".to_string())
}

fn fmt_seconds(_ctx: &FormatContext, _param: Option<&str>) -> String {
    Utc::now().timestamp().to_string()
}

fn fmt_localtime(_ctx: &FormatContext, param: Option<&str>) -> String {
    let tfmt = param.filter(|p| !p.is_empty()).unwrap_or("%d/%b/%Y:%H:%M:%S %z");
    Local::now().format(tfmt).to_string()
}

fn fmt_gmttime(_ctx: &FormatContext, param: Option<&str>) -> String {
    let tfmt = param.filter(|p| !p.is_empty()).unwrap_or("%d/%b/%Y:%H:%M:%S");
    Utc::now().format(tfmt).to_string()
}

fn fmt_http_req_head_o(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.http_request_header_modified.clone().unwrap_or_else(|| "-".to_string())
}

fn fmt_http_req_url_o(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.http_request_url_modified.clone().unwrap_or_else(|| "-".to_string())
}

fn fmt_http_res_head_o(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.http_response_header_modified.clone().unwrap_or_else(|| "-".to_string())
}

fn fmt_request(ctx: &FormatContext, _param: Option<&str>) -> String {
    let service = ctx.service_name.as_deref().unwrap_or("-");
    match &ctx.service_args {
        Some(args) if !args.is_empty() => format!("{service}?{args}"),
        _ => service.to_string(),
    }
}

fn fmt_icap_method(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.icap_method.map(|m| m.as_str().to_string()).unwrap_or_else(|| "-".to_string())
}

fn fmt_icap_status(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.icap_status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string())
}

fn fmt_icap_req_head(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.icap_request_header.clone().unwrap_or_else(|| "-".to_string())
}

fn fmt_icap_res_head(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.icap_response_header.clone().unwrap_or_else(|| "-".to_string())
}

fn fmt_preview_len(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.preview_len.map(|n| n.to_string()).unwrap_or_else(|| "-1".to_string())
}

fn fmt_http_bytes_in(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.http_bytes_in.to_string()
}

fn fmt_http_bytes_out(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.http_bytes_out.to_string()
}

fn fmt_body_bytes_in(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.body_bytes_in.to_string()
}

fn fmt_body_bytes_out(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.body_bytes_out.to_string()
}

fn fmt_bytes_in(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.bytes_in.to_string()
}

fn fmt_bytes_out(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.bytes_out.to_string()
}

fn fmt_preview_hex(ctx: &FormatContext, _param: Option<&str>) -> String {
    if ctx.preview_data.is_empty() {
        return "-".to_string();
    }
    ctx.preview_data.iter().map(|b| format!("{b:02x}")).collect()
}

fn fmt_username(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.username.clone().unwrap_or_else(|| "-".to_string())
}

fn fmt_log_string(ctx: &FormatContext, _param: Option<&str>) -> String {
    ctx.service_log_string.clone().unwrap_or_else(|| "-".to_string())
}

fn fmt_attribute(ctx: &FormatContext, param: Option<&str>) -> String {
    let Some(name) = param else { return "-".to_string() };
    ctx.attributes.get(name).cloned().unwrap_or_else(|| "-".to_string())
}

/// Parsed directive prefix: whether it starts with `%-` (left align)
/// and an optional width. Returns the number of bytes consumed
/// starting right after the `%`. The `{param}` argument, if any,
/// follows the directive code (spec §4.9) and is parsed separately by
/// [`parse_param`] once the code has been matched.
fn parse_prefix(s: &str) -> (usize, bool, Option<usize>) {
    let bytes = s.as_bytes();
    let mut i = 0usize;
    let left_align = bytes.first() == Some(&b'-');
    if left_align {
        i += 1;
    }
    let width_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    let width = if i > width_start { s[width_start..i].parse::<usize>().ok() } else { None };
    (i, left_align, width)
}

/// Parses an optional `{param}` immediately following a matched
/// directive code. Returns the number of bytes consumed and the
/// param, if present.
fn parse_param(s: &str) -> (usize, Option<&str>) {
    if s.as_bytes().first() == Some(&b'{') {
        if let Some(end) = s.find('}') {
            return (end + 1, Some(&s[1..end]));
        }
    }
    (0, None)
}

fn sorted_table() -> &'static [&'static FormatEntry] {
    static SORTED: std::sync::OnceLock<Vec<&'static FormatEntry>> = std::sync::OnceLock::new();
    SORTED.get_or_init(|| {
        // longest-code-first avoids e.g. "a" shadowing ">a".
        let mut entries: Vec<&FormatEntry> = TABLE.iter().collect();
        entries.sort_by_key(|e| std::cmp::Reverse(e.code.len()));
        entries
    })
}

fn find_entry(rest: &str) -> Option<(&'static FormatEntry, usize)> {
    for entry in sorted_table() {
        if rest.starts_with(entry.code) {
            return Some((entry, entry.code.len()));
        }
    }
    None
}

/// Expands every `%`-directive in `fmt` against `ctx`. Unknown
/// directives (a `%` not followed by a recognized code) are copied
/// through verbatim, `%` included, matching the original's fallback of
/// emitting `*s` unchanged when `check_tables` finds nothing.
pub fn interpolate(fmt: &str, ctx: &FormatContext) -> String {
    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let rest = &fmt[i + 1..];
        let (prefix_len, left_align, width) = parse_prefix(rest);
        let after_prefix = &rest[prefix_len..];
        match find_entry(after_prefix) {
            Some((entry, code_len)) => {
                let after_code = &after_prefix[code_len..];
                let (param_len, param) = parse_param(after_code);
                let mut value = (entry.formatter)(ctx, param);
                if let Some(w) = width {
                    if value.len() > w {
                        value.truncate(w);
                    } else if left_align {
                        value.push_str(&" ".repeat(w - value.len()));
                    } else {
                        value = format!("{}{}", " ".repeat(w - value.len()), value);
                    }
                }
                out.push_str(&value);
                let total = prefix_len + code_len + param_len;
                for _ in 0..total {
                    chars.next();
                }
            }
            None => {
                out.push('%');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_basic_directives() {
        let ctx = FormatContext {
            remote_ip: Some("10.0.0.1".parse().unwrap()),
            icap_method: Some(IcapMethod::Reqmod),
            icap_status: Some(204),
            ..Default::default()
        };
        let out = interpolate("%a %im %is", &ctx);
        assert_eq!(out, "10.0.0.1 REQMOD 204");
    }

    #[test]
    fn unknown_directive_is_left_uninterpreted() {
        let ctx = FormatContext::default();
        let out = interpolate("x%zzzy", &ctx);
        assert_eq!(out, "x%zzzy");
    }

    #[test]
    fn width_and_left_align_pad_the_value() {
        let ctx = FormatContext { icap_status: Some(4), ..Default::default() };
        assert_eq!(interpolate("[%5is]", &ctx), "[    4]");
        assert_eq!(interpolate("[%-5is]", &ctx), "[4    ]");
    }

    #[test]
    fn attribute_directive_reads_named_param() {
        let mut ctx = FormatContext::default();
        ctx.attributes.insert("user-agent".to_string(), "curl".to_string());
        assert_eq!(interpolate("%Sa{user-agent}", &ctx), "curl");
        assert_eq!(interpolate("%Sa{missing}", &ctx), "-");
    }

    #[test]
    fn percent_sign_directive_and_byte_counters() {
        let ctx = FormatContext { bytes_in: 120, bytes_out: 45, ..Default::default() };
        assert_eq!(interpolate("100%% done, %I in / %O out", &ctx), "100% done, 120 in / 45 out");
    }

    #[test]
    fn preview_hex_renders_lowercase_bytes() {
        let ctx = FormatContext { preview_data: vec![0xDE, 0xAD, 0xBE, 0xEF], ..Default::default() };
        assert_eq!(interpolate("%bph", &ctx), "deadbeef");
    }
}
