//! The per-connection transaction driver (spec §4.6): reads and
//! parses one ICAP request, runs access control, drives the
//! PREVIEW/BODY/END-OF-DATA phases against a service, and writes the
//! response — then loops for the next pipelined or keep-alive request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::access::{AccessContext, AccessVerdict};
use crate::auth::{challenge_header, parse_basic_credentials};
use crate::error::{IcapError, IcapResult};
use crate::format::FormatContext;
use crate::protocol::chunked::{encode_chunk, encode_terminal, encode_terminal_with_original_body, ChunkedDecoder};
use crate::protocol::common::{EntityKind, IcapMethod, ServiceVerdict, StepResult, TransactionStatus};
use crate::protocol::encapsulated::{compute_offsets, EncapsulatedList};
use crate::protocol::headers::HeaderList;
use crate::protocol::request::IcapRequest;
use crate::protocol::response::{build_options_response, ResponseBuilder};
use crate::service::{IcapService, IoBuffers, ServiceState};
use crate::wire::{Connection, WaitFor};

use super::ServerConfig;

const READ_CHUNK: usize = 8192;
const INTERIM_CONTINUE: &[u8] = b"ICAP/1.0 100 Continue\r\n\r\n";

/// Runs one connection to completion: the keep-alive/pipelining loop
/// around repeated calls to [`run_transaction`] (spec §4.6
/// "Pipelining"), finishing with a graceful close.
pub async fn run_connection(connection: Box<dyn Connection>, peer: SocketAddr, config: Arc<ServerConfig>) -> IcapResult<()> {
    log::debug!("accepted ICAP connection from {peer}");
    let mut req = IcapRequest::new(connection);

    loop {
        let mut sent = false;
        match run_transaction(&mut req, peer, &config, &mut sent).await {
            Ok(outcome) => {
                log_transaction(&req, peer, &config);
                record_counters(&req, false);
                match outcome {
                    TransactionOutcome::Close => break,
                    TransactionOutcome::Keepalive => {
                        req.reset_for_keepalive();
                        if config.pipelining && !req.read_buf.is_empty() {
                            continue;
                        }
                        if !config.pipelining {
                            req.read_buf.clear();
                        }
                        if read_with_deadline(&mut req, &config, config.keepalive_timeout).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                log::warn!("transaction from {peer} failed: {err}");
                if !sent {
                    write_error_response(&mut req, &config, &err).await;
                }
                record_counters(&req, true);
                break;
            }
        }
    }

    log::debug!("closing ICAP connection from {peer}");
    req.connection.close_linger().await;
    Ok(())
}

enum TransactionOutcome {
    Keepalive,
    Close,
}

/// Drives one ICAP transaction through the full state progression in
/// spec §4.6, steps 1-7 plus PREVIEW/BODY/END-OF-DATA. `sent` is set
/// true the moment any response byte reaches the wire, so a caller
/// that sees an `Err` knows whether it may still emit the small ICAP
/// error response (spec §4.6 "Failure handling").
async fn run_transaction(req: &mut IcapRequest, peer: SocketAddr, config: &ServerConfig, sent: &mut bool) -> IcapResult<TransactionOutcome> {
    req.status = TransactionStatus::ReadIcapHeader;
    let header_consumed = read_icap_header(req, config).await?;
    req.counters.bytes_in += header_consumed as u64;

    req.status = TransactionStatus::ParseRequestLine;
    parse_request_line(req, config)?;

    req.status = TransactionStatus::ParseHeaders;
    parse_headers(req)?;

    req.status = TransactionStatus::ReadEncapsHeaders;
    let mut cursor = read_encaps_headers(req, header_consumed, config).await?;

    req.status = TransactionStatus::AccessCheck;
    access_check(req, peer, config).await?;

    req.status = TransactionStatus::CallServiceInit;
    let service_name = req.service_name.clone().expect("parse_request_line sets this");
    let service = config.services.get(&service_name).cloned().ok_or_else(|| IcapError::NoSuchService(service_name.clone()))?;

    let method = req.method.expect("parse_request_line sets this");
    match method {
        IcapMethod::Options => {
            let headers = build_options_response(service.descriptor(), req.flags.keepalive);
            req.return_code = 200;
            write_bytes(req, config, sent, headers.pack().as_bytes()).await?;
            Ok(keepalive_outcome(req))
        }
        IcapMethod::Reqmod | IcapMethod::Respmod => {
            req.status = TransactionStatus::Preview;
            let keepalive = run_adaptation(req, &mut cursor, config, service.as_ref(), sent).await?;
            req.status = TransactionStatus::Done;
            Ok(if keepalive { TransactionOutcome::Keepalive } else { TransactionOutcome::Close })
        }
    }
}

fn keepalive_outcome(req: &IcapRequest) -> TransactionOutcome {
    if req.flags.keepalive {
        TransactionOutcome::Keepalive
    } else {
        TransactionOutcome::Close
    }
}

/// Reads bytes into `req.read_buf` until readable, honoring the global
/// halt signal, bounded by `deadline`. Always reads at least one
/// nonempty chunk before returning `Ok`.
async fn read_with_deadline(req: &mut IcapRequest, config: &ServerConfig, deadline: Duration) -> IcapResult<()> {
    tokio::time::timeout(deadline, async {
        loop {
            let readiness = req.connection.wait(WaitFor::read(), config.wait_poll_ms).await?;
            if readiness.retry {
                return Err(IcapError::protocol("shutdown requested", "server"));
            }
            if !readiness.readable {
                continue;
            }
            let mut tmp = [0u8; READ_CHUNK];
            match req.connection.try_read(&mut tmp).await? {
                Some(0) => return Err(IcapError::protocol("connection closed by peer", "server")),
                Some(n) => {
                    req.read_buf.extend_from_slice(&tmp[..n]);
                    return Ok(());
                }
                None => continue,
            }
        }
    })
    .await
    .map_err(|_| IcapError::Timeout { operation: "read" })?
}

async fn fill_until(req: &mut IcapRequest, config: &ServerConfig, max_len: usize, mut done: impl FnMut(&[u8]) -> bool) -> IcapResult<()> {
    while !done(&req.read_buf) {
        if req.read_buf.len() > max_len {
            return Err(IcapError::protocol("request exceeds maximum buffered size", "server"));
        }
        read_with_deadline(req, config, config.read_timeout).await?;
    }
    Ok(())
}

fn header_block_len(buf: &[u8]) -> Option<usize> {
    memchr::memmem::find(buf, b"\r\n\r\n").map(|idx| idx + 4)
}

/// `READ_ICAP_HEADER` (spec §4.6 step 1). Returns the number of bytes
/// the ICAP header block occupies in `req.read_buf`.
async fn read_icap_header(req: &mut IcapRequest, config: &ServerConfig) -> IcapResult<usize> {
    fill_until(req, config, config.max_header_block, |buf| header_block_len(buf).is_some()).await?;
    let len = header_block_len(&req.read_buf).expect("checked by fill_until");
    let (headers, consumed) = HeaderList::unpack(&req.read_buf[..len])?;
    debug_assert_eq!(consumed, len);
    req.icap_headers = headers;
    Ok(len)
}

/// `PARSE_REQUEST_LINE` (spec §4.6 step 2).
fn parse_request_line(req: &mut IcapRequest, config: &ServerConfig) -> IcapResult<()> {
    let line = req
        .icap_headers
        .start_line()
        .ok_or_else(|| IcapError::protocol("missing request line", "request-line"))?
        .to_string();

    let mut parts = line.split_whitespace();
    let method_str = parts.next().ok_or_else(|| IcapError::protocol("empty request line", "request-line"))?;
    let uri = parts.next().ok_or_else(|| IcapError::protocol("missing request URI", "request-line"))?;
    let version = parts.next().ok_or_else(|| IcapError::protocol("missing ICAP version", "request-line"))?;
    if parts.next().is_some() {
        return Err(IcapError::protocol("request line has extra tokens", "request-line"));
    }

    let method: IcapMethod = method_str.parse()?;
    validate_version(version)?;

    let rest = uri
        .strip_prefix("icap://")
        .or_else(|| uri.strip_prefix("icaps://"))
        .ok_or_else(|| IcapError::protocol("request URI must use icap:// or icaps://", "request-line"))?;

    let path_start = rest.find('/').unwrap_or(rest.len());
    let path = rest[path_start..].strip_prefix('/').unwrap_or(&rest[path_start..]);
    let (service_part, query) = match path.split_once('?') {
        Some((s, q)) => (s, Some(q.to_string())),
        None => (path, None),
    };

    let service_name = if service_part.is_empty() {
        config
            .default_service
            .clone()
            .ok_or_else(|| IcapError::NoSuchService("no service name given and no default configured".to_string()))?
    } else {
        service_part.to_string()
    };

    let service = config.services.get(&service_name).ok_or_else(|| IcapError::NoSuchService(service_name.clone()))?;
    if !service.descriptor().supports(method) {
        return Err(IcapError::MethodNotAllowed { service: service_name, method: method.as_str().to_string() });
    }

    req.method = Some(method);
    req.service_name = Some(service_name);
    if let Some(q) = query {
        req.attributes.insert("service_args".to_string(), q);
    }
    Ok(())
}

fn validate_version(v: &str) -> IcapResult<()> {
    match v.strip_prefix("ICAP/1.") {
        Some("0") | Some("1") => Ok(()),
        _ => Err(IcapError::protocol(format!("unsupported ICAP version {v:?}"), "request-line")),
    }
}

/// `PARSE_HEADERS` (spec §4.6 step 3).
fn parse_headers(req: &mut IcapRequest) -> IcapResult<()> {
    req.flags.keepalive = true;
    for (name, value) in req.icap_headers.iterate() {
        let value = value.trim();
        if name.eq_ignore_ascii_case("Preview") {
            let n: u64 = value.parse().map_err(|_| IcapError::protocol("invalid Preview value", "headers"))?;
            req.preview_size = Some(n);
        } else if name.eq_ignore_ascii_case("Encapsulated") {
            req.encapsulated = Some(EncapsulatedList::parse(value)?);
        } else if name.eq_ignore_ascii_case("Connection") && value.eq_ignore_ascii_case("close") {
            req.flags.keepalive = false;
        } else if name.eq_ignore_ascii_case("Allow") {
            req.flags.allow204 = value.split(',').any(|t| t.trim() == "204");
            req.flags.allow206 = value.split(',').any(|t| t.trim() == "206");
        }
    }

    let method = req.method.expect("parse_request_line runs first");
    let list = req.encapsulated.as_ref().ok_or_else(|| IcapError::protocol("missing Encapsulated header", "headers"))?;
    list.validate_shape(method, crate::protocol::encapsulated::MessageDirection::Request)?;
    req.flags.hasbody = list.has_body();
    Ok(())
}

/// `READ_ENCAPS_HEADERS` (spec §4.6 step 4). Returns the absolute
/// offset in `req.read_buf` where the encapsulated body begins.
async fn read_encaps_headers(req: &mut IcapRequest, header_consumed: usize, config: &ServerConfig) -> IcapResult<usize> {
    let entities = match &req.encapsulated {
        Some(list) => list.entities().to_vec(),
        None => return Ok(header_consumed),
    };
    if entities.is_empty() {
        return Ok(header_consumed);
    }
    let body_offset = entities.last().expect("checked non-empty").offset as usize;
    let need = header_consumed + body_offset;
    fill_until(req, config, config.max_header_block, |buf| buf.len() >= need).await?;

    for i in 0..entities.len() {
        let entity = entities[i];
        if !entity.kind.is_header() {
            continue;
        }
        let end = header_consumed + entities[i + 1].offset as usize;
        let start = header_consumed + entity.offset as usize;
        let (parsed, _) =
            HeaderList::unpack(&req.read_buf[start..end]).map_err(|_| IcapError::protocol("malformed encapsulated HTTP headers", "encapsulated"))?;
        let _ = req.recycle_pool.take(entity.kind);
        req.counters.http_bytes_in += (end - start) as u64;
        req.encapsulated_headers.insert(entity.kind, parsed);
    }
    Ok(need)
}

fn build_access_context(req: &IcapRequest, peer: SocketAddr, config: &ServerConfig) -> AccessContext {
    let mut ctx = AccessContext {
        service_name: req.service_name.clone(),
        method: req.method,
        client_ip: Some(peer.ip()),
        client_port: Some(peer.port()),
        server_ip: req.connection.local_addr().map(|a| a.ip()),
        server_port: req.connection.local_addr().map(|a| a.port()),
        headers: req.icap_headers.iterate().map(|(n, v)| (n.trim().to_string(), v.trim().to_string())).collect(),
        ..Default::default()
    };

    for header_name in ["Authorization", "Proxy-Authorization"] {
        if let Some(value) = req.icap_headers.search(header_name) {
            if let Ok((user, pass)) = parse_basic_credentials(value) {
                if config.credentials.verify(&user, &pass) {
                    ctx.has_credentials = true;
                    ctx.username = Some(user);
                }
            }
        }
    }
    ctx
}

/// `ACCESS_CHECK` (spec §4.6 step 5, §4.8).
async fn access_check(req: &mut IcapRequest, peer: SocketAddr, config: &ServerConfig) -> IcapResult<()> {
    let ctx = build_access_context(req, peer, config);
    match config.access.check(&ctx) {
        AccessVerdict::Allow => {
            req.attributes.insert("access_verdict".to_string(), "allow".to_string());
            if let Some(user) = ctx.username {
                req.attributes.insert("username".to_string(), user);
            }
            Ok(())
        }
        AccessVerdict::Deny => Err(IcapError::AccessDenied(format!("{:?}", req.service_name))),
        AccessVerdict::AuthRequired => Err(IcapError::AuthRequired { realm: config.access.auth_realm.clone() }),
    }
}

async fn write_bytes(req: &mut IcapRequest, config: &ServerConfig, sent: &mut bool, bytes: &[u8]) -> IcapResult<()> {
    *sent = true;
    req.counters.bytes_out += bytes.len() as u64;
    req.connection.write_timeout(bytes, config.write_timeout).await?;
    Ok(())
}

async fn read_more(req: &mut IcapRequest, config: &ServerConfig) -> IcapResult<()> {
    let before = req.read_buf.len();
    read_with_deadline(req, config, config.read_timeout).await?;
    req.counters.bytes_in += (req.read_buf.len() - before) as u64;
    Ok(())
}

/// PREVIEW phase (spec §4.6). Returns the service's verdict, the
/// preview bytes it was shown (so they can still be fed through
/// `io()` on the CONTINUE path), and whether the preview's terminating
/// chunk carried `ieof`.
async fn run_preview(
    req: &mut IcapRequest,
    cursor: &mut usize,
    config: &ServerConfig,
    service: &dyn IcapService,
    state: &mut ServiceState,
) -> IcapResult<(ServiceVerdict, Vec<u8>, bool)> {
    if !req.flags.hasbody {
        let verdict = service.check_preview(state, &[], req).await?;
        return Ok((verdict, Vec::new(), true));
    }

    let Some(_preview_size) = req.preview_size else {
        // No Preview header advertised: a "fake preview" with no data,
        // so the service can still render an early verdict.
        let verdict = service.check_preview(state, &[], req).await?;
        return Ok((verdict, Vec::new(), false));
    };

    let mut preview_buf = Vec::new();
    loop {
        let (consumed, result) = req.chunk_decoder.decode(&req.read_buf[*cursor..], &mut preview_buf)?;
        *cursor += consumed;
        match result {
            StepResult::Eof => break,
            StepResult::NeedsMore => read_more(req, config).await?,
            _ => return Err(IcapError::protocol("unexpected chunk decode outcome in preview", "preview")),
        }
    }
    req.counters.body_bytes_in += preview_buf.len() as u64;
    req.counters.http_bytes_in += preview_buf.len() as u64;
    let ieof = req.chunk_decoder.ieof;
    req.flags.eof_received = ieof;
    let verdict = service.check_preview(state, &preview_buf, req).await?;
    Ok((verdict, preview_buf, ieof))
}

/// REQMOD/RESPMOD dispatch: PREVIEW, then either an early terminal
/// response or the BODY/END-OF-DATA phases.
async fn run_adaptation(req: &mut IcapRequest, cursor: &mut usize, config: &ServerConfig, service: &dyn IcapService, sent: &mut bool) -> IcapResult<bool> {
    let mut state = service.init_request(req).await?;

    let (verdict, preview_buf, ieof) = match run_preview(req, cursor, config, service, &mut state).await {
        Ok(v) => v,
        Err(e) => {
            service.release_request(state, req).await;
            return Err(e);
        }
    };

    match verdict {
        ServiceVerdict::Error => {
            service.release_request(state, req).await;
            return Err(IcapError::Service("service rejected preview data".to_string()));
        }
        ServiceVerdict::Allow204 => {
            service.release_request(state, req).await;
            return finish_with_status(req, config, sent, 204, None, preview_buf).await;
        }
        ServiceVerdict::Allow206 => {
            service.release_request(state, req).await;
            let offset = req.use_original_body_offset;
            return finish_with_status(req, config, sent, 206, offset, Vec::new()).await;
        }
        ServiceVerdict::Continue | ServiceVerdict::Done => {}
    }

    if req.flags.hasbody && req.preview_size.is_some() && !ieof {
        write_bytes(req, config, sent, INTERIM_CONTINUE).await?;
        req.chunk_decoder = ChunkedDecoder::new();
    }

    req.status = TransactionStatus::Body;
    let client_eof = ieof || !req.flags.hasbody;
    let outcome = drive_body(req, cursor, config, service, &mut state, preview_buf, client_eof, sent).await;
    service.release_request(state, req).await;
    outcome
}

/// BODY + END-OF-DATA phases (spec §4.6). Cooperatively interleaves
/// reading/decoding inbound chunks with the service's `io()` hook and
/// writing its output, committing to a streamed `200` response only
/// once the service actually produces output — until then a `204`/
/// `206` from `end_of_data` is still possible.
#[allow(clippy::too_many_arguments)]
async fn drive_body(
    req: &mut IcapRequest,
    cursor: &mut usize,
    config: &ServerConfig,
    service: &dyn IcapService,
    state: &mut ServiceState,
    initial_bytes: Vec<u8>,
    mut client_eof: bool,
    sent: &mut bool,
) -> IcapResult<bool> {
    let mut committed = false;
    // Mirrors every decoded body byte for as long as a 204/206 is
    // still on the table, so a late `Allow204` with
    // `echo_body_on_late_204` set can still echo the body unchanged
    // (spec §4.6 "Option (a)... echo the body back unchanged").
    // Dropped the moment the transaction commits to streaming.
    let mut raw_echo_buffer = initial_bytes.clone();
    let mut feed = initial_bytes;

    loop {
        let mut write_out = Vec::new();
        let progress = {
            let mut io = IoBuffers { read_in: &feed, write_out: &mut write_out, client_eof };
            service.io(state, &mut io, req).await?
        };

        if progress.consumed >= feed.len() {
            feed.clear();
        } else {
            feed.drain(..progress.consumed);
        }

        if !write_out.is_empty() {
            if !committed {
                let head = build_committed_headers(req, config);
                write_bytes(req, config, sent, &head).await?;
                committed = true;
                raw_echo_buffer.clear();
                raw_echo_buffer.shrink_to_fit();
            }
            req.counters.body_bytes_out += write_out.len() as u64;
            req.counters.http_bytes_out += write_out.len() as u64;
            let chunk = encode_chunk(&write_out)?;
            write_bytes(req, config, sent, &chunk).await?;
        }

        if client_eof && feed.is_empty() {
            break;
        }

        if !client_eof && (feed.is_empty() || progress.consumed == 0) {
            let echo_start = feed.len();
            loop {
                let (consumed, result) = req.chunk_decoder.decode(&req.read_buf[*cursor..], &mut feed)?;
                *cursor += consumed;
                match result {
                    StepResult::Eof => {
                        client_eof = true;
                        req.flags.eof_received = true;
                        break;
                    }
                    StepResult::NeedsMore => read_more(req, config).await?,
                    _ => return Err(IcapError::protocol("unexpected chunk decode outcome in body", "body")),
                }
                if feed.len() > echo_start {
                    break;
                }
            }
            let read_now = (feed.len() - echo_start) as u64;
            req.counters.body_bytes_in = req.counters.body_bytes_in.saturating_add(read_now);
            req.counters.http_bytes_in = req.counters.http_bytes_in.saturating_add(read_now);
            if !committed {
                raw_echo_buffer.extend_from_slice(&feed[echo_start..]);
            }
        }
    }

    req.status = TransactionStatus::EndOfData;
    let verdict = service.end_of_data(state, req).await?;
    let verdict = if committed { ServiceVerdict::Done } else { verdict };

    match verdict {
        ServiceVerdict::Allow204 => finish_with_status(req, config, sent, 204, None, raw_echo_buffer).await,
        ServiceVerdict::Allow206 => {
            let offset = req.use_original_body_offset;
            finish_with_status(req, config, sent, 206, offset, Vec::new()).await
        }
        ServiceVerdict::Error => Err(IcapError::Service("service rejected at end of data".to_string())),
        ServiceVerdict::Continue | ServiceVerdict::Done => {
            if !committed {
                let head = build_committed_headers(req, config);
                write_bytes(req, config, sent, &head).await?;
            }
            write_bytes(req, config, sent, &encode_terminal(false)).await?;
            req.return_code = 200;
            Ok(req.flags.keepalive)
        }
    }
}

/// Builds the `200 OK` response headers once a service commits to
/// streaming modified content: the original encapsulated HTTP headers
/// pass through unchanged (this core has no header-rewrite hook — only
/// the body is adaptable), followed by a fresh `Encapsulated:` framing
/// the trailing body entity.
fn build_committed_headers(req: &mut IcapRequest, config: &ServerConfig) -> Vec<u8> {
    let istag = req
        .service_name
        .as_ref()
        .and_then(|n| config.services.get(n))
        .map(|s| s.descriptor().istag.clone())
        .unwrap_or_default();
    let body_kind = if req.method == Some(IcapMethod::Reqmod) { EntityKind::ReqBody } else { EntityKind::ResBody };

    let mut parts: Vec<(EntityKind, Option<u64>)> = Vec::new();
    let mut packed_headers: Vec<String> = Vec::new();
    for kind in [EntityKind::ReqHdr, EntityKind::ResHdr] {
        if let Some(list) = req.encapsulated_headers.get(&kind) {
            let packed = list.pack();
            parts.push((kind, Some(packed.len() as u64)));
            packed_headers.push(packed);
        }
    }
    parts.push((body_kind, None));
    let entities = compute_offsets(&parts);

    let headers = ResponseBuilder::new(200, req.flags.keepalive, istag).with_encapsulated(EncapsulatedList::build(&entities)).build();

    let mut out = headers.pack().into_bytes();
    for packed in packed_headers {
        req.counters.http_bytes_out += packed.len() as u64;
        out.extend_from_slice(packed.as_bytes());
    }
    out
}

/// Emits a terminal `204`/`206` response (no body streaming ever
/// started). A `206` echoes the original encapsulated headers
/// unmodified and frames its body as a bare `use-original-body=N`
/// terminator (spec §4.6 "payload may include use-original-body=N").
/// A `204` the client never negotiated (`Allow: 204` absent) is only
/// valid on the wire if `config.echo_body_on_late_204` is set, in
/// which case it is rewritten into a `200` that echoes `echoed_body`
/// unchanged instead (spec §4.6 "Option (a)", §9 Open Question).
#[allow(clippy::too_many_arguments)]
async fn finish_with_status(
    req: &mut IcapRequest,
    config: &ServerConfig,
    sent: &mut bool,
    status: u16,
    original_body_offset: Option<u64>,
    echoed_body: Vec<u8>,
) -> IcapResult<bool> {
    if status == 204 && !req.flags.allow204 && req.flags.hasbody && config.echo_body_on_late_204 {
        return echo_body_as_200(req, config, sent, echoed_body).await;
    }

    let istag = req
        .service_name
        .as_ref()
        .and_then(|n| config.services.get(n))
        .map(|s| s.descriptor().istag.clone())
        .unwrap_or_default();
    let keepalive = req.flags.keepalive;
    req.return_code = status;

    let mut builder = ResponseBuilder::new(status, keepalive, istag);
    let mut body_bytes = Vec::new();

    if status == 206 {
        let body_kind = if req.method == Some(IcapMethod::Reqmod) { EntityKind::ReqBody } else { EntityKind::ResBody };
        let mut parts: Vec<(EntityKind, Option<u64>)> = Vec::new();
        let mut packed_headers: Vec<String> = Vec::new();
        for kind in [EntityKind::ReqHdr, EntityKind::ResHdr] {
            if let Some(list) = req.encapsulated_headers.get(&kind) {
                let packed = list.pack();
                parts.push((kind, Some(packed.len() as u64)));
                packed_headers.push(packed);
            }
        }
        parts.push((body_kind, None));
        let entities = compute_offsets(&parts);
        builder = builder.with_encapsulated(EncapsulatedList::build(&entities));
        for packed in packed_headers {
            req.counters.http_bytes_out += packed.len() as u64;
            body_bytes.extend_from_slice(packed.as_bytes());
        }
        body_bytes.extend_from_slice(&encode_terminal_with_original_body(original_body_offset.unwrap_or(0)));
    } else if status == 204 && config.allow_204_as_200_zero_encaps {
        builder = builder.rewrite_204_as_200_zero_encaps();
        req.return_code = 200;
    }

    let headers = builder.build();
    let mut out = headers.pack().into_bytes();
    out.extend_from_slice(&body_bytes);
    write_bytes(req, config, sent, &out).await?;
    Ok(keepalive)
}

/// Implements spec §4.6 "Option (a)": a service signalled `ALLOW_204`
/// outside preview without 204-outside-preview negotiated, and the
/// request has a body. Rather than reject the outcome, build a `200`
/// adaptation response that echoes whatever of the body has already
/// been decoded (`echoed_body`: the preview buffer if the decision was
/// made during preview, or the full body if it was made at
/// end-of-data) unchanged — the same wire shape `finish_with_status`
/// would have produced for a real pass-through service, just without
/// ever calling one. A conformant ICAP client stops sending body bytes
/// once it has seen a final (non-100) response to a pending preview,
/// so `echoed_body` is always the complete adaptation output here;
/// nothing further needs to be read off the wire.
async fn echo_body_as_200(req: &mut IcapRequest, config: &ServerConfig, sent: &mut bool, echoed_body: Vec<u8>) -> IcapResult<bool> {
    req.return_code = 200;
    let head = build_committed_headers(req, config);
    write_bytes(req, config, sent, &head).await?;

    if !echoed_body.is_empty() {
        req.counters.body_bytes_out += echoed_body.len() as u64;
        req.counters.http_bytes_out += echoed_body.len() as u64;
        let chunk = encode_chunk(&echoed_body)?;
        write_bytes(req, config, sent, &chunk).await?;
    }

    write_bytes(req, config, sent, &encode_terminal(false)).await?;
    Ok(req.flags.keepalive)
}

async fn write_error_response(req: &mut IcapRequest, config: &ServerConfig, err: &IcapError) {
    let status = err.status_code();
    let keepalive = err.keeps_connection_alive();
    let mut builder = ResponseBuilder::new(status, keepalive, "icap-core");
    if let IcapError::AuthRequired { realm } = err {
        builder = builder.with_header(format!("Proxy-Authenticate: {}", challenge_header(realm)));
    }
    let headers = builder.build();
    let _ = req.connection.write_timeout(headers.pack().as_bytes(), config.write_timeout).await;
}

/// Records the transaction outcome into the process-wide stats block
/// (spec §5 "Statistics counters... under a single process-wide lock
/// at transaction end").
fn record_counters(req: &IcapRequest, failed: bool) {
    crate::stats::record_transaction(
        failed,
        req.counters.bytes_in,
        req.counters.bytes_out,
        req.counters.body_bytes_in,
        req.counters.body_bytes_out,
    );
}

fn log_transaction(req: &IcapRequest, peer: SocketAddr, config: &ServerConfig) {
    let Some(logger) = &config.access_logger else { return };
    let ctx = build_access_context(req, peer, config);
    if !config.access.check_logging(&ctx) {
        return;
    }
    let fmt_ctx = FormatContext {
        remote_ip: Some(peer.ip()),
        local_ip: req.connection.local_addr().map(|a| a.ip()),
        local_port: req.connection.local_addr().map(|a| a.port()),
        icap_method: req.method,
        icap_status: Some(req.return_code),
        service_name: req.service_name.clone(),
        service_args: req.attributes.get("service_args").cloned(),
        username: ctx.username.clone(),
        preview_len: req.preview_size.map(|n| n as i64),
        bytes_in: req.counters.bytes_in,
        bytes_out: req.counters.bytes_out,
        http_bytes_in: req.counters.http_bytes_in,
        http_bytes_out: req.counters.http_bytes_out,
        body_bytes_in: req.counters.body_bytes_in,
        body_bytes_out: req.counters.body_bytes_out,
        attributes: req.attributes.clone(),
        ..Default::default()
    };
    logger.log(&fmt_ctx, req.log_format_override.as_deref());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{IoProgress, ServiceDescriptor};
    use crate::wire::Readiness;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex as StdMutex;

    /// An in-memory duplex byte stream: `inbound` feeds `try_read`,
    /// writes append to `outbound`. Standing in for a TCP connection in
    /// tests of the transaction driver.
    struct MemoryConnection {
        inbound: StdMutex<VecDeque<u8>>,
        outbound: StdMutex<Vec<u8>>,
    }

    impl MemoryConnection {
        fn new(inbound: &[u8]) -> Self {
            MemoryConnection { inbound: StdMutex::new(inbound.iter().copied().collect()), outbound: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl Connection for MemoryConnection {
        async fn read_timeout(&mut self, buf: &mut [u8], _deadline: Duration) -> io::Result<usize> {
            let mut inbound = self.inbound.lock().unwrap();
            let n = inbound.len().min(buf.len());
            for slot in buf.iter_mut().take(n) {
                *slot = inbound.pop_front().unwrap();
            }
            Ok(n)
        }
        async fn write_timeout(&mut self, buf: &[u8], _deadline: Duration) -> io::Result<()> {
            self.outbound.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }
        async fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            let mut inbound = self.inbound.lock().unwrap();
            if inbound.is_empty() {
                return Ok(None);
            }
            let n = inbound.len().min(buf.len());
            for slot in buf.iter_mut().take(n) {
                *slot = inbound.pop_front().unwrap();
            }
            Ok(Some(n))
        }
        async fn try_write(&mut self, buf: &[u8]) -> io::Result<Option<usize>> {
            self.outbound.lock().unwrap().extend_from_slice(buf);
            Ok(Some(buf.len()))
        }
        async fn wait(&mut self, want: WaitFor, _timeout_ms: u64) -> io::Result<Readiness> {
            let readable = want.read && !self.inbound.lock().unwrap().is_empty();
            Ok(Readiness { readable, writable: want.write, retry: false })
        }
        async fn close_hard(&mut self) {}
        async fn close_linger(&mut self) {}
        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn local_addr(&self) -> Option<SocketAddr> {
            "127.0.0.1:1344".parse().ok()
        }
    }

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::new(super::super::null_logger());
        config.register_service(Arc::new(crate::services::echo::EchoService::new()));
        config.wait_poll_ms = 10;
        config.read_timeout = Duration::from_secs(2);
        config
    }

    #[tokio::test]
    async fn options_request_gets_methods_header() {
        let wire = b"OPTIONS icap://localhost/echo ICAP/1.0\r\nHost: localhost\r\nEncapsulated: null-body=0\r\n\r\n";
        let conn = MemoryConnection::new(wire);
        let mut req = IcapRequest::new(Box::new(conn));
        let config = test_config();
        let mut sent = false;
        let outcome = run_transaction(&mut req, "127.0.0.1:9999".parse().unwrap(), &config, &mut sent).await.unwrap();
        assert!(matches!(outcome, TransactionOutcome::Keepalive));
        assert_eq!(req.return_code, 200);
    }

    #[tokio::test]
    async fn reqmod_with_empty_body_gets_allow_204() {
        let wire = b"REQMOD icap://localhost/echo ICAP/1.0\r\nHost: localhost\r\nAllow: 204\r\nEncapsulated: null-body=0\r\n\r\n";
        let conn = MemoryConnection::new(wire);
        let mut req = IcapRequest::new(Box::new(conn));
        let config = test_config();
        let mut sent = false;
        run_transaction(&mut req, "127.0.0.1:9999".parse().unwrap(), &config, &mut sent).await.unwrap();
        assert_eq!(req.return_code, 204);
    }

    #[tokio::test]
    async fn late_204_without_allow_negotiated_is_echoed_as_200() {
        // Preview: 0 with no `Allow: 204` header: the service still
        // decides Allow204 on the (empty) preview, but since the
        // client never negotiated bare 204 support, spec §4.6 "Option
        // (a)" applies and the transaction must come back as a `200`
        // instead, echoing whatever body was seen (nothing, here).
        let req_hdr = b"GET /x HTTP/1.1\r\nHost: e.com\r\n\r\n";
        let preview_tail = b"0\r\n\r\n";
        let head = format!(
            "REQMOD icap://localhost/echo ICAP/1.0\r\nHost: localhost\r\nPreview: 0\r\nEncapsulated: req-hdr=0, req-body={}\r\n\r\n",
            req_hdr.len()
        );
        let mut wire = head.into_bytes();
        wire.extend_from_slice(req_hdr);
        wire.extend_from_slice(preview_tail);

        let conn = MemoryConnection::new(&wire);
        let mut req = IcapRequest::new(Box::new(conn));
        let config = test_config();
        let mut sent = false;
        run_transaction(&mut req, "127.0.0.1:9999".parse().unwrap(), &config, &mut sent).await.unwrap();
        assert_eq!(req.return_code, 200);
    }

    #[tokio::test]
    async fn unknown_service_is_rejected_with_404() {
        let wire = b"REQMOD icap://localhost/no-such-service ICAP/1.0\r\nHost: localhost\r\nEncapsulated: null-body=0\r\n\r\n";
        let conn = MemoryConnection::new(wire);
        let mut req = IcapRequest::new(Box::new(conn));
        let config = test_config();
        let mut sent = false;
        let err = run_transaction(&mut req, "127.0.0.1:9999".parse().unwrap(), &config, &mut sent).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn parse_request_line_extracts_method_and_service() {
        let mut req = crate::protocol::request::tests_support::null_request();
        req.icap_headers.set_start_line("REQMOD icap://icap.example.net/echo?mode=fast ICAP/1.0");
        let mut config = ServerConfig::new(super::super::null_logger());
        config.register_service(Arc::new(crate::services::echo::EchoService::new()));
        parse_request_line(&mut req, &config).unwrap();
        assert_eq!(req.method, Some(IcapMethod::Reqmod));
        assert_eq!(req.service_name.as_deref(), Some("echo"));
        assert_eq!(req.attributes.get("service_args"), Some(&"mode=fast".to_string()));
    }

    #[test]
    fn parse_request_line_rejects_unknown_service() {
        let mut req = crate::protocol::request::tests_support::null_request();
        req.icap_headers.set_start_line("REQMOD icap://icap.example.net/nope ICAP/1.0");
        let config = ServerConfig::new(super::super::null_logger());
        let err = parse_request_line(&mut req, &config).unwrap_err();
        assert!(matches!(err, IcapError::NoSuchService(_)));
    }
}
