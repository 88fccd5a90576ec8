//! Client State Machine (C7): drives a client-side ICAP transaction —
//! OPTIONS discovery, REQMOD/RESPMOD with preview, and the
//! interim/final response dance (spec §4.7).
//!
//! Mirrors the server driver's shape in [`crate::server::connection`]:
//! one status enum walked by cursor-driven steps, the same chunk/
//! header/encapsulated codecs, and the same non-blocking connection
//! contract from [`crate::wire`]. Two entry points share that one
//! state machine (spec §4.7 "Both drivers share the same status
//! enum"): [`IcapClient::adapt`] loops internally on
//! [`crate::wire::Connection::wait`] until the transaction completes,
//! while [`NonBlockingAdaptation::step`] performs one non-blocking
//! unit of work per call and reports a [`NeedFlags`] bitmask for a
//! caller-owned event loop to act on before calling `step` again.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{IcapError, IcapResult};
use crate::protocol::chunked::{encode_chunk, encode_terminal, ChunkedDecoder};
use crate::protocol::common::{EntityKind, IcapMethod, StepResult};
use crate::protocol::encapsulated::{compute_offsets, EncapsulatedList, MessageDirection};
use crate::protocol::headers::HeaderList;
use crate::wire::{Connection, WaitFor};

/// Linear client-side transaction status progression (spec §4.7). The
/// header-building states (`SendIcapHeaders` through `SendEofInfo`)
/// are coalesced into a single buffered write in this implementation —
/// idiomatic Rust favors one syscall over one per logical part — but
/// kept as distinct variants so a caller inspecting
/// [`NonBlockingAdaptation::status`] sees the same progression the
/// spec names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Init,
    SendIcapHeaders,
    SendReqHeaders,
    SendResHeaders,
    SendPreviewInfo,
    SendPreview,
    SendEofInfo,
    ReadPreviewResponse,
    ProcessData,
    ProcessHeaders,
    ProcessBody,
    ProcessEof,
    Done,
}

/// Readiness bitmask the non-blocking driver reports (spec §4.7 "a
/// bitmask of `{NEEDS_READ_FROM_ICAP, NEEDS_WRITE_TO_ICAP,
/// NEEDS_READ_USER_DATA, NEEDS_WRITE_USER_DATA}`").
///
/// This implementation's [`BodySource`]/[`BodySink`] callbacks are
/// `async fn`s expected to complete each call quickly (spec §6 "the
/// service I/O hook is expected to be non-blocking"), so
/// `read_user_data`/`write_user_data` are never asserted by
/// [`NonBlockingAdaptation::step`] — they exist so the bitmask still
/// carries the same four-bit vocabulary the spec describes, for a
/// caller plugging in a genuinely backpressured source or sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NeedFlags {
    pub read_from_icap: bool,
    pub write_to_icap: bool,
    pub read_user_data: bool,
    pub write_user_data: bool,
}

impl NeedFlags {
    pub fn is_empty(&self) -> bool {
        !(self.read_from_icap || self.write_to_icap || self.read_user_data || self.write_user_data)
    }

    fn read_icap() -> Self {
        NeedFlags { read_from_icap: true, ..Default::default() }
    }

    fn write_icap() -> Self {
        NeedFlags { write_to_icap: true, ..Default::default() }
    }

    fn as_wait_for(&self) -> WaitFor {
        WaitFor { read: self.read_from_icap, write: self.write_to_icap }
    }
}

/// A readable source of HTTP body bytes the client adapts (spec §4.7
/// "a source-read callback"). `Ok(0)` signals end of body, matching
/// [`crate::service::IcapService::io`]'s `read_in` contract.
#[async_trait]
pub trait BodySource: Send {
    async fn read(&mut self, buf: &mut [u8]) -> IcapResult<usize>;
}

/// A writable destination for the adapted HTTP body (spec §4.7 "a
/// destination-write callback").
#[async_trait]
pub trait BodySink: Send {
    async fn write(&mut self, buf: &[u8]) -> IcapResult<()>;
}

/// A [`BodySource`] over an in-memory byte slice; the common case for
/// tests and small CLI clients (spec §6 lists a file or a buffered
/// HTTP object as a CLI client's body source).
pub struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        SliceSource { data, pos: 0 }
    }
}

#[async_trait]
impl<'a> BodySource for SliceSource<'a> {
    async fn read(&mut self, buf: &mut [u8]) -> IcapResult<usize> {
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// A [`BodySink`] that collects everything written into a `Vec<u8>`.
#[derive(Debug, Default)]
pub struct VecSink {
    pub buf: Vec<u8>,
}

#[async_trait]
impl BodySink for VecSink {
    async fn write(&mut self, buf: &[u8]) -> IcapResult<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }
}

/// What a service advertised in its OPTIONS response (spec §4.7
/// "OPTIONS call: ... parse preview/allow/connection advertising").
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    pub istag: Option<String>,
    pub methods: Vec<IcapMethod>,
    pub preview_size: Option<u64>,
    pub allow204: bool,
    pub allow206: bool,
    pub max_connections: Option<u32>,
    pub options_ttl_secs: Option<u64>,
    pub transfer_preview: Vec<String>,
    pub transfer_ignore: Vec<String>,
    pub transfer_complete: Vec<String>,
    pub keepalive: bool,
    pub headers: HeaderList,
}

/// One REQMOD/RESPMOD adaptation call's inputs (spec §4.7 "Adaptation
/// call: given HTTP request headers and/or HTTP response headers and a
/// source-read callback and a destination-write callback").
pub struct AdaptationRequest {
    pub service: String,
    pub method: IcapMethod,
    /// The HTTP request headers (start-line = the HTTP request-line).
    /// Required for REQMOD; optional context for RESPMOD.
    pub req_headers: Option<HeaderList>,
    /// The HTTP response headers (start-line = the HTTP status-line).
    /// Required for RESPMOD; absent for REQMOD.
    pub res_headers: Option<HeaderList>,
    pub has_body: bool,
    /// `None` means don't advertise `Preview:`. `Some(n)` negotiates an
    /// n-byte preview (spec §3 "preview size").
    pub preview_size: Option<u64>,
    pub allow204: bool,
    pub allow206: bool,
}

/// The adaptation outcome (spec §1 "100-Continue, 200-with-body,
/// 204-no-modification, 206-partial-modification"; the interim 100 is
/// consumed internally by the driver and never surfaces here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptationOutcome {
    NoModification,
    Modified,
    Partial,
    /// The remote returned a 4xx/5xx status verbatim (spec §7 "4xx/5xx
    /// (remote error — returned verbatim)"); `AdaptationResult::status`
    /// carries the exact code.
    Rejected,
}

/// Result of a completed adaptation call.
#[derive(Debug)]
pub struct AdaptationResult {
    pub status: u16,
    pub outcome: AdaptationOutcome,
    pub keepalive: bool,
    /// Modified HTTP request headers the service returned, if any
    /// (REQMOD 200/206, or a RESPMOD error-page response carrying
    /// `req-hdr`).
    pub response_req_headers: Option<HeaderList>,
    /// Modified HTTP response headers the service returned, if any.
    pub response_res_headers: Option<HeaderList>,
}

/// Knobs for building and sending the ICAP request (spec §6's CLI
/// client flags `-i server -p port`, `-x icap-header`, etc. are the
/// operator-facing form of this).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Value for the `Host:` header and the `icap://<host>/` URI
    /// authority (spec §6 "ICAP request line... URI must begin with
    /// `icap://` or `icaps://`").
    pub host: String,
    pub user_agent: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub wait_poll_ms: u64,
    /// Extra ICAP request headers (spec §6 CLI `-x icap-header`).
    pub extra_icap_headers: Vec<String>,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>) -> Self {
        ClientConfig {
            host: host.into(),
            user_agent: format!("icap-core/{}", env!("CARGO_PKG_VERSION")),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            wait_poll_ms: 1000,
            extra_icap_headers: Vec::new(),
        }
    }
}

/// Owns a connection and drives it through ICAP transactions; the
/// client-side analogue of
/// [`crate::server::connection::run_connection`], minus the
/// keep-alive/pipelining loop (an embedding caller invokes
/// [`IcapClient::options`]/[`IcapClient::adapt`] once per transaction,
/// the same way it would call the original `ci_client_*` entry points).
pub struct IcapClient {
    connection: Box<dyn Connection>,
    config: ClientConfig,
}

impl IcapClient {
    pub fn new(connection: Box<dyn Connection>, config: ClientConfig) -> Self {
        IcapClient { connection, config }
    }

    pub fn into_connection(self) -> Box<dyn Connection> {
        self.connection
    }

    /// OPTIONS call (spec §4.7 "build an OPTIONS request, send, read
    /// response headers, parse preview/allow/connection advertising,
    /// return").
    pub async fn options(&mut self, service: &str) -> IcapResult<ServiceOptions> {
        let mut headers = HeaderList::new();
        headers.set_start_line(format!("OPTIONS icap://{}/{} ICAP/1.0", self.config.host, service));
        headers.add(format!("Host: {}", self.config.host));
        headers.add(format!("User-Agent: {}", self.config.user_agent));
        headers.add("Encapsulated: null-body=0");
        for line in &self.config.extra_icap_headers {
            headers.add(line.clone());
        }

        let packed = headers.pack();
        self.connection.write_timeout(packed.as_bytes(), self.config.write_timeout).await?;

        let mut rbuf = Vec::new();
        let len = read_header_block_blocking(self.connection.as_mut(), &mut rbuf, &self.config).await?;
        let (response, _consumed) = HeaderList::unpack(&rbuf[..len])?;
        parse_options_response(response)
    }

    /// Adaptation call (spec §4.7's blocking driver): loops internally
    /// on [`Connection::wait`] and does not return until the
    /// transaction is complete.
    pub async fn adapt(&mut self, request: AdaptationRequest, source: &mut dyn BodySource, dest: &mut dyn BodySink) -> IcapResult<AdaptationResult> {
        let mut txn = ClientTransaction::new(request);
        loop {
            match txn.step(self.connection.as_mut(), &self.config, source, dest, true).await? {
                StepOutcome::Needs(needs) => {
                    let want = needs.as_wait_for();
                    if want.read || want.write {
                        let readiness = self.connection.wait(want, self.config.wait_poll_ms).await?;
                        if readiness.retry {
                            return Err(IcapError::protocol("shutdown requested", "client"));
                        }
                    }
                }
                StepOutcome::Progress => {}
                StepOutcome::Done(result) => return Ok(result),
            }
        }
    }
}

/// The non-blocking entry point (spec §4.7's "non-blocking driver that
/// returns a bitmask ... and is re-entered when the caller's event
/// loop reports readiness"). Owns the same [`ClientTransaction`] state
/// [`IcapClient::adapt`] does; [`Self::step`] performs one
/// non-blocking unit of work and returns immediately, leaving it to
/// the caller to wait for the readiness it asked for before calling it
/// again.
pub struct NonBlockingAdaptation {
    txn: ClientTransaction,
}

impl NonBlockingAdaptation {
    pub fn new(request: AdaptationRequest) -> Self {
        NonBlockingAdaptation { txn: ClientTransaction::new(request) }
    }

    pub fn status(&self) -> ClientStatus {
        self.txn.status
    }

    /// Performs one non-blocking step. Returns `Needs(flags)` if no
    /// further progress is possible until the caller's event loop
    /// observes the requested readiness and calls `step` again, or
    /// `Done(result)` once the transaction has completed.
    pub async fn step(
        &mut self,
        connection: &mut dyn Connection,
        config: &ClientConfig,
        source: &mut dyn BodySource,
        dest: &mut dyn BodySink,
    ) -> IcapResult<PollOutcome> {
        match self.txn.step(connection, config, source, dest, false).await? {
            StepOutcome::Needs(needs) => Ok(PollOutcome::Needs(needs)),
            StepOutcome::Progress => Ok(PollOutcome::Needs(NeedFlags::default())),
            StepOutcome::Done(result) => Ok(PollOutcome::Done(result)),
        }
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    Needs(NeedFlags),
    Done(AdaptationResult),
}

enum StepOutcome {
    Needs(NeedFlags),
    Progress,
    Done(AdaptationResult),
}

enum IoPoll {
    Complete,
    Pending(NeedFlags),
}

/// Whatever state follows the header/preview write, decided once in
/// [`ClientTransaction::build_request`] based on whether a preview was
/// negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextPhase {
    ReadResponse,
    StreamBody,
}

/// All per-transaction client state: request inputs, the outbound
/// write buffer, the inbound read buffer and cursor, the parsed
/// response, and the chunk decoder — the client-side analogue of
/// [`crate::protocol::request::IcapRequest`].
struct ClientTransaction {
    status: ClientStatus,
    request: AdaptationRequest,
    next_after_headers: NextPhase,

    icap_wbuf: Vec<u8>,
    icap_rbuf: Vec<u8>,
    read_cursor: usize,

    /// Every byte read from the caller's `BodySource` so far, whether
    /// during the preview or during full-body streaming — retained so
    /// a `use-original-body=N` 206 response can be spliced from
    /// whichever portion the client already has without requiring the
    /// source to be seekable (spec §4.7 "handling 206's
    /// `use-original-body=N` continuation by concatenating
    /// server-produced bytes with the client's own original source
    /// bytes from the given offset").
    sent_body: Vec<u8>,
    terminal_queued: bool,
    body_fully_sent: bool,
    expect_100: bool,

    response_status: u16,
    response_headers: HeaderList,
    response_entities: HashMap<EntityKind, HeaderList>,
    encapsulated_body_kind: Option<EntityKind>,
    chunk_decoder: ChunkedDecoder,
}

impl ClientTransaction {
    fn new(request: AdaptationRequest) -> Self {
        ClientTransaction {
            status: ClientStatus::Init,
            request,
            next_after_headers: NextPhase::ReadResponse,
            icap_wbuf: Vec::new(),
            icap_rbuf: Vec::new(),
            read_cursor: 0,
            sent_body: Vec::new(),
            terminal_queued: false,
            body_fully_sent: false,
            expect_100: false,
            response_status: 0,
            response_headers: HeaderList::new(),
            response_entities: HashMap::new(),
            encapsulated_body_kind: None,
            chunk_decoder: ChunkedDecoder::new(),
        }
    }

    /// One step of the client state machine. `block` selects whether
    /// I/O that would block loops on [`Connection::wait`] internally
    /// (the blocking driver) or returns `Needs` immediately (the
    /// non-blocking driver) — the only difference between the two
    /// entry points (spec §4.7 "Both drivers share the same status
    /// enum").
    async fn step(
        &mut self,
        conn: &mut dyn Connection,
        config: &ClientConfig,
        source: &mut dyn BodySource,
        dest: &mut dyn BodySink,
        block: bool,
    ) -> IcapResult<StepOutcome> {
        match self.status {
            ClientStatus::Init => {
                self.build_request(config, source).await?;
                self.status = ClientStatus::SendIcapHeaders;
                Ok(StepOutcome::Progress)
            }
            ClientStatus::SendIcapHeaders
            | ClientStatus::SendReqHeaders
            | ClientStatus::SendResHeaders
            | ClientStatus::SendPreviewInfo
            | ClientStatus::SendPreview
            | ClientStatus::SendEofInfo => match write_some(conn, &mut self.icap_wbuf, config, block).await? {
                IoPoll::Pending(needs) => Ok(StepOutcome::Needs(needs)),
                IoPoll::Complete => {
                    self.status = match self.next_after_headers {
                        NextPhase::ReadResponse => ClientStatus::ReadPreviewResponse,
                        NextPhase::StreamBody => ClientStatus::ProcessData,
                    };
                    Ok(StepOutcome::Progress)
                }
            },
            ClientStatus::ReadPreviewResponse => self.read_response_header(conn, config, block).await,
            ClientStatus::ProcessData => self.advance_body(conn, config, source, block).await,
            ClientStatus::ProcessHeaders => self.parse_response_entities(conn, config, block).await,
            ClientStatus::ProcessBody => self.process_body(conn, config, dest, block).await,
            ClientStatus::ProcessEof => self.finalize_body(source, dest).await,
            ClientStatus::Done => unreachable!("step called after completion"),
        }
    }

    /// `Init`: builds the full ICAP request — headers, any encapsulated
    /// HTTP header entities, and (if a preview is negotiated) the first
    /// chunked transmission of up to `preview_size` body bytes, ending
    /// with `0; ieof` if the source is already exhausted or a bare `0`
    /// otherwise (spec §4.7 "Preview handling (client side)").
    async fn build_request(&mut self, config: &ClientConfig, source: &mut dyn BodySource) -> IcapResult<()> {
        let method = self.request.method;
        let body_kind = if method == IcapMethod::Reqmod { EntityKind::ReqBody } else { EntityKind::ResBody };

        let mut parts: Vec<(EntityKind, Option<u64>)> = Vec::new();
        let mut packed_entities: Vec<String> = Vec::new();
        if let Some(rq) = &self.request.req_headers {
            let packed = rq.pack();
            parts.push((EntityKind::ReqHdr, Some(packed.len() as u64)));
            packed_entities.push(packed);
        }
        if let Some(rs) = &self.request.res_headers {
            let packed = rs.pack();
            parts.push((EntityKind::ResHdr, Some(packed.len() as u64)));
            packed_entities.push(packed);
        }
        let final_kind = if self.request.has_body { body_kind } else { EntityKind::NullBody };
        parts.push((final_kind, None));
        let entities = compute_offsets(&parts);

        let mut icap_headers = HeaderList::new();
        icap_headers.set_start_line(format!("{} icap://{}/{} ICAP/1.0", method, config.host, self.request.service));
        icap_headers.add(format!("Host: {}", config.host));
        icap_headers.add(format!("User-Agent: {}", config.user_agent));
        match (self.request.allow204, self.request.allow206) {
            (true, true) => icap_headers.add("Allow: 204, 206"),
            (true, false) => icap_headers.add("Allow: 204"),
            (false, true) => icap_headers.add("Allow: 206"),
            (false, false) => {}
        }

        let preview_size_to_send = if self.request.has_body { self.request.preview_size } else { None };
        if let Some(n) = preview_size_to_send {
            icap_headers.add(format!("Preview: {n}"));
        }
        icap_headers.add(format!("Encapsulated: {}", EncapsulatedList::build(&entities)));
        for line in &config.extra_icap_headers {
            icap_headers.add(line.clone());
        }

        let mut out = icap_headers.pack().into_bytes();
        for part in &packed_entities {
            out.extend_from_slice(part.as_bytes());
        }

        if let Some(n) = preview_size_to_send {
            let n = n as usize;
            let mut preview = vec![0u8; n];
            let mut filled = 0usize;
            let mut eof = false;
            while filled < n {
                let read = source.read(&mut preview[filled..]).await?;
                if read == 0 {
                    eof = true;
                    break;
                }
                filled += read;
            }
            preview.truncate(filled);
            if !preview.is_empty() {
                out.extend_from_slice(&encode_chunk(&preview)?);
            }
            self.sent_body.extend_from_slice(&preview);
            out.extend_from_slice(&encode_terminal(eof));
            if eof {
                self.body_fully_sent = true;
                self.terminal_queued = true;
            } else {
                self.expect_100 = true;
            }
            self.next_after_headers = NextPhase::ReadResponse;
        } else if self.request.has_body {
            // No preview negotiated: the whole body streams right
            // after the header block, with no interim 100 expected.
            self.next_after_headers = NextPhase::StreamBody;
        } else {
            self.body_fully_sent = true;
            self.terminal_queued = true;
            self.next_after_headers = NextPhase::ReadResponse;
        }

        self.icap_wbuf = out;
        Ok(())
    }

    /// `ReadPreviewResponse`: reads the ICAP status line and headers
    /// (spec §4.7's `ci_client_handle_previewed_response`). A `100`
    /// (only expected right after an un-exhausted preview) resumes body
    /// streaming; `204` ends the transaction immediately; `200`/`206`
    /// move on to parsing the encapsulated response; anything else is
    /// either a verbatim 4xx/5xx or a protocol violation.
    async fn read_response_header(&mut self, conn: &mut dyn Connection, config: &ClientConfig, block: bool) -> IcapResult<StepOutcome> {
        loop {
            if self.response_status == 0 {
                if let Some(len) = header_block_len(&self.icap_rbuf[self.read_cursor..]) {
                    let start = self.read_cursor;
                    let (headers, _) = HeaderList::unpack(&self.icap_rbuf[start..start + len])?;
                    self.read_cursor = start + len;
                    self.response_status = parse_status_code(headers.start_line().unwrap_or(""))?;
                    self.response_headers = headers;
                } else {
                    match read_some(conn, &mut self.icap_rbuf, config, block).await? {
                        IoPoll::Complete => continue,
                        IoPoll::Pending(needs) => return Ok(StepOutcome::Needs(needs)),
                    }
                }
            }
            return self.handle_response_status();
        }
    }

    fn handle_response_status(&mut self) -> IcapResult<StepOutcome> {
        match self.response_status {
            204 => Ok(StepOutcome::Done(self.finish_without_body(204, AdaptationOutcome::NoModification))),
            100 if self.expect_100 => {
                self.icap_rbuf.drain(..self.read_cursor);
                self.read_cursor = 0;
                self.response_status = 0;
                self.expect_100 = false;
                self.status = ClientStatus::ProcessData;
                Ok(StepOutcome::Progress)
            }
            200 | 206 => {
                self.status = ClientStatus::ProcessHeaders;
                Ok(StepOutcome::Progress)
            }
            s @ 400..=599 => Ok(StepOutcome::Done(self.finish_without_body(s, AdaptationOutcome::Rejected))),
            other => Err(IcapError::protocol(format!("unexpected ICAP status {other}"), "client")),
        }
    }

    fn finish_without_body(&mut self, status: u16, outcome: AdaptationOutcome) -> AdaptationResult {
        self.status = ClientStatus::Done;
        AdaptationResult {
            status,
            outcome,
            keepalive: self.response_keepalive(),
            response_req_headers: None,
            response_res_headers: None,
        }
    }

    fn response_keepalive(&self) -> bool {
        self.response_headers.search("Connection").map(|v| !v.eq_ignore_ascii_case("close")).unwrap_or(true)
    }

    /// `ProcessData`: streams the remainder of the body (spec §4.7's
    /// `CLIENT_PROCESS_DATA`) once a `100 Continue` has been seen, or
    /// immediately when no preview was negotiated at all.
    async fn advance_body(&mut self, conn: &mut dyn Connection, config: &ClientConfig, source: &mut dyn BodySource, block: bool) -> IcapResult<StepOutcome> {
        loop {
            if self.body_fully_sent {
                self.status = ClientStatus::ReadPreviewResponse;
                return Ok(StepOutcome::Progress);
            }
            if self.icap_wbuf.is_empty() {
                if self.terminal_queued {
                    self.body_fully_sent = true;
                    continue;
                }
                let mut buf = vec![0u8; 8192];
                let n = source.read(&mut buf).await?;
                if n == 0 {
                    self.icap_wbuf = encode_terminal(false);
                    self.terminal_queued = true;
                } else {
                    buf.truncate(n);
                    self.sent_body.extend_from_slice(&buf);
                    self.icap_wbuf = encode_chunk(&buf)?;
                }
                continue;
            }
            match write_some(conn, &mut self.icap_wbuf, config, block).await? {
                IoPoll::Complete => continue,
                IoPoll::Pending(needs) => return Ok(StepOutcome::Needs(needs)),
            }
        }
    }

    /// `ProcessHeaders`: parses the response's `Encapsulated:` header
    /// and reads back any header entities it names (spec §4.4's
    /// response-direction shapes).
    async fn parse_response_entities(&mut self, conn: &mut dyn Connection, config: &ClientConfig, block: bool) -> IcapResult<StepOutcome> {
        let encap_value = self.response_headers.search("Encapsulated").unwrap_or("null-body=0").to_string();
        let encapsulated = EncapsulatedList::parse(&encap_value)?;
        encapsulated.validate_shape(self.request.method, MessageDirection::Response)?;

        let entity_count = encapsulated.entities().len();
        for i in 0..entity_count.saturating_sub(1) {
            let kind = encapsulated.entities()[i].kind;
            let len = encapsulated
                .entity_len(i)
                .ok_or_else(|| IcapError::protocol("missing encapsulated entity length", "client"))? as usize;
            while self.icap_rbuf.len() - self.read_cursor < len {
                match read_some(conn, &mut self.icap_rbuf, config, block).await? {
                    IoPoll::Complete => {}
                    IoPoll::Pending(needs) => return Ok(StepOutcome::Needs(needs)),
                }
            }
            let slice = &self.icap_rbuf[self.read_cursor..self.read_cursor + len];
            let (hdrs, _) = HeaderList::unpack(slice)?;
            self.read_cursor += len;
            self.response_entities.insert(kind, hdrs);
        }

        self.encapsulated_body_kind = encapsulated.entities().last().map(|e| e.kind);
        self.icap_rbuf.drain(..self.read_cursor);
        self.read_cursor = 0;
        self.status = ClientStatus::ProcessBody;
        Ok(StepOutcome::Progress)
    }

    /// `ProcessBody`: decodes the chunked response body entity straight
    /// through to the caller's [`BodySink`] (spec §4.7's
    /// `CLIENT_PROCESS_DATA_GET_BODY`).
    async fn process_body(&mut self, conn: &mut dyn Connection, config: &ClientConfig, dest: &mut dyn BodySink, block: bool) -> IcapResult<StepOutcome> {
        if self.encapsulated_body_kind == Some(EntityKind::NullBody) {
            self.status = ClientStatus::ProcessEof;
            return Ok(StepOutcome::Progress);
        }
        loop {
            if self.chunk_decoder.eof_received {
                self.status = ClientStatus::ProcessEof;
                return Ok(StepOutcome::Progress);
            }
            if self.read_cursor >= self.icap_rbuf.len() {
                match read_some(conn, &mut self.icap_rbuf, config, block).await? {
                    IoPoll::Complete => continue,
                    IoPoll::Pending(needs) => return Ok(StepOutcome::Needs(needs)),
                }
            }
            let mut decoded = Vec::new();
            let (consumed, result) = self.chunk_decoder.decode(&self.icap_rbuf[self.read_cursor..], &mut decoded)?;
            self.read_cursor += consumed;
            if !decoded.is_empty() {
                dest.write(&decoded).await?;
            }
            if result == StepResult::Error {
                return Err(IcapError::protocol("malformed response body chunk framing", "client"));
            }
            if self.read_cursor > 0 && self.read_cursor == self.icap_rbuf.len() {
                self.icap_rbuf.clear();
                self.read_cursor = 0;
            }
        }
    }

    /// `ProcessEof`: splices in the original body for a 206's
    /// `use-original-body=N` (spec §4.7 "concatenating server-produced
    /// bytes with the client's own original source bytes from the
    /// given offset") and reports the finished transaction.
    async fn finalize_body(&mut self, source: &mut dyn BodySource, dest: &mut dyn BodySink) -> IcapResult<StepOutcome> {
        if let Some(offset) = self.chunk_decoder.use_original_body {
            self.splice_original_body(offset, source, dest).await?;
        }
        self.status = ClientStatus::Done;
        let outcome = if self.response_status == 206 { AdaptationOutcome::Partial } else { AdaptationOutcome::Modified };
        let result = AdaptationResult {
            status: self.response_status,
            outcome,
            keepalive: self.response_keepalive(),
            response_req_headers: self.response_entities.remove(&EntityKind::ReqHdr),
            response_res_headers: self.response_entities.remove(&EntityKind::ResHdr),
        };
        Ok(StepOutcome::Done(result))
    }

    async fn splice_original_body(&mut self, offset: u64, source: &mut dyn BodySource, dest: &mut dyn BodySink) -> IcapResult<()> {
        let offset = offset as usize;
        let mut skip = if offset <= self.sent_body.len() {
            dest.write(&self.sent_body[offset..]).await?;
            0
        } else {
            offset - self.sent_body.len()
        };
        loop {
            let mut buf = vec![0u8; 8192];
            let n = source.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            if n <= skip {
                skip -= n;
                continue;
            }
            dest.write(&buf[skip..n]).await?;
            skip = 0;
        }
    }
}

async fn write_some(conn: &mut dyn Connection, buf: &mut Vec<u8>, config: &ClientConfig, block: bool) -> IcapResult<IoPoll> {
    if buf.is_empty() {
        return Ok(IoPoll::Complete);
    }
    loop {
        if block {
            let readiness = conn.wait(WaitFor::write(), config.wait_poll_ms).await?;
            if readiness.retry {
                return Err(IcapError::protocol("shutdown requested", "client"));
            }
            if !readiness.writable {
                continue;
            }
        }
        match conn.try_write(buf).await? {
            Some(n) if n > 0 => {
                buf.drain(..n);
                if buf.is_empty() {
                    return Ok(IoPoll::Complete);
                }
                if !block {
                    return Ok(IoPoll::Pending(NeedFlags::write_icap()));
                }
            }
            _ => {
                if !block {
                    return Ok(IoPoll::Pending(NeedFlags::write_icap()));
                }
            }
        }
    }
}

async fn read_some(conn: &mut dyn Connection, rbuf: &mut Vec<u8>, config: &ClientConfig, block: bool) -> IcapResult<IoPoll> {
    loop {
        if block {
            let readiness = conn.wait(WaitFor::read(), config.wait_poll_ms).await?;
            if readiness.retry {
                return Err(IcapError::protocol("shutdown requested", "client"));
            }
            if !readiness.readable {
                continue;
            }
        }
        let mut tmp = [0u8; 8192];
        match conn.try_read(&mut tmp).await? {
            Some(0) => return Err(IcapError::protocol("connection closed by remote", "client")),
            Some(n) => {
                rbuf.extend_from_slice(&tmp[..n]);
                return Ok(IoPoll::Complete);
            }
            None => {
                if !block {
                    return Ok(IoPoll::Pending(NeedFlags::read_icap()));
                }
            }
        }
    }
}

async fn read_header_block_blocking(conn: &mut dyn Connection, rbuf: &mut Vec<u8>, config: &ClientConfig) -> IcapResult<usize> {
    loop {
        if let Some(len) = header_block_len(rbuf) {
            return Ok(len);
        }
        let mut tmp = [0u8; 4096];
        let n = conn.read_timeout(&mut tmp, config.read_timeout).await?;
        if n == 0 {
            return Err(IcapError::protocol("connection closed while reading header block", "client"));
        }
        rbuf.extend_from_slice(&tmp[..n]);
    }
}

fn header_block_len(buf: &[u8]) -> Option<usize> {
    memchr::memmem::find(buf, b"\r\n\r\n").map(|idx| idx + 4)
}

fn parse_status_code(start_line: &str) -> IcapResult<u16> {
    let mut parts = start_line.splitn(3, ' ');
    let _version = parts.next();
    let code = parts.next().ok_or_else(|| IcapError::protocol("missing status code in ICAP start-line", "client"))?;
    code.parse::<u16>()
        .map_err(|_| IcapError::protocol(format!("non-numeric ICAP status code {code:?}"), "client"))
}

fn parse_options_response(headers: HeaderList) -> IcapResult<ServiceOptions> {
    let status = parse_status_code(headers.start_line().unwrap_or(""))?;
    if status != 200 {
        return Err(IcapError::protocol(format!("OPTIONS failed with status {status}"), "client"));
    }
    let mut opts = ServiceOptions::default();
    opts.istag = headers.search("ISTag").map(str::to_string);
    if let Some(methods) = headers.search("Methods") {
        opts.methods = methods.split(',').filter_map(|m| m.trim().parse().ok()).collect();
    }
    if let Some(p) = headers.search("Preview") {
        opts.preview_size = p.trim().parse().ok();
    }
    if let Some(allow) = headers.search("Allow") {
        for token in allow.split(',') {
            match token.trim() {
                "204" => opts.allow204 = true,
                "206" => opts.allow206 = true,
                _ => {}
            }
        }
    }
    if let Some(mc) = headers.search("Max-Connections") {
        opts.max_connections = mc.trim().parse().ok();
    }
    if let Some(ttl) = headers.search("Options-TTL") {
        opts.options_ttl_secs = ttl.trim().parse().ok();
    }
    if let Some(tp) = headers.search("Transfer-Preview") {
        opts.transfer_preview = tp.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(ti) = headers.search("Transfer-Ignore") {
        opts.transfer_ignore = ti.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(tc) = headers.search("Transfer-Complete") {
        opts.transfer_complete = tc.split(',').map(|s| s.trim().to_string()).collect();
    }
    opts.keepalive = headers.search("Connection").map(|v| !v.eq_ignore_ascii_case("close")).unwrap_or(true);
    opts.headers = headers;
    Ok(opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Readiness;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;

    /// Scripted connection double: inbound bytes are pre-loaded (the
    /// ICAP server's canned response), outbound bytes are captured for
    /// assertions — the same shape as
    /// `crate::server::connection::tests::MemoryConnection`, mirrored
    /// for the client side of the wire.
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
        async fn read_timeout(&mut self, buf: &mut [u8], _deadline: Duration) -> std::io::Result<usize> {
            let mut inbound = self.inbound.lock().unwrap();
            let n = inbound.len().min(buf.len());
            for slot in buf.iter_mut().take(n) {
                *slot = inbound.pop_front().unwrap();
            }
            Ok(n)
        }
        async fn write_timeout(&mut self, buf: &[u8], _deadline: Duration) -> std::io::Result<()> {
            self.outbound.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }
        async fn try_read(&mut self, buf: &mut [u8]) -> std::io::Result<Option<usize>> {
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
        async fn try_write(&mut self, buf: &[u8]) -> std::io::Result<Option<usize>> {
            self.outbound.lock().unwrap().extend_from_slice(buf);
            Ok(Some(buf.len()))
        }
        async fn wait(&mut self, want: WaitFor, _timeout_ms: u64) -> std::io::Result<Readiness> {
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

    fn test_config() -> ClientConfig {
        let mut config = ClientConfig::new("icap.example.com:1344");
        config.wait_poll_ms = 10;
        config.read_timeout = Duration::from_secs(2);
        config.write_timeout = Duration::from_secs(2);
        config
    }

    fn http_request_headers() -> HeaderList {
        let mut h = HeaderList::new();
        h.set_start_line("GET /index.html HTTP/1.1");
        h.add("Host: origin.example.com");
        h
    }

    #[tokio::test]
    async fn options_parses_preview_and_allow() {
        let response = concat!(
            "ICAP/1.0 200 OK\r\n",
            "ISTag: \"abc123\"\r\n",
            "Methods: REQMOD, RESPMOD\r\n",
            "Preview: 1024\r\n",
            "Allow: 204, 206\r\n",
            "Transfer-Preview: *\r\n",
            "\r\n",
        );
        let conn: Box<dyn Connection> = Box::new(MemoryConnection::new(response.as_bytes()));
        let mut client = IcapClient::new(conn, test_config());
        let opts = client.options("echo").await.unwrap();
        assert_eq!(opts.istag.as_deref(), Some("\"abc123\""));
        assert_eq!(opts.preview_size, Some(1024));
        assert!(opts.allow204 && opts.allow206);
        assert_eq!(opts.methods, vec![IcapMethod::Reqmod, IcapMethod::Respmod]);
    }

    #[tokio::test]
    async fn reqmod_with_small_body_gets_204() {
        let response = "ICAP/1.0 204 No Modification\r\n\r\n";
        let conn: Box<dyn Connection> = Box::new(MemoryConnection::new(response.as_bytes()));
        let mut client = IcapClient::new(conn, test_config());
        let request = AdaptationRequest {
            service: "echo".to_string(),
            method: IcapMethod::Reqmod,
            req_headers: Some(http_request_headers()),
            res_headers: None,
            has_body: false,
            preview_size: None,
            allow204: true,
            allow206: false,
        };
        let mut source = SliceSource::new(b"");
        let mut dest = VecSink::default();
        let result = client.adapt(request, &mut source, &mut dest).await.unwrap();
        assert_eq!(result.status, 204);
        assert_eq!(result.outcome, AdaptationOutcome::NoModification);
        assert!(dest.buf.is_empty());
    }

    #[tokio::test]
    async fn respmod_200_streams_body_back() {
        let mut response_headers = HeaderList::new();
        response_headers.set_start_line("ICAP/1.0 200 OK");
        response_headers.add("Encapsulated: res-hdr=0, res-body=40");
        let mut res_hdr = HeaderList::new();
        res_hdr.set_start_line("HTTP/1.1 200 OK");
        res_hdr.add("Content-Type: text/plain");
        let packed_res_hdr = res_hdr.pack();
        assert_eq!(packed_res_hdr.len(), 40);

        let mut wire = response_headers.pack().into_bytes();
        wire.extend_from_slice(packed_res_hdr.as_bytes());
        wire.extend_from_slice(&encode_chunk(b"hello world").unwrap());
        wire.extend_from_slice(&encode_terminal(false));

        let conn: Box<dyn Connection> = Box::new(MemoryConnection::new(&wire));
        let mut client = IcapClient::new(conn, test_config());
        let request = AdaptationRequest {
            service: "echo".to_string(),
            method: IcapMethod::Respmod,
            req_headers: None,
            res_headers: Some({
                let mut h = HeaderList::new();
                h.set_start_line("HTTP/1.1 200 OK");
                h
            }),
            has_body: true,
            preview_size: None,
            allow204: true,
            allow206: false,
        };
        let mut source = SliceSource::new(b"hello world");
        let mut dest = VecSink::default();
        let result = client.adapt(request, &mut source, &mut dest).await.unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(result.outcome, AdaptationOutcome::Modified);
        assert_eq!(dest.buf, b"hello world");
        assert!(result.response_res_headers.is_some());
    }

    #[tokio::test]
    async fn reqmod_206_splices_original_body_after_preview() {
        let service_prefix = b"ADAPTED-";
        let mut response_headers = HeaderList::new();
        response_headers.set_start_line("ICAP/1.0 206 Partial Content");
        response_headers.add("Encapsulated: req-body=0");

        let mut wire = response_headers.pack().into_bytes();
        wire.extend_from_slice(&encode_chunk(service_prefix).unwrap());
        wire.extend_from_slice(&crate::protocol::chunked::encode_terminal_with_original_body(4));

        let conn: Box<dyn Connection> = Box::new(MemoryConnection::new(&wire));
        let mut client = IcapClient::new(conn, test_config());
        let body = b"0123456789";
        let request = AdaptationRequest {
            service: "echo".to_string(),
            method: IcapMethod::Reqmod,
            req_headers: Some(http_request_headers()),
            res_headers: None,
            has_body: true,
            preview_size: Some(4),
            allow204: true,
            allow206: true,
        };
        let mut source = SliceSource::new(body);
        let mut dest = VecSink::default();
        let result = client.adapt(request, &mut source, &mut dest).await.unwrap();
        assert_eq!(result.status, 206);
        assert_eq!(result.outcome, AdaptationOutcome::Partial);
        assert_eq!(dest.buf, b"ADAPTED-456789");
    }

    #[tokio::test]
    async fn remote_error_status_is_reported_as_rejected() {
        let response = "ICAP/1.0 403 Forbidden\r\n\r\n";
        let conn: Box<dyn Connection> = Box::new(MemoryConnection::new(response.as_bytes()));
        let mut client = IcapClient::new(conn, test_config());
        let request = AdaptationRequest {
            service: "echo".to_string(),
            method: IcapMethod::Reqmod,
            req_headers: Some(http_request_headers()),
            res_headers: None,
            has_body: false,
            preview_size: None,
            allow204: true,
            allow206: false,
        };
        let mut source = SliceSource::new(b"");
        let mut dest = VecSink::default();
        let result = client.adapt(request, &mut source, &mut dest).await.unwrap();
        assert_eq!(result.status, 403);
        assert_eq!(result.outcome, AdaptationOutcome::Rejected);
    }
}
