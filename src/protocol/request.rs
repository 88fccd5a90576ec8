//! Request State (C5): owns all per-transaction state, buffers,
//! entities, and counters for one ICAP transaction (spec §3 "Request",
//! §4.5).

use std::collections::HashMap;

use crate::protocol::chunked::ChunkedDecoder;
use crate::protocol::common::{EntityKind, IcapMethod, TransactionStatus};
use crate::protocol::encapsulated::EncapsulatedList;
use crate::protocol::headers::HeaderList;
use crate::wire::Connection;

/// Flags tracked across a transaction's lifetime (spec §3).
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestFlags {
    pub hasbody: bool,
    pub keepalive: bool,
    pub allow204: bool,
    pub allow206: bool,
    pub eof_received: bool,
    pub eof_sent: bool,
    /// Cleared once the service has unlocked emission of response
    /// headers/body (spec §4.6 BODY phase).
    pub data_locked: bool,
    pub packed: bool,
}

/// Byte counters, reset every transaction (spec §3, invariant: body
/// counters count only decoded body payload).
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestCounters {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub http_bytes_in: u64,
    pub http_bytes_out: u64,
    pub body_bytes_in: u64,
    pub body_bytes_out: u64,
}

/// A small per-connection recycle pool for encapsulated entity header
/// lists, keyed by entity kind, so pipelined transactions on the same
/// connection avoid reallocating header storage (spec §4.5 "Entity
/// recycle").
#[derive(Debug, Default)]
pub struct EntityRecyclePool {
    parked: HashMap<EntityKind, HeaderList>,
}

impl EntityRecyclePool {
    pub fn take(&mut self, kind: EntityKind) -> HeaderList {
        self.parked.remove(&kind).unwrap_or_default()
    }

    pub fn park(&mut self, kind: EntityKind, mut list: HeaderList) {
        list.reset();
        self.parked.insert(kind, list);
    }
}

/// Owns everything associated with one ICAP transaction: the
/// connection, header lists, encapsulated entity state, chunk decoder,
/// flags, counters, and service-visible attributes.
pub struct IcapRequest {
    pub connection: Box<dyn Connection>,

    /// The ICAP request header list as read off the wire (start-line
    /// is the request-line).
    pub icap_headers: HeaderList,
    /// The ICAP response header list being built for this transaction.
    pub icap_response_headers: HeaderList,

    /// Encapsulated header entities (req-hdr/res-hdr), keyed by kind.
    pub encapsulated_headers: HashMap<EntityKind, HeaderList>,
    /// The parsed `Encapsulated:` entity slot array.
    pub encapsulated: Option<EncapsulatedList>,

    pub recycle_pool: EntityRecyclePool,

    /// Bytes read from the connection that have not yet been consumed
    /// by a parsing step (carries pipelined bytes across resets).
    pub read_buf: Vec<u8>,

    pub chunk_decoder: ChunkedDecoder,

    pub flags: RequestFlags,
    pub counters: RequestCounters,
    pub status: TransactionStatus,

    /// `None` = no preview advertised, `Some(0)` = empty preview,
    /// `Some(n)` = first `n` decoded body bytes.
    pub preview_size: Option<u64>,

    /// The adaptation outcome code used to build the ICAP status line.
    pub return_code: u16,

    pub attributes: HashMap<String, String>,
    pub log_format_override: Option<String>,

    /// 206 `use-original-body` offset, set once a service decides to
    /// short-circuit with a partial body.
    pub use_original_body_offset: Option<u64>,

    pub method: Option<IcapMethod>,
    pub service_name: Option<String>,
}

impl IcapRequest {
    pub fn new(connection: Box<dyn Connection>) -> Self {
        IcapRequest {
            connection,
            icap_headers: HeaderList::new(),
            icap_response_headers: HeaderList::new(),
            encapsulated_headers: HashMap::new(),
            encapsulated: None,
            recycle_pool: EntityRecyclePool::default(),
            read_buf: Vec::new(),
            chunk_decoder: ChunkedDecoder::new(),
            flags: RequestFlags::default(),
            counters: RequestCounters::default(),
            status: TransactionStatus::ReadIcapHeader,
            preview_size: None,
            return_code: 0,
            attributes: HashMap::new(),
            log_format_override: None,
            use_original_body_offset: None,
            method: None,
            service_name: None,
        }
    }

    /// Resets everything except the connection and the access-check
    /// verdict carried in `attributes["access_verdict"]`, for
    /// keep-alive reuse (spec §4.5). Any unparsed prefix bytes already
    /// in `read_buf` are preserved (pipelining).
    pub fn reset_for_keepalive(&mut self) {
        let verdict = self.attributes.remove("access_verdict");

        for (kind, list) in self.encapsulated_headers.drain() {
            self.recycle_pool.park(kind, list);
        }
        self.icap_headers.reset();
        self.icap_response_headers.reset();
        self.encapsulated = None;
        self.chunk_decoder = ChunkedDecoder::new();
        self.flags = RequestFlags::default();
        self.counters = RequestCounters::default();
        self.status = TransactionStatus::ReadIcapHeader;
        self.preview_size = None;
        self.return_code = 0;
        self.attributes.clear();
        if let Some(v) = verdict {
            self.attributes.insert("access_verdict".to_string(), v);
        }
        self.log_format_override = None;
        self.use_original_body_offset = None;
        self.method = None;
        self.service_name = None;
        // read_buf is deliberately left untouched: it may hold the
        // start of the next pipelined request.
    }
}

/// Test-only support shared across the crate: a `Connection` that
/// never produces or accepts bytes, for unit tests that need an
/// `IcapRequest` but don't exercise the wire.
#[cfg(test)]
pub mod tests_support {
    use super::IcapRequest;
    use crate::wire::{Connection, Readiness, WaitFor};
    use async_trait::async_trait;
    use std::io;
    use std::net::SocketAddr;
    use std::time::Duration;

    pub struct NullConnection;

    #[async_trait]
    impl Connection for NullConnection {
        async fn read_timeout(&mut self, _buf: &mut [u8], _deadline: Duration) -> io::Result<usize> {
            Ok(0)
        }
        async fn write_timeout(&mut self, _buf: &[u8], _deadline: Duration) -> io::Result<()> {
            Ok(())
        }
        async fn try_read(&mut self, _buf: &mut [u8]) -> io::Result<Option<usize>> {
            Ok(None)
        }
        async fn try_write(&mut self, _buf: &[u8]) -> io::Result<Option<usize>> {
            Ok(None)
        }
        async fn wait(&mut self, _want: WaitFor, _timeout_ms: u64) -> io::Result<Readiness> {
            Ok(Readiness::none())
        }
        async fn close_hard(&mut self) {}
        async fn close_linger(&mut self) {}
        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    pub fn null_request() -> IcapRequest {
        IcapRequest::new(Box::new(NullConnection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tests_support::NullConnection;

    #[test]
    fn reset_preserves_access_verdict_and_pipelined_bytes() {
        let mut req = IcapRequest::new(Box::new(NullConnection));
        req.attributes.insert("access_verdict".to_string(), "allow".to_string());
        req.attributes.insert("scratch".to_string(), "gone".to_string());
        req.read_buf.extend_from_slice(b"OPTIONS icap://h/s ICAP/1.0\r\n");
        req.flags.keepalive = true;
        req.counters.bytes_in = 500;

        req.reset_for_keepalive();

        assert_eq!(req.attributes.get("access_verdict"), Some(&"allow".to_string()));
        assert!(!req.attributes.contains_key("scratch"));
        assert_eq!(req.read_buf, b"OPTIONS icap://h/s ICAP/1.0\r\n");
        assert_eq!(req.counters.bytes_in, 0);
        assert_eq!(req.status, TransactionStatus::ReadIcapHeader);
    }

    #[test]
    fn entity_recycle_pool_reuses_parked_lists() {
        let mut pool = EntityRecyclePool::default();
        let mut list = HeaderList::new();
        list.set_start_line("req-hdr");
        list.add("X-Foo: 1");
        pool.park(EntityKind::ReqHdr, list);

        let reused = pool.take(EntityKind::ReqHdr);
        assert!(reused.is_empty());
    }
}
