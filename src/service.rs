//! Service-facing interface (spec §6): the hooks the core invokes on a
//! pluggable adaptation service, and the descriptor fields the core
//! needs to answer OPTIONS and to negotiate preview/204/206.
//!
//! Everything under `services/` (the concrete adaptation logic) is an
//! external collaborator from the core's point of view; the core only
//! ever talks to a `dyn IcapService` through this trait.

use async_trait::async_trait;

use crate::error::IcapResult;
use crate::protocol::common::{IcapMethod, ServiceVerdict};
use crate::protocol::request::IcapRequest;

/// Static facts about a service, used to answer OPTIONS and to decide
/// preview/204/206 negotiation (spec §6 "Service descriptor fields").
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub description: String,
    pub supported_methods: Vec<IcapMethod>,
    pub istag: String,
    pub preview_size: Option<u64>,
    pub allow_204: bool,
    pub allow_206: bool,
    pub max_connections: u32,
    pub options_ttl_secs: u64,
    pub transfer_preview: Vec<String>,
    pub transfer_ignore: Vec<String>,
    pub transfer_complete: Vec<String>,
}

impl ServiceDescriptor {
    pub fn supports(&self, method: IcapMethod) -> bool {
        self.supported_methods.contains(&method)
    }
}

/// Opaque per-request state a service allocates in `init_request` and
/// gets back on every subsequent hook call for the same transaction.
pub type ServiceState = Box<dyn std::any::Any + Send>;

/// Two sub-buffers passed to [`IcapService::io`]: bytes the core has
/// decoded from the client (`read_in`) and a scratch buffer the
/// service should append its output to (`write_out`). The service may
/// consume any prefix of `read_in` (reporting how much via the return
/// value) and may leave `write_out` empty if it has nothing to emit
/// yet.
pub struct IoBuffers<'a> {
    pub read_in: &'a [u8],
    pub write_out: &'a mut Vec<u8>,
    pub client_eof: bool,
}

/// Result of one [`IcapService::io`] call: how many bytes of
/// `read_in` were consumed, and whether the service has finished
/// producing output (mirrors the `EOF` signal in spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoProgress {
    pub consumed: usize,
    pub output_eof: bool,
}

#[async_trait]
pub trait IcapService: Send + Sync {
    fn descriptor(&self) -> &ServiceDescriptor;

    /// Materializes per-request service state (spec §6
    /// `init_request(req) → per-request state`).
    async fn init_request(&self, req: &IcapRequest) -> IcapResult<ServiceState>;

    /// Decides what to do with the preview bytes (or a "fake preview"
    /// with an empty buffer when none was advertised).
    async fn check_preview(&self, state: &mut ServiceState, buf: &[u8], req: &IcapRequest) -> IcapResult<ServiceVerdict>;

    /// Invoked repeatedly during the BODY phase; consumes from
    /// `io.read_in`, produces into `io.write_out`.
    async fn io(&self, state: &mut ServiceState, io: &mut IoBuffers<'_>, req: &IcapRequest) -> IcapResult<IoProgress>;

    /// Invoked once the decoder has reached end-of-data.
    async fn end_of_data(&self, state: &mut ServiceState, req: &IcapRequest) -> IcapResult<ServiceVerdict>;

    /// Releases whatever `init_request` allocated. Infallible by
    /// design: services should not fail to clean up.
    async fn release_request(&self, state: ServiceState, req: &IcapRequest);
}
