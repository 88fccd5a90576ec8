//! Reference pass-through service: echoes whatever body bytes it
//! receives back unchanged. Used by the S3 round-trip scenario and the
//! `demos/simple_server` example.

use async_trait::async_trait;

use crate::error::IcapResult;
use crate::protocol::common::{IcapMethod, ServiceVerdict};
use crate::protocol::request::IcapRequest;
use crate::service::{IcapService, IoBuffers, IoProgress, ServiceDescriptor, ServiceState};

pub struct EchoService {
    descriptor: ServiceDescriptor,
}

impl EchoService {
    pub fn new() -> Self {
        EchoService {
            descriptor: ServiceDescriptor {
                name: "echo".to_string(),
                description: "reflects the encapsulated body unchanged".to_string(),
                supported_methods: vec![IcapMethod::Reqmod, IcapMethod::Respmod],
                istag: "ECHO-1".to_string(),
                preview_size: Some(4096),
                allow_204: true,
                allow_206: false,
                max_connections: 1000,
                options_ttl_secs: 3600,
                transfer_preview: vec!["*".to_string()],
                transfer_ignore: Vec::new(),
                transfer_complete: Vec::new(),
            },
        }
    }
}

impl Default for EchoService {
    fn default() -> Self {
        Self::new()
    }
}

struct EchoState {
    /// Preview bytes the service has already seen; replayed into the
    /// output stream once BODY phase begins so nothing is lost.
    pending: Vec<u8>,
}

#[async_trait]
impl IcapService for EchoService {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    async fn init_request(&self, _req: &IcapRequest) -> IcapResult<ServiceState> {
        Ok(Box::new(EchoState { pending: Vec::new() }))
    }

    async fn check_preview(&self, state: &mut ServiceState, buf: &[u8], _req: &IcapRequest) -> IcapResult<ServiceVerdict> {
        let state = state.downcast_mut::<EchoState>().expect("EchoState");
        if buf.is_empty() {
            return Ok(ServiceVerdict::Allow204);
        }
        state.pending.extend_from_slice(buf);
        Ok(ServiceVerdict::Continue)
    }

    async fn io(&self, state: &mut ServiceState, io: &mut IoBuffers<'_>, _req: &IcapRequest) -> IcapResult<IoProgress> {
        let state = state.downcast_mut::<EchoState>().expect("EchoState");
        if !state.pending.is_empty() {
            io.write_out.append(&mut state.pending);
        }
        io.write_out.extend_from_slice(io.read_in);
        Ok(IoProgress { consumed: io.read_in.len(), output_eof: io.client_eof })
    }

    async fn end_of_data(&self, _state: &mut ServiceState, _req: &IcapRequest) -> IcapResult<ServiceVerdict> {
        Ok(ServiceVerdict::Done)
    }

    async fn release_request(&self, _state: ServiceState, _req: &IcapRequest) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_preview_allows_204() {
        let svc = EchoService::new();
        let req = crate::protocol::request::tests_support::null_request();
        let mut state = svc.init_request(&req).await.unwrap();
        let verdict = svc.check_preview(&mut state, &[], &req).await.unwrap();
        assert_eq!(verdict, ServiceVerdict::Allow204);
    }

    #[tokio::test]
    async fn io_echoes_pending_preview_then_stream() {
        let svc = EchoService::new();
        let req = crate::protocol::request::tests_support::null_request();
        let mut state = svc.init_request(&req).await.unwrap();
        svc.check_preview(&mut state, b"hello ", &req).await.unwrap();

        let mut out = Vec::new();
        let mut io = IoBuffers { read_in: b"world", write_out: &mut out, client_eof: true };
        let progress = svc.io(&mut state, &mut io, &req).await.unwrap();
        assert_eq!(progress.consumed, 5);
        assert!(progress.output_eof);
        assert_eq!(out, b"hello world");
    }
}
