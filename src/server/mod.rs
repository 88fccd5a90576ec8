//! Server State Machine (C6): accepts connections and drives each one
//! through the per-transaction state progression in
//! [`connection::run_connection`] (spec §4.6).
//!
//! [`IcapServer`] owns everything a connection needs but does not own
//! itself: the service registry, the access-control chain, the
//! credential store, and the timing/behavior knobs. Connections borrow
//! this via a shared `Arc<ServerConfig>` rather than the server proper,
//! so accept and serve can run fully independently per the
//! single-threaded-per-connection model (spec §5).

pub mod connection;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use slog::{error, info, o};
use tokio::net::TcpListener;

use crate::access::AccessController;
use crate::auth::{CredentialStore, StaticCredentialStore};
use crate::error::IcapResult;
use crate::log::AccessLogger;
use crate::service::IcapService;
use crate::wire::TcpConnection;

/// Everything a connection needs to run a transaction, shared
/// read-only across every connection task.
pub struct ServerConfig {
    pub services: HashMap<String, Arc<dyn IcapService>>,
    pub default_service: Option<String>,
    pub access: AccessController,
    pub credentials: Box<dyn CredentialStore>,
    pub access_logger: Option<AccessLogger>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub keepalive_timeout: Duration,
    pub wait_poll_ms: u64,
    pub pipelining: bool,
    /// §9 Open Question: rewrite bare 204s to 200 + zero-length
    /// Encapsulated for clients that mishandle 204.
    pub allow_204_as_200_zero_encaps: bool,
    /// §4.6 "Option (a) is selectable via a configuration flag": when a
    /// service signals ALLOW_204 outside preview without 204-outside-
    /// preview negotiated and a body is present, echo the body back
    /// unchanged instead of buffering a fresh 200 response.
    pub echo_body_on_late_204: bool,
    pub max_header_block: usize,
    pub logger: slog::Logger,
}

impl ServerConfig {
    pub fn new(logger: slog::Logger) -> Self {
        ServerConfig {
            services: HashMap::new(),
            default_service: None,
            access: AccessController::new("icap"),
            credentials: Box::new(StaticCredentialStore::new()),
            access_logger: None,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(120),
            wait_poll_ms: 1000,
            pipelining: true,
            allow_204_as_200_zero_encaps: false,
            echo_body_on_late_204: true,
            max_header_block: 64 * 1024,
            logger,
        }
    }

    pub fn register_service(&mut self, service: Arc<dyn IcapService>) {
        let name = service.descriptor().name.clone();
        if self.default_service.is_none() {
            self.default_service = Some(name.clone());
        }
        self.services.insert(name, service);
    }
}

/// Listens on one TCP socket and spawns one task per accepted
/// connection, each running [`connection::run_connection`] to
/// completion.
pub struct IcapServer {
    config: Arc<ServerConfig>,
}

impl IcapServer {
    pub fn new(config: ServerConfig) -> Self {
        IcapServer { config: Arc::new(config) }
    }

    pub async fn run(&self, bind_addr: SocketAddr) -> IcapResult<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(self.config.logger, "listening"; "addr" => %bind_addr);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        let conn = TcpConnection::new(stream);
                        if let Err(e) = connection::run_connection(Box::new(conn), peer, config.clone()).await {
                            error!(config.logger, "connection ended with error"; "peer" => %peer, "error" => %e);
                        }
                    });
                }
                _ = crate::signal::wait_for_halt() => {
                    info!(self.config.logger, "halt requested, no longer accepting"; );
                    return Ok(());
                }
            }
        }
    }
}

/// Builds a discarding logger for contexts (tests, small demos) that
/// don't care about server diagnostics.
pub fn null_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, o!())
}
