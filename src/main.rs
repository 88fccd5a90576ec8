//! Thin server binary: parses [`icap_core::opts::ProcArgs`], wires up
//! an [`icap_core::server::ServerConfig`] from it, registers the bundled
//! echo service, and runs [`icap_core::server::IcapServer`] to completion.
//!
//! Everything interesting lives in the library (spec §§1-9); this
//! binary only does process-level plumbing.

use std::fs;
use std::sync::Arc;

use slog::{error, info};

use icap_core::access::config::load_into;
use icap_core::auth::StaticCredentialStore;
use icap_core::log::{build_process_logger, AccessLogger, WriterSink};
use icap_core::opts::ProcArgs;
use icap_core::server::{IcapServer, ServerConfig};
use icap_core::services::echo::EchoService;

#[tokio::main]
async fn main() {
    let args = ProcArgs::parse_args();
    let logger = build_process_logger();

    let mut config = ServerConfig::new(logger.clone());
    config.credentials = Box::new(StaticCredentialStore::new());
    config.read_timeout = std::time::Duration::from_secs(args.io_timeout_secs);
    config.write_timeout = std::time::Duration::from_secs(args.io_timeout_secs);
    config.keepalive_timeout = std::time::Duration::from_secs(args.keepalive_timeout_secs);
    config.register_service(Arc::new(EchoService::new()));

    if let Some(path) = &args.config {
        match fs::read_to_string(path) {
            Ok(source) => match load_into(&mut config.access, &source) {
                Ok(log_formats) => {
                    if let Some(log_path) = &args.access_log {
                        if let Ok(file) = fs::OpenOptions::new().create(true).append(true).open(log_path) {
                            let mut access_logger = AccessLogger::new(Box::new(WriterSink::new(file)));
                            for (name, pattern) in log_formats {
                                access_logger.register(name, pattern);
                            }
                            config.access_logger = Some(access_logger);
                        }
                    }
                }
                Err(e) => {
                    error!(logger, "failed to parse access-control config"; "path" => %path.display(), "error" => %e);
                    std::process::exit(1);
                }
            },
            Err(e) => {
                error!(logger, "failed to read access-control config"; "path" => %path.display(), "error" => %e);
                std::process::exit(1);
            }
        }
    }

    let bind_addr = match format!("{}:{}", args.host, args.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(logger, "invalid bind address"; "host" => %args.host, "port" => args.port, "error" => %e);
            std::process::exit(1);
        }
    };

    let server = IcapServer::new(config);
    info!(logger, "starting icap-core server"; "addr" => %bind_addr);
    if let Err(e) = server.run(bind_addr).await {
        error!(logger, "server exited with error"; "error" => %e);
        std::process::exit(1);
    }
}
