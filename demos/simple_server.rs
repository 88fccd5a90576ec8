//! Minimal ICAP server wiring example.
//!
//! Registers the bundled echo service and serves REQMOD/RESPMOD/OPTIONS
//! on 127.0.0.1:1344 until interrupted.

use std::sync::Arc;

use icap_core::log::build_process_logger;
use icap_core::server::{IcapServer, ServerConfig};
use icap_core::services::echo::EchoService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let logger = build_process_logger();
    let mut config = ServerConfig::new(logger);
    config.register_service(Arc::new(EchoService::new()));

    let server = IcapServer::new(config);
    let addr = "127.0.0.1:1344".parse()?;

    println!("icap-core example server listening on {addr}");
    println!("Try: OPTIONS icap://127.0.0.1:1344/echo ICAP/1.0");
    println!("Press Ctrl+C to stop");

    server.run(addr).await?;
    Ok(())
}
