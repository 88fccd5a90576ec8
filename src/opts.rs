//! Command-line arguments for the server binary: network bind
//! address/port, timeouts, an optional access-control directive file
//! (spec §6), and the access-log destination — everything
//! [`crate::server::ServerConfig`] needs, parsed with `clap` the way
//! the teacher's own `opts.rs` does.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "icap-core", version, about = "ICAP (RFC 3507) adaptation server")]
pub struct ProcArgs {
    /// Address to bind the ICAP listener to.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the ICAP listener to.
    #[arg(short = 'p', long, default_value_t = 1344)]
    pub port: u16,

    /// Access-control directive file (`acl`/`icap_access`/`LogFormat`
    /// lines, spec §6). If omitted the server allows everything.
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Where to write one line per ICAP transaction (spec §4.9). If
    /// omitted, access logging is disabled.
    #[arg(long, value_name = "FILE")]
    pub access_log: Option<PathBuf>,

    /// Per-I/O-operation timeout in seconds.
    #[arg(long, default_value_t = 30)]
    pub io_timeout_secs: u64,

    /// Idle-keepalive timeout in seconds before a connection is closed.
    #[arg(long, default_value_t = 120)]
    pub keepalive_timeout_secs: u64,
}

impl ProcArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
