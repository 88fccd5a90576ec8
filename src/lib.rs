//! icap-core: an implementation of the ICAP (RFC 3507) wire protocol,
//! its chunked/preview body streaming, encapsulated HTTP framing, and
//! the access-control layer that gates requests on both the server and
//! client side.
//!
//! The crate is organized leaves-first: [`wire`] is the raw connection
//! abstraction, [`protocol`] holds the header/chunk/encapsulated/
//! request codecs, [`server`] and [`client`] drive the two
//! transaction state machines, [`access`] and [`auth`] gate entry into
//! adaptation, and [`format`] / [`filetype`] support logging and body
//! classification respectively.

#![deny(clippy::unwrap_used)]

pub mod error;
pub mod wire;

pub mod protocol {
    pub mod chunked;
    pub mod common;
    pub mod encapsulated;
    pub mod headers;
    pub mod request;
    pub mod response;
}

pub mod server;
pub mod client;

pub mod access;
pub mod auth;

pub mod format;
pub mod filetype;

pub mod service;
pub mod services {
    pub mod echo;
}

pub mod log;
pub mod signal;
pub mod stats;

pub use error::{IcapError, IcapResult};
pub use protocol::common::IcapMethod;
