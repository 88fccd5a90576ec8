//! Common types shared across the protocol codecs: the ICAP method,
//! encapsulated entity kind, and the server-side transaction status
//! enum (spec §4.6 lists the state progression this enum encodes).

use std::fmt;
use std::str::FromStr;

use crate::error::IcapError;

/// The three ICAP methods (spec §1, §4.6 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IcapMethod {
    Options,
    Reqmod,
    Respmod,
}

impl IcapMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            IcapMethod::Options => "OPTIONS",
            IcapMethod::Reqmod => "REQMOD",
            IcapMethod::Respmod => "RESPMOD",
        }
    }
}

impl fmt::Display for IcapMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IcapMethod {
    type Err = IcapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPTIONS" => Ok(IcapMethod::Options),
            "REQMOD" => Ok(IcapMethod::Reqmod),
            "RESPMOD" => Ok(IcapMethod::Respmod),
            other => Err(IcapError::protocol(format!("unknown ICAP method {other:?}"), "request-line")),
        }
    }
}

/// Tagged variant over the encapsulated entity kinds (spec §3
/// "Encapsulated entity", §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    ReqHdr,
    ResHdr,
    ReqBody,
    ResBody,
    OptBody,
    NullBody,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::ReqHdr => "req-hdr",
            EntityKind::ResHdr => "res-hdr",
            EntityKind::ReqBody => "req-body",
            EntityKind::ResBody => "res-body",
            EntityKind::OptBody => "opt-body",
            EntityKind::NullBody => "null-body",
        }
    }

    pub fn is_header(&self) -> bool {
        matches!(self, EntityKind::ReqHdr | EntityKind::ResHdr)
    }

    pub fn is_body(&self) -> bool {
        matches!(self, EntityKind::ReqBody | EntityKind::ResBody | EntityKind::OptBody)
    }
}

impl FromStr for EntityKind {
    type Err = IcapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "req-hdr" => Ok(EntityKind::ReqHdr),
            "res-hdr" => Ok(EntityKind::ResHdr),
            "req-body" => Ok(EntityKind::ReqBody),
            "res-body" => Ok(EntityKind::ResBody),
            "opt-body" => Ok(EntityKind::OptBody),
            "null-body" => Ok(EntityKind::NullBody),
            other => Err(IcapError::protocol(format!("unknown encapsulated entity kind {other:?}"), "encapsulated")),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side transaction status (spec §4.6). Progresses linearly
/// except for the branch at `AccessCheck`/`Preview` and the loop back
/// to `ReadIcapHeader` on pipelined keep-alive reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    ReadIcapHeader,
    ParseRequestLine,
    ParseHeaders,
    ReadEncapsHeaders,
    AccessCheck,
    CallServiceInit,
    Preview,
    Body,
    EndOfData,
    Responding,
    Done,
}

/// Outcome of a single state-machine step, matching the small integer
/// outcomes in spec §4.3/§7 ("OK / NEEDS_MORE / EOF / ERROR").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Ok,
    NeedsMore,
    Eof,
    Error,
}

/// Outcome of a service's `check_preview` or `end_of_data` hook
/// (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceVerdict {
    Continue,
    Done,
    Allow204,
    Allow206,
    Error,
}
