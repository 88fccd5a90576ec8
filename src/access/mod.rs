//! Access Control & ACL matcher (C8, spec §3 "ACL spec"/"Access
//! entry", §4.8).
//!
//! Three check points consult the same ordered access-entry list
//! machinery: `check_client` (on accept), `check_request` (after
//! request headers parsed), and `check_logging` (at log time, with an
//! inverted default).

pub mod config;

use std::collections::HashMap;
use std::net::IpAddr;

use ip_network::IpNetwork;
use ip_network_table::IpNetworkTable;
use regex::Regex;

use crate::protocol::common::IcapMethod;

/// One fact the access checker can extract from a request, matched
/// against an [`AclSpec`]'s values.
#[derive(Debug, Clone)]
pub enum Datum {
    Str(String),
    Int(i64),
    Ip(IpAddr),
    DataType(u32),
}

/// Everything an [`AclSpec`] might need to read off a request in order
/// to extract its datum. Kept decoupled from [`crate::protocol::request::IcapRequest`]
/// so the access layer can be unit tested without a live connection.
#[derive(Debug, Clone, Default)]
pub struct AccessContext {
    pub username: Option<String>,
    pub service_name: Option<String>,
    pub method: Option<IcapMethod>,
    pub client_ip: Option<IpAddr>,
    pub client_port: Option<u16>,
    pub server_ip: Option<IpAddr>,
    pub server_port: Option<u16>,
    pub headers: HashMap<String, String>,
    pub data_type: Option<u32>,
    pub has_credentials: bool,
}

/// The attribute an [`AclSpec`] extracts and matches against (spec §3
/// "ACL spec": "named matcher over one of a fixed set of request
/// attributes").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclAttribute {
    User,
    Service,
    MethodKind,
    ServerPort,
    ClientIp,
    ServerIp,
    Header(String),
    DataType,
}

/// One acceptable value for an [`AclSpec`], carrying the type-specific
/// equality spec §3 requires.
#[derive(Debug, Clone)]
pub enum AclValue {
    Str(String),
    Int(i64),
    Cidr(IpNetwork),
    Regex(Regex),
    DataType(u32),
}

impl AclValue {
    fn matches(&self, datum: &Datum) -> bool {
        match (self, datum) {
            (AclValue::Str(v), Datum::Str(d)) => v.eq_ignore_ascii_case(d),
            (AclValue::Int(v), Datum::Int(d)) => v == d,
            (AclValue::Cidr(net), Datum::Ip(ip)) => net.contains(*ip),
            (AclValue::Regex(re), Datum::Str(d)) => re.is_match(d),
            (AclValue::DataType(v), Datum::DataType(d)) => v == d,
            _ => false,
        }
    }
}

/// A named matcher over one request attribute, holding a list of
/// acceptable values matched any-of (spec §3 "ACL spec").
#[derive(Debug, Clone)]
pub struct AclSpec {
    pub name: String,
    pub attribute: AclAttribute,
    pub values: Vec<AclValue>,
}

impl AclSpec {
    fn extract(&self, ctx: &AccessContext) -> Option<Datum> {
        match &self.attribute {
            AclAttribute::User => ctx.username.clone().map(Datum::Str),
            AclAttribute::Service => ctx.service_name.clone().map(Datum::Str),
            AclAttribute::MethodKind => ctx.method.map(|m| Datum::Str(m.as_str().to_string())),
            AclAttribute::ServerPort => ctx.server_port.map(|p| Datum::Int(p as i64)),
            AclAttribute::ClientIp => ctx.client_ip.map(Datum::Ip),
            AclAttribute::ServerIp => ctx.server_ip.map(Datum::Ip),
            AclAttribute::Header(name) => ctx.headers.get(name).cloned().map(Datum::Str),
            AclAttribute::DataType => ctx.data_type.map(Datum::DataType),
        }
    }

    /// True if any of this spec's acceptable values matches the datum
    /// extracted from `ctx`. A request lacking the datum entirely
    /// (e.g. no username when matching on user) never matches.
    ///
    /// IP data is matched through a [`build_cidr_table`] lookup rather
    /// than the linear `AclValue` scan the other datum kinds use,
    /// since an IP spec's whole value list is CIDR networks and a
    /// longest-match trie scales to the large network lists `acl ...
    /// srv_ip`/`client_ip` directives tend to accumulate.
    pub fn matches(&self, ctx: &AccessContext) -> bool {
        match self.extract(ctx) {
            Some(Datum::Ip(ip)) => {
                let networks: Vec<IpNetwork> =
                    self.values.iter().filter_map(|v| if let AclValue::Cidr(net) = v { Some(*net) } else { None }).collect();
                if networks.is_empty() {
                    return false;
                }
                build_cidr_table(&networks).longest_match(ip).is_some()
            }
            Some(datum) => self.values.iter().any(|v| v.matches(&datum)),
            None => false,
        }
    }
}

/// The outcome an [`AccessEntry`] produces when it matches (spec §3
/// "Access entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOutcome {
    Allow,
    Deny,
    AuthRequired,
    Log,
    NoLog,
}

/// One (spec, negated) reference inside an [`AccessEntry`].
#[derive(Debug, Clone)]
pub struct SpecRef {
    pub spec_name: String,
    pub negated: bool,
}

/// An ordered list of spec references plus the outcome it produces
/// when every reference matches (with negation applied).
#[derive(Debug, Clone)]
pub struct AccessEntry {
    pub specs: Vec<SpecRef>,
    pub outcome: AccessOutcome,
}

impl AccessEntry {
    fn matches(&self, specs_by_name: &HashMap<String, AclSpec>, ctx: &AccessContext) -> bool {
        self.specs.iter().all(|r| {
            let Some(spec) = specs_by_name.get(&r.spec_name) else {
                return false;
            };
            spec.matches(ctx) != r.negated
        })
    }
}

/// The full access-control configuration: the named spec table plus
/// the ordered entry lists for client/request checks and for the
/// separate logging chain.
#[derive(Debug, Clone, Default)]
pub struct AccessController {
    pub specs: HashMap<String, AclSpec>,
    pub access_entries: Vec<AccessEntry>,
    pub log_entries: Vec<AccessEntry>,
    pub auth_realm: String,
}

/// Result of an access check (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessVerdict {
    Allow,
    Deny,
    AuthRequired,
}

impl AccessController {
    pub fn new(auth_realm: impl Into<String>) -> Self {
        AccessController {
            specs: HashMap::new(),
            access_entries: Vec::new(),
            log_entries: Vec::new(),
            auth_realm: auth_realm.into(),
        }
    }

    fn evaluate(entries: &[AccessEntry], specs: &HashMap<String, AclSpec>, ctx: &AccessContext, default: AccessVerdict) -> AccessVerdict {
        for entry in entries {
            if entry.matches(specs, ctx) {
                return match entry.outcome {
                    AccessOutcome::Allow | AccessOutcome::NoLog => AccessVerdict::Allow,
                    AccessOutcome::Deny | AccessOutcome::Log => AccessVerdict::Deny,
                    AccessOutcome::AuthRequired => {
                        if ctx.has_credentials {
                            AccessVerdict::Allow
                        } else {
                            AccessVerdict::AuthRequired
                        }
                    }
                };
            }
        }
        default
    }

    /// Runs the client/request access chain (default `ALLOW` if no
    /// entry matches, spec §4.8).
    pub fn check(&self, ctx: &AccessContext) -> AccessVerdict {
        Self::evaluate(&self.access_entries, &self.specs, ctx, AccessVerdict::Allow)
    }

    /// Runs the logging chain (default `DENY`, i.e. "do log" — spec
    /// §4.8 notes the names are inverted because log inclusion = "deny
    /// from being skipped").
    pub fn check_logging(&self, ctx: &AccessContext) -> bool {
        matches!(Self::evaluate(&self.log_entries, &self.specs, ctx, AccessVerdict::Deny), AccessVerdict::Deny)
    }
}

/// Builds an [`IpNetworkTable`]-backed CIDR value from a `a.b.c.d/n`
/// or bare-address string (bare address is treated as a /32 or /128).
pub fn parse_cidr(s: &str) -> Result<IpNetwork, crate::error::IcapError> {
    if let Some((addr, bits)) = s.split_once('/') {
        let addr: IpAddr = addr.parse().map_err(|_| crate::error::IcapError::Config(format!("bad IP in CIDR {s:?}")))?;
        let bits: u8 = bits.parse().map_err(|_| crate::error::IcapError::Config(format!("bad prefix length in CIDR {s:?}")))?;
        IpNetwork::new(addr, bits).map_err(|_| crate::error::IcapError::Config(format!("invalid CIDR {s:?}")))
    } else {
        let addr: IpAddr = s.parse().map_err(|_| crate::error::IcapError::Config(format!("bad IP {s:?}")))?;
        IpNetwork::new(addr, if addr.is_ipv4() { 32 } else { 128 })
            .map_err(|_| crate::error::IcapError::Config(format!("invalid address {s:?}")))
    }
}

/// A CIDR lookup trie built from a set of [`AclValue::Cidr`] entries,
/// used by [`AclSpec::matches`] for `ClientIp`/`ServerIp` specs
/// instead of a linear scan.
pub fn build_cidr_table(networks: &[IpNetwork]) -> IpNetworkTable<()> {
    let mut table = IpNetworkTable::new();
    for net in networks {
        table.insert(*net, ());
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_ip(ip: &str) -> AccessContext {
        AccessContext { client_ip: Some(ip.parse().unwrap()), ..Default::default() }
    }

    #[test]
    fn cidr_spec_matches_network() {
        let spec = AclSpec {
            name: "net_x".to_string(),
            attribute: AclAttribute::ClientIp,
            values: vec![AclValue::Cidr(parse_cidr("10.0.0.0/8").unwrap())],
        };
        assert!(spec.matches(&ctx_with_ip("10.1.2.3")));
        assert!(!spec.matches(&ctx_with_ip("192.168.1.1")));
    }

    #[test]
    fn first_matching_entry_wins() {
        let mut controller = AccessController::new("test");
        controller.specs.insert(
            "net_x".to_string(),
            AclSpec {
                name: "net_x".to_string(),
                attribute: AclAttribute::ClientIp,
                values: vec![AclValue::Cidr(parse_cidr("10.0.0.0/8").unwrap())],
            },
        );
        controller.access_entries.push(AccessEntry {
            specs: vec![SpecRef { spec_name: "net_x".to_string(), negated: false }],
            outcome: AccessOutcome::Deny,
        });
        controller.access_entries.push(AccessEntry { specs: vec![], outcome: AccessOutcome::Allow });

        assert_eq!(controller.check(&ctx_with_ip("10.1.2.3")), AccessVerdict::Deny);
        assert_eq!(controller.check(&ctx_with_ip("8.8.8.8")), AccessVerdict::Allow);
    }

    #[test]
    fn auth_required_without_credentials_yields_auth_verdict() {
        let mut controller = AccessController::new("realm");
        controller.specs.insert(
            "net_x".to_string(),
            AclSpec {
                name: "net_x".to_string(),
                attribute: AclAttribute::ClientIp,
                values: vec![AclValue::Cidr(parse_cidr("10.0.0.0/8").unwrap())],
            },
        );
        controller.access_entries.push(AccessEntry {
            specs: vec![SpecRef { spec_name: "net_x".to_string(), negated: false }],
            outcome: AccessOutcome::AuthRequired,
        });

        let mut ctx = ctx_with_ip("10.1.2.3");
        assert_eq!(controller.check(&ctx), AccessVerdict::AuthRequired);
        ctx.has_credentials = true;
        assert_eq!(controller.check(&ctx), AccessVerdict::Allow);
    }

    #[test]
    fn negation_inverts_spec_result() {
        let mut controller = AccessController::new("test");
        controller.specs.insert(
            "net_x".to_string(),
            AclSpec {
                name: "net_x".to_string(),
                attribute: AclAttribute::ClientIp,
                values: vec![AclValue::Cidr(parse_cidr("10.0.0.0/8").unwrap())],
            },
        );
        controller.access_entries.push(AccessEntry {
            specs: vec![SpecRef { spec_name: "net_x".to_string(), negated: true }],
            outcome: AccessOutcome::Deny,
        });

        assert_eq!(controller.check(&ctx_with_ip("10.1.2.3")), AccessVerdict::Allow);
        assert_eq!(controller.check(&ctx_with_ip("8.8.8.8")), AccessVerdict::Deny);
    }

    #[test]
    fn logging_default_is_deny_meaning_do_log() {
        let controller = AccessController::new("test");
        assert!(controller.check_logging(&AccessContext::default()));
    }
}
