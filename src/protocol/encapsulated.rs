//! Encapsulated Frame (C4): parse/build the `Encapsulated:` header and
//! validate its shape against the ICAP method and message direction
//! (spec §4.4).

use crate::error::IcapError;
use crate::protocol::common::{EntityKind, IcapMethod};

/// One parsed `kind=offset` pair from an `Encapsulated:` header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncapsulatedEntity {
    pub kind: EntityKind,
    pub offset: u64,
}

/// The ordered entity slot array produced by parsing an
/// `Encapsulated:` header.
#[derive(Debug, Clone, Default)]
pub struct EncapsulatedList {
    entities: Vec<EncapsulatedEntity>,
}

impl EncapsulatedList {
    pub fn entities(&self) -> &[EncapsulatedEntity] {
        &self.entities
    }

    /// Parses a header value such as `"req-hdr=0, req-body=231"`.
    pub fn parse(value: &str) -> Result<Self, IcapError> {
        let mut entities = Vec::new();
        let mut last_offset = None;
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (kind_str, offset_str) = part
                .split_once('=')
                .ok_or_else(|| IcapError::protocol(format!("malformed Encapsulated entry {part:?}"), "encapsulated"))?;
            let kind: EntityKind = kind_str.trim().parse()?;
            let offset: u64 = offset_str
                .trim()
                .parse()
                .map_err(|_| IcapError::protocol(format!("non-numeric Encapsulated offset {offset_str:?}"), "encapsulated"))?;
            if let Some(prev) = last_offset {
                if offset < prev {
                    return Err(IcapError::protocol("Encapsulated offsets must be non-decreasing", "encapsulated"));
                }
            }
            last_offset = Some(offset);
            entities.push(EncapsulatedEntity { kind, offset });
        }
        if entities.is_empty() {
            return Err(IcapError::protocol("Encapsulated header has no entities", "encapsulated"));
        }
        if entities.len() > 3 {
            return Err(IcapError::protocol("Encapsulated header has more than three entities", "encapsulated"));
        }
        if !entities.last().unwrap().kind.is_body() && entities.last().unwrap().kind != EntityKind::NullBody {
            return Err(IcapError::protocol("last Encapsulated entity must be a body kind", "encapsulated"));
        }
        let list = EncapsulatedList { entities };
        Ok(list)
    }

    /// Byte length of the non-body entity at `index`, i.e. the
    /// difference between its offset and the next entity's offset.
    /// The last entity (always a body kind) has no fixed length here;
    /// its length is determined by the chunk codec.
    pub fn entity_len(&self, index: usize) -> Option<u64> {
        let this = self.entities.get(index)?;
        let next = self.entities.get(index + 1)?;
        Some(next.offset - this.offset)
    }

    pub fn has_body(&self) -> bool {
        matches!(self.entities.last(), Some(e) if e.kind.is_body())
    }

    /// Validates the entity-kind sequence against the allowed shapes
    /// for `method`/`direction` (spec §4.4). A violation is a 400-class
    /// failure.
    pub fn validate_shape(&self, method: IcapMethod, direction: MessageDirection) -> Result<(), IcapError> {
        let kinds: Vec<EntityKind> = self.entities.iter().map(|e| e.kind).collect();
        let ok = match (method, direction) {
            (IcapMethod::Options, _) => matches!(kinds.as_slice(), [EntityKind::OptBody] | [EntityKind::NullBody]),
            (IcapMethod::Reqmod, MessageDirection::Request) => matches!(
                kinds.as_slice(),
                [EntityKind::ReqBody]
                    | [EntityKind::NullBody]
                    | [EntityKind::ReqHdr, EntityKind::ReqBody]
                    | [EntityKind::ReqHdr, EntityKind::NullBody]
            ),
            (IcapMethod::Reqmod, MessageDirection::Response) => matches!(
                kinds.as_slice(),
                [EntityKind::ReqBody]
                    | [EntityKind::NullBody]
                    | [EntityKind::ReqHdr, EntityKind::ReqBody]
                    | [EntityKind::ReqHdr, EntityKind::NullBody]
                    | [EntityKind::ResBody]
                    | [EntityKind::ResHdr, EntityKind::ResBody]
                    | [EntityKind::ResHdr, EntityKind::NullBody]
            ),
            (IcapMethod::Respmod, MessageDirection::Request) => matches!(
                kinds.as_slice(),
                [EntityKind::ResBody]
                    | [EntityKind::NullBody]
                    | [EntityKind::ResHdr, EntityKind::ResBody]
                    | [EntityKind::ResHdr, EntityKind::NullBody]
                    | [EntityKind::ReqHdr, EntityKind::ResBody]
                    | [EntityKind::ReqHdr, EntityKind::NullBody]
                    | [EntityKind::ReqHdr, EntityKind::ResHdr, EntityKind::ResBody]
                    | [EntityKind::ReqHdr, EntityKind::ResHdr, EntityKind::NullBody]
            ),
            (IcapMethod::Respmod, MessageDirection::Response) => matches!(
                kinds.as_slice(),
                [EntityKind::ResBody]
                    | [EntityKind::NullBody]
                    | [EntityKind::ResHdr, EntityKind::ResBody]
                    | [EntityKind::ResHdr, EntityKind::NullBody]
            ),
        };
        if ok {
            Ok(())
        } else {
            Err(IcapError::protocol(
                format!("Encapsulated shape {kinds:?} is invalid for {method} {direction:?}"),
                "encapsulated",
            ))
        }
    }

    /// Builds the `Encapsulated:` header value (without the header
    /// name, leading `Encapsulated: `, or trailing CRLF — callers
    /// append this into their header list via
    /// [`crate::protocol::headers::HeaderList::add`]).
    pub fn build(entities: &[EncapsulatedEntity]) -> String {
        entities
            .iter()
            .map(|e| format!("{}={}", e.kind, e.offset))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn from_entities(entities: Vec<EncapsulatedEntity>) -> Self {
        EncapsulatedList { entities }
    }
}

/// Whether an encapsulated list is being validated as the message the
/// client sent (a "request") or the message the server is sending back
/// (a "response") — the two directions permit different shapes for
/// REQMOD/RESPMOD (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Request,
    Response,
}

/// Computes entity offsets given each header part's already-known
/// packed length, in order, with the trailing body/null-body entity
/// taking whatever offset the preceding parts sum to.
pub fn compute_offsets(parts: &[(EntityKind, Option<u64>)]) -> Vec<EncapsulatedEntity> {
    let mut offset = 0u64;
    let mut out = Vec::with_capacity(parts.len());
    for (kind, len) in parts {
        out.push(EncapsulatedEntity { kind: *kind, offset });
        if let Some(len) = len {
            offset += len;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_validates_reqmod_request_shape() {
        let list = EncapsulatedList::parse("req-hdr=0, req-body=231").unwrap();
        list.validate_shape(IcapMethod::Reqmod, MessageDirection::Request).unwrap();
        assert_eq!(list.entity_len(0), Some(231));
    }

    #[test]
    fn rejects_decreasing_offsets() {
        let err = EncapsulatedList::parse("res-body=50, req-hdr=10").unwrap_err();
        assert!(matches!(err, IcapError::Protocol { .. }));
    }

    #[test]
    fn rejects_shape_violation_for_method() {
        // res-body alone as a REQMOD request is not a valid shape.
        let list = EncapsulatedList::parse("res-body=0").unwrap();
        let err = list.validate_shape(IcapMethod::Reqmod, MessageDirection::Request).unwrap_err();
        assert!(matches!(err, IcapError::Protocol { .. }));
    }

    #[test]
    fn options_shape_is_opt_body_or_null_body() {
        let list = EncapsulatedList::parse("null-body=0").unwrap();
        list.validate_shape(IcapMethod::Options, MessageDirection::Response).unwrap();
    }

    #[test]
    fn compute_offsets_chains_header_lengths() {
        let parts = vec![
            (EntityKind::ReqHdr, Some(120)),
            (EntityKind::ReqBody, None),
        ];
        let entities = compute_offsets(&parts);
        assert_eq!(entities[0].offset, 0);
        assert_eq!(entities[1].offset, 120);
    }

    #[test]
    fn build_round_trips_through_parse() {
        let entities = vec![
            EncapsulatedEntity { kind: EntityKind::ReqHdr, offset: 0 },
            EncapsulatedEntity { kind: EntityKind::ReqBody, offset: 120 },
        ];
        let value = EncapsulatedList::build(&entities);
        let parsed = EncapsulatedList::parse(&value).unwrap();
        assert_eq!(parsed.entities(), entities.as_slice());
    }
}
