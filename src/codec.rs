// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Wire encoding of [`Message`]s.
//!
//! Every message starts with a version byte and a tag byte. All integers are
//! fixed-width big-endian: site and txn ids as `i64`, list lengths as `i32`.
//! A report ends with a one-byte decision marker (`0` absent, `1` present)
//! followed, if present, by the decided survivor list; an empty decided list
//! is a legitimate decision and is distinct from no decision at all.
//!
//! Frames prefix an encoded message with its `u32` length. Encoding fails
//! rather than truncate a length that does not fit its field.

use crate::{ForwardedReport, LogicalTime, Message, Report, SiteId, TxnId, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet};
use std::convert::TryFrom;

pub const WIRE_VERSION: u8 = 1;

const TAG_REPORT: u8 = 1;
const TAG_FORWARDED: u8 = 2;
const TAG_DECISION: u8 = 3;
const TAG_HEARTBEAT: u8 = 4;

const NO_DECISION: u8 = 0;
const HAS_DECISION: u8 = 1;

const FRAME_HEADER: usize = 4;

pub fn encode(msg: &Message) -> Result<Bytes, WireError> {
    let mut buf = BytesMut::new();
    encode_into(msg, &mut buf)?;
    Ok(buf.freeze())
}

fn encode_into(msg: &Message, buf: &mut BytesMut) -> Result<(), WireError> {
    buf.put_u8(WIRE_VERSION);
    match msg {
        Message::Report(r) => {
            buf.put_u8(TAG_REPORT);
            put_report(buf, r)?;
        }
        Message::Forwarded(f) => {
            buf.put_u8(TAG_FORWARDED);
            buf.put_i64(f.reporting_hsid.0);
            put_report(buf, &f.report)?;
        }
        Message::Decision(r) => {
            buf.put_u8(TAG_DECISION);
            put_report(buf, r)?;
        }
        Message::Heartbeat { from, at } => {
            buf.put_u8(TAG_HEARTBEAT);
            buf.put_i64(from.0);
            buf.put_u64(at.0);
        }
    }
    Ok(())
}

fn put_len(buf: &mut BytesMut, n: usize) -> Result<(), WireError> {
    let n = i32::try_from(n).map_err(|_| WireError::TooLong(n))?;
    buf.put_i32(n);
    Ok(())
}

fn put_sites(buf: &mut BytesMut, sites: &BTreeSet<SiteId>) -> Result<(), WireError> {
    put_len(buf, sites.len())?;
    for s in sites {
        buf.put_i64(s.0);
    }
    Ok(())
}

fn put_report(buf: &mut BytesMut, r: &Report) -> Result<(), WireError> {
    buf.put_i64(r.reporting_site.0);
    put_sites(buf, &r.failed)?;
    put_sites(buf, &r.survivors)?;
    put_len(buf, r.safe_txn_ids.len())?;
    for (site, txn) in &r.safe_txn_ids {
        buf.put_i64(site.0);
        buf.put_i64(txn.0);
    }
    match &r.decision {
        None => buf.put_u8(NO_DECISION),
        Some(d) => {
            buf.put_u8(HAS_DECISION);
            put_sites(buf, d)?;
        }
    }
    Ok(())
}

/// Decodes one complete message. Reports are checked for internal
/// consistency; a report that contradicts itself is a decode error.
pub fn decode(mut buf: &[u8]) -> Result<Message, WireError> {
    need(&buf, 2)?;
    let version = buf.get_u8();
    if version != WIRE_VERSION {
        return Err(WireError::Version(version));
    }
    let tag = buf.get_u8();
    let msg = match tag {
        TAG_REPORT => Message::Report(get_report(&mut buf)?),
        TAG_FORWARDED => {
            need(&buf, 8)?;
            let relay = SiteId(buf.get_i64());
            Message::Forwarded(ForwardedReport::new(relay, get_report(&mut buf)?))
        }
        TAG_DECISION => {
            let r = get_report(&mut buf)?;
            if !r.is_decided() {
                return Err(WireError::Undecided);
            }
            Message::Decision(r)
        }
        TAG_HEARTBEAT => {
            need(&buf, 16)?;
            let from = SiteId(buf.get_i64());
            let at = LogicalTime(buf.get_u64());
            Message::Heartbeat { from, at }
        }
        other => return Err(WireError::Tag(other)),
    };
    if buf.has_remaining() {
        return Err(WireError::Trailing(buf.remaining()));
    }
    Ok(msg)
}

fn need(buf: &&[u8], n: usize) -> Result<(), WireError> {
    if buf.remaining() < n {
        Err(WireError::Truncated {
            needed: n - buf.remaining(),
        })
    } else {
        Ok(())
    }
}

fn get_len(buf: &mut &[u8], width: usize) -> Result<usize, WireError> {
    need(buf, 4)?;
    let n = buf.get_i32();
    if n < 0 {
        return Err(WireError::Length(n));
    }
    let n = n as usize;
    need(buf, n.saturating_mul(width))?;
    Ok(n)
}

fn get_sites(buf: &mut &[u8]) -> Result<BTreeSet<SiteId>, WireError> {
    let n = get_len(buf, 8)?;
    Ok((0..n).map(|_| SiteId(buf.get_i64())).collect())
}

fn get_report(buf: &mut &[u8]) -> Result<Report, WireError> {
    need(buf, 8)?;
    let reporting_site = SiteId(buf.get_i64());
    let failed = get_sites(buf)?;
    let survivors = get_sites(buf)?;
    let n = get_len(buf, 16)?;
    let mut safe_txn_ids = BTreeMap::new();
    for _ in 0..n {
        let site = SiteId(buf.get_i64());
        let txn = TxnId(buf.get_i64());
        safe_txn_ids.insert(site, txn);
    }
    need(buf, 1)?;
    let decision = match buf.get_u8() {
        NO_DECISION => None,
        HAS_DECISION => Some(get_sites(buf)?),
        other => return Err(WireError::Marker(other)),
    };
    let report = Report {
        reporting_site,
        failed,
        survivors,
        safe_txn_ids,
        decision,
    };
    report.validate()?;
    Ok(report)
}

/// Appends `msg` to `dst` as a length-prefixed frame. Nothing is appended
/// if the message cannot be encoded.
pub fn encode_frame(msg: &Message, dst: &mut BytesMut) -> Result<(), WireError> {
    let body = encode(msg)?;
    let len = u32::try_from(body.len()).map_err(|_| WireError::TooLong(body.len()))?;
    dst.reserve(FRAME_HEADER + body.len());
    dst.put_u32(len);
    dst.put_slice(&body);
    Ok(())
}

/// Takes one frame off the front of `src` if a whole one has arrived.
///
/// Returns `Ok(None)` when more bytes are needed. A frame that decodes badly
/// is still consumed, so the caller can log the error and carry on with the
/// next one.
pub fn decode_frame(src: &mut BytesMut, max_frame_len: usize) -> Result<Option<Message>, WireError> {
    if src.len() < FRAME_HEADER {
        return Ok(None);
    }
    let mut header = &src[..FRAME_HEADER];
    let len = header.get_u32() as usize;
    if len > max_frame_len {
        return Err(WireError::Oversized {
            len,
            max: max_frame_len,
        });
    }
    if src.len() < FRAME_HEADER + len {
        src.reserve(FRAME_HEADER + len - src.len());
        return Ok(None);
    }
    src.advance(FRAME_HEADER);
    let frame = src.split_to(len);
    decode(&frame).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sites(ids: &[i64]) -> BTreeSet<SiteId> {
        ids.iter().map(|i| SiteId(*i)).collect()
    }

    fn report() -> Report {
        let mut marks = BTreeMap::new();
        marks.insert(SiteId(3), TxnId(110));
        Report::new(SiteId(5), &sites(&[1, 2, 3, 4, 5]), sites(&[3]), marks)
    }

    #[test]
    fn forwarded_report_survives_the_wire() {
        let msg = Message::Forwarded(ForwardedReport::new(SiteId(2), report()));
        assert_eq!(decode(&encode(&msg).unwrap()), Ok(msg));
    }

    #[test]
    fn empty_decision_is_not_absent_decision() {
        let mut r = Report::new(SiteId(1), &sites(&[1]), BTreeSet::new(), BTreeMap::new());
        r.decision = Some(BTreeSet::new());
        let decided = Message::Decision(r.clone());
        let bytes = encode(&decided).unwrap();
        assert_eq!(decode(&bytes), Ok(decided));

        r.decision = None;
        let undecided = encode(&Message::Report(r)).unwrap();
        assert_ne!(bytes, undecided);
        // Same body apart from the trailing marker and empty list length.
        assert_eq!(undecided.len() + 4, bytes.len());
    }

    #[test]
    fn rejects_unknown_version_and_tag() {
        let mut bytes = encode(&Message::Report(report())).unwrap().to_vec();
        bytes[0] = 9;
        assert_eq!(decode(&bytes), Err(WireError::Version(9)));
        bytes[0] = WIRE_VERSION;
        bytes[1] = 77;
        assert_eq!(decode(&bytes), Err(WireError::Tag(77)));
    }

    #[test]
    fn rejects_truncated_and_trailing_input() {
        let bytes = encode(&Message::Report(report())).unwrap();
        let short = &bytes[..bytes.len() - 3];
        assert!(matches!(decode(short), Err(WireError::Truncated { .. })));

        let mut long = bytes.to_vec();
        long.push(0);
        assert_eq!(decode(&long), Err(WireError::Trailing(1)));
    }

    #[test]
    fn rejects_self_contradictory_partition() {
        let mut r = report();
        r.survivors.insert(SiteId(3));
        let bytes = encode(&Message::Report(r)).unwrap();
        assert_eq!(
            decode(&bytes),
            Err(WireError::Report(crate::ReportError::Overlap(SiteId(3))))
        );
    }

    #[test]
    fn decision_tag_requires_decision() {
        let bytes = encode(&Message::Decision(report())).unwrap();
        assert_eq!(decode(&bytes), Err(WireError::Undecided));
    }

    #[test]
    fn frames_split_and_reassemble() {
        let a = Message::Report(report());
        let b = Message::Heartbeat {
            from: SiteId(4),
            at: LogicalTime(12),
        };
        let mut wire = BytesMut::new();
        encode_frame(&a, &mut wire).unwrap();
        encode_frame(&b, &mut wire).unwrap();

        let mut rx = BytesMut::new();
        rx.extend_from_slice(&wire[..3]);
        assert_eq!(decode_frame(&mut rx, 1 << 20), Ok(None));
        rx.extend_from_slice(&wire[3..]);
        assert_eq!(decode_frame(&mut rx, 1 << 20), Ok(Some(a)));
        assert_eq!(decode_frame(&mut rx, 1 << 20), Ok(Some(b)));
        assert_eq!(decode_frame(&mut rx, 1 << 20), Ok(None));
    }

    #[test]
    fn oversized_frames_are_refused() {
        let mut wire = BytesMut::new();
        encode_frame(&Message::Report(report()), &mut wire).unwrap();
        assert!(matches!(
            decode_frame(&mut wire, 8),
            Err(WireError::Oversized { max: 8, .. })
        ));
    }

    #[test]
    fn lengths_past_the_field_width_are_refused() {
        let mut buf = BytesMut::new();
        let too_many = i32::MAX as usize + 1;
        assert_eq!(put_len(&mut buf, too_many), Err(WireError::TooLong(too_many)));
        assert!(buf.is_empty());
        assert_eq!(put_len(&mut buf, 3), Ok(()));
        assert_eq!(&buf[..], &[0u8, 0, 0, 3][..]);
    }
}
