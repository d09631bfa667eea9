//! Typed decoding of universal primitive values.

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone};

use crate::common::TagClass;
use crate::error::DecodeError;
use crate::structure::{StructureTag, PL};
use crate::universal::Types;

/// Decoded universal primitive.
#[derive(Clone, Debug, PartialEq)]
pub enum Value<'a> {
    Boolean(bool),
    Integer(i64),
    Enumerated(i64),
    OctetString(&'a [u8]),
    Null,
    Oid(String),
    Time(DateTime<FixedOffset>),
    /// Character strings and anything else left as raw octets.
    Raw(&'a [u8]),
    Constructed(&'a [StructureTag]),
}

impl StructureTag {
    /// Interpret the value according to its class and tag.
    ///
    /// Only universal primitives are given a typed meaning; values of other classes
    /// are returned as raw octets, since their meaning depends on the enclosing context.
    pub fn value(&self) -> Result<Value<'_>, DecodeError> {
        let bytes = match self.payload {
            PL::C(ref c) => return Ok(Value::Constructed(c)),
            PL::P(ref p) => p.as_slice(),
        };
        if self.class != TagClass::Universal {
            return Ok(Value::Raw(bytes));
        }
        Ok(match self.id {
            id if id == Types::Boolean as u64 => Value::Boolean(decode_boolean(bytes)?),
            id if id == Types::Integer as u64 => Value::Integer(decode_integer(bytes)?),
            id if id == Types::Enumerated as u64 => Value::Enumerated(decode_integer(bytes)?),
            id if id == Types::OctetString as u64 => Value::OctetString(bytes),
            id if id == Types::Null as u64 => {
                if !bytes.is_empty() {
                    return Err(DecodeError::InvalidContent("null"));
                }
                Value::Null
            }
            id if id == Types::ObjectIdentifier as u64 => Value::Oid(decode_oid(bytes)?),
            id if id == Types::GeneralizedTime as u64 => {
                Value::Time(decode_generalized_time(bytes)?)
            }
            id if id == Types::UTCTime as u64 => Value::Time(decode_utc_time(bytes)?),
            _ => Value::Raw(bytes),
        })
    }
}

/// Signed two's-complement big-endian integer.
///
/// Redundant sign-extension octets are accepted beyond eight bytes.
pub fn decode_integer(bytes: &[u8]) -> Result<i64, DecodeError> {
    let (first, _) = bytes
        .split_first()
        .ok_or(DecodeError::InvalidContent("integer"))?;
    let negative = first & 0x80 != 0;
    let fill = if negative { 0xFF } else { 0x00 };
    let mut start = 0;
    while bytes.len() - start > 8 {
        if bytes[start] != fill {
            return Err(DecodeError::IntegerOverflow);
        }
        start += 1;
    }
    let significant = &bytes[start..];
    if (significant[0] & 0x80 != 0) != negative {
        return Err(DecodeError::IntegerOverflow);
    }
    let mut acc: i64 = if negative { -1 } else { 0 };
    for &b in significant {
        acc = (acc << 8) | i64::from(b);
    }
    Ok(acc)
}

/// Boolean: exactly one octet, zero is false.
pub fn decode_boolean(bytes: &[u8]) -> Result<bool, DecodeError> {
    match bytes {
        [b] => Ok(*b != 0),
        _ => Err(DecodeError::InvalidContent("boolean")),
    }
}

/// Object identifier in dotted-decimal form.
pub fn decode_oid(bytes: &[u8]) -> Result<String, DecodeError> {
    if bytes.is_empty() || bytes[bytes.len() - 1] & 0x80 != 0 {
        return Err(DecodeError::InvalidContent("object identifier"));
    }
    let mut arcs: Vec<u64> = Vec::new();
    let mut acc = 0u64;
    for &b in bytes {
        if acc >> 57 != 0 {
            return Err(DecodeError::InvalidContent("object identifier"));
        }
        acc = (acc << 7) | u64::from(b & 0x7F);
        if b & 0x80 == 0 {
            if arcs.is_empty() {
                let top = (acc / 40).min(2);
                arcs.push(top);
                arcs.push(acc - top * 40);
            } else {
                arcs.push(acc);
            }
            acc = 0;
        }
    }
    Ok(arcs
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("."))
}

struct TimeCursor<'a> {
    s: &'a [u8],
    pos: usize,
}

impl TimeCursor<'_> {
    fn digits(&mut self, n: usize) -> Option<u32> {
        let chunk = self.s.get(self.pos..self.pos + n)?;
        if !chunk.iter().all(u8::is_ascii_digit) {
            return None;
        }
        self.pos += n;
        Some(chunk.iter().fold(0, |acc, d| acc * 10 + u32::from(d - b'0')))
    }

    fn peek_digit(&self) -> bool {
        self.s.get(self.pos).is_some_and(u8::is_ascii_digit)
    }

    fn fraction_nanos(&mut self) -> Option<u32> {
        match self.s.get(self.pos) {
            Some(b'.') | Some(b',') => self.pos += 1,
            _ => return Some(0),
        }
        let start = self.pos;
        while self.peek_digit() {
            self.pos += 1;
        }
        let frac = &self.s[start..self.pos];
        if frac.is_empty() {
            return None;
        }
        let mut nanos = 0u32;
        for i in 0..9 {
            nanos = nanos * 10 + frac.get(i).map_or(0, |d| u32::from(d - b'0'));
        }
        Some(nanos)
    }

    // Missing zone designator is taken as UTC.
    fn offset(&mut self) -> Option<FixedOffset> {
        let sign = match self.s.get(self.pos) {
            None => return FixedOffset::east_opt(0),
            Some(b'Z') => {
                self.pos += 1;
                return FixedOffset::east_opt(0);
            }
            Some(b'+') => 1,
            Some(b'-') => -1,
            Some(_) => return None,
        };
        self.pos += 1;
        let hh = self.digits(2)? as i32;
        let mm = if self.peek_digit() { self.digits(2)? as i32 } else { 0 };
        FixedOffset::east_opt(sign * (hh * 3600 + mm * 60))
    }

    fn at_end(&self) -> bool {
        self.pos == self.s.len()
    }
}

fn assemble(
    year: i32,
    month: u32,
    day: u32,
    (h, m, s, nanos): (u32, u32, u32, u32),
    offset: FixedOffset,
) -> Option<DateTime<FixedOffset>> {
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_nano_opt(h, m, s, nanos)?;
    offset.from_local_datetime(&naive).single()
}

fn generalized(c: &mut TimeCursor) -> Option<DateTime<FixedOffset>> {
    let year = c.digits(4)? as i32;
    let month = c.digits(2)?;
    let day = c.digits(2)?;
    let hour = c.digits(2)?;
    let (mut min, mut sec) = (0, 0);
    if c.peek_digit() {
        min = c.digits(2)?;
        if c.peek_digit() {
            sec = c.digits(2)?;
        }
    }
    let nanos = c.fraction_nanos()?;
    let offset = c.offset()?;
    if !c.at_end() {
        return None;
    }
    assemble(year, month, day, (hour, min, sec, nanos), offset)
}

fn utc(c: &mut TimeCursor) -> Option<DateTime<FixedOffset>> {
    let yy = c.digits(2)? as i32;
    let year = if yy < 50 { 2000 + yy } else { 1900 + yy };
    let month = c.digits(2)?;
    let day = c.digits(2)?;
    let hour = c.digits(2)?;
    let min = c.digits(2)?;
    let sec = if c.peek_digit() { c.digits(2)? } else { 0 };
    // UTCTime requires a zone designator.
    if c.at_end() {
        return None;
    }
    let offset = c.offset()?;
    if !c.at_end() {
        return None;
    }
    assemble(year, month, day, (hour, min, sec, 0), offset)
}

/// GeneralizedTime: `YYYYMMDDHH[MM[SS[.fff]]][Z|+hhmm|-hhmm]`.
pub fn decode_generalized_time(bytes: &[u8]) -> Result<DateTime<FixedOffset>, DecodeError> {
    generalized(&mut TimeCursor { s: bytes, pos: 0 })
        .ok_or(DecodeError::InvalidContent("generalized time"))
}

/// UTCTime: `YYMMDDhhmm[ss](Z|+hhmm|-hhmm)`, two-digit years below 50 are in the 2000s.
pub fn decode_utc_time(bytes: &[u8]) -> Result<DateTime<FixedOffset>, DecodeError> {
    utc(&mut TimeCursor { s: bytes, pos: 0 }).ok_or(DecodeError::InvalidContent("utc time"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn integers() {
        assert_eq!(decode_integer(&[0x00]), Ok(0));
        assert_eq!(decode_integer(&[0x7f]), Ok(127));
        assert_eq!(decode_integer(&[0x00, 0x80]), Ok(128));
        assert_eq!(decode_integer(&[0x80]), Ok(-128));
        assert_eq!(decode_integer(&[0xff, 0x7f]), Ok(-129));
        assert_eq!(decode_integer(&[0xff]), Ok(-1));
        assert_eq!(
            decode_integer(&[0x00, 0x00, 0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]),
            Ok(i64::MAX)
        );
        assert_eq!(
            decode_integer(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]),
            Err(DecodeError::IntegerOverflow)
        );
        assert!(decode_integer(&[]).is_err());
    }

    #[test]
    fn booleans() {
        assert_eq!(decode_boolean(&[0x00]), Ok(false));
        assert_eq!(decode_boolean(&[0x01]), Ok(true));
        assert_eq!(decode_boolean(&[0xff]), Ok(true));
        assert_eq!(
            decode_boolean(&[0xff, 0xff]),
            Err(DecodeError::InvalidContent("boolean"))
        );
        assert!(decode_boolean(&[]).is_err());
    }

    #[test]
    fn oids() {
        // 1.2.840.113556.1.4.319
        let bytes = [0x2a, 0x86, 0x48, 0x86, 0xf7, 0x14, 0x01, 0x04, 0x82, 0x3f];
        assert_eq!(decode_oid(&bytes).as_deref(), Ok("1.2.840.113556.1.4.319"));
        assert_eq!(decode_oid(&[0x55, 0x04, 0x03]).as_deref(), Ok("2.5.4.3"));
        assert!(decode_oid(&[0x2a, 0x86]).is_err());
    }

    #[test]
    fn generalized_time() {
        let t = decode_generalized_time(b"20240229123456.25+0130").unwrap();
        assert_eq!(t.to_rfc3339(), "2024-02-29T12:34:56.250+01:30");
        let t = decode_generalized_time(b"20231231235959Z").unwrap();
        assert_eq!(t.offset().local_minus_utc(), 0);
        assert_eq!(t.second(), 59);
        let t = decode_generalized_time(b"2023123123").unwrap();
        assert_eq!((t.hour(), t.minute()), (23, 0));
        assert!(decode_generalized_time(b"20230230000000Z").is_err());
        assert!(decode_generalized_time(b"20230101000000X").is_err());
    }

    #[test]
    fn utc_time() {
        let t = decode_utc_time(b"491231235959Z").unwrap();
        assert_eq!(t.to_rfc3339(), "2049-12-31T23:59:59+00:00");
        let t = decode_utc_time(b"7001010000-0500").unwrap();
        assert_eq!(t.to_rfc3339(), "1970-01-01T00:00:00-05:00");
        assert!(decode_utc_time(b"700101000000").is_err());
    }

    #[test]
    fn tag_values() {
        let tag = StructureTag {
            class: TagClass::Universal,
            id: Types::Enumerated as u64,
            payload: PL::P(vec![0x05]),
        };
        assert_eq!(tag.value(), Ok(Value::Enumerated(5)));
        let tag = StructureTag {
            class: TagClass::Context,
            id: Types::Boolean as u64,
            payload: PL::P(vec![0x01, 0x02]),
        };
        assert_eq!(tag.value(), Ok(Value::Raw(&[0x01, 0x02])));
    }
}
