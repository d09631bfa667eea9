use std::fmt;

use super::{integer_of, value_sequence, ControlParser, MakeCritical, RawControl};
use crate::result::{rc_name, LdapError, Result};

use lber::common::TagClass;
use lber::structures::{Boolean, OctetString, Sequence, Tag};
use lber::universal::Types;

pub const SERVER_SORT_OID: &str = "1.2.840.113556.1.4.473";
pub const SERVER_SORT_RESULT_OID: &str = "1.2.840.113556.1.4.474";

// Result codes a server may return in the sort response.
const SORT_RESULT_CODES: [u32; 11] = [0, 1, 2, 8, 11, 16, 18, 50, 51, 53, 80];

/// Single sort key of a [`ServerSort`] request.
#[derive(Clone, Debug, PartialEq)]
pub struct SortKey {
    pub attr: String,
    /// OID or name of the ordering rule.
    pub rule: Option<String>,
    pub reverse: bool,
}

impl SortKey {
    /// Ascending sort on the attribute with its default ordering rule.
    pub fn new<S: Into<String>>(attr: S) -> SortKey {
        SortKey {
            attr: attr.into(),
            rule: None,
            reverse: false,
        }
    }
}

/// Server Side Sorting request control ([RFC 2891](https://tools.ietf.org/html/rfc2891)).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerSort(pub Vec<SortKey>);

impl MakeCritical for ServerSort {}

impl From<ServerSort> for RawControl {
    fn from(ss: ServerSort) -> RawControl {
        let keys = ss
            .0
            .into_iter()
            .map(|key| {
                let mut seq = vec![Tag::OctetString(OctetString {
                    inner: key.attr.into_bytes(),
                    ..Default::default()
                })];
                if let Some(rule) = key.rule {
                    seq.push(Tag::OctetString(OctetString {
                        class: TagClass::Context,
                        id: 0,
                        inner: rule.into_bytes(),
                    }));
                }
                if key.reverse {
                    seq.push(Tag::Boolean(Boolean {
                        class: TagClass::Context,
                        id: 1,
                        inner: true,
                    }));
                }
                Tag::Sequence(Sequence {
                    inner: seq,
                    ..Default::default()
                })
            })
            .collect();
        RawControl::with_value(
            SERVER_SORT_OID,
            false,
            Tag::Sequence(Sequence {
                inner: keys,
                ..Default::default()
            }),
        )
    }
}

/// Server Side Sorting response control.
#[derive(Clone, Debug, PartialEq)]
pub struct SortResult {
    /// Sort outcome, one of a fixed set of LDAP result codes.
    pub result: u32,
    /// Attribute which caused the failure, if the server names one.
    pub attr: Option<String>,
}

impl ControlParser for SortResult {
    fn parse(val: &[u8]) -> Result<SortResult> {
        let mut comps = value_sequence(val, "sort result value")?.into_iter();
        let code = match comps.next() {
            Some(t) => integer_of(t, Types::Enumerated, "sort result code")?,
            None => return Err(LdapError::malformed("sort result code")),
        };
        let result = match u32::try_from(code) {
            Ok(code) if SORT_RESULT_CODES.contains(&code) => code,
            _ => return Err(LdapError::malformed("unknown sort result code")),
        };
        let attr = match comps.next() {
            Some(t) => {
                let attr = t
                    .match_class(TagClass::Context)
                    .and_then(|t| t.match_id(0))
                    .and_then(|t| t.expect_primitive())
                    .ok_or(LdapError::malformed("sort attribute type"))?;
                Some(String::from_utf8(attr).map_err(|_| LdapError::DecodingUTF8)?)
            }
            None => None,
        };
        Ok(SortResult { result, attr })
    }
}

impl fmt::Display for SortResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResultCode: {} ({})", self.result, rc_name(self.result))?;
        if let Some(ref attr) = self.attr {
            write!(f, "  AttributeType: {}", attr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encoding() {
        let rc: RawControl = ServerSort(vec![
            SortKey::new("cn"),
            SortKey {
                attr: "sn".to_owned(),
                rule: Some("2.5.13.3".to_owned()),
                reverse: true,
            },
        ])
        .into();
        assert_eq!(rc.ctype, SERVER_SORT_OID);
        let expected: &[u8] = &[
            0x30, 0x19, // SortKeyList
            0x30, 0x04, 0x04, 0x02, b'c', b'n', // cn
            0x30, 0x11, 0x04, 0x02, b's', b'n', // sn
            0x80, 0x08, b'2', b'.', b'5', b'.', b'1', b'3', b'.', b'3', // rule
            0x81, 0x01, 0xff, // reverse
        ];
        assert_eq!(rc.val.as_deref(), Some(expected));
    }

    #[test]
    fn known_result_code() {
        let res = SortResult::parse(&[0x30, 0x03, 0x0a, 0x01, 0x10]).unwrap();
        assert_eq!(res.result, 16);
        assert!(res.attr.is_none());
        assert_eq!(res.to_string(), "ResultCode: 16 (noSuchAttribute)");
    }

    #[test]
    fn result_with_attribute() {
        let res = SortResult::parse(&[0x30, 0x07, 0x0a, 0x01, 0x12, 0x80, 0x02, b'c', b'n']).unwrap();
        assert_eq!(res.result, 18);
        assert_eq!(res.attr.as_deref(), Some("cn"));
    }

    #[test]
    fn unknown_result_code_rejected() {
        assert!(SortResult::parse(&[0x30, 0x03, 0x0a, 0x01, 0x04]).is_err());
    }
}
