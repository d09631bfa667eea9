use std::fmt;

use super::{integer_of, octets_of, value_sequence, ControlParser, RawControl};
use crate::result::{LdapError, Result};

use lber::structures::{Integer, OctetString, Sequence, Tag};
use lber::universal::Types;

pub const DIRSYNC_OID: &str = "1.2.840.113556.1.4.841";

/// Active Directory DirSync control
/// ([MS-ADTS 3.1.1.3.4.1.3](https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-adts/2213a7f2-0a36-483c-b2a4-8574d53aa1e3)).
///
/// The same struct is used for the request and the response. On request, the control
/// is always sent as critical. On response, `flags` is non-zero if more changes are
/// pending, and `cookie` must be passed in the next request to resume the enumeration.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DirSync {
    pub flags: i64,
    pub max_attr_count: i64,
    pub cookie: Vec<u8>,
}

impl DirSync {
    pub const OBJECT_SECURITY: i64 = 0x1;
    pub const ANCESTORS_FIRST_ORDER: i64 = 0x800;
    pub const PUBLIC_DATA_ONLY: i64 = 0x2000;
    pub const INCREMENTAL_VALUES: i64 = 0x8000_0000;

    /// Request with the given flags and attribute byte limit, starting a new enumeration.
    pub fn new(flags: i64, max_attr_count: i64) -> DirSync {
        DirSync {
            flags,
            max_attr_count,
            cookie: Vec::new(),
        }
    }
}

impl From<DirSync> for RawControl {
    fn from(ds: DirSync) -> RawControl {
        let value = Tag::Sequence(Sequence {
            inner: vec![
                Tag::Integer(Integer {
                    inner: ds.flags,
                    ..Default::default()
                }),
                Tag::Integer(Integer {
                    inner: ds.max_attr_count,
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: ds.cookie,
                    ..Default::default()
                }),
            ],
            ..Default::default()
        });
        RawControl::with_value(DIRSYNC_OID, true, value)
    }
}

impl ControlParser for DirSync {
    fn parse(val: &[u8]) -> Result<DirSync> {
        let comps = value_sequence(val, "dirsync value")?;
        if comps.len() != 3 {
            return Err(LdapError::malformed("dirsync value must have three components"));
        }
        let mut comps = comps.into_iter();
        let (flags, max_attr_count, cookie) = match (comps.next(), comps.next(), comps.next()) {
            (Some(f), Some(m), Some(c)) => (f, m, c),
            _ => return Err(LdapError::malformed("dirsync value")),
        };
        Ok(DirSync {
            flags: integer_of(flags, Types::Integer, "dirsync flags")?,
            max_attr_count: integer_of(max_attr_count, Types::Integer, "dirsync max attribute count")?,
            cookie: octets_of(cookie, "dirsync cookie")?,
        })
    }
}

impl fmt::Display for DirSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Flags: {}  MaxAttrCount: {}  Cookie: {} bytes",
            self.flags,
            self.max_attr_count,
            self.cookie.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_critical() {
        let rc: RawControl = DirSync::new(DirSync::OBJECT_SECURITY, 1000).into();
        assert!(rc.crit);
        assert_eq!(
            rc.val.as_deref(),
            Some(&[0x30, 0x09, 0x02, 0x01, 0x01, 0x02, 0x02, 0x03, 0xe8, 0x04, 0x00][..])
        );
    }

    #[test]
    fn incremental_flag_encoding() {
        let rc: RawControl = DirSync::new(DirSync::INCREMENTAL_VALUES, 0).into();
        let back = DirSync::parse(rc.val.as_deref().unwrap()).unwrap();
        assert_eq!(back.flags, 0x8000_0000);
    }

    #[test]
    fn response_cookie() {
        let ds = DirSync::parse(&[0x30, 0x0a, 0x02, 0x01, 0x01, 0x02, 0x01, 0x00, 0x04, 0x02, 0x12, 0x34]).unwrap();
        assert_eq!(ds.flags, 1);
        assert_eq!(ds.max_attr_count, 0);
        assert_eq!(ds.cookie, vec![0x12, 0x34]);
    }

    #[test]
    fn wrong_arity_rejected() {
        assert!(DirSync::parse(&[0x30, 0x06, 0x02, 0x01, 0x01, 0x04, 0x01, 0x00]).is_err());
    }
}
