use std::fmt;

use super::{integer_of, octets_of, value_sequence, ControlParser, MakeCritical, RawControl};
use crate::result::{LdapError, Result};

use lber::structures::{Integer, OctetString, Sequence, Tag};
use lber::universal::Types;

pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// Paged Results control ([RFC 2696](https://tools.ietf.org/html/rfc2696)).
///
/// This struct can be used both for requests and responses, although `size`
/// means different things in each case.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PagedResults {
    /// For requests, desired page size. For responses, a server's estimate
    /// of the result set size, if non-zero.
    pub size: i32,
    /// Paging cookie. An empty cookie on response means the result set is exhausted.
    pub cookie: Vec<u8>,
}

impl MakeCritical for PagedResults {}

impl From<PagedResults> for RawControl {
    fn from(pr: PagedResults) -> RawControl {
        let value = Tag::Sequence(Sequence {
            inner: vec![
                Tag::Integer(Integer {
                    inner: pr.size as i64,
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: pr.cookie,
                    ..Default::default()
                }),
            ],
            ..Default::default()
        });
        RawControl::with_value(PAGED_RESULTS_OID, false, value)
    }
}

impl ControlParser for PagedResults {
    fn parse(val: &[u8]) -> Result<PagedResults> {
        let mut comps = value_sequence(val, "paging value")?.into_iter();
        let size = match comps.next() {
            Some(t) => integer_of(t, Types::Integer, "paging size")?,
            None => return Err(LdapError::malformed("paging size")),
        };
        let size = i32::try_from(size).map_err(|_| LdapError::malformed("paging size"))?;
        let cookie = match comps.next() {
            Some(t) => octets_of(t, "paging cookie")?,
            None => return Err(LdapError::malformed("paging cookie")),
        };
        Ok(PagedResults { size, cookie })
    }
}

impl fmt::Display for PagedResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PagingSize: {}  Cookie: {:?}",
            self.size,
            String::from_utf8_lossy(&self.cookie)
        )
    }
}
