use super::{Exop, ExopParser};
use crate::result::{LdapError, Result};

use lber::common::TagClass;
use lber::structures::{ASNTag, OctetString, Sequence, Tag};
use lber::universal::Types;

pub const PASSMOD_OID: &str = "1.3.6.1.4.1.4203.1.11.1";

/// Password Modify extended operation ([RFC 3062](https://tools.ietf.org/html/rfc3062)).
///
/// The precise semantics of having a particular field present or absent will
/// depend on the server receiving the request; consult the server documentation.
/// Some rules are prescribed by the RFC and should generally apply:
///
/// * The `user_id` field identifies the user whose password should be changed.
///   If absent, the password of the currently bound user is changed.
///
/// * If `new_pass` is absent, the server is expected to generate the password,
///   which will be returned in the response.
#[derive(Clone, Debug, Default)]
pub struct PasswordModify<'a> {
    pub user_id: Option<&'a str>,
    pub old_pass: Option<&'a str>,
    pub new_pass: Option<&'a str>,
}

/// Password Modify response.
#[derive(Clone, Debug, PartialEq)]
pub struct PasswordModifyResp {
    /// Server-generated password.
    pub gen_pass: String,
}

impl<'a> From<PasswordModify<'a>> for Exop {
    fn from(pm: PasswordModify<'a>) -> Exop {
        let fields = [pm.user_id, pm.old_pass, pm.new_pass];
        let inner = fields
            .iter()
            .enumerate()
            .filter_map(|(id, field)| {
                field.map(|s| {
                    Tag::OctetString(OctetString {
                        id: id as u64,
                        class: TagClass::Context,
                        inner: Vec::from(s.as_bytes()),
                    })
                })
            })
            .collect::<Vec<_>>();
        let val = if inner.is_empty() {
            None
        } else {
            Some(lber::encode(
                Tag::Sequence(Sequence {
                    inner,
                    ..Default::default()
                })
                .into_structure(),
            ))
        };
        Exop {
            name: Some(PASSMOD_OID.to_owned()),
            val,
        }
    }
}

impl ExopParser for PasswordModifyResp {
    fn parse(val: &[u8]) -> Result<PasswordModifyResp> {
        let (tag, _) = lber::decode(val)?;
        let gen_pass = tag
            .into_constructed_of(TagClass::Universal, Types::Sequence as u64, "passmod response")?
            .into_iter()
            .next()
            .ok_or(LdapError::malformed("passmod genPasswd"))?
            .into_primitive_of(TagClass::Context, 0, "passmod genPasswd")?;
        Ok(PasswordModifyResp {
            gen_pass: String::from_utf8(gen_pass).map_err(|_| LdapError::DecodingUTF8)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_fields_are_context_tagged() {
        let exop: Exop = PasswordModify {
            user_id: Some("uid=a"),
            old_pass: None,
            new_pass: Some("pw"),
        }
        .into();
        assert_eq!(exop.name.as_deref(), Some(PASSMOD_OID));
        assert_eq!(
            exop.val.as_deref(),
            Some(&[0x30, 0x0b, 0x80, 0x05, b'u', b'i', b'd', b'=', b'a', 0x82, 0x02, b'p', b'w'][..])
        );
    }

    #[test]
    fn empty_request_has_no_value() {
        let exop: Exop = PasswordModify::default().into();
        assert!(exop.val.is_none());
    }

    #[test]
    fn generated_password() {
        let resp = PasswordModifyResp::parse(&[0x30, 0x05, 0x80, 0x03, b'x', b'y', b'z']).unwrap();
        assert_eq!(resp.gen_pass, "xyz");
    }
}
