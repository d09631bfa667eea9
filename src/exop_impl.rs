use crate::result::{LdapError, Result};

use lber::common::TagClass;
use lber::structures::{OctetString, Sequence, Tag};

mod passmod;
pub use self::passmod::{PasswordModify, PasswordModifyResp, PASSMOD_OID};

mod starttls;
pub use self::starttls::{StartTLS, STARTTLS_OID};

mod whoami;
pub use self::whoami::{WhoAmI, WhoAmIResp, WHOAMI_OID};

/// Generic extended operation.
///
/// Since the same struct can be used both for requests and responses,
/// both fields must be declared as optional; when sending an extended
/// request, `name` must not be `None`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Exop {
    /// OID of the operation. It may be absent in the response.
    pub name: Option<String>,
    /// Request or response value. It may be absent in both cases.
    pub val: Option<Vec<u8>>,
}

impl Exop {
    /// Parse the generic exop into a exop-specific struct.
    ///
    /// A response without a value yields a decoding error. An exop whose response
    /// may legitimately be empty should be checked for `val` before parsing.
    pub fn parse<T: ExopParser>(&self) -> Result<T> {
        match self.val {
            Some(ref val) => T::parse(val),
            None => Err(LdapError::malformed("missing exop value")),
        }
    }
}

/// Conversion trait for Extended response values.
pub trait ExopParser: Sized {
    /// Convert the raw BER value into an exop-specific struct.
    fn parse(val: &[u8]) -> Result<Self>;
}

pub(crate) fn construct_exop(exop: Exop) -> Vec<Tag> {
    let mut seq = vec![Tag::OctetString(OctetString {
        id: 0,
        class: TagClass::Context,
        inner: exop.name.unwrap_or_default().into_bytes(),
    })];
    if let Some(val) = exop.val {
        seq.push(Tag::OctetString(OctetString {
            id: 1,
            class: TagClass::Context,
            inner: val,
        }));
    }
    seq
}

/// The `ExtendedRequest` protocol op for an exop.
pub(crate) fn exop_request(exop: Exop) -> Tag {
    Tag::Sequence(Sequence {
        id: 23,
        class: TagClass::Application,
        inner: construct_exop(exop),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lber::structures::ASNTag;

    #[test]
    fn request_layout() {
        let req = exop_request(Exop {
            name: Some("1.2.3".to_owned()),
            val: Some(vec![0x42]),
        });
        assert_eq!(
            lber::encode(req.into_structure()),
            vec![0x77, 0x0a, 0x80, 0x05, b'1', b'.', b'2', b'.', b'3', 0x81, 0x01, 0x42]
        );
    }

    #[test]
    fn parse_without_value() {
        let exop = Exop::default();
        assert!(exop.parse::<WhoAmIResp>().is_err());
    }
}
