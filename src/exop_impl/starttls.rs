use super::Exop;

pub const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// StartTLS extended operation ([RFC 4511 §4.14](https://tools.ietf.org/html/rfc4511#section-4.14)).
///
/// The operation is issued internally when a connection is configured with
/// [`set_starttls()`](crate::LdapConnSettings::set_starttls); sending it through
/// [`extended()`](crate::Ldap::extended) would leave the connection in an
/// inconsistent state.
#[derive(Clone, Copy, Debug)]
pub struct StartTLS;

impl From<StartTLS> for Exop {
    fn from(_: StartTLS) -> Exop {
        Exop {
            name: Some(STARTTLS_OID.to_owned()),
            val: None,
        }
    }
}
