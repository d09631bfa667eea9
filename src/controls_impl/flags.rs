//! Controls which carry no value.

use super::{MakeCritical, RawControl};

pub const MANAGE_DSA_IT_OID: &str = "2.16.840.1.113730.3.4.2";
pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";
pub const SUBTREE_DELETE_OID: &str = "1.2.840.113556.1.4.805";
pub const NOTIFICATION_OID: &str = "1.2.840.113556.1.4.528";
pub const SHOW_DELETED_OID: &str = "1.2.840.113556.1.4.417";
pub const SERVER_LINK_TTL_OID: &str = "1.2.840.113556.1.4.2309";

macro_rules! flag_control {
    ($(#[$meta:meta])* $name:ident, $oid:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct $name;

        impl MakeCritical for $name {}

        impl From<$name> for RawControl {
            fn from(_: $name) -> RawControl {
                RawControl {
                    ctype: $oid.to_owned(),
                    crit: false,
                    val: None,
                }
            }
        }
    };
}

flag_control!(
    /// ManageDsaIT control ([RFC 3296](https://tools.ietf.org/html/rfc3296)).
    ManageDsaIt,
    MANAGE_DSA_IT_OID
);
flag_control!(
    /// Who Am I control, the request form of the
    /// [RFC 4532](https://tools.ietf.org/html/rfc4532) OID.
    WhoAmIControl,
    WHOAMI_OID
);
flag_control!(
    /// Tree Delete control
    /// ([draft-armijo-ldap-treedelete](https://datatracker.ietf.org/doc/html/draft-armijo-ldap-treedelete-02)).
    SubtreeDelete,
    SUBTREE_DELETE_OID
);
flag_control!(
    /// Active Directory change notification control. Turns a Search into a persistent one.
    Notification,
    NOTIFICATION_OID
);
flag_control!(
    /// Active Directory control for returning deleted objects.
    ShowDeleted,
    SHOW_DELETED_OID
);
flag_control!(
    /// Active Directory control for returning TTL-DNs of link values with expiry times.
    ServerLinkTtl,
    SERVER_LINK_TTL_OID
);
