use std::fmt;

use super::{value_sequence, ControlParser, MakeCritical, RawControl};
use crate::result::{LdapError, Result};

use lber::common::TagClass;
use lber::value::decode_integer;

pub const PASSWORD_POLICY_OID: &str = "1.3.6.1.4.1.42.2.27.8.5.1";
pub const PASSWORD_MUST_CHANGE_OID: &str = "2.16.840.1.113730.3.4.4";
pub const PASSWORD_EXPIRING_OID: &str = "2.16.840.1.113730.3.4.5";

/// Password Policy request control
/// ([draft-behera-ldap-password-policy](https://tools.ietf.org/html/draft-behera-ldap-password-policy-10)).
///
/// The request has no value; it asks the server to attach a [`PasswordPolicyResp`]
/// to the response of a Bind or an update.
#[derive(Clone, Copy, Debug, Default)]
pub struct PasswordPolicy;

impl MakeCritical for PasswordPolicy {}

impl From<PasswordPolicy> for RawControl {
    fn from(_: PasswordPolicy) -> RawControl {
        RawControl {
            ctype: PASSWORD_POLICY_OID.to_owned(),
            crit: false,
            val: None,
        }
    }
}

/// Error conditions reported by the Password Policy response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PasswordPolicyError {
    PasswordExpired = 0,
    AccountLocked = 1,
    ChangeAfterReset = 2,
    PasswordModNotAllowed = 3,
    MustSupplyOldPassword = 4,
    InsufficientPasswordQuality = 5,
    PasswordTooShort = 6,
    PasswordTooYoung = 7,
    PasswordInHistory = 8,
}

impl PasswordPolicyError {
    fn from_code(code: i64) -> Option<PasswordPolicyError> {
        use PasswordPolicyError::*;
        Some(match code {
            0 => PasswordExpired,
            1 => AccountLocked,
            2 => ChangeAfterReset,
            3 => PasswordModNotAllowed,
            4 => MustSupplyOldPassword,
            5 => InsufficientPasswordQuality,
            6 => PasswordTooShort,
            7 => PasswordTooYoung,
            8 => PasswordInHistory,
            _ => return None,
        })
    }

    /// Name of the condition as given in the draft.
    pub fn name(self) -> &'static str {
        match self {
            PasswordPolicyError::PasswordExpired => "passwordExpired",
            PasswordPolicyError::AccountLocked => "accountLocked",
            PasswordPolicyError::ChangeAfterReset => "changeAfterReset",
            PasswordPolicyError::PasswordModNotAllowed => "passwordModNotAllowed",
            PasswordPolicyError::MustSupplyOldPassword => "mustSupplyOldPassword",
            PasswordPolicyError::InsufficientPasswordQuality => "insufficientPasswordQuality",
            PasswordPolicyError::PasswordTooShort => "passwordTooShort",
            PasswordPolicyError::PasswordTooYoung => "passwordTooYoung",
            PasswordPolicyError::PasswordInHistory => "passwordInHistory",
        }
    }
}

/// Password Policy response control.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PasswordPolicyResp {
    /// Seconds before the password expires.
    pub expire: Option<i64>,
    /// Remaining authentications allowed with an expired password.
    pub grace: Option<i64>,
    pub error: Option<PasswordPolicyError>,
}

impl ControlParser for PasswordPolicyResp {
    fn parse(val: &[u8]) -> Result<PasswordPolicyResp> {
        let mut resp = PasswordPolicyResp::default();
        for comp in value_sequence(val, "password policy value")? {
            if comp.class != TagClass::Context {
                return Err(LdapError::malformed("password policy component"));
            }
            match comp.id {
                0 => {
                    let warning = comp
                        .expect_constructed()
                        .and_then(|c| c.into_iter().next())
                        .ok_or(LdapError::malformed("password policy warning"))?;
                    let id = warning.id;
                    let v = warning
                        .match_class(TagClass::Context)
                        .and_then(|t| t.expect_primitive())
                        .ok_or(LdapError::malformed("password policy warning"))?;
                    let v = decode_integer(&v)?;
                    match id {
                        0 => resp.expire = Some(v),
                        1 => resp.grace = Some(v),
                        _ => return Err(LdapError::malformed("password policy warning")),
                    }
                }
                1 => {
                    let v = comp
                        .expect_primitive()
                        .ok_or(LdapError::malformed("password policy error"))?;
                    let code = decode_integer(&v)?;
                    resp.error = Some(
                        PasswordPolicyError::from_code(code)
                            .ok_or(LdapError::malformed("password policy error code"))?,
                    );
                }
                _ => return Err(LdapError::malformed("password policy component")),
            }
        }
        Ok(resp)
    }
}

impl fmt::Display for PasswordPolicyResp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Expire: {}  Grace: {}",
            self.expire.unwrap_or(-1),
            self.grace.unwrap_or(-1)
        )?;
        match self.error {
            Some(e) => write!(f, "  Error: {}, ErrorString: {}", e as u8, e.name()),
            None => Ok(()),
        }
    }
}

/// Password expiration warning
/// ([draft-vchu-ldap-pwd-policy](https://tools.ietf.org/html/draft-vchu-ldap-pwd-policy-00)).
///
/// The companion "password must change" indicator has no value and is recognized
/// by its OID alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PasswordExpiring {
    pub seconds: i64,
}

impl ControlParser for PasswordExpiring {
    fn parse(val: &[u8]) -> Result<PasswordExpiring> {
        let seconds = std::str::from_utf8(val)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or(LdapError::malformed("password expiration seconds"))?;
        Ok(PasswordExpiring { seconds })
    }
}
