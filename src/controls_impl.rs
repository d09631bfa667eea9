use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use crate::result::{LdapError, Result};

use lber::common::TagClass;
use lber::structure::StructureTag;
use lber::structures::{ASNTag, Boolean, OctetString, Sequence, Tag};
use lber::universal::Types;
use lber::value::{decode_boolean, decode_integer};
use lber::DecodeError;

/// Recognized control types.
///
/// The variants can't be exhaustively matched, since the list of
/// recognized and internally implemented controls can change from one
/// release to the next.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControlType {
    PagedResults,
    ManageDsaIt,
    WhoAmI,
    SubtreeDelete,
    ServerSort,
    ServerSortResult,
    Notification,
    ShowDeleted,
    ServerLinkTtl,
    DirSync,
    SyncRequest,
    SyncState,
    SyncDone,
    SyncInfo,
    PasswordPolicy,
    PasswordMustChange,
    PasswordExpiring,
}

const ALL_TYPES: [ControlType; 17] = [
    ControlType::PagedResults,
    ControlType::ManageDsaIt,
    ControlType::WhoAmI,
    ControlType::SubtreeDelete,
    ControlType::ServerSort,
    ControlType::ServerSortResult,
    ControlType::Notification,
    ControlType::ShowDeleted,
    ControlType::ServerLinkTtl,
    ControlType::DirSync,
    ControlType::SyncRequest,
    ControlType::SyncState,
    ControlType::SyncDone,
    ControlType::SyncInfo,
    ControlType::PasswordPolicy,
    ControlType::PasswordMustChange,
    ControlType::PasswordExpiring,
];

mod content_sync;
pub use self::content_sync::parse_syncinfo;
pub use self::content_sync::{EntryState, RefreshMode, SyncDone, SyncInfo, SyncRequest, SyncState};

mod dirsync;
pub use self::dirsync::DirSync;

mod flags;
pub use self::flags::{
    ManageDsaIt, Notification, ServerLinkTtl, ShowDeleted, SubtreeDelete, WhoAmIControl,
};

mod paged_results;
pub use self::paged_results::{PagedResults, PAGED_RESULTS_OID};

mod ppolicy;
pub use self::ppolicy::{PasswordExpiring, PasswordPolicy, PasswordPolicyError, PasswordPolicyResp};

mod sort;
pub use self::sort::{ServerSort, SortKey, SortResult};

impl ControlType {
    /// OID of the control type.
    #[rustfmt::skip]
    pub fn oid(self) -> &'static str {
        match self {
            ControlType::PagedResults => paged_results::PAGED_RESULTS_OID,
            ControlType::ManageDsaIt => flags::MANAGE_DSA_IT_OID,
            ControlType::WhoAmI => flags::WHOAMI_OID,
            ControlType::SubtreeDelete => flags::SUBTREE_DELETE_OID,
            ControlType::ServerSort => sort::SERVER_SORT_OID,
            ControlType::ServerSortResult => sort::SERVER_SORT_RESULT_OID,
            ControlType::Notification => flags::NOTIFICATION_OID,
            ControlType::ShowDeleted => flags::SHOW_DELETED_OID,
            ControlType::ServerLinkTtl => flags::SERVER_LINK_TTL_OID,
            ControlType::DirSync => dirsync::DIRSYNC_OID,
            ControlType::SyncRequest => content_sync::SYNC_REQUEST_OID,
            ControlType::SyncState => content_sync::SYNC_STATE_OID,
            ControlType::SyncDone => content_sync::SYNC_DONE_OID,
            ControlType::SyncInfo => content_sync::SYNC_INFO_OID,
            ControlType::PasswordPolicy => ppolicy::PASSWORD_POLICY_OID,
            ControlType::PasswordMustChange => ppolicy::PASSWORD_MUST_CHANGE_OID,
            ControlType::PasswordExpiring => ppolicy::PASSWORD_EXPIRING_OID,
        }
    }

    /// Human-readable name of the control type.
    #[rustfmt::skip]
    pub fn name(self) -> &'static str {
        match self {
            ControlType::PagedResults => "Paging",
            ControlType::ManageDsaIt => "Manage DSA IT",
            ControlType::WhoAmI => "Who Am I",
            ControlType::SubtreeDelete => "Subtree Delete Control",
            ControlType::ServerSort => "Server Side Sorting Request",
            ControlType::ServerSortResult => "Server Side Sorting Result",
            ControlType::Notification => "Change Notification - Microsoft",
            ControlType::ShowDeleted => "Show Deleted Objects - Microsoft",
            ControlType::ServerLinkTtl => "Return TTL-DNs for link values with associated expiry times - Microsoft",
            ControlType::DirSync => "DirSync",
            ControlType::SyncRequest => "Sync Request",
            ControlType::SyncState => "Sync State",
            ControlType::SyncDone => "Sync Done",
            ControlType::SyncInfo => "Sync Info",
            ControlType::PasswordPolicy => "Password Policy - Behera Draft",
            ControlType::PasswordMustChange => "Password Must Change - VChu Draft",
            ControlType::PasswordExpiring => "Password Expiring - VChu Draft",
        }
    }

    /// Look up the control type registered for the OID.
    pub fn from_oid(oid: &str) -> Option<ControlType> {
        CONTROLS.get(oid).copied()
    }
}

static CONTROLS: LazyLock<HashMap<&'static str, ControlType>> =
    LazyLock::new(|| ALL_TYPES.iter().map(|&ct| (ct.oid(), ct)).collect());

/// Conversion trait for single control instances.
///
/// The [`Ldap::with_controls()`](crate::Ldap::with_controls) method accepts a vector
/// of controls, as dictated by the LDAP specification. However, it's expected that
/// most uses of controls involve a single instance, so constructing a vector at the
/// call site is noisy. If a control implements this trait, its single instance may be
/// used in the call, and a single-element vector is constructed internally.
pub trait IntoRawControlVec {
    /// Create a control vector.
    fn into(self) -> Vec<RawControl>;
}

/// Trivial implementation for a control vector, returning itself.
impl IntoRawControlVec for Vec<RawControl> {
    fn into(self) -> Vec<RawControl> {
        self
    }
}

/// Blanket implementation for any control. The vector is constructed by the conversion
/// method.
impl<R> IntoRawControlVec for R
where
    RawControl: From<R>,
{
    fn into(self) -> Vec<RawControl> {
        vec![std::convert::Into::into(self)]
    }
}

/// Mark a control as critical.
///
/// Most controls provided by this library implement this trait. All controls
/// are instantiated as non-critical by default, unless dictated otherwise by
/// their specification.
pub trait MakeCritical {
    /// Mark the control instance as critical. This operation consumes the control,
    /// and is irreversible.
    fn critical(self) -> CriticalControl<Self>
    where
        Self: Sized,
    {
        CriticalControl { control: self }
    }
}

/// Wrapper for a control marked as critical.
///
/// The wrapper ensures that the criticality of the control will be set to
/// true when the control is encoded.
pub struct CriticalControl<T> {
    control: T,
}

impl<T> From<CriticalControl<T>> for RawControl
where
    T: Into<RawControl>,
{
    fn from(cc: CriticalControl<T>) -> RawControl {
        let mut rc = cc.control.into();
        rc.crit = true;
        rc
    }
}

/// Conversion trait for response controls.
pub trait ControlParser: Sized {
    /// Convert the raw BER value into a control-specific struct.
    fn parse(val: &[u8]) -> Result<Self>;
}

/// Generic control.
///
/// This struct is the wire form of a control, used for requests and as the
/// first stage of response decoding. For requests, an independently implemented
/// control can produce an instance of this type and use it to provide an element
/// of the vector passed to [`with_controls()`](crate::Ldap::with_controls) by
/// calling `into()` on the instance.
#[derive(Clone, Debug, PartialEq)]
pub struct RawControl {
    /// OID of the control.
    pub ctype: String,
    /// Criticality, has no meaning on response.
    pub crit: bool,
    /// Raw value of the control, if any.
    pub val: Option<Vec<u8>>,
}

impl RawControl {
    /// Parse the generic control into a control-specific struct.
    ///
    /// A control without a value can't be parsed and yields a decoding error.
    pub fn parse<T: ControlParser>(&self) -> Result<T> {
        match self.val {
            Some(ref val) => T::parse(val),
            None => Err(LdapError::malformed("missing control value")),
        }
    }

    /// Control with an encoded BER value.
    pub(crate) fn with_value(ctype: &str, crit: bool, value: Tag) -> RawControl {
        RawControl {
            ctype: ctype.to_owned(),
            crit,
            val: Some(lber::encode(value.into_structure())),
        }
    }
}

/// Decoded response control.
///
/// Controls whose OID is registered with the library are decoded into the matching
/// [`ControlValue`] variant upon arrival; others keep their raw value.
#[derive(Clone, Debug)]
pub struct Control {
    /// Registered type, if any.
    pub ctype: Option<ControlType>,
    /// OID of the control.
    pub oid: String,
    /// Criticality as sent by the server.
    pub crit: bool,
    /// Decoded value.
    pub value: ControlValue,
}

/// Payload of a decoded response control.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum ControlValue {
    Paging(PagedResults),
    SortResult(SortResult),
    DirSync(DirSync),
    SyncState(SyncState),
    SyncDone(SyncDone),
    PasswordPolicy(PasswordPolicyResp),
    PasswordExpiring(PasswordExpiring),
    /// A registered control which carries no value.
    Flag,
    /// Value of an unregistered control, or of a registered one which isn't
    /// interpreted on response.
    Raw(Option<Vec<u8>>),
}

impl Control {
    /// Classify the control by OID and decode its value.
    pub fn from_raw(raw: RawControl) -> Result<Control> {
        let ctype = ControlType::from_oid(&raw.ctype);
        let value = match (ctype, raw.val.as_deref()) {
            (Some(ControlType::PagedResults), Some(v)) => ControlValue::Paging(PagedResults::parse(v)?),
            (Some(ControlType::ServerSortResult), Some(v)) => ControlValue::SortResult(SortResult::parse(v)?),
            (Some(ControlType::DirSync), Some(v)) => ControlValue::DirSync(DirSync::parse(v)?),
            (Some(ControlType::SyncState), Some(v)) => ControlValue::SyncState(SyncState::parse(v)?),
            (Some(ControlType::SyncDone), Some(v)) => ControlValue::SyncDone(SyncDone::parse(v)?),
            (Some(ControlType::SyncDone), None) => ControlValue::SyncDone(SyncDone::default()),
            (Some(ControlType::PasswordPolicy), Some(v)) => {
                ControlValue::PasswordPolicy(PasswordPolicyResp::parse(v)?)
            }
            (Some(ControlType::PasswordExpiring), Some(v)) => {
                ControlValue::PasswordExpiring(PasswordExpiring::parse(v)?)
            }
            (Some(_), None) => ControlValue::Flag,
            (_, val) => ControlValue::Raw(val.map(<[u8]>::to_vec)),
        };
        Ok(Control {
            ctype,
            oid: raw.ctype,
            crit: raw.crit,
            value,
        })
    }

    fn name(&self) -> &'static str {
        self.ctype.map(ControlType::name).unwrap_or("")
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Control Type: {} ({})  Criticality: {}",
            self.name(),
            self.oid,
            self.crit
        )?;
        match self.value {
            ControlValue::Paging(ref p) => write!(f, "  {}", p),
            ControlValue::SortResult(ref s) => write!(f, "  {}", s),
            ControlValue::DirSync(ref d) => write!(f, "  {}", d),
            ControlValue::SyncState(ref s) => write!(f, "  {}", s),
            ControlValue::SyncDone(ref s) => write!(f, "  {}", s),
            ControlValue::PasswordPolicy(ref p) => write!(f, "  {}", p),
            ControlValue::PasswordExpiring(ref p) => write!(f, "  Expire: {}", p.seconds),
            ControlValue::Flag => Ok(()),
            ControlValue::Raw(Some(ref v)) => {
                write!(f, "  Control Value: {}", String::from_utf8_lossy(v))
            }
            ControlValue::Raw(None) => Ok(()),
        }
    }
}

/// Locate a control by OID among response controls.
pub fn find_control<'a>(ctrls: &'a [Control], oid: &str) -> Option<&'a Control> {
    ctrls.iter().find(|c| c.oid == oid)
}

pub(crate) fn build_tag(rc: RawControl) -> StructureTag {
    let mut seq = vec![Tag::OctetString(OctetString {
        inner: Vec::from(rc.ctype.as_bytes()),
        ..Default::default()
    })];
    if rc.crit {
        seq.push(Tag::Boolean(Boolean {
            inner: true,
            ..Default::default()
        }));
    }
    if let Some(val) = rc.val {
        seq.push(Tag::OctetString(OctetString {
            inner: val,
            ..Default::default()
        }));
    }
    Tag::Sequence(Sequence {
        inner: seq,
        ..Default::default()
    })
    .into_structure()
}

/// Split the `[0]` controls wrapper of an LDAPMessage into wire-form controls.
pub(crate) fn parse_raw_controls(t: StructureTag) -> std::result::Result<Vec<RawControl>, DecodeError> {
    let tags = t
        .expect_constructed()
        .ok_or(DecodeError::InvalidContent("controls"))?;
    let mut ctrls = Vec::with_capacity(tags.len());
    for ctrl in tags {
        let mut components = ctrl
            .into_constructed_of(TagClass::Universal, Types::Sequence as u64, "control")?
            .into_iter();
        let ctype = components
            .next()
            .ok_or(DecodeError::InvalidContent("control type"))?
            .into_primitive_of(TagClass::Universal, Types::OctetString as u64, "control type")?;
        let ctype = String::from_utf8(ctype).map_err(|_| DecodeError::InvalidContent("control type"))?;
        let mut crit = false;
        let mut val = None;
        for c in components {
            if c.is_universal(Types::Boolean) && val.is_none() {
                let b = c.expect_primitive().ok_or(DecodeError::InvalidContent("criticality"))?;
                crit = decode_boolean(&b)?;
            } else if c.is_universal(Types::OctetString) && val.is_none() {
                val = Some(c.into_primitive_of(TagClass::Universal, Types::OctetString as u64, "control value")?);
            } else {
                return Err(DecodeError::InvalidContent("control component"));
            }
        }
        ctrls.push(RawControl { ctype, crit, val });
    }
    Ok(ctrls)
}

/// Decode a list of wire-form response controls.
pub fn decode_controls(raw: Vec<RawControl>) -> Result<Vec<Control>> {
    raw.into_iter().map(Control::from_raw).collect()
}

/// Decode the `[0]` controls wrapper of a response.
pub fn parse_controls(t: StructureTag) -> Result<Vec<Control>> {
    decode_controls(parse_raw_controls(t)?)
}

/// Children of a control value which must be a universal SEQUENCE.
pub(crate) fn value_sequence(val: &[u8], what: &'static str) -> Result<Vec<StructureTag>> {
    let (tag, _) = lber::decode(val)?;
    Ok(tag.into_constructed_of(TagClass::Universal, Types::Sequence as u64, what)?)
}

/// Integer of the given universal type.
pub(crate) fn integer_of(t: StructureTag, ty: Types, what: &'static str) -> Result<i64> {
    let bytes = t.into_primitive_of(TagClass::Universal, ty as u64, what)?;
    Ok(decode_integer(&bytes)?)
}

/// Universal OCTET STRING contents.
pub(crate) fn octets_of(t: StructureTag, what: &'static str) -> Result<Vec<u8>> {
    Ok(t.into_primitive_of(TagClass::Universal, Types::OctetString as u64, what)?)
}

/// Universal BOOLEAN value.
pub(crate) fn boolean_of(t: StructureTag, what: &'static str) -> Result<bool> {
    let bytes = t.into_primitive_of(TagClass::Universal, Types::Boolean as u64, what)?;
    Ok(decode_boolean(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lber::structure::PL;

    fn wrapper(ctrls: Vec<RawControl>) -> StructureTag {
        StructureTag {
            class: TagClass::Context,
            id: 0,
            payload: PL::C(ctrls.into_iter().map(build_tag).collect()),
        }
    }

    #[test]
    fn registry_covers_all_types() {
        for ct in ALL_TYPES {
            assert_eq!(ControlType::from_oid(ct.oid()), Some(ct));
        }
        assert_eq!(
            ControlType::from_oid("1.2.840.113556.1.4.319"),
            Some(ControlType::PagedResults)
        );
        assert_eq!(ControlType::from_oid("1.2.3.4"), None);
    }

    #[test]
    fn raw_controls_on_the_wire() {
        let raw = vec![
            RawControl {
                ctype: "1.2.3".to_owned(),
                crit: true,
                val: Some(b"abc".to_vec()),
            },
            RawControl {
                ctype: "1.2.4".to_owned(),
                crit: false,
                val: None,
            },
        ];
        let parsed = parse_raw_controls(wrapper(raw.clone())).unwrap();
        assert_eq!(parsed, raw);
    }

    #[test]
    fn unknown_oid_keeps_raw_value() {
        let ctrls = parse_controls(wrapper(vec![RawControl {
            ctype: "1.2.3.4.5".to_owned(),
            crit: false,
            val: Some(b"opaque".to_vec()),
        }]))
        .unwrap();
        assert_eq!(ctrls.len(), 1);
        assert!(ctrls[0].ctype.is_none());
        assert!(matches!(ctrls[0].value, ControlValue::Raw(Some(ref v)) if v == b"opaque"));
    }

    #[test]
    fn registered_flag_without_value() {
        let ctrls = parse_controls(wrapper(vec![Into::<RawControl>::into(ManageDsaIt)])).unwrap();
        assert_eq!(ctrls[0].ctype, Some(ControlType::ManageDsaIt));
        assert!(matches!(ctrls[0].value, ControlValue::Flag));
        assert_eq!(
            ctrls[0].to_string(),
            "Control Type: Manage DSA IT (2.16.840.1.113730.3.4.2)  Criticality: false"
        );
    }

    #[test]
    fn find_by_oid() {
        let ctrls = decode_controls(vec![
            Into::<RawControl>::into(ManageDsaIt),
            Into::<RawControl>::into(PagedResults {
                size: 2,
                cookie: vec![],
            }),
        ])
        .unwrap();
        let paging = find_control(&ctrls, ControlType::PagedResults.oid()).unwrap();
        assert!(matches!(paging.value, ControlValue::Paging(ref p) if p.size == 2));
        assert!(find_control(&ctrls, "1.1").is_none());
    }

    #[test]
    fn malformed_value_is_error() {
        let err = Control::from_raw(RawControl {
            ctype: ControlType::PagedResults.oid().to_owned(),
            crit: false,
            val: Some(vec![0x30, 0x05, 0x02]),
        })
        .unwrap_err();
        assert!(matches!(err, LdapError::Decoding { .. }));
    }

    #[test]
    fn critical_wrapper() {
        let rc: RawControl = Into::into(SubtreeDelete.critical());
        assert!(rc.crit);
        assert_eq!(rc.ctype, "1.2.840.113556.1.4.805");
        let v = IntoRawControlVec::into(ManageDsaIt);
        assert_eq!(v.len(), 1);
    }

    #[test]
    fn parse_missing_value() {
        let rc: RawControl = Into::into(ManageDsaIt);
        assert!(rc.parse::<PagedResults>().is_err());
    }
}
