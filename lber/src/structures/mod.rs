//! Typed building blocks for values to be encoded.
//!
//! Each wrapper carries its own class and tag number, defaulting to the
//! matching universal type, so implicitly tagged LDAP fields are expressed
//! by overriding `class`/`id` with struct update syntax.
use crate::structure;

mod constructed;
mod primitive;

pub use self::constructed::{ExplicitTag, Sequence, SequenceOf, Set, SetOf};
pub use self::primitive::{Boolean, Enumerated, Integer, Null, OctetString};

/// Conversion of a tag into a serializable form.
pub trait ASNTag {
    /// Encode the wrapped value, keeping class and id as given.
    fn into_structure(self) -> structure::StructureTag;
}

#[derive(Clone, Debug, PartialEq)]
/// Set of basic ASN.1 types used by LDAP.
pub enum Tag {
    Integer(Integer),
    Enumerated(Enumerated),
    Sequence(Sequence),
    /// Set of values; duplicates are not checked.
    Set(Set),
    OctetString(OctetString),
    Boolean(Boolean),
    Null(Null),
    /// Explicitly tagged value. LDAP uses implicit tagging, but embedded structures might not.
    ExplicitTag(ExplicitTag),
    /// Already serializable value.
    StructureTag(structure::StructureTag),
}

impl ASNTag for Tag {
    fn into_structure(self) -> structure::StructureTag {
        match self {
            Tag::Integer(i) => i.into_structure(),
            Tag::Enumerated(i) => i.into_structure(),
            Tag::Sequence(i) => i.into_structure(),
            Tag::Set(i) => i.into_structure(),
            Tag::OctetString(i) => i.into_structure(),
            Tag::Boolean(i) => i.into_structure(),
            Tag::Null(i) => i.into_structure(),
            Tag::ExplicitTag(i) => i.into_structure(),
            Tag::StructureTag(s) => s,
        }
    }
}

macro_rules! into_tag {
    ($($ty:ident),+) => {
        $(impl From<$ty> for Tag {
            fn from(t: $ty) -> Tag {
                Tag::$ty(t)
            }
        })+
    };
}

into_tag!(Integer, Enumerated, Sequence, Set, OctetString, Boolean, Null, ExplicitTag);

impl From<structure::StructureTag> for Tag {
    fn from(t: structure::StructureTag) -> Tag {
        Tag::StructureTag(t)
    }
}
