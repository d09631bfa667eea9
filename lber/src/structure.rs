use crate::common::TagClass;
use crate::error::DecodeError;
use crate::universal::Types;

/// ASN.1 structure prepared for serialization, or produced by parsing.
#[derive(Clone, PartialEq, Debug, Eq)]
pub struct StructureTag {
    pub class: TagClass,
    pub id: u64,
    pub payload: PL,
}

/// Tagged value payload.
#[derive(Clone, PartialEq, Debug, Eq)]
pub enum PL {
    /// Primitive value.
    P(Vec<u8>),
    /// Constructed value.
    C(Vec<StructureTag>),
}

impl StructureTag {
    pub fn match_class(self, class: TagClass) -> Option<Self> {
        if self.class == class {
            Some(self)
        } else {
            None
        }
    }

    pub fn match_id(self, id: u64) -> Option<Self> {
        if self.id == id {
            Some(self)
        } else {
            None
        }
    }

    pub fn expect_constructed(self) -> Option<Vec<StructureTag>> {
        match self.payload {
            PL::P(_) => None,
            PL::C(i) => Some(i),
        }
    }

    pub fn expect_primitive(self) -> Option<Vec<u8>> {
        match self.payload {
            PL::P(i) => Some(i),
            PL::C(_) => None,
        }
    }

    /// Borrow the primitive contents.
    pub fn as_primitive(&self) -> Option<&[u8]> {
        match self.payload {
            PL::P(ref v) => Some(v),
            PL::C(_) => None,
        }
    }

    /// Borrow the children of a constructed value.
    pub fn children(&self) -> Option<&[StructureTag]> {
        match self.payload {
            PL::C(ref c) => Some(c),
            PL::P(_) => None,
        }
    }

    pub fn is_universal(&self, ty: Types) -> bool {
        self.class == TagClass::Universal && self.id == ty as u64
    }

    /// Primitive contents of a value that must be a primitive `[class id]`.
    pub fn into_primitive_of(
        self,
        class: TagClass,
        id: u64,
        what: &'static str,
    ) -> Result<Vec<u8>, DecodeError> {
        self.match_class(class)
            .and_then(|t| t.match_id(id))
            .and_then(|t| t.expect_primitive())
            .ok_or(DecodeError::InvalidContent(what))
    }

    /// Children of a value that must be a constructed `[class id]`.
    pub fn into_constructed_of(
        self,
        class: TagClass,
        id: u64,
        what: &'static str,
    ) -> Result<Vec<StructureTag>, DecodeError> {
        self.match_class(class)
            .and_then(|t| t.match_id(id))
            .and_then(|t| t.expect_constructed())
            .ok_or(DecodeError::InvalidContent(what))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TagClass;

    #[test]
    fn expect_exact() {
        let tag = StructureTag {
            class: TagClass::Application,
            id: 65u64,
            payload: PL::C(vec![StructureTag {
                class: TagClass::Universal,
                id: 2u64,
                payload: PL::P(vec![0x16, 0x16]),
            }]),
        };

        let out = tag
            .clone()
            .match_class(TagClass::Application)
            .and_then(|x| x.match_id(65u64));

        assert_eq!(out, Some(tag));
    }

    #[test]
    fn typed_extraction() {
        let tag = StructureTag {
            class: TagClass::Context,
            id: 3,
            payload: PL::P(b"abc".to_vec()),
        };
        assert!(tag.children().is_none());
        assert_eq!(tag.as_primitive(), Some(&b"abc"[..]));
        assert_eq!(
            tag.clone().into_primitive_of(TagClass::Context, 3, "value"),
            Ok(b"abc".to_vec())
        );
        assert_eq!(
            tag.into_constructed_of(TagClass::Context, 3, "sequence"),
            Err(DecodeError::InvalidContent("sequence"))
        );
    }
}
