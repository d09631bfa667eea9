use super::{ASNTag, Tag};
use crate::common::TagClass;
use crate::structure::{StructureTag, PL};
use crate::universal::Types;

fn constructed<T: ASNTag>(id: u64, class: TagClass, inner: Vec<T>) -> StructureTag {
    StructureTag {
        id,
        class,
        payload: PL::C(inner.into_iter().map(ASNTag::into_structure).collect()),
    }
}

/// Sequence of values.
#[derive(Clone, Debug, PartialEq)]
pub struct Sequence {
    pub id: u64,
    pub class: TagClass,
    pub inner: Vec<Tag>,
}

/// Set of values.
#[derive(Clone, Debug, PartialEq)]
pub struct Set {
    pub id: u64,
    pub class: TagClass,
    pub inner: Vec<Tag>,
}

/// Homogeneous sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct SequenceOf<T> {
    pub id: u64,
    pub class: TagClass,
    pub inner: Vec<T>,
}

/// Homogeneous set.
#[derive(Clone, Debug, PartialEq)]
pub struct SetOf<T> {
    pub id: u64,
    pub class: TagClass,
    pub inner: Vec<T>,
}

/// Explicitly tagged value. Has no sensible default.
#[derive(Clone, Debug, PartialEq)]
pub struct ExplicitTag {
    pub id: u64,
    pub class: TagClass,
    pub inner: Box<Tag>,
}

impl ASNTag for Sequence {
    fn into_structure(self) -> StructureTag {
        constructed(self.id, self.class, self.inner)
    }
}

impl ASNTag for Set {
    fn into_structure(self) -> StructureTag {
        constructed(self.id, self.class, self.inner)
    }
}

impl<T: ASNTag> ASNTag for SequenceOf<T> {
    fn into_structure(self) -> StructureTag {
        constructed(self.id, self.class, self.inner)
    }
}

impl<T: ASNTag> ASNTag for SetOf<T> {
    fn into_structure(self) -> StructureTag {
        constructed(self.id, self.class, self.inner)
    }
}

impl ASNTag for ExplicitTag {
    fn into_structure(self) -> StructureTag {
        StructureTag {
            id: self.id,
            class: self.class,
            payload: PL::C(vec![self.inner.into_structure()]),
        }
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Sequence {
            id: Types::Sequence as u64,
            class: TagClass::Universal,
            inner: Vec::new(),
        }
    }
}

impl Default for Set {
    fn default() -> Self {
        Set {
            id: Types::Set as u64,
            class: TagClass::Universal,
            inner: Vec::new(),
        }
    }
}

impl<T> Default for SequenceOf<T> {
    fn default() -> Self {
        SequenceOf {
            id: Types::Sequence as u64,
            class: TagClass::Universal,
            inner: Vec::new(),
        }
    }
}

impl<T> Default for SetOf<T> {
    fn default() -> Self {
        SetOf {
            id: Types::Set as u64,
            class: TagClass::Universal,
            inner: Vec::new(),
        }
    }
}
