/// Tag class, the two high bits of the identifier octet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TagClass {
    Universal = 0,
    Application = 1,
    Context = 2,
    Private = 3,
}

impl TagClass {
    pub fn from_u8(n: u8) -> Option<TagClass> {
        match n {
            0 => Some(TagClass::Universal),
            1 => Some(TagClass::Application),
            2 => Some(TagClass::Context),
            3 => Some(TagClass::Private),
            _ => None,
        }
    }
}

/// Primitive/constructed bit of the identifier octet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagStructure {
    Primitive = 0,
    Constructed = 1,
}

impl TagStructure {
    pub fn from_u8(n: u8) -> Option<TagStructure> {
        match n {
            0 => Some(TagStructure::Primitive),
            1 => Some(TagStructure::Constructed),
            _ => None,
        }
    }
}
