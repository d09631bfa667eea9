use super::ASNTag;
use crate::common::TagClass;
use crate::structure::{StructureTag, PL};
use crate::universal::Types;

macro_rules! universal_default {
    ($ty:ident, $univ:expr, $inner:expr) => {
        impl Default for $ty {
            fn default() -> Self {
                $ty {
                    id: $univ as u64,
                    class: TagClass::Universal,
                    inner: $inner,
                }
            }
        }
    };
}

/// Integer value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Integer {
    pub id: u64,
    pub class: TagClass,
    pub inner: i64,
}

/// Integer with a different tag.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Enumerated {
    pub id: u64,
    pub class: TagClass,
    pub inner: i64,
}

/// Boolean value, true is encoded as 0xFF.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Boolean {
    pub id: u64,
    pub class: TagClass,
    pub inner: bool,
}

/// Null value.
#[derive(Clone, Debug, PartialEq)]
pub struct Null {
    pub id: u64,
    pub class: TagClass,
    pub inner: (),
}

/// String of bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct OctetString {
    pub id: u64,
    pub class: TagClass,
    pub inner: Vec<u8>,
}

universal_default!(Integer, Types::Integer, 0);
universal_default!(Enumerated, Types::Enumerated, 0);
universal_default!(Boolean, Types::Boolean, false);
universal_default!(Null, Types::Null, ());
universal_default!(OctetString, Types::OctetString, Vec::new());

/// Shortest two's-complement big-endian form.
fn int_octets(v: i64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let next_high = bytes[start + 1] & 0x80 != 0;
        match bytes[start] {
            0x00 if !next_high => start += 1,
            0xFF if next_high => start += 1,
            _ => break,
        }
    }
    bytes[start..].to_vec()
}

fn primitive(id: u64, class: TagClass, content: Vec<u8>) -> StructureTag {
    StructureTag {
        id,
        class,
        payload: PL::P(content),
    }
}

impl ASNTag for Integer {
    fn into_structure(self) -> StructureTag {
        primitive(self.id, self.class, int_octets(self.inner))
    }
}

impl ASNTag for Enumerated {
    fn into_structure(self) -> StructureTag {
        primitive(self.id, self.class, int_octets(self.inner))
    }
}

impl ASNTag for Boolean {
    fn into_structure(self) -> StructureTag {
        primitive(self.id, self.class, vec![if self.inner { 0xFF } else { 0x00 }])
    }
}

impl ASNTag for Null {
    fn into_structure(self) -> StructureTag {
        primitive(self.id, self.class, Vec::new())
    }
}

impl ASNTag for OctetString {
    fn into_structure(self) -> StructureTag {
        primitive(self.id, self.class, self.inner)
    }
}

#[cfg(test)]
mod test {
    use super::int_octets;
    use crate::value::decode_integer;

    #[test]
    fn minimal_integer_octets() {
        assert_eq!(int_octets(0), vec![0]);
        assert_eq!(int_octets(127), vec![127]);
        assert_eq!(int_octets(128), vec![0, 128]);
        assert_eq!(int_octets(-1), vec![0xff]);
        assert_eq!(int_octets(-128), vec![0x80]);
        assert_eq!(int_octets(-129), vec![0xff, 0x7f]);
        assert_eq!(int_octets(1616), vec![0x06, 0x50]);
        assert_eq!(int_octets(i64::MIN).len(), 8);
    }

    #[test]
    fn integer_octets_decode_back() {
        for v in [0, 1, -1, 255, 256, -256, 65535, i32::MAX as i64, i64::MIN, i64::MAX] {
            assert_eq!(decode_integer(&int_octets(v)), Ok(v));
        }
    }
}
