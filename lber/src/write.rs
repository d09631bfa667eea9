//! BER encoding support.
//!
//! The encoder always emits the shortest definite length form.
use crate::common::{TagClass, TagStructure};
use crate::structure::{StructureTag, PL};
use bytes::BytesMut;

/// BER-encode a tag structure into the provided buffer.
pub fn encode_into(buf: &mut BytesMut, tag: StructureTag) {
    let mut out = Vec::new();
    encode_inner(&mut out, tag);
    buf.extend_from_slice(&out);
}

/// BER-encode a tag structure into a fresh vector.
pub fn encode(tag: StructureTag) -> Vec<u8> {
    let mut out = Vec::new();
    encode_inner(&mut out, tag);
    out
}

fn encode_inner(out: &mut Vec<u8>, tag: StructureTag) {
    match tag.payload {
        PL::P(v) => {
            write_identifier(out, tag.class, TagStructure::Primitive, tag.id);
            write_length(out, v.len());
            out.extend(v);
        }
        PL::C(children) => {
            let mut body = Vec::new();
            for child in children {
                encode_inner(&mut body, child);
            }
            write_identifier(out, tag.class, TagStructure::Constructed, tag.id);
            write_length(out, body.len());
            out.extend(body);
        }
    }
}

fn write_identifier(out: &mut Vec<u8>, class: TagClass, structure: TagStructure, id: u64) {
    let lead = (class as u8) << 6 | (structure as u8) << 5;
    if id < 0x1F {
        out.push(lead | id as u8);
        return;
    }
    out.push(lead | 0x1F);
    // Base-128, most significant group first, continuation bit on all but the last.
    let mut groups = [0u8; 10];
    let mut n = 0;
    let mut rem = id;
    loop {
        groups[n] = (rem & 0x7F) as u8;
        n += 1;
        rem >>= 7;
        if rem == 0 {
            break;
        }
    }
    for k in (0..n).rev() {
        out.push(if k > 0 { groups[k] | 0x80 } else { groups[k] });
    }
}

fn write_length(out: &mut Vec<u8>, length: usize) {
    if length < 128 {
        out.push(length as u8);
        return;
    }
    let repr = (length as u64).to_be_bytes();
    let skip = repr.iter().take_while(|&&b| b == 0).count();
    out.push(0x80 | (repr.len() - skip) as u8);
    out.extend_from_slice(&repr[skip..]);
}
