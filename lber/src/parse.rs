use std::convert::TryFrom;

use crate::common::TagClass;
use crate::common::TagStructure;
use crate::error::DecodeError;
use crate::structure::{StructureTag, PL};

use nom::bits::streaming as bits;
use nom::bytes::streaming::take;
use nom::combinator::map_opt;
use nom::error::{Error, ErrorKind, ParseError};
use nom::number::streaming as number;
use nom::sequence::tuple;
use nom::{IResult, Needed};

const MAX_DEPTH: usize = 64;

enum Length {
    Definite(usize),
    Indefinite,
}

fn fail<T>(i: &[u8], kind: ErrorKind) -> IResult<&[u8], T> {
    Err(nom::Err::Failure(Error::from_error_kind(i, kind)))
}

fn class_bits(i: (&[u8], usize)) -> nom::IResult<(&[u8], usize), TagClass> {
    map_opt(bits::take(2usize), TagClass::from_u8)(i)
}

fn pc_bit(i: (&[u8], usize)) -> nom::IResult<(&[u8], usize), TagStructure> {
    map_opt(bits::take(1usize), TagStructure::from_u8)(i)
}

fn tagnr_bits(i: (&[u8], usize)) -> nom::IResult<(&[u8], usize), u64> {
    bits::take(5usize)(i)
}

fn parse_type_header(i: &[u8]) -> IResult<&[u8], (TagClass, TagStructure, u64)> {
    let (mut i, (class, structure, low)) = nom::bits(tuple((class_bits, pc_bit, tagnr_bits)))(i)?;
    if low < 0x1F {
        return Ok((i, (class, structure, low)));
    }
    // High tag number: base-128 groups, high bit set on all but the last.
    let mut id = 0u64;
    loop {
        let (j, byte) = number::be_u8(i)?;
        i = j;
        if id >> 57 != 0 {
            return fail(i, ErrorKind::TagBits);
        }
        id = (id << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            break;
        }
    }
    Ok((i, (class, structure, id)))
}

fn parse_length(i: &[u8]) -> IResult<&[u8], Length> {
    let (i, len) = number::be_u8(i)?;
    match len {
        0..=0x7F => Ok((i, Length::Definite(len as usize))),
        0x80 => Ok((i, Length::Indefinite)),
        0xFF => fail(i, ErrorKind::LengthValue),
        _ => {
            let count = (len & 0x7F) as usize;
            if count > std::mem::size_of::<u64>() {
                return fail(i, ErrorKind::TooLarge);
            }
            let (i, b) = take(count)(i)?;
            let (_, len) = parse_uint(b)?;
            let len = usize::try_from(len)
                .map_err(|_| nom::Err::Failure(Error::from_error_kind(i, ErrorKind::TooLarge)))?;
            Ok((i, Length::Definite(len)))
        }
    }
}

/// Extract an unsigned integer value from BER data.
pub fn parse_uint(i: &[u8]) -> nom::IResult<&[u8], u64> {
    Ok((i, i.iter().fold(0, |res, &byte| (res << 8) | byte as u64)))
}

fn parse_tag_at(i: &[u8], depth: usize) -> IResult<&[u8], StructureTag> {
    if depth > MAX_DEPTH {
        return fail(i, ErrorKind::Count);
    }
    let (i, ((class, structure, id), len)) = tuple((parse_type_header, parse_length))(i)?;

    let (i, payload) = match (structure, len) {
        (TagStructure::Primitive, Length::Indefinite) => return fail(i, ErrorKind::Verify),
        (TagStructure::Primitive, Length::Definite(len)) => {
            let (i, content) = take(len)(i)?;
            (i, PL::P(content.to_vec()))
        }
        (TagStructure::Constructed, Length::Definite(len)) => {
            let (i, mut content) = take(len)(i)?;
            let mut children = Vec::new();
            while !content.is_empty() {
                // The enclosing length is known, so a short child is a hard error.
                let (rest, child) = match parse_tag_at(content, depth + 1) {
                    Err(nom::Err::Incomplete(_)) => return fail(content, ErrorKind::Eof),
                    other => other?,
                };
                content = rest;
                children.push(child);
            }
            (i, PL::C(children))
        }
        (TagStructure::Constructed, Length::Indefinite) => {
            let mut i = i;
            let mut children = Vec::new();
            loop {
                if i.len() < 2 {
                    return Err(nom::Err::Incomplete(Needed::new(2 - i.len())));
                }
                if i[0] == 0 && i[1] == 0 {
                    i = &i[2..];
                    break;
                }
                let (rest, child) = parse_tag_at(i, depth + 1)?;
                i = rest;
                children.push(child);
            }
            (i, PL::C(children))
        }
    };

    Ok((i, StructureTag { class, id, payload }))
}

/// Parse raw BER data into a serializable structure.
///
/// The parser is streaming: `Err(nom::Err::Incomplete(_))` means that the input
/// ends before the outermost value does, and more data should be read.
pub fn parse_tag(i: &[u8]) -> IResult<&[u8], StructureTag> {
    parse_tag_at(i, 0)
}

/// Parse a value and also return the exact span of input bytes it came from.
pub fn parse_tag_raw(i: &[u8]) -> IResult<&[u8], (StructureTag, &[u8])> {
    let (rest, tag) = parse_tag(i)?;
    let consumed = i.len() - rest.len();
    Ok((rest, (tag, &i[..consumed])))
}

/// Read only the identifier and length octets of the value at the start of `i`,
/// returning the total number of bytes the value occupies. Indefinite length
/// yields `None`.
///
/// A stream reader can use this to refuse an oversized value before buffering it.
pub fn parse_encoded_len(i: &[u8]) -> IResult<&[u8], Option<usize>> {
    let (rest, (_, len)) = tuple((parse_type_header, parse_length))(i)?;
    let header = i.len() - rest.len();
    match len {
        Length::Definite(len) => Ok((rest, Some(header.saturating_add(len)))),
        Length::Indefinite => Ok((rest, None)),
    }
}

/// Decode a single complete value, returning it with the number of bytes consumed.
///
/// Unlike [`parse_tag`], input which ends too early is an error.
pub fn decode(i: &[u8]) -> Result<(StructureTag, usize), DecodeError> {
    let (rest, tag) = parse_tag(i)?;
    Ok((tag, i.len() - rest.len()))
}

pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse<'a>(
        &mut self,
        input: &'a [u8],
    ) -> IResult<&'a [u8], StructureTag, nom::error::Error<&'a [u8]>> {
        if input.is_empty() {
            return Err(nom::Err::Incomplete(Needed::Unknown));
        };
        parse_tag(input)
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}
