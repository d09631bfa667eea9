//! Search filter compilation and rendering.
//!
//! [`parse()`] compiles the [RFC 4515](https://tools.ietf.org/html/rfc4515) string
//! form of a filter into the BER tree sent in a Search request. [`decompile()`] does
//! the reverse, producing a string which compiles back to an identical tree.

use std::borrow::Cow;

use crate::result::{LdapError, Result};

use lber::common::TagClass;
use lber::structure::{StructureTag, PL};
use lber::structures::{Boolean, ExplicitTag, OctetString, Sequence, Tag};

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::{char, digit1, satisfy};
use nom::combinator::{map, map_opt, opt, peek, recognize, value, verify};
use nom::error::{Error, ErrorKind};
use nom::multi::{many0, separated_list1};
use nom::sequence::{delimited, pair, preceded, terminated};
use nom::IResult;

/// Compile a filter string.
///
/// A parenthesized filter and a bare simple item (`cn=x`) are both accepted.
/// Unbalanced parentheses, an empty filter, invalid escapes or a substring
/// assertion with consecutive asterisks are rejected.
pub fn parse(input: impl AsRef<[u8]>) -> Result<Tag> {
    let input = input.as_ref();
    if input.is_empty() {
        return Err(LdapError::FilterParsing("empty filter".to_owned()));
    }
    match alt((parenthesized, item))(input) {
        Ok((rest, t)) if rest.is_empty() => Ok(t),
        Ok((rest, _)) => Err(LdapError::FilterParsing(format!(
            "unexpected input at offset {}",
            input.len() - rest.len()
        ))),
        Err(_) => Err(LdapError::FilterParsing(format!(
            "malformed filter: {}",
            String::from_utf8_lossy(input)
        ))),
    }
}

/// Context tags of the Filter CHOICE.
mod choice {
    pub const AND: u64 = 0;
    pub const OR: u64 = 1;
    pub const NOT: u64 = 2;
    pub const EQUALITY: u64 = 3;
    pub const SUBSTRINGS: u64 = 4;
    pub const GREATER_OR_EQUAL: u64 = 5;
    pub const LESS_OR_EQUAL: u64 = 6;
    pub const PRESENT: u64 = 7;
    pub const APPROX: u64 = 8;
    pub const EXTENSIBLE: u64 = 9;
}

mod substring {
    pub const INITIAL: u64 = 0;
    pub const ANY: u64 = 1;
    pub const FINAL: u64 = 2;
}

/// Components of MatchingRuleAssertion.
mod rule {
    pub const MATCHING_RULE: u64 = 1;
    pub const TYPE: u64 = 2;
    pub const VALUE: u64 = 3;
    pub const DN_ATTRIBUTES: u64 = 4;
}

fn reject<T>(i: &[u8]) -> IResult<&[u8], T> {
    Err(nom::Err::Error(Error::new(i, ErrorKind::Verify)))
}

fn parenthesized(i: &[u8]) -> IResult<&[u8], Tag> {
    delimited(char('('), component, char(')'))(i)
}

fn component(i: &[u8]) -> IResult<&[u8], Tag> {
    alt((
        map(preceded(char('&'), many0(parenthesized)), |set| {
            filter_set(choice::AND, set)
        }),
        map(preceded(char('|'), many0(parenthesized)), |set| {
            filter_set(choice::OR, set)
        }),
        map(preceded(char('!'), parenthesized), |inner| {
            Tag::ExplicitTag(ExplicitTag {
                class: TagClass::Context,
                id: choice::NOT,
                inner: Box::new(inner),
            })
        }),
        item,
    ))(i)
}

fn filter_set(id: u64, inner: Vec<Tag>) -> Tag {
    Tag::Sequence(Sequence {
        class: TagClass::Context,
        id,
        inner,
    })
}

fn item(i: &[u8]) -> IResult<&[u8], Tag> {
    alt((assertion, extensible))(i)
}

fn assertion(i: &[u8]) -> IResult<&[u8], Tag> {
    let (i, attr) = attribute_description(i)?;
    let (i, op) = alt((
        value(choice::GREATER_OR_EQUAL, tag(b">=")),
        value(choice::LESS_OR_EQUAL, tag(b"<=")),
        value(choice::APPROX, tag(b"~=")),
        value(choice::EQUALITY, tag(b"=")),
    ))(i)?;
    if op != choice::EQUALITY {
        let (i, val) = assertion_value(i)?;
        return Ok((i, value_assertion(op, attr, val)));
    }
    let (rest, mut pieces) = separated_list1(char('*'), assertion_value)(i)?;
    let tag = match pieces.len() {
        1 => value_assertion(choice::EQUALITY, attr, pieces.remove(0)),
        2 if pieces.iter().all(Vec::is_empty) => context_octets(choice::PRESENT, attr.to_vec()),
        _ => match substrings(attr, pieces) {
            Some(tag) => tag,
            None => return reject(i),
        },
    };
    Ok((rest, tag))
}

/// Build a substring assertion from the pieces between asterisks. Only the
/// first and the last piece may be empty.
fn substrings(attr: &[u8], pieces: Vec<Vec<u8>>) -> Option<Tag> {
    let last = pieces.len() - 1;
    let mut subs = Vec::with_capacity(pieces.len());
    for (n, piece) in pieces.into_iter().enumerate() {
        let id = match n {
            0 => substring::INITIAL,
            n if n == last => substring::FINAL,
            _ => substring::ANY,
        };
        match (piece.is_empty(), id) {
            (true, substring::ANY) => return None,
            (true, _) => (),
            (false, id) => subs.push(context_octets(id, piece)),
        }
    }
    Some(Tag::Sequence(Sequence {
        class: TagClass::Context,
        id: choice::SUBSTRINGS,
        inner: vec![
            octets(attr.to_vec()),
            Tag::Sequence(Sequence {
                inner: subs,
                ..Default::default()
            }),
        ],
    }))
}

/// `[attr][:dn][:rule]:=value`, where at least one of the attribute and the
/// matching rule must be present.
fn extensible(i: &[u8]) -> IResult<&[u8], Tag> {
    let (i, attr) = opt(attribute_description)(i)?;
    let (i, dn) = opt(terminated(tag(b":dn"), peek(char(':'))))(i)?;
    let (i, mrule) = opt(preceded(char(':'), attribute_type))(i)?;
    let (i, _) = tag(b":=")(i)?;
    if attr.is_none() && mrule.is_none() {
        return reject(i);
    }
    let (i, val) = assertion_value(i)?;
    let mut inner = Vec::with_capacity(4);
    if let Some(mrule) = mrule {
        inner.push(context_octets(rule::MATCHING_RULE, mrule.to_vec()));
    }
    if let Some(attr) = attr {
        inner.push(context_octets(rule::TYPE, attr.to_vec()));
    }
    inner.push(context_octets(rule::VALUE, val));
    if dn.is_some() {
        inner.push(Tag::Boolean(Boolean {
            class: TagClass::Context,
            id: rule::DN_ATTRIBUTES,
            inner: true,
        }));
    }
    Ok((
        i,
        Tag::Sequence(Sequence {
            class: TagClass::Context,
            id: choice::EXTENSIBLE,
            inner,
        }),
    ))
}

fn octets(inner: Vec<u8>) -> Tag {
    Tag::OctetString(OctetString {
        inner,
        ..Default::default()
    })
}

fn context_octets(id: u64, inner: Vec<u8>) -> Tag {
    Tag::OctetString(OctetString {
        class: TagClass::Context,
        id,
        inner,
    })
}

fn value_assertion(id: u64, attr: &[u8], val: Vec<u8>) -> Tag {
    Tag::Sequence(Sequence {
        class: TagClass::Context,
        id,
        inner: vec![octets(attr.to_vec()), octets(val)],
    })
}

// Parentheses, asterisk, backslash and NUL must appear as \xx escapes in a
// value; any other byte may.
fn assertion_value(i: &[u8]) -> IResult<&[u8], Vec<u8>> {
    map_opt(
        take_while(|c: u8| !matches!(c, 0 | b'(' | b')' | b'*')),
        unescape,
    )(i)
}

fn unescape(raw: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter().copied();
    while let Some(c) = bytes.next() {
        if c != b'\\' {
            out.push(c);
            continue;
        }
        let hi = hex_digit(bytes.next()?)?;
        let lo = hex_digit(bytes.next()?)?;
        out.push(hi << 4 | lo);
    }
    Some(out)
}

fn hex_digit(c: u8) -> Option<u8> {
    (c as char).to_digit(16).map(|d| d as u8)
}

fn attribute_description(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(pair(
        attribute_type,
        many0(pair(char(';'), take_while1(is_keychar))),
    ))(i)
}

fn attribute_type(i: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((numeric_oid, keystring))(i)
}

fn is_keychar(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'-'
}

fn keystring(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic()),
        take_while(is_keychar),
    ))(i)
}

// Arcs are decimal numbers without leading zeroes.
fn numeric_oid(i: &[u8]) -> IResult<&[u8], &[u8]> {
    recognize(separated_list1(
        char('.'),
        verify(digit1, |d: &[u8]| d.len() == 1 || d[0] != b'0'),
    ))(i)
}

/// Escape a filter literal.
///
/// Literal values appearing in an LDAP filter can contain any character,
/// but some characters (parentheses, asterisk, backslash, NUL) must be
/// escaped in the filter's string representation. This function does the
/// escaping.
///
/// The argument, `lit`, can be owned or borrowed. The function doesn't
/// allocate the return value unless there's need to escape the input.
pub fn ldap_escape<'a, S: Into<Cow<'a, str>>>(lit: S) -> Cow<'a, str> {
    let lit = lit.into();
    if !lit.bytes().any(needs_escape) {
        return lit;
    }
    let mut output = String::with_capacity(lit.len() + 12);
    for c in lit.chars() {
        if c.is_ascii() && needs_escape(c as u8) {
            push_hex(&mut output, c as u8);
        } else {
            output.push(c);
        }
    }
    Cow::Owned(output)
}

fn needs_escape(c: u8) -> bool {
    c == b'\\' || c == b'*' || c == b'(' || c == b')' || c == 0
}

fn push_hex(out: &mut String, c: u8) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    out.push('\\');
    out.push(HEX[(c >> 4) as usize] as char);
    out.push(HEX[(c & 0xF) as usize] as char);
}

/// Render a compiled filter back into its string form.
///
/// Assertion values are escaped so that the result compiles to the same tree.
/// Bytes which don't form valid UTF-8 are written as `\xx` escapes.
pub fn decompile(t: &StructureTag) -> Result<String> {
    let mut out = String::new();
    decompile_into(t, &mut out)?;
    Ok(out)
}

fn decompile_into(t: &StructureTag, out: &mut String) -> Result<()> {
    if t.class != TagClass::Context {
        return Err(LdapError::malformed("filter choice"));
    }
    out.push('(');
    match (t.id, &t.payload) {
        (choice::AND | choice::OR, PL::C(children)) => {
            out.push(if t.id == choice::AND { '&' } else { '|' });
            for child in children {
                decompile_into(child, out)?;
            }
        }
        (choice::NOT, PL::C(children)) if children.len() == 1 => {
            out.push('!');
            decompile_into(&children[0], out)?;
        }
        (
            choice::EQUALITY | choice::GREATER_OR_EQUAL | choice::LESS_OR_EQUAL | choice::APPROX,
            PL::C(children),
        ) if children.len() == 2 => {
            out.push_str(&attr_text(&children[0])?);
            out.push_str(match t.id {
                choice::EQUALITY => "=",
                choice::GREATER_OR_EQUAL => ">=",
                choice::LESS_OR_EQUAL => "<=",
                _ => "~=",
            });
            push_value(out, primitive(&children[1])?);
        }
        (choice::SUBSTRINGS, PL::C(children)) if children.len() == 2 => {
            out.push_str(&attr_text(&children[0])?);
            out.push('=');
            let subs = children[1]
                .children()
                .ok_or(LdapError::malformed("substrings"))?;
            let mut final_part = None;
            for (n, sub) in subs.iter().enumerate() {
                let val = primitive(sub)?;
                match sub.id {
                    substring::INITIAL if n == 0 => push_value(out, val),
                    substring::ANY if final_part.is_none() => {
                        out.push('*');
                        push_value(out, val);
                    }
                    substring::FINAL if final_part.is_none() => final_part = Some(val),
                    _ => return Err(LdapError::malformed("substring order")),
                }
            }
            out.push('*');
            if let Some(val) = final_part {
                push_value(out, val);
            }
        }
        (choice::PRESENT, PL::P(attr)) => {
            out.push_str(&utf8(attr)?);
            out.push_str("=*");
        }
        (choice::EXTENSIBLE, PL::C(children)) => {
            let (mut mrule, mut attr, mut val, mut dn) = (None, None, None, false);
            for child in children {
                match child.id {
                    rule::MATCHING_RULE => mrule = Some(utf8(primitive(child)?)?),
                    rule::TYPE => attr = Some(utf8(primitive(child)?)?),
                    rule::VALUE => val = Some(primitive(child)?),
                    rule::DN_ATTRIBUTES => dn = lber::value::decode_boolean(primitive(child)?)?,
                    _ => return Err(LdapError::malformed("extensible match component")),
                }
            }
            if let Some(attr) = attr {
                out.push_str(&attr);
            }
            if dn {
                out.push_str(":dn");
            }
            if let Some(mrule) = mrule {
                out.push(':');
                out.push_str(&mrule);
            }
            out.push_str(":=");
            push_value(out, val.ok_or(LdapError::malformed("extensible match value"))?);
        }
        _ => return Err(LdapError::malformed("filter choice")),
    }
    out.push(')');
    Ok(())
}

fn primitive(t: &StructureTag) -> Result<&[u8]> {
    t.as_primitive().ok_or(LdapError::malformed("filter value"))
}

fn utf8(v: &[u8]) -> Result<String> {
    String::from_utf8(v.to_vec()).map_err(|_| LdapError::DecodingUTF8)
}

fn attr_text(t: &StructureTag) -> Result<String> {
    utf8(primitive(t)?)
}

fn push_value(out: &mut String, val: &[u8]) {
    match std::str::from_utf8(val) {
        Ok(s) => out.push_str(&ldap_escape(s)),
        Err(_) => {
            for &c in val {
                if c.is_ascii() && !needs_escape(c) {
                    out.push(c as char);
                } else {
                    push_hex(out, c);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lber::structures::ASNTag;

    fn compiles_to(filter: &str, ber: &[u8]) {
        let tag = parse(filter).unwrap_or_else(|e| panic!("{filter}: {e}"));
        assert_eq!(lber::encode(tag.into_structure()), ber, "{filter}");
    }

    fn rejected(filter: &str) {
        assert!(
            matches!(parse(filter), Err(LdapError::FilterParsing(_))),
            "{filter} was accepted"
        );
    }

    fn decompiled(filter: &str) -> String {
        let tree = parse(filter).unwrap().into_structure();
        let text = decompile(&tree).unwrap();
        assert_eq!(parse(&text).unwrap().into_structure(), tree, "{filter} -> {text}");
        text
    }

    #[test]
    fn equality_with_and_without_parens() {
        compiles_to("(a=v)", b"\xa3\x06\x04\x01a\x04\x01v");
        compiles_to("a=v", b"\xa3\x06\x04\x01a\x04\x01v");
        compiles_to("(a=ć)", b"\xa3\x07\x04\x01a\x04\x02\xc4\x87");
    }

    #[test]
    fn ordering_and_approx() {
        compiles_to("(a>=2)", b"\xa5\x06\x04\x01a\x04\x012");
        compiles_to("(a<=2)", b"\xa6\x06\x04\x01a\x04\x012");
        compiles_to("(a~=2)", b"\xa8\x06\x04\x01a\x04\x012");
    }

    #[test]
    fn presence_and_substrings() {
        compiles_to("(a=*)", b"\x87\x01a");
        compiles_to("(a=v*)", b"\xa4\x08\x04\x01a0\x03\x80\x01v");
        compiles_to("(a=*v)", b"\xa4\x08\x04\x01a0\x03\x82\x01v");
        compiles_to("(a=*v*)", b"\xa4\x08\x04\x01a0\x03\x81\x01v");
        compiles_to("(a=v*x*y)", b"\xa4\x0e\x04\x01a0\t\x80\x01v\x81\x01x\x82\x01y");
    }

    #[test]
    fn consecutive_asterisks() {
        rejected("(a=f**)");
        rejected("(a=f**g)");
        rejected("(a=**)");
    }

    #[test]
    fn escaped_values() {
        compiles_to("(a=v\\2ax)", b"\xa3\x08\x04\x01a\x04\x03v*x");
        compiles_to("(a=\\28\\29\\5C\\00)", b"\xa3\x09\x04\x01a\x04\x04()\\\x00");
        rejected("(a=v\\2)");
        rejected("(a=v\\0x)");
        rejected("(a=v\\)");
    }

    #[test]
    fn attribute_forms() {
        compiles_to("(2.5.4.3=v)", b"\xa3\x0c\x04\x072.5.4.3\x04\x01v");
        compiles_to("(cn;lang-en=v)", b"\xa3\x0f\x04\x0acn;lang-en\x04\x01v");
        rejected("(2.5.04.0=top)");
        rejected("(1cn=v)");
        rejected("(=v)");
    }

    #[test]
    fn sets_and_negation() {
        compiles_to(
            "(&(a=v)(b=x)(!(c=y)))",
            b"\xa0\x1a\xa3\x06\x04\x01a\x04\x01v\xa3\x06\x04\x01b\x04\x01x\xa2\x08\xa3\x06\x04\x01c\x04\x01y",
        );
        compiles_to("(&)", b"\xa0\x00");
        compiles_to("(|)", b"\xa1\x00");
        rejected("(!)");
        rejected("(!(a=v)(b=v))");
    }

    #[test]
    fn extensible_match() {
        compiles_to("(ou:dn:=People)", b"\xa9\x0f\x82\x02ou\x83\x06People\x84\x01\xff");
        compiles_to("(cn:2.5.13.5:=J D)", b"\xa9\x13\x81\x082.5.13.5\x82\x02cn\x83\x03J D");
        compiles_to(
            "(:dn:2.5.13.5:=x)",
            b"\xa9\x10\x81\x082.5.13.5\x83\x01x\x84\x01\xff",
        );
        compiles_to(
            "(cn:dnMatch:=x)",
            b"\xa9\x10\x81\x07dnMatch\x82\x02cn\x83\x01x",
        );
        rejected("(:=x)");
        rejected("(:dn:=x)");
    }

    #[test]
    fn malformed_structure() {
        for f in ["", "(", "(a=v", "a=v)", "((a=v)", "(&(a=v)", "()", "(a=v)garbage"] {
            rejected(f);
        }
    }

    #[test]
    fn decompile_is_canonical() {
        assert_eq!(decompiled("a=v"), "(a=v)");
        for f in [
            "(objectClass=person)",
            "(a=v*x*y)",
            "(a=*v)",
            "(a=v*)",
            "(a=*x*)",
            "(a=*)",
            "(a=v\\2ax\\28\\29)",
            "(&(a=v)(|(b>=1)(c<=2))(!(d~=x)))",
            "(ou:dn:=People)",
            "(:dn:2.5.13.5:=x)",
            "(a=\\ff\\fe)",
            "(&)",
        ] {
            assert_eq!(decompiled(f), f);
        }
    }

    #[test]
    fn decompile_rejects_non_filter() {
        let t = lber::structures::Integer::default().into_structure();
        assert!(decompile(&t).is_err());
    }

    #[test]
    fn escape() {
        assert_eq!(ldap_escape("a*b(c)\\"), "a\\2ab\\28c\\29\\5c");
        assert!(matches!(ldap_escape("plain"), Cow::Borrowed(_)));
        assert_eq!(ldap_escape("Ä"), "Ä");
    }
}
