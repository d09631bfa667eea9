//! Distinguished names.
//!
//! A [`Dn`] is parsed from its [RFC 4514](https://tools.ietf.org/html/rfc4514)
//! string form and can be compared structurally with other DNs. Its `Display`
//! implementation produces a canonical string: attribute types are lowercased,
//! attributes of a multi-valued RDN are sorted, and values are escaped uniformly.
//!
//! ```rust
//! use ldapmux::dn::Dn;
//!
//! let dn: Dn = "UID=jdoe, OU=People,dc=example,dc=com".parse().unwrap();
//! let base = Dn::parse("ou=people,dc=example,dc=com").unwrap();
//! assert!(base.ancestor_of_fold(&dn));
//! assert_eq!(dn.to_string(), "uid=jdoe,ou=People,dc=example,dc=com");
//! ```

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use crate::result::{LdapError, Result};

/// Single attribute type and value pair of an RDN.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeTypeAndValue {
    /// Attribute type, as given in the source string.
    pub attr_type: String,
    /// Unescaped attribute value.
    pub value: String,
}

impl AttributeTypeAndValue {
    fn equal(&self, other: &Self) -> bool {
        self.attr_type.eq_ignore_ascii_case(&other.attr_type) && self.value == other.value
    }

    fn equal_fold(&self, other: &Self) -> bool {
        self.attr_type.eq_ignore_ascii_case(&other.attr_type)
            && self.value.chars().map(simple_fold).eq(other.value.chars().map(simple_fold))
    }
}

impl fmt::Display for AttributeTypeAndValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attr_type = self.attr_type.to_ascii_lowercase();
        write!(f, "{}={}", dn_escape_type(&attr_type), dn_escape(self.value.as_str()))
    }
}

/// Relative distinguished name: an unordered set of attribute type and value pairs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rdn {
    pub attributes: Vec<AttributeTypeAndValue>,
}

impl Rdn {
    fn matches(&self, other: &Rdn, eq: fn(&AttributeTypeAndValue, &AttributeTypeAndValue) -> bool) -> bool {
        self.attributes.len() == other.attributes.len()
            && self
                .attributes
                .iter()
                .all(|a| other.attributes.iter().any(|b| eq(a, b)))
    }

    pub fn equal(&self, other: &Rdn) -> bool {
        self.matches(other, AttributeTypeAndValue::equal)
    }

    pub fn equal_fold(&self, other: &Rdn) -> bool {
        self.matches(other, AttributeTypeAndValue::equal_fold)
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.attributes.iter().map(ToString::to_string).collect();
        parts.sort();
        f.write_str(&parts.join("+"))
    }
}

/// Parsed distinguished name, most specific RDN first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dn {
    pub rdns: Vec<Rdn>,
}

impl Dn {
    /// Parse the string form of a DN. An empty or all-blank string is the empty DN.
    pub fn parse(s: &str) -> Result<Dn> {
        Parser::new(s).run()
    }

    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    pub fn len(&self) -> usize {
        self.rdns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Structural equality: attribute types compare case-insensitively,
    /// values exactly.
    pub fn equal(&self, other: &Dn) -> bool {
        self.len() == other.len() && self.rdns.iter().zip(&other.rdns).all(|(a, b)| a.equal(b))
    }

    /// Like [`equal()`](#method.equal), with values compared under Unicode simple case folding.
    pub fn equal_fold(&self, other: &Dn) -> bool {
        self.len() == other.len() && self.rdns.iter().zip(&other.rdns).all(|(a, b)| a.equal_fold(b))
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn ancestor_of(&self, other: &Dn) -> bool {
        self.is_suffix_of(other, Rdn::equal)
    }

    /// Like [`ancestor_of()`](#method.ancestor_of), with values compared under
    /// Unicode simple case folding.
    pub fn ancestor_of_fold(&self, other: &Dn) -> bool {
        self.is_suffix_of(other, Rdn::equal_fold)
    }

    fn is_suffix_of(&self, other: &Dn, eq: fn(&Rdn, &Rdn) -> bool) -> bool {
        if self.len() >= other.len() {
            return false;
        }
        let tail = &other.rdns[other.len() - self.len()..];
        self.rdns.iter().zip(tail).all(|(a, b)| eq(a, b))
    }
}

impl FromStr for Dn {
    type Err = LdapError;

    fn from_str(s: &str) -> Result<Dn> {
        Dn::parse(s)
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", rdn)?;
        }
        Ok(())
    }
}

/// Map a character to the smallest member of its simple case folding class.
fn simple_fold(c: char) -> char {
    fn single(mut it: impl Iterator<Item = char>) -> Option<char> {
        match (it.next(), it.next()) {
            (Some(c), None) => Some(c),
            _ => None,
        }
    }

    let lower = single(c.to_lowercase());
    let upper = single(c.to_uppercase());
    let upper_lower = upper.and_then(|u| single(u.to_lowercase()));
    let lower_upper = lower.and_then(|l| single(l.to_uppercase()));
    [Some(c), lower, upper, upper_lower, lower_upper]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(c)
}

fn parse_err<T>(msg: &str) -> Result<T> {
    Err(LdapError::DnParsing(msg.to_owned()))
}

// Accumulated field byte, with a flag telling whether it came from an escape.
type Field = Vec<(u8, bool)>;

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    rdns: Vec<Rdn>,
    current: Vec<AttributeTypeAndValue>,
    attr_type: Option<String>,
    field: Field,
}

impl<'a> Parser<'a> {
    fn new(s: &'a str) -> Parser<'a> {
        Parser {
            input: s.as_bytes(),
            pos: 0,
            rdns: Vec::new(),
            current: Vec::new(),
            attr_type: None,
            field: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Dn> {
        if self.input.iter().all(|&b| b == b' ') {
            return Ok(Dn::default());
        }
        while self.pos < self.input.len() {
            let b = self.input[self.pos];
            self.pos += 1;
            match b {
                b'\\' => self.escape()?,
                b'=' if self.attr_type.is_none() => {
                    let attr_type = trimmed(&self.field);
                    if attr_type.is_empty() {
                        return parse_err("empty attribute type");
                    }
                    if !attr_type
                        .iter()
                        .all(|&c| c.is_ascii_alphanumeric() || c == b'-' || c == b'.')
                    {
                        return parse_err("invalid attribute type");
                    }
                    self.attr_type = Some(String::from_utf8_lossy(&attr_type).into_owned());
                    self.field.clear();
                }
                b'+' | b',' | b';' => {
                    self.close_attribute()?;
                    if b != b'+' {
                        self.close_rdn();
                    }
                }
                b'"' => return parse_err("unescaped quote"),
                _ => self.field.push((b, false)),
            }
        }
        self.close_attribute()?;
        self.close_rdn();
        Ok(Dn { rdns: self.rdns })
    }

    fn escape(&mut self) -> Result<()> {
        let Some(&c) = self.input.get(self.pos) else {
            return parse_err("dangling escape");
        };
        if c.is_ascii_hexdigit() {
            let Some(&c2) = self.input.get(self.pos + 1).filter(|c| c.is_ascii_hexdigit()) else {
                return parse_err("incomplete hex escape");
            };
            self.field.push((hex_val(c) << 4 | hex_val(c2), true));
            self.pos += 2;
        } else if b" \"#+,;<=>\\".contains(&c) {
            self.field.push((c, true));
            self.pos += 1;
        } else {
            return parse_err("invalid escape");
        }
        Ok(())
    }

    fn close_attribute(&mut self) -> Result<()> {
        let Some(attr_type) = self.attr_type.take() else {
            return parse_err("missing '=' in attribute");
        };
        let field = std::mem::take(&mut self.field);
        let start = field.iter().position(|&(b, esc)| b != b' ' || esc).unwrap_or(field.len());
        let end = field.iter().rposition(|&(b, esc)| b != b' ' || esc).map_or(start, |p| p + 1);
        let field = &field[start..end];
        let value = match field.first() {
            Some(&(b'#', false)) => decode_hex_value(&field[1..])?,
            _ => {
                let bytes: Vec<u8> = field.iter().map(|&(b, _)| b).collect();
                String::from_utf8(bytes).map_err(|_| LdapError::DnParsing("invalid UTF-8 in value".to_owned()))?
            }
        };
        self.current.push(AttributeTypeAndValue { attr_type, value });
        Ok(())
    }

    fn close_rdn(&mut self) {
        self.rdns.push(Rdn {
            attributes: std::mem::take(&mut self.current),
        });
    }
}

fn trimmed(field: &Field) -> Vec<u8> {
    let bytes: Vec<u8> = field.iter().map(|&(b, _)| b).collect();
    bytes.trim_ascii().to_vec()
}

fn hex_val(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        _ => c - b'A' + 10,
    }
}

// `#` followed by the hex form of a BER-encoded value
fn decode_hex_value(field: &[(u8, bool)]) -> Result<String> {
    if field.len() % 2 != 0 || field.iter().any(|&(b, esc)| esc || !b.is_ascii_hexdigit()) {
        return parse_err("invalid hex-encoded value");
    }
    let ber: Vec<u8> = field
        .chunks(2)
        .map(|pair| hex_val(pair[0].0) << 4 | hex_val(pair[1].0))
        .collect();
    let (tag, _) = lber::decode(&ber)?;
    let contents = tag
        .expect_primitive()
        .ok_or_else(|| LdapError::DnParsing("constructed hex-encoded value".to_owned()))?;
    String::from_utf8(contents).map_err(|_| LdapError::DnParsing("invalid UTF-8 in value".to_owned()))
}

fn xdigit(c: u8) -> u8 {
    c + if c < 10 { b'0' } else { b'a' - 10 }
}

/// Escape an attribute value in a relative distinguished name (RDN).
///
/// When a literal string is used to represent an attribute value in an RDN,
/// some of its characters might need to be escaped according to the rules
/// of [RFC 4514](https://tools.ietf.org/html/rfc4514). Special characters are
/// escaped with a backslash, as are a leading space or `#` and a trailing space;
/// bytes outside printable ASCII are written as `\xx`.
///
/// The argument, `val`, can be owned or borrowed. The function doesn't
/// allocate the return value unless there's need to escape the input.
pub fn dn_escape<'a, S: Into<Cow<'a, str>>>(val: S) -> Cow<'a, str> {
    escape_with(val.into(), |_| false)
}

fn dn_escape_type(val: &str) -> Cow<'_, str> {
    escape_with(Cow::Borrowed(val), |c| c == b'=')
}

fn escape_with<'a>(val: Cow<'a, str>, extra: fn(u8) -> bool) -> Cow<'a, str> {
    let bytes = val.as_bytes();
    let last = bytes.len().saturating_sub(1);
    let special = |i: usize, c: u8| {
        b"\"+,;<>\\".contains(&c)
            || extra(c)
            || (i == 0 && (c == b' ' || c == b'#'))
            || (i == last && c == b' ')
    };
    let hex = |c: u8| !(0x20..0x7f).contains(&c);
    if !bytes.iter().enumerate().any(|(i, &c)| special(i, c) || hex(c)) {
        return val;
    }
    let mut out = String::with_capacity(bytes.len() + 12);
    for (i, &c) in bytes.iter().enumerate() {
        if hex(c) {
            out.push('\\');
            out.push(xdigit(c >> 4) as char);
            out.push(xdigit(c & 0xF) as char);
        } else {
            if special(i, c) {
                out.push('\\');
            }
            out.push(c as char);
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    #[test]
    fn multivalued_rdn_with_escape() {
        let d = dn("uid=john\\,smith+cn=John,ou=People,dc=example,dc=com");
        assert_eq!(d.len(), 4);
        let first = &d.rdns()[0].attributes;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].attr_type, "uid");
        assert_eq!(first[0].value, "john,smith");
        assert_eq!(first[1].value, "John");
        assert_eq!(d.to_string(), "cn=John+uid=john\\,smith,ou=People,dc=example,dc=com");
    }

    #[test]
    fn canonical_string_is_idempotent() {
        for s in [
            "CN=Steve Kille , O=Isode Limited;C=GB",
            "cn=\\ leading and trailing\\ ,dc=x",
            "ou=Sales+cn=J. Smith,dc=example",
            "cn=caf\\c3\\a9,dc=x",
            "",
        ] {
            let once = dn(s).to_string();
            assert_eq!(dn(&once).to_string(), once, "{}", s);
        }
        assert_eq!(dn("CN=Steve Kille , O=Isode Limited;C=GB").to_string(), "cn=Steve Kille,o=Isode Limited,c=GB");
    }

    #[test]
    fn escapes_preserved() {
        let d = dn("cn=\\ lead\\ ,dc=x");
        assert_eq!(d.rdns[0].attributes[0].value, " lead ");
        assert_eq!(d.to_string(), "cn=\\ lead\\ ,dc=x");
        let d = dn("cn=\\#hash,dc=x");
        assert_eq!(d.to_string(), "cn=\\#hash,dc=x");
        let d = dn("cn=caf\\C3\\A9");
        assert_eq!(d.rdns[0].attributes[0].value, "café");
        assert_eq!(d.to_string(), "cn=caf\\c3\\a9");
    }

    #[test]
    fn hex_ber_value() {
        // UTF8String "Hi"
        let d = dn("1.3.6.1.4.1.1466.0=#0c024869,dc=x");
        assert_eq!(d.rdns[0].attributes[0].value, "Hi");
        assert!(Dn::parse("cn=#0c02").is_err());
        assert!(Dn::parse("cn=#0c0").is_err());
    }

    #[test]
    fn malformed() {
        for s in ["cn", "cn=a,", "=a", "cn=a\\", "cn=a\\x", "cn=\\4", "c n=a", "cn=\"q\""] {
            assert!(matches!(Dn::parse(s), Err(LdapError::DnParsing(_))), "{}", s);
        }
    }

    #[test]
    fn equality() {
        let a = dn("cn=John+uid=j,dc=Example");
        let b = dn("UID=j+CN=John,DC=Example");
        assert!(a.equal(&b));
        assert!(a.equal(&a));
        assert!(!a.equal(&dn("cn=john+uid=j,dc=example")));
        assert!(a.equal_fold(&dn("cn=john+uid=J,dc=EXAMPLE")));
        assert!(!a.equal_fold(&dn("cn=john,dc=example")));
    }

    #[test]
    fn fold_uses_case_classes() {
        assert_eq!(simple_fold('k'), 'K');
        assert_eq!(simple_fold('\u{212A}'), 'K');
        assert_eq!(simple_fold('\u{17F}'), 'S');
        assert_eq!(simple_fold('7'), '7');
        assert!(dn("cn=\u{212A}elvin").equal_fold(&dn("cn=kelvin")));
    }

    #[test]
    fn ancestry() {
        let base = dn("dc=example,dc=com");
        let child = dn("ou=People,dc=example,dc=com");
        assert!(base.ancestor_of(&child));
        assert!(!child.ancestor_of(&base));
        assert!(!base.ancestor_of(&base));
        assert!(!dn("DC=EXAMPLE,dc=com").ancestor_of(&child));
        assert!(dn("DC=EXAMPLE,dc=com").ancestor_of_fold(&child));
        assert!(Dn::default().ancestor_of(&base));
    }

    #[test]
    fn escape_helper() {
        assert_eq!(dn_escape("plain"), "plain");
        assert!(matches!(dn_escape("plain"), Cow::Borrowed(_)));
        assert_eq!(dn_escape(" a+b "), "\\ a\\+b\\ ");
        assert_eq!(dn_escape("#x"), "\\#x");
        assert_eq!(dn_escape("nul\0"), "nul\\00");
    }
}
