//! Operation result structures and helpers.
//!
//! Most LDAP operations return an [`LdapResult`](struct.LdapResult.html). This module
//! contains its definition, the library error type, and a number of wrapper structs
//! with helper methods which adapt LDAP result handling to Rust conventions.

use std::error::Error;
use std::fmt;
use std::io;
use std::result::Result as StdResult;

use crate::controls::Control;
use crate::exop::Exop;
use crate::ldap::SaslCreds;
use crate::search::{parse_refs, ResultEntry};

use lber::common::TagClass;
use lber::structure::StructureTag;
use lber::structures::Tag;
use lber::universal::Types;
use lber::value::decode_integer;
use lber::DecodeError;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time;

/// Type alias for the standard `Result` with the fixed `LdapError` error part.
pub type Result<T> = std::result::Result<T, LdapError>;

/// Error variants recognized by the library.
#[derive(Debug, Error)]
pub enum LdapError {
    /// No path given for a `ldapi://` URL.
    #[error("empty Unix domain socket path")]
    EmptyUnixPath,

    /// A `ldapi://` URL contains a port spec, which it shouldn't.
    #[error("the port must be empty in the ldapi scheme")]
    PortInUnixPath,

    /// The existing stream in `LdapConnSettings` doesn't match the URL.
    #[error("the stream type in LdapConnSettings does not match the URL")]
    MismatchedStreamType,

    /// Encapsulated I/O error.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// The connection task has exited; the reason, if any, is available
    /// from [`Ldap::last_error()`](../struct.Ldap.html#method.last_error).
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation or connection timeout.
    #[error("timeout: {elapsed}")]
    Timeout {
        #[from]
        elapsed: time::error::Elapsed,
    },

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// Malformed BER on the wire, or a well-formed value of the wrong shape.
    #[error("decoding error: {source}")]
    Decoding {
        #[from]
        source: DecodeError,
    },

    /// Error parsing the string representation of a search filter.
    #[error("filter parse error: {0}")]
    FilterParsing(String),

    /// Error parsing the string representation of a DN.
    #[error("DN parse error: {0}")]
    DnParsing(String),

    /// Simple Bind with an empty password, which would be an anonymous or
    /// unauthenticated bind; use `unauthenticated_bind()` for that.
    #[error("empty password not allowed by the client")]
    EmptyPassword,

    /// Premature end of a search stream.
    #[error("premature end of search stream")]
    EndOfStream,

    /// URL parsing error.
    #[error("url parse error: {source}")]
    UrlParsing {
        #[from]
        source: url::ParseError,
    },

    /// Unknown LDAP URL scheme.
    #[error("unknown LDAP URL scheme: {0}")]
    UnknownScheme(String),

    #[cfg(feature = "tls-native")]
    /// Native TLS library error.
    #[error("native TLS error: {source}")]
    NativeTLS {
        #[from]
        source: native_tls::Error,
    },

    #[cfg(feature = "tls-rustls")]
    /// Rustls library error.
    #[error("rustls error: {source}")]
    Rustls {
        #[from]
        source: rustls::Error,
    },

    #[cfg(feature = "tls-rustls")]
    /// Rustls DNS name error.
    #[error("rustls DNS error: {source}")]
    DNSName {
        #[from]
        source: rustls::pki_types::InvalidDnsNameError,
    },

    /// LDAP operation result with an error return code.
    #[error("LDAP operation result: {result}")]
    LdapResult {
        #[from]
        result: LdapResult,
    },

    /// The Search returned more entries than the size limit allowed. The partial
    /// result includes the entry which exceeded the limit.
    #[error("size limit exceeded after {} entries", partial.0.len())]
    SizeLimitExceeded { partial: Box<SearchResult> },

    /// No values provided for the Add operation.
    #[error("empty value set for Add")]
    AddNoValues,

    /// A paged Search was given a paging control whose size differs from the
    /// requested page size.
    #[error("paging control size {attached} does not match page size {requested}")]
    PagingSizeMismatch { requested: i32, attached: i32 },

    /// Error converting an octet- or percent-decoded string to UTF-8.
    #[error("utf8 decoding error")]
    DecodingUTF8,

    #[cfg(feature = "ntlm")]
    /// SSPI error in NTLM processing.
    #[error("SSPI NTLM error: {source}")]
    SSPIError {
        #[from]
        source: sspi::Error,
    },

    #[cfg(feature = "ntlm")]
    /// Invalid username format for NTLM.
    #[error("NTLM username error: {0}")]
    NtlmUsername(String),

    #[cfg(feature = "ntlm")]
    /// No CHALLENGE token received in NTLM exchange.
    #[error("no CHALLENGE token received in NTLM exchange")]
    NoNtlmChallengeToken,
}

/// Broad classes of failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Socket, timeout or TLS failure; the connection is unusable.
    Network,
    /// Malformed wire data; the connection is closed.
    Decoding,
    /// Non-success LDAP result code.
    Protocol,
    /// Invalid arguments, rejected before any network I/O.
    Usage,
    /// Caller-requested cancellation.
    Cancelled,
}

impl LdapError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            LdapError::Io { .. }
            | LdapError::ConnectionClosed
            | LdapError::Timeout { .. }
            | LdapError::EndOfStream => ErrorCategory::Network,
            #[cfg(feature = "tls-native")]
            LdapError::NativeTLS { .. } => ErrorCategory::Network,
            #[cfg(feature = "tls-rustls")]
            LdapError::Rustls { .. } | LdapError::DNSName { .. } => ErrorCategory::Network,
            LdapError::Decoding { .. } | LdapError::DecodingUTF8 => ErrorCategory::Decoding,
            LdapError::LdapResult { .. } | LdapError::SizeLimitExceeded { .. } => {
                ErrorCategory::Protocol
            }
            LdapError::Cancelled => ErrorCategory::Cancelled,
            #[cfg(feature = "ntlm")]
            LdapError::SSPIError { .. } | LdapError::NoNtlmChallengeToken => {
                ErrorCategory::Protocol
            }
            _ => ErrorCategory::Usage,
        }
    }

    pub(crate) fn malformed(what: &'static str) -> LdapError {
        LdapError::from(DecodeError::InvalidContent(what))
    }
}

impl<T> From<mpsc::error::SendError<T>> for LdapError {
    fn from(_: mpsc::error::SendError<T>) -> LdapError {
        LdapError::ConnectionClosed
    }
}

impl From<oneshot::error::RecvError> for LdapError {
    fn from(_: oneshot::error::RecvError) -> LdapError {
        LdapError::ConnectionClosed
    }
}

impl From<LdapError> for io::Error {
    fn from(le: LdapError) -> io::Error {
        match le {
            LdapError::Io { source, .. } => source,
            LdapError::Decoding { source } => io::Error::new(io::ErrorKind::InvalidData, source),
            _ => io::Error::new(io::ErrorKind::Other, format!("{}", le)),
        }
    }
}

/// Common components of an LDAP operation result.
///
/// This structure faithfully replicates the components dictated by the standard,
/// and is distinctly C-like with its reliance on numeric codes for the indication
/// of outcome. The struct implements helper methods, [`success()`](#method.success)
/// and [`non_error()`](#method.non_error), which may be used for ergonomic error
/// handling when simple condition checking suffices.
#[derive(Clone, Debug)]
pub struct LdapResult {
    /// Result code.
    ///
    /// See [Section A.1 of RFC 4511](https://tools.ietf.org/html/rfc4511#appendix-A.1).
    pub rc: u32,
    /// Matched component DN, where applicable.
    pub matched: String,
    /// Additional diagnostic text.
    pub text: String,
    /// Referrals.
    ///
    /// Absence of referrals is represented by an empty vector.
    pub refs: Vec<String>,
    /// Decoded response controls.
    pub ctrls: Vec<Control>,
}

impl Error for LdapResult {}

/// Name of an RFC 4511 result code.
pub fn rc_name(rc: u32) -> &'static str {
    match rc {
        0 => "success",
        1 => "operationsError",
        2 => "protocolError",
        3 => "timeLimitExceeded",
        4 => "sizeLimitExceeded",
        5 => "compareFalse",
        6 => "compareTrue",
        7 => "authMethodNotSupported",
        8 => "strongerAuthRequired",
        10 => "referral",
        11 => "adminLimitExceeded",
        12 => "unavailableCriticalExtension",
        13 => "confidentialityRequired",
        14 => "saslBindInProgress",
        16 => "noSuchAttribute",
        17 => "undefinedAttributeType",
        18 => "inappropriateMatching",
        19 => "constraintViolation",
        20 => "attributeOrValueExists",
        21 => "invalidAttributeSyntax",
        32 => "noSuchObject",
        33 => "aliasProblem",
        34 => "invalidDNSyntax",
        36 => "aliasDereferencingProblem",
        48 => "inappropriateAuthentication",
        49 => "invalidCredentials",
        50 => "insufficientAccessRights",
        51 => "busy",
        52 => "unavailable",
        53 => "unwillingToPerform",
        54 => "loopDetect",
        64 => "namingViolation",
        65 => "objectClassViolation",
        66 => "notAllowedOnNonLeaf",
        67 => "notAllowedOnRDN",
        68 => "entryAlreadyExists",
        69 => "objectClassModsProhibited",
        71 => "affectsMultipleDSAs",
        80 => "other",
        88 => "abandoned",
        118 => "canceled",
        122 => "assertionFailed",
        _ => "unknown",
    }
}

impl fmt::Display for LdapResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> StdResult<(), fmt::Error> {
        write!(
            f,
            "rc={} ({}), dn: \"{}\", text: \"{}\"",
            self.rc,
            rc_name(self.rc),
            self.matched,
            self.text
        )?;
        if !self.refs.is_empty() {
            write!(f, ", refs: {:?}", self.refs)?;
        }
        Ok(())
    }
}

impl LdapResult {
    pub(crate) fn synthetic(rc: u32, text: &str) -> LdapResult {
        LdapResult {
            rc,
            matched: String::new(),
            text: String::from(text),
            refs: vec![],
            ctrls: vec![],
        }
    }

    /// If the result code is zero, return the instance itself wrapped
    /// in `Ok()`, otherwise wrap the instance in an `LdapError`.
    pub fn success(self) -> Result<Self> {
        if self.rc == 0 {
            Ok(self)
        } else {
            Err(LdapError::from(self))
        }
    }

    /// If the result code is 0 or 10 (referral), return the instance
    /// itself wrapped in `Ok()`, otherwise wrap the instance in an
    /// `LdapError`.
    pub fn non_error(self) -> Result<Self> {
        if self.rc == 0 || self.rc == 10 {
            Ok(self)
        } else {
            Err(LdapError::from(self))
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct LdapResultExt(pub LdapResult, pub Exop, pub SaslCreds);

impl LdapResultExt {
    /// Decode an `LDAPResult`-shaped response operation.
    ///
    /// Components after the three mandatory ones are recognized by tag: `[3]` referral,
    /// `[7]` SASL credentials, `[10]`/`[11]` extended response name and value. Servers
    /// which put the referral list under another tag are accommodated when the result
    /// code is 10: the first constructed component consisting only of primitive strings
    /// is taken as the referral list.
    pub(crate) fn parse(t: StructureTag) -> Result<LdapResultExt> {
        let mut tags = t
            .expect_constructed()
            .ok_or(LdapError::malformed("result sequence"))?
            .into_iter();
        let rc = tags
            .next()
            .ok_or(LdapError::malformed("result code"))?
            .into_primitive_of(TagClass::Universal, Types::Enumerated as u64, "result code")?;
        let rc = u32::try_from(decode_integer(&rc)?)
            .map_err(|_| LdapError::malformed("result code"))?;
        let matched = tags
            .next()
            .and_then(|t| t.expect_primitive())
            .ok_or(LdapError::malformed("matched dn"))?;
        let matched = String::from_utf8(matched).map_err(|_| LdapError::DecodingUTF8)?;
        let text = tags
            .next()
            .and_then(|t| t.expect_primitive())
            .ok_or(LdapError::malformed("diagnostic message"))?;
        let text = String::from_utf8_lossy(&text).into_owned();
        let mut refs = Vec::new();
        let mut exop = Exop {
            name: None,
            val: None,
        };
        let mut sasl_creds = None;
        for comp in tags {
            match (comp.class, comp.id) {
                (TagClass::Context, 3) => refs.extend(parse_refs(comp)?),
                (TagClass::Context, 7) => sasl_creds = comp.expect_primitive(),
                (TagClass::Context, 10) => {
                    let name = comp
                        .expect_primitive()
                        .ok_or(LdapError::malformed("exop name"))?;
                    exop.name = Some(String::from_utf8(name).map_err(|_| LdapError::DecodingUTF8)?);
                }
                (TagClass::Context, 11) => exop.val = comp.expect_primitive(),
                _ if rc == 10 && refs.is_empty() && looks_like_refs(&comp) => {
                    debug!("referral list under non-standard tag {:?}/{}", comp.class, comp.id);
                    refs.extend(parse_refs(comp)?);
                }
                _ => (),
            }
        }
        Ok(LdapResultExt(
            LdapResult {
                rc,
                matched,
                text,
                refs,
                ctrls: vec![],
            },
            exop,
            SaslCreds(sasl_creds),
        ))
    }

    /// Decode the response for any operation, with `Null` standing for the
    /// synthetic success of operations which have no server response.
    pub(crate) fn from_tag(t: Tag) -> Result<LdapResultExt> {
        match t {
            Tag::StructureTag(t) => LdapResultExt::parse(t),
            Tag::Null(_) => Ok(LdapResultExt(
                LdapResult::synthetic(0, ""),
                Exop {
                    name: None,
                    val: None,
                },
                SaslCreds(None),
            )),
            _ => Err(LdapError::malformed("response")),
        }
    }
}

fn looks_like_refs(t: &StructureTag) -> bool {
    match t.children() {
        Some(c) => !c.is_empty() && c.iter().all(|u| u.as_primitive().is_some()),
        None => false,
    }
}

/// Wrapper for results of a Search operation which returns all entries at once.
///
/// Referrals received during the Search are collected in the `refs` vector of the
/// `LdapResult` part; intermediate messages are discarded. Methods
/// [`success()`](#method.success) and [`non_error()`](#method.non_error) destructure
/// the wrapper and return its components as elements of an anonymous tuple.
#[derive(Clone, Debug)]
pub struct SearchResult(pub Vec<ResultEntry>, pub LdapResult);

impl SearchResult {
    /// If the result code is zero, return an anonymous tuple of component structs
    /// wrapped in `Ok()`, otherwise wrap the `LdapResult` part in an `LdapError`.
    pub fn success(self) -> Result<(Vec<ResultEntry>, LdapResult)> {
        if self.1.rc == 0 {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }

    /// If the result code is 0 or 10 (referral), return an anonymous tuple of component
    /// structs wrapped in `Ok()`, otherwise wrap the `LdapResult` part in an `LdapError`.
    pub fn non_error(self) -> Result<(Vec<ResultEntry>, LdapResult)> {
        if self.1.rc == 0 || self.1.rc == 10 {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }
}

/// Wrapper for the result of a Compare operation.
///
/// Compare uniquely has two non-zero return codes to indicate the outcome of a successful
/// comparison, while other return codes indicate errors, as usual (except 10 for referral).
#[derive(Clone, Debug)]
pub struct CompareResult(pub LdapResult);

impl CompareResult {
    /// If the result code is 5 (compareFalse) or 6 (compareTrue), return the corresponding
    /// boolean value wrapped in `Ok()`, otherwise wrap the `LdapResult` part in an `LdapError`.
    pub fn equal(self) -> Result<bool> {
        match self.0.rc {
            5 => Ok(false),
            6 => Ok(true),
            _ => Err(LdapError::from(self.0)),
        }
    }

    /// If the result code is 5 (compareFalse), 6 (compareTrue),  or 10 (referral), return
    /// the inner `LdapResult`, otherwise rewrap `LdapResult` in an `LdapError`.
    pub fn non_error(self) -> Result<LdapResult> {
        if self.0.rc == 5 || self.0.rc == 6 || self.0.rc == 10 {
            Ok(self.0)
        } else {
            Err(LdapError::from(self.0))
        }
    }
}

/// Wrapper for the result of an Extended operation.
#[derive(Clone, Debug)]
pub struct ExopResult(pub Exop, pub LdapResult);

impl ExopResult {
    /// If the result code is zero, return an anonymous tuple of component structs
    /// wrapped in `Ok()`, otherwise wrap the `LdapResult` part in an `LdapError`.
    pub fn success(self) -> Result<(Exop, LdapResult)> {
        if self.1.rc == 0 {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }

    /// If the result code is 0 or 10 (referral), return an anonymous tuple of component
    /// structs wrapped in `Ok()`, otherwise wrap the `LdapResult` part in an `LdapError`.
    pub fn non_error(self) -> Result<(Exop, LdapResult)> {
        if self.1.rc == 0 || self.1.rc == 10 {
            Ok((self.0, self.1))
        } else {
            Err(LdapError::from(self.1))
        }
    }
}
