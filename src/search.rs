use std::fmt::Debug;
use std::time::Duration;

use crate::controls::{Control, RawControl};
use crate::controls_impl::decode_controls;
use crate::filter;
use crate::ldap::Ldap;
use crate::protocol::LdapOp;
use crate::result::{LdapError, LdapResult, LdapResultExt, Result};
use crate::RequestId;

use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

use lber::common::TagClass;
use lber::structure::StructureTag;
use lber::structures::{Boolean, Enumerated, Integer, OctetString, Sequence, Tag};

/// Possible values for search scope.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scope {
    /// Base object; search only the object named in the base DN.
    Base = 0,
    /// Search the objects immediately below the base DN.
    OneLevel = 1,
    /// Search the object named in the base DN and the whole subtree below it.
    Subtree = 2,
    /// Search the whole subtree below the base DN, excluding the base object.
    /// This is a vendor extension, not all servers support it.
    Children = 3,
}

/// Possible values for alias dereferencing during search.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum DerefAliases {
    /// Never dereference.
    #[default]
    Never = 0,
    /// Dereference while retrieving objects according to search scope.
    Searching = 1,
    /// Dereference while finding the base object.
    Finding = 2,
    /// Always dereference.
    Always = 3,
}

#[derive(Debug)]
pub(crate) enum SearchItem {
    Entry(StructureTag),
    Referral(StructureTag),
    Intermediate(StructureTag),
    Done(StructureTag),
}

/// Wrapper for the internal structure of a result entry.
///
/// The second element holds the controls received with the message.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ResultEntry(pub StructureTag, pub Vec<Control>);

impl ResultEntry {
    #[doc(hidden)]
    pub fn new(st: StructureTag) -> ResultEntry {
        ResultEntry(st, vec![])
    }

    /// Returns true if the enclosed entry is a referral.
    pub fn is_ref(&self) -> bool {
        self.0.id == 19
    }

    /// Returns true if the enclosed entry is an intermediate message.
    pub fn is_intermediate(&self) -> bool {
        self.0.id == 25
    }
}

/// Additional parameters for the Search operation.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct SearchOptions {
    pub deref: DerefAliases,
    pub typesonly: bool,
    pub timelimit: i32,
    pub sizelimit: i32,
    pub enforce_sizelimit: bool,
}

impl SearchOptions {
    /// Create an instance of the structure with default values.
    pub fn new() -> Self {
        SearchOptions {
            ..Default::default()
        }
    }

    /// Set the method for dereferencing aliases.
    pub fn deref(mut self, d: DerefAliases) -> Self {
        self.deref = d;
        self
    }

    /// Set the indicator of returning just attribute names (`true`) vs. names and values (`false`).
    pub fn typesonly(mut self, typesonly: bool) -> Self {
        self.typesonly = typesonly;
        self
    }

    /// Set the time limit, in seconds, for the whole search operation.
    ///
    /// This is a server-side limit of the elapsed time for performing the operation, _not_ a
    /// network timeout for retrieving result entries or the result of the whole operation.
    ///
    /// The limit applies to a single protocol operation; if multiple operations are involved,
    /// as in a Search with the PagedResult control, the limit won't apply to all of them.
    pub fn timelimit(mut self, timelimit: i32) -> Self {
        self.timelimit = timelimit;
        self
    }

    /// Set the size limit, in entries, for the whole search operation.
    ///
    /// For applicability, see the last paragraph of the `timelimit()` method.
    pub fn sizelimit(mut self, sizelimit: i32) -> Self {
        self.sizelimit = sizelimit;
        self
    }

    /// Also enforce the size limit in the client.
    ///
    /// When set, and the size limit is positive, [`Ldap::search()`](crate::Ldap::search)
    /// abandons the operation as soon as the number of entries goes over the limit and
    /// returns [`LdapError::SizeLimitExceeded`](crate::LdapError::SizeLimitExceeded) with
    /// the entries received so far, including the one over the limit.
    pub fn enforce_sizelimit(mut self, enforce: bool) -> Self {
        self.enforce_sizelimit = enforce;
        self
    }
}

/// Attribute of a parsed entry.
///
/// `values` and `byte_values` are parallel: the string at each index is the
/// UTF-8 rendition of the raw value at the same index, with invalid sequences
/// replaced.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryAttribute {
    pub name: String,
    pub values: Vec<String>,
    pub byte_values: Vec<Vec<u8>>,
}

/// Parsed search result entry.
///
/// While LDAP attributes can have a variety of syntaxes, they're all returned in
/// search results as octet strings, without any associated type information. Each
/// value is kept both as a `String` for convenience and in its raw form, so that
/// binary attributes are not lost.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchEntry {
    /// Entry DN.
    pub dn: String,
    /// Attributes, in the order sent by the server.
    pub attributes: Vec<EntryAttribute>,
}

impl SearchEntry {
    /// Parse raw BER data and convert it into a list of attributes.
    pub fn construct(re: ResultEntry) -> Result<SearchEntry> {
        let mut tags = re
            .0
            .into_constructed_of(TagClass::Application, 4, "search entry")?
            .into_iter();
        let dn = tags
            .next()
            .and_then(|t| t.expect_primitive())
            .ok_or(LdapError::malformed("entry dn"))?;
        let dn = String::from_utf8(dn).map_err(|_| LdapError::DecodingUTF8)?;
        let attrs = tags
            .next()
            .and_then(|t| t.expect_constructed())
            .ok_or(LdapError::malformed("entry attributes"))?;
        let mut attributes = Vec::with_capacity(attrs.len());
        for a_v in attrs {
            let mut part_attr = a_v
                .expect_constructed()
                .ok_or(LdapError::malformed("partial attribute"))?
                .into_iter();
            let name = part_attr
                .next()
                .and_then(|t| t.expect_primitive())
                .ok_or(LdapError::malformed("attribute type"))?;
            let name = String::from_utf8(name).map_err(|_| LdapError::DecodingUTF8)?;
            let byte_values = part_attr
                .next()
                .and_then(|t| t.expect_constructed())
                .ok_or(LdapError::malformed("attribute values"))?
                .into_iter()
                .map(|t| t.expect_primitive().ok_or(LdapError::malformed("attribute value")))
                .collect::<Result<Vec<Vec<u8>>>>()?;
            let values = byte_values
                .iter()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect();
            attributes.push(EntryAttribute {
                name,
                values,
                byte_values,
            });
        }
        Ok(SearchEntry { dn, attributes })
    }

    fn attribute(&self, name: &str) -> Option<&EntryAttribute> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// Values of the named attribute, matched case-insensitively. An absent
    /// attribute yields an empty slice.
    pub fn get_attribute_values(&self, name: &str) -> &[String] {
        self.attribute(name).map(|a| &a.values[..]).unwrap_or(&[])
    }

    /// First value of the named attribute, if any.
    pub fn get_attribute_value(&self, name: &str) -> Option<&str> {
        self.get_attribute_values(name).first().map(String::as_str)
    }

    /// Raw values of the named attribute, matched case-insensitively.
    pub fn get_raw_attribute_values(&self, name: &str) -> &[Vec<u8>] {
        self.attribute(name)
            .map(|a| &a.byte_values[..])
            .unwrap_or(&[])
    }
}

/// Decoded IntermediateResponse message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Intermediate {
    /// OID naming the response, if present.
    pub name: Option<String>,
    /// Response value, if present.
    pub value: Option<Vec<u8>>,
}

impl Intermediate {
    /// Decode the protocol op of an intermediate message.
    pub fn parse(t: StructureTag) -> Result<Intermediate> {
        let comps = t.into_constructed_of(TagClass::Application, 25, "intermediate response")?;
        let mut im = Intermediate::default();
        for comp in comps {
            match (comp.class, comp.id) {
                (TagClass::Context, 0) if im.name.is_none() && im.value.is_none() => {
                    let name = comp
                        .expect_primitive()
                        .ok_or(LdapError::malformed("intermediate name"))?;
                    im.name = Some(String::from_utf8(name).map_err(|_| LdapError::DecodingUTF8)?);
                }
                (TagClass::Context, 1) if im.value.is_none() => {
                    im.value = Some(
                        comp.expect_primitive()
                            .ok_or(LdapError::malformed("intermediate value"))?,
                    );
                }
                _ => return Err(LdapError::malformed("intermediate component")),
            }
        }
        Ok(im)
    }
}

/// Possible states of a `SearchStream`.
///
/// Every `SearchStream` is created in the `Fresh` state and moves to `Active` when the
/// Search request has been handed to the connection. Iterating with `next()` requires
/// the `Active` state, which turns into `Done` when the final Search message is received.
/// Any error, cancellation included, results in the `Error` state. `finish()` may be
/// called at any time and moves the stream to `Closed`; calling it again returns a
/// synthetic error-bearing `LdapResult`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamState {
    /// Stream which hasn't yet been initialized.
    Fresh,
    /// Initialized stream which can be iterated through with `next()`.
    Active,
    /// Stream from which all entries have been retrieved.
    Done,
    /// Properly finalized stream on which `finish()` was called.
    Closed,
    /// Stream in an error state after some fallible operation.
    Error,
}

/// Asynchronous handle for obtaining a stream of search results. __*__
///
/// User code can't construct a stream directly, but only by using
/// [`streaming_search()`](struct.Ldap.html#method.streaming_search) on
/// an `Ldap` handle.
///
/// A streaming search should be used for situations where the expected
/// size of result entries varies considerably between searches, and/or
/// can rise above a few tens to hundreds of KB. Items are buffered in a
/// bounded queue; when the queue is full, the connection stops reading
/// from the socket until the consumer catches up.
///
/// Once initiated, a streaming search is driven to the end by repeatedly calling
/// [`next()`](#method.next) until it returns `Ok(None)` or an error. Then, a call
/// to [`finish()`](#method.finish) will return the overall result of the search.
/// Calling `finish()` earlier will terminate search result processing in the
/// client; to also stop the server, call [`abandon()`](#method.abandon) first.
///
/// If the handle the stream was started from carried a cancellation token
/// (see [`Ldap::with_cancel()`](struct.Ldap.html#method.with_cancel)), cancelling it
/// makes the pending or next call to `next()` abandon the operation and return
/// `LdapError::Cancelled`.
#[derive(Debug)]
pub struct SearchStream {
    pub(crate) ldap: Ldap,
    pub(crate) rx: Option<mpsc::Receiver<(SearchItem, Vec<RawControl>)>>,
    state: StreamState,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    msgid: RequestId,
    pub res: Option<LdapResult>,
}

enum Wake {
    Item(Option<(SearchItem, Vec<RawControl>)>),
    Elapsed(time::error::Elapsed),
    Cancelled,
}

pub(crate) fn search_request<S: AsRef<str>>(
    base: &str,
    scope: Scope,
    opts: &SearchOptions,
    filter: &str,
    attrs: &[S],
) -> Result<Tag> {
    Ok(Tag::Sequence(Sequence {
        id: 3,
        class: TagClass::Application,
        inner: vec![
            Tag::OctetString(OctetString {
                inner: Vec::from(base.as_bytes()),
                ..Default::default()
            }),
            Tag::Enumerated(Enumerated {
                inner: scope as i64,
                ..Default::default()
            }),
            Tag::Enumerated(Enumerated {
                inner: opts.deref as i64,
                ..Default::default()
            }),
            Tag::Integer(Integer {
                inner: opts.sizelimit as i64,
                ..Default::default()
            }),
            Tag::Integer(Integer {
                inner: opts.timelimit as i64,
                ..Default::default()
            }),
            Tag::Boolean(Boolean {
                inner: opts.typesonly,
                ..Default::default()
            }),
            filter::parse(filter)?,
            Tag::Sequence(Sequence {
                inner: attrs
                    .iter()
                    .map(|s| {
                        Tag::OctetString(OctetString {
                            inner: Vec::from(s.as_ref()),
                            ..Default::default()
                        })
                    })
                    .collect(),
                ..Default::default()
            }),
        ],
    }))
}

impl SearchStream {
    pub(crate) fn new(ldap: Ldap) -> Self {
        SearchStream {
            ldap,
            rx: None,
            state: StreamState::Fresh,
            timeout: None,
            cancel: None,
            msgid: 0,
            res: None,
        }
    }

    pub(crate) async fn start<S: AsRef<str>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: &[S],
    ) -> Result<()> {
        if self.state != StreamState::Fresh {
            return Ok(());
        }
        let res = self.start_inner(base, scope, filter, attrs).await;
        self.state = if res.is_ok() {
            StreamState::Active
        } else {
            StreamState::Error
        };
        res
    }

    async fn start_inner<S: AsRef<str>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: &[S],
    ) -> Result<()> {
        let opts = self.ldap.search_opts.take().unwrap_or_default();
        let req = search_request(base, scope, &opts, filter, attrs)?;
        self.timeout = self.ldap.timeout.or(self.ldap.default_timeout);
        self.cancel = self.ldap.cancel.clone();
        let (tx, rx) = mpsc::channel(self.ldap.search_buffer);
        self.rx = Some(rx);
        let res = self.ldap.op_call(LdapOp::Search(tx), req).await;
        self.msgid = self.ldap.last_id;
        res.map(|_| ())
    }

    async fn next_inner(&mut self) -> Result<Option<ResultEntry>> {
        let timeout = self.timeout;
        let cancel = self.cancel.clone();
        let wake = {
            let rx = self.rx.as_mut().ok_or(LdapError::EndOfStream)?;
            let recv = async {
                match timeout {
                    Some(timeout) => match time::timeout(timeout, rx.recv()).await {
                        Ok(item) => Wake::Item(item),
                        Err(e) => Wake::Elapsed(e),
                    },
                    None => Wake::Item(rx.recv().await),
                }
            };
            match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => Wake::Cancelled,
                    wake = recv => wake,
                },
                None => recv.await,
            }
        };
        let (item, raw_ctrls) = match wake {
            Wake::Item(Some(item)) => item,
            Wake::Item(None) => {
                self.rx = None;
                return Err(if self.ldap.state.is_closing() {
                    self.ldap.state.closed_error()
                } else {
                    LdapError::EndOfStream
                });
            }
            Wake::Elapsed(e) => {
                self.scrub();
                return Err(LdapError::from(e));
            }
            Wake::Cancelled => {
                self.rx = None;
                if let Err(e) = self.ldap.abandon(self.msgid).await {
                    debug!("abandon after cancellation of op {}: {}", self.msgid, e);
                }
                return Err(LdapError::Cancelled);
            }
        };
        let ctrls = decode_controls(raw_ctrls)?;
        match item {
            SearchItem::Entry(tag) | SearchItem::Referral(tag) | SearchItem::Intermediate(tag) => {
                Ok(Some(ResultEntry(tag, ctrls)))
            }
            SearchItem::Done(tag) => {
                let mut res = LdapResultExt::parse(tag)?.0;
                res.ctrls = ctrls;
                self.res = Some(res);
                self.rx = None;
                Ok(None)
            }
        }
    }

    fn scrub(&mut self) {
        if self.rx.take().is_some() {
            if let Err(e) = self.ldap.id_scrub_tx.send(self.msgid) {
                warn!("error sending scrub message for ID {}: {}", self.msgid, e);
            }
        }
    }

    /// Fetch the next item from the result stream.
    ///
    /// Entries, referrals and intermediate messages are all returned as
    /// [`ResultEntry`]; use its `is_ref()` and `is_intermediate()` methods to tell
    /// them apart. Returns `Ok(None)` at the end of the stream.
    #[allow(clippy::should_implement_trait)]
    pub async fn next(&mut self) -> Result<Option<ResultEntry>> {
        if self.state != StreamState::Active {
            return Ok(None);
        }
        let res = self.next_inner().await;
        match res {
            Ok(None) => self.state = StreamState::Done,
            Err(_) => self.state = StreamState::Error,
            _ => (),
        }
        res
    }

    /// Ask the server to abandon the Search and stop delivering its results.
    ///
    /// A subsequent `finish()` returns a synthetic cancellation result.
    pub async fn abandon(&mut self) -> Result<()> {
        if self.state != StreamState::Active {
            return Ok(());
        }
        self.rx = None;
        self.state = StreamState::Done;
        self.ldap.abandon(self.msgid).await
    }

    /// Return the overall result of the Search.
    ///
    /// This method can be called at any time. If the stream has been read to the
    /// end, the return value will be the actual result returned by the server.
    /// Otherwise, a synthetic cancellation result is returned, and it's the user's
    /// responsibility to abandon the operation on the server.
    pub async fn finish(&mut self) -> LdapResult {
        if self.state == StreamState::Closed {
            return LdapResult::synthetic(80, "stream already finalized");
        }
        self.scrub();
        self.state = StreamState::Closed;
        self.res
            .take()
            .unwrap_or_else(|| LdapResult::synthetic(88, "user cancelled"))
    }

    /// Return the current state of the stream.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Return the message ID of the Search.
    pub fn msgid(&self) -> RequestId {
        self.msgid
    }

    /// Return the `Ldap` handle of the stream.
    pub fn ldap_handle(&mut self) -> &mut Ldap {
        &mut self.ldap
    }
}

impl Drop for SearchStream {
    fn drop(&mut self) {
        self.scrub();
    }
}

/// Parse the referrals from the supplied BER-encoded sequence.
pub fn parse_refs(t: StructureTag) -> Result<Vec<String>> {
    t.expect_constructed()
        .ok_or(LdapError::malformed("referrals"))?
        .into_iter()
        .map(|t| t.expect_primitive().ok_or(LdapError::malformed("referral uri")))
        .map(|s| s.and_then(|s| String::from_utf8(s).map_err(|_| LdapError::DecodingUTF8)))
        .collect()
}
