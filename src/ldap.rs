use std::collections::HashSet;
use std::hash::Hash;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::conn::ConnState;
use crate::controls::{ControlValue, PagedResults, RawControl};
use crate::controls_impl::{decode_controls, find_control, IntoRawControlVec, PAGED_RESULTS_OID};
use crate::exop::Exop;
use crate::exop_impl::exop_request;
use crate::protocol::{LdapOp, MaybeControls, ResultSender};
use crate::result::{
    CompareResult, ExopResult, LdapError, LdapResult, LdapResultExt, Result, SearchResult,
};
use crate::search::{parse_refs, Scope, SearchOptions, SearchStream};
use crate::RequestId;

use lber::common::TagClass;
use lber::structures::{Boolean, Enumerated, Integer, Null, OctetString, Sequence, Set, Tag};

use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// SASL bind exchange wrapper.
#[derive(Clone, Debug)]
pub(crate) struct SaslCreds(pub Option<Vec<u8>>);

/// Possible sub-operations for the Modify operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Mod<S: AsRef<[u8]> + Eq + Hash> {
    /// Add an attribute, with at least one value.
    Add(S, HashSet<S>),
    /// Delete the entire attribute, or the given values of an attribute.
    Delete(S, HashSet<S>),
    /// Replace an existing attribute, setting its values to those in the set, or delete it if no values are given.
    Replace(S, HashSet<S>),
    /// Increment the attribute by the given value.
    Increment(S, S),
}

/// Asynchronous handle for LDAP operations. __*__
///
/// All LDAP operations allow attaching a series of request controls, which augment or modify
/// the operation. Controls are attached by calling [`with_controls()`](#method.with_controls)
/// on the handle, and using the result to call another modifier or the operation itself.
/// A timeout can be imposed on an operation by calling [`with_timeout()`](#method.with_timeout)
/// on the handle before invoking the operation, and a cancellation token can be attached
/// with [`with_cancel()`](#method.with_cancel).
///
/// The Search operation has many parameters, most of which are infrequently used. Those
/// parameters can be specified by constructing a [`SearchOptions`](struct.SearchOptions.html)
/// structure and passing it to [`with_search_options()`](#method.with_search_options)
/// called on the handle. This method can be combined with the modifiers described above.
///
/// There are two ways to invoke a search. The first, using [`search()`](#method.search),
/// returns all result entries in a single vector, which works best if it's known that the
/// result set will be limited. The other way uses [`streaming_search()`](#method.streaming_search),
/// which accepts the same parameters, but returns a handle which must be used to obtain
/// result entries one by one.
///
/// As a rule, operations return [`LdapResult`](result/struct.LdapResult.html),
/// a structure of result components. The most important element of `LdapResult`
/// is the result code, a numeric value indicating the outcome of the operation.
/// This structure also contains the possibly empty vector of decoded response controls.
///
/// The handle can be freely cloned. Each clone will multiplex the invoked LDAP operations on
/// the same underlying connection. Modifiers set on a handle are not carried over to its
/// clones. Dropping the last handle will automatically close the connection.
#[derive(Debug)]
pub struct Ldap {
    pub(crate) msgmap: Arc<Mutex<(RequestId, HashSet<RequestId>)>>,
    pub(crate) tx: mpsc::UnboundedSender<(RequestId, LdapOp, Tag, MaybeControls, ResultSender)>,
    pub(crate) id_scrub_tx: mpsc::UnboundedSender<RequestId>,
    pub(crate) state: Arc<ConnState>,
    pub(crate) last_id: RequestId,
    #[cfg(all(feature = "ntlm", feature = "tls-native"))]
    pub(crate) tls_endpoint_token: Arc<Option<Vec<u8>>>,
    pub(crate) has_tls: bool,
    pub(crate) search_buffer: usize,
    pub(crate) default_timeout: Option<Duration>,
    pub timeout: Option<Duration>,
    pub controls: Option<Vec<RawControl>>,
    pub search_opts: Option<SearchOptions>,
    pub(crate) cancel: Option<CancellationToken>,
}

impl Clone for Ldap {
    fn clone(&self) -> Self {
        Ldap {
            msgmap: self.msgmap.clone(),
            tx: self.tx.clone(),
            id_scrub_tx: self.id_scrub_tx.clone(),
            state: self.state.clone(),
            #[cfg(all(feature = "ntlm", feature = "tls-native"))]
            tls_endpoint_token: self.tls_endpoint_token.clone(),
            has_tls: self.has_tls,
            search_buffer: self.search_buffer,
            default_timeout: self.default_timeout,
            last_id: 0,
            timeout: None,
            controls: None,
            search_opts: None,
            cancel: None,
        }
    }
}

/// Allocate the next free message ID, wrapping around to 1 after the maximum.
pub(crate) fn next_msgid(msgmap: &Mutex<(RequestId, HashSet<RequestId>)>) -> Option<RequestId> {
    let mut msgmap = msgmap.lock().unwrap_or_else(PoisonError::into_inner);
    let mut next_ldap_id = msgmap.0;
    for _ in 0..RequestId::MAX {
        next_ldap_id = if next_ldap_id == RequestId::MAX {
            1
        } else {
            next_ldap_id + 1
        };
        if msgmap.1.insert(next_ldap_id) {
            msgmap.0 = next_ldap_id;
            return Some(next_ldap_id);
        }
    }
    None
}

fn sasl_bind_req(mech: &str, creds: Option<&[u8]>) -> Tag {
    let mut inner_vec = vec![Tag::OctetString(OctetString {
        inner: Vec::from(mech),
        ..Default::default()
    })];
    if let Some(creds) = creds {
        inner_vec.push(Tag::OctetString(OctetString {
            inner: creds.to_vec(),
            ..Default::default()
        }));
    }
    Tag::Sequence(Sequence {
        id: 0,
        class: TagClass::Application,
        inner: vec![
            Tag::Integer(Integer {
                inner: 3,
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: Vec::new(),
                ..Default::default()
            }),
            Tag::Sequence(Sequence {
                id: 3,
                class: TagClass::Context,
                inner: inner_vec,
            }),
        ],
    })
}

fn simple_bind_req(bind_dn: &str, bind_pw: &str) -> Tag {
    Tag::Sequence(Sequence {
        id: 0,
        class: TagClass::Application,
        inner: vec![
            Tag::Integer(Integer {
                inner: 3,
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: Vec::from(bind_dn),
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                id: 0,
                class: TagClass::Context,
                inner: Vec::from(bind_pw),
            }),
        ],
    })
}

fn attr_set<S: AsRef<[u8]>>(vals: impl IntoIterator<Item = S>) -> Tag {
    Tag::Set(Set {
        inner: vals
            .into_iter()
            .map(|v| {
                Tag::OctetString(OctetString {
                    inner: Vec::from(v.as_ref()),
                    ..Default::default()
                })
            })
            .collect(),
        ..Default::default()
    })
}

impl Ldap {
    pub(crate) async fn op_call(
        &mut self,
        op: LdapOp,
        req: Tag,
    ) -> Result<(LdapResult, Exop, SaslCreds)> {
        let controls = self.controls.take();
        let timeout = self.timeout.take().or(self.default_timeout);
        let cancel = self.cancel.take();
        if self.state.is_closing() {
            return Err(self.state.closed_error());
        }
        let id = next_msgid(&self.msgmap)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no free message ID"))?;
        self.last_id = id;
        let (tx, rx) = oneshot::channel();
        if self.tx.send((id, op, req, controls, tx)).is_err() {
            return Err(self.state.closed_error());
        }
        let wait = async move {
            match timeout {
                Some(timeout) => time::timeout(timeout, rx).await.map_err(LdapError::from),
                None => Ok(rx.await),
            }
        };
        let waited = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(LdapError::Cancelled),
                res = wait => res,
            },
            None => wait.await,
        };
        let (tag, raw_ctrls) = match waited {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(self.state.closed_error()),
            Err(e) => {
                if let Err(e) = self.id_scrub_tx.send(id) {
                    warn!("error sending scrub message for ID {}: {}", id, e);
                }
                return Err(e);
            }
        };
        let LdapResultExt(mut result, exop, sasl_creds) = LdapResultExt::from_tag(tag)?;
        result.ctrls = decode_controls(raw_ctrls)?;
        Ok((result, exop, sasl_creds))
    }

    /// Use the provided `SearchOptions` with the next Search operation, which can
    /// be invoked directly on the result of this method. If this method is used in
    /// combination with a non-Search operation, the provided options will be silently
    /// discarded when the operation is invoked.
    pub fn with_search_options(&mut self, opts: SearchOptions) -> &mut Self {
        self.search_opts = Some(opts);
        self
    }

    /// Pass the provided request control(s) to the next LDAP operation.
    /// Controls can be constructed by instantiating structs in the
    /// [`controls`](controls/index.html) module, and converted to the form needed
    /// by this method by calling `into()` on the instances.
    ///
    /// This method accepts either a control vector or a single control. The
    /// latter is intended to make the call site less noisy, since it's expected
    /// that passing a single control will comprise the majority of uses.
    pub fn with_controls<V: IntoRawControlVec>(&mut self, ctrls: V) -> &mut Self {
        self.controls = Some(ctrls.into());
        self
    }

    /// Perform the next operation with the timeout specified in `duration`,
    /// overriding the connection default.
    /// The LDAP Search operation consists of an indeterminate number of Entry/Referral
    /// replies; the timer is reset for each reply.
    ///
    /// If the timeout occurs, the operation will return an error. The connection remains
    /// usable for subsequent operations.
    pub fn with_timeout(&mut self, duration: Duration) -> &mut Self {
        self.timeout = Some(duration);
        self
    }

    /// Tie the next operation to a cancellation token.
    ///
    /// When the token is cancelled, the operation stops waiting for the server and
    /// returns `LdapError::Cancelled`; any response arriving later is discarded. For a
    /// streaming Search, the token stays in effect for the lifetime of the stream, and
    /// cancellation also sends an Abandon request.
    pub fn with_cancel(&mut self, token: CancellationToken) -> &mut Self {
        self.cancel = Some(token);
        self
    }

    /// Do a simple Bind with the provided DN (`bind_dn`) and password (`bind_pw`).
    ///
    /// An empty password is rejected without contacting the server, whatever the DN.
    /// The server would treat the request as an anonymous or unauthenticated bind and
    /// report success. Use [`unauthenticated_bind()`](#method.unauthenticated_bind)
    /// if that is intended; it also accepts an empty DN.
    pub async fn simple_bind(&mut self, bind_dn: &str, bind_pw: &str) -> Result<LdapResult> {
        if bind_pw.is_empty() {
            return Err(LdapError::EmptyPassword);
        }
        let req = simple_bind_req(bind_dn, bind_pw);
        Ok(self.op_call(LdapOp::Single, req).await?.0)
    }

    /// Do an unauthenticated simple Bind (RFC 4513, section 5.1.2) with `bind_dn`
    /// and an empty password.
    pub async fn unauthenticated_bind(&mut self, bind_dn: &str) -> Result<LdapResult> {
        let req = simple_bind_req(bind_dn, "");
        Ok(self.op_call(LdapOp::Single, req).await?.0)
    }

    /// Do an SASL EXTERNAL bind on the connection. The identity of the client
    /// must have already been established by connection-specific methods, as
    /// is the case for Unix domain sockets or TLS client certificates. The bind
    /// is made with the hardcoded empty authzId value.
    pub async fn sasl_external_bind(&mut self) -> Result<LdapResult> {
        let req = sasl_bind_req("EXTERNAL", Some(b""));
        Ok(self.op_call(LdapOp::Single, req).await?.0)
    }

    #[cfg_attr(docsrs, doc(cfg(feature = "ntlm")))]
    #[cfg(feature = "ntlm")]
    /// Do an SASL GSS-SPNEGO bind with an NTLMSSP exchange on the connection. Username
    /// and password must be provided. To specify the domain, incorporate it into the
    /// username, using the `DOMAIN\user` or `user@DOMAIN` format.
    ///
    /// __Caveat:__ the connection cannot encrypted by NTLM "sealing". For encryption, use
    /// TLS. With the __tls-native__ feature, a channel binding token is sent on a TLS
    /// connection, if possible.
    pub async fn sasl_ntlm_bind(&mut self, username: &str, password: &str) -> Result<LdapResult> {
        const LDAP_RESULT_SASL_BIND_IN_PROGRESS: u32 = 14;

        use sspi::{
            builders::AcquireCredentialsHandleResult, AuthIdentity, AuthIdentityBuffers,
            BufferType, ClientRequestFlags, CredentialUse, DataRepresentation, Ntlm,
            SecurityBuffer, SecurityStatus, Sspi, SspiImpl, Username,
        };

        fn step(
            ntlm: &mut Ntlm,
            acq_creds: &mut AcquireCredentialsHandleResult<Option<AuthIdentityBuffers>>,
            input: &[u8],
        ) -> Result<Vec<u8>> {
            let mut input = vec![SecurityBuffer::new(input.to_vec(), BufferType::Token)];
            let mut output = vec![SecurityBuffer::new(Vec::new(), BufferType::Token)];
            let mut builder = ntlm
                .initialize_security_context()
                .with_credentials_handle(&mut acq_creds.credentials_handle)
                .with_context_requirements(ClientRequestFlags::ALLOCATE_MEMORY)
                .with_target_data_representation(DataRepresentation::Native)
                .with_input(&mut input)
                .with_output(&mut output);
            let result = ntlm
                .initialize_security_context_impl(&mut builder)?
                .resolve_to_result()?;
            match result.status {
                SecurityStatus::CompleteNeeded | SecurityStatus::CompleteAndContinue => {
                    ntlm.complete_auth_token(&mut output)?
                }
                s => s,
            };
            Ok(output.swap_remove(0).buffer)
        }

        let mut ntlm = Ntlm::new();
        let identity = AuthIdentity {
            username: Username::parse(username)
                .map_err(|e| LdapError::NtlmUsername(e.to_string()))?,
            password: password.to_string().into(),
        };
        let mut acq_creds = ntlm
            .acquire_credentials_handle()
            .with_credential_use(CredentialUse::Outbound)
            .with_auth_data(&identity)
            .execute(&mut ntlm)?;
        let req = sasl_bind_req("GSS-SPNEGO", Some(&step(&mut ntlm, &mut acq_creds, &[])?));
        let (res, _, token) = self.op_call(LdapOp::Single, req).await?;
        if res.rc != LDAP_RESULT_SASL_BIND_IN_PROGRESS {
            return Ok(res);
        }
        let token = token.0.ok_or(LdapError::NoNtlmChallengeToken)?;
        #[cfg(feature = "tls-native")]
        if self.has_tls {
            if let Some(endpoint) = self.tls_endpoint_token.as_ref() {
                let mut cbt = Vec::from(&b"tls-server-end-point:"[..]);
                cbt.extend(endpoint);
                ntlm.set_channel_bindings(&cbt);
            }
        }
        let req = sasl_bind_req(
            "GSS-SPNEGO",
            Some(&step(&mut ntlm, &mut acq_creds, &token)?),
        );
        Ok(self.op_call(LdapOp::Single, req).await?.0)
    }

    /// Perform a Search with the given base DN (`base`), scope, filter, and
    /// the list of attributes to be returned (`attrs`). If `attrs` is empty,
    /// or if it contains a special name `*` (asterisk), return all (user) attributes.
    /// Requesting a special name `+` (plus sign) will return all operational
    /// attributes. Include both `*` and `+` in order to return all attributes
    /// of an entry.
    ///
    /// The returned structure wraps the vector of result entries and the overall
    /// result of the operation. Entries are not directly usable, and must be parsed by
    /// [`SearchEntry::construct()`](struct.SearchEntry.html#method.construct). All
    /// referrals in the result stream will be collected in the `refs` vector of the
    /// operation result. Any intermediate messages will be discarded.
    ///
    /// If the search options enable client-side size limit enforcement, the Search is
    /// abandoned as soon as the entry count goes over the limit, and
    /// `LdapError::SizeLimitExceeded` is returned with the entries received until then.
    ///
    /// This method should be used if it's known that the result set won't be
    /// large. For other situations, one can use [`streaming_search()`](#method.streaming_search).
    pub async fn search<S: AsRef<str>, A: AsRef<[S]>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: A,
    ) -> Result<SearchResult> {
        let limit = match self.search_opts {
            Some(ref opts) if opts.enforce_sizelimit && opts.sizelimit > 0 => {
                Some(opts.sizelimit as usize)
            }
            _ => None,
        };
        let mut stream = self.streaming_search(base, scope, filter, attrs).await?;
        let mut entries = vec![];
        let mut refs = vec![];
        while let Some(entry) = stream.next().await? {
            if entry.is_intermediate() {
                continue;
            }
            if entry.is_ref() {
                refs.extend(parse_refs(entry.0)?);
                continue;
            }
            entries.push(entry);
            if limit.is_some_and(|limit| entries.len() > limit) {
                if let Err(e) = stream.abandon().await {
                    debug!("abandon after size limit, op={}: {}", stream.msgid(), e);
                }
                stream.finish().await;
                let mut res = LdapResult::synthetic(4, "client-side size limit exceeded");
                res.refs = refs;
                return Err(LdapError::SizeLimitExceeded {
                    partial: Box::new(SearchResult(entries, res)),
                });
            }
        }
        let mut res = stream.finish().await;
        refs.append(&mut res.refs);
        res.refs = refs;
        Ok(SearchResult(entries, res))
    }

    /// Perform a Search, but unlike [`search()`](#method.search) (q.v., also for
    /// the parameters), which returns all results at once, return a handle which
    /// will be used for retrieving entries one by one. See [`SearchStream`](struct.SearchStream.html)
    /// for the explanation of the protocol which must be adhered to in this case.
    ///
    /// The filter is compiled before anything is sent, so a malformed filter is
    /// reported without touching the connection.
    pub async fn streaming_search<S: AsRef<str>, A: AsRef<[S]>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: A,
    ) -> Result<SearchStream> {
        let mut ldap = self.clone();
        ldap.controls = self.controls.take();
        ldap.timeout = self.timeout.take();
        ldap.search_opts = self.search_opts.take();
        ldap.cancel = self.cancel.take();
        let mut stream = SearchStream::new(ldap);
        stream.start(base, scope, filter, attrs.as_ref()).await?;
        self.last_id = stream.msgid();
        Ok(stream)
    }

    /// Perform a Search with the Paged Results control
    /// ([RFC 2696](https://tools.ietf.org/html/rfc2696)), retrieving the full result
    /// set in pages of `page_size` entries.
    ///
    /// If the controls set on the handle already include a paging control, its size
    /// must equal `page_size`; otherwise, a paging control is added. Searches are
    /// repeated with the cookie returned by the server until the cookie comes back
    /// empty, and entries and referrals of all pages are accumulated in the returned
    /// result. Finally, a Search with the page size of zero is sent to release the
    /// server-side cursor; its outcome is ignored.
    ///
    /// If a page ends with a result code other than success, the accumulated entries are
    /// returned with that result, and no further pages are requested.
    pub async fn search_with_paging<S: AsRef<str>, A: AsRef<[S]>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: A,
        page_size: i32,
    ) -> Result<SearchResult> {
        let mut controls = self.controls.take().unwrap_or_default();
        let timeout = self.timeout.take();
        let opts = self.search_opts.take();
        let cancel = self.cancel.take();
        let (idx, crit) = match controls.iter().position(|c| c.ctype == PAGED_RESULTS_OID) {
            Some(idx) => {
                let attached: PagedResults = controls[idx].parse()?;
                if attached.size != page_size {
                    return Err(LdapError::PagingSizeMismatch {
                        requested: page_size,
                        attached: attached.size,
                    });
                }
                (idx, controls[idx].crit)
            }
            None => {
                controls.push(RawControl::from(PagedResults {
                    size: page_size,
                    cookie: vec![],
                }));
                (controls.len() - 1, false)
            }
        };
        let paging = |size: i32, cookie: Vec<u8>| {
            let mut ctrl = RawControl::from(PagedResults { size, cookie });
            ctrl.crit = crit;
            ctrl
        };
        let mut entries = vec![];
        let mut refs = vec![];
        let (mut res, cookie) = loop {
            self.controls = Some(controls.clone());
            self.timeout = timeout;
            self.search_opts = opts.clone();
            self.cancel = cancel.clone();
            let SearchResult(page, mut res) = self.search(base, scope, filter, attrs.as_ref()).await?;
            entries.extend(page);
            refs.append(&mut res.refs);
            if res.rc != 0 {
                res.refs = refs;
                return Ok(SearchResult(entries, res));
            }
            let cookie = match find_control(&res.ctrls, PAGED_RESULTS_OID).map(|c| &c.value) {
                Some(ControlValue::Paging(pr)) => pr.cookie.clone(),
                _ => vec![],
            };
            if cookie.is_empty() {
                break (res, cookie);
            }
            controls[idx] = paging(page_size, cookie);
        };
        controls[idx] = paging(0, cookie);
        self.controls = Some(controls);
        self.timeout = timeout;
        self.search_opts = opts;
        self.cancel = cancel;
        if let Err(e) = self.search(base, scope, filter, attrs.as_ref()).await {
            debug!("paged search cursor release: {}", e);
        }
        res.refs = refs;
        Ok(SearchResult(entries, res))
    }

    /// Add an entry named by `dn`, with the list of attributes and their values
    /// given in `attrs`. None of the `HashSet`s of values for an attribute may
    /// be empty.
    pub async fn add<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        attrs: Vec<(S, HashSet<S>)>,
    ) -> Result<LdapResult> {
        if attrs.iter().any(|(_, vals)| vals.is_empty()) {
            return Err(LdapError::AddNoValues);
        }
        let req = Tag::Sequence(Sequence {
            id: 8,
            class: TagClass::Application,
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: Vec::from(dn.as_bytes()),
                    ..Default::default()
                }),
                Tag::Sequence(Sequence {
                    inner: attrs
                        .into_iter()
                        .map(|(name, vals)| {
                            Tag::Sequence(Sequence {
                                inner: vec![
                                    Tag::OctetString(OctetString {
                                        inner: Vec::from(name.as_ref()),
                                        ..Default::default()
                                    }),
                                    attr_set(vals),
                                ],
                                ..Default::default()
                            })
                        })
                        .collect(),
                    ..Default::default()
                }),
            ],
        });
        Ok(self.op_call(LdapOp::Single, req).await?.0)
    }

    /// Compare the value(s) of the attribute `attr` within an entry named by `dn` with the
    /// value `val`. If any of the values is identical to the provided one, return result code 6
    /// (`compareTrue`), otherwise return result code 5 (`compareFalse`). If access control
    /// rules on the server disallow comparison, another result code will be used to indicate
    /// an error.
    pub async fn compare<B: AsRef<[u8]>>(
        &mut self,
        dn: &str,
        attr: &str,
        val: B,
    ) -> Result<CompareResult> {
        let req = Tag::Sequence(Sequence {
            id: 14,
            class: TagClass::Application,
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: Vec::from(dn.as_bytes()),
                    ..Default::default()
                }),
                Tag::Sequence(Sequence {
                    inner: vec![
                        Tag::OctetString(OctetString {
                            inner: Vec::from(attr.as_bytes()),
                            ..Default::default()
                        }),
                        Tag::OctetString(OctetString {
                            inner: Vec::from(val.as_ref()),
                            ..Default::default()
                        }),
                    ],
                    ..Default::default()
                }),
            ],
        });
        Ok(CompareResult(self.op_call(LdapOp::Single, req).await?.0))
    }

    /// Delete an entry named by `dn`.
    pub async fn delete(&mut self, dn: &str) -> Result<LdapResult> {
        let req = Tag::OctetString(OctetString {
            id: 10,
            class: TagClass::Application,
            inner: Vec::from(dn.as_bytes()),
        });
        Ok(self.op_call(LdapOp::Single, req).await?.0)
    }

    /// Modify an entry named by `dn` by sequentially applying the modifications given by `mods`.
    /// See the [`Mod`](enum.Mod.html) documentation for the description of possible values.
    pub async fn modify<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        mods: Vec<Mod<S>>,
    ) -> Result<LdapResult> {
        if mods
            .iter()
            .any(|m| matches!(m, Mod::Add(_, set) if set.is_empty()))
        {
            return Err(LdapError::AddNoValues);
        }
        let req = Tag::Sequence(Sequence {
            id: 6,
            class: TagClass::Application,
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: Vec::from(dn.as_bytes()),
                    ..Default::default()
                }),
                Tag::Sequence(Sequence {
                    inner: mods
                        .into_iter()
                        .map(|m| {
                            let (num, attr, set) = match m {
                                Mod::Add(attr, set) => (0, attr, set),
                                Mod::Delete(attr, set) => (1, attr, set),
                                Mod::Replace(attr, set) => (2, attr, set),
                                Mod::Increment(attr, val) => (3, attr, HashSet::from([val])),
                            };
                            let op = Tag::Enumerated(Enumerated {
                                inner: num,
                                ..Default::default()
                            });
                            let part_attr = Tag::Sequence(Sequence {
                                inner: vec![
                                    Tag::OctetString(OctetString {
                                        inner: Vec::from(attr.as_ref()),
                                        ..Default::default()
                                    }),
                                    attr_set(set),
                                ],
                                ..Default::default()
                            });
                            Tag::Sequence(Sequence {
                                inner: vec![op, part_attr],
                                ..Default::default()
                            })
                        })
                        .collect(),
                    ..Default::default()
                }),
            ],
        });
        Ok(self.op_call(LdapOp::Single, req).await?.0)
    }

    /// Rename and/or move an entry named by `dn`. The new name is given by `rdn`. If
    /// `delete_old` is `true`, delete the previous value of the naming attribute from
    /// the entry. If the entry is to be moved elsewhere in the DIT, `new_sup` gives
    /// the new superior entry where the moved entry will be anchored.
    pub async fn modifydn(
        &mut self,
        dn: &str,
        rdn: &str,
        delete_old: bool,
        new_sup: Option<&str>,
    ) -> Result<LdapResult> {
        let mut params = vec![
            Tag::OctetString(OctetString {
                inner: Vec::from(dn.as_bytes()),
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: Vec::from(rdn.as_bytes()),
                ..Default::default()
            }),
            Tag::Boolean(Boolean {
                inner: delete_old,
                ..Default::default()
            }),
        ];
        if let Some(new_sup) = new_sup {
            params.push(Tag::OctetString(OctetString {
                id: 0,
                class: TagClass::Context,
                inner: Vec::from(new_sup.as_bytes()),
            }));
        }
        let req = Tag::Sequence(Sequence {
            id: 12,
            class: TagClass::Application,
            inner: params,
        });
        Ok(self.op_call(LdapOp::Single, req).await?.0)
    }

    /// Perform an Extended operation given by `exop`. Extended operations are defined in the
    /// [`exop`](exop/index.html) module. See the module-level documentation for the list of extended
    /// operations supported by this library and procedures for defining custom exops.
    pub async fn extended<E>(&mut self, exop: E) -> Result<ExopResult>
    where
        E: Into<Exop>,
    {
        let req = exop_request(exop.into());
        self.op_call(LdapOp::Single, req)
            .await
            .map(|et| ExopResult(et.1, et.0))
    }

    /// Terminate the connection to the server.
    pub async fn unbind(&mut self) -> Result<()> {
        let req = Tag::Null(Null {
            id: 2,
            class: TagClass::Application,
            inner: (),
        });
        self.op_call(LdapOp::Unbind, req).await.map(|_| ())
    }

    /// Return the message ID of the last active operation. When the handle is initialized, this
    /// value is set to zero. The intended use is to obtain the ID of a timed out operation for
    /// passing it to an Abandon or Cancel operation.
    pub fn last_id(&self) -> RequestId {
        self.last_id
    }

    /// Ask the server to abandon an operation identified by `msgid`.
    ///
    /// Any response for that operation which arrives afterwards is discarded.
    pub async fn abandon(&mut self, msgid: RequestId) -> Result<()> {
        let req = Tag::Integer(Integer {
            id: 16,
            class: TagClass::Application,
            inner: msgid as i64,
        });
        self.op_call(LdapOp::Abandon(msgid), req).await.map(|_| ())
    }

    /// Check whether the underlying connection has been closed.
    ///
    /// This is an indirect check: it queries the status of the connection task, not the
    /// connection socket itself. An open connection does not mean there is bidirecional
    /// communication with the server; to check for that, a round-trip operation
    /// (e.g., `WhoAmI`) would be necessary.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.state.is_closing()
    }

    /// Check whether the connection is protected by TLS, either from the start
    /// or after StartTLS.
    pub fn has_tls(&self) -> bool {
        self.has_tls
    }

    /// Return the error which terminated the connection, if any.
    ///
    /// The first I/O or decoding failure seen by the connection task is kept; an orderly
    /// close leaves no error.
    pub fn last_error(&self) -> Option<Arc<io::Error>> {
        self.state.last_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::{ControlParser, DirSync};
    use crate::exop::{PasswordModify, PasswordModifyResp};
    use crate::mock::{self, control, entry, result_op, result_op_with, search_done, MockPeer};
    use crate::search::SearchEntry;
    use lber::structures::ASNTag;

    #[test]
    fn msgid_skips_ids_in_use() {
        let msgmap = Mutex::new((0, HashSet::from([2])));
        assert_eq!(next_msgid(&msgmap), Some(1));
        assert_eq!(next_msgid(&msgmap), Some(3));
    }

    #[test]
    fn msgid_wraps_around() {
        let msgmap = Mutex::new((RequestId::MAX - 1, HashSet::from([1])));
        assert_eq!(next_msgid(&msgmap), Some(RequestId::MAX));
        assert_eq!(next_msgid(&msgmap), Some(2));
    }

    #[tokio::test]
    async fn simple_bind_wire_and_result() {
        let (mut ldap, mut peer) = mock::connect().await;
        let server = tokio::spawn(async move {
            let req = peer.recv().await.unwrap();
            peer.send(req.id, result_op(1, 0, ""), vec![]).await;
            (req, peer)
        });
        let res = ldap
            .simple_bind("cn=admin,dc=example,dc=com", "secret")
            .await
            .unwrap()
            .success()
            .unwrap();
        assert!(res.ctrls.is_empty());
        let (req, _peer) = server.await.unwrap();
        assert_eq!(req.raw[0], 0x30);
        assert_eq!(&req.raw[2..6], &[0x02, 0x01, 0x01, 0x60]);
    }

    #[tokio::test]
    async fn empty_password_never_reaches_server() {
        let (mut ldap, mut peer) = mock::connect().await;
        for dn in ["u", ""] {
            assert!(matches!(
                ldap.simple_bind(dn, "").await,
                Err(LdapError::EmptyPassword)
            ));
        }
        assert_eq!(ldap.last_id(), 0);
        let server = tokio::spawn(async move {
            let req = peer.recv().await.unwrap();
            peer.send(req.id, result_op(11, 0, ""), vec![]).await;
            req
        });
        ldap.delete("cn=x").await.unwrap().success().unwrap();
        let req = server.await.unwrap();
        assert_eq!((req.id, req.op_id()), (1, 10));
    }

    #[tokio::test]
    async fn unauthenticated_bind_sends_empty_password() {
        let (mut ldap, mut peer) = mock::connect().await;
        let server = tokio::spawn(async move {
            let req = peer.recv().await.unwrap();
            peer.send(req.id, result_op(1, 0, ""), vec![]).await;
            req
        });
        ldap.unauthenticated_bind("cn=anon").await.unwrap();
        let req = server.await.unwrap();
        let comps = req.op.expect_constructed().unwrap();
        assert_eq!(comps[2].clone().expect_primitive().unwrap(), b"");
        assert_eq!((comps[2].class, comps[2].id), (TagClass::Context, 0));
    }

    #[tokio::test]
    async fn bind_failure_surfaces_as_result_error() {
        let (mut ldap, mut peer) = mock::connect().await;
        tokio::spawn(async move {
            let req = peer.recv().await.unwrap();
            peer.send(req.id, result_op(1, 49, "bad creds"), vec![]).await;
            peer
        });
        let err = ldap.simple_bind("cn=x", "y").await.unwrap().success().unwrap_err();
        match err {
            LdapError::LdapResult { result } => {
                assert_eq!(result.rc, 49);
                assert_eq!(result.text, "bad creds");
            }
            e => panic!("unexpected error: {e}"),
        }
    }

    // Answers Searches from a five-entry directory, honoring the paging control.
    async fn serve_people(mut peer: MockPeer) -> Vec<(i32, Vec<u8>)> {
        let dns: Vec<String> = (0..5).map(|i| format!("uid=u{i},dc=example,dc=com")).collect();
        let mut pages = vec![];
        while let Some(req) = peer.recv().await {
            if req.op_id() == 2 {
                break;
            }
            assert_eq!(req.op_id(), 3);
            let paging = req
                .control(PAGED_RESULTS_OID)
                .map(|c| c.parse::<PagedResults>().unwrap());
            let (from, to, next) = match paging {
                None => (0, dns.len(), None),
                Some(pr) => {
                    pages.push((pr.size, pr.cookie.clone()));
                    let from = match &pr.cookie[..] {
                        b"" => 0,
                        c => String::from_utf8_lossy(c).parse::<usize>().unwrap(),
                    };
                    let to = (from + pr.size as usize).min(dns.len());
                    let next = if pr.size == 0 || to == dns.len() {
                        vec![]
                    } else {
                        to.to_string().into_bytes()
                    };
                    (from, if pr.size == 0 { from } else { to }, Some(next))
                }
            };
            for dn in &dns[from..to] {
                peer.send(req.id, entry(dn, &[("objectClass", &["person"])]), vec![])
                    .await;
            }
            let ctrls = match next {
                Some(cookie) => vec![RawControl::from(PagedResults { size: 5, cookie })],
                None => vec![],
            };
            peer.send(req.id, search_done(0), ctrls).await;
        }
        pages
    }

    fn dns(entries: Vec<crate::search::ResultEntry>) -> Vec<String> {
        entries
            .into_iter()
            .map(|e| SearchEntry::construct(e).unwrap().dn)
            .collect()
    }

    #[tokio::test]
    async fn paged_search_matches_unpaged() {
        let (mut ldap, peer) = mock::connect().await;
        let server = tokio::spawn(serve_people(peer));
        let (all, _) = ldap
            .search("dc=example,dc=com", Scope::Subtree, "(objectClass=person)", &["cn"])
            .await
            .unwrap()
            .success()
            .unwrap();
        let (paged, res) = ldap
            .search_with_paging(
                "dc=example,dc=com",
                Scope::Subtree,
                "(objectClass=person)",
                &["cn"],
                2,
            )
            .await
            .unwrap()
            .success()
            .unwrap();
        assert_eq!(paged.len(), 5);
        assert_eq!(dns(paged), dns(all));
        assert!(res.refs.is_empty());
        drop(ldap);
        let pages = server.await.unwrap();
        assert_eq!(
            pages,
            vec![
                (2, vec![]),
                (2, b"2".to_vec()),
                (2, b"4".to_vec()),
                (0, vec![]),
            ]
        );
    }

    #[tokio::test]
    async fn paging_size_mismatch() {
        let (mut ldap, _peer) = mock::connect().await;
        let err = ldap
            .with_controls(PagedResults {
                size: 10,
                cookie: vec![],
            })
            .search_with_paging("", Scope::Base, "(objectClass=*)", &["*"], 2)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LdapError::PagingSizeMismatch {
                requested: 2,
                attached: 10
            }
        ));
    }

    #[tokio::test]
    async fn every_page_carries_search_options() {
        let (mut ldap, mut peer) = mock::connect().await;
        let server = tokio::spawn(async move {
            let mut seen = vec![];
            while let Some(req) = peer.recv().await {
                if req.op_id() == 2 {
                    break;
                }
                let comps = req.op.clone().expect_constructed().unwrap();
                let params: Vec<Vec<u8>> = comps[2..6]
                    .iter()
                    .map(|c| c.clone().expect_primitive().unwrap())
                    .collect();
                let pr = req
                    .control(PAGED_RESULTS_OID)
                    .unwrap()
                    .parse::<PagedResults>()
                    .unwrap();
                seen.push((pr.size, params));
                let cookie = if pr.cookie.is_empty() && pr.size > 0 {
                    b"more".to_vec()
                } else {
                    vec![]
                };
                let ctrl = RawControl::from(PagedResults { size: 0, cookie });
                peer.send(req.id, search_done(0), vec![ctrl]).await;
            }
            seen
        });
        let opts = SearchOptions::new()
            .deref(crate::search::DerefAliases::Always)
            .sizelimit(50)
            .timelimit(30)
            .typesonly(true);
        ldap.with_search_options(opts)
            .search_with_paging("dc=example,dc=com", Scope::Subtree, "(cn=*)", &["cn"], 10)
            .await
            .unwrap()
            .success()
            .unwrap();
        drop(ldap);
        let seen = server.await.unwrap();
        let sizes: Vec<i32> = seen.iter().map(|(size, _)| *size).collect();
        assert_eq!(sizes, [10, 10, 0]);
        for (_, params) in &seen {
            assert_eq!(params, &[vec![3], vec![50], vec![30], vec![0xff]]);
        }
    }

    #[tokio::test]
    async fn client_size_limit_abandons() {
        let (mut ldap, mut peer) = mock::connect().await;
        let server = tokio::spawn(async move {
            let req = peer.recv().await.unwrap();
            for i in 0..3 {
                peer.send(req.id, entry(&format!("cn={i}"), &[]), vec![]).await;
            }
            let abandon = peer.recv().await.unwrap();
            (req.id, abandon)
        });
        let err = ldap
            .with_search_options(SearchOptions::new().sizelimit(2).enforce_sizelimit(true))
            .search("", Scope::Subtree, "(cn=*)", &["cn"])
            .await
            .unwrap_err();
        match err {
            LdapError::SizeLimitExceeded { partial } => {
                assert_eq!(partial.1.rc, 4);
                assert_eq!(dns(partial.0), ["cn=0", "cn=1", "cn=2"]);
            }
            e => panic!("unexpected error: {e}"),
        }
        let (search_id, abandon) = server.await.unwrap();
        assert_eq!(abandon.abandoned_id(), search_id);
    }

    #[tokio::test]
    async fn search_collects_referrals_and_skips_intermediates() {
        let (mut ldap, mut peer) = mock::connect().await;
        tokio::spawn(async move {
            let req = peer.recv().await.unwrap();
            peer.send(req.id, entry("cn=a", &[]), vec![]).await;
            peer.send(req.id, mock::intermediate("1.2.3", None), vec![]).await;
            peer.send(req.id, mock::referral(&["ldap://other/cn=b"]), vec![]).await;
            peer.send(req.id, search_done(0), vec![]).await;
            peer
        });
        let (entries, res) = ldap
            .search("", Scope::Subtree, "(cn=*)", Vec::<String>::new())
            .await
            .unwrap()
            .success()
            .unwrap();
        assert_eq!(dns(entries), ["cn=a"]);
        assert_eq!(res.refs, ["ldap://other/cn=b"]);
    }

    #[tokio::test]
    async fn bad_filter_is_reported_before_sending() {
        let (mut ldap, _peer) = mock::connect().await;
        let err = ldap
            .search("", Scope::Base, "(cn=x", &["cn"])
            .await
            .unwrap_err();
        assert!(matches!(err, LdapError::FilterParsing(_)));
        assert!(ldap.msgmap.lock().unwrap().1.is_empty());
    }

    #[tokio::test]
    async fn timeout_leaves_connection_usable() {
        let (mut ldap, mut peer) = mock::connect().await;
        let server = tokio::spawn(async move {
            let slow = peer.recv().await.unwrap();
            let next = peer.recv().await.unwrap();
            peer.send(slow.id, result_op(11, 0, ""), vec![]).await;
            peer.send(next.id, result_op(11, 32, ""), vec![]).await;
            peer
        });
        let err = ldap
            .with_timeout(Duration::from_millis(50))
            .delete("cn=slow")
            .await
            .unwrap_err();
        assert!(matches!(err, LdapError::Timeout { .. }));
        let res = ldap.delete("cn=next").await.unwrap();
        assert_eq!(res.rc, 32);
        let _peer = server.await.unwrap();
    }

    #[tokio::test]
    async fn add_rejects_empty_value_set() {
        let (mut ldap, _peer) = mock::connect().await;
        let err = ldap
            .add("cn=x", vec![("cn", HashSet::new())])
            .await
            .unwrap_err();
        assert!(matches!(err, LdapError::AddNoValues));
        assert_eq!(ldap.last_id(), 0);
    }

    #[tokio::test]
    async fn update_operations_encode_requests() {
        let (mut ldap, mut peer) = mock::connect().await;
        let server = tokio::spawn(async move {
            let mut seen = vec![];
            while let Some(req) = peer.recv().await {
                let reply = match req.op_id() {
                    8 => result_op(9, 0, ""),
                    6 => result_op(7, 0, ""),
                    12 => result_op(13, 0, ""),
                    14 => result_op(15, 6, ""),
                    2 => break,
                    n => panic!("unexpected op {n}"),
                };
                seen.push((req.op_id(), req.first_string()));
                peer.send(req.id, reply, vec![]).await;
            }
            seen
        });
        ldap.add("cn=n,dc=x", vec![("cn", HashSet::from(["n"]))])
            .await
            .unwrap()
            .success()
            .unwrap();
        ldap.modify(
            "cn=n,dc=x",
            vec![
                Mod::Replace("sn", HashSet::from(["m"])),
                Mod::Increment("uidNumber", "1"),
            ],
        )
        .await
        .unwrap()
        .success()
        .unwrap();
        ldap.modifydn("cn=n,dc=x", "cn=o", true, Some("dc=y"))
            .await
            .unwrap()
            .success()
            .unwrap();
        assert!(ldap.compare("cn=o,dc=y", "sn", "m").await.unwrap().equal().unwrap());
        ldap.unbind().await.unwrap();
        let seen = server.await.unwrap();
        assert_eq!(
            seen,
            vec![
                (8, "cn=n,dc=x".to_owned()),
                (6, "cn=n,dc=x".to_owned()),
                (12, "cn=n,dc=x".to_owned()),
                (14, "cn=o,dc=y".to_owned()),
            ]
        );
        assert!(ldap.is_closed());
        assert!(matches!(
            ldap.delete("cn=o,dc=y").await,
            Err(LdapError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn password_modify_returns_generated_password() {
        let (mut ldap, mut peer) = mock::connect().await;
        tokio::spawn(async move {
            let req = peer.recv().await.unwrap();
            assert_eq!(req.op_id(), 23);
            let value = Tag::Sequence(Sequence {
                inner: vec![Tag::OctetString(OctetString {
                    id: 0,
                    class: TagClass::Context,
                    inner: b"n3w".to_vec(),
                })],
                ..Default::default()
            });
            let val = Tag::OctetString(OctetString {
                id: 11,
                class: TagClass::Context,
                inner: lber::encode(value.into_structure()),
            });
            peer.send(req.id, result_op_with(24, 0, "", vec![val]), vec![]).await;
            peer
        });
        let (exop, _) = ldap
            .extended(PasswordModify {
                user_id: Some("uid=u,dc=x"),
                old_pass: None,
                new_pass: None,
            })
            .await
            .unwrap()
            .success()
            .unwrap();
        let resp: PasswordModifyResp = exop.parse().unwrap();
        assert_eq!(resp.gen_pass, "n3w");
    }

    #[tokio::test]
    async fn dirsync_returns_next_cookie() {
        let (mut ldap, mut peer) = mock::connect().await;
        let server = tokio::spawn(async move {
            let req = peer.recv().await.unwrap();
            let ctrl = req.control("1.2.840.113556.1.4.841").unwrap();
            assert!(ctrl.crit);
            let sent = DirSync::parse(ctrl.val.as_deref().unwrap()).unwrap();
            peer.send(req.id, entry("cn=changed", &[]), vec![]).await;
            let resp = DirSync {
                flags: 0,
                max_attr_count: 0,
                cookie: b"c2".to_vec(),
            };
            peer.send(req.id, search_done(0), vec![Into::<RawControl>::into(resp)]).await;
            (sent, peer)
        });
        let req = DirSync {
            cookie: b"c1".to_vec(),
            ..DirSync::new(DirSync::OBJECT_SECURITY, 0)
        };
        let (res, next) = ldap
            .dirsync("dc=x", Scope::Subtree, "(objectClass=*)", &["*"], req)
            .await
            .unwrap();
        assert_eq!(res.0.len(), 1);
        assert_eq!(next.unwrap().cookie, b"c2");
        let (sent, _peer) = server.await.unwrap();
        assert_eq!(sent.cookie, b"c1");
        assert_eq!(sent.flags, DirSync::OBJECT_SECURITY);
    }

    #[tokio::test]
    async fn search_result_controls_are_decoded() {
        let (mut ldap, mut peer) = mock::connect().await;
        tokio::spawn(async move {
            let req = peer.recv().await.unwrap();
            let ctrl = control(
                "1.2.840.113556.1.4.474",
                Tag::Sequence(Sequence {
                    inner: vec![Tag::Enumerated(lber::structures::Enumerated {
                        inner: 0,
                        ..Default::default()
                    })],
                    ..Default::default()
                }),
            );
            peer.send(req.id, search_done(0), vec![ctrl]).await;
            peer
        });
        let res = ldap
            .search("", Scope::Base, "(objectClass=*)", &["*"])
            .await
            .unwrap();
        let ctrl = find_control(&res.1.ctrls, "1.2.840.113556.1.4.474").unwrap();
        assert!(matches!(ctrl.value, ControlValue::SortResult(_)));
    }
}
