//! Cookie-driven replication searches: content synchronization
//! ([RFC 4533](https://tools.ietf.org/html/rfc4533)) and Active Directory DirSync.

use crate::controls::{
    ControlValue, DirSync, RawControl, SyncDone, SyncInfo, SyncRequest, SyncState,
};
use crate::controls_impl::parse_syncinfo;
use crate::ldap::Ldap;
use crate::result::{LdapResult, Result, SearchResult};
use crate::search::{parse_refs, ResultEntry, Scope, SearchStream, StreamState};
use crate::RequestId;

/// Item produced by a [`SyncStream`].
#[derive(Clone, Debug)]
pub enum SyncEvent {
    /// Search result entry with its Sync State, if the server attached one.
    Entry {
        entry: ResultEntry,
        state: Option<SyncState>,
    },
    /// Continuation references.
    Referral(Vec<String>),
    /// Decoded Sync Info intermediate message.
    Info(SyncInfo),
}

/// Stream of content synchronization results. __*__
///
/// Obtained from [`Ldap::syncrepl()`](struct.Ldap.html#method.syncrepl). In the
/// `refreshOnly` mode, the stream ends when the server sends the final Search
/// result; in `refreshAndPersist`, it runs until the operation is abandoned or
/// the cancellation token given to the handle is cancelled.
#[derive(Debug)]
pub struct SyncStream {
    stream: SearchStream,
}

impl SyncStream {
    /// Fetch the next synchronization event. Returns `Ok(None)` at the end of the stream.
    #[allow(clippy::should_implement_trait)]
    pub async fn next(&mut self) -> Result<Option<SyncEvent>> {
        let Some(entry) = self.stream.next().await? else {
            return Ok(None);
        };
        if entry.is_intermediate() {
            return Ok(Some(SyncEvent::Info(parse_syncinfo(entry)?)));
        }
        if entry.is_ref() {
            return Ok(Some(SyncEvent::Referral(parse_refs(entry.0)?)));
        }
        let state = entry.1.iter().find_map(|c| match c.value {
            ControlValue::SyncState(ref state) => Some(state.clone()),
            _ => None,
        });
        Ok(Some(SyncEvent::Entry { entry, state }))
    }

    /// Ask the server to stop the synchronization.
    pub async fn abandon(&mut self) -> Result<()> {
        self.stream.abandon().await
    }

    /// Return the overall result, with the Sync Done control if the server sent one.
    /// The cookie of that control can be used to resume synchronization later.
    pub async fn finish(&mut self) -> (LdapResult, Option<SyncDone>) {
        let res = self.stream.finish().await;
        let done = res.ctrls.iter().find_map(|c| match c.value {
            ControlValue::SyncDone(ref done) => Some(done.clone()),
            _ => None,
        });
        (res, done)
    }

    pub fn state(&self) -> StreamState {
        self.stream.state()
    }

    pub fn msgid(&self) -> RequestId {
        self.stream.msgid()
    }
}

impl Ldap {
    fn push_control(&mut self, ctrl: RawControl) {
        self.controls.get_or_insert_with(Vec::new).push(ctrl);
    }

    /// Start a content synchronization Search, attaching the Sync Request control
    /// `req` to any controls already set on the handle.
    ///
    /// Parameters other than `req` have the same meaning as for
    /// [`streaming_search()`](#method.streaming_search).
    pub async fn syncrepl<S: AsRef<str>, A: AsRef<[S]>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: A,
        req: SyncRequest,
    ) -> Result<SyncStream> {
        self.push_control(req.into());
        let stream = self.streaming_search(base, scope, filter, attrs).await?;
        Ok(SyncStream { stream })
    }

    /// Perform a DirSync Search, returning the result together with the DirSync
    /// control of the response.
    ///
    /// To fetch further changes, repeat the call with a `DirSync` carrying the
    /// returned cookie. A non-zero `flags` value in the response means that more
    /// changes are immediately available.
    pub async fn dirsync<S: AsRef<str>, A: AsRef<[S]>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: A,
        req: DirSync,
    ) -> Result<(SearchResult, Option<DirSync>)> {
        self.push_control(req.into());
        let res = self.search(base, scope, filter, attrs).await?;
        let next = res.1.ctrls.iter().find_map(|c| match c.value {
            ControlValue::DirSync(ref ds) => Some(ds.clone()),
            _ => None,
        });
        Ok((res, next))
    }
}
