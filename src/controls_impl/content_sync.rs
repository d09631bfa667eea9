use std::fmt;

use super::{boolean_of, integer_of, octets_of, value_sequence, ControlParser, MakeCritical, RawControl};
use crate::result::{LdapError, Result};
use crate::search::{Intermediate, ResultEntry};

use lber::common::TagClass;
use lber::structure::{StructureTag, PL};
use lber::structures::{Boolean, Enumerated, OctetString, Sequence, Tag};
use lber::universal::Types;
use uuid::Uuid;

pub const SYNC_REQUEST_OID: &str = "1.3.6.1.4.1.4203.1.9.1.1";
pub const SYNC_STATE_OID: &str = "1.3.6.1.4.1.4203.1.9.1.2";
pub const SYNC_DONE_OID: &str = "1.3.6.1.4.1.4203.1.9.1.3";
pub const SYNC_INFO_OID: &str = "1.3.6.1.4.1.4203.1.9.1.4";

/// Sync Request control ([RFC 4533](https://tools.ietf.org/html/rfc4533)).
#[derive(Clone, Debug, Default)]
pub struct SyncRequest {
    pub mode: RefreshMode,
    pub cookie: Option<Vec<u8>>,
    pub reload_hint: bool,
}

/// Content refresh mode.
///
/// See the Content Synchronization specification
/// ([RFC 4533](https://tools.ietf.org/html/rfc4533)).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefreshMode {
    #[default]
    RefreshOnly,
    RefreshAndPersist,
}

impl From<RefreshMode> for i64 {
    fn from(mode: RefreshMode) -> i64 {
        match mode {
            RefreshMode::RefreshOnly => 1,
            RefreshMode::RefreshAndPersist => 3,
        }
    }
}

impl MakeCritical for SyncRequest {}

impl From<SyncRequest> for RawControl {
    fn from(sr: SyncRequest) -> RawControl {
        let mut tags = vec![Tag::Enumerated(Enumerated {
            inner: i64::from(sr.mode),
            ..Default::default()
        })];
        if let Some(cookie) = sr.cookie {
            tags.push(Tag::OctetString(OctetString {
                inner: cookie,
                ..Default::default()
            }));
        }
        if sr.reload_hint {
            tags.push(Tag::Boolean(Boolean {
                inner: true,
                ..Default::default()
            }));
        }
        RawControl::with_value(
            SYNC_REQUEST_OID,
            false,
            Tag::Sequence(Sequence {
                inner: tags,
                ..Default::default()
            }),
        )
    }
}

/// Sync State response control ([RFC 4533](https://tools.ietf.org/html/rfc4533)).
#[derive(Clone, Debug, PartialEq)]
pub struct SyncState {
    pub state: EntryState,
    pub entry_uuid: Uuid,
    pub cookie: Option<Vec<u8>>,
}

/// Possible states for the Sync State control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    Present,
    Add,
    Modify,
    Delete,
}

fn uuid_from(bytes: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(bytes).map_err(|_| LdapError::malformed("entryUUID must have 16 octets"))
}

impl ControlParser for SyncState {
    fn parse(val: &[u8]) -> Result<SyncState> {
        let mut tags = value_sequence(val, "syncstate value")?.into_iter();
        let state = match tags.next() {
            Some(t) => integer_of(t, Types::Enumerated, "syncstate state")?,
            None => return Err(LdapError::malformed("syncstate state")),
        };
        let state = match state {
            0 => EntryState::Present,
            1 => EntryState::Add,
            2 => EntryState::Modify,
            3 => EntryState::Delete,
            _ => return Err(LdapError::malformed("syncstate state")),
        };
        let entry_uuid = match tags.next() {
            Some(t) => uuid_from(&octets_of(t, "syncstate entryUUID")?)?,
            None => return Err(LdapError::malformed("syncstate entryUUID")),
        };
        let cookie = tags
            .next()
            .map(|t| octets_of(t, "syncstate cookie"))
            .transpose()?;
        Ok(SyncState {
            state,
            entry_uuid,
            cookie,
        })
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "State: {:?}  EntryUUID: {}", self.state, self.entry_uuid)?;
        if let Some(ref cookie) = self.cookie {
            write!(f, "  Cookie: {}", String::from_utf8_lossy(cookie))?;
        }
        Ok(())
    }
}

/// Sync Done response control ([RFC 4533](https://tools.ietf.org/html/rfc4533)).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncDone {
    pub cookie: Option<Vec<u8>>,
    pub refresh_deletes: bool,
}

impl ControlParser for SyncDone {
    fn parse(val: &[u8]) -> Result<SyncDone> {
        let mut done = SyncDone::default();
        for tag in value_sequence(val, "syncdone value")? {
            if tag.is_universal(Types::OctetString) && done.cookie.is_none() {
                done.cookie = Some(octets_of(tag, "syncdone cookie")?);
            } else if tag.is_universal(Types::Boolean) {
                done.refresh_deletes = boolean_of(tag, "syncdone refreshDeletes")?;
            } else {
                return Err(LdapError::malformed("syncdone component"));
            }
        }
        Ok(done)
    }
}

impl fmt::Display for SyncDone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cookie: {}  RefreshDeletes: {}",
            String::from_utf8_lossy(self.cookie.as_deref().unwrap_or_default()),
            self.refresh_deletes
        )
    }
}

/// Values of the Sync Info intermediate message ([RFC 4533](https://tools.ietf.org/html/rfc4533)).
#[derive(Clone, Debug, PartialEq)]
pub enum SyncInfo {
    NewCookie(Vec<u8>),
    RefreshDelete {
        cookie: Option<Vec<u8>>,
        refresh_done: bool,
    },
    RefreshPresent {
        cookie: Option<Vec<u8>>,
        refresh_done: bool,
    },
    SyncIdSet {
        cookie: Option<Vec<u8>>,
        refresh_deletes: bool,
        sync_uuids: Vec<Uuid>,
    },
}

/// Parse the Sync Info value from an intermediate message of the Search stream.
pub fn parse_syncinfo(entry: ResultEntry) -> Result<SyncInfo> {
    let Intermediate { name, value } = Intermediate::parse(entry.0)?;
    if name.as_deref() != Some(SYNC_INFO_OID) {
        return Err(LdapError::malformed("syncinfo name"));
    }
    let value = value.ok_or(LdapError::malformed("syncinfo value"))?;
    let (info, _) = lber::decode(&value)?;
    decode_syncinfo(info)
}

fn decode_syncinfo(info: StructureTag) -> Result<SyncInfo> {
    if info.class != TagClass::Context {
        return Err(LdapError::malformed("syncinfo choice"));
    }
    let id = info.id;
    let comps = match (id, info.payload) {
        (0, PL::P(cookie)) => return Ok(SyncInfo::NewCookie(cookie)),
        (1..=3, PL::C(comps)) => comps,
        _ => return Err(LdapError::malformed("syncinfo choice")),
    };
    let mut cookie = None;
    // refreshDone defaults to TRUE, refreshDeletes to FALSE
    let mut flag = id != 3;
    let mut uuids = Vec::new();
    let mut pass = 0;
    for comp in comps {
        if comp.is_universal(Types::OctetString) && pass < 1 {
            cookie = Some(octets_of(comp, "syncinfo cookie")?);
            pass = 1;
        } else if comp.is_universal(Types::Boolean) && pass < 2 {
            flag = boolean_of(comp, "syncinfo flag")?;
            pass = 2;
        } else if comp.is_universal(Types::Set) && id == 3 && pass < 3 {
            for u in comp.expect_constructed().unwrap_or_default() {
                uuids.push(uuid_from(&octets_of(u, "syncUUID")?)?);
            }
            pass = 3;
        } else {
            return Err(LdapError::malformed("syncinfo component"));
        }
    }
    Ok(match id {
        1 => SyncInfo::RefreshDelete {
            cookie,
            refresh_done: flag,
        },
        2 => SyncInfo::RefreshPresent {
            cookie,
            refresh_done: flag,
        },
        _ => SyncInfo::SyncIdSet {
            cookie,
            refresh_deletes: flag,
            sync_uuids: uuids,
        },
    })
}
