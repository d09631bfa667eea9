//! A multiplexing LDAPv3 client core using the Tokio stack.
//!
//! ## Summary
//!
//! [`LdapConnAsync`](struct.LdapConnAsync.html) opens a connection and returns it
//! together with an [`Ldap`](struct.Ldap.html) handle. The connection is a task which
//! must be spawned on the Tokio runtime; it's the single reader of the socket, writes
//! requests in submission order, and routes each response to the operation waiting for
//! its message ID. Handles can be cloned freely, and every clone can run operations
//! concurrently on the same connection.
//!
//! In the [struct list](#structs), async-related structs have an asterisk (__*__) after
//! the short description.
//!
//! Operations cover the full LDAPv3 set: Bind (simple, unauthenticated, SASL EXTERNAL
//! and, with the __ntlm__ feature, NTLM), Search (collected, streamed, paged), Add,
//! Modify, Delete, ModifyDN, Compare, Extended, Abandon and Unbind. Cookie-driven
//! replication searches, content synchronization (RFC 4533) and Active Directory
//! DirSync, are available through [`Ldap::syncrepl()`](struct.Ldap.html#method.syncrepl)
//! and [`Ldap::dirsync()`](struct.Ldap.html#method.dirsync).
//!
//! The documentation is written for readers familiar with LDAP concepts and terminology,
//! which it won't attempt to explain.
//!
//! ## Compile-time features
//!
//! * __ntlm__ (disabled by default): NTLM authentication support. Username and password must
//!   be provided, and the password must be in cleartext. It works on TLS connections, or clear
//!   connections with no signing or sealing. With __tls-native__, a channel binding token is
//!   sent to the server if possible. See [`Ldap::sasl_ntlm_bind()`](struct.Ldap.html#method.sasl_ntlm_bind).
//!
//! * __tls__ (enabled by default): TLS support, backed by the `native-tls` crate, which uses
//!   a platform-specific TLS backend. This is an alias for __tls-native__.
//!
//! * __tls-rustls-...__ (disabled by default): TLS support, backed by the Rustls library.
//!   A crypto provider must be chosen: __tls-rustls-aws-lc-rs__ or __tls-rustls-ring__.
//!   Another provider can be chosen by activating the corresponding feature in Rustls and
//!   setting the flags __tls-rustls__ and __rustls-provider__.
//!
//! Without any features, only plain TCP connections (and Unix domain sockets on Unix-like
//! platforms) are available. __tls-native__ and __tls-rustls__ are mutually exclusive.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ldapmux::{LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
//! use ldapmux::result::Result;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let settings = LdapConnSettings::new().set_op_timeout(Duration::from_secs(10));
//!     let (conn, mut ldap) = LdapConnAsync::with_settings(settings, "ldap://localhost:2389").await?;
//!     ldapmux::drive!(conn);
//!     ldap.simple_bind("cn=Manager,dc=example,dc=org", "secret").await?.success()?;
//!     let (rs, _res) = ldap.search_with_paging(
//!         "ou=Places,dc=example,dc=org",
//!         Scope::Subtree,
//!         "(&(objectClass=locality)(l=ma*))",
//!         vec!["l"],
//!         100,
//!     ).await?.success()?;
//!     for entry in rs {
//!         println!("{:?}", SearchEntry::construct(entry)?);
//!     }
//!     Ok(ldap.unbind().await?)
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

#[doc(hidden)]
#[macro_use]
pub extern crate log;
#[doc(hidden)]
pub use tokio;

/// Type alias for the LDAP message ID.
pub type RequestId = i32;

pub mod asn1 {
    //! ASN.1 structure construction and parsing.
    //!
    //! These are the building blocks for implementing controls and extended
    //! operations outside of the library. Consult the source of the existing
    //! controls and exops for examples.
    pub use lber::common::TagClass;
    pub use lber::parse::{parse_tag, parse_tag_raw, parse_uint};
    pub use lber::structure::{StructureTag, PL};
    pub use lber::structures::{
        ASNTag, Boolean, Enumerated, ExplicitTag, Integer, Null, OctetString, Sequence, Set, Tag,
    };
    pub use lber::universal::Types;
    pub use lber::write;
    pub use lber::{decode, encode, DecodeError, IResult};
}
mod conn;
pub mod controls {
    //! Control construction and parsing.
    //!
    //! A control can be associated with a request or a response. Several common
    //! controls, such as [`PagedResults`](struct.PagedResults.html), are implemented
    //! directly by this library. If an implemented control has the same form for
    //! the request and the response, there will be a single structure for both.
    //! If the response control is different, its name will consist of the request
    //! control name with the `Resp` suffix.
    //!
    //! A request control is created by instantiating its structure and converting
    //! it with `into()` when passing it to [`with_controls()`](../struct.Ldap.html#method.with_controls).
    //! A third-party control must implement the conversion from an instance of itself
    //! to [`RawControl`](struct.RawControl.html), the wire form of a control.
    //!
    //! Response controls are decoded upon arrival into [`Control`](struct.Control.html):
    //! the registered [`ControlType`](enum.ControlType.html), if the OID is known, and the
    //! decoded [`ControlValue`](enum.ControlValue.html). Unknown controls keep their raw
    //! value.
    //!
    //! ### Example
    //!
    //! ```rust,no_run
    //! # use ldapmux::controls::{find_control, ControlValue, PagedResults};
    //! # use ldapmux::result::Result;
    //! # use ldapmux::{LdapConnAsync, Scope};
    //! # #[tokio::main]
    //! # async fn main() -> Result<()> {
    //! # let (conn, mut ldap) = LdapConnAsync::new("ldap://localhost").await?;
    //! # ldapmux::drive!(conn);
    //! let res = ldap
    //!     .with_controls(PagedResults { size: 10, cookie: vec![] })
    //!     .search("dc=example,dc=org", Scope::Subtree, "(objectClass=*)", vec!["cn"])
    //!     .await?;
    //! if let Some(ctrl) = find_control(&res.1.ctrls, "1.2.840.113556.1.4.319") {
    //!     if let ControlValue::Paging(ref pr) = ctrl.value {
    //!         println!("{}", pr);
    //!     }
    //! }
    //! # Ok(())
    //! # }
    //! ```
    pub use crate::controls_impl::{
        decode_controls, find_control, parse_controls, parse_syncinfo, Control, ControlParser,
        ControlType, ControlValue, CriticalControl, IntoRawControlVec, MakeCritical, RawControl,
    };
    pub use crate::controls_impl::{
        DirSync, ManageDsaIt, Notification, PagedResults, PasswordExpiring, PasswordPolicy,
        PasswordPolicyError, PasswordPolicyResp, ServerLinkTtl, ServerSort, ShowDeleted,
        SortKey, SortResult, SubtreeDelete, WhoAmIControl,
    };
    pub use crate::controls_impl::{
        EntryState, RefreshMode, SyncDone, SyncInfo, SyncRequest, SyncState,
    };
}
mod controls_impl;
pub mod dn;
mod exop_impl;
pub mod exop {
    //! Extended operation construction and parsing.
    //!
    //! A generic exop is represented by [`Exop`](struct.Exop.html). If a particular
    //! exop is implemented by this library, it may have one or two associated structs;
    //! one for constructing requests, and another for parsing responses. If request and
    //! response are the same, there is only the request struct; if they are different,
    //! the response struct's name will consist of the request struct name with the
    //! `Resp` suffix.
    //!
    //! A request struct must implement the `From` conversion of itself into `Exop`.
    //! A response struct must implement the [`ExopParser`](trait.ExopParser.html)
    //! trait.
    pub use crate::exop_impl::{
        Exop, ExopParser, PasswordModify, PasswordModifyResp, StartTLS, WhoAmI, WhoAmIResp,
    };
}
pub mod filter;
mod ldap;
#[cfg(test)]
mod mock;
mod protocol;
mod replication;
pub mod result;
mod search;

pub use conn::{LdapConnAsync, LdapConnSettings, StdStream};
pub use dn::dn_escape;
pub use filter::{ldap_escape, parse as parse_filter};
pub use ldap::{Ldap, Mod};
pub use replication::{SyncEvent, SyncStream};
pub use result::{LdapError, LdapResult, SearchResult};
pub use search::parse_refs;
pub use search::{
    DerefAliases, EntryAttribute, Intermediate, ResultEntry, Scope, SearchEntry, SearchOptions,
    SearchStream, StreamState,
};
