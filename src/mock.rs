//! In-process scripted LDAP server for connection tests.

use crate::controls::RawControl;
use crate::protocol::{encode_message, parse_message};
use crate::{Ldap, LdapConnAsync, LdapConnSettings, RequestId};

use lber::common::TagClass;
use lber::structure::StructureTag;
use lber::structures::{ASNTag, Enumerated, OctetString, Sequence, Set, Tag};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Request as seen by the server.
#[derive(Debug)]
pub(crate) struct Request {
    pub id: RequestId,
    pub op: StructureTag,
    pub controls: Vec<RawControl>,
    /// Bytes of the whole LDAPMessage.
    pub raw: Vec<u8>,
}

impl Request {
    /// Application tag number of the protocol op.
    pub fn op_id(&self) -> u64 {
        self.op.id
    }

    pub fn control(&self, oid: &str) -> Option<&RawControl> {
        self.controls.iter().find(|c| c.ctype == oid)
    }

    /// First component of a constructed op as a string: the base of a Search,
    /// the entry DN of most update operations.
    pub fn first_string(&self) -> String {
        let first = self
            .op
            .clone()
            .expect_constructed()
            .and_then(|c| c.into_iter().next())
            .and_then(|t| t.expect_primitive())
            .expect("string component");
        String::from_utf8(first).expect("utf-8 component")
    }

    /// Message ID named by an Abandon request.
    pub fn abandoned_id(&self) -> RequestId {
        assert_eq!(self.op_id(), 16, "not an abandon request");
        let bytes = self.op.clone().expect_primitive().expect("abandon payload");
        lber::value::decode_integer(&bytes).expect("abandon msgid") as RequestId
    }
}

pub(crate) struct MockPeer {
    stream: TcpStream,
    buf: BytesMut,
}

impl MockPeer {
    /// Next request from the client, or `None` when the client has closed the connection.
    pub async fn recv(&mut self) -> Option<Request> {
        loop {
            if let Ok((rest, tag)) = lber::parse::parse_tag(&self.buf) {
                let consumed = self.buf.len() - rest.len();
                let raw = self.buf.split_to(consumed).to_vec();
                let (id, op, controls) = parse_message(tag).expect("well-formed request");
                return Some(Request {
                    id,
                    op,
                    controls,
                    raw,
                });
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => (),
            }
        }
    }

    pub async fn send(&mut self, id: RequestId, op: Tag, controls: Vec<RawControl>) {
        let controls = if controls.is_empty() {
            None
        } else {
            Some(controls)
        };
        let bytes = lber::encode(encode_message(id, op, controls));
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("mock write");
    }
}

/// Connect a fresh client to a fresh mock server, driving the connection in the background.
pub(crate) async fn connect() -> (Ldap, MockPeer) {
    connect_with(LdapConnSettings::new()).await
}

pub(crate) async fn connect_with(settings: LdapConnSettings) -> (Ldap, MockPeer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("mock bind");
    let url = format!("ldap://{}", listener.local_addr().expect("mock address"));
    let (conn, accepted) = tokio::join!(
        LdapConnAsync::with_settings(settings, &url),
        listener.accept()
    );
    let (conn, ldap) = conn.expect("client connection");
    let (stream, _) = accepted.expect("mock accept");
    crate::drive!(conn);
    (
        ldap,
        MockPeer {
            stream,
            buf: BytesMut::new(),
        },
    )
}

fn octets(s: &[u8]) -> Tag {
    Tag::OctetString(OctetString {
        inner: s.to_vec(),
        ..Default::default()
    })
}

/// `LDAPResult`-shaped response with the given application tag.
pub(crate) fn result_op(op: u64, rc: i64, text: &str) -> Tag {
    result_op_with(op, rc, text, vec![])
}

pub(crate) fn result_op_with(op: u64, rc: i64, text: &str, extra: Vec<Tag>) -> Tag {
    let mut inner = vec![
        Tag::Enumerated(Enumerated {
            inner: rc,
            ..Default::default()
        }),
        octets(b""),
        octets(text.as_bytes()),
    ];
    inner.extend(extra);
    Tag::Sequence(Sequence {
        id: op,
        class: TagClass::Application,
        inner,
    })
}

pub(crate) fn search_done(rc: i64) -> Tag {
    result_op(5, rc, "")
}

pub(crate) fn entry(dn: &str, attrs: &[(&str, &[&str])]) -> Tag {
    Tag::Sequence(Sequence {
        id: 4,
        class: TagClass::Application,
        inner: vec![
            octets(dn.as_bytes()),
            Tag::Sequence(Sequence {
                inner: attrs
                    .iter()
                    .map(|(name, vals)| {
                        Tag::Sequence(Sequence {
                            inner: vec![
                                octets(name.as_bytes()),
                                Tag::Set(Set {
                                    inner: vals.iter().map(|v| octets(v.as_bytes())).collect(),
                                    ..Default::default()
                                }),
                            ],
                            ..Default::default()
                        })
                    })
                    .collect(),
                ..Default::default()
            }),
        ],
    })
}

pub(crate) fn referral(uris: &[&str]) -> Tag {
    Tag::Sequence(Sequence {
        id: 19,
        class: TagClass::Application,
        inner: uris.iter().map(|u| octets(u.as_bytes())).collect(),
    })
}

pub(crate) fn intermediate(name: &str, value: Option<Tag>) -> Tag {
    let mut inner = vec![Tag::OctetString(OctetString {
        id: 0,
        class: TagClass::Context,
        inner: name.as_bytes().to_vec(),
    })];
    if let Some(value) = value {
        inner.push(Tag::OctetString(OctetString {
            id: 1,
            class: TagClass::Context,
            inner: lber::encode(value.into_structure()),
        }));
    }
    Tag::Sequence(Sequence {
        id: 25,
        class: TagClass::Application,
        inner,
    })
}

/// Response control whose value is the BER encoding of `value`.
pub(crate) fn control(oid: &str, value: Tag) -> RawControl {
    RawControl {
        ctype: oid.to_owned(),
        crit: false,
        val: Some(lber::encode(value.into_structure())),
    }
}
