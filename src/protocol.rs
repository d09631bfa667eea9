use std::io;

use crate::controls::RawControl;
use crate::controls_impl::{build_tag, parse_raw_controls};
use crate::search::SearchItem;
use crate::RequestId;

use lber::common::TagClass;
use lber::structure::{StructureTag, PL};
use lber::structures::{ASNTag, Integer, Sequence, Tag};
use lber::universal::Types;
use lber::value::decode_integer;
use lber::{write, DecodeError};

use bytes::{Buf, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Decoder, Encoder};

/// Largest LDAPMessage accepted from the server unless configured otherwise.
pub(crate) const DEFAULT_MAX_MESSAGE: usize = 64 * 1024 * 1024;

/// LDAPMessage framing over a byte stream.
pub(crate) struct LdapCodec {
    max_message: usize,
}

impl LdapCodec {
    pub(crate) fn new(max_message: usize) -> Self {
        LdapCodec { max_message }
    }
}

impl Default for LdapCodec {
    fn default() -> Self {
        LdapCodec::new(DEFAULT_MAX_MESSAGE)
    }
}

pub(crate) type MaybeControls = Option<Vec<RawControl>>;
pub(crate) type ItemSender = mpsc::Sender<(SearchItem, Vec<RawControl>)>;
pub(crate) type ResultSender = oneshot::Sender<(Tag, Vec<RawControl>)>;

#[derive(Debug)]
pub(crate) enum LdapOp {
    Single,
    Search(ItemSender),
    Abandon(RequestId),
    Unbind,
}

/// Split a decoded LDAPMessage into the message ID, the protocol op and the
/// wire-form controls.
pub(crate) fn parse_message(
    t: StructureTag,
) -> Result<(RequestId, StructureTag, Vec<RawControl>), DecodeError> {
    let mut tags = t.into_constructed_of(TagClass::Universal, Types::Sequence as u64, "LDAPMessage")?;
    if tags.len() > 2
        && tags
            .last()
            .is_some_and(|t| t.class == TagClass::Context && t.id == 10)
    {
        // Active Directory bug workaround
        //
        // AD incorrectly encodes Notice of Disconnection messages. The OID of the
        // Unsolicited Notification should be part of the ExtendedResponse sequence
        // but AD puts it outside, where the optional controls belong. The element
        // is dropped here.
        tags.pop();
    }
    let controls = if tags.len() == 3 {
        match tags.pop() {
            Some(ctrls) if ctrls.class == TagClass::Context && ctrls.id == 0 => {
                parse_raw_controls(ctrls)?
            }
            _ => return Err(DecodeError::InvalidContent("message controls")),
        }
    } else {
        vec![]
    };
    let (op, id) = match (tags.pop(), tags.pop(), tags.is_empty()) {
        (Some(op), Some(id), true) => (op, id),
        _ => return Err(DecodeError::InvalidContent("LDAPMessage")),
    };
    if op.class != TagClass::Application {
        return Err(DecodeError::InvalidContent("protocol op"));
    }
    let id = id.into_primitive_of(TagClass::Universal, Types::Integer as u64, "message id")?;
    let id = RequestId::try_from(decode_integer(&id)?)
        .ok()
        .filter(|id| *id >= 0)
        .ok_or(DecodeError::InvalidContent("message id"))?;
    Ok((id, op, controls))
}

/// Assemble an LDAPMessage from its components.
pub(crate) fn encode_message(id: RequestId, op: Tag, controls: MaybeControls) -> StructureTag {
    let mut msg = vec![
        Tag::Integer(Integer {
            inner: id as i64,
            ..Default::default()
        }),
        op,
    ];
    if let Some(controls) = controls {
        msg.push(Tag::StructureTag(StructureTag {
            id: 0,
            class: TagClass::Context,
            payload: PL::C(controls.into_iter().map(build_tag).collect()),
        }));
    }
    Tag::Sequence(Sequence {
        inner: msg,
        ..Default::default()
    })
    .into_structure()
}

fn invalid_data(e: DecodeError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

impl Decoder for LdapCodec {
    type Item = (RequestId, (Tag, Vec<RawControl>));
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match lber::parse::parse_encoded_len(buf) {
            Err(nom::Err::Incomplete(_)) => return Ok(None),
            Err(e) => return Err(invalid_data(DecodeError::from(e))),
            Ok((_, len)) => len.unwrap_or(buf.len()),
        };
        if len > self.max_message {
            return Err(invalid_data(DecodeError::TooLarge {
                len,
                max: self.max_message,
            }));
        }
        let (tag, consumed) = match lber::parse::parse_tag(buf) {
            Err(nom::Err::Incomplete(_)) => return Ok(None),
            Err(e) => return Err(invalid_data(DecodeError::from(e))),
            Ok((rest, tag)) => (tag, buf.len() - rest.len()),
        };
        buf.advance(consumed);
        let (id, op, controls) = parse_message(tag).map_err(invalid_data)?;
        Ok(Some((id, (Tag::StructureTag(op), controls))))
    }
}

impl Encoder<(RequestId, Tag, MaybeControls)> for LdapCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        msg: (RequestId, Tag, MaybeControls),
        into: &mut BytesMut,
    ) -> io::Result<()> {
        let (id, tag, controls) = msg;
        write::encode_into(into, encode_message(id, tag, controls));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lber::structures::{Null, OctetString};

    fn unbind(id: RequestId) -> Vec<u8> {
        let op = Tag::Null(Null {
            id: 2,
            class: TagClass::Application,
            inner: (),
        });
        lber::encode(encode_message(id, op, None))
    }

    #[test]
    fn partial_input_waits() {
        let bytes = unbind(5);
        let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert!(LdapCodec::default().decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), bytes.len() - 1);
        buf.extend_from_slice(&bytes[bytes.len() - 1..]);
        let (id, (tag, ctrls)) = LdapCodec::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(id, 5);
        assert!(ctrls.is_empty());
        match tag {
            Tag::StructureTag(t) => assert_eq!((t.class, t.id), (TagClass::Application, 2)),
            _ => panic!("not a structure tag"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_messages() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&unbind(1));
        buf.extend_from_slice(&unbind(2));
        assert_eq!(LdapCodec::default().decode(&mut buf).unwrap().unwrap().0, 1);
        assert_eq!(LdapCodec::default().decode(&mut buf).unwrap().unwrap().0, 2);
        assert!(LdapCodec::default().decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn controls_travel_with_message() {
        let ctrl = RawControl {
            ctype: "1.2.3".to_owned(),
            crit: true,
            val: Some(vec![1, 2]),
        };
        let op = Tag::OctetString(OctetString {
            id: 10,
            class: TagClass::Application,
            inner: b"cn=x".to_vec(),
        });
        let msg = encode_message(7, op, Some(vec![ctrl.clone()]));
        let (id, op, ctrls) = parse_message(msg).unwrap();
        assert_eq!(id, 7);
        assert_eq!(op.id, 10);
        assert_eq!(ctrls, vec![ctrl]);
    }

    #[test]
    fn ad_notice_of_disconnection() {
        let msg = Tag::Sequence(Sequence {
            inner: vec![
                Tag::Integer(Integer {
                    inner: 0,
                    ..Default::default()
                }),
                Tag::Sequence(Sequence {
                    id: 24,
                    class: TagClass::Application,
                    inner: vec![],
                }),
                Tag::OctetString(OctetString {
                    id: 10,
                    class: TagClass::Context,
                    inner: b"1.3.6.1.4.1.1466.20036".to_vec(),
                }),
            ],
            ..Default::default()
        })
        .into_structure();
        let (id, op, ctrls) = parse_message(msg).unwrap();
        assert_eq!((id, op.id), (0, 24));
        assert!(ctrls.is_empty());
    }

    #[test]
    fn oversized_message_refused_from_header() {
        let mut codec = LdapCodec::new(1024);
        let mut buf = BytesMut::from(&[0x30, 0x84, 0x40, 0x00, 0x00, 0x00, 0x02][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let inner = err.get_ref().and_then(|e| e.downcast_ref::<DecodeError>());
        assert_eq!(
            inner,
            Some(&DecodeError::TooLarge {
                len: 0x4000_0006,
                max: 1024
            })
        );
        let mut buf = BytesMut::from(&unbind(3)[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().0, 3);
    }

    #[test]
    fn garbage_is_invalid_data() {
        let mut buf = BytesMut::from(&[0x30, 0x03, 0x04, 0x01, 0x41][..]);
        let err = LdapCodec::default().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let mut buf = BytesMut::from(&[0x30, 0xff, 0x00][..]);
        assert_eq!(LdapCodec::default().decode(&mut buf).unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
