//! BER codec for the LDAPv3 wire format.
//!
//! Values are parsed into a [`StructureTag`](structure::StructureTag) tree, which keeps
//! the tag class, number and either the raw primitive octets or the list of children.
//! Requests are assembled from the typed wrappers in [`structures`] and serialized with
//! [`write::encode_into`].

pub mod common;
mod error;
pub mod parse;
pub mod structure;
pub mod structures;
pub mod universal;
pub mod value;
pub mod write;

pub use error::DecodeError;
pub use nom::IResult;
pub use parse::{decode, Parser};
pub use write::encode;
