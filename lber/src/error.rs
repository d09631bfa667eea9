use thiserror::Error;

/// Failure to decode BER data.
///
/// Every variant means the input cannot be interpreted as well-formed BER;
/// on a stream transport, framing is lost once any of these is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated BER input")]
    Truncated,
    #[error("tag number overflow")]
    TagOverflow,
    #[error("length overflow")]
    LengthOverflow,
    #[error("reserved length octet 0xff")]
    ReservedLength,
    #[error("indefinite length on a primitive value")]
    IndefinitePrimitive,
    #[error("nesting too deep")]
    TooDeep,
    #[error("invalid {0} content")]
    InvalidContent(&'static str),
    #[error("integer does not fit in 64 bits")]
    IntegerOverflow,
    #[error("value of {len} bytes exceeds the limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("malformed BER: {0}")]
    Malformed(String),
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for DecodeError {
    fn from(e: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        use nom::error::ErrorKind;

        match e {
            nom::Err::Incomplete(_) => DecodeError::Truncated,
            nom::Err::Error(e) | nom::Err::Failure(e) => match e.code {
                ErrorKind::Eof => DecodeError::Truncated,
                ErrorKind::TagBits => DecodeError::TagOverflow,
                ErrorKind::TooLarge => DecodeError::LengthOverflow,
                ErrorKind::LengthValue => DecodeError::ReservedLength,
                ErrorKind::Verify => DecodeError::IndefinitePrimitive,
                ErrorKind::Count => DecodeError::TooDeep,
                kind => DecodeError::Malformed(format!("{:?}", kind)),
            },
        }
    }
}
