use std::{
    error::Error as StdError,
    fmt::{self, Display, Formatter},
};

use crate::mailer::state::Failure;

/// Errors raised to the caller before or instead of a result map.
///
/// Per-recipient delivery problems are not raised: `send_multi` reports
/// them as [`Failure`] values in its result map. Only caller misuse and the
/// single-recipient `send` shortcut produce an `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The message has no sender address
    MissingFrom,
    /// The message has no recipients
    MissingTo,
    /// `send` was called with a message addressed to more than one
    /// recipient; use `send_multi` for those
    TooManyRecipients,
    /// The message exceeds the per-send recipient limit
    RecipientLimit(usize),
    /// A header field contains line breaks or other forbidden characters
    InvalidHeader(&'static str),
    /// The single recipient of a `send` call could not be delivered to
    Delivery(Failure),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Error::MissingFrom => f.write_str("missing sender address"),
            Error::MissingTo => f.write_str("missing destination address"),
            Error::TooManyRecipients => {
                f.write_str("send() takes a single recipient, use send_multi()")
            }
            Error::RecipientLimit(limit) => {
                write!(f, "message exceeds the limit of {limit} recipients")
            }
            Error::InvalidHeader(name) => write!(f, "invalid {name} header"),
            Error::Delivery(failure) => failure.fmt(f),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Delivery(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Error {
        Error::Delivery(failure)
    }
}
