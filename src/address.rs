//! Representation of an email address

use std::{
    error::Error as StdError,
    fmt::{Display, Formatter, Result as FmtResult},
    net::IpAddr,
    str::FromStr,
};

use email_address::EmailAddress;
use idna::domain_to_ascii;

/// An email address in canonical _user@domain_ form.
///
/// The domain part is what the resolver turns into a delivery server, so it
/// is validated up front; an address that parses can always be grouped.
///
/// # Examples
///
/// ```
/// use mxsend::Address;
///
/// # use std::error::Error;
/// # fn main() -> Result<(), Box<dyn Error>> {
/// let address = "user@email.com".parse::<Address>()?;
/// assert_eq!(address.user(), "user");
/// assert_eq!(address.domain(), "email.com");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct Address {
    /// Complete address
    serialized: String,
    /// Index into `serialized` before the '@'
    at_start: usize,
}

impl Address {
    /// Creates a new email address from a user and domain
    pub fn new<U: AsRef<str>, D: AsRef<str>>(user: U, domain: D) -> Result<Self, AddressError> {
        let user = user.as_ref();
        Address::check_user(user)?;

        let domain = domain.as_ref();
        Address::check_domain(domain)?;

        Ok(Address {
            serialized: format!("{user}@{domain}"),
            at_start: user.len(),
        })
    }

    /// Gets the user portion of the address
    pub fn user(&self) -> &str {
        &self.serialized[..self.at_start]
    }

    /// Gets the domain portion of the address
    pub fn domain(&self) -> &str {
        &self.serialized[self.at_start + 1..]
    }

    fn check_user(user: &str) -> Result<(), AddressError> {
        if EmailAddress::is_valid_local_part(user) {
            Ok(())
        } else {
            Err(AddressError::InvalidUser)
        }
    }

    fn check_domain(domain: &str) -> Result<(), AddressError> {
        Address::check_domain_ascii(domain).or_else(|_| {
            domain_to_ascii(domain)
                .map_err(|_| AddressError::InvalidDomain)
                .and_then(|domain| Address::check_domain_ascii(&domain))
        })
    }

    fn check_domain_ascii(domain: &str) -> Result<(), AddressError> {
        if EmailAddress::is_valid_domain(domain) {
            return Ok(());
        }

        // address literals like [192.0.2.1]
        let ip = domain
            .strip_prefix('[')
            .and_then(|ip| ip.strip_suffix(']'))
            .unwrap_or(domain);

        if ip.parse::<IpAddr>().is_ok() {
            return Ok(());
        }

        Err(AddressError::InvalidDomain)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.serialized)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(val: &str) -> Result<Self, AddressError> {
        let mut parts = val.rsplitn(2, '@');
        let domain = parts.next().ok_or(AddressError::MissingParts)?;
        let user = parts.next().ok_or(AddressError::MissingParts)?;

        Address::check_user(user)?;
        Address::check_domain(domain)?;

        Ok(Address {
            serialized: val.into(),
            at_start: user.len(),
        })
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.serialized
    }
}

/// Errors in email address parsing
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum AddressError {
    /// Missing domain or user
    MissingParts,
    /// Invalid email user
    InvalidUser,
    /// Invalid email domain
    InvalidDomain,
}

impl StdError for AddressError {}

impl Display for AddressError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            AddressError::MissingParts => f.write_str("missing domain or user"),
            AddressError::InvalidUser => f.write_str("invalid user"),
            AddressError::InvalidDomain => f.write_str("invalid domain"),
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_splits_user_and_domain() {
        let address = "noa@resare.com".parse::<Address>().unwrap();
        assert_eq!(address.user(), "noa");
        assert_eq!(address.domain(), "resare.com");
        assert_eq!(address.to_string(), "noa@resare.com");
    }

    #[test]
    fn parse_keeps_quoted_at_in_user() {
        let address = r#""user@name"@example.com"#.parse::<Address>().unwrap();
        assert_eq!(address.domain(), "example.com");
    }

    #[test]
    fn rejects_missing_at() {
        assert_eq!(
            "nodomain".parse::<Address>(),
            Err(AddressError::MissingParts)
        );
    }

    #[test]
    fn rejects_empty_domain() {
        assert_eq!("user@".parse::<Address>(), Err(AddressError::InvalidDomain));
    }

    #[test]
    fn accepts_address_literal_domain() {
        let address = "user@[192.0.2.1]".parse::<Address>().unwrap();
        assert_eq!(address.domain(), "[192.0.2.1]");
    }
}
