/*
 * Petrel mail delivery agent
 *
 * Copyright (C) 2003 - viridIT SAS
 * Licensed under the Elastic License 2.0
 *
 * You should have received a copy of the Elastic License 2.0 along with
 * this program. If not, see https://www.elastic.co/licensing/elastic-license.
 *
 */

use crate::Domain;

#[derive(Debug, thiserror::Error)]
pub enum AddressFromStrError {
    #[error("cannot parse {0:?}")]
    CannotParse(String),
}

/// A `local-part@domain` email address, the payload of the `MAIL FROM`
/// and `RCPT TO` paths.
///
/// The separator position is kept alongside the string so both halves can
/// be borrowed without rescanning.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    serde_with::SerializeDisplay,
    serde_with::DeserializeFromStr,
)]
pub struct Address {
    at_sign: usize,
    full: String,
}

impl std::str::FromStr for Address {
    type Err = AddressFromStrError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match addr::parse_email_address(s) {
            // the parser guarantees an '@' somewhere in the input
            Ok(_) => match s.find('@') {
                Some(at_sign) => Ok(Self {
                    at_sign,
                    full: s.to_owned(),
                }),
                None => Err(AddressFromStrError::CannotParse(s.to_owned())),
            },
            Err(_) => Err(AddressFromStrError::CannotParse(s.to_owned())),
        }
    }
}

impl std::fmt::Display for Address {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full)
    }
}

impl Address {
    /// The whole `local-part@domain` string.
    #[must_use]
    #[inline]
    pub fn full(&self) -> &str {
        &self.full
    }

    /// Everything left of the `@`.
    #[must_use]
    #[inline]
    pub fn local_part(&self) -> &str {
        #[allow(clippy::indexing_slicing, clippy::string_slice)]
        &self.full[..self.at_sign]
    }

    /// Everything right of the `@`, as a DNS name.
    #[must_use]
    #[inline]
    #[allow(clippy::expect_used)]
    pub fn domain(&self) -> Domain {
        #[allow(clippy::indexing_slicing, clippy::string_slice)]
        Domain::from_utf8(&self.full[self.at_sign + 1..])
            .expect("at this point, domain is valid (checked on construction)")
    }

    /// Wrap a string that is already known to be a valid address.
    ///
    /// # Panics
    ///
    /// * there is no '@' character in the string
    #[must_use]
    #[inline]
    #[allow(clippy::expect_used)]
    pub fn new_unchecked(addr: String) -> Self {
        Self {
            at_sign: addr.find('@').expect("no '@' in address"),
            full: addr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn both_halves_are_borrowable() {
        let address: Address = "postmaster@petrel.test".parse().unwrap();

        assert_eq!(address.local_part(), "postmaster");
        assert_eq!(address.domain().to_string(), "petrel.test");
        assert_eq!(address.full(), "postmaster@petrel.test");
    }

    #[test]
    fn serde_uses_the_string_form() {
        let address: Address = "postmaster@petrel.test".parse().unwrap();

        let encoded = serde_json::to_string(&address).unwrap();
        assert_eq!(encoded, r#""postmaster@petrel.test""#);
        assert_eq!(serde_json::from_str::<Address>(&encoded).unwrap(), address);
    }

    #[rstest]
    #[case::no_at_sign("not-an-address")]
    #[case::no_domain("hello@")]
    #[case::empty("")]
    fn invalid_syntax_is_rejected(#[case] input: &str) {
        assert!(input.parse::<Address>().is_err());
    }
}
