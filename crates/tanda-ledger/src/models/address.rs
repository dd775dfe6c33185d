//! Participant and pool identifiers.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Length of an address body in hex digits (20 bytes).
const ADDRESS_HEX_LEN: usize = 40;

/// An account address.
///
/// Kept with the casing it was given; compared and hashed case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parse and validate an address of the form `0x` + 40 hex digits.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let body = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| Error::Validation(format!("address must start with 0x: {:?}", s)))?;

        if body.len() != ADDRESS_HEX_LEN {
            return Err(Error::Validation(format!(
                "address must have {} hex digits: {:?}",
                ADDRESS_HEX_LEN, s
            )));
        }
        hex::decode(body)
            .map_err(|e| Error::Validation(format!("invalid address {:?}: {}", s, e)))?;

        Ok(Self(s.to_string()))
    }

    /// The address as given.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase form used for index keys.
    pub fn key(&self) -> String {
        self.0.to_ascii_lowercase()
    }

    /// Case-insensitive comparison against a raw string.
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ALICE: &str = "0x52908400098527886E0F7030069857D2E4169EE7";

    #[test]
    fn parse_valid() {
        let addr = Address::parse(ALICE).unwrap();
        assert_eq!(addr.as_str(), ALICE);
        assert_eq!(addr.key(), ALICE.to_ascii_lowercase());
    }

    #[test]
    fn parse_trims_whitespace() {
        let addr = Address::parse(&format!("  {}\n", ALICE)).unwrap();
        assert_eq!(addr.as_str(), ALICE);
    }

    #[test]
    fn parse_rejects_bad_shapes() {
        assert!(Address::parse("52908400098527886E0F7030069857D2E4169EE7").is_err());
        assert!(Address::parse("0x1234").is_err());
        assert!(Address::parse("0xZZ908400098527886E0F7030069857D2E4169EE7").is_err());
        assert!(Address::parse("").is_err());
    }

    #[test]
    fn equality_ignores_case() {
        let upper = Address::parse(ALICE).unwrap();
        let lower = Address::parse(&ALICE.to_ascii_lowercase()).unwrap();
        assert_eq!(upper, lower);
        assert!(upper.matches(&ALICE.to_ascii_lowercase()));

        let set: HashSet<Address> = [upper, lower].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn deserialize_validates() {
        let addr: Address = serde_json::from_value(serde_json::json!(ALICE)).unwrap();
        assert_eq!(serde_json::to_value(&addr).unwrap(), ALICE);
        assert!(serde_json::from_value::<Address>(serde_json::json!("0xnope")).is_err());
    }
}
