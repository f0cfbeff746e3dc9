use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const PAIRS: usize = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("not a valid username: \"{0}\". Must be 6 pairs of colon-separated hexadecimal chars (A-F 0-9), like a MAC address")]
pub struct InvalidIdentity(pub String);

/// Address-like bridge identity (`AA:BB:CC:DD:EE:FF`).
///
/// Used as the pairing username of a bridge and as the key for child bridges
/// and port allocations. Always stored upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BridgeIdentity(String);

impl BridgeIdentity {
    /// Upper-case and validate an identity string.
    pub fn parse(value: &str) -> Result<Self, InvalidIdentity> {
        let upper = value.trim().to_ascii_uppercase();
        if is_valid(&upper) {
            Ok(Self(upper))
        } else {
            Err(InvalidIdentity(value.to_string()))
        }
    }

    /// Derive a stable identity from arbitrary bytes (e.g. an accessory UUID).
    pub fn derive(data: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(data.as_ref());
        let pairs: Vec<String> = digest
            .iter()
            .take(PAIRS)
            .map(|byte| format!("{byte:02X}"))
            .collect();
        Self(pairs.join(":"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identity without separators, e.g. `0E3A1F00AB12`.
    pub fn compact(&self) -> String {
        self.0.replace(':', "")
    }
}

fn is_valid(value: &str) -> bool {
    let pairs: Vec<&str> = value.split(':').collect();
    pairs.len() == PAIRS
        && pairs.iter().all(|pair| {
            pair.len() == 2
                && pair
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
        })
}

impl fmt::Display for BridgeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BridgeIdentity {
    type Err = InvalidIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BridgeIdentity {
    type Error = InvalidIdentity;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BridgeIdentity> for String {
    fn from(identity: BridgeIdentity) -> Self {
        identity.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_upper_cases_valid_identity() {
        let id = BridgeIdentity::parse("0e:3a:1f:00:ab:12").unwrap();
        assert_eq!(id.as_str(), "0E:3A:1F:00:AB:12");
        assert_eq!(id.compact(), "0E3A1F00AB12");
    }

    #[test]
    fn parse_rejects_malformed_identities() {
        for bad in [
            "",
            "0E:3A:1F:00:AB",
            "0E:3A:1F:00:AB:12:34",
            "0E-3A-1F-00-AB-12",
            "0E:3A:1F:00:AB:1G",
            "0E:3A:1F:00:AB:123",
        ] {
            assert!(BridgeIdentity::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn derive_is_stable_and_valid() {
        let a = BridgeIdentity::derive("accessory-uuid");
        let b = BridgeIdentity::derive("accessory-uuid");
        assert_eq!(a, b);
        assert!(BridgeIdentity::parse(a.as_str()).is_ok());
        assert_ne!(a, BridgeIdentity::derive("other-uuid"));
    }

    #[test]
    fn deserialize_validates() {
        let ok: BridgeIdentity = serde_json::from_str("\"aa:bb:cc:dd:ee:ff\"").unwrap();
        assert_eq!(ok.as_str(), "AA:BB:CC:DD:EE:FF");
        assert!(serde_json::from_str::<BridgeIdentity>("\"nope\"").is_err());
    }
}
