use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::io::Read;
use std::str::FromStr;

/// A SHA-256 content digest, stored as lowercase hex.
///
/// Accepts both bare hex and the `sha256:` prefixed form when parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Digest(hex::encode(Sha256::digest(bytes)))
    }

    pub fn of_reader<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Digest(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl FromStr for Digest {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let hex_part = s.trim().strip_prefix("sha256:").unwrap_or(s.trim());
        if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("invalid sha256 digest '{}': expected 64 hex characters", s);
        }
        Ok(Digest(hex_part.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for Digest {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_of_bytes_and_reader_agree() {
        let a = Digest::of_bytes(b"hello");
        let b = Digest::of_reader(&b"hello"[..]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), HELLO);
        assert_eq!(a.short(), "2cf24dba5fb0");
    }

    #[test]
    fn test_parse_accepts_prefix_and_uppercase() {
        let d: Digest = format!("sha256:{}", HELLO.to_uppercase()).parse().unwrap();
        assert_eq!(d.as_str(), HELLO);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("abc".parse::<Digest>().is_err());
        assert!("z".repeat(64).parse::<Digest>().is_err());
        assert!(format!("md5:{}", HELLO).parse::<Digest>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let d = Digest::of_bytes(b"hello");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", HELLO));
        assert!(serde_json::from_str::<Digest>("\"nope\"").is_err());
    }
}
