//! Torrent identity: the SHA-1 of a torrent's info dictionary.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid info hash (want 40 hex chars / 20 bytes)")]
pub struct InfoHashError;

/// A v1 info-hash: 20 raw bytes, printed as 40 hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InfoHashError> {
        let arr: [u8; 20] = bytes.try_into().map_err(|_| InfoHashError)?;
        Ok(InfoHash(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, InfoHashError> {
        let s = s.trim();
        if s.len() != 40 {
            return Err(InfoHashError);
        }
        let mut arr = [0u8; 20];
        for (i, byte) in arr.iter_mut().enumerate() {
            let hi = hex_digit(s.as_bytes()[i * 2])?;
            let lo = hex_digit(s.as_bytes()[i * 2 + 1])?;
            *byte = hi << 4 | lo;
        }
        Ok(InfoHash(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

fn hex_digit(c: u8) -> Result<u8, InfoHashError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(InfoHashError),
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let hex = "000102030405060708090a0b0c0d0e0f10111213";
        let hash = InfoHash::from_hex(hex).unwrap();
        assert_eq!(hash.to_hex(), hex);
        assert_eq!(hash.as_bytes()[0], 0);
        assert_eq!(hash.as_bytes()[19], 0x13);
    }

    #[test]
    fn uppercase_and_whitespace_accepted() {
        let hash = InfoHash::from_hex("  AABBCCDDEEFF00112233445566778899AABBCCDD\n").unwrap();
        assert_eq!(hash.as_bytes()[0], 0xaa);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(InfoHash::from_hex("abcd").is_err());
        assert!(InfoHash::from_hex(&"zz".repeat(20)).is_err());
        assert!(InfoHash::from_bytes(&[0u8; 19]).is_err());
    }
}
