//! Content addresses for cached objects and revisions.
//!
//! Every object in the project cache and the revision store is addressed by a
//! 40-hex SHA-1 digest. Directory objects append a `.dir` suffix to the digest
//! of their manifest; the suffix travels with the hash string wherever a hash
//! field is stored.

use std::{fmt::Display, fs::File, io, io::Read, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Byte length of a digest.
pub const HASH_SIZE: usize = 20;

/// Hex string length of a digest.
pub const HASH_LEN: usize = 40;

/// Suffix marking a directory object hash.
pub const DIR_SUFFIX: &str = ".dir";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
/// Digest value backing a 40-hex content address.
///
/// Supports conversion to/from hex strings, raw bytes and stream hashing.
pub struct ObjectHash([u8; HASH_SIZE]);

impl Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for ObjectHash {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Parse 40 hex characters into an `ObjectHash`.
impl FromStr for ObjectHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASH_LEN {
            return Err("Invalid hash length".to_string());
        }
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        let mut h = [0u8; HASH_SIZE];
        h.copy_from_slice(bytes.as_slice());
        Ok(ObjectHash(h))
    }
}

impl ObjectHash {
    /// Compute the digest of a byte slice.
    pub fn new(data: &[u8]) -> ObjectHash {
        let digest = Sha1::digest(data);
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(digest.as_ref());
        ObjectHash(bytes)
    }

    /// Compute the digest of typed content, `<type> <len>\0<data>`, the way
    /// revision objects are addressed.
    pub fn from_type_and_data(object_type: &str, data: &[u8]) -> ObjectHash {
        let mut d: Vec<u8> = Vec::with_capacity(object_type.len() + 12 + data.len());
        d.extend(object_type.as_bytes());
        d.push(b' ');
        d.extend(data.len().to_string().as_bytes());
        d.push(b'\x00');
        d.extend(data);
        ObjectHash::new(&d)
    }

    /// Compute the digest of a file's content by streaming it.
    pub fn of_file(path: &Path) -> io::Result<ObjectHash> {
        let mut file = File::open(path)?;
        let mut hasher = Sha1::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(hasher.finalize().as_ref());
        Ok(ObjectHash(bytes))
    }

    /// Return raw bytes of the digest.
    pub fn to_data(self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Zero-filled hex string.
    pub fn zero_str() -> String {
        "0".repeat(HASH_LEN)
    }
}

/// Check whether a string is a well-formed object hash: 40 hex characters,
/// optionally followed by the `.dir` suffix.
pub fn is_obj_hash(s: &str) -> bool {
    let digest = s.strip_suffix(DIR_SUFFIX).unwrap_or(s);
    digest.len() == HASH_LEN && digest.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Whether a hash string addresses a directory object.
pub fn is_dir_hash(s: &str) -> bool {
    s.ends_with(DIR_SUFFIX)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    /// Hashing "Hello, world!" should match the known SHA-1 value.
    #[test]
    fn test_new() {
        let data = "Hello, world!".as_bytes();
        let hash = ObjectHash::new(data);
        assert_eq!(hash.to_string(), "943a702d06f34599aee1f8da8ef9f7296031d699");
    }

    /// Typed hashing prefixes the content with `<type> <len>\0`.
    #[test]
    fn test_from_type_and_data() {
        let direct = ObjectHash::new(b"blob 5\x00hello");
        let typed = ObjectHash::from_type_and_data("blob", b"hello");
        assert_eq!(direct, typed);
    }

    /// Hex strings round-trip through parse and display.
    #[test]
    fn test_from_str_round_trip() {
        let hash_str = "8ab686eafeb1f44702738c8b0f24f2567c36da6d";
        let hash = ObjectHash::from_str(hash_str).unwrap();
        assert_eq!(hash.to_string(), hash_str);
    }

    /// Malformed hex strings are rejected.
    #[test]
    fn test_from_str_invalid() {
        assert!(ObjectHash::from_str("short").is_err());
        assert!(ObjectHash::from_str(&"z".repeat(40)).is_err());
    }

    /// File hashing streams the content and matches in-memory hashing.
    #[test]
    fn test_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, b"Hello, world!").unwrap();
        let hash = ObjectHash::of_file(&path).unwrap();
        assert_eq!(hash, ObjectHash::new(b"Hello, world!"));
    }

    /// Hash-string validation accepts plain and `.dir` forms only.
    #[test]
    fn test_is_obj_hash() {
        let digest = "943a702d06f34599aee1f8da8ef9f7296031d699";
        assert!(is_obj_hash(digest));
        assert!(is_obj_hash(&format!("{digest}.dir")));
        assert!(!is_obj_hash("index"));
        assert!(!is_obj_hash(&digest[..39]));
        assert!(is_dir_hash(&format!("{digest}.dir")));
        assert!(!is_dir_hash(digest));
    }
}
