//! Hash algorithms used by sources and destinations.
//!
//! Backends disagree on which digest they report, so the engine has to be
//! able to compute any of them while bytes stream past, and to know which
//! ones it cannot compute and must trust instead.

use futures::{Stream, StreamExt};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::{Error, Result};

/// Remote hash value meaning "not computed, the destination does not have this file".
pub const NOT_NEEDED: &str = "not needed";

/// Local hash value meaning "a rehash for this node is pending".
pub const PENDING: &str = "?";

/// Byte stream type for upload/download operations.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// A hash algorithm, as named on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HashType {
    Md5,
    Sha1,
    Sha256,
    Sha512,
    /// SHA-1 over `"blob <size>\0"` followed by the content.
    GitHash,
    /// OneDrive's 160-bit rolling XOR.
    QuickXor,
    /// Byte count as 8 little-endian bytes.
    FileSize,
    LastModified,
    Other(String),
}

impl HashType {
    pub fn as_str(&self) -> &str {
        match self {
            HashType::Md5 => "MD5",
            HashType::Sha1 => "SHA-1",
            HashType::Sha256 => "SHA256",
            HashType::Sha512 => "SHA512",
            HashType::GitHash => "git-hash",
            HashType::QuickXor => "quickXorHash",
            HashType::FileSize => "FileSize",
            HashType::LastModified => "last_modified",
            HashType::Other(name) => name,
        }
    }

    /// Parse a wire name. Unknown names are kept as `Other`.
    pub fn parse(name: &str) -> Self {
        match name {
            "MD5" | "md5" => HashType::Md5,
            "SHA-1" | "SHA1" | "sha1" => HashType::Sha1,
            "SHA256" | "SHA-256" | "sha256" => HashType::Sha256,
            "SHA512" | "SHA-512" | "sha512" => HashType::Sha512,
            "git-hash" => HashType::GitHash,
            "quickXorHash" => HashType::QuickXor,
            "FileSize" => HashType::FileSize,
            "last_modified" => HashType::LastModified,
            other => HashType::Other(other.to_string()),
        }
    }

    /// Whether bytes can be checked against a declared value of this type.
    ///
    /// `size` is the declared content length, needed up front for git-hash.
    pub fn is_verifiable(&self, size: Option<u64>) -> bool {
        Hasher::new(self, size).is_some()
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for HashType {
    fn from(name: String) -> Self {
        HashType::parse(&name)
    }
}

impl From<HashType> for String {
    fn from(hash_type: HashType) -> Self {
        hash_type.as_str().to_string()
    }
}

/// Incremental hasher for one algorithm.
#[derive(Clone)]
pub enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
    GitHash(Sha1),
    QuickXor(QuickXor),
    FileSize(u64),
}

/// Width of a quickXorHash digest in bytes.
const QUICK_XOR_LEN: usize = 20;
/// Bits the insertion point advances per input byte.
const QUICK_XOR_SHIFT: usize = 11;

/// State of a quickXorHash: every byte is XORed into a circular 160-bit
/// register, 11 bits further along than the byte before it.
#[derive(Clone, Default)]
pub struct QuickXor {
    cells: [u8; QUICK_XOR_LEN],
    bit: usize,
    len: u64,
}

impl QuickXor {
    fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let index = self.bit / 8;
            let shifted = u16::from(byte) << (self.bit % 8);
            self.cells[index] ^= shifted as u8;
            self.cells[(index + 1) % QUICK_XOR_LEN] ^= (shifted >> 8) as u8;
            self.bit = (self.bit + QUICK_XOR_SHIFT) % (QUICK_XOR_LEN * 8);
        }
        self.len += data.len() as u64;
    }

    fn finalize(self) -> [u8; QUICK_XOR_LEN] {
        let mut out = self.cells;
        for (cell, size) in out[QUICK_XOR_LEN - 8..]
            .iter_mut()
            .zip(self.len.to_le_bytes())
        {
            *cell ^= size;
        }
        out
    }
}

impl Hasher {
    /// Create a hasher, or `None` when the algorithm cannot be computed
    /// from content alone (last_modified, unknown names, git-hash without a size).
    pub fn new(hash_type: &HashType, size: Option<u64>) -> Option<Self> {
        match hash_type {
            HashType::Md5 => Some(Hasher::Md5(Md5::new())),
            HashType::Sha1 => Some(Hasher::Sha1(Sha1::new())),
            HashType::Sha256 => Some(Hasher::Sha256(Sha256::new())),
            HashType::Sha512 => Some(Hasher::Sha512(Sha512::new())),
            HashType::GitHash => size.map(|size| {
                let mut sha = Sha1::new();
                sha.update(format!("blob {}\0", size).as_bytes());
                Hasher::GitHash(sha)
            }),
            HashType::QuickXor => Some(Hasher::QuickXor(QuickXor::default())),
            HashType::FileSize => Some(Hasher::FileSize(0)),
            HashType::LastModified | HashType::Other(_) => None,
        }
    }

    /// Like [`Hasher::new`], but an uncomputable algorithm is an error.
    pub fn required(hash_type: &HashType, size: Option<u64>) -> Result<Self> {
        Self::new(hash_type, size).ok_or_else(|| {
            Error::Unsupported(format!("cannot compute {} hash from content", hash_type))
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) | Hasher::GitHash(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
            Hasher::QuickXor(h) => h.update(data),
            Hasher::FileSize(n) => *n += data.len() as u64,
        }
    }

    /// Lowercase hex digest.
    pub fn finalize(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha1(h) | Hasher::GitHash(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
            Hasher::QuickXor(h) => hex::encode(h.finalize()),
            Hasher::FileSize(n) => hex::encode(n.to_le_bytes()),
        }
    }
}

/// Digest of one fully-read byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualDigest {
    /// Digest in the destination's default algorithm.
    pub destination: String,
    /// Digest in the source's declared algorithm, if computable.
    pub remote: Option<String>,
    /// Number of bytes seen.
    pub size: u64,
}

/// Two hashers fed with the same bytes.
#[derive(Clone)]
pub struct DualHasher {
    destination: Hasher,
    remote: Option<Hasher>,
    size: u64,
}

impl DualHasher {
    /// # Errors
    /// - `Unsupported` if the destination algorithm cannot be computed
    pub fn new(
        destination_type: &HashType,
        remote_type: Option<&HashType>,
        remote_size: Option<u64>,
    ) -> Result<Self> {
        Ok(Self {
            destination: Hasher::required(destination_type, remote_size)?,
            remote: remote_type.and_then(|t| Hasher::new(t, remote_size)),
            size: 0,
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        self.destination.update(data);
        if let Some(remote) = self.remote.as_mut() {
            remote.update(data);
        }
        self.size += data.len() as u64;
    }

    pub fn finalize(self) -> DualDigest {
        DualDigest {
            destination: self.destination.finalize(),
            remote: self.remote.map(Hasher::finalize),
            size: self.size,
        }
    }
}

/// Handle to the digests of a stream wrapped by [`hashing_stream`].
pub struct DigestHandle {
    state: Arc<Mutex<Option<DualHasher>>>,
}

impl DigestHandle {
    /// Take the digests. Only meaningful after the stream has been drained.
    ///
    /// # Errors
    /// - `InvalidInput` if called twice
    pub fn finish(self) -> Result<DualDigest> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| Error::InvalidInput("hash state poisoned".to_string()))?;
        guard
            .take()
            .map(DualHasher::finalize)
            .ok_or_else(|| Error::InvalidInput("digest already taken".to_string()))
    }
}

/// Wrap a byte stream so that every chunk passing through feeds `hasher`.
pub fn hashing_stream(inner: ByteStream, hasher: DualHasher) -> (ByteStream, DigestHandle) {
    let state = Arc::new(Mutex::new(Some(hasher)));
    let tap = state.clone();
    let stream = inner.inspect(move |chunk| {
        if let Ok(bytes) = chunk {
            if let Ok(mut guard) = tap.lock() {
                if let Some(hasher) = guard.as_mut() {
                    hasher.update(bytes);
                }
            }
        }
    });
    (Box::pin(stream), DigestHandle { state })
}

/// Drain a stream and return its digest in one algorithm.
pub async fn hash_stream(mut stream: ByteStream, mut hasher: Hasher) -> Result<String> {
    while let Some(chunk) = stream.next().await {
        hasher.update(&chunk?);
    }
    Ok(hasher.finalize())
}

/// Digest of an in-memory buffer.
pub fn hash_bytes(hash_type: &HashType, data: &[u8]) -> Result<String> {
    let mut hasher = Hasher::required(hash_type, Some(data.len() as u64))?;
    hasher.update(data);
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use proptest::prelude::*;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            hash_bytes(&HashType::Md5, b"hello").unwrap(),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(
            hash_bytes(&HashType::Sha1, b"hello").unwrap(),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
        assert_eq!(
            hash_bytes(&HashType::Sha256, b"hello").unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(
            hash_bytes(&HashType::FileSize, b"hello").unwrap(),
            "0500000000000000"
        );
    }

    #[test]
    fn test_git_hash_matches_git() {
        // `printf hello | git hash-object --stdin`
        assert_eq!(
            hash_bytes(&HashType::GitHash, b"hello").unwrap(),
            "b6fc4c620b67d95f953a5c1c1230aaab5db5a1b0"
        );
    }

    #[test]
    fn test_quick_xor_vectors() {
        // OneDrive reports these base64-encoded: "AAAAAAAAAAAAAAAAAAAAAAAAAAA="
        // and "SgAAAAAAAAAAAAAAAQAAAAAAAAA=".
        assert_eq!(
            hash_bytes(&HashType::QuickXor, b"").unwrap(),
            "0000000000000000000000000000000000000000"
        );
        assert_eq!(
            hash_bytes(&HashType::QuickXor, &[0x4a]).unwrap(),
            "4a00000000000000000000000100000000000000"
        );
        assert_eq!(
            hash_bytes(&HashType::QuickXor, b"hello").unwrap(),
            "6828031bd8f00600000000000500000000000000"
        );
    }

    #[test]
    fn test_quick_xor_wraps_around() {
        assert_eq!(
            hash_bytes(&HashType::QuickXor, b"The quick brown fox jumps over the lazy dog").unwrap(),
            "6cc4a56f2b26c492fa4bbe57c1f31c4193a972be"
        );
    }

    #[test]
    fn test_uncomputable_types() {
        assert!(HashType::QuickXor.is_verifiable(None));
        assert!(!HashType::LastModified.is_verifiable(Some(1)));
        assert!(!HashType::Other("crc32".into()).is_verifiable(Some(1)));
        assert!(!HashType::GitHash.is_verifiable(None));
        assert!(HashType::GitHash.is_verifiable(Some(0)));
        assert!(hash_bytes(&HashType::LastModified, b"x").is_err());
    }

    #[test]
    fn test_wire_names_round_trip() {
        for t in [
            HashType::Md5,
            HashType::Sha1,
            HashType::Sha256,
            HashType::Sha512,
            HashType::GitHash,
            HashType::QuickXor,
            HashType::FileSize,
            HashType::LastModified,
        ] {
            assert_eq!(HashType::parse(t.as_str()), t);
        }
        let json = serde_json::to_string(&HashType::Sha1).unwrap();
        assert_eq!(json, "\"SHA-1\"");
        let other: HashType = serde_json::from_str("\"crc32\"").unwrap();
        assert_eq!(other, HashType::Other("crc32".to_string()));
    }

    #[tokio::test]
    async fn test_hashing_stream_reports_both_digests() {
        let chunks: Vec<Result<Vec<u8>>> = vec![Ok(b"hel".to_vec()), Ok(b"lo".to_vec())];
        let inner: ByteStream = Box::pin(stream::iter(chunks));
        let hasher = DualHasher::new(&HashType::Md5, Some(&HashType::Sha1), Some(5)).unwrap();
        let (mut wrapped, handle) = hashing_stream(inner, hasher);

        let mut seen = Vec::new();
        while let Some(chunk) = wrapped.next().await {
            seen.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(seen, b"hello");

        let digest = handle.finish().unwrap();
        assert_eq!(digest.destination, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(
            digest.remote.as_deref(),
            Some("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d")
        );
        assert_eq!(digest.size, 5);
    }

    #[test]
    fn test_dual_hasher_without_remote() {
        let mut hasher = DualHasher::new(&HashType::Md5, Some(&HashType::GitHash), None).unwrap();
        hasher.update(b"abc");
        let digest = hasher.finalize();
        assert!(digest.remote.is_none());
        assert_eq!(digest.size, 3);
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_digest(data in proptest::collection::vec(any::<u8>(), 0..512), split in 0usize..512) {
            let split = split.min(data.len());
            for hash_type in [HashType::Sha256, HashType::QuickXor] {
                let mut chunked = Hasher::new(&hash_type, None).unwrap();
                chunked.update(&data[..split]);
                chunked.update(&data[split..]);
                prop_assert_eq!(chunked.finalize(), hash_bytes(&hash_type, &data).unwrap());
            }
        }
    }
}
