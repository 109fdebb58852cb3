use std::fmt::Write;

use sha2::{Digest as ShaDigest, Sha512};

pub type Digest = [u8; 64];

pub trait Hashable {
    fn hash(&self) -> Digest;
}

/// Incremental SHA-512 over length-prefixed fields.
pub struct Hasher {
    inner: Sha512,
}

impl Hasher {
    pub fn new() -> Self {
        Hasher { inner: Sha512::new() }
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.inner.update((bytes.len() as u64).to_be_bytes());
        self.inner.update(bytes);
        self
    }

    pub fn finalize(self) -> Digest {
        let result = self.inner.finalize();
        let mut digest = [0u8; 64];
        digest.copy_from_slice(&result[..]);
        digest
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Short hex prefix for log lines.
pub fn short_hex(digest: &Digest) -> String {
    digest[..8].iter().fold(String::with_capacity(16), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
