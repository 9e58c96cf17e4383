use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 content digest.
///
/// Digests key everything in the solver: vertices are content-addressed by
/// them, the active-graph registry uses them as its primary key, and cache
/// entries derive their identity from them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl From<[u8; 32]> for Digest {
    fn from(value: [u8; 32]) -> Self {
        Digest(value)
    }
}

impl From<blake3::Hash> for Digest {
    fn from(value: blake3::Hash) -> Self {
        Digest(value.into())
    }
}

impl Digest {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Derives a new digest from this one plus a domain suffix. Used to
    /// rewrite vertex identities, e.g. to keep ignore-cache submissions
    /// distinct from their cacheable counterparts.
    pub(crate) fn derived(&self, suffix: &str) -> Self {
        blake3::Hasher::new()
            .update(&self.0)
            .update(suffix.as_bytes())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form is enough to tell vertices apart in logs.
        f.write_str(&self.to_hex()[..16])
    }
}

/// Incremental digest builder for keys assembled from several parts.
#[derive(Default)]
pub(crate) struct DigestBuilder(blake3::Hasher);

impl DigestBuilder {
    pub(crate) fn update(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        self.0.update(bytes.as_ref());
        self
    }

    pub(crate) fn finish(&self) -> Digest {
        self.0.finalize().into()
    }
}
