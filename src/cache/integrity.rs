//! Subresource-integrity metadata and streaming verification.
//!
//! Integrity strings are the SRI form: whitespace-separated
//! `<algorithm>-<base64 digest>` entries. The strongest listed algorithm
//! wins; a body satisfies the metadata when its digest under that
//! algorithm equals any of the listed values.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::base::error::FetchError;

/// Supported SRI hash algorithms, ordered weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Algorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "sha256" => Some(Algorithm::Sha256),
            "sha384" => Some(Algorithm::Sha384),
            "sha512" => Some(Algorithm::Sha512),
            _ => None,
        }
    }
}

/// Parsed subresource-integrity metadata.
#[derive(Debug, Clone)]
pub struct Integrity {
    entries: Vec<(Algorithm, String)>,
}

impl Integrity {
    /// Parse SRI metadata. Unrecognized algorithms are skipped; at least
    /// one recognized entry is required.
    pub fn parse(value: &str) -> Result<Self, FetchError> {
        let mut entries = Vec::new();
        for token in value.split_ascii_whitespace() {
            let Some((algo, digest)) = token.split_once('-') else {
                return Err(FetchError::InvalidIntegrity(token.to_string()));
            };
            if let Some(algo) = Algorithm::from_str(algo) {
                entries.push((algo, digest.to_string()));
            }
        }
        if entries.is_empty() {
            return Err(FetchError::InvalidIntegrity(value.to_string()));
        }
        Ok(Self { entries })
    }

    /// The strongest algorithm named in this metadata.
    pub fn algorithm(&self) -> Algorithm {
        self.entries
            .iter()
            .map(|(algo, _)| *algo)
            .max()
            .unwrap_or(Algorithm::Sha256)
    }

    /// All digests listed for the strongest algorithm.
    fn digests(&self) -> impl Iterator<Item = &str> {
        let algo = self.algorithm();
        self.entries
            .iter()
            .filter(move |(a, _)| *a == algo)
            .map(|(_, d)| d.as_str())
    }

    /// Whether a stored `<algorithm>-<base64>` digest satisfies this
    /// metadata. Used as the match-time filter against cached entries.
    pub fn accepts_digest(&self, stored: &str) -> bool {
        match stored.split_once('-') {
            Some((algo, digest)) => {
                Algorithm::from_str(algo) == Some(self.algorithm())
                    && self.digests().any(|d| d == digest)
            }
            None => false,
        }
    }

    /// Canonical string form for error messages.
    pub fn to_digest_string(&self) -> String {
        let algo = self.algorithm();
        self.digests()
            .map(|d| format!("{}-{}", algo.as_str(), d))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

enum HashState {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

/// Streaming verifier fed chunk-by-chunk as a body is consumed.
pub struct IntegrityVerifier {
    expected: Integrity,
    state: HashState,
    url: String,
}

impl IntegrityVerifier {
    pub fn new(expected: Integrity, url: impl Into<String>) -> Self {
        let state = match expected.algorithm() {
            Algorithm::Sha256 => HashState::Sha256(Sha256::new()),
            Algorithm::Sha384 => HashState::Sha384(Sha384::new()),
            Algorithm::Sha512 => HashState::Sha512(Sha512::new()),
        };
        Self {
            expected,
            state,
            url: url.into(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        match &mut self.state {
            HashState::Sha256(h) => h.update(chunk),
            HashState::Sha384(h) => h.update(chunk),
            HashState::Sha512(h) => h.update(chunk),
        }
    }

    /// Finish hashing and check the digest.
    ///
    /// Returns the `<algorithm>-<base64>` digest string on success so the
    /// store can record the verified value.
    pub fn finalize(self) -> Result<String, FetchError> {
        let algo = self.expected.algorithm();
        let digest = match self.state {
            HashState::Sha256(h) => STANDARD.encode(h.finalize()),
            HashState::Sha384(h) => STANDARD.encode(h.finalize()),
            HashState::Sha512(h) => STANDARD.encode(h.finalize()),
        };
        let actual = format!("{}-{}", algo.as_str(), digest);
        if self.expected.accepts_digest(&actual) {
            Ok(actual)
        } else {
            Err(FetchError::BadChecksum {
                url: self.url,
                expected: self.expected.to_digest_string(),
                actual,
            })
        }
    }
}

/// Compute the `sha256-<base64>` digest string for a buffer.
pub fn sha256_digest_string(data: &[u8]) -> String {
    format!("sha256-{}", STANDARD.encode(Sha256::digest(data)))
}
