use std::fmt::{Display, Formatter};
use std::io::{Read, Write};
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde::de::Error;
use sha2::{Digest as _, Sha256};

pub const SHA256_PREFIX: &str = "sha256:";

/// Size of the two zero blocks that terminate every tar archive.
const EMPTY_TAR_SIZE: usize = 1024;

/// A content digest on the form `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    pub fn of_bytes(data: &[u8]) -> Digest {
        let mut hasher = ContentHash::new();
        hasher.add(data);
        hasher.finalize()
    }

    pub fn hex(&self) -> &str {
        &self.0[SHA256_PREFIX.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.hex()[..12]
    }
}

impl FromStr for Digest {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let regex = Regex::new("^sha256:[a-f0-9]{64}$").map_err(|err| err.to_string())?;
        if regex.is_match(text) {
            return Ok(Digest(text.to_owned()));
        }

        // Bare hex is accepted as a sha256 digest
        let regex = Regex::new("^[a-f0-9]{64}$").map_err(|err| err.to_string())?;
        if regex.is_match(text) {
            return Ok(Digest(format!("{}{}", SHA256_PREFIX, text)));
        }

        Err(format!("Invalid digest '{}'", text))
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error> where S: Serializer {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Digest, D::Error> where D: Deserializer<'de> {
        let text = String::deserialize(deserializer)?;
        Digest::from_str(&text).map_err(D::Error::custom)
    }
}

macro_rules! digest_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Digest);

        impl $name {
            pub fn new(digest: Digest) -> $name {
                $name(digest)
            }

            pub fn digest(&self) -> &Digest {
                &self.0
            }

            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }

            pub fn short(&self) -> &str {
                self.0.short()
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(text: &str) -> Result<Self, Self::Err> {
                Digest::from_str(text).map($name)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Digest> for $name {
            fn from(digest: Digest) -> Self {
                $name(digest)
            }
        }
    };
}

digest_type!(
    /// Digest of a single uncompressed filesystem diff.
    DiffId
);

digest_type!(
    /// Identity of an ordered stack of diffs, see [`ChainId::extend`].
    ChainId
);

digest_type!(
    /// Digest of the serialized image configuration.
    ImageId
);

impl ChainId {
    /// Computes the chain ID of `diff_id` stacked on top of `parent`.
    pub fn extend(parent: Option<&ChainId>, diff_id: &DiffId) -> ChainId {
        match parent {
            None => ChainId(diff_id.digest().clone()),
            Some(parent) => ChainId(Digest::of_bytes(format!("{} {}", parent, diff_id).as_bytes()))
        }
    }

    /// Computes the chain ID of the full stack, `None` for an empty stack.
    pub fn from_diff_ids(diff_ids: &[DiffId]) -> Option<ChainId> {
        let mut chain_id = None;
        for diff_id in diff_ids {
            chain_id = Some(ChainId::extend(chain_id.as_ref(), diff_id));
        }

        chain_id
    }
}

impl DiffId {
    /// The diff ID of a tar archive without entries.
    pub fn empty_layer() -> DiffId {
        DiffId(Digest::of_bytes(&[0; EMPTY_TAR_SIZE]))
    }

    pub fn is_empty_layer(&self) -> bool {
        self == &DiffId::empty_layer()
    }
}

pub struct ContentHash {
    hasher: Sha256
}

impl ContentHash {
    pub fn new() -> ContentHash {
        ContentHash {
            hasher: Sha256::new()
        }
    }

    pub fn add(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> Digest {
        Digest(format!("{}{}", SHA256_PREFIX, base16ct::lower::encode_string(&self.hasher.finalize())))
    }
}

/// Hashes everything that is read through it.
pub struct DigestingReader<R> {
    inner: R,
    hasher: ContentHash,
    bytes_read: u64
}

impl<R: Read> DigestingReader<R> {
    pub fn new(inner: R) -> DigestingReader<R> {
        DigestingReader {
            inner,
            hasher: ContentHash::new(),
            bytes_read: 0
        }
    }

    pub fn finish(self) -> (Digest, u64) {
        (self.hasher.finalize(), self.bytes_read)
    }
}

impl<R: Read> Read for DigestingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.hasher.add(&buf[..count]);
        self.bytes_read += count as u64;
        Ok(count)
    }
}

/// Hashes everything that is written through it.
pub struct DigestingWriter<W> {
    inner: W,
    hasher: ContentHash,
    bytes_written: u64
}

impl<W: Write> DigestingWriter<W> {
    pub fn new(inner: W) -> DigestingWriter<W> {
        DigestingWriter {
            inner,
            hasher: ContentHash::new(),
            bytes_written: 0
        }
    }

    pub fn finish(self) -> (W, Digest, u64) {
        (self.inner, self.hasher.finalize(), self.bytes_written)
    }
}

impl<W: Write> Write for DigestingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.hasher.add(&buf[..count]);
        self.bytes_written += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[test]
fn test_digest_of_bytes() {
    assert_eq!(
        "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
        Digest::of_bytes(b"hello").as_str()
    );
}

#[test]
fn test_digest_parse1() {
    let digest = Digest::from_str("sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824").unwrap();
    assert_eq!("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824", digest.hex());
    assert_eq!("2cf24dba5fb0", digest.short());
}

#[test]
fn test_digest_parse2() {
    assert_eq!(
        Some(Digest::of_bytes(b"hello")),
        Digest::from_str("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824").ok()
    );
}

#[test]
fn test_digest_parse3() {
    assert!(Digest::from_str("sha256:2cf24dba").is_err());
    assert!(Digest::from_str("md5:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824").is_err());
}

#[test]
fn test_digest_serialize() {
    let diff_id = DiffId::new(Digest::of_bytes(b"hello"));
    let content = serde_json::to_string(&diff_id).unwrap();
    assert_eq!("\"sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824\"", content);

    let deserialized: DiffId = serde_json::from_str(&content).unwrap();
    assert_eq!(diff_id, deserialized);
}

#[test]
fn test_chain_id_single() {
    let diff_id = DiffId::new(Digest::of_bytes(b"layer1"));
    assert_eq!(diff_id.digest(), ChainId::extend(None, &diff_id).digest());
}

#[test]
fn test_chain_id_stack() {
    let diff1 = DiffId::new(Digest::of_bytes(b"layer1"));
    let diff2 = DiffId::new(Digest::of_bytes(b"layer2"));

    let chain1 = ChainId::extend(None, &diff1);
    let chain2 = ChainId::extend(Some(&chain1), &diff2);
    assert_eq!(Digest::of_bytes(format!("{} {}", diff1, diff2).as_bytes()), chain2.digest().clone());
    assert_eq!(Some(chain2.clone()), ChainId::from_diff_ids(&[diff1.clone(), diff2.clone()]));
    assert_ne!(chain2, ChainId::from_diff_ids(&[diff2, diff1]).unwrap());
    assert_eq!(None, ChainId::from_diff_ids(&[]));
}

#[test]
fn test_empty_layer() {
    assert_eq!(
        "sha256:5f70bf18a086007016e948b04aed3b82103a36bea41755b6cddfaf10ace3c6ef",
        DiffId::empty_layer().as_str()
    );
}

#[test]
fn test_digesting_reader() {
    let mut reader = DigestingReader::new(&b"hello"[..]);
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer).unwrap();

    let (digest, size) = reader.finish();
    assert_eq!(Digest::of_bytes(b"hello"), digest);
    assert_eq!(5, size);
}

#[test]
fn test_digesting_writer() {
    let mut writer = DigestingWriter::new(Vec::new());
    writer.write_all(b"hel").unwrap();
    writer.write_all(b"lo").unwrap();

    let (content, digest, size) = writer.finish();
    assert_eq!(b"hello".to_vec(), content);
    assert_eq!(Digest::of_bytes(b"hello"), digest);
    assert_eq!(5, size);
}
