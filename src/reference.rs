use std::fmt::{Display, Formatter};
use std::str::FromStr;

use regex::Regex;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde::de::{Error, Visitor};

use crate::digest::{Digest, ImageId};

/// Anything an image can be looked up by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {
    Named(NamedReference),
    ImageId(ImageId)
}

impl FromStr for Reference {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if let Ok(image_id) = ImageId::from_str(text) {
            return Ok(Reference::ImageId(image_id));
        }

        if let Ok(name) = NamedReference::from_str(text) {
            return Ok(Reference::Named(name));
        }

        Err("Expected tag, digest or image id".to_owned())
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Reference::Named(name) => write!(f, "{}", name),
            Reference::ImageId(id) => write!(f, "{}", id)
        }
    }
}

impl Reference {
    pub fn named(&self) -> Option<&NamedReference> {
        if let Reference::Named(name) = self {
            Some(name)
        } else {
            None
        }
    }

    pub fn image_id(&self) -> Option<&ImageId> {
        if let Reference::ImageId(id) = self {
            Some(id)
        } else {
            None
        }
    }
}

/// A human readable name pointing to an image, either `repository:tag` or `repository@digest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NamedReference {
    Tag(ImageTag),
    Digest(DigestReference)
}

impl NamedReference {
    pub fn full_repository(&self) -> String {
        match self {
            NamedReference::Tag(tag) => tag.full_repository(),
            NamedReference::Digest(digest) => digest.full_repository()
        }
    }

    pub fn image_tag(&self) -> Option<&ImageTag> {
        if let NamedReference::Tag(tag) = self {
            Some(tag)
        } else {
            None
        }
    }
}

impl FromStr for NamedReference {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text.contains('@') {
            return DigestReference::from_str(text).map(NamedReference::Digest);
        }

        ImageTag::from_str(text).map(NamedReference::Tag)
    }
}

impl Display for NamedReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NamedReference::Tag(tag) => write!(f, "{}", tag),
            NamedReference::Digest(digest) => write!(f, "{}", digest)
        }
    }
}

impl From<ImageTag> for NamedReference {
    fn from(tag: ImageTag) -> Self {
        NamedReference::Tag(tag)
    }
}

impl From<DigestReference> for NamedReference {
    fn from(digest: DigestReference) -> Self {
        NamedReference::Digest(digest)
    }
}

impl Serialize for NamedReference {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error> where S: Serializer {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NamedReference {
    fn deserialize<D>(deserializer: D) -> Result<NamedReference, D::Error> where D: Deserializer<'de> {
        let text = String::deserialize(deserializer)?;
        NamedReference::from_str(&text).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageTag {
    registry: Option<String>,
    repository: String,
    tag: String
}

impl ImageTag {
    pub fn new(repository: &str, tag: &str) -> ImageTag {
        ImageTag {
            registry: None,
            repository: repository.to_owned(),
            tag: tag.to_owned()
        }
    }

    pub fn with_registry(registry: &str, repository: &str, tag: &str) -> ImageTag {
        ImageTag {
            registry: Some(registry.to_owned()),
            repository: repository.to_owned(),
            tag: tag.to_owned()
        }
    }

    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn full_repository(&self) -> String {
        if let Some(registry) = self.registry.as_ref() {
            format!("{}/{}", registry, self.repository)
        } else {
            self.repository.clone()
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn to_ref(self) -> NamedReference {
        NamedReference::Tag(self)
    }
}

impl FromStr for ImageTag {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let regex = Regex::new("^((.+)/)?([A-Za-z0-9_\\-\\.]+)(:([A-Za-z0-9_\\-\\.]+))?$").map_err(|err| err.to_string())?;
        let capture = regex.captures(text).ok_or_else(|| "Expected image tag".to_owned())?;

        let registry = capture.get(2).map(|x| x.as_str().to_string());
        let repository = capture.get(3).map(|x| x.as_str().to_string()).ok_or_else(|| "Expected image tag".to_owned())?;
        let tag = capture.get(5).map(|x| x.as_str().to_string()).unwrap_or_else(|| "latest".to_owned());

        Ok(
            ImageTag {
                registry,
                repository,
                tag
            }
        )
    }
}

impl Display for ImageTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.registry {
            Some(registry) => write!(f, "{}/{}:{}", registry, self.repository, self.tag),
            None => write!(f, "{}:{}", self.repository, self.tag)
        }
    }
}

impl Serialize for ImageTag {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error> where S: Serializer {
        serializer.serialize_str(&self.to_string())
    }
}

struct ImageTagVisitor;

impl<'de> Visitor<'de> for ImageTagVisitor {
    type Value = ImageTag;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a string on the format registry/repository:tag")
    }

    fn visit_string<E>(self, v: String) -> Result<Self::Value, E> where E: Error {
        ImageTag::from_str(&v).map_err(|err| E::custom(err.to_string()))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> where E: Error {
        ImageTag::from_str(v).map_err(|err| E::custom(err.to_string()))
    }
}

impl<'de> Deserialize<'de> for ImageTag {
    fn deserialize<D>(deserializer: D) -> Result<ImageTag, D::Error> where D: Deserializer<'de> {
        deserializer.deserialize_string(ImageTagVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DigestReference {
    registry: Option<String>,
    repository: String,
    digest: Digest
}

impl DigestReference {
    pub fn new(repository: &str, digest: Digest) -> DigestReference {
        DigestReference {
            registry: None,
            repository: repository.to_owned(),
            digest
        }
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn full_repository(&self) -> String {
        if let Some(registry) = self.registry.as_ref() {
            format!("{}/{}", registry, self.repository)
        } else {
            self.repository.clone()
        }
    }
}

impl FromStr for DigestReference {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let regex = Regex::new("^((.+)/)?([A-Za-z0-9_\\-\\.]+)@(.+)$").map_err(|err| err.to_string())?;
        let capture = regex.captures(text).ok_or_else(|| "Expected repository@digest".to_owned())?;

        let registry = capture.get(2).map(|x| x.as_str().to_string());
        let repository = capture.get(3).map(|x| x.as_str().to_string()).ok_or_else(|| "Expected repository".to_owned())?;
        let digest = capture.get(4).map(|x| x.as_str()).ok_or_else(|| "Expected digest".to_owned())?;
        if !digest.starts_with("sha256:") {
            return Err(format!("Unsupported digest '{}'", digest));
        }

        Ok(
            DigestReference {
                registry,
                repository,
                digest: Digest::from_str(digest)?
            }
        )
    }
}

impl Display for DigestReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.full_repository(), self.digest)
    }
}

#[cfg(test)]
const TEST_HEX: &str = "679447d45a6c8ed2dce1d106fd2ffbc61b96c3633ec3ae4ee20034055d7e0216";

#[test]
fn test_reference1() {
    assert_eq!(
        Some(Reference::Named(ImageTag::new("strata", "test").to_ref())),
        Reference::from_str("strata:test").ok()
    );
}

#[test]
fn test_reference2() {
    assert_eq!(
        Some(Reference::ImageId(ImageId::from_str(TEST_HEX).unwrap())),
        Reference::from_str(&format!("sha256:{}", TEST_HEX)).ok()
    );
}

#[test]
fn test_reference3() {
    let reference = Reference::from_str(&format!("strata@sha256:{}", TEST_HEX)).unwrap();
    let digest = Digest::from_str(TEST_HEX).unwrap();
    assert_eq!(Reference::Named(NamedReference::Digest(DigestReference::new("strata", digest))), reference);
    assert_eq!(format!("strata@sha256:{}", TEST_HEX), reference.to_string());
}

#[test]
fn test_digest_reference_rejects_other_algorithms() {
    assert!(NamedReference::from_str(&format!("strata@md5:{}", TEST_HEX)).is_err());
}

#[test]
fn test_image_tag_access() {
    assert_eq!("strata", ImageTag::new("strata", "test").full_repository());
    assert_eq!("localhost:3000/strata", ImageTag::with_registry("localhost:3000", "strata", "test").full_repository());
}

#[test]
fn test_image_tag_to_string() {
    assert_eq!("strata:test", &ImageTag::new("strata", "test").to_string());
    assert_eq!("localhost:3000/strata:test", &ImageTag::with_registry("localhost:3000", "strata", "test").to_string());
}

#[test]
fn test_image_tag_parse1() {
    assert_eq!(Some(ImageTag::with_registry("localhost:3000", "strata", "test")), ImageTag::from_str("localhost:3000/strata:test").ok())
}

#[test]
fn test_image_tag_parse2() {
    assert_eq!(Some(ImageTag::new("strata", "latest")), ImageTag::from_str("strata").ok())
}

#[test]
fn test_named_reference_serialize() {
    let reference = ImageTag::with_registry("localhost:3000", "strata", "test").to_ref();
    let content = serde_json::to_string(&reference).unwrap();
    assert_eq!("\"localhost:3000/strata:test\"", &content);

    let deserialized: NamedReference = serde_json::from_str(&content).unwrap();
    assert_eq!(reference, deserialized);
}
