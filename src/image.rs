use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::{ChainId, DiffId, ImageId};
use crate::error::{ImageError, ImageResult};

pub const ROOTFS_TYPE_LAYERS: &str = "layers";

/// The ordered list of diffs an image filesystem is built from.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootFs {
    #[serde(rename="type")]
    pub fs_type: String,
    #[serde(default)]
    pub diff_ids: Vec<DiffId>
}

impl RootFs {
    pub fn new() -> RootFs {
        RootFs {
            fs_type: ROOTFS_TYPE_LAYERS.to_owned(),
            diff_ids: Vec::new()
        }
    }

    pub fn append(&mut self, diff_id: DiffId) {
        self.diff_ids.push(diff_id);
    }

    pub fn chain_id(&self) -> Option<ChainId> {
        ChainId::from_diff_ids(&self.diff_ids)
    }

    /// The chain ID of every prefix of the stack, from the bottom layer to the top.
    pub fn chain_ids(&self) -> Vec<ChainId> {
        let mut chain_ids: Vec<ChainId> = Vec::with_capacity(self.diff_ids.len());
        for diff_id in &self.diff_ids {
            let chain_id = ChainId::extend(chain_ids.last(), diff_id);
            chain_ids.push(chain_id);
        }

        chain_ids
    }
}

impl Default for RootFs {
    fn default() -> Self {
        RootFs::new()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerConfig {
    #[serde(default, skip_serializing_if="Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if="Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if="Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if="Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if="Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if="BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct History {
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if="Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if="String::is_empty")]
    pub created_by: String,
    #[serde(default, skip_serializing_if="Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if="std::ops::Not::not")]
    pub empty_layer: bool
}

/// Immutable image metadata. The image ID is the digest of its serialized form.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Image {
    #[serde(default, skip_serializing_if="Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if="Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if="Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if="Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if="Option::is_none")]
    pub container_config: Option<ContainerConfig>,
    #[serde(default, skip_serializing_if="Option::is_none")]
    pub config: Option<ContainerConfig>,
    pub os: String,
    pub architecture: String,
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if="Vec::is_empty")]
    pub history: Vec<History>
}

impl Image {
    /// An image without any layers, used as the parent when committing from scratch.
    pub fn empty() -> Image {
        Image {
            created: None,
            author: None,
            comment: None,
            container: None,
            container_config: None,
            config: None,
            os: std::env::consts::OS.to_owned(),
            architecture: std::env::consts::ARCH.to_owned(),
            rootfs: RootFs::new(),
            history: Vec::new()
        }
    }

    pub fn from_json(content: &[u8]) -> ImageResult<Image> {
        let image: Image = serde_json::from_slice(content)
            .map_err(|err| ImageError::InvalidImageConfig { message: err.to_string() })?;

        if image.rootfs.fs_type != ROOTFS_TYPE_LAYERS {
            return Err(ImageError::InvalidImageConfig { message: format!("unsupported rootfs type '{}'", image.rootfs.fs_type) });
        }

        Ok(image)
    }

    pub fn to_json(&self) -> ImageResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn compute_id(content: &[u8]) -> ImageId {
        ImageId::new(crate::digest::Digest::of_bytes(content))
    }

    /// Creates the image describing `parent` with the diff in `child` stacked on top.
    pub fn new_child(parent: &Image, child: ChildConfig, os: Option<&str>) -> Image {
        let empty_layer = child.diff_id.is_empty_layer();
        let mut rootfs = parent.rootfs.clone();
        rootfs.append(child.diff_id);

        let created_by = child.container_config
            .as_ref()
            .map(|config| config.cmd.join(" "))
            .unwrap_or_default();

        let created = Utc::now();
        let mut history = parent.history.clone();
        history.push(History {
            created,
            author: child.author.clone(),
            created_by,
            comment: child.comment.clone(),
            empty_layer
        });

        Image {
            created: Some(created),
            author: child.author,
            comment: child.comment,
            container: Some(child.container_id),
            container_config: child.container_config,
            config: child.config.or_else(|| parent.config.clone()),
            os: os.map(|os| os.to_owned()).unwrap_or_else(|| parent.os.clone()),
            architecture: parent.architecture.clone(),
            rootfs,
            history
        }
    }
}

/// What a commit adds on top of its parent image.
#[derive(Clone, Debug)]
pub struct ChildConfig {
    pub container_id: String,
    pub author: Option<String>,
    pub comment: Option<String>,
    pub container_config: Option<ContainerConfig>,
    pub config: Option<ContainerConfig>,
    pub diff_id: DiffId
}

#[cfg(test)]
fn test_child_config(diff_id: DiffId) -> ChildConfig {
    ChildConfig {
        container_id: "c1".to_owned(),
        author: Some("tester".to_owned()),
        comment: Some("commit".to_owned()),
        container_config: Some(ContainerConfig { cmd: vec!["touch".to_owned(), "/file".to_owned()], ..Default::default() }),
        config: None,
        diff_id
    }
}

#[test]
fn test_new_child_appends_diff() {
    use crate::digest::Digest;

    let diff1 = DiffId::new(Digest::of_bytes(b"d1"));
    let diff2 = DiffId::new(Digest::of_bytes(b"d2"));

    let mut parent = Image::empty();
    parent.rootfs.append(diff1.clone());
    parent.config = Some(ContainerConfig { cmd: vec!["sh".to_owned()], ..Default::default() });

    let child = Image::new_child(&parent, test_child_config(diff2.clone()), None);
    assert_eq!(vec![diff1.clone(), diff2.clone()], child.rootfs.diff_ids);
    assert_eq!(ChainId::from_diff_ids(&[diff1, diff2]), child.rootfs.chain_id());
    assert_eq!(parent.config, child.config);
    assert_eq!(Some("c1".to_owned()), child.container);
    assert_eq!(1, child.history.len());
    assert_eq!("touch /file", child.history[0].created_by);
    assert!(!child.history[0].empty_layer);
}

#[test]
fn test_new_child_empty_layer() {
    let child = Image::new_child(&Image::empty(), test_child_config(DiffId::empty_layer()), Some("linux"));
    assert_eq!(1, child.rootfs.diff_ids.len());
    assert!(child.history[0].empty_layer);
    assert_eq!("linux", child.os);
}

#[test]
fn test_chain_ids() {
    use crate::digest::Digest;

    let mut rootfs = RootFs::new();
    rootfs.append(DiffId::new(Digest::of_bytes(b"d1")));
    rootfs.append(DiffId::new(Digest::of_bytes(b"d2")));

    let chain_ids = rootfs.chain_ids();
    assert_eq!(2, chain_ids.len());
    assert_eq!(rootfs.diff_ids[0].digest(), chain_ids[0].digest());
    assert_eq!(rootfs.chain_id(), Some(chain_ids[1].clone()));
}

#[test]
fn test_serialization_roundtrip_keeps_id() {
    let image = Image::new_child(&Image::empty(), test_child_config(DiffId::empty_layer()), None);
    let content = image.to_json().unwrap();
    let parsed = Image::from_json(&content).unwrap();
    assert_eq!(image, parsed);
    assert_eq!(Image::compute_id(&content), Image::compute_id(&parsed.to_json().unwrap()));
}

#[test]
fn test_invalid_rootfs_type() {
    let content = br#"{"os":"linux","architecture":"amd64","rootfs":{"type":"snapshot","diff_ids":[]}}"#;
    assert!(Image::from_json(content).is_err());
}
