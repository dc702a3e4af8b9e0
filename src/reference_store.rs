use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, warn};

use crate::digest::ImageId;
use crate::error::{ImageError, ImageResult};
use crate::reference::{DigestReference, ImageTag, NamedReference};
use crate::state::StateManager;

/// Human readable names for images. Names are the roots that keep images alive.
pub struct ReferenceStore {
    state_manager: Arc<StateManager>,
    references: Mutex<BTreeMap<NamedReference, ImageId>>
}

impl ReferenceStore {
    pub fn new(state_manager: Arc<StateManager>) -> ImageResult<ReferenceStore> {
        let mut references = BTreeMap::new();
        for (name, id) in state_manager.all_references()? {
            match (NamedReference::from_str(&name), ImageId::from_str(&id)) {
                (Ok(name), Ok(id)) => {
                    references.insert(name, id);
                }
                _ => {
                    warn!("Skipping invalid reference {} -> {}", name, id);
                }
            }
        }

        Ok(
            ReferenceStore {
                state_manager,
                references: Mutex::new(references)
            }
        )
    }

    fn references(&self) -> MutexGuard<'_, BTreeMap<NamedReference, ImageId>> {
        self.references.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn add_tag(&self, tag: &ImageTag, id: &ImageId, force: bool) -> ImageResult<()> {
        self.add(NamedReference::Tag(tag.clone()), id, force)
    }

    pub fn add_digest(&self, reference: &DigestReference, id: &ImageId, force: bool) -> ImageResult<()> {
        self.add(NamedReference::Digest(reference.clone()), id, force)
    }

    fn add(&self, name: NamedReference, id: &ImageId, force: bool) -> ImageResult<()> {
        let mut references = self.references();
        if let Some(existing) = references.get(&name) {
            if existing == id {
                return Ok(());
            }

            if !force {
                return Err(ImageError::ReferenceConflict { name: name.to_string(), existing: existing.clone() });
            }
        }

        self.state_manager.set_reference(&name, id)?;
        info!("Tagged {} as {}", id.short(), name);
        references.insert(name, id.clone());
        Ok(())
    }

    /// Removes the name. Returns false when it did not exist.
    pub fn delete(&self, name: &NamedReference) -> ImageResult<bool> {
        let mut references = self.references();
        if !references.contains_key(name) {
            return Ok(false);
        }

        self.state_manager.remove_reference(name)?;
        references.remove(name);
        Ok(true)
    }

    pub fn get(&self, name: &NamedReference) -> ImageResult<ImageId> {
        self.references()
            .get(name)
            .cloned()
            .ok_or_else(|| ImageError::ReferenceNotFound { name: name.to_string() })
    }

    /// Every name pointing to `id`, in name order.
    pub fn references_to(&self, id: &ImageId) -> Vec<NamedReference> {
        self.references()
            .iter()
            .filter(|(_, image_id)| *image_id == id)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn references_by_name(&self, repository: &str) -> Vec<(NamedReference, ImageId)> {
        self.references()
            .iter()
            .filter(|(name, _)| name.full_repository() == repository)
            .map(|(name, id)| (name.clone(), id.clone()))
            .collect()
    }

    pub fn all(&self) -> Vec<(NamedReference, ImageId)> {
        self.references()
            .iter()
            .map(|(name, id)| (name.clone(), id.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.references().len()
    }

    pub fn is_empty(&self) -> bool {
        self.references().is_empty()
    }
}

#[cfg(test)]
fn test_image_id(content: &[u8]) -> ImageId {
    ImageId::new(crate::digest::Digest::of_bytes(content))
}

#[test]
fn test_add_and_get() {
    let store = ReferenceStore::new(Arc::new(StateManager::in_memory().unwrap())).unwrap();
    let tag = ImageTag::from_str("strata:1.0").unwrap();
    let id = test_image_id(b"image");

    store.add_tag(&tag, &id, false).unwrap();
    assert_eq!(id, store.get(&tag.clone().to_ref()).unwrap());
    assert_eq!(vec![tag.to_ref()], store.references_to(&id));
    assert!(store.get(&ImageTag::from_str("strata:2.0").unwrap().to_ref()).unwrap_err().is_not_found());
}

#[test]
fn test_add_conflict() {
    let store = ReferenceStore::new(Arc::new(StateManager::in_memory().unwrap())).unwrap();
    let tag = ImageTag::from_str("strata:latest").unwrap();
    let id1 = test_image_id(b"image1");
    let id2 = test_image_id(b"image2");

    store.add_tag(&tag, &id1, false).unwrap();
    store.add_tag(&tag, &id1, false).unwrap();
    assert!(store.add_tag(&tag, &id2, false).unwrap_err().is_conflict());

    store.add_tag(&tag, &id2, true).unwrap();
    assert_eq!(id2, store.get(&tag.to_ref()).unwrap());
    assert!(store.references_to(&id1).is_empty());
}

#[test]
fn test_add_digest_and_by_name() {
    let store = ReferenceStore::new(Arc::new(StateManager::in_memory().unwrap())).unwrap();
    let id = test_image_id(b"image");
    let digest_reference = DigestReference::new("strata", crate::digest::Digest::of_bytes(b"manifest"));

    store.add_digest(&digest_reference, &id, false).unwrap();
    store.add_tag(&ImageTag::from_str("strata:latest").unwrap(), &id, false).unwrap();
    store.add_tag(&ImageTag::from_str("other:latest").unwrap(), &id, false).unwrap();

    assert_eq!(2, store.references_by_name("strata").len());
    assert_eq!(3, store.references_to(&id).len());
}

#[test]
fn test_delete_and_reload() {
    let state_manager = Arc::new(StateManager::in_memory().unwrap());
    let tag1 = ImageTag::from_str("strata:1").unwrap().to_ref();
    let tag2 = ImageTag::from_str("strata:2").unwrap().to_ref();
    let id = test_image_id(b"image");

    {
        let store = ReferenceStore::new(state_manager.clone()).unwrap();
        store.add(tag1.clone(), &id, false).unwrap();
        store.add(tag2.clone(), &id, false).unwrap();
        assert!(store.delete(&tag1).unwrap());
        assert!(!store.delete(&tag1).unwrap());
    }

    let store = ReferenceStore::new(state_manager).unwrap();
    assert_eq!(vec![(tag2, id)], store.all());
}
