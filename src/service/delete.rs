use std::str::FromStr;

use itertools::Itertools;
use log::info;
use tokio_util::sync::CancellationToken;

use crate::digest::ImageId;
use crate::error::{ImageError, ImageResult};
use crate::events::{emit, EventAction};
use crate::reference::{NamedReference, Reference};
use crate::service::{log_release_metadata, ImageService};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageDeleteResponse {
    Untagged(NamedReference),
    Deleted(ImageId)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: Vec<ImageId>,
    pub space_reclaimed: u64
}

impl ImageService {
    /// Deletes an image or, when it is referred to by a name that is not its only one, just that name.
    ///
    /// Images with children or used by a container are refused unless `force` is given. A running container
    /// always blocks the deletion. Deleting by ID an image named in more than one repository also needs `force`.
    /// With `prune`, parents left without names and children are deleted as well.
    pub fn image_delete(&self, reference: &str, force: bool, prune: bool) -> ImageResult<Vec<ImageDeleteResponse>> {
        let id = self.resolve_image(reference)?;
        let mut responses = Vec::new();

        let named = match Reference::from_str(reference) {
            Ok(Reference::Named(name)) if self.reference_store.get(&name).ok().as_ref() == Some(&id) => Some(name),
            _ => None
        };

        match named {
            Some(name) => {
                if self.reference_store.references_to(&id).len() > 1 {
                    self.untag(&id, &name)?;
                    responses.push(ImageDeleteResponse::Untagged(name));
                    return Ok(responses);
                }
            }
            None => {
                let repositories = self.reference_store.references_to(&id)
                    .iter()
                    .map(|name| name.full_repository())
                    .unique()
                    .count();

                if repositories > 1 && !force {
                    return Err(ImageError::ImageInMultipleRepositories { id });
                }
            }
        }

        self.check_deletable(&id, force)?;

        let parent = self.image_store.get_parent(&id)?;
        self.delete_image(&id, &mut responses)?;

        let mut parent = if prune { parent } else { None };
        while let Some(parent_id) = parent.take() {
            if !self.is_dangling(&parent_id) || self.check_deletable(&parent_id, false).is_err() {
                break;
            }

            parent = self.image_store.get_parent(&parent_id)?;
            self.delete_image(&parent_id, &mut responses)?;
        }

        Ok(responses)
    }

    fn untag(&self, id: &ImageId, name: &NamedReference) -> ImageResult<()> {
        if self.reference_store.delete(name)? {
            emit(&self.events, EventAction::Untag, id.as_str(), &name.to_string());
        }

        Ok(())
    }

    fn check_deletable(&self, id: &ImageId, force: bool) -> ImageResult<()> {
        let using = self.containers.first(&|container| container.image_id.as_ref() == Some(id) && (!force || container.running));
        if let Some(container) = using {
            return Err(ImageError::ImageInUse { id: id.clone(), container: container.id });
        }

        if !force && self.image_store.has_children(id) {
            return Err(ImageError::ImageHasChildren { id: id.clone() });
        }

        Ok(())
    }

    fn is_dangling(&self, id: &ImageId) -> bool {
        self.reference_store.references_to(id).is_empty() && !self.image_store.has_children(id)
    }

    fn delete_image(&self, id: &ImageId, responses: &mut Vec<ImageDeleteResponse>) -> ImageResult<u64> {
        for name in self.reference_store.references_to(id) {
            self.untag(id, &name)?;
            responses.push(ImageDeleteResponse::Untagged(name));
        }

        let removed = self.image_store.delete(id)?;
        log_release_metadata(&removed);

        emit(&self.events, EventAction::Delete, id.as_str(), "");
        responses.push(ImageDeleteResponse::Deleted(id.clone()));
        info!("Deleted image {}", id);

        Ok(removed.iter().map(|layer| layer.diff_size).sum())
    }

    /// Deletes every image without names, children or containers, until none is left.
    pub fn prune_images(&self, cancel: &CancellationToken) -> ImageResult<PruneReport> {
        let mut report = PruneReport::default();

        loop {
            let mut candidates = self.image_store.map()
                .into_keys()
                .filter(|id| self.is_dangling(id))
                .filter(|id| self.containers.first(&|container| container.image_id.as_ref() == Some(id)).is_none())
                .collect::<Vec<_>>();
            candidates.sort();

            if candidates.is_empty() {
                return Ok(report);
            }

            for id in candidates {
                if cancel.is_cancelled() {
                    return Err(ImageError::Cancelled);
                }

                let mut responses = Vec::new();
                report.space_reclaimed += self.delete_image(&id, &mut responses)?;
                report.deleted.push(id);
            }
        }
    }
}
