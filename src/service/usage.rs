use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::digest::ChainId;
use crate::error::{ImageError, Partial};
use crate::service::ImageService;

impl ImageService {
    /// Bytes used by layers reachable from images that are kept.
    ///
    /// Cancellation is checked once per layer; the size summed so far is returned with the error.
    pub fn image_disk_usage(&self, cancel: &CancellationToken) -> Result<u64, Partial<u64>> {
        self.scan_disk_usage(cancel, |_| {})
    }

    /// Runs the disk usage scan, passing the size summed so far to `progress` before each layer.
    pub(crate) fn scan_disk_usage(&self, cancel: &CancellationToken, mut progress: impl FnMut(u64)) -> Result<u64, Partial<u64>> {
        let layer_refs = self.layer_refs();

        let mut total_size = 0;
        for (chain_id, layer) in self.layer_store.map() {
            progress(total_size);
            if cancel.is_cancelled() {
                return Err(Partial::new(total_size, ImageError::Cancelled));
            }

            if layer_refs.get(&chain_id).copied().unwrap_or(0) > 0 {
                total_size += layer.diff_size();
            }
        }

        Ok(total_size)
    }

    /// Counts, per chain ID, the images whose root filesystem contains it.
    ///
    /// Untagged images with children are intermediate build steps and are counted through their children.
    pub(crate) fn layer_refs(&self) -> HashMap<ChainId, usize> {
        let mut layer_refs = HashMap::new();
        for (id, image) in self.image_store.map() {
            if self.reference_store.references_to(&id).is_empty() && self.image_store.has_children(&id) {
                continue;
            }

            for chain_id in image.rootfs.chain_ids() {
                *layer_refs.entry(chain_id).or_insert(0) += 1;
            }
        }

        layer_refs
    }
}
