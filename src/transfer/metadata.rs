use std::str::FromStr;
use std::sync::Arc;

use log::warn;

use crate::digest::{DiffId, Digest};
use crate::error::ImageResult;
use crate::state::StateManager;

/// Remembers which uncompressed diff a downloaded blob turned into.
pub struct BlobMetadataService {
    state_manager: Arc<StateManager>
}

impl BlobMetadataService {
    pub fn new(state_manager: Arc<StateManager>) -> BlobMetadataService {
        BlobMetadataService {
            state_manager
        }
    }

    pub fn get_diff_id(&self, digest: &Digest) -> ImageResult<Option<DiffId>> {
        let diff_id = self.state_manager.get_blob_diff_id(digest)?;

        Ok(
            diff_id.and_then(|diff_id| {
                match DiffId::from_str(&diff_id) {
                    Ok(diff_id) => Some(diff_id),
                    Err(err) => {
                        warn!("Ignoring invalid diff ID stored for {}: {}", digest, err);
                        None
                    }
                }
            })
        )
    }

    pub fn set_diff_id(&self, digest: &Digest, diff_id: &DiffId) -> ImageResult<()> {
        self.state_manager.set_blob_diff_id(digest, diff_id)?;
        Ok(())
    }
}

#[test]
fn test_diff_id_mapping() {
    let service = BlobMetadataService::new(Arc::new(StateManager::in_memory().unwrap()));
    let digest = Digest::of_bytes(b"compressed");
    let diff_id = DiffId::new(Digest::of_bytes(b"uncompressed"));

    assert_eq!(None, service.get_diff_id(&digest).unwrap());
    service.set_diff_id(&digest, &diff_id).unwrap();
    assert_eq!(Some(diff_id), service.get_diff_id(&digest).unwrap());
}
