use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use itertools::Itertools;
use tar::{Builder, HeaderMode};

use crate::helpers::DeferredFileDelete;

/// Physical storage of layers. Read-only layers are stored diffs, writable layers are directories.
pub trait StorageDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Stores the uncompressed diff under `id` and returns the number of bytes stored.
    fn apply_diff(&self, id: &str, diff: &mut dyn Read) -> std::io::Result<u64>;

    fn open_diff(&self, id: &str) -> std::io::Result<Box<dyn Read + Send>>;

    fn create_rw(&self, id: &str, storage_opt: &HashMap<String, String>) -> std::io::Result<()>;

    fn get(&self, id: &str, mount_label: &str) -> std::io::Result<PathBuf>;

    fn put(&self, id: &str) -> std::io::Result<()>;

    /// Produces a tar archive of everything written to the writable layer `id`.
    fn diff_rw(&self, id: &str) -> std::io::Result<Box<dyn Read + Send>>;

    fn remove(&self, id: &str) -> std::io::Result<()>;

    fn status(&self) -> Vec<(String, String)>;
}

pub struct DirectoryDriver {
    layers_folder: PathBuf,
    mounts_folder: PathBuf
}

impl DirectoryDriver {
    pub fn new(layers_folder: PathBuf, mounts_folder: PathBuf) -> std::io::Result<DirectoryDriver> {
        std::fs::create_dir_all(&layers_folder)?;
        std::fs::create_dir_all(&mounts_folder)?;

        Ok(
            DirectoryDriver {
                layers_folder,
                mounts_folder
            }
        )
    }

    fn diff_file(&self, id: &str) -> PathBuf {
        self.layers_folder.join(id).join("layer.tar")
    }

    fn rw_folder(&self, id: &str) -> PathBuf {
        self.mounts_folder.join(id).join("diff")
    }
}

impl StorageDriver for DirectoryDriver {
    fn name(&self) -> &str {
        "directory"
    }

    fn apply_diff(&self, id: &str, diff: &mut dyn Read) -> std::io::Result<u64> {
        let layer_folder = self.layers_folder.join(id);
        std::fs::create_dir_all(&layer_folder)?;

        let tmp_path = layer_folder.join("layer.tar.tmp");
        let mut deferred_delete = DeferredFileDelete::new(tmp_path.clone());

        let mut file = File::create(&tmp_path)?;
        let size = std::io::copy(diff, &mut file)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, self.diff_file(id))?;
        deferred_delete.skip();

        Ok(size)
    }

    fn open_diff(&self, id: &str) -> std::io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.diff_file(id))?))
    }

    fn create_rw(&self, id: &str, storage_opt: &HashMap<String, String>) -> std::io::Result<()> {
        if let Some(key) = storage_opt.keys().next() {
            return Err(
                std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    format!("storage option '{}' is not supported by the directory driver", key)
                )
            );
        }

        std::fs::create_dir_all(self.rw_folder(id))
    }

    fn get(&self, id: &str, _mount_label: &str) -> std::io::Result<PathBuf> {
        let path = self.rw_folder(id);
        if !path.exists() {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, format!("no writable layer {}", id)));
        }

        Ok(path)
    }

    fn put(&self, id: &str) -> std::io::Result<()> {
        if !self.rw_folder(id).exists() {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, format!("no writable layer {}", id)));
        }

        Ok(())
    }

    fn diff_rw(&self, id: &str) -> std::io::Result<Box<dyn Read + Send>> {
        let root = self.get(id, "")?;

        let mut builder = Builder::new(tempfile::tempfile()?);
        builder.mode(HeaderMode::Deterministic);
        builder.follow_symlinks(false);
        append_sorted(&mut builder, &root, Path::new(""))?;

        let mut file = builder.into_inner()?;
        file.seek(SeekFrom::Start(0))?;
        Ok(Box::new(file))
    }

    fn remove(&self, id: &str) -> std::io::Result<()> {
        for path in [self.layers_folder.join(id), self.mounts_folder.join(id)] {
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err)
            }
        }

        Ok(())
    }

    fn status(&self) -> Vec<(String, String)> {
        vec![
            ("Layers Folder".to_owned(), self.layers_folder.display().to_string()),
            ("Mounts Folder".to_owned(), self.mounts_folder.display().to_string())
        ]
    }
}

/// Appends the content of `folder` in name order so the same tree always gives the same archive.
fn append_sorted<W: std::io::Write>(builder: &mut Builder<W>, root: &Path, relative: &Path) -> std::io::Result<()> {
    let folder = root.join(relative);
    let entries = std::fs::read_dir(&folder)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .sorted_by_key(|entry| entry.file_name());

    for entry in entries {
        let relative_path = relative.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            builder.append_dir(&relative_path, entry.path())?;
            append_sorted(builder, root, &relative_path)?;
        } else {
            builder.append_path_with_name(entry.path(), &relative_path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
fn test_driver(folder: &Path) -> DirectoryDriver {
    DirectoryDriver::new(folder.join("layers"), folder.join("mounts")).unwrap()
}

#[test]
fn test_apply_and_open_diff() {
    let folder = crate::test_helpers::TempFolder::new();
    let driver = test_driver(&folder);

    let content = crate::test_helpers::tar_with_files(&[("file1.txt", b"hello")]);
    let size = driver.apply_diff("cache1", &mut &content[..]).unwrap();
    assert_eq!(content.len() as u64, size);

    let mut stored = Vec::new();
    driver.open_diff("cache1").unwrap().read_to_end(&mut stored).unwrap();
    assert_eq!(content, stored);
    assert!(!folder.join("layers").join("cache1").join("layer.tar.tmp").exists());
}

#[test]
fn test_empty_rw_diff_is_empty_layer() {
    use crate::digest::{DiffId, Digest};

    let folder = crate::test_helpers::TempFolder::new();
    let driver = test_driver(&folder);
    driver.create_rw("mount1", &HashMap::new()).unwrap();

    let mut archive = Vec::new();
    driver.diff_rw("mount1").unwrap().read_to_end(&mut archive).unwrap();
    assert_eq!(DiffId::empty_layer(), DiffId::new(Digest::of_bytes(&archive)));
}

#[test]
fn test_rw_diff_is_deterministic() {
    let folder = crate::test_helpers::TempFolder::new();
    let driver = test_driver(&folder);
    driver.create_rw("mount1", &HashMap::new()).unwrap();

    let path = driver.get("mount1", "").unwrap();
    std::fs::create_dir_all(path.join("etc")).unwrap();
    std::fs::write(path.join("etc").join("b.conf"), b"b").unwrap();
    std::fs::write(path.join("etc").join("a.conf"), b"a").unwrap();

    let mut first = Vec::new();
    driver.diff_rw("mount1").unwrap().read_to_end(&mut first).unwrap();
    let mut second = Vec::new();
    driver.diff_rw("mount1").unwrap().read_to_end(&mut second).unwrap();
    assert_eq!(first, second);

    let mut archive = tar::Archive::new(&first[..]);
    let names = archive.entries().unwrap()
        .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().trim_end_matches('/').to_owned())
        .collect::<Vec<_>>();
    assert_eq!(vec!["etc", "etc/a.conf", "etc/b.conf"], names);
}

#[test]
fn test_remove_missing_is_ok() {
    let folder = crate::test_helpers::TempFolder::new();
    let driver = test_driver(&folder);
    assert!(driver.remove("does-not-exist").is_ok());
    assert_eq!(std::io::ErrorKind::NotFound, driver.get("does-not-exist", "").unwrap_err().kind());
}

#[test]
fn test_storage_options_unsupported() {
    let folder = crate::test_helpers::TempFolder::new();
    let driver = test_driver(&folder);

    let mut storage_opt = HashMap::new();
    storage_opt.insert("size".to_owned(), "10G".to_owned());
    assert_eq!(std::io::ErrorKind::Unsupported, driver.create_rw("mount1", &storage_opt).unwrap_err().kind());
}
