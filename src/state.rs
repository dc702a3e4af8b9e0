use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};

use crate::digest::{ChainId, DiffId, Digest, ImageId};
use crate::layer::{LayerRecord, MountRecord};
use crate::image_store::ImageRecord;
use crate::reference::NamedReference;

pub type SqlResult<T> = rusqlite::Result<T>;

/// Persisted state of every store. Each store keeps its own in-memory tables and writes through to here.
pub struct StateManager {
    connection: Mutex<Connection>
}

impl StateManager {
    pub fn new(base_folder: &Path) -> SqlResult<StateManager> {
        if !base_folder.exists() {
            std::fs::create_dir_all(base_folder).map_err(|_| rusqlite::Error::InvalidPath(base_folder.to_path_buf()))?;
        }

        let connection = Connection::open(base_folder.join("state.sqlite3"))?;
        StateManager::from_connection(connection)
    }

    pub fn in_memory() -> SqlResult<StateManager> {
        StateManager::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(connection: Connection) -> SqlResult<StateManager> {
        connection.execute(
            r#"
            CREATE TABLE IF NOT EXISTS layers(
                chain_id TEXT PRIMARY KEY,
                metadata JSONB
            );
            "#,
            ()
        )?;

        connection.execute(
            r#"
            CREATE TABLE IF NOT EXISTS mounts(
                name TEXT PRIMARY KEY,
                metadata JSONB
            );
            "#,
            ()
        )?;

        connection.execute(
            r#"
            CREATE TABLE IF NOT EXISTS images(
                id TEXT PRIMARY KEY,
                config BLOB,
                parent TEXT,
                built_locally INTEGER
            );
            "#,
            ()
        )?;

        connection.execute(
            r#"
            CREATE TABLE IF NOT EXISTS image_references(
                name TEXT PRIMARY KEY,
                image_id TEXT
            );
            "#,
            ()
        )?;

        connection.execute(
            r#"
            CREATE TABLE IF NOT EXISTS blob_diff_ids(
                digest TEXT PRIMARY KEY,
                diff_id TEXT
            );
            "#,
            ()
        )?;

        Ok(
            StateManager {
                connection: Mutex::new(connection)
            }
        )
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn all_layers(&self) -> SqlResult<Vec<LayerRecord>> {
        let connection = self.connection();
        let mut statement = connection.prepare("SELECT metadata FROM layers")?;

        let mut layers = Vec::new();
        for layer in statement.query_map([], |row| row.get::<_, LayerRecord>(0))? {
            layers.push(layer?);
        }

        Ok(layers)
    }

    pub fn upsert_layer(&self, layer: &LayerRecord) -> SqlResult<()> {
        let metadata = serde_json::to_value(layer).map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
        self.connection().execute(
            "INSERT OR REPLACE INTO layers (chain_id, metadata) VALUES (?1, ?2)",
            (layer.chain_id().as_str(), &metadata)
        )?;
        Ok(())
    }

    pub fn remove_layer(&self, chain_id: &ChainId) -> SqlResult<bool> {
        let removed = self.connection().execute("DELETE FROM layers WHERE chain_id=?1", (chain_id.as_str(), ))? > 0;
        Ok(removed)
    }

    pub fn all_mounts(&self) -> SqlResult<Vec<MountRecord>> {
        let connection = self.connection();
        let mut statement = connection.prepare("SELECT metadata FROM mounts")?;

        let mut mounts = Vec::new();
        for mount in statement.query_map([], |row| row.get::<_, MountRecord>(0))? {
            mounts.push(mount?);
        }

        Ok(mounts)
    }

    pub fn insert_mount(&self, mount: &MountRecord) -> SqlResult<()> {
        let metadata = serde_json::to_value(mount).map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
        self.connection().execute("INSERT INTO mounts (name, metadata) VALUES (?1, ?2)", (&mount.name, &metadata))?;
        Ok(())
    }

    pub fn remove_mount(&self, name: &str) -> SqlResult<bool> {
        let removed = self.connection().execute("DELETE FROM mounts WHERE name=?1", (name, ))? > 0;
        Ok(removed)
    }

    pub fn all_images(&self) -> SqlResult<Vec<ImageRecord>> {
        let connection = self.connection();
        let mut statement = connection.prepare("SELECT id, config, parent, built_locally FROM images")?;

        let mut images = Vec::new();
        for image in statement.query_map([], |row| ImageRecord::from_row(row))? {
            images.push(image?);
        }

        Ok(images)
    }

    pub fn insert_image(&self, id: &ImageId, config: &[u8]) -> SqlResult<()> {
        self.connection().execute(
            "INSERT OR IGNORE INTO images (id, config, parent, built_locally) VALUES (?1, ?2, NULL, 0)",
            (id.as_str(), config)
        )?;
        Ok(())
    }

    pub fn set_image_parent(&self, id: &ImageId, parent: Option<&ImageId>) -> SqlResult<()> {
        self.connection().execute("UPDATE images SET parent=?2 WHERE id=?1", (id.as_str(), parent.map(|parent| parent.as_str())))?;
        Ok(())
    }

    pub fn set_image_built_locally(&self, id: &ImageId) -> SqlResult<()> {
        self.connection().execute("UPDATE images SET built_locally=1 WHERE id=?1", (id.as_str(), ))?;
        Ok(())
    }

    pub fn remove_image(&self, id: &ImageId) -> SqlResult<bool> {
        let connection = self.connection();
        let removed = connection.execute("DELETE FROM images WHERE id=?1", (id.as_str(), ))? > 0;
        connection.execute("UPDATE images SET parent=NULL WHERE parent=?1", (id.as_str(), ))?;
        Ok(removed)
    }

    pub fn all_references(&self) -> SqlResult<Vec<(String, String)>> {
        let connection = self.connection();
        let mut statement = connection.prepare("SELECT name, image_id FROM image_references")?;

        let mut references = Vec::new();
        for reference in statement.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))? {
            references.push(reference?);
        }

        Ok(references)
    }

    pub fn set_reference(&self, name: &NamedReference, id: &ImageId) -> SqlResult<()> {
        self.connection().execute(
            "INSERT OR REPLACE INTO image_references (name, image_id) VALUES (?1, ?2)",
            (name.to_string(), id.as_str())
        )?;
        Ok(())
    }

    pub fn remove_reference(&self, name: &NamedReference) -> SqlResult<bool> {
        let removed = self.connection().execute("DELETE FROM image_references WHERE name=?1", (name.to_string(), ))? > 0;
        Ok(removed)
    }

    pub fn get_blob_diff_id(&self, digest: &Digest) -> SqlResult<Option<String>> {
        self.connection().query_row(
            "SELECT diff_id FROM blob_diff_ids WHERE digest=?1",
            [digest.as_str()],
            |row| row.get(0)
        ).optional()
    }

    pub fn set_blob_diff_id(&self, digest: &Digest, diff_id: &DiffId) -> SqlResult<()> {
        self.connection().execute(
            "INSERT OR REPLACE INTO blob_diff_ids (digest, diff_id) VALUES (?1, ?2)",
            (digest.as_str(), diff_id.as_str())
        )?;
        Ok(())
    }
}

#[test]
fn test_blob_diff_ids() {
    let state_manager = StateManager::in_memory().unwrap();
    let digest = Digest::of_bytes(b"blob");
    let diff_id = DiffId::new(Digest::of_bytes(b"diff"));

    assert_eq!(None, state_manager.get_blob_diff_id(&digest).unwrap());
    state_manager.set_blob_diff_id(&digest, &diff_id).unwrap();
    assert_eq!(Some(diff_id.to_string()), state_manager.get_blob_diff_id(&digest).unwrap());
}

#[test]
fn test_persisted_in_folder() {
    use std::str::FromStr;

    let folder = crate::test_helpers::TempFolder::new();
    let name = NamedReference::from_str("strata:test").unwrap();
    let image_id = ImageId::new(Digest::of_bytes(b"image"));

    {
        let state_manager = StateManager::new(&folder).unwrap();
        state_manager.set_reference(&name, &image_id).unwrap();
    }

    let state_manager = StateManager::new(&folder).unwrap();
    assert_eq!(vec![("strata:test".to_owned(), image_id.to_string())], state_manager.all_references().unwrap());
    assert!(state_manager.remove_reference(&name).unwrap());
    assert!(!state_manager.remove_reference(&name).unwrap());
}
