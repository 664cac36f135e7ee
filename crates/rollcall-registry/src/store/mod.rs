//! Durable record store.
//!
//! Each identity lives in its own `<id>.xml` file next to a `userlist.xml`
//! index that lists every id plus the next serial number. Every file is
//! replaced atomically through [`atomic::AtomicFile`], so a crash at any
//! point leaves either the old or the new version on disk.

pub mod atomic;
pub mod xml;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::record::{SerialNumber, UserFlags, UserId, UserRecord};
use crate::{RegistryError, Result};
use atomic::AtomicFile;
use xml::{Element, XmlWriter, parse_document};

const TAG_USERS: &str = "users";
const TAG_USER: &str = "user";
const TAG_NAME: &str = "name";
const ATTR_ID: &str = "id";
const ATTR_FLAGS: &str = "flags";
const ATTR_ICON_PATH: &str = "icon";
const ATTR_SERIAL_NO: &str = "serialNumber";
const ATTR_NEXT_SERIAL_NO: &str = "nextSerialNumber";

/// Mode of the users directory.
const USERS_DIR_MODE: u32 = 0o775;

/// Mode of a per-identity system directory holding the icon.
const USER_DIR_MODE: u32 = 0o771;

/// Contents of the index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredIndex {
    /// Listed ids in file order
    pub ids: Vec<UserId>,
    /// Stored serial counter, if the file carried one. It exceeds
    /// `SerialNumber::MAX` once every serial has been handed out.
    pub next_serial: Option<u64>,
}

/// Paths and file operations for the on-disk layout.
#[derive(Debug, Clone)]
pub struct RecordStore {
    users_dir: PathBuf,
}

impl RecordStore {
    /// Prepare the directory layout under `data_dir`.
    ///
    /// Creates `system/users/` and the primary identity's system directory.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let users_dir = data_dir.join(crate::USERS_DIR);

        if !users_dir.exists() {
            info!("Creating users directory: {}", users_dir.display());
        }
        fs::create_dir_all(&users_dir)?;
        set_mode(&users_dir, USERS_DIR_MODE);

        let store = Self { users_dir };
        fs::create_dir_all(store.user_system_dir(crate::PRIMARY_USER_ID))?;

        Ok(store)
    }

    /// Directory holding the index and the record files.
    pub fn users_dir(&self) -> &Path {
        &self.users_dir
    }

    /// Path of the index file.
    pub fn index_path(&self) -> PathBuf {
        self.users_dir.join(crate::USER_LIST_FILENAME)
    }

    /// Path of the record file for `id`.
    pub fn record_path(&self, id: UserId) -> PathBuf {
        self.users_dir.join(format!("{id}.xml"))
    }

    /// Per-identity system directory for `id`.
    pub fn user_system_dir(&self, id: UserId) -> PathBuf {
        self.users_dir.join(id.to_string())
    }

    /// Load the index.
    ///
    /// Returns `Ok(None)` when the file does not exist and
    /// [`RegistryError::Malformed`] when it cannot be parsed.
    pub fn load_index(&self) -> Result<Option<StoredIndex>> {
        let file = AtomicFile::new(self.index_path());
        match file.read_to_string()? {
            Some(content) => decode_index(&content).map(Some),
            None => Ok(None),
        }
    }

    /// Rewrite the index.
    pub fn save_index(&self, ids: &[UserId], next_serial: u64) -> Result<()> {
        let content = encode_index(ids, next_serial);
        AtomicFile::new(self.index_path()).write(content.as_bytes())?;
        debug!("Saved user index ({} users, next serial {})", ids.len(), next_serial);
        Ok(())
    }

    /// Load the record for `id`.
    ///
    /// Returns `Ok(None)` when the file does not exist or holds a different
    /// identity.
    pub fn load_record(&self, id: UserId) -> Result<Option<UserRecord>> {
        let path = self.record_path(id);
        let Some(content) = AtomicFile::new(&path).read_to_string()? else {
            return Ok(None);
        };

        let record = decode_record(&content)?;
        if record.id != id {
            error!(
                "User file {} holds id {}, expected {}",
                path.display(),
                record.id,
                id
            );
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Write the record file for `record.id`.
    pub fn save_record(&self, record: &UserRecord) -> Result<()> {
        let content = encode_record(record);
        AtomicFile::new(self.record_path(record.id)).write(content.as_bytes())?;
        debug!("Saved user {} (serial {})", record.id, record.serial_number);
        Ok(())
    }

    /// Remove the record file for `id`. A missing file is not an error.
    pub fn delete_record(&self, id: UserId) {
        if let Err(e) = AtomicFile::new(self.record_path(id)).delete() {
            warn!("Failed to delete record file for user {id}: {e}");
        }
    }

    /// Store icon bytes for `id` and return the absolute path written.
    pub fn write_icon(&self, id: UserId, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.user_system_dir(id);
        fs::create_dir_all(&dir)?;
        set_mode(&dir, USER_DIR_MODE);

        let path = dir.join(crate::USER_PHOTO_FILENAME);
        AtomicFile::new(&path).write(bytes)?;
        Ok(std::path::absolute(path)?)
    }

    /// Read icon bytes written by [`write_icon`](Self::write_icon).
    pub fn read_icon(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    /// Remove the per-identity system directory of `id`.
    ///
    /// Returns the number of entries that could not be removed.
    pub fn remove_user_tree(&self, id: UserId) -> usize {
        remove_tree(&self.user_system_dir(id))
    }
}

/// Recursively delete `path`, children before parents.
///
/// Best effort: missing entries are ignored, other failures are logged and
/// counted, and the walk continues. Returns the failure count.
pub fn remove_tree(path: &Path) -> usize {
    let mut failures = 0;

    for entry in WalkDir::new(path).contents_first(true) {
        let result = match entry {
            Ok(entry) => {
                let removed = if entry.file_type().is_dir() {
                    fs::remove_dir(entry.path())
                } else {
                    fs::remove_file(entry.path())
                };
                removed.map_err(|e| (entry.path().to_path_buf(), e))
            }
            Err(e) => {
                let entry_path = e.path().unwrap_or(path).to_path_buf();
                Err((entry_path, io::Error::from(e)))
            }
        };

        if let Err((entry_path, e)) = result {
            if e.kind() == io::ErrorKind::NotFound {
                continue;
            }
            warn!("Failed to remove {}: {e}", entry_path.display());
            failures += 1;
        }
    }

    if failures > 0 {
        warn!(
            "Left {failures} entries behind while removing {}",
            path.display()
        );
    }
    failures
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        warn!("Failed to set mode {mode:o} on {}: {e}", path.display());
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

fn malformed(message: impl Into<String>) -> RegistryError {
    RegistryError::Malformed(message.into())
}

fn parse_number<T: FromStr>(element: &Element, attr: &str) -> Result<Option<T>> {
    element
        .attr(attr)
        .map(|value| {
            value.trim().parse::<T>().map_err(|_| {
                malformed(format!("<{}> attribute {attr}={value:?} is not a number", element.name))
            })
        })
        .transpose()
}

/// Flags may be written as a signed 32-bit value; keep the bit pattern.
fn parse_flags(element: &Element) -> Result<Option<UserFlags>> {
    element
        .attr(ATTR_FLAGS)
        .map(|value| {
            let value = value.trim();
            value
                .parse::<u32>()
                .or_else(|_| value.parse::<i32>().map(|signed| signed as u32))
                .map(UserFlags::from_bits_retain)
                .map_err(|_| {
                    malformed(format!(
                        "<{}> attribute {ATTR_FLAGS}={value:?} is not a number",
                        element.name
                    ))
                })
        })
        .transpose()
}

/// Serialize the index file.
pub fn encode_index(ids: &[UserId], next_serial: u64) -> String {
    let mut writer = XmlWriter::new();
    writer
        .start_tag(TAG_USERS)
        .attribute(ATTR_NEXT_SERIAL_NO, &next_serial.to_string());
    for id in ids {
        writer
            .start_tag(TAG_USER)
            .attribute(ATTR_ID, &id.to_string())
            .end_tag();
    }
    writer.end_tag();
    writer.finish()
}

/// Parse the index file.
pub fn decode_index(content: &str) -> Result<StoredIndex> {
    let root = parse_document(content).map_err(|e| malformed(format!("user index: {e}")))?;
    if root.name != TAG_USERS {
        return Err(malformed(format!(
            "user index root is <{}>, expected <{TAG_USERS}>",
            root.name
        )));
    }

    let next_serial = parse_number::<u64>(&root, ATTR_NEXT_SERIAL_NO)?;
    let ids = root
        .children_named(TAG_USER)
        .map(|entry| {
            parse_number::<UserId>(entry, ATTR_ID)?
                .ok_or_else(|| malformed("user index entry without an id"))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(StoredIndex { ids, next_serial })
}

/// Serialize one record file.
pub fn encode_record(record: &UserRecord) -> String {
    let mut writer = XmlWriter::new();
    writer
        .start_tag(TAG_USER)
        .attribute(ATTR_ID, &record.id.to_string())
        .attribute(ATTR_SERIAL_NO, &record.serial_number.to_string())
        .attribute(ATTR_FLAGS, &record.flags.bits().to_string());
    if let Some(icon) = &record.icon_path {
        writer.attribute(ATTR_ICON_PATH, &icon.to_string_lossy());
    }
    writer.start_tag(TAG_NAME).text(&record.name).end_tag();
    writer.end_tag();
    writer.finish()
}

/// Parse one record file.
pub fn decode_record(content: &str) -> Result<UserRecord> {
    let root = parse_document(content).map_err(|e| malformed(format!("user record: {e}")))?;
    if root.name != TAG_USER {
        return Err(malformed(format!(
            "user record root is <{}>, expected <{TAG_USER}>",
            root.name
        )));
    }

    let id = parse_number::<UserId>(&root, ATTR_ID)?
        .ok_or_else(|| malformed("user record without an id"))?;
    let serial_number = parse_number::<SerialNumber>(&root, ATTR_SERIAL_NO)?.unwrap_or(id);
    let flags = parse_flags(&root)?.ok_or_else(|| malformed(format!("user record {id} without flags")))?;
    let icon_path = root.attr(ATTR_ICON_PATH).map(PathBuf::from);
    let name = root
        .child(TAG_NAME)
        .map(|name| name.text.clone())
        .unwrap_or_default();

    Ok(UserRecord {
        id,
        serial_number,
        name,
        flags,
        icon_path,
    })
}
