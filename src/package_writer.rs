use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use typed_path::Utf8UnixComponent;

use crate::UEPath;
use crate::save_context::ESaveRealm;

/// Sink for the results of a package save. Writes are staged per package and only become visible on a
/// successful commit.
pub trait IPackageWriter {
    fn begin_package(&mut self, package_name: &str) -> Result<()>;
    fn write_package_data(&mut self, package_name: &str, realm: ESaveRealm, data: &[u8]) -> Result<()>;
    fn write_attachment(&mut self, package_name: &str, key: &str, data: &[u8]) -> Result<()>;
    /// Publishes the staged package, or drops it and any previous record when the save failed
    fn commit_package(&mut self, package_name: &str, succeeded: bool) -> Result<()>;
}

/// Read side of a previous cook session
pub trait IOplogReader {
    fn packages(&self) -> Vec<String>;
    fn read_package_data(&self, package_name: &str, realm: ESaveRealm) -> Result<Option<Vec<u8>>>;
    fn read_attachment(&self, package_name: &str, key: &str) -> Result<Option<Vec<u8>>>;
    fn attachment_keys(&self, package_name: &str) -> Vec<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FPackageRecord {
    pub package_data: BTreeMap<ESaveRealm, Vec<u8>>,
    pub attachments: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct FStagedPackages {
    staged: HashMap<String, FPackageRecord>,
}
impl FStagedPackages {
    fn begin(&mut self, package_name: &str) -> Result<()> {
        if self.staged.contains_key(package_name) {
            bail!("package {package_name} is already being written");
        }
        self.staged.insert(package_name.to_string(), FPackageRecord::default());
        Ok(())
    }
    fn get(&mut self, package_name: &str) -> Result<&mut FPackageRecord> {
        self.staged.get_mut(package_name).with_context(|| format!("package {package_name} was not begun"))
    }
    fn take(&mut self, package_name: &str) -> Result<FPackageRecord> {
        self.staged.remove(package_name).with_context(|| format!("package {package_name} was not begun"))
    }
}

/// Package store kept in memory, used by tests and by callers that persist records themselves
#[derive(Debug, Default)]
pub struct FMemoryPackageStore {
    staging: FStagedPackages,
    committed: BTreeMap<String, FPackageRecord>,
}
impl FMemoryPackageStore {
    pub fn record(&self, package_name: &str) -> Option<&FPackageRecord> {
        self.committed.get(package_name)
    }
}
impl IPackageWriter for FMemoryPackageStore {
    fn begin_package(&mut self, package_name: &str) -> Result<()> {
        self.staging.begin(package_name)
    }
    fn write_package_data(&mut self, package_name: &str, realm: ESaveRealm, data: &[u8]) -> Result<()> {
        self.staging.get(package_name)?.package_data.insert(realm, data.to_vec());
        Ok(())
    }
    fn write_attachment(&mut self, package_name: &str, key: &str, data: &[u8]) -> Result<()> {
        self.staging.get(package_name)?.attachments.insert(key.to_string(), data.to_vec());
        Ok(())
    }
    fn commit_package(&mut self, package_name: &str, succeeded: bool) -> Result<()> {
        let record = self.staging.take(package_name)?;
        if succeeded {
            self.committed.insert(package_name.to_string(), record);
        } else {
            self.committed.remove(package_name);
        }
        Ok(())
    }
}
impl IOplogReader for FMemoryPackageStore {
    fn packages(&self) -> Vec<String> {
        self.committed.keys().cloned().collect()
    }
    fn read_package_data(&self, package_name: &str, realm: ESaveRealm) -> Result<Option<Vec<u8>>> {
        Ok(self.committed.get(package_name).and_then(|r| r.package_data.get(&realm)).cloned())
    }
    fn read_attachment(&self, package_name: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.committed.get(package_name).and_then(|r| r.attachments.get(key)).cloned())
    }
    fn attachment_keys(&self, package_name: &str) -> Vec<String> {
        self.committed.get(package_name).map(|r| r.attachments.keys().cloned().collect()).unwrap_or_default()
    }
}

const OPLOG_INDEX_FILE: &str = "oplog.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct FOplogEntry {
    realms: Vec<ESaveRealm>,
    attachments: Vec<String>,
}

/// Oplog on disk: one directory per package holding a file per realm and per attachment, plus a JSON index
///
/// ```text
/// <root>/oplog.json
/// <root>/Game/Maps/Entry/Game.package
/// <root>/Game/Maps/Entry/meta.cook.artifacts
/// ```
pub struct FFileOplog {
    root: PathBuf,
    index: BTreeMap<String, FOplogEntry>,
    staging: FStagedPackages,
}

impl FFileOplog {
    /// Opens an oplog directory, creating it if needed
    #[instrument(skip_all)]
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let index_path = root.join(OPLOG_INDEX_FILE);
        let index = if index_path.exists() {
            serde_json::from_slice(&fs::read(&index_path)?).with_context(|| format!("failed to parse {}", index_path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            root,
            index,
            staging: FStagedPackages::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn package_dir(&self, package_name: &str) -> Result<PathBuf> {
        let path = UEPath::new(package_name);
        if !path.is_absolute() {
            bail!("package name {package_name:?} is not a long package name");
        }
        let mut dir = self.root.clone();
        for component in path.components() {
            match component {
                Utf8UnixComponent::RootDir => {}
                Utf8UnixComponent::Normal(name) => dir.push(name),
                _ => bail!("package name {package_name:?} is not a plain path"),
            }
        }
        Ok(dir)
    }

    fn write_index(&self) -> Result<()> {
        fs::write(self.root.join(OPLOG_INDEX_FILE), serde_json::to_vec_pretty(&self.index)?)?;
        Ok(())
    }

    fn read_file(&self, package_name: &str, file_name: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.package_dir(package_name)?.join(file_name))?)
    }
}

fn realm_file_name(realm: ESaveRealm) -> String {
    format!("{}.package", <&str>::from(realm))
}

impl IPackageWriter for FFileOplog {
    fn begin_package(&mut self, package_name: &str) -> Result<()> {
        self.package_dir(package_name)?;
        self.staging.begin(package_name)
    }
    fn write_package_data(&mut self, package_name: &str, realm: ESaveRealm, data: &[u8]) -> Result<()> {
        self.staging.get(package_name)?.package_data.insert(realm, data.to_vec());
        Ok(())
    }
    fn write_attachment(&mut self, package_name: &str, key: &str, data: &[u8]) -> Result<()> {
        if key.contains(['/', '\\']) || key.starts_with('.') {
            bail!("invalid attachment key {key:?}");
        }
        self.staging.get(package_name)?.attachments.insert(key.to_string(), data.to_vec());
        Ok(())
    }
    #[instrument(skip_all, fields(package = package_name))]
    fn commit_package(&mut self, package_name: &str, succeeded: bool) -> Result<()> {
        let record = self.staging.take(package_name)?;
        let dir = self.package_dir(package_name)?;
        if dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_file() {
                    fs::remove_file(path)?;
                }
            }
        }
        if !succeeded {
            self.index.remove(package_name);
            return self.write_index();
        }

        fs::create_dir_all(&dir)?;
        let mut entry = FOplogEntry::default();
        for (realm, data) in &record.package_data {
            fs::write(dir.join(realm_file_name(*realm)), data)?;
            entry.realms.push(*realm);
        }
        for (key, data) in &record.attachments {
            fs::write(dir.join(key), data)?;
            entry.attachments.push(key.clone());
        }
        self.index.insert(package_name.to_string(), entry);
        self.write_index()
    }
}

impl IOplogReader for FFileOplog {
    fn packages(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }
    fn read_package_data(&self, package_name: &str, realm: ESaveRealm) -> Result<Option<Vec<u8>>> {
        match self.index.get(package_name) {
            Some(entry) if entry.realms.contains(&realm) => Ok(Some(self.read_file(package_name, &realm_file_name(realm))?)),
            _ => Ok(None),
        }
    }
    fn read_attachment(&self, package_name: &str, key: &str) -> Result<Option<Vec<u8>>> {
        match self.index.get(package_name) {
            Some(entry) if entry.attachments.iter().any(|a| a == key) => Ok(Some(self.read_file(package_name, key)?)),
            _ => Ok(None),
        }
    }
    fn attachment_keys(&self, package_name: &str) -> Vec<String> {
        self.index.get(package_name).map(|e| e.attachments.clone()).unwrap_or_default()
    }
}
