use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Result, bail};
use fs_err as fs;

use crate::cook_dependency::{FAssetRegistryQuery, FConfigAccessData, FCookDependency, FCookDependencyContext};
use crate::target_platform::{FTargetPlatform, ITargetPlatform};
use crate::{Config, FIoHash, UEPath};

/// Package database of the project
pub trait IAssetRegistry: Send + Sync {
    fn does_package_exist_on_disk(&self, package_name: &str) -> bool;
    /// Hard and soft package dependencies recorded for the package
    fn get_dependencies(&self, package_name: &str) -> Vec<String>;
    /// Content digest of the package as last saved
    fn get_package_digest(&self, package_name: &str) -> Option<FIoHash>;
    /// Package names matching the query
    fn query(&self, query: &FAssetRegistryQuery) -> Vec<String>;
    /// Appends the redirect state of each package: its redirect target or a marker when it is not redirected
    fn append_redirect_hashes(&self, package_names: &[&str], hasher: &mut blake3::Hasher);
    /// Hash over every redirect known to the process
    fn global_redirect_hash(&self) -> FIoHash;
}

/// Tracked config values read during the session
pub trait IConfigAccessTracker: Send + Sync {
    fn get_value(&self, access: &FConfigAccessData) -> Option<String>;
    /// Config values a settings object was loaded from
    fn keys_for_settings_object(&self, object_path: &str) -> Option<Vec<FConfigAccessData>>;
}

pub trait IConsoleVariables: Send + Sync {
    fn get_value(&self, name: &str) -> Option<String>;
}

/// Schema digests of compiled-in classes
pub trait INativeClassDigestProvider: Send + Sync {
    /// Appends the digest of each class in order. Fails when any class is unknown.
    fn append_class_digests(&self, class_paths: &[&str], hasher: &mut blake3::Hasher) -> Result<()>;
}

pub trait IFileHasher: Send + Sync {
    fn hash_file(&self, path: &str) -> Result<[u8; 32]>;
}

/// Knows about packages generated by other packages during the cook
pub trait IGenerationHelper: Send + Sync {
    fn is_generated_package(&self, package_name: &str) -> bool;
    fn get_package_digest(&self, package_name: &str) -> Option<FIoHash>;
}

pub type FCookDependencyFunction = fn(&[u8], &mut FCookDependencyContext<'_>);

/// Functions that can be named by Function dependencies, keyed case-insensitively
#[derive(Default)]
pub struct FCookDependencyFunctions {
    functions: HashMap<String, FCookDependencyFunction>,
}
impl FCookDependencyFunctions {
    pub fn register(&mut self, name: &str, function: FCookDependencyFunction) {
        self.functions.insert(name.to_ascii_lowercase(), function);
    }
    pub fn find(&self, name: &str) -> Option<FCookDependencyFunction> {
        self.functions.get(&name.to_ascii_lowercase()).copied()
    }
}

/// Process-wide memo of the config dependencies of settings objects. Additive only.
#[derive(Default)]
pub struct FCookDependencyGroups {
    groups: RwLock<HashMap<String, Vec<FCookDependency>>>,
}
impl FCookDependencyGroups {
    /// Cached dependencies of the settings object, built on first use
    pub fn find_or_build(&self, object_path: &str, build: impl FnOnce() -> Option<Vec<FCookDependency>>) -> Option<Vec<FCookDependency>> {
        let key = object_path.to_ascii_lowercase();
        if let Ok(groups) = self.groups.read() {
            if let Some(group) = groups.get(&key) {
                return Some(group.clone());
            }
        }
        let mut group = build()?;
        group.sort();
        group.dedup();
        if let Ok(mut groups) = self.groups.write() {
            groups.entry(key).or_insert_with(|| group.clone());
        }
        Some(group)
    }
    pub fn len(&self) -> usize {
        self.groups.read().map(|g| g.len()).unwrap_or_default()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a save consumes from the outside. Passed explicitly into the save instead of ambient globals.
#[derive(Clone, Copy)]
pub struct FCookServices<'a> {
    pub config: &'a Config,
    pub asset_registry: Option<&'a dyn IAssetRegistry>,
    pub target_platform: Option<&'a dyn ITargetPlatform>,
    pub config_tracker: &'a dyn IConfigAccessTracker,
    pub console_variables: &'a dyn IConsoleVariables,
    pub native_classes: &'a dyn INativeClassDigestProvider,
    pub file_hasher: &'a dyn IFileHasher,
    pub generation_helper: Option<&'a dyn IGenerationHelper>,
    pub functions: &'a FCookDependencyFunctions,
    pub groups: &'a FCookDependencyGroups,
}
impl FCookServices<'_> {
    pub fn is_cooking(&self) -> bool {
        self.target_platform.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FMemoryPackage {
    pub digest: FIoHash,
    pub dependencies: Vec<String>,
    pub asset_classes: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FMemoryAssetRegistry {
    packages: HashMap<String, (String, FMemoryPackage)>,
    redirects: HashMap<String, String>,
}
impl FMemoryAssetRegistry {
    pub fn add_package(&mut self, package_name: &str, package: FMemoryPackage) {
        self.packages.insert(package_name.to_ascii_lowercase(), (package_name.to_string(), package));
    }
    pub fn set_package_digest(&mut self, package_name: &str, digest: FIoHash) {
        if let Some((_, package)) = self.packages.get_mut(&package_name.to_ascii_lowercase()) {
            package.digest = digest;
        }
    }
    pub fn remove_package(&mut self, package_name: &str) {
        self.packages.remove(&package_name.to_ascii_lowercase());
    }
    pub fn add_redirect(&mut self, from: &str, to: &str) {
        self.redirects.insert(from.to_ascii_lowercase(), to.to_string());
    }
}
impl IAssetRegistry for FMemoryAssetRegistry {
    fn does_package_exist_on_disk(&self, package_name: &str) -> bool {
        self.packages.contains_key(&package_name.to_ascii_lowercase())
    }
    fn get_dependencies(&self, package_name: &str) -> Vec<String> {
        self.packages.get(&package_name.to_ascii_lowercase()).map(|(_, p)| p.dependencies.clone()).unwrap_or_default()
    }
    fn get_package_digest(&self, package_name: &str) -> Option<FIoHash> {
        self.packages.get(&package_name.to_ascii_lowercase()).map(|(_, p)| p.digest)
    }
    fn query(&self, query: &FAssetRegistryQuery) -> Vec<String> {
        let in_path = |name: &str| {
            let name = UEPath::new(name);
            query.package_paths.is_empty()
                || query.package_paths.iter().any(|path| {
                    let path = UEPath::new(path);
                    if query.recursive_paths {
                        name.starts_with(path) && name != path
                    } else {
                        name.parent() == Some(path)
                    }
                })
        };
        let of_class = |package: &FMemoryPackage| {
            query.class_paths.is_empty() || package.asset_classes.iter().any(|c| query.class_paths.iter().any(|q| q.eq_ignore_ascii_case(c)))
        };
        self.packages
            .values()
            .filter(|(name, package)| in_path(name) && of_class(package))
            .map(|(name, _)| name.clone())
            .collect()
    }
    fn append_redirect_hashes(&self, package_names: &[&str], hasher: &mut blake3::Hasher) {
        for name in package_names {
            match self.redirects.get(&name.to_ascii_lowercase()) {
                Some(target) => {
                    hasher.update(&[1]);
                    hasher.update(target.to_ascii_lowercase().as_bytes());
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }
    }
    fn global_redirect_hash(&self) -> FIoHash {
        let mut redirects: Vec<_> = self.redirects.iter().collect();
        redirects.sort();
        let mut hasher = blake3::Hasher::new();
        for (from, to) in redirects {
            hasher.update(from.as_bytes());
            hasher.update(&[0]);
            hasher.update(to.to_ascii_lowercase().as_bytes());
            hasher.update(&[0]);
        }
        FIoHash::from_blake3(hasher.finalize().as_bytes())
    }
}

#[derive(Debug, Default)]
pub struct FMemoryConfigTracker {
    values: HashMap<String, String>,
    settings_objects: HashMap<String, Vec<FConfigAccessData>>,
}
impl FMemoryConfigTracker {
    pub fn set_value(&mut self, access: FConfigAccessData, value: &str) {
        self.values.insert(access.lookup_key(), value.to_string());
    }
    pub fn add_settings_object(&mut self, object_path: &str, keys: Vec<FConfigAccessData>) {
        self.settings_objects.insert(object_path.to_ascii_lowercase(), keys);
    }
}
impl IConfigAccessTracker for FMemoryConfigTracker {
    fn get_value(&self, access: &FConfigAccessData) -> Option<String> {
        self.values.get(&access.lookup_key()).cloned()
    }
    fn keys_for_settings_object(&self, object_path: &str) -> Option<Vec<FConfigAccessData>> {
        self.settings_objects.get(&object_path.to_ascii_lowercase()).cloned()
    }
}

#[derive(Debug, Default)]
pub struct FMemoryConsoleVariables {
    values: HashMap<String, String>,
}
impl FMemoryConsoleVariables {
    pub fn set_value(&mut self, name: &str, value: &str) {
        self.values.insert(name.to_ascii_lowercase(), value.to_string());
    }
}
impl IConsoleVariables for FMemoryConsoleVariables {
    fn get_value(&self, name: &str) -> Option<String> {
        self.values.get(&name.to_ascii_lowercase()).cloned()
    }
}

#[derive(Debug, Default)]
pub struct FMemoryNativeClassDigests {
    digests: HashMap<String, FIoHash>,
}
impl FMemoryNativeClassDigests {
    pub fn set_digest(&mut self, class_path: &str, digest: FIoHash) {
        self.digests.insert(class_path.to_ascii_lowercase(), digest);
    }
}
impl INativeClassDigestProvider for FMemoryNativeClassDigests {
    fn append_class_digests(&self, class_paths: &[&str], hasher: &mut blake3::Hasher) -> Result<()> {
        for class_path in class_paths {
            let Some(digest) = self.digests.get(&class_path.to_ascii_lowercase()) else {
                bail!("native class {class_path} has no schema digest");
            };
            hasher.update(&digest.0);
        }
        Ok(())
    }
}

/// Hashes files below a root directory
#[derive(Debug, Clone)]
pub struct FFileHasher {
    pub root: PathBuf,
}
impl IFileHasher for FFileHasher {
    fn hash_file(&self, path: &str) -> Result<[u8; 32]> {
        let data = fs::read(self.root.join(path.trim_start_matches('/')))?;
        Ok(*blake3::hash(&data).as_bytes())
    }
}

#[derive(Debug, Default)]
pub struct FMemoryFileHasher {
    files: HashMap<String, Vec<u8>>,
}
impl FMemoryFileHasher {
    pub fn set_file(&mut self, path: &str, data: &[u8]) {
        self.files.insert(path.to_ascii_lowercase(), data.to_vec());
    }
}
impl IFileHasher for FMemoryFileHasher {
    fn hash_file(&self, path: &str) -> Result<[u8; 32]> {
        match self.files.get(&path.to_ascii_lowercase()) {
            Some(data) => Ok(*blake3::hash(data).as_bytes()),
            None => bail!("file {path} does not exist"),
        }
    }
}

#[derive(Debug, Default)]
pub struct FMemoryGenerationHelper {
    generated: HashMap<String, FIoHash>,
}
impl FMemoryGenerationHelper {
    pub fn add_generated_package(&mut self, package_name: &str, digest: FIoHash) {
        self.generated.insert(package_name.to_ascii_lowercase(), digest);
    }
}
impl IGenerationHelper for FMemoryGenerationHelper {
    fn is_generated_package(&self, package_name: &str) -> bool {
        self.generated.contains_key(&package_name.to_ascii_lowercase())
    }
    fn get_package_digest(&self, package_name: &str) -> Option<FIoHash> {
        self.generated.get(&package_name.to_ascii_lowercase()).copied()
    }
}

/// Owns in-memory stand-ins for every collaborator
pub struct FMemoryCookServices {
    pub config: Config,
    pub asset_registry: FMemoryAssetRegistry,
    pub has_asset_registry: bool,
    pub target_platform: Option<FTargetPlatform>,
    pub config_tracker: FMemoryConfigTracker,
    pub console_variables: FMemoryConsoleVariables,
    pub native_classes: FMemoryNativeClassDigests,
    pub file_hasher: FMemoryFileHasher,
    pub generation_helper: FMemoryGenerationHelper,
    pub functions: FCookDependencyFunctions,
    pub groups: FCookDependencyGroups,
}
impl Default for FMemoryCookServices {
    fn default() -> Self {
        Self {
            config: Config::default(),
            asset_registry: FMemoryAssetRegistry::default(),
            has_asset_registry: true,
            target_platform: Some(FTargetPlatform::game("Windows")),
            config_tracker: FMemoryConfigTracker::default(),
            console_variables: FMemoryConsoleVariables::default(),
            native_classes: FMemoryNativeClassDigests::default(),
            file_hasher: FMemoryFileHasher::default(),
            generation_helper: FMemoryGenerationHelper::default(),
            functions: FCookDependencyFunctions::default(),
            groups: FCookDependencyGroups::default(),
        }
    }
}
impl FMemoryCookServices {
    pub fn services(&self) -> FCookServices<'_> {
        FCookServices {
            config: &self.config,
            asset_registry: self.has_asset_registry.then_some(&self.asset_registry as &dyn IAssetRegistry),
            target_platform: self.target_platform.as_ref().map(|p| p as &dyn ITargetPlatform),
            config_tracker: &self.config_tracker,
            console_variables: &self.console_variables,
            native_classes: &self.native_classes,
            file_hasher: &self.file_hasher,
            generation_helper: Some(&self.generation_helper),
            functions: &self.functions,
            groups: &self.groups,
        }
    }
}
