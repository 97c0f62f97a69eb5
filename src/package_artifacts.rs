use anyhow::{Context as _, Result, bail};
use tracing::instrument;

use crate::build_dependency_set::{EKeyResult, FBuildDependencySet, LOAD_BUILD_RESULT, SAVE_BUILD_RESULT};
use crate::compact_binary::{CbWriter, FieldValue, load_compact_binary};
use crate::compare_ignore_case;
use crate::cook_dependency::FCookDependency;
use crate::logging::FMessages;
use crate::services::FCookServices;
use crate::{Config, FIoHash};

/// Bumped whenever the meaning of a stored key changes. Records of other versions are rejected.
pub const PACKAGE_ARTIFACTS_VERSION: u32 = 4;

pub const ARTIFACTS_ATTACHMENT_KEY: &str = "meta.cook.artifacts";
pub const BUILD_DEFINITIONS_ATTACHMENT_KEY: &str = "meta.cook.builddefinitions";
pub const IMPORT_EXPORT_ATTACHMENT_KEY: &str = "meta.cook.importexport";
pub const LOGS_ATTACHMENT_KEY: &str = "meta.cook.logs";

pub fn artifacts_version(config: &Config) -> u32 {
    config.artifacts_version_override.unwrap_or(PACKAGE_ARTIFACTS_VERSION)
}

/// Dependencies declared by cook events of a package's exports
#[derive(Debug, Default)]
pub struct FCookEventContext {
    pub load_dependencies: Vec<FCookDependency>,
    pub save_dependencies: Vec<FCookDependency>,
    pub runtime_dependencies: Vec<String>,
}
impl FCookEventContext {
    /// Input that changes the loaded state of the package; also a Save dependency
    pub fn add_load_build_dependency(&mut self, dependency: FCookDependency) {
        self.load_dependencies.push(dependency);
    }
    pub fn add_save_build_dependency(&mut self, dependency: FCookDependency) {
        self.save_dependencies.push(dependency);
    }
    pub fn add_runtime_dependency(&mut self, package_name: &str) {
        self.runtime_dependencies.push(package_name.to_string());
    }
}

#[derive(Debug, Clone)]
pub struct FPackageArtifacts {
    package_name: String,
    load_build_dependencies: FBuildDependencySet,
    save_build_dependencies: FBuildDependencySet,
    runtime_dependencies: Vec<String>,
    has_save_results: bool,
    valid: bool,
}

impl FPackageArtifacts {
    pub fn new(package_name: &str) -> Self {
        Self {
            package_name: package_name.to_string(),
            load_build_dependencies: FBuildDependencySet::new(LOAD_BUILD_RESULT),
            save_build_dependencies: FBuildDependencySet::new(SAVE_BUILD_RESULT),
            runtime_dependencies: vec![],
            has_save_results: false,
            valid: false,
        }
    }

    /// Populates both sets. The Save set receives a copy of every Load dependency.
    #[instrument(skip_all, fields(package = package_name))]
    pub fn collect(
        package_name: &str,
        load_dependencies: Vec<FCookDependency>,
        save_dependencies: Vec<FCookDependency>,
        runtime_dependencies: Vec<String>,
        has_save_results: bool,
        services: &FCookServices,
        messages: &mut FMessages,
    ) -> Self {
        let mut artifacts = Self::new(package_name);
        let mut succeeded = artifacts.load_build_dependencies.try_collect_internal(load_dependencies, package_name, services, messages);

        let mut save = save_dependencies;
        save.extend(artifacts.load_build_dependencies.get_dependencies().iter().cloned());
        succeeded &= artifacts.save_build_dependencies.try_collect_internal(save, package_name, services, messages);

        let mut runtime = runtime_dependencies;
        runtime.retain(|r| compare_ignore_case(r, package_name).is_ne());
        runtime.sort_by(|a, b| compare_ignore_case(a, b));
        runtime.dedup_by(|a, b| compare_ignore_case(a, b).is_eq());
        artifacts.runtime_dependencies = runtime;

        artifacts.has_save_results = has_save_results;
        artifacts.load_build_dependencies.set_valid(succeeded);
        artifacts.save_build_dependencies.set_valid(succeeded);
        artifacts.valid = succeeded;
        artifacts
    }

    pub fn get_package_name(&self) -> &str {
        &self.package_name
    }
    pub fn is_valid(&self) -> bool {
        self.valid
    }
    pub fn has_save_results(&self) -> bool {
        self.has_save_results
    }
    pub fn get_load_build_dependencies(&self) -> &FBuildDependencySet {
        &self.load_build_dependencies
    }
    pub fn get_save_build_dependencies(&self) -> &FBuildDependencySet {
        &self.save_build_dependencies
    }
    /// The set that decides skippability: Save when the package was saved, otherwise Load
    fn key_set(&self) -> &FBuildDependencySet {
        if self.has_save_results { &self.save_build_dependencies } else { &self.load_build_dependencies }
    }
    fn key_set_mut(&mut self) -> &mut FBuildDependencySet {
        if self.has_save_results { &mut self.save_build_dependencies } else { &mut self.load_build_dependencies }
    }
    pub fn get_stored_key(&self) -> FIoHash {
        self.key_set().get_stored_key()
    }
    pub fn get_current_key(&self) -> Option<FIoHash> {
        self.key_set().get_current_key()
    }
    pub fn get_dependencies(&self) -> &[FCookDependency] {
        self.key_set().get_dependencies()
    }
    pub fn get_runtime_dependencies(&self) -> &[String] {
        &self.runtime_dependencies
    }
    pub fn get_transitive_build_dependencies(&self) -> Vec<String> {
        self.key_set().get_transitive_build_dependencies().map(str::to_string).collect()
    }

    /// Calculates the keys of both sets. Error wins over Invalidated.
    pub fn try_calculate_current_key(&mut self, services: &FCookServices, messages: &mut FMessages) -> EKeyResult {
        let load = self.load_build_dependencies.try_calculate_current_key(services, &self.package_name, messages);
        let save = self.save_build_dependencies.try_calculate_current_key(services, &self.package_name, messages);
        match (load, save) {
            (EKeyResult::Error, _) | (_, EKeyResult::Error) => EKeyResult::Error,
            (EKeyResult::Invalidated, _) | (_, EKeyResult::Invalidated) => EKeyResult::Invalidated,
            _ => EKeyResult::Success,
        }
    }
    pub fn store_current_key(&mut self) {
        self.load_build_dependencies.store_current_key();
        self.save_build_dependencies.store_current_key();
    }
    pub fn has_key_match(&mut self, services: &FCookServices, messages: &mut FMessages) -> bool {
        let package_name = self.package_name.clone();
        self.valid && self.key_set_mut().has_key_match(services, &package_name, messages)
    }

    #[instrument(skip_all, fields(package = %self.package_name))]
    pub fn save(&self, version: u32) -> Result<Vec<u8>> {
        let mut writer = CbWriter::new();
        writer.begin_object("");
        writer.add_u64("Version", version as u64)?;
        writer.add_bool("HasSaveResults", self.has_save_results)?;
        self.save_build_dependencies.save(&mut writer, "SaveBuildDependencies")?;
        self.load_build_dependencies.save(&mut writer, "LoadBuildDependencies")?;
        if !self.runtime_dependencies.is_empty() {
            writer.begin_array("RuntimeDependencies");
            for dependency in &self.runtime_dependencies {
                writer.add_string("", dependency)?;
            }
            writer.end_array()?;
        }
        writer.end_object()?;
        writer.save()
    }

    /// Loads a record written by `save`. Records of another version are rejected without migration.
    #[instrument(skip_all, fields(package = package_name))]
    pub fn load(package_name: &str, data: &[u8], version: u32) -> Result<Self> {
        let root = load_compact_binary(data).with_context(|| format!("failed to parse artifacts of {package_name}"))?;
        let stored_version = root.get("Version").and_then(FieldValue::as_u32).context("artifacts record without Version")?;
        if stored_version != version {
            bail!("artifacts of {package_name} have version {stored_version}, expected {version}");
        }
        let set = |name: &str| -> Result<FBuildDependencySet> {
            FBuildDependencySet::load(root.get(name).with_context(|| format!("artifacts record without {name}"))?)
        };
        let runtime_dependencies = FieldValue::array_or_empty(root.get("RuntimeDependencies"))
            .iter()
            .map(|v| v.as_string().cloned().context("non-string runtime dependency"))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            package_name: package_name.to_string(),
            load_build_dependencies: set("LoadBuildDependencies")?,
            save_build_dependencies: set("SaveBuildDependencies")?,
            runtime_dependencies,
            has_save_results: root.get("HasSaveResults").and_then(FieldValue::as_bool).unwrap_or(false),
            valid: true,
        })
    }

    /// Replaces this record with the stored one. Returns false, leaving the record invalid, when the data is
    /// malformed or of another version.
    pub fn load_from_compact_binary(&mut self, data: &[u8], version: u32) -> bool {
        match Self::load(&self.package_name, data, version) {
            Ok(loaded) => {
                *self = loaded;
                true
            }
            Err(_) => {
                *self = Self::new(&self.package_name);
                false
            }
        }
    }
}
