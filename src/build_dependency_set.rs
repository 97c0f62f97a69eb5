use anyhow::{Context as _, Result, bail};
use serde::Serialize;
use tracing::instrument;

use crate::compact_binary::{CbWriter, FieldValue};
use crate::compare_ignore_case;
use crate::cook_dependency::{ECookDependency, FCookDependency, FCookDependencyContext};
use crate::logging::{ELogVerbosity, FMessages};
use crate::services::FCookServices;
use crate::FIoHash;

pub const LOAD_BUILD_RESULT: &str = "Load";
pub const SAVE_BUILD_RESULT: &str = "Save";

/// Outcome of a key calculation. Error means no key exists at all and none may be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EKeyResult {
    Success,
    Invalidated,
    Error,
}

/// Sorts and deduplicates dependencies and drops transitive build dependencies on the package itself.
/// Package dependencies on the package itself are kept, they key its own content.
pub fn normalize_dependencies(dependencies: &mut Vec<FCookDependency>, package_name: Option<&str>) {
    dependencies.sort();
    dependencies.dedup();
    if let Some(package_name) = package_name {
        dependencies.retain(|d| !(d.get_type() == ECookDependency::TransitiveBuild && d.package_name().is_some_and(|n| compare_ignore_case(n, package_name).is_eq())));
    }
}

/// Dependencies of one build result (Load or Save) and its keys
#[derive(Debug, Clone)]
pub struct FBuildDependencySet {
    name: String,
    dependencies: Vec<FCookDependency>,
    stored_key: FIoHash,
    current_key: Option<FIoHash>,
    valid: bool,
}

impl FBuildDependencySet {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            dependencies: vec![],
            stored_key: FIoHash::ZERO,
            current_key: None,
            valid: false,
        }
    }
    pub fn get_name(&self) -> &str {
        &self.name
    }
    pub fn get_dependencies(&self) -> &[FCookDependency] {
        &self.dependencies
    }
    pub fn get_stored_key(&self) -> FIoHash {
        self.stored_key
    }
    pub fn get_current_key(&self) -> Option<FIoHash> {
        self.current_key
    }
    pub fn is_valid(&self) -> bool {
        self.valid
    }
    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    /// Replaces the dependencies with a normalized copy of `dependencies`.
    /// Settings objects are expanded into the config values they were loaded from.
    #[instrument(skip_all, fields(name = %self.name))]
    pub fn try_collect_internal(&mut self, dependencies: Vec<FCookDependency>, package_name: &str, services: &FCookServices, messages: &mut FMessages) -> bool {
        let mut collected = Vec::with_capacity(dependencies.len());
        let mut succeeded = true;
        for dependency in dependencies {
            if dependency.get_type() != ECookDependency::SettingsObject {
                collected.push(dependency);
                continue;
            }
            let object_path = dependency.identifier();
            let group = services.groups.find_or_build(&object_path, || {
                let keys = services.config_tracker.keys_for_settings_object(&object_path)?;
                Some(keys.into_iter().map(FCookDependency::config).collect())
            });
            match group {
                Some(group) => collected.extend(group),
                None => {
                    messages.push((ELogVerbosity::Error, format!("{package_name}: settings object {object_path} has no tracked config values")));
                    succeeded = false;
                }
            }
        }
        normalize_dependencies(&mut collected, Some(package_name));
        self.dependencies = collected;
        self.current_key = None;
        succeeded
    }

    /// Adds more dependencies, keeping the list normalized
    pub fn append(&mut self, dependencies: impl IntoIterator<Item = FCookDependency>, package_name: &str) {
        self.dependencies.extend(dependencies);
        normalize_dependencies(&mut self.dependencies, Some(package_name));
        self.current_key = None;
    }

    /// Hashes the current state of every dependency. Dependencies are sorted by type, so native class and
    /// redirection runs are contiguous and resolved with one batched call each. Batched dependencies keep no
    /// per-dependency `value`.
    #[instrument(skip_all, fields(name = %self.name))]
    pub fn try_calculate_current_key(&mut self, services: &FCookServices, package_name: &str, messages: &mut FMessages) -> EKeyResult {
        let mut context = FCookDependencyContext::new(*services, package_name);
        let mut has_redirects = false;

        let mut index = 0;
        while index < self.dependencies.len() {
            let ty = self.dependencies[index].get_type();
            let run_end = index + self.dependencies[index..].iter().take_while(|d| d.get_type() == ty).count();
            let run = &self.dependencies[index..run_end];
            match ty {
                ECookDependency::NativeClass => {
                    let class_paths: Vec<String> = run.iter().map(FCookDependency::identifier).collect();
                    let class_paths: Vec<&str> = class_paths.iter().map(String::as_str).collect();
                    context.update(&[ty as u8]);
                    if let Err(e) = services.native_classes.append_class_digests(&class_paths, context.hasher_mut()) {
                        context.report_error(format!("{package_name}: {e:#}"));
                    }
                }
                ECookDependency::RedirectionTarget => {
                    let Some(asset_registry) = services.asset_registry else {
                        context.report_error(format!("{package_name}: redirection target dependencies require the asset registry"));
                        index = run_end;
                        continue;
                    };
                    let names: Vec<&str> = run.iter().filter_map(FCookDependency::package_name).collect();
                    context.update(&[ty as u8]);
                    asset_registry.append_redirect_hashes(&names, context.hasher_mut());
                    has_redirects = true;
                }
                _ => {
                    for dependency in &mut self.dependencies[index..run_end] {
                        dependency.update_hash(&mut context);
                    }
                }
            }
            index = run_end;
        }
        if has_redirects {
            if let Some(asset_registry) = services.asset_registry {
                context.update(&asset_registry.global_redirect_hash().0);
            }
        }

        let (hash, error, invalidated, context_messages) = context.finish();
        messages.extend(context_messages);
        if error {
            self.current_key = None;
            return EKeyResult::Error;
        }
        self.current_key = Some(FIoHash::from_blake3(hash.as_bytes()));
        if invalidated { EKeyResult::Invalidated } else { EKeyResult::Success }
    }

    /// Copies the current key into the stored key. Does nothing when no key was calculated.
    pub fn store_current_key(&mut self) {
        if let Some(key) = self.current_key {
            self.stored_key = key;
        }
    }

    /// True when the key calculated now equals the key stored by the previous session
    pub fn has_key_match(&mut self, services: &FCookServices, package_name: &str, messages: &mut FMessages) -> bool {
        if self.current_key.is_none() && self.try_calculate_current_key(services, package_name, messages) == EKeyResult::Error {
            return false;
        }
        self.current_key == Some(self.stored_key)
    }

    pub fn get_transitive_build_dependencies(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().filter(|d| d.get_type() == ECookDependency::TransitiveBuild).filter_map(FCookDependency::package_name)
    }

    #[instrument(skip_all, fields(name = %self.name))]
    pub fn save(&self, writer: &mut CbWriter, field_name: &str) -> Result<()> {
        writer.begin_object(field_name);
        writer.add_string("Name", &self.name)?;
        writer.add_hash("StoredKey", self.stored_key.0)?;
        if !self.dependencies.is_empty() {
            writer.begin_array("Dependencies");
            for dependency in &self.dependencies {
                dependency.save(writer)?;
            }
            writer.end_array()?;
        }
        writer.end_object()
    }

    #[instrument(skip_all)]
    pub fn load(field: &FieldValue) -> Result<Self> {
        let Some(name) = field.get("Name").and_then(FieldValue::as_string) else {
            bail!("build dependency set without Name");
        };
        let stored_key = field.get("StoredKey").and_then(FieldValue::as_hash).context("build dependency set without StoredKey")?;
        let dependencies = FieldValue::array_or_empty(field.get("Dependencies"))
            .iter()
            .map(FCookDependency::load)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("failed to load {name} dependencies"))?;
        Ok(Self {
            name: name.clone(),
            dependencies,
            stored_key: FIoHash(*stored_key),
            current_key: None,
            valid: true,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compact_binary::load_compact_binary;
    use crate::cook_dependency::FConfigAccessData;
    use crate::services::{FMemoryCookServices, FMemoryPackage};
    use anyhow::Context;
    use pretty_assertions::assert_eq;

    const PACKAGE: &str = "/Game/Maps/Entry";

    fn sample() -> Vec<FCookDependency> {
        vec![
            FCookDependency::package("/Game/B"),
            FCookDependency::native_class("/Script/Engine.Actor"),
            FCookDependency::package("/game/b"),
            FCookDependency::transitive_build("/Game/C"),
            FCookDependency::package("/Game/A"),
            FCookDependency::native_class("/Script/Engine.Pawn"),
            FCookDependency::transitive_build("/Game/C"),
        ]
    }

    fn env() -> FMemoryCookServices {
        let mut env = FMemoryCookServices::default();
        for (name, digest) in [(PACKAGE, b"entry" as &[u8]), ("/Game/A", b"a"), ("/Game/B", b"b")] {
            env.asset_registry.add_package(name, FMemoryPackage { digest: FIoHash::hash_buffer(digest), ..Default::default() });
        }
        env.native_classes.set_digest("/Script/Engine.Actor", FIoHash::hash_buffer(b"actor"));
        env.native_classes.set_digest("/Script/Engine.Pawn", FIoHash::hash_buffer(b"pawn"));
        env
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let mut deps = sample();
        normalize_dependencies(&mut deps, Some(PACKAGE));
        let once = deps.clone();
        normalize_dependencies(&mut deps, Some(PACKAGE));
        assert_eq!(once, deps);
        assert_eq!(5, deps.len());
        let types: Vec<ECookDependency> = deps.iter().map(FCookDependency::get_type).collect();
        assert_eq!(
            vec![
                ECookDependency::TransitiveBuild,
                ECookDependency::Package,
                ECookDependency::Package,
                ECookDependency::NativeClass,
                ECookDependency::NativeClass
            ],
            types
        );
    }

    #[test]
    fn test_self_dependency_elision() {
        let mut set = FBuildDependencySet::new(SAVE_BUILD_RESULT);
        let env = env();
        let mut messages = vec![];
        let deps = vec![
            FCookDependency::transitive_build(PACKAGE),
            FCookDependency::transitive_build(&PACKAGE.to_ascii_uppercase()),
            FCookDependency::package(PACKAGE),
        ];
        assert!(set.try_collect_internal(deps, PACKAGE, &env.services(), &mut messages));
        assert_eq!(vec![FCookDependency::package(PACKAGE)], set.get_dependencies());
        assert_eq!(0, set.get_transitive_build_dependencies().count());

        set.append([FCookDependency::transitive_build(PACKAGE), FCookDependency::package("/Game/A")], PACKAGE);
        assert_eq!(vec![FCookDependency::package("/Game/A"), FCookDependency::package(PACKAGE)], set.get_dependencies());
        assert_eq!(None, set.get_current_key());
    }

    #[test]
    fn test_key_is_deterministic() {
        let env = env();
        let services = env.services();
        let mut messages = vec![];

        let mut a = FBuildDependencySet::new(SAVE_BUILD_RESULT);
        a.try_collect_internal(sample(), PACKAGE, &services, &mut messages);
        let mut b = FBuildDependencySet::new(SAVE_BUILD_RESULT);
        let mut reversed = sample();
        reversed.reverse();
        b.try_collect_internal(reversed, PACKAGE, &services, &mut messages);

        assert_eq!(EKeyResult::Success, a.try_calculate_current_key(&services, PACKAGE, &mut messages));
        assert_eq!(EKeyResult::Success, b.try_calculate_current_key(&services, PACKAGE, &mut messages));
        assert_eq!(a.get_current_key(), b.get_current_key());
        assert!(messages.is_empty());

        // nothing stored yet
        assert!(!a.has_key_match(&services, PACKAGE, &mut messages));
        a.store_current_key();
        assert!(a.has_key_match(&services, PACKAGE, &mut messages));
    }

    #[test]
    fn test_package_digest_change_changes_key() {
        let mut env = env();
        let mut messages = vec![];
        let mut set = FBuildDependencySet::new(SAVE_BUILD_RESULT);
        set.try_collect_internal(vec![FCookDependency::package("/Game/B")], "/Game/A", &env.services(), &mut messages);
        set.try_calculate_current_key(&env.services(), "/Game/A", &mut messages);
        set.store_current_key();

        env.asset_registry.set_package_digest("/Game/B", FIoHash::hash_buffer(b"b changed"));
        let mut next_session = set.clone();
        next_session.current_key = None;
        assert_eq!(EKeyResult::Success, next_session.try_calculate_current_key(&env.services(), "/Game/A", &mut messages));
        assert_ne!(Some(next_session.get_stored_key()), next_session.get_current_key());
        assert!(!next_session.has_key_match(&env.services(), "/Game/A", &mut messages));
    }

    #[test]
    fn test_key_errors() {
        let mut env = env();
        let mut messages = vec![];
        let mut set = FBuildDependencySet::new(LOAD_BUILD_RESULT);
        set.try_collect_internal(vec![FCookDependency::package("/Game/Missing")], PACKAGE, &env.services(), &mut messages);
        assert_eq!(EKeyResult::Error, set.try_calculate_current_key(&env.services(), PACKAGE, &mut messages));
        assert_eq!(None, set.get_current_key());
        set.store_current_key();
        assert_eq!(FIoHash::ZERO, set.get_stored_key());
        assert_eq!(ELogVerbosity::Error, messages[0].0);

        let mut set = FBuildDependencySet::new(LOAD_BUILD_RESULT);
        set.try_collect_internal(vec![FCookDependency::native_class("/Script/Engine.Unknown")], PACKAGE, &env.services(), &mut messages);
        assert_eq!(EKeyResult::Error, set.try_calculate_current_key(&env.services(), PACKAGE, &mut messages));

        env.has_asset_registry = false;
        let mut set = FBuildDependencySet::new(LOAD_BUILD_RESULT);
        set.try_collect_internal(vec![FCookDependency::redirection_target("/Game/A")], PACKAGE, &env.services(), &mut messages);
        assert_eq!(EKeyResult::Error, set.try_calculate_current_key(&env.services(), PACKAGE, &mut messages));
    }

    #[test]
    fn test_invalidated_is_distinct() {
        fn always_changed(_args: &[u8], context: &mut FCookDependencyContext) {
            context.report_invalidated("volatile input".to_string());
        }
        let mut env = env();
        env.functions.register("Volatile", always_changed);
        let mut messages = vec![];
        let mut set = FBuildDependencySet::new(SAVE_BUILD_RESULT);
        set.try_collect_internal(vec![FCookDependency::function("Volatile", vec![])], PACKAGE, &env.services(), &mut messages);
        assert_eq!(EKeyResult::Invalidated, set.try_calculate_current_key(&env.services(), PACKAGE, &mut messages));
        assert!(set.get_current_key().is_some());
    }

    #[test]
    fn test_redirects_and_config() {
        let mut env = env();
        env.config_tracker.set_value(FConfigAccessData::new("Windows", "Game", "Maps", "Default"), "/Game/Maps/Entry");
        let key = |env: &FMemoryCookServices| {
            let mut set = FBuildDependencySet::new(SAVE_BUILD_RESULT);
            let mut messages = vec![];
            set.try_collect_internal(
                vec![
                    FCookDependency::redirection_target("/Game/Old"),
                    FCookDependency::config(FConfigAccessData::new("Windows", "Game", "Maps", "Default")),
                    FCookDependency::config(FConfigAccessData::new("Windows", "Game", "Maps", "Unset")),
                ],
                PACKAGE,
                &env.services(),
                &mut messages,
            );
            assert_eq!(EKeyResult::Success, set.try_calculate_current_key(&env.services(), PACKAGE, &mut messages));
            set.get_current_key()
        };
        let before = key(&env);
        env.asset_registry.add_redirect("/Game/Unrelated", "/Game/Elsewhere");
        let global_changed = key(&env);
        assert_ne!(before, global_changed);
        env.asset_registry.add_redirect("/Game/Old", "/Game/New");
        assert_ne!(global_changed, key(&env));
    }

    #[test]
    fn test_batched_dependencies_carry_no_value() {
        let mut env = env();
        env.config_tracker.set_value(FConfigAccessData::new("Windows", "Game", "Maps", "Default"), "/Game/Maps/Entry");
        let mut set = FBuildDependencySet::new(SAVE_BUILD_RESULT);
        let mut messages = vec![];
        set.try_collect_internal(
            vec![
                FCookDependency::native_class("/Script/Engine.Actor"),
                FCookDependency::redirection_target("/Game/Old"),
                FCookDependency::config(FConfigAccessData::new("Windows", "Game", "Maps", "Default")),
            ],
            PACKAGE,
            &env.services(),
            &mut messages,
        );
        assert_eq!(EKeyResult::Success, set.try_calculate_current_key(&env.services(), PACKAGE, &mut messages));
        for dependency in set.get_dependencies() {
            match dependency.get_type() {
                ECookDependency::NativeClass | ECookDependency::RedirectionTarget => assert_eq!(None, dependency.value()),
                _ => assert!(dependency.value().is_some()),
            }
        }
    }

    #[test]
    fn test_settings_object_expansion() {
        let mut env = env();
        let settings = "/Script/Engine.Default__RendererSettings";
        env.config_tracker.add_settings_object(settings, vec![FConfigAccessData::new("Windows", "Engine", "Renderer", "r.Lumen")]);
        let mut messages = vec![];
        let mut set = FBuildDependencySet::new(SAVE_BUILD_RESULT);
        assert!(set.try_collect_internal(vec![FCookDependency::settings_object(settings)], PACKAGE, &env.services(), &mut messages));
        assert_eq!(vec![FCookDependency::config(FConfigAccessData::new("Windows", "Engine", "Renderer", "r.Lumen"))], set.get_dependencies());
        assert_eq!(1, env.groups.len());

        assert!(!set.try_collect_internal(vec![FCookDependency::settings_object("/Script/Missing.Default__X")], PACKAGE, &env.services(), &mut messages));
        assert_eq!(1, messages.len());
    }

    #[test]
    fn test_persistence() -> Result<()> {
        let env = env();
        let mut messages = vec![];
        let mut set = FBuildDependencySet::new(SAVE_BUILD_RESULT);
        set.try_collect_internal(sample(), PACKAGE, &env.services(), &mut messages);
        set.try_calculate_current_key(&env.services(), PACKAGE, &mut messages);
        set.store_current_key();

        let mut writer = CbWriter::new();
        writer.begin_object("");
        set.save(&mut writer, "SaveBuildDependencies")?;
        writer.end_object()?;
        let root = load_compact_binary(&writer.save()?)?;
        let loaded = FBuildDependencySet::load(root.get("SaveBuildDependencies").context("missing set")?)?;

        assert!(loaded.is_valid());
        assert_eq!(SAVE_BUILD_RESULT, loaded.get_name());
        assert_eq!(set.get_stored_key(), loaded.get_stored_key());
        assert_eq!(set.get_dependencies(), loaded.get_dependencies());
        Ok(())
    }
}
