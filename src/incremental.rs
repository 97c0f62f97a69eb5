use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use serde::Serialize;
use strum::IntoStaticStr;
use tracing::instrument;

use crate::build_dependency_set::EKeyResult;
use crate::logging::{ELogVerbosity, FMessages, Log, verbose};
use crate::package_artifacts::{ARTIFACTS_ATTACHMENT_KEY, FPackageArtifacts, LOGS_ATTACHMENT_KEY, artifacts_version};
use crate::package_writer::IOplogReader;
use crate::save_package::load_messages;
use crate::services::FCookServices;

/// Incremental-cook decision for a single package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr, Serialize)]
pub enum EIncrementalResult {
    /// Stored key matches and so does every transitive build dependency; the package can be skipped
    Unmodified,
    Modified,
    /// No artifacts were recorded by a previous cook
    NoArtifacts,
    /// The key could not be calculated
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct FIncrementalCheck {
    pub package_name: String,
    pub result: EIncrementalResult,
    pub messages: FMessages,
    /// Messages of the previous save, replayed because the package was skipped
    pub replayed: FMessages,
}
impl FIncrementalCheck {
    pub fn is_skippable(&self) -> bool {
        self.result == EIncrementalResult::Unmodified
    }
}

#[derive(Debug, Clone)]
struct FDirectResult {
    result: EIncrementalResult,
    transitive_build_dependencies: Vec<String>,
}
impl FDirectResult {
    fn without_dependencies(result: EIncrementalResult) -> Self {
        Self {
            result,
            transitive_build_dependencies: vec![],
        }
    }
}

/// Decides which packages of a previous cook can be skipped.
///
/// A package is unmodified when its stored key matches the recalculated one and each package named by one of its
/// `TransitiveBuild` dependencies exists and is itself unmodified. A cycle of transitive build dependencies is
/// unmodified when nothing reachable from it is modified.
pub struct FIncrementalCook<'a> {
    oplog: &'a dyn IOplogReader,
    services: FCookServices<'a>,
    log: &'a Log,
    version: u32,
    /// lowercase name -> name as stored in the oplog
    oplog_names: HashMap<String, String>,
    direct: HashMap<String, FDirectResult>,
}

impl<'a> FIncrementalCook<'a> {
    pub fn new(oplog: &'a dyn IOplogReader, services: FCookServices<'a>, log: &'a Log) -> Self {
        let oplog_names = oplog.packages().into_iter().map(|name| (name.to_ascii_lowercase(), name)).collect();
        Self {
            oplog,
            version: artifacts_version(services.config),
            services,
            log,
            oplog_names,
            direct: HashMap::new(),
        }
    }

    #[instrument(skip_all, fields(package = package_name))]
    pub fn check_package(&mut self, package_name: &str) -> FIncrementalCheck {
        let mut messages = vec![];
        let result = self.resolve(package_name, &mut messages);
        for (verbosity, message) in &messages {
            self.log.message(*verbosity, message);
        }
        verbose!(self.log, "{package_name}: {}", <&str>::from(result));

        let mut replayed = vec![];
        if result == EIncrementalResult::Unmodified {
            match self.replay_logs(package_name) {
                Ok(logs) => replayed = logs,
                Err(err) => {
                    let message = format!("{err:#}");
                    self.log.message(ELogVerbosity::Warning, &message);
                    messages.push((ELogVerbosity::Warning, message));
                }
            }
        }
        FIncrementalCheck {
            package_name: package_name.to_string(),
            result,
            messages,
            replayed,
        }
    }

    /// Prints the messages stored by the previous save of the package and returns them
    pub fn replay_logs(&self, package_name: &str) -> Result<FMessages> {
        let Some(oplog_name) = self.oplog_names.get(&package_name.to_ascii_lowercase()) else {
            return Ok(vec![]);
        };
        let Some(data) = self.oplog.read_attachment(oplog_name, LOGS_ATTACHMENT_KEY)? else {
            return Ok(vec![]);
        };
        let messages = load_messages(&data).with_context(|| format!("failed to parse the cook log of {package_name}"))?;
        for (verbosity, message) in &messages {
            self.log.message(*verbosity, message);
        }
        Ok(messages)
    }

    fn resolve(&mut self, package_name: &str, messages: &mut FMessages) -> EIncrementalResult {
        let root = self.direct_result(package_name, messages);
        if root.result != EIncrementalResult::Unmodified {
            return root.result;
        }

        let root_key = package_name.to_ascii_lowercase();
        let mut visited = HashSet::from([root_key.clone()]);
        let mut queue: VecDeque<String> = root.transitive_build_dependencies.into();
        let mut cycle = false;
        while let Some(dependency) = queue.pop_front() {
            let key = dependency.to_ascii_lowercase();
            cycle |= key == root_key;
            if !visited.insert(key) {
                continue;
            }
            let direct = self.direct_result(&dependency, messages);
            if direct.result != EIncrementalResult::Unmodified {
                messages.push((
                    ELogVerbosity::Log,
                    format!(
                        "{package_name} is modified because its transitive build dependency {dependency} is {}",
                        <&str>::from(direct.result)
                    ),
                ));
                return EIncrementalResult::Modified;
            }
            queue.extend(direct.transitive_build_dependencies);
        }
        if cycle {
            messages.push((
                ELogVerbosity::Verbose,
                format!("{package_name} is part of a transitive build dependency cycle without modified packages, treating the cycle as unmodified"),
            ));
        }
        EIncrementalResult::Unmodified
    }

    fn direct_result(&mut self, package_name: &str, messages: &mut FMessages) -> FDirectResult {
        let key = package_name.to_ascii_lowercase();
        if let Some(result) = self.direct.get(&key) {
            return result.clone();
        }
        let result = self.calculate_direct(package_name, messages);
        self.direct.insert(key, result.clone());
        result
    }

    /// Key comparison of the package alone, ignoring its transitive build dependencies
    fn calculate_direct(&self, package_name: &str, messages: &mut FMessages) -> FDirectResult {
        let Some(asset_registry) = self.services.asset_registry else {
            messages.push((ELogVerbosity::Error, format!("no asset registry is available, cannot check {package_name}")));
            return FDirectResult::without_dependencies(EIncrementalResult::Error);
        };
        let generated = self.services.generation_helper.is_some_and(|helper| helper.is_generated_package(package_name));
        if !generated && !asset_registry.does_package_exist_on_disk(package_name) {
            messages.push((ELogVerbosity::Warning, format!("{package_name} does not exist in the asset registry, treating it as modified")));
            return FDirectResult::without_dependencies(EIncrementalResult::Modified);
        }

        let Some(oplog_name) = self.oplog_names.get(&package_name.to_ascii_lowercase()) else {
            return FDirectResult::without_dependencies(EIncrementalResult::NoArtifacts);
        };
        let data = match self.oplog.read_attachment(oplog_name, ARTIFACTS_ATTACHMENT_KEY) {
            Ok(Some(data)) => data,
            Ok(None) => return FDirectResult::without_dependencies(EIncrementalResult::NoArtifacts),
            Err(err) => {
                messages.push((ELogVerbosity::Warning, format!("failed to read the artifacts of {package_name}: {err:#}")));
                return FDirectResult::without_dependencies(EIncrementalResult::Modified);
            }
        };
        let mut artifacts = FPackageArtifacts::new(oplog_name);
        if !artifacts.load_from_compact_binary(&data, self.version) {
            messages.push((ELogVerbosity::Display, format!("artifacts of {package_name} are stale or corrupt")));
            return FDirectResult::without_dependencies(EIncrementalResult::Modified);
        }

        let result = match artifacts.try_calculate_current_key(&self.services, messages) {
            EKeyResult::Error => EIncrementalResult::Error,
            EKeyResult::Invalidated => EIncrementalResult::Modified,
            EKeyResult::Success if artifacts.has_key_match(&self.services, messages) => EIncrementalResult::Unmodified,
            EKeyResult::Success => EIncrementalResult::Modified,
        };
        FDirectResult {
            result,
            transitive_build_dependencies: artifacts.get_transitive_build_dependencies(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::FIoHash;
    use crate::cook_dependency::FCookDependency;
    use crate::object::{EClassFlags, EObjectFlags, FObjectRegistry, ObjectBehavior, ObjectId};
    use crate::package_artifacts::FCookEventContext;
    use crate::package_writer::{FMemoryPackageStore, IPackageWriter};
    use crate::save_package::{save_messages, save_package};
    use crate::services::{FMemoryCookServices, FMemoryPackage};
    use anyhow::Context;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const ENTRY: &str = "/Game/Maps/Entry";
    const ROCK: &str = "/Game/Meshes/Rock";

    struct DependsOn(&'static str);
    impl ObjectBehavior for DependsOn {
        fn on_cook_event(&self, _registry: &FObjectRegistry, _object: ObjectId, context: &mut FCookEventContext) {
            context.add_load_build_dependency(FCookDependency::transitive_build(self.0));
        }
    }

    struct Fixture {
        registry: FObjectRegistry,
        entry: ObjectId,
        rock: ObjectId,
        env: FMemoryCookServices,
    }

    /// Entry has a transitive build dependency on Rock, and with `cycle` Rock has one back on Entry
    fn fixture(cycle: bool) -> Fixture {
        let mut registry = FObjectRegistry::new();
        let engine = registry.create_package("/Script/Engine");
        let map_class = registry.create_class(engine, "MapActor", Some(registry.object_class()), EClassFlags::NATIVE);
        let mesh_class = registry.create_class(engine, "MeshActor", Some(registry.object_class()), EClassFlags::NATIVE);
        registry.register_behavior(map_class, Arc::new(DependsOn(ROCK)));
        if cycle {
            registry.register_behavior(mesh_class, Arc::new(DependsOn(ENTRY)));
        }
        let entry = registry.create_package(ENTRY);
        registry.create_object(entry, "Entry", map_class, EObjectFlags::PUBLIC | EObjectFlags::STANDALONE);
        let rock = registry.create_package(ROCK);
        registry.create_object(rock, "Rock", mesh_class, EObjectFlags::PUBLIC | EObjectFlags::STANDALONE);

        let mut env = FMemoryCookServices::default();
        for name in [ENTRY, ROCK] {
            set_digest(&mut env, name, name.as_bytes());
        }
        env.native_classes.set_digest("/Script/Engine.MapActor", FIoHash::hash_buffer(b"MapActor"));
        env.native_classes.set_digest("/Script/Engine.MeshActor", FIoHash::hash_buffer(b"MeshActor"));
        Fixture { registry, entry, rock, env }
    }

    fn set_digest(env: &mut FMemoryCookServices, package_name: &str, content: &[u8]) {
        let package = FMemoryPackage {
            digest: FIoHash::hash_buffer(content),
            ..Default::default()
        };
        env.asset_registry.add_package(package_name, package);
    }

    fn cook(f: &Fixture) -> Result<FMemoryPackageStore> {
        let mut store = FMemoryPackageStore::default();
        for package in [f.entry, f.rock] {
            let result = save_package(&f.registry, package, f.env.services(), &mut store, &Log::no_log());
            anyhow::ensure!(result.is_success(), "{:?}", result.messages);
        }
        Ok(store)
    }

    fn check(store: &FMemoryPackageStore, env: &FMemoryCookServices, package_name: &str) -> EIncrementalResult {
        let log = Log::no_log();
        FIncrementalCook::new(store, env.services(), &log).check_package(package_name).result
    }

    #[test]
    fn test_unchanged_packages_are_unmodified() -> Result<()> {
        let f = fixture(false);
        let store = cook(&f)?;
        assert_eq!(EIncrementalResult::Unmodified, check(&store, &f.env, ENTRY));
        assert_eq!(EIncrementalResult::Unmodified, check(&store, &f.env, ROCK));
        // oplog lookups ignore case
        assert_eq!(EIncrementalResult::Unmodified, check(&store, &f.env, "/game/maps/entry"));
        Ok(())
    }

    #[test]
    fn test_transitive_dependency_change() -> Result<()> {
        let mut f = fixture(false);
        let store = cook(&f)?;
        set_digest(&mut f.env, ROCK, b"edited rock");

        let log = Log::no_log();
        let mut incremental = FIncrementalCook::new(&store, f.env.services(), &log);
        let rock = incremental.check_package(ROCK);
        assert_eq!(EIncrementalResult::Modified, rock.result);
        assert!(rock.replayed.is_empty());
        let entry = incremental.check_package(ENTRY);
        assert_eq!(EIncrementalResult::Modified, entry.result);
        assert!(!entry.is_skippable());
        assert!(entry.messages.iter().any(|(_, m)| m.contains("transitive build dependency /Game/Meshes/Rock")));
        Ok(())
    }

    #[test]
    fn test_missing_transitive_dependency() -> Result<()> {
        let mut f = fixture(false);
        let store = cook(&f)?;
        f.env.asset_registry.remove_package(ROCK);

        let log = Log::no_log();
        let check = FIncrementalCook::new(&store, f.env.services(), &log).check_package(ENTRY);
        assert_eq!(EIncrementalResult::Modified, check.result);
        assert!(check.messages.iter().any(|(v, m)| *v == ELogVerbosity::Warning && m.contains("does not exist")));
        Ok(())
    }

    #[test]
    fn test_transitive_dependency_without_artifacts() -> Result<()> {
        let f = fixture(false);
        let mut store = FMemoryPackageStore::default();
        assert!(save_package(&f.registry, f.entry, f.env.services(), &mut store, &Log::no_log()).is_success());
        assert_eq!(EIncrementalResult::NoArtifacts, check(&store, &f.env, ROCK));
        assert_eq!(EIncrementalResult::Modified, check(&store, &f.env, ENTRY));
        Ok(())
    }

    #[test]
    fn test_cycles() -> Result<()> {
        let mut f = fixture(true);
        let store = cook(&f)?;
        assert_eq!(EIncrementalResult::Unmodified, check(&store, &f.env, ENTRY));
        assert_eq!(EIncrementalResult::Unmodified, check(&store, &f.env, ROCK));

        // a change anywhere in the cycle invalidates all of it
        set_digest(&mut f.env, ENTRY, b"edited entry");
        assert_eq!(EIncrementalResult::Modified, check(&store, &f.env, ENTRY));
        assert_eq!(EIncrementalResult::Modified, check(&store, &f.env, ROCK));
        Ok(())
    }

    #[test]
    fn test_generated_package() -> Result<()> {
        let mut f = fixture(false);
        let cell = f.registry.create_package("/Game/Generated/Cell_0");
        f.registry.create_object(cell, "Cell_0", f.registry.object_class(), EObjectFlags::PUBLIC | EObjectFlags::STANDALONE);
        f.env.generation_helper.add_generated_package("/Game/Generated/Cell_0", FIoHash::hash_buffer(b"cell"));
        let object_class = f.registry.path_name(f.registry.object_class());
        f.env.native_classes.set_digest(&object_class, FIoHash::hash_buffer(b"Object"));

        let mut store = FMemoryPackageStore::default();
        let result = save_package(&f.registry, cell, f.env.services(), &mut store, &Log::no_log());
        assert!(result.is_success(), "{:?}", result.messages);
        assert_eq!(EIncrementalResult::Unmodified, check(&store, &f.env, "/Game/Generated/Cell_0"));

        f.env.generation_helper.add_generated_package("/Game/Generated/Cell_0", FIoHash::hash_buffer(b"regenerated"));
        assert_eq!(EIncrementalResult::Modified, check(&store, &f.env, "/Game/Generated/Cell_0"));
        Ok(())
    }

    #[test]
    fn test_key_errors() -> Result<()> {
        let mut f = fixture(false);
        let store = cook(&f)?;
        f.env.native_classes = Default::default();
        assert_eq!(EIncrementalResult::Error, check(&store, &f.env, ENTRY));

        f.env.has_asset_registry = false;
        assert_eq!(EIncrementalResult::Error, check(&store, &f.env, ROCK));
        Ok(())
    }

    #[test]
    fn test_version_change_is_modified() -> Result<()> {
        let mut f = fixture(false);
        let store = cook(&f)?;
        f.env.config.artifacts_version_override = Some(9999);
        assert_eq!(EIncrementalResult::Modified, check(&store, &f.env, ROCK));
        Ok(())
    }

    #[test]
    fn test_skipped_package_replays_logs() -> Result<()> {
        let f = fixture(false);
        let mut store = cook(&f)?;

        // rewrite the record of Rock with a stored warning
        let record = store.record(ROCK).context("no record")?.clone();
        store.begin_package(ROCK)?;
        for (realm, data) in &record.package_data {
            store.write_package_data(ROCK, *realm, data)?;
        }
        for (key, data) in &record.attachments {
            store.write_attachment(ROCK, key, data)?;
        }
        let logs = vec![(ELogVerbosity::Warning, "Rock uses a deprecated material".to_string())];
        store.write_attachment(ROCK, LOGS_ATTACHMENT_KEY, &save_messages(&logs)?)?;
        store.commit_package(ROCK, true)?;

        let log = Log::no_log();
        let check = FIncrementalCook::new(&store, f.env.services(), &log).check_package(ROCK);
        assert!(check.is_skippable());
        assert_eq!(logs, check.replayed);
        Ok(())
    }
}
