use std::collections::VecDeque;

use itertools::Itertools;
use tracing::instrument;

use crate::cook_dependency::FCookDependency;
use crate::object::{EObjectFlags, ObjectId};
use crate::save_context::{EIllegalRefReason, ESaveRealm, ESaveRealmSet, ESaveableStatus, FSaveContext};
use crate::{compare_ignore_case, is_script_package, package_name_of_path};

/// Traversal state of one reference, passed down the walk by value
#[derive(Debug, Clone, Copy)]
pub struct FHarvestScope {
    /// Realms the reference is harvested into
    pub realms: ESaveRealmSet,
    /// Reference comes from an editor-only property
    pub editor_only: bool,
    /// Do not record dependency edges from the current export
    pub ignore_dependencies: bool,
    /// Export whose references are being walked
    pub current_export: Option<ObjectId>,
}
impl FHarvestScope {
    pub fn root(realms: ESaveRealmSet) -> Self {
        Self {
            realms,
            editor_only: false,
            ignore_dependencies: false,
            current_export: None,
        }
    }
    fn with_realms(self, realms: ESaveRealmSet) -> Self {
        Self { realms, ..self }
    }
    fn with_editor_only(self, editor_only: bool) -> Self {
        Self { editor_only: self.editor_only || editor_only, ..self }
    }
    fn ignoring_dependencies(self) -> Self {
        Self { ignore_dependencies: true, ..self }
    }
}

/// Walks everything reachable from a package's top-level objects and sorts it into exports and imports per realm
pub struct FPackageHarvester<'c, 'a> {
    context: &'c mut FSaveContext<'a>,
    export_queue: VecDeque<(ObjectId, ESaveRealmSet)>,
}

impl<'c, 'a> FPackageHarvester<'c, 'a> {
    pub fn new(context: &'c mut FSaveContext<'a>) -> Self {
        Self {
            context,
            export_queue: VecDeque::new(),
        }
    }

    /// Harvests every public or standalone top-level object of the package and everything they reference
    #[instrument(skip_all, fields(package = %self.context.package_name()))]
    pub fn harvest_package(&mut self) {
        let registry = self.context.registry;
        let package = self.context.package();
        let scope = FHarvestScope::root(self.context.requested_realms());

        self.harvest_reference(Some(package), scope);
        for &root in registry.objects_with_outer(package) {
            if !registry.get(root).flags.intersects(EObjectFlags::PUBLIC | EObjectFlags::STANDALONE) {
                continue;
            }
            let mut realms = ESaveRealmSet::empty();
            for realm in scope.realms.realms() {
                if self.context.is_export_candidate(root, realm) {
                    realms |= realm.set();
                }
            }
            self.harvest_reference(Some(root), scope.with_realms(realms));
        }
        self.process_export_queue();
    }

    /// Drains the queue of exports whose references have not been walked yet
    pub fn process_export_queue(&mut self) {
        while let Some((export, realms)) = self.export_queue.pop_front() {
            self.process_export(export, realms);
        }
    }

    /// Harvests one reference to `object` made under `scope`
    pub fn harvest_reference(&mut self, object: Option<ObjectId>, scope: FHarvestScope) {
        let Some(object) = object else {
            return;
        };
        let registry = self.context.registry;
        let mut realms = scope.realms;

        if !self.context.game_realm_tracks_editor_only() && (scope.editor_only || self.context.is_editor_only_object(object)) {
            realms -= ESaveRealmSet::GAME | ESaveRealmSet::OPTIONAL;
        }

        if self.context.is_cooking() && registry.is_optional(object) {
            let in_game = realms.intersects(ESaveRealmSet::GAME | ESaveRealmSet::OPTIONAL);
            if realms.contains(ESaveRealmSet::GAME) && !scope.editor_only {
                if let Some(referrer) = scope.current_export {
                    if !registry.is_optional(referrer) && !self.context.is_editor_only_object(referrer) {
                        self.context.record_illegal_reference(referrer, object, EIllegalRefReason::ReferenceToOptional);
                    }
                }
            }
            realms &= ESaveRealmSet::EDITOR;
            if in_game {
                realms |= ESaveRealmSet::OPTIONAL & self.context.requested_realms();
            }
        }

        for realm in realms.realms() {
            if self.context.conditionally_exclude_object_for_realm(object, realm) {
                realms -= realm.set();
            }
        }
        if realms.is_empty() {
            return;
        }

        if object == self.context.package() {
            let name = self.context.package_name().to_string();
            for realm in realms.realms() {
                self.context.harvested_realm_mut(realm).names.insert(name.clone());
            }
            return;
        }

        if registry.get(object).class == Some(registry.prestream_package_class()) {
            let prestream = registry.get(registry.package_of(object)).name.clone();
            for realm in realms.realms() {
                self.context.harvested_realm_mut(realm).prestream_packages.insert(prestream.clone());
            }
            return;
        }

        let mut new_realms = ESaveRealmSet::empty();
        for realm in realms.realms() {
            let harvested = self.context.harvested_realm(realm);
            if !harvested.is_included(object) && !harvested.excluded.contains(&object) {
                new_realms |= realm.set();
            }
        }
        if !new_realms.is_empty() {
            if registry.package_of(object) == self.context.package() {
                let mut export_realms = ESaveRealmSet::empty();
                for realm in new_realms.realms() {
                    if self.context.is_export_candidate(object, realm) {
                        export_realms |= realm.set();
                    }
                }
                self.try_harvest_export(object, export_realms);
                self.try_harvest_import(object, scope.with_realms(new_realms - export_realms));
            } else {
                self.try_harvest_import(object, scope.with_realms(new_realms));
            }
        }

        if let (false, Some(export)) = (scope.ignore_dependencies, scope.current_export) {
            for realm in realms.realms() {
                let harvested = self.context.harvested_realm_mut(realm);
                if harvested.is_included(object) && harvested.exports.contains(&export) && export != object {
                    harvested.export_dependencies.entry(export).or_default().insert(object);
                }
            }
        }
    }

    fn try_harvest_export(&mut self, object: ObjectId, realms: ESaveRealmSet) {
        let mut exported = ESaveRealmSet::empty();
        for realm in realms.realms() {
            let status = self.context.get_saveable_status(object, realm);
            let harvested = self.context.harvested_realm_mut(realm);
            if status == ESaveableStatus::Success {
                harvested.exports.insert(object);
                exported |= realm.set();
            } else {
                harvested.excluded.insert(object);
            }
        }
        if !exported.is_empty() {
            self.export_queue.push_back((object, exported));
        }
    }

    fn try_harvest_import(&mut self, object: ObjectId, scope: FHarvestScope) {
        let mut imported = ESaveRealmSet::empty();
        for realm in scope.realms.realms() {
            let status = self.context.get_saveable_status(object, realm);
            let harvested = self.context.harvested_realm_mut(realm);
            if matches!(status, ESaveableStatus::PendingKill | ESaveableStatus::TransientFlag) {
                harvested.excluded.insert(object);
            } else {
                harvested.imports.insert(object);
                imported |= realm.set();
            }
        }
        if !imported.is_empty() {
            self.process_import(object, scope.with_realms(imported));
        }
    }

    /// Records the names and dependencies an import needs and harvests what it is loaded through
    fn process_import(&mut self, object: ObjectId, scope: FHarvestScope) {
        let registry = self.context.registry;
        let data = registry.get(object);
        let mut names = vec![data.name.clone()];
        if let Some(class) = data.class {
            names.push(registry.get(class).name.clone());
            names.push(registry.get(registry.package_of(class)).name.clone());
        }

        let mut build_dependencies = vec![];
        let mut runtime_dependency = None;
        if registry.is_package(object) {
            if !is_script_package(&data.name) {
                if self.context.services.config.record_import_package_dependencies {
                    build_dependencies.push(FCookDependency::package(&data.name));
                }
                runtime_dependency = Some(data.name.clone());
            }
        } else if registry.is_struct(object) && registry.is_native(object) {
            build_dependencies.push(FCookDependency::native_class(&registry.path_name(object)));
        }

        for realm in scope.realms.realms() {
            let harvested = self.context.harvested_realm_mut(realm);
            harvested.names.extend(names.iter().cloned());
            harvested.build_dependencies.extend(build_dependencies.iter().cloned());
            if let Some(runtime) = &runtime_dependency {
                harvested.runtime_dependencies.insert(runtime.clone());
            }
        }

        self.harvest_reference(data.outer, scope);
        let package = registry.package_of(object);
        if package != object {
            self.harvest_reference(Some(package), scope);
        }

        // a blueprint class must be importable together with its default subobjects
        if let Some(class) = data.class.filter(|&c| !registry.is_native(c)) {
            self.harvest_reference(Some(class), scope);
            if let Some(cdo) = registry.class_default_object(class) {
                for subobject in registry.get_cdo_subobjects(cdo) {
                    self.harvest_reference(Some(subobject), scope.ignoring_dependencies());
                }
            }
        }
    }

    /// Harvests a reference made directly by an export and remembers resulting imports as direct imports
    fn harvest_direct(&mut self, object: Option<ObjectId>, scope: FHarvestScope) {
        let Some(object) = object else {
            return;
        };
        self.harvest_reference(Some(object), scope);
        for realm in scope.realms.realms() {
            let harvested = self.context.harvested_realm_mut(realm);
            if harvested.imports.contains(&object) {
                harvested.direct_imports.insert(object);
            }
        }
    }

    /// Walks the class, outer, template and fields of an export
    fn process_export(&mut self, export: ObjectId, realms: ESaveRealmSet) {
        let registry = self.context.registry;
        let data = registry.get(export);
        let scope = FHarvestScope {
            realms,
            editor_only: false,
            ignore_dependencies: false,
            current_export: Some(export),
        };
        for realm in realms.realms() {
            let harvested = self.context.harvested_realm_mut(realm);
            harvested.names.insert(data.name.clone());
            harvested.export_dependencies.entry(export).or_default();
            harvested.preload_dependencies.entry(export).or_default();
        }

        self.harvest_direct(data.class, scope);
        self.harvest_direct(data.outer, scope);
        self.harvest_direct(data.archetype, scope);
        if registry.is_struct(export) {
            self.harvest_direct(data.super_struct, scope);
        }

        let mut preloads = registry.behavior(export).map(|b| b.preload_dependencies(registry, export)).unwrap_or_default();
        if registry.is_class_default_object(export) {
            preloads.extend(registry.get_cdo_subobjects(export));
        }
        for preload in preloads {
            self.harvest_direct(Some(preload), scope);
            for realm in realms.realms() {
                let harvested = self.context.harvested_realm_mut(realm);
                if harvested.is_included(preload) && preload != export {
                    harvested.preload_dependencies.entry(export).or_default().insert(preload);
                }
            }
        }

        let own_package = self.context.package();
        for reference in &data.references {
            let target = reference.target;
            let target_data = registry.get(target);
            if registry.package_of(target) != own_package && !registry.is_package(target) && !target_data.flags.contains(EObjectFlags::PUBLIC) {
                self.context.record_illegal_reference(export, target, EIllegalRefReason::ReferenceToPrivateObject);
            }
            self.harvest_direct(Some(target), scope.with_editor_only(reference.editor_only));
        }

        let package_name = self.context.package_name().to_string();
        for path in &data.soft_references {
            let referenced_package = package_name_of_path(path);
            let external = compare_ignore_case(referenced_package, &package_name).is_ne();
            for realm in realms.realms() {
                let harvested = self.context.harvested_realm_mut(realm);
                harvested.soft_object_paths.insert(path.clone());
                if external && !is_script_package(referenced_package) {
                    harvested.runtime_dependencies.insert(referenced_package.to_string());
                    harvested.build_dependencies.push(FCookDependency::redirection_target(referenced_package));
                }
            }
        }

        for realm in realms.realms() {
            let harvested = self.context.harvested_realm_mut(realm);
            harvested.names.extend(data.names.iter().cloned());
        }
    }
}

/// Harvests all requested realms of the context's package
pub fn harvest_package(context: &mut FSaveContext) {
    FPackageHarvester::new(context).harvest_package();
}

/// Sorted full names of a realm's imports and exports, the order the linker tables use
pub fn sorted_full_names(context: &FSaveContext, realm: ESaveRealm) -> (Vec<String>, Vec<String>) {
    let registry = context.registry;
    let harvested = context.harvested_realm(realm);
    let sort = |objects: &indexmap::IndexSet<ObjectId>| {
        objects
            .iter()
            .map(|&o| registry.full_name(o))
            .sorted_by(|a, b| compare_ignore_case(a, b).then_with(|| a.cmp(b)))
            .collect::<Vec<_>>()
    };
    (sort(harvested.imports()), sort(harvested.exports()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::object::{EClassFlags, EObjectMark, EPackageFlags, FObjectRegistry, ObjectBehavior};
    use crate::services::FMemoryCookServices;
    use crate::target_platform::FTargetPlatform;
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    struct Fixture {
        registry: FObjectRegistry,
        package: ObjectId,
        actor: ObjectId,
        world: ObjectId,
    }
    fn fixture() -> Fixture {
        let mut registry = FObjectRegistry::new();
        let engine = registry.create_package("/Script/Engine");
        let actor = registry.create_class(engine, "Actor", Some(registry.object_class()), EClassFlags::NATIVE);
        let package = registry.create_package("/Game/Maps/Entry");
        let world = registry.create_object(package, "Entry", actor, EObjectFlags::PUBLIC | EObjectFlags::STANDALONE);
        Fixture { registry, package, actor, world }
    }

    fn names(context: &FSaveContext, objects: &indexmap::IndexSet<ObjectId>) -> Vec<String> {
        let mut names: Vec<String> = objects.iter().map(|&o| context.registry.path_name(o)).collect();
        names.sort();
        names
    }

    #[test]
    fn test_exports_and_imports() -> Result<()> {
        let mut f = fixture();
        let other = f.registry.create_package("/Game/Meshes/Rock");
        let mesh = f.registry.create_object(other, "Rock", f.actor, EObjectFlags::PUBLIC | EObjectFlags::STANDALONE);
        let level = f.registry.create_object(f.world, "PersistentLevel", f.actor, EObjectFlags::empty());
        f.registry.add_reference(f.world, level);
        f.registry.add_reference(level, mesh);
        f.registry.add_soft_reference(level, "/Game/Sounds/Wind.Wind");
        f.registry.add_name(level, "SpawnPoint");

        let env = FMemoryCookServices::default();
        let mut context = FSaveContext::new(&f.registry, env.services(), f.package)?;
        harvest_package(&mut context);

        let game = context.harvested_realm(ESaveRealm::Game);
        assert_eq!(vec!["/Game/Maps/Entry.Entry", "/Game/Maps/Entry.Entry:PersistentLevel"], names(&context, game.exports()));
        assert_eq!(
            vec!["/Game/Meshes/Rock", "/Game/Meshes/Rock.Rock", "/Script/Engine", "/Script/Engine.Actor", "/Script/Engine.Default__Actor"],
            names(&context, game.imports())
        );
        assert!(game.direct_imports().contains(&mesh));
        assert!(game.export_dependencies(level).is_some_and(|d| d.contains(&mesh)));
        assert!(game.names().contains("SpawnPoint"));
        assert!(game.names().contains("/Game/Maps/Entry"));
        assert!(game.soft_object_paths().contains("/Game/Sounds/Wind.Wind"));
        assert!(game.runtime_dependencies().contains("/Game/Sounds/Wind"));
        assert!(game.runtime_dependencies().contains("/Game/Meshes/Rock"));
        assert!(game.build_dependencies().contains(&FCookDependency::package("/Game/Meshes/Rock")));
        assert!(game.build_dependencies().contains(&FCookDependency::native_class("/Script/Engine.Actor")));
        assert!(game.build_dependencies().contains(&FCookDependency::redirection_target("/Game/Sounds/Wind")));
        Ok(())
    }

    #[test]
    fn test_editor_only_reference_scenario() -> Result<()> {
        let mut f = fixture();
        let editor_data = f.registry.create_object(f.world, "EditorData", f.actor, EObjectFlags::empty());
        f.registry.get_mut(editor_data).editor_only = true;
        let plain = f.registry.create_object(f.world, "Plain", f.actor, EObjectFlags::empty());
        f.registry.add_reference(f.world, editor_data);
        f.registry.add_reference(f.world, plain);

        let mut env = FMemoryCookServices::default();
        env.config.save_editor_realm = true;
        let mut context = FSaveContext::new(&f.registry, env.services(), f.package)?;
        harvest_package(&mut context);

        let game = context.harvested_realm(ESaveRealm::Game).exports();
        assert!(game.contains(&plain));
        assert!(!game.contains(&editor_data));
        let editor = context.harvested_realm(ESaveRealm::Editor).exports();
        assert!(editor.contains(&plain));
        assert!(editor.contains(&editor_data));
        Ok(())
    }

    #[test]
    fn test_editor_only_property_reference() -> Result<()> {
        let mut f = fixture();
        let thumbnail = f.registry.create_object(f.world, "Thumbnail", f.actor, EObjectFlags::empty());
        f.registry.add_editor_only_reference(f.world, thumbnail);

        let mut env = FMemoryCookServices::default();
        env.config.save_editor_realm = true;
        let mut context = FSaveContext::new(&f.registry, env.services(), f.package)?;
        harvest_package(&mut context);
        assert!(!context.harvested_realm(ESaveRealm::Game).exports().contains(&thumbnail));
        assert!(context.harvested_realm(ESaveRealm::Editor).exports().contains(&thumbnail));
        drop(context);

        // uncooked saves keep everything in the game realm
        env.target_platform = None;
        let mut context = FSaveContext::new(&f.registry, env.services(), f.package)?;
        harvest_package(&mut context);
        assert!(context.harvested_realm(ESaveRealm::Game).exports().contains(&thumbnail));
        Ok(())
    }

    #[test]
    fn test_excluded_outer_is_in_no_realm() -> Result<()> {
        let mut f = fixture();
        let server = f.registry.create_object(f.world, "ServerLogic", f.actor, EObjectFlags::empty());
        f.registry.get_mut(server).marks = EObjectMark::NOT_FOR_CLIENT;
        let inner = f.registry.create_object(server, "Component", f.actor, EObjectFlags::empty());
        // reachable both through the outer and directly
        f.registry.add_reference(f.world, server);
        f.registry.add_reference(f.world, inner);

        let mut env = FMemoryCookServices::default();
        env.target_platform = Some(FTargetPlatform::client("WindowsClient"));
        env.config.save_editor_realm = true;
        let mut context = FSaveContext::new(&f.registry, env.services(), f.package)?;
        harvest_package(&mut context);

        for realm in [ESaveRealm::Game, ESaveRealm::Optional] {
            let harvested = context.harvested_realm(realm);
            assert!(!harvested.is_included(server));
            assert!(!harvested.is_included(inner));
        }
        // the editor realm only rejects objects no platform wants
        assert!(context.harvested_realm(ESaveRealm::Editor).exports().contains(&inner));
        Ok(())
    }

    #[test]
    fn test_unsaveable_objects_are_excluded() -> Result<()> {
        let mut f = fixture();
        let scratch = f.registry.create_object(f.world, "Scratch", f.actor, EObjectFlags::TRANSIENT);
        let child = f.registry.create_object(scratch, "Child", f.actor, EObjectFlags::empty());
        f.registry.add_reference(f.world, child);

        let env = FMemoryCookServices::default();
        let mut context = FSaveContext::new(&f.registry, env.services(), f.package)?;
        harvest_package(&mut context);
        let game = context.harvested_realm(ESaveRealm::Game);
        assert!(game.excluded().contains(&child));
        assert!(!game.is_included(child));
        assert!(!game.is_included(scratch));
        Ok(())
    }

    #[test]
    fn test_optional_reference_is_rerouted() -> Result<()> {
        let mut f = fixture();
        let game_classes = f.registry.create_package("/Game/Classes");
        let optional_class = f.registry.create_class(game_classes, "HighResData", Some(f.actor), EClassFlags::OPTIONAL);
        let high_res = f.registry.create_object(f.world, "HighRes", optional_class, EObjectFlags::empty());
        f.registry.add_reference(f.world, high_res);

        let env = FMemoryCookServices::default();
        let mut context = FSaveContext::new(&f.registry, env.services(), f.package)?;
        harvest_package(&mut context);

        assert!(!context.harvested_realm(ESaveRealm::Game).is_included(high_res));
        let optional = context.harvested_realm(ESaveRealm::Optional);
        assert!(optional.exports().contains(&high_res));
        // the optional export refers back to its outer in the main package
        assert!(optional.imports().contains(&f.world));
        assert_eq!(1, context.illegal_references().len());
        assert_eq!(EIllegalRefReason::ReferenceToOptional, context.illegal_references()[0].reason);
        Ok(())
    }

    #[test]
    fn test_optional_objects_stay_in_game_when_not_cooking() -> Result<()> {
        let mut f = fixture();
        let game_classes = f.registry.create_package("/Game/Classes");
        let optional_class = f.registry.create_class(game_classes, "HighResData", Some(f.actor), EClassFlags::OPTIONAL);
        let high_res = f.registry.create_object(f.world, "HighRes", optional_class, EObjectFlags::empty());
        f.registry.add_reference(f.world, high_res);
        let optional_root = f.registry.create_object(f.package, "OptionalRoot", optional_class, EObjectFlags::PUBLIC);

        let mut env = FMemoryCookServices::default();
        env.target_platform = None;
        let mut context = FSaveContext::new(&f.registry, env.services(), f.package)?;
        harvest_package(&mut context);

        let game = context.harvested_realm(ESaveRealm::Game);
        assert!(game.exports().contains(&high_res));
        assert!(game.exports().contains(&optional_root));
        assert!(!game.imports().contains(&high_res));
        assert!(!game.imports().contains(&optional_root));
        assert!(context.harvested_realm(ESaveRealm::Optional).exports().is_empty());
        assert!(context.illegal_references().is_empty());
        Ok(())
    }

    #[test]
    fn test_private_import_is_reported() -> Result<()> {
        let mut f = fixture();
        let other = f.registry.create_package("/Game/Other");
        let private = f.registry.create_object(other, "Hidden", f.actor, EObjectFlags::empty());
        f.registry.add_reference(f.world, private);

        let env = FMemoryCookServices::default();
        let mut context = FSaveContext::new(&f.registry, env.services(), f.package)?;
        harvest_package(&mut context);
        assert!(context.harvested_realm(ESaveRealm::Game).imports().contains(&private));
        assert_eq!(EIllegalRefReason::ReferenceToPrivateObject, context.illegal_references()[0].reason);
        Ok(())
    }

    struct Preloads(ObjectId);
    impl ObjectBehavior for Preloads {
        fn preload_dependencies(&self, _registry: &FObjectRegistry, _object: ObjectId) -> Vec<ObjectId> {
            vec![self.0]
        }
    }

    #[test]
    fn test_preload_dependencies_and_prestream() -> Result<()> {
        let mut f = fixture();
        let shared = f.registry.create_package("/Game/Shared/Textures");
        let marker = f.registry.create_object(shared, "Prestream", f.registry.prestream_package_class(), EObjectFlags::PUBLIC);
        let material = f.registry.create_object(f.package, "Material", f.actor, EObjectFlags::PUBLIC);
        let game_classes = f.registry.create_package("/Game/Classes");
        let loader = f.registry.create_class(game_classes, "Loader", Some(f.actor), EClassFlags::empty());
        let user = f.registry.create_object(f.package, "User", loader, EObjectFlags::PUBLIC);
        f.registry.register_behavior(loader, Arc::new(Preloads(material)));
        f.registry.add_reference(user, marker);

        let env = FMemoryCookServices::default();
        let mut context = FSaveContext::new(&f.registry, env.services(), f.package)?;
        harvest_package(&mut context);

        let game = context.harvested_realm(ESaveRealm::Game);
        assert!(game.preload_dependencies(user).is_some_and(|p| p.contains(&material)));
        assert!(game.prestream_packages().contains("/Game/Shared/Textures"));
        assert!(!game.is_included(marker));
        // blueprint classes are imported together with their package
        assert!(game.imports().contains(&loader));
        assert!(game.imports().contains(&game_classes));
        Ok(())
    }

    #[test]
    fn test_cycles_terminate() -> Result<()> {
        let mut f = fixture();
        let a = f.registry.create_object(f.world, "A", f.actor, EObjectFlags::empty());
        let b = f.registry.create_object(f.world, "B", f.actor, EObjectFlags::empty());
        f.registry.add_reference(f.world, a);
        f.registry.add_reference(a, b);
        f.registry.add_reference(b, a);
        f.registry.add_reference(b, f.world);

        let env = FMemoryCookServices::default();
        let mut context = FSaveContext::new(&f.registry, env.services(), f.package)?;
        harvest_package(&mut context);
        let game = context.harvested_realm(ESaveRealm::Game);
        assert_eq!(3, game.exports().len());
        assert!(game.export_dependencies(b).is_some_and(|d| d.contains(&a) && d.contains(&f.world)));
        Ok(())
    }

    #[test]
    fn test_harvest_is_deterministic() -> Result<()> {
        let mut f = fixture();
        let other = f.registry.create_package("/Game/Meshes/Rock");
        for i in 0..8 {
            let mesh = f.registry.create_object(other, &format!("Rock_{i}"), f.actor, EObjectFlags::PUBLIC);
            let component = f.registry.create_object(f.world, &format!("Component_{i}"), f.actor, EObjectFlags::empty());
            f.registry.add_reference(f.world, component);
            f.registry.add_reference(component, mesh);
        }
        let editor_package = f.registry.create_package("/Game/Editor");
        f.registry.get_mut(editor_package).package_flags |= EPackageFlags::EDITOR_ONLY;

        let env = FMemoryCookServices::default();
        let mut first = FSaveContext::new(&f.registry, env.services(), f.package)?;
        harvest_package(&mut first);
        let mut second = FSaveContext::new(&f.registry, env.services(), f.package)?;
        harvest_package(&mut second);
        for realm in ESaveRealm::ALL {
            assert_eq!(sorted_full_names(&first, realm), sorted_full_names(&second, realm));
        }
        let (imports, exports) = sorted_full_names(&first, ESaveRealm::Game);
        assert_eq!(9, exports.len());
        assert_eq!("Actor /Game/Maps/Entry.Entry", exports[0]);
        assert!(imports.contains(&"Actor /Game/Meshes/Rock.Rock_7".to_string()));
        Ok(())
    }
}
