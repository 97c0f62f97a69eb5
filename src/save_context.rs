use std::collections::HashMap;

use anyhow::{Result, bail};
use bitflags::bitflags;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use strum::{FromRepr, IntoStaticStr};

use crate::cook_dependency::FCookDependency;
use crate::object::{EClassFlags, EObjectFlags, EObjectMark, EPackageFlags, FObjectRegistry, ObjectId};
use crate::services::FCookServices;
use crate::target_platform::get_excluded_object_marks_for_target_platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, FromRepr, IntoStaticStr, Serialize, Deserialize)]
#[repr(u8)]
pub enum ESaveRealm {
    Game = 0,
    Optional = 1,
    Editor = 2,
}
impl ESaveRealm {
    pub const ALL: [ESaveRealm; 3] = [ESaveRealm::Game, ESaveRealm::Optional, ESaveRealm::Editor];

    pub fn set(self) -> ESaveRealmSet {
        ESaveRealmSet::from_bits_retain(1 << self as u8)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ESaveRealmSet : u8 {
        const GAME = 1 << ESaveRealm::Game as u8;
        const OPTIONAL = 1 << ESaveRealm::Optional as u8;
        const EDITOR = 1 << ESaveRealm::Editor as u8;
    }
}
impl ESaveRealmSet {
    pub fn realms(self) -> impl Iterator<Item = ESaveRealm> {
        ESaveRealm::ALL.into_iter().filter(move |r| self.contains(r.set()))
    }
}

/// Memoized exclusion decision of one object in one realm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EExclusionState {
    /// Being decided further up the stack; answered as provisionally not excluded to break cycles
    InProgress,
    Excluded,
    NotExcluded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, Serialize)]
pub enum ESaveableStatus {
    Success,
    PendingKill,
    TransientFlag,
    TransientOverride,
    AbstractClass,
    DeprecatedClass,
    NewerVersionExistsClass,
    OuterUnsaveable,
    ClassUnsaveable,
    ExcludedByPlatform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EIllegalRefReason {
    ReferenceToOptional,
    ReferenceToPrivateObject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FIllegalReference {
    pub from: String,
    pub to: String,
    pub reason: EIllegalRefReason,
}

/// Per-object results cached for the duration of a save
#[derive(Debug, Clone, Copy, Default)]
pub struct FObjectStatus {
    pub saveable: Option<ESaveableStatus>,
    pub editor_only: Option<bool>,
}

/// Everything harvested for one realm
#[derive(Debug, Default)]
pub struct FHarvestedRealm {
    pub(crate) exports: IndexSet<ObjectId>,
    pub(crate) imports: IndexSet<ObjectId>,
    pub(crate) direct_imports: IndexSet<ObjectId>,
    pub(crate) excluded: IndexSet<ObjectId>,
    pub(crate) exclusion: HashMap<ObjectId, EExclusionState>,
    /// Objects each export references, for the preload dependency table
    pub(crate) export_dependencies: IndexMap<ObjectId, IndexSet<ObjectId>>,
    /// Objects that must be created before each export is deserialized
    pub(crate) preload_dependencies: IndexMap<ObjectId, IndexSet<ObjectId>>,
    pub(crate) names: IndexSet<String>,
    pub(crate) soft_object_paths: IndexSet<String>,
    pub(crate) prestream_packages: IndexSet<String>,
    pub(crate) build_dependencies: Vec<FCookDependency>,
    pub(crate) runtime_dependencies: IndexSet<String>,
}
impl FHarvestedRealm {
    pub fn exports(&self) -> &IndexSet<ObjectId> {
        &self.exports
    }
    pub fn imports(&self) -> &IndexSet<ObjectId> {
        &self.imports
    }
    pub fn direct_imports(&self) -> &IndexSet<ObjectId> {
        &self.direct_imports
    }
    pub fn excluded(&self) -> &IndexSet<ObjectId> {
        &self.excluded
    }
    pub fn names(&self) -> &IndexSet<String> {
        &self.names
    }
    pub fn soft_object_paths(&self) -> &IndexSet<String> {
        &self.soft_object_paths
    }
    pub fn prestream_packages(&self) -> &IndexSet<String> {
        &self.prestream_packages
    }
    pub fn build_dependencies(&self) -> &[FCookDependency] {
        &self.build_dependencies
    }
    pub fn runtime_dependencies(&self) -> &IndexSet<String> {
        &self.runtime_dependencies
    }
    pub fn export_dependencies(&self, export: ObjectId) -> Option<&IndexSet<ObjectId>> {
        self.export_dependencies.get(&export)
    }
    pub fn preload_dependencies(&self, export: ObjectId) -> Option<&IndexSet<ObjectId>> {
        self.preload_dependencies.get(&export)
    }
    pub fn is_included(&self, object: ObjectId) -> bool {
        self.exports.contains(&object) || self.imports.contains(&object)
    }
    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}

/// State of one package save. Owns the harvested realms and the object status cache; never owns objects.
pub struct FSaveContext<'a> {
    pub registry: &'a FObjectRegistry,
    pub services: FCookServices<'a>,
    package: ObjectId,
    package_name: String,
    realms: [FHarvestedRealm; 3],
    requested_realms: ESaveRealmSet,
    excluded_marks: [EObjectMark; 3],
    object_status: HashMap<ObjectId, FObjectStatus>,
    illegal_references: Vec<FIllegalReference>,
}

impl<'a> FSaveContext<'a> {
    pub fn new(registry: &'a FObjectRegistry, services: FCookServices<'a>, package: ObjectId) -> Result<Self> {
        if !registry.is_package(package) {
            bail!("{} is not a package", registry.path_name(package));
        }
        let cooking = services.is_cooking();
        let mut requested_realms = ESaveRealmSet::GAME;
        if cooking && services.config.save_optional_realm {
            requested_realms |= ESaveRealmSet::OPTIONAL;
        }
        if cooking && services.config.save_editor_realm {
            requested_realms |= ESaveRealmSet::EDITOR;
        }
        let platform_marks = get_excluded_object_marks_for_target_platform(services.target_platform);
        Ok(Self {
            registry,
            services,
            package,
            package_name: registry.get(package).name.clone(),
            realms: Default::default(),
            requested_realms,
            excluded_marks: [platform_marks, platform_marks, EObjectMark::NOT_FOR_TARGET_PLATFORM],
            object_status: HashMap::new(),
            illegal_references: vec![],
        })
    }

    pub fn package(&self) -> ObjectId {
        self.package
    }
    pub fn package_name(&self) -> &str {
        &self.package_name
    }
    pub fn is_cooking(&self) -> bool {
        self.services.is_cooking()
    }
    pub fn requested_realms(&self) -> ESaveRealmSet {
        self.requested_realms
    }
    pub fn excluded_object_marks(&self, realm: ESaveRealm) -> EObjectMark {
        self.excluded_marks[realm as usize]
    }
    pub fn harvested_realm(&self, realm: ESaveRealm) -> &FHarvestedRealm {
        &self.realms[realm as usize]
    }
    pub fn harvested_realm_mut(&mut self, realm: ESaveRealm) -> &mut FHarvestedRealm {
        &mut self.realms[realm as usize]
    }
    pub fn illegal_references(&self) -> &[FIllegalReference] {
        &self.illegal_references
    }
    pub fn record_illegal_reference(&mut self, from: ObjectId, to: ObjectId, reason: EIllegalRefReason) {
        let reference = FIllegalReference {
            from: self.registry.full_name(from),
            to: self.registry.full_name(to),
            reason,
        };
        if !self.illegal_references.contains(&reference) {
            self.illegal_references.push(reference);
        }
    }

    /// Whether the Game realm keeps editor-only objects. False only when cooking for a platform that
    /// disallows editor objects and stripping is enabled.
    pub fn game_realm_tracks_editor_only(&self) -> bool {
        match self.services.target_platform {
            None => true,
            Some(platform) => platform.allows_editor_objects() || !self.services.config.can_strip_editor_only_imports_and_exports,
        }
    }

    /// Editor-only objects: the object's own flag (ignored for CDOs), an editor-only package, or for
    /// non-native objects an editor-only outer, super struct, class or archetype
    pub fn is_editor_only_object(&mut self, object: ObjectId) -> bool {
        if let Some(editor_only) = self.object_status.get(&object).and_then(|s| s.editor_only) {
            return editor_only;
        }
        // provisional answer for cycles through archetypes
        self.object_status.entry(object).or_default().editor_only = Some(false);
        let editor_only = self.compute_editor_only(object);
        self.object_status.entry(object).or_default().editor_only = Some(editor_only);
        editor_only
    }

    fn compute_editor_only(&mut self, object: ObjectId) -> bool {
        let registry = self.registry;
        let data = registry.get(object);
        if !registry.is_class_default_object(object) && (data.editor_only || data.marks.contains(EObjectMark::EDITOR_ONLY)) {
            return true;
        }
        let package = registry.package_of(object);
        if registry.get(package).package_flags.contains(EPackageFlags::EDITOR_ONLY) {
            return true;
        }
        if registry.is_package(object) || registry.is_native(object) {
            return false;
        }
        if let Some(outer) = data.outer {
            if outer != package && self.is_editor_only_object(outer) {
                return true;
            }
        }
        if registry.is_struct(object) {
            data.super_struct.is_some_and(|s| self.is_editor_only_object(s))
        } else {
            data.class.is_some_and(|c| self.is_editor_only_object(c)) || data.archetype.is_some_and(|a| self.is_editor_only_object(a))
        }
    }

    /// Saveable status ignoring the platform. Cached per object.
    fn base_saveable_status(&mut self, object: ObjectId) -> ESaveableStatus {
        if let Some(status) = self.object_status.get(&object).and_then(|s| s.saveable) {
            return status;
        }
        // the core package and its classes refer to each other
        self.object_status.entry(object).or_default().saveable = Some(ESaveableStatus::Success);
        let status = self.compute_saveable_status(object);
        self.object_status.entry(object).or_default().saveable = Some(status);
        status
    }

    fn compute_saveable_status(&mut self, object: ObjectId) -> ESaveableStatus {
        let registry = self.registry;
        let data = registry.get(object);
        if data.flags.contains(EObjectFlags::MIRRORED_GARBAGE) {
            return ESaveableStatus::PendingKill;
        }
        if data.flags.contains(EObjectFlags::TRANSIENT) {
            return ESaveableStatus::TransientFlag;
        }
        if registry.behavior(object).is_some_and(|b| !b.is_saveable(registry, object)) {
            return ESaveableStatus::TransientOverride;
        }
        let is_template = data.flags.intersects(EObjectFlags::CLASS_DEFAULT_OBJECT | EObjectFlags::ARCHETYPE_OBJECT);
        if let Some(class) = data.class {
            let class_flags = registry.get(class).class_flags;
            if class_flags.contains(EClassFlags::ABSTRACT) && !is_template {
                return ESaveableStatus::AbstractClass;
            }
            if class_flags.contains(EClassFlags::DEPRECATED) && !is_template {
                return ESaveableStatus::DeprecatedClass;
            }
            if class_flags.contains(EClassFlags::NEWER_VERSION_EXISTS) {
                return ESaveableStatus::NewerVersionExistsClass;
            }
        }
        if let Some(outer) = data.outer {
            if self.base_saveable_status(outer) != ESaveableStatus::Success {
                return ESaveableStatus::OuterUnsaveable;
            }
        }
        if let Some(class) = data.class {
            if class != object && self.base_saveable_status(class) != ESaveableStatus::Success {
                return ESaveableStatus::ClassUnsaveable;
            }
        }
        ESaveableStatus::Success
    }

    /// Full saveable status of an export candidate in a realm
    pub fn get_saveable_status(&mut self, object: ObjectId, realm: ESaveRealm) -> ESaveableStatus {
        let status = self.base_saveable_status(object);
        if status == ESaveableStatus::Success && self.conditionally_exclude_object_for_realm(object, realm) {
            return ESaveableStatus::ExcludedByPlatform;
        }
        status
    }

    /// True when the object must not be saved in the realm: it carries an excluded mark, or its class, outer,
    /// super struct or archetype is excluded. Decisions are memoized per realm.
    pub fn conditionally_exclude_object_for_realm(&mut self, object: ObjectId, realm: ESaveRealm) -> bool {
        let mut stack = vec![];
        self.exclude_for_realm(object, realm, &mut stack).0
    }

    /// Returns the decision and the lowest stack position of an undecided object it relied on. A "not excluded"
    /// answer that relied on an object further up the stack is provisional and not memoized.
    fn exclude_for_realm(&mut self, object: ObjectId, realm: ESaveRealm, stack: &mut Vec<ObjectId>) -> (bool, usize) {
        match self.realms[realm as usize].exclusion.get(&object) {
            Some(EExclusionState::Excluded) => return (true, usize::MAX),
            Some(EExclusionState::NotExcluded) => return (false, usize::MAX),
            Some(EExclusionState::InProgress) => return (false, stack.iter().position(|&o| o == object).unwrap_or(0)),
            None => {}
        }
        let depth = stack.len();
        stack.push(object);
        self.realms[realm as usize].exclusion.insert(object, EExclusionState::InProgress);

        let registry = self.registry;
        let data = registry.get(object);
        let excluded_marks = self.excluded_marks[realm as usize];
        let mut marks = data.marks;
        if excluded_marks.contains(EObjectMark::EDITOR_ONLY) && !self.game_realm_tracks_editor_only() && self.is_editor_only_object(object) {
            marks |= EObjectMark::EDITOR_ONLY;
        }
        let mut excluded = marks.intersects(excluded_marks);
        let mut relies_on = usize::MAX;
        if !excluded {
            for other in [data.class, data.outer, data.super_struct, data.archetype].into_iter().flatten().filter(|&o| o != object) {
                let (other_excluded, other_relies_on) = self.exclude_for_realm(other, realm, stack);
                relies_on = relies_on.min(other_relies_on);
                if other_excluded {
                    excluded = true;
                    break;
                }
            }
        }
        stack.pop();

        let exclusion = &mut self.realms[realm as usize].exclusion;
        if excluded {
            exclusion.insert(object, EExclusionState::Excluded);
            (true, usize::MAX)
        } else if relies_on >= depth {
            exclusion.insert(object, EExclusionState::NotExcluded);
            (false, usize::MAX)
        } else {
            exclusion.remove(&object);
            (false, relies_on)
        }
    }

    /// Objects of this package are exported. When cooking, optional objects go only into the Optional realm.
    pub fn is_export_candidate(&self, object: ObjectId, realm: ESaveRealm) -> bool {
        if self.registry.package_of(object) != self.package || object == self.package {
            return false;
        }
        let optional = self.registry.is_optional(object);
        match realm {
            ESaveRealm::Game => !optional || !self.is_cooking(),
            ESaveRealm::Optional => optional && self.is_cooking(),
            ESaveRealm::Editor => true,
        }
    }
}
