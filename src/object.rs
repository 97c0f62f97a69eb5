use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use bitflags::bitflags;

use crate::package_artifacts::FCookEventContext;

pub const CORE_OBJECT_PACKAGE_NAME: &str = "/Script/CoreUObject";
pub const OBJECT_CLASS_NAME: &str = "Object";
pub const CLASS_CLASS_NAME: &str = "Class";
pub const PACKAGE_CLASS_NAME: &str = "Package";
pub const PRESTREAM_PACKAGE_CLASS_NAME: &str = "PrestreamPackage";
pub const DEFAULT_OBJECT_PREFIX: &str = "Default__";

/// Handle of an object inside a `FObjectRegistry`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);
impl ObjectId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EObjectFlags : u32 {
        const PUBLIC = 0x00000001;
        const STANDALONE = 0x00000002;
        const TRANSIENT = 0x00000040;
        const CLASS_DEFAULT_OBJECT = 0x00000010;
        const ARCHETYPE_OBJECT = 0x00000020;
        const DEFAULT_SUB_OBJECT = 0x00040000;
        const MIRRORED_GARBAGE = 0x40000000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EClassFlags : u32 {
        const ABSTRACT = 0x00000001;
        const OPTIONAL = 0x00004000;
        const NATIVE = 0x00000080;
        const DEPRECATED = 0x02000000;
        const NEWER_VERSION_EXISTS = 0x80000000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EObjectMark : u32 {
        const NOT_FOR_CLIENT = 0x00000002;
        const NOT_FOR_SERVER = 0x00000004;
        const NOT_FOR_TARGET_PLATFORM = 0x00000010;
        const EDITOR_ONLY = 0x00000040;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EPackageFlags : u32 {
        const EDITOR_ONLY = 0x00000040;
        const COMPILED_IN = 0x00000010;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EObjectKind {
    Package,
    Class,
    Object,
}

/// A hard reference held by one of the object's properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FObjectReference {
    pub target: ObjectId,
    /// Property is editor-only data
    pub editor_only: bool,
}

#[derive(Debug, Clone)]
pub struct FObjectData {
    pub name: String,
    pub kind: EObjectKind,
    pub outer: Option<ObjectId>,
    pub class: Option<ObjectId>,
    pub archetype: Option<ObjectId>,
    pub super_struct: Option<ObjectId>,
    pub default_object: Option<ObjectId>,
    pub flags: EObjectFlags,
    pub class_flags: EClassFlags,
    pub package_flags: EPackageFlags,
    pub marks: EObjectMark,
    /// Result of the object's own editor-only query
    pub editor_only: bool,
    pub references: Vec<FObjectReference>,
    /// Soft object paths serialized by the object's properties
    pub soft_references: Vec<String>,
    pub names: Vec<String>,
    inners: Vec<ObjectId>,
}
impl FObjectData {
    fn new(name: &str, kind: EObjectKind, outer: Option<ObjectId>, class: Option<ObjectId>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            outer,
            class,
            archetype: None,
            super_struct: None,
            default_object: None,
            flags: EObjectFlags::empty(),
            class_flags: EClassFlags::empty(),
            package_flags: EPackageFlags::empty(),
            marks: EObjectMark::empty(),
            editor_only: false,
            references: vec![],
            soft_references: vec![],
            names: vec![],
            inners: vec![],
        }
    }
}

/// Per-class capabilities queried by the save. Looked up through the class hierarchy.
pub trait ObjectBehavior: Send + Sync {
    /// False marks the object as transient for saving even without the transient flag
    fn is_saveable(&self, _registry: &FObjectRegistry, _object: ObjectId) -> bool {
        true
    }
    /// Objects that must be loaded before this export can be deserialized
    fn preload_dependencies(&self, _registry: &FObjectRegistry, _object: ObjectId) -> Vec<ObjectId> {
        vec![]
    }
    /// Called for every export before harvesting when cooking
    fn on_cook_event(&self, _registry: &FObjectRegistry, _object: ObjectId, _context: &mut FCookEventContext) {}
}

/// Object graph of the in-memory session. Objects are never destroyed, garbage is flagged instead.
pub struct FObjectRegistry {
    objects: Vec<FObjectData>,
    behaviors: HashMap<ObjectId, Arc<dyn ObjectBehavior>>,
    core_package: ObjectId,
    object_class: ObjectId,
    class_class: ObjectId,
    package_class: ObjectId,
    prestream_package_class: ObjectId,
    saving: AtomicBool,
}

impl Default for FObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FObjectRegistry {
    pub fn new() -> Self {
        let placeholder = ObjectId(0);
        let mut registry = Self {
            objects: vec![],
            behaviors: HashMap::new(),
            core_package: placeholder,
            object_class: placeholder,
            class_class: placeholder,
            package_class: placeholder,
            prestream_package_class: placeholder,
            saving: AtomicBool::new(false),
        };

        // bootstrap the self-referencing core classes, then patch up their class pointers
        let core = registry.push(FObjectData::new(CORE_OBJECT_PACKAGE_NAME, EObjectKind::Package, None, None));
        registry.get_mut(core).package_flags = EPackageFlags::COMPILED_IN;
        registry.core_package = core;
        let object_class = registry.create_class(core, OBJECT_CLASS_NAME, None, EClassFlags::NATIVE);
        let class_class = registry.create_class(core, CLASS_CLASS_NAME, Some(object_class), EClassFlags::NATIVE);
        for class in [object_class, class_class] {
            registry.get_mut(class).class = Some(class_class);
        }
        registry.object_class = object_class;
        registry.class_class = class_class;
        let package_class = registry.create_class(core, PACKAGE_CLASS_NAME, Some(object_class), EClassFlags::NATIVE);
        registry.get_mut(core).class = Some(package_class);
        registry.package_class = package_class;
        registry.prestream_package_class = registry.create_class(core, PRESTREAM_PACKAGE_CLASS_NAME, Some(object_class), EClassFlags::NATIVE);
        registry
    }

    fn push(&mut self, data: FObjectData) -> ObjectId {
        let id = ObjectId(self.objects.len() as u32);
        if let Some(outer) = data.outer {
            self.objects[outer.index()].inners.push(id);
        }
        self.objects.push(data);
        id
    }

    pub fn core_package(&self) -> ObjectId {
        self.core_package
    }
    pub fn object_class(&self) -> ObjectId {
        self.object_class
    }
    pub fn class_class(&self) -> ObjectId {
        self.class_class
    }
    pub fn package_class(&self) -> ObjectId {
        self.package_class
    }
    pub fn prestream_package_class(&self) -> ObjectId {
        self.prestream_package_class
    }

    /// Creates a package. Packages under /Script are compiled in.
    pub fn create_package(&mut self, name: &str) -> ObjectId {
        let id = self.push(FObjectData::new(name, EObjectKind::Package, None, Some(self.package_class)));
        if crate::is_script_package(name) {
            self.get_mut(id).package_flags |= EPackageFlags::COMPILED_IN;
        }
        id
    }

    /// Creates a class and its class default object. The CDO's archetype is the super class's CDO.
    pub fn create_class(&mut self, outer: ObjectId, name: &str, super_class: Option<ObjectId>, class_flags: EClassFlags) -> ObjectId {
        let mut data = FObjectData::new(name, EObjectKind::Class, Some(outer), Some(self.class_class));
        data.flags = EObjectFlags::PUBLIC;
        data.class_flags = class_flags;
        data.super_struct = super_class;
        let class = self.push(data);

        let mut cdo = FObjectData::new(&format!("{DEFAULT_OBJECT_PREFIX}{name}"), EObjectKind::Object, Some(outer), Some(class));
        cdo.flags = EObjectFlags::PUBLIC | EObjectFlags::CLASS_DEFAULT_OBJECT | EObjectFlags::ARCHETYPE_OBJECT;
        cdo.archetype = super_class.and_then(|s| self.get(s).default_object);
        let cdo = self.push(cdo);
        self.get_mut(class).default_object = Some(cdo);
        class
    }

    /// Creates a plain object. Its archetype is the class default object.
    pub fn create_object(&mut self, outer: ObjectId, name: &str, class: ObjectId, flags: EObjectFlags) -> ObjectId {
        let mut data = FObjectData::new(name, EObjectKind::Object, Some(outer), Some(class));
        data.flags = flags;
        data.archetype = self.get(class).default_object;
        self.push(data)
    }

    pub fn get(&self, id: ObjectId) -> &FObjectData {
        &self.objects[id.index()]
    }
    pub fn get_mut(&mut self, id: ObjectId) -> &mut FObjectData {
        &mut self.objects[id.index()]
    }
    pub fn len(&self) -> usize {
        self.objects.len()
    }
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn add_reference(&mut self, from: ObjectId, to: ObjectId) {
        self.get_mut(from).references.push(FObjectReference { target: to, editor_only: false });
    }
    pub fn add_editor_only_reference(&mut self, from: ObjectId, to: ObjectId) {
        self.get_mut(from).references.push(FObjectReference { target: to, editor_only: true });
    }
    pub fn add_soft_reference(&mut self, from: ObjectId, path: &str) {
        self.get_mut(from).soft_references.push(path.to_string());
    }
    pub fn add_name(&mut self, from: ObjectId, name: &str) {
        self.get_mut(from).names.push(name.to_string());
    }

    pub fn register_behavior(&mut self, class: ObjectId, behavior: Arc<dyn ObjectBehavior>) {
        self.behaviors.insert(class, behavior);
    }
    /// Behavior of the object's class or its nearest super class that has one
    pub fn behavior(&self, object: ObjectId) -> Option<&dyn ObjectBehavior> {
        let mut class = self.get(object).class;
        while let Some(c) = class {
            if let Some(behavior) = self.behaviors.get(&c) {
                return Some(behavior.as_ref());
            }
            class = self.get(c).super_struct;
        }
        None
    }

    pub fn objects_with_outer(&self, outer: ObjectId) -> &[ObjectId] {
        &self.get(outer).inners
    }

    /// Outermost object, the package the object lives in
    pub fn package_of(&self, mut object: ObjectId) -> ObjectId {
        while let Some(outer) = self.get(object).outer {
            object = outer;
        }
        object
    }
    pub fn is_package(&self, object: ObjectId) -> bool {
        self.get(object).kind == EObjectKind::Package
    }
    pub fn is_struct(&self, object: ObjectId) -> bool {
        self.get(object).kind == EObjectKind::Class
    }
    pub fn is_native(&self, object: ObjectId) -> bool {
        let package = self.package_of(object);
        self.get(package).package_flags.contains(EPackageFlags::COMPILED_IN)
    }
    pub fn is_class_default_object(&self, object: ObjectId) -> bool {
        self.get(object).flags.contains(EObjectFlags::CLASS_DEFAULT_OBJECT)
    }
    pub fn is_a(&self, object: ObjectId, class: ObjectId) -> bool {
        let mut current = self.get(object).class;
        while let Some(c) = current {
            if c == class {
                return true;
            }
            current = self.get(c).super_struct;
        }
        false
    }
    pub fn class_default_object(&self, class: ObjectId) -> Option<ObjectId> {
        self.get(class).default_object
    }

    /// Optional objects belong to the optional realm only: instances of optional classes and everything inside them
    pub fn is_optional(&self, object: ObjectId) -> bool {
        let mut current = Some(object);
        while let Some(o) = current {
            if self.get(o).class.is_some_and(|c| self.get(c).class_flags.contains(EClassFlags::OPTIONAL)) {
                return true;
            }
            current = self.get(o).outer;
        }
        false
    }

    pub fn path_name(&self, object: ObjectId) -> String {
        let data = self.get(object);
        match data.outer {
            None => data.name.clone(),
            Some(outer) => {
                let outer_data = self.get(outer);
                let separator = match outer_data.outer {
                    Some(outer_outer) if outer_data.kind != EObjectKind::Package && self.is_package(outer_outer) => ':',
                    _ => '.',
                };
                format!("{}{separator}{}", self.path_name(outer), data.name)
            }
        }
    }
    /// "ClassName /Package/Path.Object"
    pub fn full_name(&self, object: ObjectId) -> String {
        let class_name = self.get(object).class.map(|c| self.get(c).name.as_str()).unwrap_or("None");
        format!("{class_name} {}", self.path_name(object))
    }
    pub fn find_object(&self, path: &str) -> Option<ObjectId> {
        (0..self.objects.len() as u32).map(ObjectId).find(|&id| crate::compare_ignore_case(&self.path_name(id), path).is_eq())
    }
    pub fn find_package(&self, name: &str) -> Option<ObjectId> {
        (0..self.objects.len() as u32)
            .map(ObjectId)
            .find(|&id| self.is_package(id) && crate::compare_ignore_case(&self.get(id).name, name).is_eq())
    }

    /// Default subobject templates nested inside the CDO or its class, breadth first
    pub fn get_cdo_subobjects(&self, cdo: ObjectId) -> Vec<ObjectId> {
        let mut subobjects = vec![];
        let mut next: VecDeque<ObjectId> = VecDeque::new();
        if let Some(class) = self.get(cdo).class {
            next.extend(self.objects_with_outer(class));
        }
        next.extend(self.objects_with_outer(cdo));

        // only objects with a full subobject chain, some nested objects are flagged wrong
        while let Some(sub) = next.pop_front() {
            if self.get(sub).flags.intersects(EObjectFlags::DEFAULT_SUB_OBJECT | EObjectFlags::ARCHETYPE_OBJECT) {
                subobjects.push(sub);
                next.extend(self.objects_with_outer(sub));
            }
        }
        subobjects
    }

    /// Sets the saving flag for the duration of one save. Nested saves are refused.
    pub fn begin_save(&self) -> Result<FScopedSavingFlag<'_>> {
        if self.saving.swap(true, Ordering::AcqRel) {
            bail!("a package save is already in progress");
        }
        Ok(FScopedSavingFlag { flag: &self.saving })
    }
    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::Acquire)
    }
}

pub struct FScopedSavingFlag<'a> {
    flag: &'a AtomicBool,
}
impl Drop for FScopedSavingFlag<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_path_names() {
        let mut registry = FObjectRegistry::new();
        let engine = registry.create_package("/Script/Engine");
        let actor = registry.create_class(engine, "Actor", Some(registry.object_class()), EClassFlags::NATIVE);
        let package = registry.create_package("/Game/Maps/Entry");
        let world = registry.create_object(package, "Entry", actor, EObjectFlags::PUBLIC | EObjectFlags::STANDALONE);
        let level = registry.create_object(world, "PersistentLevel", actor, EObjectFlags::empty());
        let model = registry.create_object(level, "Model_0", actor, EObjectFlags::empty());

        assert_eq!("/Game/Maps/Entry.Entry", registry.path_name(world));
        assert_eq!("/Game/Maps/Entry.Entry:PersistentLevel", registry.path_name(level));
        assert_eq!("/Game/Maps/Entry.Entry:PersistentLevel.Model_0", registry.path_name(model));
        assert_eq!("Actor /Game/Maps/Entry.Entry", registry.full_name(world));
        assert_eq!("Class /Script/Engine.Actor", registry.full_name(actor));
        assert_eq!("Package /Game/Maps/Entry", registry.full_name(package));
        assert_eq!(Some(level), registry.find_object("/game/maps/entry.Entry:PersistentLevel"));
        assert_eq!(Some(package), registry.find_package("/GAME/Maps/Entry"));
        assert_eq!(None, registry.find_package("/Game/Maps/Entry.Entry"));
        assert_eq!(package, registry.package_of(model));
        assert!(registry.is_native(actor));
        assert!(!registry.is_native(world));
        assert!(registry.is_a(world, registry.object_class()));
    }

    #[test]
    fn test_cdo_subobjects() {
        let mut registry = FObjectRegistry::new();
        let package = registry.create_package("/Game/BP_Door");
        let class = registry.create_class(package, "BP_Door_C", Some(registry.object_class()), EClassFlags::empty());
        let cdo = registry.class_default_object(class).unwrap();
        let mesh = registry.create_object(cdo, "Mesh", registry.object_class(), EObjectFlags::DEFAULT_SUB_OBJECT);
        let nested = registry.create_object(mesh, "Collision", registry.object_class(), EObjectFlags::DEFAULT_SUB_OBJECT);
        let template = registry.create_object(class, "Light_GEN_VARIABLE", registry.object_class(), EObjectFlags::ARCHETYPE_OBJECT);
        let _plain = registry.create_object(cdo, "Transient", registry.object_class(), EObjectFlags::empty());

        assert_eq!(vec![template, mesh, nested], registry.get_cdo_subobjects(cdo));
    }

    #[test]
    fn test_nested_save_refused() {
        let registry = FObjectRegistry::new();
        {
            let _guard = registry.begin_save().unwrap();
            assert!(registry.is_saving());
            assert!(registry.begin_save().is_err());
        }
        assert!(!registry.is_saving());
        assert!(registry.begin_save().is_ok());
    }

    #[test]
    fn test_behavior_lookup_walks_super_classes() {
        struct Unsaveable;
        impl ObjectBehavior for Unsaveable {
            fn is_saveable(&self, _registry: &FObjectRegistry, _object: ObjectId) -> bool {
                false
            }
        }
        let mut registry = FObjectRegistry::new();
        let package = registry.create_package("/Game/Test");
        let base = registry.create_class(package, "Base", Some(registry.object_class()), EClassFlags::empty());
        let derived = registry.create_class(package, "Derived", Some(base), EClassFlags::empty());
        let object = registry.create_object(package, "Thing", derived, EObjectFlags::PUBLIC);
        assert!(registry.behavior(object).is_none());
        registry.register_behavior(base, Arc::new(Unsaveable));
        assert!(registry.behavior(object).is_some_and(|b| !b.is_saveable(&registry, object)));
    }
}
