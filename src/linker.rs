use std::collections::HashMap;
use std::fmt::Display;
use std::io::{Read, Write};

use anyhow::{Context, Result, bail};
use tracing::instrument;

use crate::compare_ignore_case;
use crate::name_map::{FMappedName, FNameMap};
use crate::object::{FObjectRegistry, ObjectId};
use crate::save_context::{ESaveRealm, FHarvestedRealm, FSaveContext};
use crate::ser::*;

pub const PACKAGE_FILE_TAG: u32 = 0x9E2A83C1;

/// Reference to an object from inside a package: positive values are exports, negative values imports, 0 null
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FPackageIndex(i32);
impl FPackageIndex {
    pub const NULL: FPackageIndex = FPackageIndex(0);

    pub fn from_import(index: usize) -> Self {
        Self(-(index as i32) - 1)
    }
    pub fn from_export(index: usize) -> Self {
        Self(index as i32 + 1)
    }
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
    pub fn is_import(self) -> bool {
        self.0 < 0
    }
    pub fn is_export(self) -> bool {
        self.0 > 0
    }
    pub fn to_import(self) -> Option<usize> {
        self.is_import().then(|| (-self.0 - 1) as usize)
    }
    pub fn to_export(self) -> Option<usize> {
        self.is_export().then(|| (self.0 - 1) as usize)
    }
}
impl Display for FPackageIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(import) = self.to_import() {
            write!(f, "Import({import})")
        } else if let Some(export) = self.to_export() {
            write!(f, "Export({export})")
        } else {
            write!(f, "Null")
        }
    }
}
impl Readable for FPackageIndex {
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        Ok(Self(s.de()?))
    }
}
impl Writeable for FPackageIndex {
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FObjectImport {
    pub class_package: FMappedName,
    pub class_name: FMappedName,
    pub outer_index: FPackageIndex,
    pub object_name: FMappedName,
}
impl Readable for FObjectImport {
    #[instrument(skip_all, name = "FObjectImport")]
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        Ok(Self {
            class_package: s.de()?,
            class_name: s.de()?,
            outer_index: s.de()?,
            object_name: s.de()?,
        })
    }
}
impl Writeable for FObjectImport {
    #[instrument(skip_all, name = "FObjectImport")]
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.class_package)?;
        s.ser(&self.class_name)?;
        s.ser(&self.outer_index)?;
        s.ser(&self.object_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FObjectExport {
    pub class_index: FPackageIndex,
    pub super_index: FPackageIndex,
    pub template_index: FPackageIndex,
    pub outer_index: FPackageIndex,
    pub object_name: FMappedName,
    pub object_flags: u32,
    /// Offset of this export's entries in the preload dependency table, -1 if it has none
    pub first_export_dependency: i32,
    /// Objects that must be created before this export is serialized
    pub create_before_serialization_dependencies: i32,
    /// Objects that must be fully loaded before this export is created
    pub serialization_before_create_dependencies: i32,
}
impl Readable for FObjectExport {
    #[instrument(skip_all, name = "FObjectExport")]
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        Ok(Self {
            class_index: s.de()?,
            super_index: s.de()?,
            template_index: s.de()?,
            outer_index: s.de()?,
            object_name: s.de()?,
            object_flags: s.de()?,
            first_export_dependency: s.de()?,
            create_before_serialization_dependencies: s.de()?,
            serialization_before_create_dependencies: s.de()?,
        })
    }
}
impl Writeable for FObjectExport {
    #[instrument(skip_all, name = "FObjectExport")]
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.class_index)?;
        s.ser(&self.super_index)?;
        s.ser(&self.template_index)?;
        s.ser(&self.outer_index)?;
        s.ser(&self.object_name)?;
        s.ser(&self.object_flags)?;
        s.ser(&self.first_export_dependency)?;
        s.ser(&self.create_before_serialization_dependencies)?;
        s.ser(&self.serialization_before_create_dependencies)
    }
}

/// Orders objects by full name ("Class /Path.Object"), ignoring case. Exact comparison breaks ties.
struct FObjectFullNameSorter<'r> {
    registry: &'r FObjectRegistry,
    full_names: HashMap<ObjectId, String>,
}
impl<'r> FObjectFullNameSorter<'r> {
    fn new(registry: &'r FObjectRegistry) -> Self {
        Self {
            registry,
            full_names: HashMap::new(),
        }
    }
    fn sort(&mut self, objects: &mut [ObjectId]) {
        for &object in objects.iter() {
            self.full_names.entry(object).or_insert_with(|| self.registry.full_name(object));
        }
        let full_names = &self.full_names;
        objects.sort_by(|a, b| {
            let (a, b) = (&full_names[a], &full_names[b]);
            compare_ignore_case(a, b).then_with(|| a.cmp(b))
        });
    }
}

/// Sorts the imports of a realm into serialization order
pub struct FObjectImportSortHelper;
impl FObjectImportSortHelper {
    pub fn sort_imports(registry: &FObjectRegistry, realm: &FHarvestedRealm) -> Vec<ObjectId> {
        let mut imports: Vec<ObjectId> = realm.imports().iter().copied().collect();
        FObjectFullNameSorter::new(registry).sort(&mut imports);
        imports
    }
}

/// Sorts the exports of a realm into serialization order
pub struct FObjectExportSortHelper;
impl FObjectExportSortHelper {
    pub fn sort_exports(registry: &FObjectRegistry, realm: &FHarvestedRealm) -> Vec<ObjectId> {
        let mut exports: Vec<ObjectId> = realm.exports().iter().copied().collect();
        FObjectFullNameSorter::new(registry).sort(&mut exports);
        exports
    }
}

/// Header tables of one saved realm of a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FLinkerTables {
    pub package_name: String,
    pub name_map: FNameMap,
    pub imports: Vec<FObjectImport>,
    pub exports: Vec<FObjectExport>,
    pub preload_dependencies: Vec<FPackageIndex>,
    pub soft_object_paths: Vec<String>,
    pub prestream_packages: Vec<String>,
}

impl FLinkerTables {
    /// Builds the tables of a harvested realm
    #[instrument(skip_all, fields(package = %context.package_name(), realm = ?realm))]
    pub fn build(context: &FSaveContext, realm: ESaveRealm) -> Result<Self> {
        let registry = context.registry;
        let harvested = context.harvested_realm(realm);
        let imports = FObjectImportSortHelper::sort_imports(registry, harvested);
        let exports = FObjectExportSortHelper::sort_exports(registry, harvested);

        let mut indices: HashMap<ObjectId, FPackageIndex> = HashMap::new();
        indices.extend(imports.iter().enumerate().map(|(i, &o)| (o, FPackageIndex::from_import(i))));
        indices.extend(exports.iter().enumerate().map(|(i, &o)| (o, FPackageIndex::from_export(i))));
        let index_of = |object: Option<ObjectId>| object.and_then(|o| indices.get(&o).copied()).unwrap_or(FPackageIndex::NULL);

        let mut names: Vec<String> = harvested.names().iter().cloned().collect();
        names.push(context.package_name().to_string());
        for &object in imports.iter().chain(&exports) {
            let data = registry.get(object);
            names.push(data.name.clone());
            if let Some(class) = data.class {
                names.push(registry.get(class).name.clone());
                names.push(registry.get(registry.package_of(class)).name.clone());
            }
        }
        let name_map = FNameMap::create_sorted(names);

        let mut import_map = Vec::with_capacity(imports.len());
        for &import in &imports {
            let data = registry.get(import);
            let class = data.class.context("import without class")?;
            import_map.push(FObjectImport {
                class_package: name_map.find(&registry.get(registry.package_of(class)).name)?,
                class_name: name_map.find(&registry.get(class).name)?,
                outer_index: index_of(data.outer),
                object_name: name_map.find(&data.name)?,
            });
        }

        let mut export_map = Vec::with_capacity(exports.len());
        let mut preload_dependencies = vec![];
        for &export in &exports {
            let data = registry.get(export);
            let mut create_before_serialization: Vec<FPackageIndex> = harvested
                .export_dependencies(export)
                .into_iter()
                .flatten()
                .map(|&d| index_of(Some(d)))
                .filter(|i| !i.is_null())
                .collect();
            let mut serialization_before_create: Vec<FPackageIndex> = harvested
                .preload_dependencies(export)
                .into_iter()
                .flatten()
                .map(|&d| index_of(Some(d)))
                .filter(|i| !i.is_null())
                .collect();
            create_before_serialization.sort();
            serialization_before_create.sort();

            let first_export_dependency = if create_before_serialization.is_empty() && serialization_before_create.is_empty() {
                -1
            } else {
                preload_dependencies.len() as i32
            };
            export_map.push(FObjectExport {
                class_index: index_of(data.class),
                super_index: if registry.is_struct(export) { index_of(data.super_struct) } else { FPackageIndex::NULL },
                template_index: index_of(data.archetype),
                outer_index: index_of(data.outer),
                object_name: name_map.find(&data.name)?,
                object_flags: data.flags.bits(),
                first_export_dependency,
                create_before_serialization_dependencies: create_before_serialization.len() as i32,
                serialization_before_create_dependencies: serialization_before_create.len() as i32,
            });
            preload_dependencies.extend(create_before_serialization);
            preload_dependencies.extend(serialization_before_create);
        }

        let mut soft_object_paths: Vec<String> = harvested.soft_object_paths().iter().cloned().collect();
        soft_object_paths.sort_by(|a, b| compare_ignore_case(a, b).then_with(|| a.cmp(b)));
        let mut prestream_packages: Vec<String> = harvested.prestream_packages().iter().cloned().collect();
        prestream_packages.sort_by(|a, b| compare_ignore_case(a, b).then_with(|| a.cmp(b)));

        Ok(Self {
            package_name: context.package_name().to_string(),
            name_map,
            imports: import_map,
            exports: export_map,
            preload_dependencies,
            soft_object_paths,
            prestream_packages,
        })
    }

    /// Path of an import or export as stored in the tables, e.g. "/Script/Engine.Actor". Objects directly inside a
    /// top-level object are joined with ':' as in "/Game/Maps/Entry.Entry:PersistentLevel".
    pub fn object_path(&self, index: FPackageIndex) -> Result<String> {
        let (name, outer) = self.name_and_outer(index)?;
        if let Some(outer) = outer {
            let separator = if self.is_top_level(outer)? { ':' } else { '.' };
            Ok(format!("{}{separator}{name}", self.object_path(outer)?))
        } else if index.is_export() {
            Ok(format!("{}.{name}", self.package_name))
        } else {
            Ok(name)
        }
    }

    /// Name and outer of an entry; exports without an outer live in the saved package, imports without one are packages
    fn name_and_outer(&self, index: FPackageIndex) -> Result<(String, Option<FPackageIndex>)> {
        let (name, outer) = if let Some(import) = index.to_import() {
            let import = self.imports.get(import).with_context(|| format!("{index} out of range"))?;
            (import.object_name, import.outer_index)
        } else if let Some(export) = index.to_export() {
            let export = self.exports.get(export).with_context(|| format!("{index} out of range"))?;
            (export.object_name, export.outer_index)
        } else {
            bail!("null package index has no path");
        };
        Ok((self.name_map.get(name)?.into_owned(), (!outer.is_null()).then_some(outer)))
    }

    /// True for objects whose outer is a package
    fn is_top_level(&self, index: FPackageIndex) -> Result<bool> {
        let (_, outer) = self.name_and_outer(index)?;
        Ok(match outer {
            None => index.is_export(),
            Some(outer) => outer.is_import() && self.name_and_outer(outer)?.1.is_none(),
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buffer = vec![];
        WriteExt::ser(&mut buffer, self)?;
        Ok(buffer)
    }
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        std::io::Cursor::new(data).de()
    }
}

impl Readable for FLinkerTables {
    #[instrument(skip_all, name = "FLinkerTables")]
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        expect_tag(s, PACKAGE_FILE_TAG, "package file")?;
        let tables = Self {
            package_name: s.de()?,
            name_map: s.de()?,
            imports: s.de()?,
            exports: s.de()?,
            preload_dependencies: s.de()?,
            soft_object_paths: s.de()?,
            prestream_packages: s.de()?,
        };
        expect_tag(s, PACKAGE_FILE_TAG, "package end")?;
        Ok(tables)
    }
}
impl Writeable for FLinkerTables {
    #[instrument(skip_all, name = "FLinkerTables")]
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&PACKAGE_FILE_TAG)?;
        s.ser(&self.package_name)?;
        s.ser(&self.name_map)?;
        s.ser(&self.imports)?;
        s.ser(&self.exports)?;
        s.ser(&self.preload_dependencies)?;
        s.ser(&self.soft_object_paths)?;
        s.ser(&self.prestream_packages)?;
        s.ser(&PACKAGE_FILE_TAG)
    }
}
