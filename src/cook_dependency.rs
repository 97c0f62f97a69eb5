use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use anyhow::{Context as _, Result, bail};
use serde::{Deserialize, Serialize};
use strum::{FromRepr, IntoStaticStr};
use tracing::instrument;

use crate::compact_binary::{CbWriter, FieldValue};
use crate::compare_ignore_case;
use crate::logging::{ELogVerbosity, FMessages};
use crate::services::FCookServices;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromRepr, IntoStaticStr, Serialize, Deserialize)]
#[repr(u8)]
pub enum ECookDependency {
    File = 0,
    Function = 1,
    TransitiveBuild = 2,
    Package = 3,
    ConsoleVariable = 4,
    Config = 5,
    SettingsObject = 6,
    NativeClass = 7,
    AssetRegistryQuery = 8,
    RedirectionTarget = 9,
}

/// Identifies one tracked config value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FConfigAccessData {
    pub platform: String,
    pub file_name: String,
    pub section_name: String,
    pub value_name: String,
}
impl FConfigAccessData {
    pub fn new(platform: &str, file_name: &str, section_name: &str, value_name: &str) -> Self {
        Self {
            platform: platform.to_string(),
            file_name: file_name.to_string(),
            section_name: section_name.to_string(),
            value_name: value_name.to_string(),
        }
    }
    /// Lowercase lookup key, config names are case-insensitive
    pub fn lookup_key(&self) -> String {
        self.to_string().to_ascii_lowercase()
    }
    fn fields(&self) -> [&str; 4] {
        [&self.platform, &self.file_name, &self.section_name, &self.value_name]
    }
}
impl Display for FConfigAccessData {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}:[{}]:{}", self.platform, self.file_name, self.section_name, self.value_name)
    }
}
impl PartialEq for FConfigAccessData {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}
impl Eq for FConfigAccessData {}
impl PartialOrd for FConfigAccessData {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for FConfigAccessData {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_all_ignore_case(&self.fields(), &other.fields())
    }
}

/// Asset registry query whose result set is a build input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FAssetRegistryQuery {
    pub package_paths: Vec<String>,
    pub class_paths: Vec<String>,
    pub recursive_paths: bool,
}
impl PartialEq for FAssetRegistryQuery {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}
impl Eq for FAssetRegistryQuery {}
impl PartialOrd for FAssetRegistryQuery {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for FAssetRegistryQuery {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_all_ignore_case(&self.package_paths, &other.package_paths)
            .then_with(|| compare_all_ignore_case(&self.class_paths, &other.class_paths))
            .then_with(|| self.recursive_paths.cmp(&other.recursive_paths))
    }
}

fn compare_all_ignore_case<T: AsRef<str>>(a: &[T], b: &[T]) -> Ordering {
    for (a, b) in a.iter().zip(b) {
        let order = compare_ignore_case(a.as_ref(), b.as_ref());
        if order.is_ne() {
            return order;
        }
    }
    a.len().cmp(&b.len())
}

#[derive(Debug, Clone)]
pub enum FCookDependencyPayload {
    File(String),
    Function { name: String, args: Vec<u8> },
    TransitiveBuild(String),
    Package(String),
    ConsoleVariable(String),
    Config(FConfigAccessData),
    SettingsObject(String),
    NativeClass(String),
    AssetRegistryQuery(FAssetRegistryQuery),
    RedirectionTarget(String),
}

/// One build input of a package. `value` caches the last hashed state and is not part of the identity.
/// `NativeClass` and `RedirectionTarget` are hashed in batches per key and never carry a value.
#[derive(Debug, Clone)]
pub struct FCookDependency {
    payload: FCookDependencyPayload,
    value: Option<[u8; 32]>,
}

impl FCookDependency {
    fn new(payload: FCookDependencyPayload) -> Self {
        Self { payload, value: None }
    }
    pub fn file(path: &str) -> Self {
        Self::new(FCookDependencyPayload::File(path.replace('\\', "/")))
    }
    pub fn function(name: &str, args: Vec<u8>) -> Self {
        Self::new(FCookDependencyPayload::Function { name: name.to_string(), args })
    }
    pub fn transitive_build(package_name: &str) -> Self {
        Self::new(FCookDependencyPayload::TransitiveBuild(package_name.to_string()))
    }
    pub fn package(package_name: &str) -> Self {
        Self::new(FCookDependencyPayload::Package(package_name.to_string()))
    }
    pub fn console_variable(name: &str) -> Self {
        Self::new(FCookDependencyPayload::ConsoleVariable(name.to_string()))
    }
    pub fn config(access: FConfigAccessData) -> Self {
        Self::new(FCookDependencyPayload::Config(access))
    }
    pub fn settings_object(object_path: &str) -> Self {
        Self::new(FCookDependencyPayload::SettingsObject(object_path.to_string()))
    }
    pub fn native_class(class_path: &str) -> Self {
        Self::new(FCookDependencyPayload::NativeClass(class_path.to_string()))
    }
    pub fn asset_registry_query(query: FAssetRegistryQuery) -> Self {
        Self::new(FCookDependencyPayload::AssetRegistryQuery(query))
    }
    pub fn redirection_target(package_name: &str) -> Self {
        Self::new(FCookDependencyPayload::RedirectionTarget(package_name.to_string()))
    }

    pub fn get_type(&self) -> ECookDependency {
        match &self.payload {
            FCookDependencyPayload::File(_) => ECookDependency::File,
            FCookDependencyPayload::Function { .. } => ECookDependency::Function,
            FCookDependencyPayload::TransitiveBuild(_) => ECookDependency::TransitiveBuild,
            FCookDependencyPayload::Package(_) => ECookDependency::Package,
            FCookDependencyPayload::ConsoleVariable(_) => ECookDependency::ConsoleVariable,
            FCookDependencyPayload::Config(_) => ECookDependency::Config,
            FCookDependencyPayload::SettingsObject(_) => ECookDependency::SettingsObject,
            FCookDependencyPayload::NativeClass(_) => ECookDependency::NativeClass,
            FCookDependencyPayload::AssetRegistryQuery(_) => ECookDependency::AssetRegistryQuery,
            FCookDependencyPayload::RedirectionTarget(_) => ECookDependency::RedirectionTarget,
        }
    }
    pub fn payload(&self) -> &FCookDependencyPayload {
        &self.payload
    }
    /// Package name for the package-keyed variants
    pub fn package_name(&self) -> Option<&str> {
        match &self.payload {
            FCookDependencyPayload::TransitiveBuild(name) | FCookDependencyPayload::Package(name) | FCookDependencyPayload::RedirectionTarget(name) => {
                Some(name)
            }
            _ => None,
        }
    }
    /// Name or path identifying the dependency inside its type
    pub fn identifier(&self) -> String {
        match &self.payload {
            FCookDependencyPayload::File(s)
            | FCookDependencyPayload::TransitiveBuild(s)
            | FCookDependencyPayload::Package(s)
            | FCookDependencyPayload::ConsoleVariable(s)
            | FCookDependencyPayload::SettingsObject(s)
            | FCookDependencyPayload::NativeClass(s)
            | FCookDependencyPayload::RedirectionTarget(s) => s.clone(),
            FCookDependencyPayload::Function { name, .. } => name.clone(),
            FCookDependencyPayload::Config(access) => access.to_string(),
            FCookDependencyPayload::AssetRegistryQuery(query) => query.package_paths.join(","),
        }
    }
    /// State hashed by the last `update_hash`, None before hashing, for unresolved values and for batched kinds
    pub fn value(&self) -> Option<&[u8; 32]> {
        self.value.as_ref()
    }

    /// Feeds the one byte type marker and the current state of the dependency into the context hash.
    /// Package, native class and redirection dependencies are resolved in batches by the dependency set.
    #[instrument(skip_all)]
    pub fn update_hash(&mut self, context: &mut FCookDependencyContext) {
        let marker = self.get_type() as u8;
        let services = context.services;
        let mut state = blake3::Hasher::new();
        match &self.payload {
            FCookDependencyPayload::File(path) => match services.file_hasher.hash_file(path) {
                Ok(hash) => {
                    state.update(&hash);
                }
                Err(e) => {
                    context.report_error(format!("could not hash file dependency {path}: {e:#}"));
                    return;
                }
            },
            FCookDependencyPayload::Function { name, args } => {
                let Some(function) = services.functions.find(name) else {
                    context.report_error(format!("cook dependency function {name} is not registered"));
                    return;
                };
                let mut function_context = context.nested();
                function(args, &mut function_context);
                let (succeeded, hash) = context.merge_nested(function_context);
                if !succeeded {
                    return;
                }
                state.update(name.to_ascii_lowercase().as_bytes());
                state.update(&hash);
            }
            FCookDependencyPayload::TransitiveBuild(package_name) => {
                // checked for modification by the incremental cook, only the identity is keyed
                state.update(package_name.to_ascii_lowercase().as_bytes());
            }
            FCookDependencyPayload::Package(package_name) => {
                let Some(digest) = context.resolve_package_digest(package_name) else {
                    return;
                };
                state.update(&digest.0);
            }
            FCookDependencyPayload::ConsoleVariable(name) => match services.console_variables.get_value(name) {
                Some(value) => {
                    state.update(value.as_bytes());
                }
                None => {
                    context.report_error(format!("console variable {name} does not exist"));
                    return;
                }
            },
            FCookDependencyPayload::Config(access) => match services.config_tracker.get_value(access) {
                Some(value) => {
                    state.update(value.as_bytes());
                }
                None => {
                    context.update(&[marker]);
                    return;
                }
            },
            FCookDependencyPayload::SettingsObject(path) => {
                // only reached when the settings object could not be expanded into config values
                state.update(path.to_ascii_lowercase().as_bytes());
            }
            FCookDependencyPayload::NativeClass(class_path) => {
                if let Err(e) = services.native_classes.append_class_digests(&[class_path.as_str()], &mut state) {
                    context.report_error(format!("{e:#}"));
                    return;
                }
            }
            FCookDependencyPayload::AssetRegistryQuery(query) => {
                let Some(asset_registry) = services.asset_registry else {
                    context.report_error("asset registry query dependency without an asset registry".to_string());
                    return;
                };
                let mut packages = asset_registry.query(query);
                packages.sort_by(|a, b| compare_ignore_case(a, b));
                for package in packages {
                    state.update(package.to_ascii_lowercase().as_bytes());
                    state.update(&[0]);
                }
            }
            FCookDependencyPayload::RedirectionTarget(package_name) => {
                let Some(asset_registry) = services.asset_registry else {
                    context.report_error("redirection target dependency without an asset registry".to_string());
                    return;
                };
                asset_registry.append_redirect_hashes(&[package_name.as_str()], &mut state);
            }
        }
        let value = *state.finalize().as_bytes();
        self.value = Some(value);
        context.update(&[marker]);
        context.update(&value);
    }

    #[instrument(skip_all)]
    pub fn save(&self, writer: &mut CbWriter) -> Result<()> {
        writer.begin_object("");
        writer.add_u64("Type", self.get_type() as u64)?;
        match &self.payload {
            FCookDependencyPayload::File(path) => writer.add_string("FileName", path)?,
            FCookDependencyPayload::Function { name, args } => {
                writer.add_string("FunctionName", name)?;
                writer.add_binary("Args", args)?;
            }
            FCookDependencyPayload::TransitiveBuild(name) | FCookDependencyPayload::Package(name) | FCookDependencyPayload::RedirectionTarget(name) => {
                writer.add_string("PackageName", name)?
            }
            FCookDependencyPayload::ConsoleVariable(name) => writer.add_string("Name", name)?,
            FCookDependencyPayload::Config(access) => {
                writer.add_string("Platform", &access.platform)?;
                writer.add_string("FileName", &access.file_name)?;
                writer.add_string("SectionName", &access.section_name)?;
                writer.add_string("ValueName", &access.value_name)?;
            }
            FCookDependencyPayload::SettingsObject(path) => writer.add_string("ObjectPath", path)?,
            FCookDependencyPayload::NativeClass(path) => writer.add_string("ClassPath", path)?,
            FCookDependencyPayload::AssetRegistryQuery(query) => {
                for (field, values) in [("PackagePaths", &query.package_paths), ("ClassPaths", &query.class_paths)] {
                    writer.begin_array(field);
                    for value in values {
                        writer.add_string("", value)?;
                    }
                    writer.end_array()?;
                }
                writer.add_bool("Recursive", query.recursive_paths)?;
            }
        }
        writer.end_object()
    }

    #[instrument(skip_all)]
    pub fn load(field: &FieldValue) -> Result<Self> {
        let type_value = field.get("Type").and_then(FieldValue::as_u64).context("cook dependency without Type")?;
        let Some(ty) = u8::try_from(type_value).ok().and_then(ECookDependency::from_repr) else {
            bail!("unknown cook dependency type {type_value}");
        };
        let string = |name: &str| -> Result<String> {
            field
                .get(name)
                .and_then(FieldValue::as_string)
                .cloned()
                .with_context(|| format!("{} cook dependency is missing {name}", <&'static str>::from(ty)))
        };
        let strings = |name: &str| -> Result<Vec<String>> {
            FieldValue::array_or_empty(field.get(name))
                .iter()
                .map(|v| v.as_string().cloned().with_context(|| format!("non-string item in {name}")))
                .collect()
        };
        Ok(match ty {
            ECookDependency::File => Self::file(&string("FileName")?),
            ECookDependency::Function => {
                let args = field.get("Args").and_then(FieldValue::as_binary).cloned().unwrap_or_default();
                Self::function(&string("FunctionName")?, args)
            }
            ECookDependency::TransitiveBuild => Self::transitive_build(&string("PackageName")?),
            ECookDependency::Package => Self::package(&string("PackageName")?),
            ECookDependency::RedirectionTarget => Self::redirection_target(&string("PackageName")?),
            ECookDependency::ConsoleVariable => Self::console_variable(&string("Name")?),
            ECookDependency::Config => Self::config(FConfigAccessData {
                platform: string("Platform")?,
                file_name: string("FileName")?,
                section_name: string("SectionName")?,
                value_name: string("ValueName")?,
            }),
            ECookDependency::SettingsObject => Self::settings_object(&string("ObjectPath")?),
            ECookDependency::NativeClass => Self::native_class(&string("ClassPath")?),
            ECookDependency::AssetRegistryQuery => Self::asset_registry_query(FAssetRegistryQuery {
                package_paths: strings("PackagePaths")?,
                class_paths: strings("ClassPaths")?,
                recursive_paths: field.get("Recursive").and_then(FieldValue::as_bool).unwrap_or(false),
            }),
        })
    }
}

impl PartialEq for FCookDependency {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}
impl Eq for FCookDependency {}
impl PartialOrd for FCookDependency {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for FCookDependency {
    fn cmp(&self, other: &Self) -> Ordering {
        use FCookDependencyPayload as P;
        self.get_type().cmp(&other.get_type()).then_with(|| match (&self.payload, &other.payload) {
            (P::Function { name: a, args: a_args }, P::Function { name: b, args: b_args }) => compare_ignore_case(a, b).then_with(|| a_args.cmp(b_args)),
            (P::Config(a), P::Config(b)) => a.cmp(b),
            (P::AssetRegistryQuery(a), P::AssetRegistryQuery(b)) => a.cmp(b),
            _ => compare_ignore_case(&self.identifier(), &other.identifier()),
        })
    }
}
impl Display for FCookDependency {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let ty: &'static str = self.get_type().into();
        write!(f, "{ty}({})", self.identifier())
    }
}

/// Running key calculation of one dependency set
pub struct FCookDependencyContext<'a> {
    pub services: FCookServices<'a>,
    pub package_name: String,
    hasher: blake3::Hasher,
    error: bool,
    invalidated: bool,
    messages: FMessages,
}
impl<'a> FCookDependencyContext<'a> {
    pub fn new(services: FCookServices<'a>, package_name: &str) -> Self {
        Self {
            services,
            package_name: package_name.to_string(),
            hasher: blake3::Hasher::new(),
            error: false,
            invalidated: false,
            messages: vec![],
        }
    }
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }
    pub fn hasher_mut(&mut self) -> &mut blake3::Hasher {
        &mut self.hasher
    }
    /// The key cannot be computed; the package is never skippable and the key is not stored
    pub fn report_error(&mut self, message: String) {
        self.error = true;
        self.messages.push((ELogVerbosity::Error, message));
    }
    /// A dependency is known to have changed
    pub fn report_invalidated(&mut self, message: String) {
        self.invalidated = true;
        self.messages.push((ELogVerbosity::Display, message));
    }
    pub fn log(&mut self, verbosity: ELogVerbosity, message: String) {
        self.messages.push((verbosity, message));
    }
    pub fn has_error(&self) -> bool {
        self.error
    }
    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }
    pub fn messages(&self) -> &FMessages {
        &self.messages
    }
    pub fn finish(self) -> (blake3::Hash, bool, bool, FMessages) {
        (self.hasher.finalize(), self.error, self.invalidated, self.messages)
    }

    /// Digest of a package's content: generated packages come from the generation helper, others from the asset registry
    pub(crate) fn resolve_package_digest(&mut self, package_name: &str) -> Option<crate::FIoHash> {
        if let Some(helper) = self.services.generation_helper {
            if helper.is_generated_package(package_name) {
                let digest = helper.get_package_digest(package_name);
                if digest.is_none() {
                    self.report_error(format!("could not get the package digest of generated package {package_name}"));
                }
                return digest;
            }
        }
        let Some(asset_registry) = self.services.asset_registry else {
            self.report_error(format!("no asset registry to resolve the digest of package {package_name}"));
            return None;
        };
        let digest = asset_registry.get_package_digest(package_name);
        if digest.is_none() {
            self.report_error(format!("could not get the package digest of {package_name}, it does not exist or is not mounted"));
        }
        digest
    }

    fn nested(&self) -> FCookDependencyContext<'a> {
        FCookDependencyContext::new(self.services, &self.package_name)
    }
    fn merge_nested(&mut self, nested: FCookDependencyContext<'a>) -> (bool, [u8; 32]) {
        let (hash, error, invalidated, messages) = nested.finish();
        self.error |= error;
        self.invalidated |= invalidated;
        self.messages.extend(messages);
        (!error, *hash.as_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compact_binary::load_compact_binary;
    use crate::services::FMemoryCookServices;
    use anyhow::Context;
    use pretty_assertions::assert_eq;

    fn all_kinds() -> Vec<FCookDependency> {
        vec![
            FCookDependency::file("Config/DefaultGame.ini"),
            FCookDependency::function("/Script/Engine.HashMaterial", vec![1, 2, 3]),
            FCookDependency::transitive_build("/Game/Other"),
            FCookDependency::package("/Game/Other"),
            FCookDependency::console_variable("r.Shadow.Quality"),
            FCookDependency::config(FConfigAccessData::new("Windows", "Engine", "/Script/Engine.RendererSettings", "r.GPUSkin")),
            FCookDependency::settings_object("/Script/Engine.Default__RendererSettings"),
            FCookDependency::native_class("/Script/Engine.Actor"),
            FCookDependency::asset_registry_query(FAssetRegistryQuery {
                package_paths: vec!["/Game/Maps".to_string()],
                class_paths: vec![],
                recursive_paths: true,
            }),
            FCookDependency::redirection_target("/Game/Old"),
        ]
    }

    #[test]
    fn test_ordering_is_by_type_then_case_insensitive() {
        let mut deps = vec![
            FCookDependency::package("/Game/b"),
            FCookDependency::file("z.txt"),
            FCookDependency::package("/Game/A"),
            FCookDependency::package("/game/a"),
        ];
        deps.sort();
        let names: Vec<String> = deps.iter().map(|d| d.to_string()).collect();
        assert_eq!(vec!["File(z.txt)", "Package(/Game/A)", "Package(/game/a)", "Package(/Game/b)"], names);
        assert_eq!(deps[1], deps[2]);
        assert_ne!(FCookDependency::package("/Game/A"), FCookDependency::transitive_build("/Game/A"));
        assert_ne!(FCookDependency::function("F", vec![1]), FCookDependency::function("f", vec![2]));
        assert_eq!(FCookDependency::function("F", vec![1]), FCookDependency::function("f", vec![1]));
    }

    #[test]
    fn test_compact_binary_persistence() -> Result<()> {
        let deps = all_kinds();
        let mut writer = CbWriter::new();
        writer.begin_array("");
        for dep in &deps {
            dep.save(&mut writer)?;
        }
        writer.end_array()?;
        let data = writer.save()?;

        let loaded = load_compact_binary(&data)?
            .as_array()
            .context("expected array")?
            .iter()
            .map(FCookDependency::load)
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(deps, loaded);
        Ok(())
    }

    #[test]
    fn test_update_hash_memoizes_value() {
        let mut env = FMemoryCookServices::default();
        env.config_tracker.set_value(FConfigAccessData::new("Windows", "Engine", "Core.System", "Paths"), "../Content");
        env.console_variables.set_value("r.Shadow.Quality", "3");
        let services = env.services();

        let mut context = FCookDependencyContext::new(services, "/Game/Test");
        let mut config = FCookDependency::config(FConfigAccessData::new("windows", "engine", "core.system", "paths"));
        config.update_hash(&mut context);
        assert!(config.value().is_some());

        let mut missing = FCookDependency::config(FConfigAccessData::new("Windows", "Engine", "Core.System", "Missing"));
        missing.update_hash(&mut context);
        assert!(missing.value().is_none());
        assert!(!context.has_error());

        let mut cvar = FCookDependency::console_variable("r.Shadow.Quality");
        cvar.update_hash(&mut context);
        let mut missing_cvar = FCookDependency::console_variable("r.Nope");
        missing_cvar.update_hash(&mut context);
        assert!(context.has_error());
        assert!(!context.is_invalidated());
        assert_eq!(1, context.messages().len());
    }

    #[test]
    fn test_function_dependency() {
        fn hash_args(args: &[u8], context: &mut FCookDependencyContext) {
            if args.is_empty() {
                context.report_error("no arguments".to_string());
            } else {
                context.update(args);
            }
        }
        let mut env = FMemoryCookServices::default();
        env.functions.register("/Script/Test.HashArgs", hash_args);
        let services = env.services();

        let key = |args: Vec<u8>| {
            let mut context = FCookDependencyContext::new(services, "/Game/Test");
            FCookDependency::function("/Script/Test.HashArgs", args).update_hash(&mut context);
            let (hash, error, _, _) = context.finish();
            (hash, error)
        };
        assert_eq!(key(vec![1]), key(vec![1]));
        assert_ne!(key(vec![1]).0, key(vec![2]).0);
        assert!(key(vec![]).1);

        let mut context = FCookDependencyContext::new(services, "/Game/Test");
        FCookDependency::function("/Script/Test.Unknown", vec![]).update_hash(&mut context);
        assert!(context.has_error());
    }
}
