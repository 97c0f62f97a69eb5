use anyhow::{Context as _, Result, bail};
use serde::Serialize;
use strum::IntoStaticStr;
use tracing::instrument;

use crate::build_dependency_set::EKeyResult;
use crate::compact_binary::{CbWriter, FieldValue, load_compact_binary};
use crate::cook_dependency::{ECookDependency, FCookDependency};
use crate::harvester::{FPackageHarvester, sorted_full_names};
use crate::linker::FLinkerTables;
use crate::logging::{ELogVerbosity, FMessages, Log, debug, log, verbose};
use crate::object::{FObjectRegistry, ObjectId};
use crate::package_artifacts::{
    ARTIFACTS_ATTACHMENT_KEY, BUILD_DEFINITIONS_ATTACHMENT_KEY, FCookEventContext, FPackageArtifacts, IMPORT_EXPORT_ATTACHMENT_KEY,
    LOGS_ATTACHMENT_KEY, artifacts_version,
};
use crate::package_writer::IPackageWriter;
use crate::save_context::{EIllegalRefReason, ESaveRealm, ESaveRealmSet, FIllegalReference, FSaveContext};
use crate::services::FCookServices;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, Serialize)]
pub enum ESavePackageResult {
    Success,
    Error,
}

#[derive(Debug)]
pub struct FSavePackageResult {
    pub result: ESavePackageResult,
    pub package_name: String,
    /// Realms that were written
    pub realms: ESaveRealmSet,
    pub artifacts: Option<FPackageArtifacts>,
    pub key_result: Option<EKeyResult>,
    pub illegal_references: Vec<FIllegalReference>,
    pub messages: FMessages,
}
impl FSavePackageResult {
    fn error(package_name: String, messages: FMessages) -> Self {
        Self {
            result: ESavePackageResult::Error,
            package_name,
            realms: ESaveRealmSet::empty(),
            artifacts: None,
            key_result: None,
            illegal_references: vec![],
            messages,
        }
    }
    pub fn is_success(&self) -> bool {
        self.result == ESavePackageResult::Success
    }
}

/// Saves a package: harvests its realms, builds the linker tables, collects the build dependencies and
/// writes the package data together with the `meta.cook.*` attachments.
///
/// Failures never panic or propagate; they produce an error result carrying the messages. A failed save removes any
/// record the writer held for the package, so the package is recooked next session.
#[instrument(skip_all, fields(package = %registry.path_name(package)))]
pub fn save_package(registry: &FObjectRegistry, package: ObjectId, services: FCookServices, writer: &mut dyn IPackageWriter, log: &Log) -> FSavePackageResult {
    let package_name = registry.path_name(package);
    let mut messages = vec![];
    match save_package_internal(registry, package, services, writer, log, &mut messages) {
        Ok(result) => result,
        Err(err) => {
            log!(log, "Failed to save {package_name}: {err:#}");
            messages.push((ELogVerbosity::Error, format!("{err:#}")));
            if registry.is_package(package) {
                // the package may already be staged; a failed commit discards it either way
                writer.begin_package(&package_name).ok();
                if let Err(err) = writer.commit_package(&package_name, false) {
                    messages.push((ELogVerbosity::Warning, format!("failed to discard {package_name}: {err:#}")));
                }
            }
            FSavePackageResult::error(package_name, messages)
        }
    }
}

fn save_package_internal(
    registry: &FObjectRegistry,
    package: ObjectId,
    services: FCookServices,
    writer: &mut dyn IPackageWriter,
    log: &Log,
    messages: &mut FMessages,
) -> Result<FSavePackageResult> {
    if services.asset_registry.is_none() {
        bail!("no asset registry is available, cannot record the dependencies of {}", registry.path_name(package));
    }
    let _saving = registry.begin_save()?;
    let mut context = FSaveContext::new(registry, services, package)?;
    let package_name = context.package_name().to_string();

    let mut events = FCookEventContext::default();
    if context.is_cooking() {
        for object in objects_in_package(registry, package) {
            if let Some(behavior) = registry.behavior(object) {
                behavior.on_cook_event(registry, object, &mut events);
            }
        }
    }

    FPackageHarvester::new(&mut context).harvest_package();

    let mut realms = ESaveRealmSet::GAME;
    for realm in context.requested_realms().realms() {
        if !context.harvested_realm(realm).is_empty() {
            realms |= realm.set();
        }
    }
    let mut package_data = vec![];
    for realm in realms.realms() {
        let tables = FLinkerTables::build(&context, realm)?;
        debug!(log, "{package_name} {realm:?}: {} imports, {} exports, {} names", tables.imports.len(), tables.exports.len(), tables.name_map.num_names());
        package_data.push((realm, tables.serialize()?));
    }

    for reference in context.illegal_references() {
        let what = match reference.reason {
            EIllegalRefReason::ReferenceToOptional => "optional object",
            EIllegalRefReason::ReferenceToPrivateObject => "private object",
        };
        messages.push((ELogVerbosity::Warning, format!("illegal reference to {what} {} from {}", reference.to, reference.from)));
    }

    let mut load_dependencies = vec![FCookDependency::package(&package_name)];
    load_dependencies.extend(events.load_dependencies);
    let mut save_dependencies = events.save_dependencies;
    let mut runtime_dependencies = events.runtime_dependencies;
    for realm in realms.realms() {
        let harvested = context.harvested_realm(realm);
        save_dependencies.extend(harvested.build_dependencies().iter().cloned());
        if realm != ESaveRealm::Editor {
            runtime_dependencies.extend(harvested.runtime_dependencies().iter().cloned());
        }
    }

    let mut artifacts = FPackageArtifacts::collect(&package_name, load_dependencies, save_dependencies, runtime_dependencies, true, &services, messages);
    if !artifacts.is_valid() {
        bail!("failed to collect the build dependencies of {package_name}");
    }
    let key_result = artifacts.try_calculate_current_key(&services, messages);
    if key_result == EKeyResult::Error {
        bail!("failed to calculate the build key of {package_name}");
    }
    artifacts.store_current_key();
    verbose!(log, "{package_name}: key {} over {} dependencies", artifacts.get_stored_key(), artifacts.get_dependencies().len());

    let import_export = save_import_export(&context, realms)?;
    let build_definitions = save_build_definitions(artifacts.get_save_build_dependencies().get_dependencies())?;
    let artifacts_data = artifacts.save(artifacts_version(services.config))?;
    let illegal_references = context.illegal_references().to_vec();

    writer.begin_package(&package_name)?;
    for (realm, data) in &package_data {
        writer.write_package_data(&package_name, *realm, data)?;
    }
    writer.write_attachment(&package_name, ARTIFACTS_ATTACHMENT_KEY, &artifacts_data)?;
    writer.write_attachment(&package_name, BUILD_DEFINITIONS_ATTACHMENT_KEY, &build_definitions)?;
    writer.write_attachment(&package_name, IMPORT_EXPORT_ATTACHMENT_KEY, &import_export)?;
    writer.write_attachment(&package_name, LOGS_ATTACHMENT_KEY, &save_messages(messages)?)?;
    writer.commit_package(&package_name, true)?;

    Ok(FSavePackageResult {
        result: ESavePackageResult::Success,
        package_name,
        realms,
        artifacts: Some(artifacts),
        key_result: Some(key_result),
        illegal_references,
        messages: std::mem::take(messages),
    })
}

/// Every object inside the package, outers before inners
fn objects_in_package(registry: &FObjectRegistry, package: ObjectId) -> Vec<ObjectId> {
    let mut objects = vec![];
    let mut stack: Vec<ObjectId> = registry.objects_with_outer(package).iter().rev().copied().collect();
    while let Some(object) = stack.pop() {
        objects.push(object);
        stack.extend(registry.objects_with_outer(object).iter().rev());
    }
    objects
}

fn save_import_export(context: &FSaveContext, realms: ESaveRealmSet) -> Result<Vec<u8>> {
    let mut writer = CbWriter::new();
    writer.begin_object("");
    for realm in realms.realms() {
        let (imports, exports) = sorted_full_names(context, realm);
        writer.begin_object(<&str>::from(realm));
        writer.begin_array("Imports");
        for import in &imports {
            writer.add_string("", import)?;
        }
        writer.end_array()?;
        writer.begin_array("Exports");
        for export in &exports {
            writer.add_string("", export)?;
        }
        writer.end_array()?;
        writer.end_object()?;
    }
    writer.end_object()?;
    writer.save()
}

/// The function dependencies of the Save set, which rebuild the package when their implementation changes
fn save_build_definitions(dependencies: &[FCookDependency]) -> Result<Vec<u8>> {
    let mut writer = CbWriter::new();
    writer.begin_object("");
    let functions: Vec<&FCookDependency> = dependencies.iter().filter(|d| d.get_type() == ECookDependency::Function).collect();
    if !functions.is_empty() {
        writer.begin_array("Functions");
        for function in functions {
            function.save(&mut writer)?;
        }
        writer.end_array()?;
    }
    writer.end_object()?;
    writer.save()
}

/// Serializes the messages of a save so they can be replayed when the package is skipped
pub fn save_messages(messages: &FMessages) -> Result<Vec<u8>> {
    let mut writer = CbWriter::new();
    writer.begin_object("");
    if !messages.is_empty() {
        writer.begin_array("Messages");
        for (verbosity, message) in messages {
            writer.begin_object("");
            writer.add_u64("Verbosity", *verbosity as u64)?;
            writer.add_string("Message", message)?;
            writer.end_object()?;
        }
        writer.end_array()?;
    }
    writer.end_object()?;
    writer.save()
}

pub fn load_messages(data: &[u8]) -> Result<FMessages> {
    let root = load_compact_binary(data)?;
    FieldValue::array_or_empty(root.get("Messages"))
        .iter()
        .map(|m| {
            let verbosity = m
                .get("Verbosity")
                .and_then(FieldValue::as_u64)
                .and_then(|v| u8::try_from(v).ok())
                .and_then(ELogVerbosity::from_repr)
                .context("message without verbosity")?;
            let message = m.get("Message").and_then(FieldValue::as_string).context("message without text")?;
            Ok((verbosity, message.clone()))
        })
        .collect()
}
