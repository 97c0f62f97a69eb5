use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use cookdeps::compact_binary::load_compact_binary;
use cookdeps::linker::{FLinkerTables, FPackageIndex};
use cookdeps::logging::{ELogVerbosity, Log};
use cookdeps::package_artifacts::{ARTIFACTS_ATTACHMENT_KEY, FPackageArtifacts, LOGS_ATTACHMENT_KEY, artifacts_version};
use cookdeps::package_writer::{FFileOplog, IOplogReader};
use cookdeps::save_context::ESaveRealm;
use cookdeps::save_package::load_messages;
use cookdeps::Config;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;

#[derive(Parser, Debug)]
struct ActionList {
    #[arg(index = 1)]
    oplog: PathBuf,
}

#[derive(Parser, Debug)]
struct ActionInspect {
    #[arg(index = 1)]
    oplog: PathBuf,
    #[arg(index = 2)]
    package: String,
}

#[derive(Parser, Debug)]
struct ActionVerify {
    #[arg(index = 1)]
    oplog: PathBuf,
}

#[derive(Parser, Debug)]
enum Action {
    /// List packages of an oplog with their stored keys
    List(ActionList),
    /// Dump the cook attachments and header tables of a package as JSON
    Inspect(ActionInspect),
    /// Check that every record of an oplog can be loaded
    Verify(ActionVerify),
}

#[derive(Parser, Debug)]
struct Args {
    #[arg(short, long, default_value = "false")]
    verbose: bool,
    #[arg(short, long, default_value = "false")]
    debug: bool,
    /// JSON file overriding the default save settings
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    action: Action,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let log = Log::new(args.verbose, args.debug);

    match args.action {
        Action::List(action) => action_list(action, &config),
        Action::Inspect(action) => action_inspect(action),
        Action::Verify(action) => action_verify(action, &config, &log),
    }
}

fn open_oplog(path: &Path) -> Result<FFileOplog> {
    if !path.join("oplog.json").is_file() {
        bail!("{} is not an oplog directory", path.display());
    }
    FFileOplog::open(path)
}

fn load_artifacts(oplog: &FFileOplog, package_name: &str, config: &Config) -> Result<FPackageArtifacts> {
    let data = oplog
        .read_attachment(package_name, ARTIFACTS_ATTACHMENT_KEY)?
        .with_context(|| format!("{package_name} has no artifacts"))?;
    FPackageArtifacts::load(package_name, &data, artifacts_version(config))
}

fn action_list(args: ActionList, config: &Config) -> Result<()> {
    let oplog = open_oplog(&args.oplog)?;

    for package_name in oplog.packages() {
        match load_artifacts(&oplog, &package_name, config) {
            Ok(artifacts) => {
                let kind = if artifacts.has_save_results() { "save" } else { "load" };
                println!("{}  {kind}  {package_name}", artifacts.get_stored_key());
            }
            Err(_) => println!("{:40}  ----  {package_name}", "<invalid>"),
        }
    }
    Ok(())
}

fn tables_json(tables: &FLinkerTables) -> Result<serde_json::Value> {
    let imports = (0..tables.imports.len())
        .map(|i| tables.object_path(FPackageIndex::from_import(i)))
        .collect::<Result<Vec<_>>>()?;
    let exports = tables
        .exports
        .iter()
        .enumerate()
        .map(|(i, export)| -> Result<serde_json::Value> {
            let class = if export.class_index.is_null() { None } else { Some(tables.object_path(export.class_index)?) };
            Ok(json!({
                "path": tables.object_path(FPackageIndex::from_export(i))?,
                "class": class,
                "flags": export.object_flags,
            }))
        })
        .collect::<Result<Vec<_>>>()?;
    let preload_dependencies = tables.preload_dependencies.iter().map(ToString::to_string).collect::<Vec<_>>();
    Ok(json!({
        "names": tables.name_map.names(),
        "imports": imports,
        "exports": exports,
        "preload_dependencies": preload_dependencies,
        "soft_object_paths": tables.soft_object_paths,
        "prestream_packages": tables.prestream_packages,
    }))
}

fn action_inspect(args: ActionInspect) -> Result<()> {
    let oplog = open_oplog(&args.oplog)?;
    if !oplog.packages().contains(&args.package) {
        bail!("{} is not in the oplog", args.package);
    }

    let mut attachments = serde_json::Map::new();
    for key in oplog.attachment_keys(&args.package) {
        let data = oplog.read_attachment(&args.package, &key)?.with_context(|| format!("missing attachment {key}"))?;
        let value = load_compact_binary(&data).with_context(|| format!("failed to parse {key}"))?;
        attachments.insert(key, serde_json::to_value(value)?);
    }

    let mut realms = serde_json::Map::new();
    for realm in ESaveRealm::ALL {
        if let Some(data) = oplog.read_package_data(&args.package, realm)? {
            let tables = FLinkerTables::deserialize(&data).with_context(|| format!("failed to parse {realm:?} package data"))?;
            realms.insert(<&str>::from(realm).to_string(), tables_json(&tables)?);
        }
    }

    let output = json!({
        "package": args.package,
        "attachments": attachments,
        "realms": realms,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn verify_package(oplog: &FFileOplog, package_name: &str, config: &Config) -> Result<()> {
    let artifacts = load_artifacts(oplog, package_name, config)?;
    if artifacts.get_package_name() != package_name {
        bail!("artifacts of {package_name} were loaded for {}", artifacts.get_package_name());
    }
    if artifacts.get_stored_key().is_zero() {
        bail!("{package_name} has no stored key");
    }
    if oplog.read_package_data(package_name, ESaveRealm::Game)?.is_none() {
        bail!("{package_name} has no Game realm data");
    }
    for realm in ESaveRealm::ALL {
        if let Some(data) = oplog.read_package_data(package_name, realm)? {
            let tables = FLinkerTables::deserialize(&data).with_context(|| format!("{package_name}: bad {realm:?} package data"))?;
            if !tables.package_name.eq_ignore_ascii_case(package_name) {
                bail!("{package_name}: package data belongs to {}", tables.package_name);
            }
        }
    }
    if let Some(data) = oplog.read_attachment(package_name, LOGS_ATTACHMENT_KEY)? {
        load_messages(&data).with_context(|| format!("{package_name}: bad cook log"))?;
    }
    Ok(())
}

fn action_verify(args: ActionVerify, config: &Config, log: &Log) -> Result<()> {
    let oplog = open_oplog(&args.oplog)?;
    let packages = oplog.packages();

    let progress = ProgressBar::new(packages.len() as u64);
    progress.set_style(ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")?);
    log.set_progress(Some(&progress));

    let mut failed = 0;
    for package_name in &packages {
        progress.set_message(package_name.clone());
        if let Err(err) = verify_package(&oplog, package_name, config) {
            log.message(ELogVerbosity::Error, &format!("{err:#}"));
            failed += 1;
        }
        progress.inc(1);
    }
    progress.finish_and_clear();
    log.set_progress(None);

    if failed != 0 {
        bail!("{failed} of {} packages failed verification", packages.len());
    }
    println!("verified {} packages", packages.len());
    Ok(())
}
