pub mod build_dependency_set;
pub mod compact_binary;
pub mod cook_dependency;
pub mod harvester;
pub mod incremental;
pub mod linker;
pub mod logging;
pub mod name_map;
pub mod object;
pub mod package_artifacts;
pub mod package_writer;
pub mod save_context;
pub mod save_package;
pub mod ser;
pub mod services;
pub mod target_platform;

use anyhow::{Context, Result};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::io::{Read, Write};
use std::path::Path;

use ser::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Also harvest and write the Editor realm during a save
    pub save_editor_realm: bool,
    /// Harvest optional objects into the Optional realm when cooking
    pub save_optional_realm: bool,
    /// Editor-only objects are stripped from the Game realm when the target platform disallows them
    pub can_strip_editor_only_imports_and_exports: bool,
    /// Imports from other content packages become Package build dependencies of the Save result
    pub record_import_package_dependencies: bool,
    /// Overrides the artifacts version that is written and expected; testing only
    pub artifacts_version_override: Option<u32>,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            save_editor_realm: false,
            save_optional_realm: true,
            can_strip_editor_only_imports_and_exports: true,
            record_import_package_dependencies: true,
            artifacts_version_override: None,
        }
    }
}
impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        serde_json::from_slice(&data).with_context(|| format!("failed to parse config {}", path.display()))
    }
}

/// 160 bit content hash, the leading bytes of a blake3 digest
#[serde_as]
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct FIoHash(#[serde_as(as = "serde_with::hex::Hex")] pub [u8; 20]);
impl FIoHash {
    pub const ZERO: FIoHash = FIoHash([0; 20]);

    pub fn from_blake3(hash: &[u8; 32]) -> FIoHash {
        let mut data = [0; 20];
        data.copy_from_slice(&hash[0..20]);
        Self(data)
    }
    pub fn hash_buffer(data: &[u8]) -> FIoHash {
        Self::from_blake3(blake3::hash(data).as_bytes())
    }
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}
impl Readable for FIoHash {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        Ok(Self(stream.de()?))
    }
}
impl Writeable for FIoHash {
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.0)
    }
}
impl std::fmt::Debug for FIoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FIoHash({self})")
    }
}
impl Display for FIoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

// UTF-8 path with '/' as separator
pub type UEPath = typed_path::Utf8UnixPath;
pub type UEPathBuf = typed_path::Utf8UnixPathBuf;

/// Case-insensitive comparison of names and paths, ASCII only like the engine's Stricmp
pub fn compare_ignore_case(a: &str, b: &str) -> Ordering {
    a.bytes().map(|c| c.to_ascii_lowercase()).cmp(b.bytes().map(|c| c.to_ascii_lowercase()))
}

/// Package name of a long object path: "/Game/Maps/Entry.Entry:PersistentLevel" -> "/Game/Maps/Entry"
pub fn package_name_of_path(path: &str) -> &str {
    path.split_once(['.', ':']).map(|(package, _)| package).unwrap_or(path)
}

/// Packages under /Script are native and never carry content digests
pub fn is_script_package(package_name: &str) -> bool {
    package_name.starts_with("/Script/")
}

// Breaks down a combined FName string into a base name and a number. Number is 0 if there is no number
pub(crate) fn break_down_name_string<'a>(name: &'a str) -> (&'a str, i32) {
    let mut name_without_number: &'a str = name;
    let mut name_number: i32 = 0; // 0 means no number

    // Right part needs to be parsed as a valid signed integer that is >= 0 and converts back to the same string
    // Rocket_04 stays a part of the name, otherwise we would actually get Rocket_4 when deserializing
    if let Some((left, right)) = name.rsplit_once('_') {
        if let Ok(parsed_number) = right.parse::<i32>() {
            if parsed_number >= 0 && parsed_number.to_string() == right {
                name_without_number = left;
                name_number = parsed_number + 1; // stored as 1 more than the actual number
            }
        }
    }
    (name_without_number, name_number)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_compare_ignore_case() {
        assert_eq!(Ordering::Equal, compare_ignore_case("/Game/Foo", "/game/FOO"));
        assert_eq!(Ordering::Less, compare_ignore_case("/Game/a", "/Game/B"));
        assert_eq!(Ordering::Less, compare_ignore_case("/Game/A", "/Game/AB"));
    }

    #[test]
    fn test_package_name_of_path() {
        assert_eq!("/Game/Maps/Entry", package_name_of_path("/Game/Maps/Entry.Entry:PersistentLevel"));
        assert_eq!("/Game/Maps/Entry", package_name_of_path("/Game/Maps/Entry"));
    }

    #[test]
    fn test_break_down_name_string() {
        assert_eq!(("Rocket", 5), break_down_name_string("Rocket_4"));
        assert_eq!(("Rocket_04", 0), break_down_name_string("Rocket_04"));
        assert_eq!(("Default__Actor", 0), break_down_name_string("Default__Actor"));
    }

    #[test]
    fn test_io_hash_display() {
        let hash = FIoHash::hash_buffer(b"abc");
        assert_eq!(40, hash.to_string().len());
        assert!(!hash.is_zero());
        assert_eq!(FIoHash::from_blake3(blake3::hash(b"abc").as_bytes()), hash);
    }
}
