use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{Read, Write};

use anyhow::{Context, Result};
use tracing::instrument;

use crate::{break_down_name_string, compare_ignore_case, ser::*};

/// Reference into a package name map: base name index plus the FName number (0 means no number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FMappedName {
    pub index: u32,
    pub number: u32,
}
impl Readable for FMappedName {
    #[instrument(skip_all, name = "FMappedName")]
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        Ok(Self {
            index: s.de()?,
            number: s.de()?,
        })
    }
}
impl Writeable for FMappedName {
    #[instrument(skip_all, name = "FMappedName")]
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.index)?;
        s.ser(&self.number)
    }
}

/// Name table of a saved package. Base names are stored once; numbered names share their base entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FNameMap {
    names: Vec<String>,
    name_lookup: HashMap<String, usize>,
}
impl FNameMap {
    /// Builds the map from every name referenced by a realm. Base names are ordered case-insensitively
    /// so that the table is independent of harvesting order.
    pub fn create_sorted<I, T>(names: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut base_names: Vec<String> = names.into_iter().map(|n| break_down_name_string(n.as_ref()).0.to_string()).collect();
        base_names.sort_by(|a, b| compare_ignore_case(a, b).then_with(|| a.cmp(b)));
        base_names.dedup();
        Self::create_from_names(base_names)
    }
    pub fn create_from_names(names: Vec<String>) -> Self {
        let name_lookup = names.iter().cloned().enumerate().map(|(i, n)| (n, i)).collect();
        Self { names, name_lookup }
    }
    pub fn names(&self) -> &[String] {
        &self.names
    }
    pub fn num_names(&self) -> usize {
        self.names.len()
    }

    pub fn get(&self, name: FMappedName) -> Result<Cow<'_, str>> {
        let n = self.names.get(name.index as usize).with_context(|| format!("name index {} out of range ({} names)", name.index, self.names.len()))?;
        Ok(if name.number != 0 { format!("{n}_{}", name.number - 1).into() } else { n.into() })
    }

    /// Maps a name that must already be present
    pub fn find(&self, name: &str) -> Result<FMappedName> {
        let (name_without_number, name_number) = break_down_name_string(name);
        let index = self.name_lookup.get(name_without_number).with_context(|| format!("name {name:?} missing from name map"))?;
        Ok(FMappedName { index: *index as u32, number: name_number as u32 })
    }
}
impl Readable for FNameMap {
    #[instrument(skip_all, name = "FNameMap")]
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        Ok(Self::create_from_names(s.de()?))
    }
}
impl Writeable for FNameMap {
    #[instrument(skip_all, name = "FNameMap")]
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.names)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_sorted_name_map() -> Result<()> {
        let map = FNameMap::create_sorted(["Mesh_2", "actor", "Mesh", "Actor", "/Game/Foo"]);
        assert_eq!(&["/Game/Foo", "Actor", "actor", "Mesh"], map.names());

        let mesh = map.find("Mesh_2")?;
        assert_eq!(FMappedName { index: 3, number: 3 }, mesh);
        assert_eq!("Mesh_2", map.get(mesh)?);
        assert!(map.find("Missing").is_err());
        Ok(())
    }

    #[test]
    fn test_name_map_serialization() -> Result<()> {
        let map = FNameMap::create_sorted(["Rocket_04", "Rocket_4"]);
        let rocket = map.find("Rocket_04")?;
        let numbered = map.find("Rocket_4")?;
        assert_eq!(2, map.num_names());
        assert_ne!(rocket.index, numbered.index);

        let mut buf = vec![];
        WriteExt::ser(&mut buf, &map)?;
        let read: FNameMap = Cursor::new(buf).de()?;
        assert_eq!(map, read);
        assert_eq!("Rocket_04", read.get(rocket)?);
        assert_eq!("Rocket_4", read.get(numbered)?);
        Ok(())
    }
}
