use serde::{Deserialize, Serialize};

use crate::object::EObjectMark;

/// Capabilities of the platform a package is cooked for
pub trait ITargetPlatform: Send + Sync {
    fn platform_name(&self) -> &str;
    fn allows_editor_objects(&self) -> bool;
    fn is_server_only(&self) -> bool;
    fn is_client_only(&self) -> bool;
    fn is_little_endian(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FTargetPlatform {
    pub name: String,
    pub allows_editor_objects: bool,
    pub server_only: bool,
    pub client_only: bool,
    pub little_endian: bool,
}
impl FTargetPlatform {
    /// Cooked game platform that needs both client and server data
    pub fn game(name: &str) -> Self {
        Self {
            name: name.to_string(),
            allows_editor_objects: false,
            server_only: false,
            client_only: false,
            little_endian: true,
        }
    }
    pub fn client(name: &str) -> Self {
        Self { client_only: true, ..Self::game(name) }
    }
    pub fn server(name: &str) -> Self {
        Self { server_only: true, ..Self::game(name) }
    }
    /// Uncooked editor platform
    pub fn editor(name: &str) -> Self {
        Self { allows_editor_objects: true, ..Self::game(name) }
    }
}
impl ITargetPlatform for FTargetPlatform {
    fn platform_name(&self) -> &str {
        &self.name
    }
    fn allows_editor_objects(&self) -> bool {
        self.allows_editor_objects
    }
    fn is_server_only(&self) -> bool {
        self.server_only
    }
    fn is_client_only(&self) -> bool {
        self.client_only
    }
    fn is_little_endian(&self) -> bool {
        self.little_endian
    }
}

/// Marks of objects that must be rejected when cooking for the platform.
/// NotForTargetPlatform is always excluded so a platform can drop an object and everything inside it.
pub fn get_excluded_object_marks_for_target_platform(target_platform: Option<&dyn ITargetPlatform>) -> EObjectMark {
    let mut marks = EObjectMark::NOT_FOR_TARGET_PLATFORM;
    if let Some(platform) = target_platform {
        if !platform.allows_editor_objects() {
            marks |= EObjectMark::EDITOR_ONLY;
        }
        if platform.is_server_only() {
            marks |= EObjectMark::NOT_FOR_SERVER;
        } else if platform.is_client_only() {
            marks |= EObjectMark::NOT_FOR_CLIENT;
        }
    }
    marks
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_excluded_marks() {
        assert_eq!(EObjectMark::NOT_FOR_TARGET_PLATFORM, get_excluded_object_marks_for_target_platform(None));
        assert_eq!(
            EObjectMark::NOT_FOR_TARGET_PLATFORM,
            get_excluded_object_marks_for_target_platform(Some(&FTargetPlatform::editor("WindowsEditor")))
        );
        assert_eq!(
            EObjectMark::NOT_FOR_TARGET_PLATFORM | EObjectMark::EDITOR_ONLY,
            get_excluded_object_marks_for_target_platform(Some(&FTargetPlatform::game("Windows")))
        );
        assert_eq!(
            EObjectMark::NOT_FOR_TARGET_PLATFORM | EObjectMark::EDITOR_ONLY | EObjectMark::NOT_FOR_CLIENT,
            get_excluded_object_marks_for_target_platform(Some(&FTargetPlatform::client("WindowsClient")))
        );
        let weird = FTargetPlatform { client_only: true, ..FTargetPlatform::server("LinuxServer") };
        assert_eq!(
            EObjectMark::NOT_FOR_TARGET_PLATFORM | EObjectMark::EDITOR_ONLY | EObjectMark::NOT_FOR_SERVER,
            get_excluded_object_marks_for_target_platform(Some(&weird))
        );
    }
}
