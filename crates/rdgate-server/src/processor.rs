//! Settings post-processing applied after the merge and before the backend
//! connection is opened.
//!
//! A processor may rewrite settings but never the connection type; it only
//! ever sees the descriptor by shared reference.

use rdgate_core::{ConnectionDescriptor, GatewayError, GatewayResult, SettingValue, Settings};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Hook run once per session on its merged settings.
pub trait SettingsProcessor: Send + Sync {
    fn process(
        &self,
        descriptor: &ConnectionDescriptor,
        settings: Settings,
    ) -> GatewayResult<Settings>;
}

/// Leaves settings untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl SettingsProcessor for Passthrough {
    fn process(&self, _: &ConnectionDescriptor, settings: Settings) -> GatewayResult<Settings> {
        Ok(settings)
    }
}

/// Points the backend's virtual drive at a per-user folder under `root`,
/// named by the descriptor's `userFolder`.
#[derive(Debug, Clone)]
pub struct DriveFolder {
    root: PathBuf,
}

impl DriveFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SettingsProcessor for DriveFolder {
    fn process(
        &self,
        descriptor: &ConnectionDescriptor,
        mut settings: Settings,
    ) -> GatewayResult<Settings> {
        let Some(folder) = descriptor.user_folder.as_deref() else {
            return Ok(settings);
        };

        // Exactly one normal path component.
        let mut components = Path::new(folder).components();
        let valid = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) && !folder.contains(['/', '\\']);
        if !valid {
            return Err(GatewayError::SettingsProcessing(format!(
                "invalid user folder {folder:?}"
            )));
        }

        let path = self.root.join(folder);
        debug!(path = %path.display(), "injecting drive path");
        settings.insert(
            "drive-path".into(),
            SettingValue::Text(path.to_string_lossy().into_owned()),
        );
        settings.insert("enable-drive".into(), SettingValue::from("true"));
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(user_folder: Option<&str>) -> ConnectionDescriptor {
        ConnectionDescriptor {
            connection_type: "rdp".into(),
            connection_settings: Settings::new(),
            user_folder: user_folder.map(str::to_string),
        }
    }

    #[test]
    fn passthrough_keeps_settings() {
        let mut s = Settings::new();
        s.insert("width".into(), SettingValue::from("800"));
        let out = Passthrough.process(&descriptor(None), s.clone()).unwrap();
        assert_eq!(out, s);
    }

    #[test]
    fn drive_folder_injects_path() {
        let p = DriveFolder::new("/srv/drives");
        let out = p.process(&descriptor(Some("alice")), Settings::new()).unwrap();
        assert_eq!(out["drive-path"], SettingValue::from("/srv/drives/alice"));
        assert_eq!(out["enable-drive"], SettingValue::from("true"));
    }

    #[test]
    fn drive_folder_without_user_folder_is_noop() {
        let p = DriveFolder::new("/srv/drives");
        assert!(p.process(&descriptor(None), Settings::new()).unwrap().is_empty());
    }

    #[test]
    fn drive_folder_rejects_traversal() {
        let p = DriveFolder::new("/srv/drives");
        for bad in ["..", ".", "", "a/b", "../etc", "/etc", "a\\b"] {
            let err = p.process(&descriptor(Some(bad)), Settings::new()).unwrap_err();
            assert!(matches!(err, GatewayError::SettingsProcessing(_)), "{bad:?}");
        }
    }
}
