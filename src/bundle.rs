use crate::error::{ResignError, Result};
use plist::Value;
use std::fs;
use std::path::{Path, PathBuf};

pub const EMBEDDED_PROFILE: &str = "embedded.mobileprovision";
pub const ENTITLEMENTS_FILE: &str = "archived-expanded-entitlements.xcent";

/// An extracted `.app` directory plus the root it was unpacked under.
#[derive(Debug, Clone)]
pub struct AppBundle {
    pub path: PathBuf,
    pub executable: PathBuf,
    extraction_root: PathBuf,
    info: plist::Dictionary,
}

impl AppBundle {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(extraction_root: P, path: Q) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let plist_path = path.join("Info.plist");

        let info: plist::Dictionary = plist::from_file(&plist_path).map_err(|e| {
            ResignError::Archive(format!("cannot read {}: {}", plist_path.display(), e))
        })?;

        let exec_name = info
            .get("CFBundleExecutable")
            .and_then(Value::as_string)
            .ok_or_else(|| ResignError::Archive("No CFBundleExecutable".to_string()))?;

        // A name like "../x" would escape the bundle.
        if exec_name.is_empty() || exec_name.contains('/') || exec_name == ".." {
            return Err(ResignError::Archive(format!(
                "CFBundleExecutable \"{}\" is not a file name",
                exec_name
            )));
        }

        let executable = path.join(exec_name);
        if !executable.is_file() {
            return Err(ResignError::Archive(format!(
                "main executable {} is missing",
                exec_name
            )));
        }

        Ok(Self {
            path,
            executable,
            extraction_root: extraction_root.as_ref().to_path_buf(),
            info,
        })
    }

    /// Directory name of the bundle, e.g. `Demo.app`.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn extraction_root(&self) -> &Path {
        &self.extraction_root
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.info.get(key).and_then(Value::as_string)
    }

    pub fn bundle_identifier(&self) -> Option<&str> {
        self.get_string("CFBundleIdentifier")
    }

    pub fn short_version(&self) -> Option<&str> {
        self.get_string("CFBundleShortVersionString")
            .or_else(|| self.get_string("CFBundleVersion"))
    }

    /// Replace the bundle's embedded provisioning profile.
    pub fn embed_profile(&self, profile_bytes: &[u8]) -> Result<PathBuf> {
        self.write_file(EMBEDDED_PROFILE, profile_bytes)
    }

    pub fn write_entitlements(&self, entitlements_xml: &[u8]) -> Result<PathBuf> {
        self.write_file(ENTITLEMENTS_FILE, entitlements_xml)
    }

    fn write_file(&self, name: &str, contents: &[u8]) -> Result<PathBuf> {
        let target = self.path.join(name);
        fs::write(&target, contents).map_err(|e| {
            ResignError::Archive(format!("cannot write {}: {}", target.display(), e))
        })?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_plist(exec: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
<key>CFBundleExecutable</key><string>{}</string>
<key>CFBundleIdentifier</key><string>com.example.demo</string>
<key>CFBundleName</key><string>Demo</string>
<key>CFBundleVersion</key><string>42</string>
</dict></plist>"#,
            exec
        )
    }

    #[test]
    fn resolves_executable_from_info_plist() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("Payload/Demo.app");
        fs::create_dir_all(&app).unwrap();
        fs::write(app.join("Info.plist"), info_plist("Demo")).unwrap();
        fs::write(app.join("Demo"), b"\xcf\xfa\xed\xfe").unwrap();

        let bundle = AppBundle::new(dir.path(), &app).unwrap();
        assert_eq!(bundle.executable, app.join("Demo"));
        assert_eq!(bundle.name(), "Demo.app");
        assert_eq!(bundle.bundle_identifier(), Some("com.example.demo"));
        assert_eq!(bundle.short_version(), Some("42"));
        assert_eq!(bundle.get_string("CFBundleName"), Some("Demo"));
        assert_eq!(bundle.extraction_root(), dir.path());
    }

    #[test]
    fn missing_executable_is_an_archive_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("Demo.app");
        fs::create_dir_all(&app).unwrap();
        fs::write(app.join("Info.plist"), info_plist("Demo")).unwrap();

        assert!(matches!(AppBundle::new(dir.path(), &app), Err(ResignError::Archive(_))));
    }

    #[test]
    fn executable_name_cannot_escape() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("Demo.app");
        fs::create_dir_all(&app).unwrap();
        fs::write(app.join("Info.plist"), info_plist("../Other")).unwrap();

        assert!(matches!(AppBundle::new(dir.path(), &app), Err(ResignError::Archive(_))));
    }

    #[test]
    fn embeds_profile_and_entitlements() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("Demo.app");
        fs::create_dir_all(&app).unwrap();
        fs::write(app.join("Info.plist"), info_plist("Demo")).unwrap();
        fs::write(app.join("Demo"), b"bin").unwrap();
        fs::write(app.join(EMBEDDED_PROFILE), b"old").unwrap();

        let bundle = AppBundle::new(dir.path(), &app).unwrap();
        bundle.embed_profile(b"new").unwrap();
        bundle.write_entitlements(b"<plist/>").unwrap();

        assert_eq!(fs::read(app.join(EMBEDDED_PROFILE)).unwrap(), b"new");
        assert_eq!(fs::read(app.join(ENTITLEMENTS_FILE)).unwrap(), b"<plist/>");
    }
}
