//! Over-the-air installation manifests.

use crate::error::{ResignError, Result};
use plist::{Dictionary, Value};
use std::path::Path;

pub const DEFAULT_BUNDLE_VERSION: &str = "1.0";

/// Everything a manifest needs besides the package URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRequest {
    pub base_url: String,
    pub title: String,
    pub icon_url: Option<String>,
    pub full_size_icon_url: Option<String>,
    pub bundle_version: Option<String>,
}

impl ManifestRequest {
    pub fn new<S: Into<String>, T: Into<String>>(base_url: S, title: T) -> Self {
        Self {
            base_url: base_url.into(),
            title: title.into(),
            icon_url: None,
            full_size_icon_url: None,
            bundle_version: None,
        }
    }

    /// URL the signed archive will be served from.
    pub fn package_url(&self, archive_name: &str) -> String {
        format!("{}/download/{}", self.base_url.trim_end_matches('/'), archive_name)
    }

    /// URL the manifest for `archive_name` will be served from.
    pub fn manifest_url(&self, archive_name: &str) -> String {
        format!(
            "{}/manifest/{}",
            self.base_url.trim_end_matches('/'),
            manifest_file_name(archive_name)
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManifestBuilder<'a> {
    icon_url: Option<&'a str>,
    full_size_icon_url: Option<&'a str>,
    version: Option<&'a str>,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn icon_url(mut self, url: Option<&'a str>) -> Self {
        self.icon_url = url;
        self
    }

    pub fn full_size_icon_url(mut self, url: Option<&'a str>) -> Self {
        self.full_size_icon_url = url;
        self
    }

    pub fn version(mut self, version: Option<&'a str>) -> Self {
        self.version = version;
        self
    }

    pub fn from_request(request: &'a ManifestRequest) -> Self {
        Self::new()
            .icon_url(request.icon_url.as_deref())
            .full_size_icon_url(request.full_size_icon_url.as_deref())
            .version(request.bundle_version.as_deref())
    }

    /// Serialize the manifest as an XML property list.
    pub fn build(&self, bundle_id: &str, package_url: &str, title: &str) -> Result<Vec<u8>> {
        let required = [
            ("bundle id", bundle_id),
            ("package url", package_url),
            ("title", title),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ResignError::InputValidation(format!(
                    "manifest {} must not be empty",
                    field
                )));
            }
        }

        let mut assets = vec![asset("software-package", package_url, false)];
        if let Some(url) = self.icon_url {
            assets.push(asset("display-image", url, true));
        }
        if let Some(url) = self.full_size_icon_url {
            assets.push(asset("full-size-image", url, true));
        }

        let mut metadata = Dictionary::new();
        metadata.insert("bundle-identifier".into(), bundle_id.into());
        metadata.insert(
            "bundle-version".into(),
            self.version.unwrap_or(DEFAULT_BUNDLE_VERSION).into(),
        );
        metadata.insert("kind".into(), "software".into());
        metadata.insert("platform-identifier".into(), "ios".into());
        metadata.insert("title".into(), title.into());

        let mut item = Dictionary::new();
        item.insert("assets".into(), Value::Array(assets));
        item.insert("metadata".into(), Value::Dictionary(metadata));

        let mut root = Dictionary::new();
        root.insert("items".into(), Value::Array(vec![Value::Dictionary(item)]));

        let mut out = Vec::new();
        plist::to_writer_xml(&mut out, &Value::Dictionary(root))
            .map_err(|e| ResignError::Packaging(format!("cannot serialize manifest: {}", e)))?;
        Ok(out)
    }
}

fn asset(kind: &str, url: &str, needs_shine: bool) -> Value {
    let mut dict = Dictionary::new();
    dict.insert("kind".into(), kind.into());
    if needs_shine {
        dict.insert("needs-shine".into(), Value::Boolean(true));
    }
    dict.insert("url".into(), url.into());
    Value::Dictionary(dict)
}

pub fn installation_url(manifest_url: &str) -> String {
    format!("itms-services://?action=download-manifest&url={}", manifest_url)
}

/// `signed.ipa` -> `manifest_signed.ipa.plist`
pub fn manifest_file_name<P: AsRef<Path>>(archive: P) -> String {
    let name = archive
        .as_ref()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("manifest_{}.plist", name)
}
