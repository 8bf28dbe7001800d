use crate::error::{ResignError, Result};
use crate::manifest::ManifestRequest;
use crate::profile::validate_udid;
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Inputs for one re-signing run. Only constructed through [`SigningRequest::new`],
/// so every instance has existing input files, a non-empty password and
/// well-formed device ids.
#[derive(Clone)]
pub struct SigningRequest {
    archive: PathBuf,
    certificate: PathBuf,
    password: Zeroizing<String>,
    profile: PathBuf,
    devices: Vec<String>,
    output: Option<PathBuf>,
    manifest: Option<ManifestRequest>,
}

impl SigningRequest {
    pub fn new<A, C, P>(archive: A, certificate: C, password: &str, profile: P) -> Result<Self>
    where
        A: AsRef<Path>,
        C: AsRef<Path>,
        P: AsRef<Path>,
    {
        let archive = existing_file(archive.as_ref())?;
        let certificate = existing_file(certificate.as_ref())?;
        let profile = existing_file(profile.as_ref())?;

        if password.is_empty() {
            return Err(ResignError::InputValidation(
                "certificate password must not be empty".to_string(),
            ));
        }

        Ok(Self {
            archive,
            certificate,
            password: Zeroizing::new(password.to_string()),
            profile,
            devices: Vec::new(),
            output: None,
            manifest: None,
        })
    }

    /// Devices to authorize in the embedded profile.
    pub fn with_devices<S: AsRef<str>>(mut self, devices: &[S]) -> Result<Self> {
        for udid in devices {
            validate_udid(udid.as_ref())?;
        }
        self.devices = devices.iter().map(|d| d.as_ref().to_string()).collect();
        Ok(self)
    }

    pub fn with_output<P: Into<PathBuf>>(mut self, output: P) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_manifest(mut self, manifest: ManifestRequest) -> Result<Self> {
        if manifest.base_url.trim().is_empty() {
            return Err(ResignError::InputValidation("base url must not be empty".to_string()));
        }
        if manifest.title.trim().is_empty() {
            return Err(ResignError::InputValidation("title must not be empty".to_string()));
        }
        self.manifest = Some(manifest);
        Ok(self)
    }

    pub fn archive(&self) -> &Path {
        &self.archive
    }

    pub fn certificate(&self) -> &Path {
        &self.certificate
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn profile(&self) -> &Path {
        &self.profile
    }

    pub fn devices(&self) -> &[String] {
        &self.devices
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    pub fn manifest(&self) -> Option<&ManifestRequest> {
        self.manifest.as_ref()
    }
}

impl fmt::Debug for SigningRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningRequest")
            .field("archive", &self.archive)
            .field("certificate", &self.certificate)
            .field("password", &"<redacted>")
            .field("profile", &self.profile)
            .field("devices", &self.devices)
            .field("output", &self.output)
            .field("manifest", &self.manifest)
            .finish()
    }
}

fn existing_file(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(ResignError::FileNotFound(path.to_path_buf()))
    }
}
