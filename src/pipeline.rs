//! Runs the re-signing stages in order and owns the run's scratch storage.
//!
//! Everything sensitive lives under one private scratch directory: the
//! extracted archive and the credential PEMs. Both are released through
//! guards, so a run that fails, panics or is cancelled leaves nothing behind.

use crate::bundle::AppBundle;
use crate::classify::signable_files;
use crate::config::{BackendKind, PipelineConfig};
use crate::credential::CredentialStore;
use crate::error::{ResignError, Result};
use crate::ipa::{extract_ipa, ArchiveBuilder};
use crate::manifest::ManifestBuilder;
use crate::profile::ProvisioningProfile;
use crate::request::SigningRequest;
use crate::signer::{NativeCms, OpensslCms, SignatureBackend, Signer, SigningReport};
use crate::tool::OpensslTool;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

/// Shared stop request. Checked between stages and between signed files.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self, stage: &'static str) -> Result<()> {
        if self.is_cancelled() {
            Err(ResignError::Cancelled(stage))
        } else {
            Ok(())
        }
    }
}

/// Private temporary directory removed on drop.
struct ScratchDir {
    dir: Option<TempDir>,
}

impl ScratchDir {
    fn create(root: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("resigner-");
        let dir = match root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| ResignError::Archive(format!("cannot create scratch directory: {}", e)))?;
        debug!("scratch directory {}", dir.path().display());
        Ok(Self { dir: Some(dir) })
    }

    fn path(&self) -> &Path {
        self.dir.as_ref().map(TempDir::path).unwrap_or(Path::new(""))
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("failed to remove scratch directory {}: {}", path.display(), e);
            }
        }
    }
}

struct Extracted {
    bundle: AppBundle,
}

struct Prepared {
    bundle: AppBundle,
    profile: ProvisioningProfile,
    bundle_id: String,
}

struct Signed {
    prepared: Prepared,
    report: SigningReport,
}

/// What a successful run hands back. The pipeline keeps no reference to it.
#[derive(Debug, Clone)]
pub struct SignedArtifact {
    pub archive_path: PathBuf,
    pub manifest: Option<Vec<u8>>,
    pub bundle_id: String,
    pub report: SigningReport,
}

pub struct Pipeline {
    config: PipelineConfig,
    openssl: Option<OpensslTool>,
    scratch_root: Option<PathBuf>,
    cancel: CancelFlag,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let openssl = OpensslTool::locate(config.openssl_path.as_deref(), config.tool_timeout());
        match &openssl {
            Some(tool) => debug!("using openssl at {}", tool.path().display()),
            None if config.backend == BackendKind::Openssl => {
                return Err(ResignError::Config(
                    "the openssl backend needs an openssl binary".to_string(),
                ))
            }
            None => debug!("openssl not found; only native decoding is available"),
        }

        Ok(Self {
            config,
            openssl,
            scratch_root: None,
            cancel: CancelFlag::default(),
        })
    }

    /// Create scratch directories under `root` instead of the system temp dir.
    pub fn with_scratch_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Re-sign `request.archive()`. Scratch storage and key material are
    /// gone by the time this returns, whatever the outcome.
    pub fn run(&self, request: &SigningRequest) -> Result<SignedArtifact> {
        let scratch = ScratchDir::create(self.scratch_root.as_deref())?;

        let extracted = self.extract(request, scratch.path())?;
        let prepared = self.prepare(request, extracted)?;
        let signed = self.sign(request, prepared, scratch.path())?;
        self.package(request, signed)
    }

    fn extract(&self, request: &SigningRequest, scratch: &Path) -> Result<Extracted> {
        self.cancel.check("extraction")?;
        let bundle = extract_ipa(request.archive(), scratch.join("extracted"))?;
        info!("extracted {}", bundle.name());
        Ok(Extracted { bundle })
    }

    fn prepare(&self, request: &SigningRequest, extracted: Extracted) -> Result<Prepared> {
        self.cancel.check("profile parsing")?;
        let profile = self.load_profile(request, &extracted.bundle)?;
        Ok(Prepared {
            bundle_id: profile.bundle_id().to_string(),
            bundle: extracted.bundle,
            profile,
        })
    }

    fn sign(&self, request: &SigningRequest, prepared: Prepared, scratch: &Path) -> Result<Signed> {
        let report = self.sign_bundle(request, &prepared.bundle, scratch)?;
        Ok(Signed { prepared, report })
    }

    fn package(&self, request: &SigningRequest, signed: Signed) -> Result<SignedArtifact> {
        self.cancel.check("packaging")?;
        let Signed { prepared, report } = signed;
        let Prepared {
            bundle,
            profile,
            bundle_id,
        } = prepared;

        bundle.write_entitlements(&profile.entitlements_xml()?)?;
        bundle.embed_profile(&profile.to_bytes()?)?;

        let output = match request.output() {
            Some(path) => path.to_path_buf(),
            None => default_output(request.archive()),
        };
        let builder =
            ArchiveBuilder::new(self.config.compression_level, self.config.min_size_ratio);
        let archive_path = builder.build(&bundle, request.archive(), &output)?;

        let manifest = match self.build_manifest(request, &bundle, &bundle_id, &archive_path) {
            Ok(manifest) => manifest,
            Err(e) => {
                let _ = fs::remove_file(&archive_path);
                return Err(e);
            }
        };

        Ok(SignedArtifact {
            archive_path,
            manifest,
            bundle_id,
            report,
        })
    }

    fn load_profile(
        &self,
        request: &SigningRequest,
        bundle: &AppBundle,
    ) -> Result<ProvisioningProfile> {
        let mut profile = ProvisioningProfile::parse(request.profile())?;
        if !request.devices().is_empty() {
            profile = profile.with_devices(request.devices());
            info!(
                "profile now lists {} device(s)",
                profile.devices().map(<[String]>::len).unwrap_or(0)
            );
        }

        if let Some(own) = bundle.bundle_identifier() {
            if !profile.is_wildcard() && own != profile.bundle_id() {
                warn!(
                    "bundle identifier {} differs from profile identifier {}",
                    own,
                    profile.bundle_id()
                );
            }
        }
        Ok(profile)
    }

    /// Extract the credential, sign every binary, then drop the credential
    /// so the key files are removed before packaging starts.
    fn sign_bundle(
        &self,
        request: &SigningRequest,
        bundle: &AppBundle,
        scratch: &Path,
    ) -> Result<SigningReport> {
        self.cancel.check("credential extraction")?;
        let store = CredentialStore::new(self.config.strategies.clone(), self.openssl.clone());
        let credential = store.extract(
            request.certificate(),
            request.password(),
            scratch.join("credential"),
        )?;
        info!(
            "signing as {}",
            credential.common_name().unwrap_or("<unnamed identity>")
        );

        self.cancel.check("classification")?;
        let files = signable_files(&bundle.path, Some(&bundle.executable));
        debug!("{} signable file(s)", files.len());

        self.cancel.check("signing")?;
        let backend: Box<dyn SignatureBackend> = match (self.config.backend, &self.openssl) {
            (BackendKind::Native, _) => Box::new(NativeCms::new(&credential)?),
            (BackendKind::Openssl, Some(tool)) => {
                Box::new(OpensslCms::new(tool.clone(), &credential))
            }
            (BackendKind::Openssl, None) => {
                return Err(ResignError::Config("openssl is not available".to_string()))
            }
        };
        let report = Signer::new(backend.as_ref()).sign_all(&files, &self.cancel)?;

        info!(
            "signed {} file(s), {} failed, {} skipped",
            report.signed(),
            report.failed(),
            report.skipped()
        );
        if report.signed() == 0 {
            return Err(ResignError::Signing(format!(
                "no file could be signed ({} candidate(s), {} failed)",
                files.len(),
                report.failed()
            )));
        }
        Ok(report)
    }

    fn build_manifest(
        &self,
        request: &SigningRequest,
        bundle: &AppBundle,
        bundle_id: &str,
        archive_path: &Path,
    ) -> Result<Option<Vec<u8>>> {
        let Some(manifest) = request.manifest() else {
            return Ok(None);
        };
        let archive_name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let version = manifest.bundle_version.as_deref().or(bundle.short_version());

        ManifestBuilder::from_request(manifest)
            .version(version)
            .build(bundle_id, &manifest.package_url(&archive_name), &manifest.title)
            .map(Some)
    }
}

/// `signed_<uuid>.ipa` next to the input archive.
fn default_output(input: &Path) -> PathBuf {
    let name = format!("signed_{}.ipa", Uuid::new_v4().simple());
    match input.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}
