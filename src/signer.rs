//! Detached per-file signatures.
//!
//! Each signable file gets a DER-encoded CMS `SignedData` without
//! encapsulated content, written next to it as `<name>.sig`. Failures are
//! recorded per file and never stop the run; the caller decides what an
//! all-failed run means.

use crate::classify::{classify, Classification};
use crate::credential::ExtractedCredential;
use crate::error::{ResignError, Result};
use crate::pipeline::CancelFlag;
use crate::tool::OpensslTool;
use cryptographic_message_syntax::{SignedDataBuilder, SignerBuilder};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair};

pub const SIGNATURE_EXTENSION: &str = "sig";

/// Produces a detached signature over a file's bytes.
pub trait SignatureBackend {
    fn name(&self) -> &'static str;

    fn sign_file(&self, path: &Path, content: &[u8]) -> Result<Vec<u8>>;
}

/// In-process CMS signing.
pub struct NativeCms {
    key: InMemorySigningKeyPair,
    certificate: CapturedX509Certificate,
}

impl NativeCms {
    pub fn new(credential: &ExtractedCredential) -> Result<Self> {
        Ok(Self {
            key: credential.signing_key()?,
            certificate: credential.certificate()?,
        })
    }
}

impl SignatureBackend for NativeCms {
    fn name(&self) -> &'static str {
        "native"
    }

    fn sign_file(&self, _path: &Path, content: &[u8]) -> Result<Vec<u8>> {
        let signer = SignerBuilder::new(&self.key, self.certificate.clone());
        SignedDataBuilder::default()
            .content_external(content.to_vec())
            .signer(signer)
            .build_der()
            .map_err(|e| ResignError::Signing(format!("building CMS signature: {}", e)))
    }
}

/// `openssl cms -sign` against the credential's PEM files.
pub struct OpensslCms {
    tool: OpensslTool,
    cert: PathBuf,
    key: PathBuf,
}

impl OpensslCms {
    pub fn new(tool: OpensslTool, credential: &ExtractedCredential) -> Self {
        Self {
            tool,
            cert: credential.certificate_path().to_path_buf(),
            key: credential.private_key_path().to_path_buf(),
        }
    }
}

impl SignatureBackend for OpensslCms {
    fn name(&self) -> &'static str {
        "openssl"
    }

    fn sign_file(&self, path: &Path, _content: &[u8]) -> Result<Vec<u8>> {
        let args: Vec<OsString> = vec![
            "cms".into(),
            "-sign".into(),
            "-binary".into(),
            "-outform".into(),
            "DER".into(),
            "-signer".into(),
            self.cert.clone().into(),
            "-inkey".into(),
            self.key.clone().into(),
            "-in".into(),
            path.into(),
        ];
        self.tool.run(args, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureRecord {
    Signed {
        path: PathBuf,
        signature: PathBuf,
        sha256: String,
    },
    Skipped {
        path: PathBuf,
    },
    Failed {
        path: PathBuf,
        reason: String,
    },
}

impl SignatureRecord {
    pub fn path(&self) -> &Path {
        match self {
            SignatureRecord::Signed { path, .. }
            | SignatureRecord::Skipped { path }
            | SignatureRecord::Failed { path, .. } => path,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, SignatureRecord::Signed { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigningReport {
    pub records: Vec<SignatureRecord>,
}

impl SigningReport {
    pub fn signed(&self) -> usize {
        self.records.iter().filter(|r| r.is_signed()).count()
    }

    pub fn failed(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r, SignatureRecord::Failed { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r, SignatureRecord::Skipped { .. }))
            .count()
    }
}

pub struct Signer<'a> {
    backend: &'a dyn SignatureBackend,
}

impl<'a> Signer<'a> {
    pub fn new(backend: &'a dyn SignatureBackend) -> Self {
        Self { backend }
    }

    /// Sign one file. Non-binaries are skipped, failures are recorded.
    pub fn sign(&self, path: &Path) -> SignatureRecord {
        if classify(path) == Classification::Resource {
            return SignatureRecord::Skipped {
                path: path.to_path_buf(),
            };
        }

        match self.try_sign(path) {
            Ok((signature, sha256)) => {
                debug!("signed {} with {}", path.display(), self.backend.name());
                SignatureRecord::Signed {
                    path: path.to_path_buf(),
                    signature,
                    sha256,
                }
            }
            Err(e) => {
                let name = path.file_name().unwrap_or(path.as_os_str()).to_string_lossy();
                warn!("failed to sign {}: {}", name, e);
                SignatureRecord::Failed {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            }
        }
    }

    fn try_sign(&self, path: &Path) -> Result<(PathBuf, String)> {
        let content = fs::read(path)
            .map_err(|e| ResignError::Signing(format!("reading {}: {}", path.display(), e)))?;
        let signature = self.backend.sign_file(path, &content)?;

        let target = signature_path(path);
        fs::write(&target, &signature)
            .map_err(|e| ResignError::Signing(format!("writing {}: {}", target.display(), e)))?;

        Ok((target, hex::encode(Sha256::digest(&content))))
    }

    /// Sign `files` in order, checking `cancel` before each one.
    pub fn sign_all(&self, files: &[PathBuf], cancel: &CancelFlag) -> Result<SigningReport> {
        let mut report = SigningReport::default();
        for path in files {
            if cancel.is_cancelled() {
                return Err(ResignError::Cancelled("signing"));
            }
            report.records.push(self.sign(path));
        }
        Ok(report)
    }
}

/// `Demo` -> `Demo.sig`, `libA.dylib` -> `libA.dylib.sig`.
pub fn signature_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".");
    name.push(SIGNATURE_EXTENSION);
    path.with_file_name(name)
}
