//! Signing credential extraction from PKCS#12 containers.
//!
//! The certificate and the private key are pulled out independently, each
//! through the same ordered list of [`DecodeStrategy`] values. The first
//! strategy that yields a PEM block wins. When every strategy fails the error
//! of the *last* attempt is reported, since the later strategies are the more
//! permissive ones.

use crate::error::{ResignError, Result};
use crate::tool::{OpensslTool, PASSWORD_ENV};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use x509_certificate::{CapturedX509Certificate, InMemorySigningKeyPair, Sign};
use zeroize::Zeroizing;

/// Subject markers of certificates that may sign iOS applications.
pub const IOS_SIGNING_MARKERS: &[&str] = &[
    "iPhone Developer",
    "iPhone Distribution",
    "Apple Development",
    "Apple Distribution",
];

const CERT_FILE: &str = "signer.crt.pem";
const KEY_FILE: &str = "signer.key.pem";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecodeStrategy {
    /// In-process PKCS#12 decoding (3DES / RC2 containers).
    Native,
    /// `openssl pkcs12` with the default provider (PBES2 / AES containers).
    OpensslModern,
    /// `openssl pkcs12 -legacy` for RC2-40 and friends under OpenSSL 3.
    OpensslLegacy,
    /// `-legacy -nomacver`, the most permissive decoder.
    OpensslPassthrough,
}

impl DecodeStrategy {
    pub const DEFAULT_ORDER: [DecodeStrategy; 4] = [
        DecodeStrategy::Native,
        DecodeStrategy::OpensslModern,
        DecodeStrategy::OpensslLegacy,
        DecodeStrategy::OpensslPassthrough,
    ];

    pub fn needs_openssl(self) -> bool {
        !matches!(self, DecodeStrategy::Native)
    }

    fn openssl_flags(self) -> &'static [&'static str] {
        match self {
            DecodeStrategy::Native | DecodeStrategy::OpensslModern => &[],
            DecodeStrategy::OpensslLegacy => &["-legacy"],
            DecodeStrategy::OpensslPassthrough => &["-legacy", "-nomacver"],
        }
    }
}

impl fmt::Display for DecodeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecodeStrategy::Native => "native",
            DecodeStrategy::OpensslModern => "openssl-modern",
            DecodeStrategy::OpensslLegacy => "openssl-legacy",
            DecodeStrategy::OpensslPassthrough => "openssl-passthrough",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Certificate,
    PrivateKey,
}

impl Part {
    fn pem_tag(self) -> &'static str {
        match self {
            Part::Certificate => "CERTIFICATE",
            Part::PrivateKey => "PRIVATE KEY",
        }
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Part::Certificate => "certificate",
            Part::PrivateKey => "private key",
        })
    }
}

/// Certificate and key material pulled out of a container.
///
/// The PEM files live in a private directory of the run's scratch space and
/// are removed when the value is dropped.
pub struct ExtractedCredential {
    certificate_pem: Vec<u8>,
    private_key_pem: Zeroizing<Vec<u8>>,
    is_ios_identity: bool,
    common_name: Option<String>,
    files: CredentialFiles,
}

impl ExtractedCredential {
    pub fn certificate_pem(&self) -> &[u8] {
        &self.certificate_pem
    }

    pub fn private_key_pem(&self) -> &[u8] {
        &self.private_key_pem
    }

    pub fn is_ios_identity(&self) -> bool {
        self.is_ios_identity
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    pub fn certificate_path(&self) -> &Path {
        &self.files.cert
    }

    pub fn private_key_path(&self) -> &Path {
        &self.files.key
    }

    pub fn certificate(&self) -> Result<CapturedX509Certificate> {
        CapturedX509Certificate::from_pem(&self.certificate_pem)
            .map_err(|e| ResignError::Credential(format!("certificate PEM is unreadable: {}", e)))
    }

    pub fn signing_key(&self) -> Result<InMemorySigningKeyPair> {
        InMemorySigningKeyPair::from_pkcs8_pem(&*self.private_key_pem)
            .map_err(|e| {
                ResignError::Credential(format!("private key is not usable PKCS#8: {}", e))
            })
    }
}

impl fmt::Debug for ExtractedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractedCredential")
            .field("common_name", &self.common_name)
            .field("is_ios_identity", &self.is_ios_identity)
            .field("dir", &self.files.dir)
            .finish_non_exhaustive()
    }
}

struct CredentialFiles {
    dir: PathBuf,
    cert: PathBuf,
    key: PathBuf,
}

impl CredentialFiles {
    fn write(dir: &Path, cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let files = CredentialFiles {
            dir: dir.to_path_buf(),
            cert: dir.join(CERT_FILE),
            key: dir.join(KEY_FILE),
        };
        // Held from here on so a failed write still cleans up.
        fs::create_dir_all(dir).map_err(|e| io_failure("creating credential directory", e))?;
        write_private(&files.cert, cert_pem)?;
        write_private(&files.key, key_pem)?;
        Ok(files)
    }
}

impl Drop for CredentialFiles {
    fn drop(&mut self) {
        for path in [&self.key, &self.cert] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove {}: {}", path.display(), e);
                }
            }
        }
        if let Err(e) = fs::remove_dir(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove {}: {}", self.dir.display(), e);
            }
        }
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| io_failure("writing credential", e))?;
    file.write_all(contents)
        .map_err(|e| io_failure("writing credential", e))
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents).map_err(|e| io_failure("writing credential", e))
}

fn io_failure(what: &str, e: std::io::Error) -> ResignError {
    ResignError::Credential(format!("{}: {}", what, e))
}

pub struct CredentialStore {
    strategies: Vec<DecodeStrategy>,
    openssl: Option<OpensslTool>,
}

impl CredentialStore {
    pub fn new(strategies: Vec<DecodeStrategy>, openssl: Option<OpensslTool>) -> Self {
        Self { strategies, openssl }
    }

    /// Decode `container` and persist the PEMs under `work_dir`.
    pub fn extract<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        container: P,
        password: &str,
        work_dir: Q,
    ) -> Result<ExtractedCredential> {
        let container = container.as_ref();
        let data = fs::read(container).map_err(|e| {
            ResignError::Credential(format!("cannot read {}: {}", container.display(), e))
        })?;

        let certificate_pem = self.extract_part(Part::Certificate, container, &data, password)?;
        let private_key_pem =
            Zeroizing::new(self.extract_part(Part::PrivateKey, container, &data, password)?);

        let certificate = CapturedX509Certificate::from_pem(&certificate_pem)
            .map_err(|e| {
                ResignError::Credential(format!("certificate is not valid X.509: {}", e))
            })?;
        let key = InMemorySigningKeyPair::from_pkcs8_pem(&*private_key_pem)
            .map_err(|e| {
                ResignError::Credential(format!("private key is not usable PKCS#8: {}", e))
            })?;
        if key.public_key_data() != certificate.public_key_data() {
            return Err(ResignError::Credential(
                "private key does not belong to the certificate".to_string(),
            ));
        }

        let common_name = certificate.subject_common_name();
        let is_ios_identity = common_name.as_deref().map(is_ios_subject).unwrap_or(false);
        if !is_ios_identity {
            return Err(ResignError::Credential(format!(
                "certificate \"{}\" is not an iOS signing identity",
                common_name.as_deref().unwrap_or("<no common name>")
            )));
        }

        let files = CredentialFiles::write(work_dir.as_ref(), &certificate_pem, &private_key_pem)?;

        Ok(ExtractedCredential {
            certificate_pem,
            private_key_pem,
            is_ios_identity,
            common_name,
            files,
        })
    }

    fn extract_part(
        &self,
        part: Part,
        path: &Path,
        data: &[u8],
        password: &str,
    ) -> Result<Vec<u8>> {
        let mut last_error = None;

        for &strategy in &self.strategies {
            let attempt = match (strategy.needs_openssl(), &self.openssl) {
                (false, _) => native_part(part, data, password),
                (true, Some(openssl)) => openssl_part(openssl, strategy, part, path, password),
                (true, None) => {
                    debug!("skipping {}: openssl not available", strategy);
                    continue;
                }
            };

            match attempt {
                Ok(pem) => {
                    debug!("{} extracted with {}", part, strategy);
                    return Ok(pem);
                }
                Err(e) => {
                    debug!("{} strategy {} failed: {}", part, strategy, e);
                    last_error = Some((strategy, e));
                }
            }
        }

        Err(match last_error {
            Some((strategy, e)) => ResignError::Credential(format!(
                "could not extract {} (last attempt {}): {}",
                part,
                strategy,
                reason(e)
            )),
            None => ResignError::Credential(format!(
                "no decode strategy available for the {}",
                part
            )),
        })
    }
}

/// Whether a certificate subject names one of Apple's mobile signing roles.
pub fn is_ios_subject(subject: &str) -> bool {
    IOS_SIGNING_MARKERS.iter().any(|m| subject.contains(m))
}

fn reason(e: ResignError) -> String {
    match e {
        ResignError::Credential(msg) | ResignError::Tool(msg) => msg,
        other => other.to_string(),
    }
}

fn native_part(part: Part, data: &[u8], password: &str) -> Result<Vec<u8>> {
    let pfx = p12::PFX::parse(data)
        .map_err(|e| ResignError::Credential(format!("not a PKCS#12 container: {:?}", e)))?;

    // p12 verifies HMAC-SHA1 only and debug-asserts on anything else.
    if let Some(mac) = &pfx.mac_data {
        if mac.mac.digest_algorithm != p12::AlgorithmIdentifier::Sha1 {
            return Err(ResignError::Credential(
                "unsupported MAC algorithm for native decoding".to_string(),
            ));
        }
    }

    if !pfx.verify_mac(password) {
        return Err(ResignError::Credential(
            "MAC verification failed; is the password correct?".to_string(),
        ));
    }

    let der = match part {
        Part::Certificate => {
            let certs = pfx
                .cert_x509_bags(password)
                .map_err(|e| {
                    ResignError::Credential(format!("reading certificate bags: {:?}", e))
                })?;
            pick_leaf(certs)
        }
        Part::PrivateKey => pfx
            .key_bags(password)
            .map_err(|e| ResignError::Credential(format!("decrypting key bags: {:?}", e)))?
            .into_iter()
            .next(),
    };

    let der = der.ok_or_else(|| ResignError::Credential(format!("container holds no {}", part)))?;
    Ok(encode_pem(part, der))
}

/// Containers exported with their chain list intermediates too; prefer the
/// certificate that carries a signing role.
fn pick_leaf(certs: Vec<Vec<u8>>) -> Option<Vec<u8>> {
    let leaf = certs.iter().position(|der| {
        CapturedX509Certificate::from_der(der.clone())
            .ok()
            .and_then(|c| c.subject_common_name())
            .map(|cn| is_ios_subject(&cn))
            .unwrap_or(false)
    });
    let index = leaf.unwrap_or(0);
    certs.into_iter().nth(index)
}

fn openssl_part(
    openssl: &OpensslTool,
    strategy: DecodeStrategy,
    part: Part,
    path: &Path,
    password: &str,
) -> Result<Vec<u8>> {
    let passin = format!("env:{}", PASSWORD_ENV);
    let mut args: Vec<String> = vec![
        "pkcs12".into(),
        "-in".into(),
        path.display().to_string(),
        "-passin".into(),
        passin,
    ];
    match part {
        Part::Certificate => args.extend(["-clcerts".into(), "-nokeys".into()]),
        Part::PrivateKey => args.extend(["-nocerts".into(), "-nodes".into()]),
    }
    args.extend(strategy.openssl_flags().iter().map(|s| s.to_string()));

    let stdout = Zeroizing::new(openssl.run(&args, Some(password))?);
    let blocks = pem::parse_many(&*stdout)
        .map_err(|e| ResignError::Credential(format!("openssl produced unreadable PEM: {}", e)))?;

    let block = blocks
        .into_iter()
        .find(|p| p.tag == part.pem_tag())
        .ok_or_else(|| {
            ResignError::Credential(format!("openssl output has no {} block", part.pem_tag()))
        })?;
    Ok(encode_pem(part, block.contents))
}

fn encode_pem(part: Part, der: Vec<u8>) -> Vec<u8> {
    let block = pem::Pem {
        tag: part.pem_tag().to_string(),
        contents: der,
    };
    let encoded = pem::encode_config(
        &block,
        pem::EncodeConfig {
            line_ending: pem::LineEnding::LF,
        },
    );
    let mut contents = block.contents;
    zeroize::Zeroize::zeroize(&mut contents);
    encoded.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_markers() {
        assert!(is_ios_subject("iPhone Distribution: Example Corp (ABCDE12345)"));
        assert!(is_ios_subject("Apple Development: dev@example.com (XYZ)"));
        assert!(!is_ios_subject("Developer ID Application: Example Corp"));
        assert!(!is_ios_subject("localhost"));
    }

    #[test]
    fn strategy_names_round_trip_through_config() {
        let json = serde_json::to_string(&DecodeStrategy::DEFAULT_ORDER).unwrap();
        assert_eq!(
            json,
            r#"["native","openssl-modern","openssl-legacy","openssl-passthrough"]"#
        );
        assert_eq!(DecodeStrategy::OpensslLegacy.to_string(), "openssl-legacy");
    }

    #[test]
    fn only_native_runs_without_openssl() {
        assert!(!DecodeStrategy::Native.needs_openssl());
        assert!(DecodeStrategy::OpensslPassthrough.needs_openssl());
        assert_eq!(DecodeStrategy::OpensslPassthrough.openssl_flags(), &["-legacy", "-nomacver"]);
    }

    #[test]
    fn garbage_container_is_a_credential_error() {
        let dir = tempfile::tempdir().unwrap();
        let p12 = dir.path().join("bad.p12");
        fs::write(&p12, b"definitely not pkcs12").unwrap();

        let store = CredentialStore::new(vec![DecodeStrategy::Native], None);
        let err = store.extract(&p12, "pw", dir.path().join("cred")).unwrap_err();
        assert!(matches!(err, ResignError::Credential(_)), "{:?}", err);
        assert!(!dir.path().join("cred").exists());
    }

    #[test]
    fn openssl_only_store_without_openssl_explains_itself() {
        let dir = tempfile::tempdir().unwrap();
        let p12 = dir.path().join("x.p12");
        fs::write(&p12, b"x").unwrap();

        let store = CredentialStore::new(vec![DecodeStrategy::OpensslModern], None);
        match store.extract(&p12, "pw", dir.path().join("cred")) {
            Err(ResignError::Credential(msg)) => assert!(msg.contains("no decode strategy")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn credential_files_are_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let cred_dir = dir.path().join("cred");
        let files = CredentialFiles::write(&cred_dir, b"cert", b"key").unwrap();
        assert!(files.key.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&files.key).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        drop(files);
        assert!(!cred_dir.exists());
    }

    const IOS_CN: &str = "Apple Development: dev@example.com (XYZ1234567)";

    /// A container whose MAC claims HMAC-SHA256, as OpenSSL 3 writes them.
    fn sha256_mac_container(cert: &[u8], key: &[u8], password: &str) -> Vec<u8> {
        let mut pfx = p12::PFX::new(cert, key, None, password, "signer").unwrap();
        let mac = pfx.mac_data.as_mut().unwrap();
        let sha256 = yasna::models::ObjectIdentifier::from_slice(&[2, 16, 840, 1, 101, 3, 4, 2, 1]);
        mac.mac.digest_algorithm =
            p12::AlgorithmIdentifier::OtherAlg(p12::OtherAlgorithmIdentifier {
                algorithm_type: sha256,
                params: None,
            });
        pfx.to_der()
    }

    #[test]
    fn native_declines_sha256_mac() {
        let (cert, key) = crate::testutil::identity(IOS_CN);
        let container = sha256_mac_container(&cert, &key, "pw");

        match native_part(Part::PrivateKey, &container, "pw") {
            Err(ResignError::Credential(msg)) => {
                assert!(msg.contains("unsupported MAC"), "{}", msg)
            }
            other => panic!("unexpected: {:?}", other.map(|_| "pem")),
        }
    }

    #[test]
    fn native_extracts_sha1_mac_container() {
        let dir = tempfile::tempdir().unwrap();
        let p12 = dir.path().join("cert.p12");
        fs::write(&p12, crate::testutil::p12_container(IOS_CN, "pw")).unwrap();

        let credential = CredentialStore::new(vec![DecodeStrategy::Native], None)
            .extract(&p12, "pw", dir.path().join("cred"))
            .unwrap();
        assert!(credential.is_ios_identity());
        assert_eq!(credential.common_name(), Some(IOS_CN));
        assert!(credential.private_key_path().exists());

        let err = CredentialStore::new(vec![DecodeStrategy::Native], None)
            .extract(&p12, "wrong", dir.path().join("cred2"))
            .unwrap_err();
        assert!(matches!(err, ResignError::Credential(_)));
    }

    /// Stand-in `openssl` that answers `pkcs12` calls from fixed files, or
    /// fails with a message naming the flags it was given.
    #[cfg(unix)]
    fn fake_openssl(dir: &Path, cert_pem: Option<&[u8]>, key_pem: Option<&[u8]>) -> OpensslTool {
        use std::os::unix::fs::PermissionsExt;

        let mut script = String::from("#!/bin/sh\ncase \"$*\" in\n");
        if let (Some(cert), Some(key)) = (cert_pem, key_pem) {
            let cert_path = dir.join("fake.crt.pem");
            let key_path = dir.join("fake.key.pem");
            fs::write(&cert_path, cert).unwrap();
            fs::write(&key_path, key).unwrap();
            script.push_str(&format!(
                "  *-nokeys*) cat '{}' ;;\n  *-nocerts*) cat '{}' ;;\n",
                cert_path.display(),
                key_path.display()
            ));
        } else {
            script.push_str(concat!(
                "  *-nomacver*) echo 'passthrough decoder refused' >&2; exit 1 ;;\n",
                "  *-legacy*) echo 'legacy decoder refused' >&2; exit 1 ;;\n",
            ));
        }
        script.push_str("  *) echo 'modern decoder refused' >&2; exit 1 ;;\nesac\n");

        let path = dir.join("openssl");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        OpensslTool::new(&path, std::time::Duration::from_secs(10))
    }

    #[cfg(unix)]
    #[test]
    fn falls_through_to_openssl_when_native_declines() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = crate::testutil::identity(IOS_CN);
        let p12 = dir.path().join("modern.p12");
        fs::write(&p12, sha256_mac_container(&cert, &key, "pw")).unwrap();

        let openssl = fake_openssl(
            dir.path(),
            Some(&encode_pem(Part::Certificate, cert.clone())),
            Some(&encode_pem(Part::PrivateKey, key.clone())),
        );
        let store = CredentialStore::new(DecodeStrategy::DEFAULT_ORDER.to_vec(), Some(openssl));
        let credential = store.extract(&p12, "pw", dir.path().join("cred")).unwrap();

        assert_eq!(credential.common_name(), Some(IOS_CN));
        assert_eq!(
            fs::read(credential.certificate_path()).unwrap(),
            encode_pem(Part::Certificate, cert)
        );
    }

    #[cfg(unix)]
    #[test]
    fn reports_the_last_strategy_error() {
        let dir = tempfile::tempdir().unwrap();
        let p12 = dir.path().join("bad.p12");
        fs::write(&p12, b"definitely not pkcs12").unwrap();

        let openssl = fake_openssl(dir.path(), None, None);
        let store = CredentialStore::new(DecodeStrategy::DEFAULT_ORDER.to_vec(), Some(openssl));
        match store.extract(&p12, "pw", dir.path().join("cred")) {
            Err(ResignError::Credential(msg)) => {
                assert!(msg.contains("openssl-passthrough"), "{}", msg);
                assert!(msg.contains("passthrough decoder refused"), "{}", msg);
                assert!(!msg.contains("modern decoder refused"), "{}", msg);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!dir.path().join("cred").exists());
    }
}
