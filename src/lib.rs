pub mod bundle;
pub mod classify;
pub mod config;
pub mod credential;
pub mod error;
pub mod ipa;
pub mod manifest;
pub mod pipeline;
pub mod profile;
pub mod request;
pub mod signer;
pub mod tool;

#[cfg(test)]
mod testutil;

pub use bundle::AppBundle;
pub use classify::{classify, signable_files, Classification};
pub use config::{BackendKind, PipelineConfig};
pub use credential::{CredentialStore, DecodeStrategy, ExtractedCredential};
pub use error::{ResignError, Result};
pub use ipa::{extract_ipa, ArchiveBuilder};
pub use manifest::{installation_url, manifest_file_name, ManifestBuilder, ManifestRequest};
pub use pipeline::{CancelFlag, Pipeline, SignedArtifact};
pub use profile::{validate_udid, ProvisioningProfile};
pub use request::SigningRequest;
pub use signer::{SignatureBackend, SignatureRecord, Signer, SigningReport};
pub use tool::OpensslTool;
