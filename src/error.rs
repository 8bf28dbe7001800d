use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResignError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InputValidation(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Profile parse error: {0}")]
    ProfileParse(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Packaging error: {0}")]
    Packaging(String),

    #[error("External tool failed: {0}")]
    Tool(String),

    #[error("{tool} timed out after {}s", .after.as_secs())]
    Timeout { tool: String, after: Duration },

    #[error("Cancelled before {0}")]
    Cancelled(&'static str),

    #[error("Config error: {0}")]
    Config(String),
}

impl ResignError {
    /// Short stage label for grouping failures by category.
    pub fn kind(&self) -> &'static str {
        match self {
            ResignError::Io(_) => "IoError",
            ResignError::InputValidation(_) | ResignError::FileNotFound(_) => {
                "InputValidationError"
            }
            ResignError::Archive(_) => "ArchiveError",
            ResignError::Credential(_) => "CredentialError",
            ResignError::ProfileParse(_) => "ProfileParseError",
            ResignError::Signing(_) => "SigningError",
            ResignError::Packaging(_) => "PackagingError",
            ResignError::Tool(_) | ResignError::Timeout { .. } => "ToolError",
            ResignError::Cancelled(_) => "Cancelled",
            ResignError::Config(_) => "ConfigError",
        }
    }
}

pub type Result<T> = std::result::Result<T, ResignError>;
