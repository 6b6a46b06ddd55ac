use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("archive is not a zip container")]
    UnsupportedFormat,
    #[error("cmi5.xml not found")]
    Missing,
    #[error("failed to parse manifest: {0}")]
    Parse(String),
    #[error("manifest has no <course> element")]
    MissingCourse,
    #[error("AU '{title}' has no id")]
    MissingActivityId { title: String },
    #[error("duplicate AU id '{0}'")]
    DuplicateActivity(String),
    #[error("io error while reading package: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("unsupported archive format")]
    UnsupportedFormat,
    #[error("archive is {size} bytes, limit is {max}")]
    TooLarge { size: u64, max: u64 },
    #[error("manifest not found")]
    ManifestNotFound,
    #[error("invalid manifest: {0}")]
    InvalidManifest(#[source] ManifestError),
    #[error("package {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<ManifestError> for ImportError {
    fn from(e: ManifestError) -> Self {
        match e {
            ManifestError::UnsupportedFormat => ImportError::UnsupportedFormat,
            ManifestError::Missing => ImportError::ManifestNotFound,
            ManifestError::Io(e) => ImportError::Storage(StorageError::Io(e)),
            other => ImportError::InvalidManifest(other),
        }
    }
}

/// Required statement parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementField {
    Actor,
    Verb,
    Object,
}

impl std::fmt::Display for StatementField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StatementField::Actor => "actor",
            StatementField::Verb => "verb",
            StatementField::Object => "object",
        })
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum BuildError {
    #[error("incomplete statement, missing: {}", join_fields(.missing))]
    IncompleteStatement { missing: Vec<StatementField> },
}

fn join_fields(fields: &[StatementField]) -> String {
    fields.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(", ")
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("package {0} not found")]
    PackageNotFound(Uuid),
    #[error("activity '{activity}' not found in package {package}")]
    ActivityNotFound { package: Uuid, activity: String },
    #[error("fetch token unknown or already used")]
    UnknownToken,
    #[error("fetch token expired")]
    TokenExpired,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Lrs(#[from] LrsError),
}

#[derive(Error, Debug)]
pub enum LrsError {
    #[error("lrs transport error: {0}")]
    Transport(String),
    #[error("lrs storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("lrs rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("lrs payload error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl LrsError {
    /// Whether resending the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LrsError::Transport(_) | LrsError::Storage(_))
    }
}

impl From<reqwest::Error> for LrsError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return LrsError::Transport(format!("undecodable response: {e}"));
        }
        LrsError::Transport(e.to_string())
    }
}
