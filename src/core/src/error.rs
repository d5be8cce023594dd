use thiserror::Error;

/// Kiln error taxonomy.
///
/// Every variant is a machine-readable kind with a human-readable message.
/// Instruction handlers return their first failure; the recipe driver
/// surfaces it verbatim after applying cleanup policy.
#[derive(Error, Debug)]
pub enum KilnError {
    /// Recipe file missing or zero-length
    #[error("Dockerfile cannot be empty")]
    EmptyRecipe,

    /// Recipe ran to completion without committing anything
    #[error("no image was generated; the Dockerfile may not contain any instructions")]
    NoImageProduced,

    /// Instruction needs a base image but FROM has not run yet
    #[error("please provide a source image with FROM prior to {0}")]
    NoBaseImage(String),

    /// Malformed instruction line
    #[error("invalid {0} format")]
    InvalidFormat(String),

    /// Argument rejected by an instruction handler
    #[error("{0}")]
    InvalidArgument(String),

    /// Instruction retired from the recipe language
    #[error("{0}")]
    Deprecated(String),

    /// Path resolved outside the build context sandbox
    #[error("forbidden path outside the build context: {path} ({resolved})")]
    ContextEscape { path: String, resolved: String },

    /// Referenced context path does not exist
    #[error("{0}: no such file or directory")]
    PathNotFound(String),

    /// Remote source URL has no usable final path segment
    #[error("cannot determine filename from url: {0}")]
    UrlFilenameUnresolvable(String),

    /// Remote source could not be fetched
    #[error("download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Forbidden instruction used as an ONBUILD trigger
    #[error("{0}")]
    InvalidTrigger(String),

    /// Base image pull failed
    #[error("pull of {image} failed: {reason}")]
    PullFailed { image: String, reason: String },

    /// Base image absent from the store even after pull
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// RUN command exited non-zero
    #[error("the command {cmd} returned a non-zero code: {code}")]
    RunFailed { cmd: String, code: i64 },

    /// Image store refused the commit
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// Container runtime refused to create an intermediate container
    #[error("container create failed: {0}")]
    CreateFailed(String),

    /// Container rootfs could not be mounted
    #[error("mount failed: {0}")]
    MountFailed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl KilnError {
    /// The machine-readable kind, as serialized over the job bus.
    pub fn kind(&self) -> &'static str {
        match self {
            KilnError::EmptyRecipe => "EmptyRecipe",
            KilnError::NoImageProduced => "NoImageProduced",
            KilnError::NoBaseImage(_) => "NoBaseImage",
            KilnError::InvalidFormat(_) => "InvalidFormat",
            KilnError::InvalidArgument(_) => "InvalidArgument",
            KilnError::Deprecated(_) => "Deprecated",
            KilnError::ContextEscape { .. } => "ContextEscape",
            KilnError::PathNotFound(_) => "PathNotFound",
            KilnError::UrlFilenameUnresolvable(_) => "UrlFilenameUnresolvable",
            KilnError::DownloadFailed { .. } => "DownloadFailed",
            KilnError::InvalidTrigger(_) => "InvalidTrigger",
            KilnError::PullFailed { .. } => "PullFailed",
            KilnError::ImageNotFound(_) => "ImageNotFound",
            KilnError::RunFailed { .. } => "RunFailed",
            KilnError::CommitFailed(_) => "CommitFailed",
            KilnError::CreateFailed(_) => "CreateFailed",
            KilnError::MountFailed(_) => "MountFailed",
            KilnError::Io(_) => "Io",
            KilnError::Serialization(_) => "Serialization",
            KilnError::Other(_) => "Other",
        }
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Serialization(err.to_string())
    }
}

/// Result type alias for build engine operations
pub type Result<T> = std::result::Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(KilnError::EmptyRecipe.kind(), "EmptyRecipe");
        assert_eq!(
            KilnError::RunFailed {
                cmd: "[\"/bin/false\"]".to_string(),
                code: 1
            }
            .kind(),
            "RunFailed"
        );
        assert_eq!(
            KilnError::ContextEscape {
                path: "../etc".to_string(),
                resolved: "/etc".to_string()
            }
            .kind(),
            "ContextEscape"
        );
    }

    #[test]
    fn test_run_failed_carries_exit_code() {
        let err = KilnError::RunFailed {
            cmd: "[\"/bin/sh\", \"-c\", \"exit 7\"]".to_string(),
            code: 7,
        };
        assert!(err.to_string().contains("non-zero code: 7"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: KilnError = io.into();
        assert_eq!(err.kind(), "Io");
    }
}
