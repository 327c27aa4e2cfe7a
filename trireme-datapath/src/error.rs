use thiserror::Error;

/// The five error kinds from the error-handling design, each with a fixed
/// recovery action the caller is expected to take:
/// `Malformed`/`Unauthorized`/`PolicyDenied` drop the packet and terminate
/// the connection; `Transient` drops and counts but never aborts the
/// datapath; `Fatal` only ever comes out of startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatapathError {
    #[error("malformed packet or token: {0}")]
    Malformed(String),

    #[error("unauthorized: {0}")]
    Unauthorized(#[from] TokenError),

    #[error("policy denied flow, policy id {0}")]
    PolicyDenied(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal startup failure: {0}")]
    Fatal(String),
}

impl DatapathError {
    /// The `DropReason` a flow record should carry for this error, drawn
    /// from a closed set.
    pub fn drop_reason(&self) -> &'static str {
        match self {
            DatapathError::Malformed(_) => "invalid-format",
            DatapathError::Unauthorized(_) => "auth",
            DatapathError::PolicyDenied(_) => "policy",
            DatapathError::Transient(_) => "tcp-data",
            DatapathError::Fatal(_) => "no-context",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token claim is older than the configured validity window")]
    Expired,

    #[error("token signature does not verify under the configured key")]
    BadSignature,

    #[error("token could not be decoded: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, DatapathError>;

impl From<trireme_packet::ParseError> for DatapathError {
    fn from(e: trireme_packet::ParseError) -> Self {
        DatapathError::Malformed(e.to_string())
    }
}
