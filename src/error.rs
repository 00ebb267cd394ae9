#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request/response calls require a Single target")]
    NotSingleTarget,

    #[error("no invocable target for key {0}")]
    NoInvocableTarget(String),

    #[error("group '{0}' is already registered with a different key or receiver type")]
    GroupTypeMismatch(String),

    #[error("receiver cannot supply a direct write sink required by a remote group")]
    NotRemoteCapable,

    #[error("group is disposed")]
    GroupDisposed,

    #[error("provider has no backplane configured")]
    NoBackplane,

    #[error("invocation '{0}' timed out")]
    Timeout(String),

    #[error("invocation canceled")]
    Canceled,

    #[error("resolution channel lost before completion")]
    ResolutionLost,

    #[error("remote invocation failed: {0}")]
    Remote(String),

    #[error("frame error: {0}")]
    Frame(String),

    #[error("backplane error: {0}")]
    Backplane(String),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("erased serde error: {0}")]
    SerdeErased(#[from] erased_serde::Error),
}

impl From<rmp::encode::ValueWriteError> for Error {
    fn from(err: rmp::encode::ValueWriteError) -> Self {
        Error::Frame(format!("{:?}", err))
    }
}

impl From<rmp::decode::ValueReadError> for Error {
    fn from(err: rmp::decode::ValueReadError) -> Self {
        Error::Frame(format!("{:?}", err))
    }
}

impl From<rmp::decode::NumValueReadError> for Error {
    fn from(err: rmp::decode::NumValueReadError) -> Self {
        Error::Frame(format!("{:?}", err))
    }
}
