/// Failure reported by the broker, or by the connection used to talk to it.
///
/// Broker-side rejections (e.g. `PRECONDITION_FAILED` on a declaration) and I/O failures are
/// not told apart here: the entity that issued the operation decides what the failure means.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct Error(#[from] anyhow::Error);

impl Error {
    /// Build an error out of a broker reply, e.g. `NOT_FOUND - no queue 'jobs'`.
    pub fn msg<M>(message: M) -> Self
    where
        M: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        Self(anyhow::Error::msg(message))
    }
}

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Self(err.into())
    }
}
