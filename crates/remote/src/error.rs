#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Redis: {0}")]
    Redis(#[from] redis::RedisError),
}

impl From<Error> for groupcast::Error {
    fn from(err: Error) -> Self {
        groupcast::Error::Backplane(err.to_string())
    }
}
