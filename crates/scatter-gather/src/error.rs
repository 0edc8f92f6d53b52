/// Error is the fundamental error type of this crate. Conditional-claim
/// failures and absent-row deletes are never represented here; they're
/// protocol-internal outcomes, not errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("dynamodb request failed")]
    DynamoDb(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error(transparent)]
    MongoDb(#[from] mongodb::error::Error),

    #[error("completion handler failed")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    pub fn dynamodb(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::DynamoDb(Box::new(err))
    }

    pub fn handler(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Handler(Box::new(err))
    }
}
