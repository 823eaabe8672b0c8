use std::error::Error as StdError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The key does not exist (NoSuchKey / NotFound / 404 on head).
    #[error("object not found")]
    NotFound,
    #[error("timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound)
    }

    /// Whether the chain of `err` bottoms out in a cancellation.
    pub fn caused_by_cancel(err: &(dyn StdError + 'static)) -> bool {
        let mut source = Some(err);
        while let Some(err) = source {
            if let Some(GatewayError::Cancelled) = err.downcast_ref::<GatewayError>() {
                return true;
            }
            source = err.source();
        }
        false
    }
}
