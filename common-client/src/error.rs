use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("too many active subscriptions ({active}/{max})")]
    SubscriptionLimitReached { active: usize, max: usize },
    #[error("transport send failed: {0}")]
    TransportSend(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
