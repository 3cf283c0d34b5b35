#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("subscription closed")]
    Closed,

    #[error("undecodable payload: {0}")]
    Serialization(String),

    #[error("bus unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },
}

impl BusError {
    /// Whether the subscription that produced this error is still usable.
    ///
    /// Payload decoding faults affect a single message; everything else means
    /// the transport is gone and the subscription must be rebuilt.
    pub fn is_transport(&self) -> bool {
        !matches!(self, BusError::Serialization(_))
    }
}
