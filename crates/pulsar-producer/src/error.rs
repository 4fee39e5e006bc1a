use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Proto(#[from] pulsar_proto::ProtoError),

    #[error("durable queue error: {0}")]
    Queue(#[from] replayq::ReplayQError),

    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("request timed out")]
    Timeout,

    #[error("producer is closed")]
    ProducerClosed,

    #[error("sequence id {0} is still in flight")]
    SequenceIdInFlight(u64),

    #[error("send failed: {0}")]
    SendFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
