use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplayQError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue data corrupt: {0}")]
    Corrupt(String),

    #[error("queue full: {pending} bytes pending, cap {max}")]
    QueueFull { pending: u64, max: u64 },

    #[error("ack reference {seqno} was never issued by this queue")]
    InvalidAck { seqno: u64 },
}

pub type Result<T> = std::result::Result<T, ReplayQError>;
