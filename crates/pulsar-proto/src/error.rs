use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("frame of {declared} bytes exceeds maximum {max}")]
    FrameTooLarge { declared: usize, max: usize },

    #[error("frame truncated: {0}")]
    Truncated(&'static str),

    #[error("payload checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
