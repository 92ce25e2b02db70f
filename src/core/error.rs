use thiserror::Error;

#[derive(Error, Debug)]
pub enum CckdError {
    #[error("Not a compressed CKD/FBA image: {0}")]
    Format(String),

    #[error("Unknown device type: 0x{0:02X}")]
    Geometry(u8),

    #[error("Image is structurally inconsistent: {0}")]
    Inconsistent(String),

    #[error("Image at offset {offset} uses compression method {tag} which this build cannot handle")]
    UnsupportedCompression { tag: u8, offset: u64 },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Offset {0} does not fit the image's field width")]
    OffsetOverflow(u64),

    #[error("Invalid thoroughness level: {0} (must be -1..=4)")]
    InvalidLevel(i32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
}

impl CckdError {
    /// Exit code reported for an aborted pass
    pub fn exit_code(&self) -> i32 {
        -1
    }
}

pub type Result<T> = std::result::Result<T, CckdError>;
