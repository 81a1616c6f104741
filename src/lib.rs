use std::path::PathBuf;

pub mod util;
pub mod vision;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed stream header at frame {frame}: {reason}")]
    StreamParse { frame: u64, reason: String },
    #[error("frame of {width}x{height} cannot be split into {square_size}x{square_size} tiles")]
    TileGeometry {
        width: u32,
        height: u32,
        square_size: u32,
    },
    #[error("{fingerprints} fingerprints loaded but {thresholds} threshold entries")]
    ConfigMismatch {
        fingerprints: usize,
        thresholds: usize,
    },
    #[error(
        "fingerprint addresses tile {square_index} but the cropped frame only has {tile_count} tiles"
    )]
    SquareIndexOutOfRange {
        square_index: usize,
        tile_count: usize,
    },
    #[error("no training recordings provided to calibrator")]
    CalibratorMissingRecordings,
    #[error("threshold data not found at: {0:?}")]
    ThresholdDataNotFound(PathBuf),
    #[error("no reference fingerprints found in: {0:?}")]
    NoFingerprints(PathBuf),
    #[error("image error: {0}")]
    ImageError(#[from] image::ImageError),
    #[error("bincode error: {0}")]
    BincodeError(#[from] bincode::Error),
    #[error("serde_json error: {0}")]
    SerdeJSONError(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
