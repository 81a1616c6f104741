mod calibrator;
mod data;
mod detector;
mod frame;
mod profile;
mod reader;
mod similarity;

pub use calibrator::Calibrator;
pub use data::{ReferenceFingerprint, ThresholdEntry, Thresholds};
pub use detector::{GracePolicy, Outcome, Scan, Scrutinizer, Termination};
pub use frame::{CropRegion, Frame, Tile};
pub use profile::{resolve_identity, DetectorSpec, IdentityOutcome, StreamerProfile};
pub use reader::FrameReader;
pub use similarity::{mean_diff_score, structural_score};

use std::time::Duration;

/// Default detector-square match threshold.
///
/// The liveness/identity tile must score at least this much against a profile's
/// detector tile to be considered a match. Scores range from 0 (no match) to 1
/// (exact match).
pub const DEFAULT_DETECTOR_THRESHOLD: f64 = 0.9;

/// Default tile edge length, in pixels.
///
/// Reference fingerprints, detector tiles and frame segmentation all use square
/// tiles of this size. The cropped frame dimensions must be divisible by it.
pub const DEFAULT_SQUARE_SIZE: u32 = 20;

/// Default session timeout.
///
/// A detection session that is still pulling frames after this long terminates
/// with whatever running maxima it has collected so far.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(1800);

/// Default liveness grace period for live, single-profile sessions.
///
/// The detector square may go missing for up to this long before the session
/// terminates with a liveness loss.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Default liveness grace window for batch/offline sessions, in frames.
///
/// Recorded streams are not processed in real time, so the grace window is
/// counted in consecutive mismatched frames instead of wall-clock seconds.
pub const DEFAULT_GRACE_FRAMES: u64 = 15;

/// Default calibration floor.
///
/// A training stream whose every fingerprint score stays below this floor never
/// actually showed a reference tile and is dropped before thresholds are
/// recomputed.
pub const DEFAULT_CALIBRATION_FLOOR: f64 = 0.7;

/// Default expected frame width, in pixels.
pub const DEFAULT_EXPECTED_WIDTH: u32 = 1280;

/// Default expected frame height, in pixels.
pub const DEFAULT_EXPECTED_HEIGHT: u32 = 720;

static THRESHOLD_FILE_EXT: &str = "scrut.bin";
static CALIBRATION_ROW_FILE_EXT: &str = "scrut.row.bin";

/// Conventional file names inside a profile directory.
static PROFILE_DETECTOR_FILE: &str = "detector.png";
static PROFILE_SQUARES_DIR: &str = "squares";

#[cfg(test)]
pub(crate) mod testutil {
    use super::Frame;
    use std::io::Write;

    /// Serializes frames into a raw binary pixel-map stream, the same byte
    /// layout an external decoder process writes to its stdout.
    pub(crate) fn ppm_stream(frames: &[Frame]) -> Vec<u8> {
        let mut buf = Vec::new();
        for frame in frames {
            write!(buf, "P6\n{} {}\n255\n", frame.width(), frame.height()).unwrap();
            buf.extend_from_slice(frame.data());
        }
        buf
    }

    pub(crate) fn solid_frame(width: u32, height: u32, rgb: [u8; 3]) -> Frame {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take((width * height * 3) as usize)
            .collect();
        Frame::from_raw(width, height, data).unwrap()
    }

    /// A frame with a deterministic per-pixel gradient, so no two tiles are
    /// alike.
    pub(crate) fn gradient_frame(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push((x * 7 % 256) as u8);
                data.push((y * 13 % 256) as u8);
                data.push(((x + y) * 3 % 256) as u8);
            }
        }
        Frame::from_raw(width, height, data).unwrap()
    }
}
