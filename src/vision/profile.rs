use std::path::Path;

use super::{
    mean_diff_score, Frame, ReferenceFingerprint, Thresholds, Tile, PROFILE_DETECTOR_FILE,
    PROFILE_SQUARES_DIR, THRESHOLD_FILE_EXT,
};
use crate::{Error, Result};

/// Locates and describes the liveness/identity tile of one source.
///
/// The anchor gives the tile's top-left corner as ratios of the *uncropped*
/// frame dimensions, so the same spec works at any resolution; the default
/// anchors the detector square at the top-left corner of the frame.
#[derive(Clone, Debug)]
pub struct DetectorSpec {
    tile: Tile,
    anchor: (f64, f64),
}

impl DetectorSpec {
    pub fn new(tile: Tile) -> Self {
        Self {
            tile,
            anchor: (0.0, 0.0),
        }
    }

    /// Returns a new [DetectorSpec] with the provided anchor ratios.
    pub fn with_anchor(mut self, x_ratio: f64, y_ratio: f64) -> Self {
        self.anchor = (x_ratio, y_ratio);
        self
    }

    pub fn tile(&self) -> &Tile {
        &self.tile
    }

    /// Pixel origin of the detector square in a frame of the given real
    /// dimensions, clamped so the square always fits.
    pub fn origin(&self, width: u32, height: u32, square_size: u32) -> (u32, u32) {
        let x = (self.anchor.0 * width as f64) as u32;
        let y = (self.anchor.1 * height as f64) as u32;
        (
            x.min(width.saturating_sub(square_size)),
            y.min(height.saturating_sub(square_size)),
        )
    }
}

/// A named source identity and everything needed to scrutinize its stream: the
/// detector square that proves the identity is still on screen, the reference
/// fingerprints to look for, and their calibrated thresholds.
///
/// Profiles carry their capabilities with them; callers select a profile once
/// (by identity resolution) and never branch on the label afterwards.
#[derive(Clone, Debug)]
pub struct StreamerProfile {
    label: String,
    detector: DetectorSpec,
    fingerprints: Vec<ReferenceFingerprint>,
    thresholds: Thresholds,
}

impl StreamerProfile {
    pub fn new(
        label: impl Into<String>,
        detector: DetectorSpec,
        fingerprints: Vec<ReferenceFingerprint>,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            label: label.into(),
            detector,
            fingerprints,
            thresholds,
        }
    }

    /// Loads a profile from a conventionally laid out directory:
    ///
    /// ```text
    /// <dir>/                  directory name is the identity label
    ///   detector.png          liveness/identity tile
    ///   squares/              reference fingerprints (square_{idx}_{seq}.png)
    ///   thresholds.scrut.bin  calibrated thresholds
    /// ```
    pub fn from_dir(dir: impl AsRef<Path>, square_size: u32) -> Result<Self> {
        let dir = dir.as_ref();
        let label = dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_owned();

        let detector_img = image::open(dir.join(PROFILE_DETECTOR_FILE))?.to_rgb8();
        let detector_tile = Tile::from_rgb_image(&detector_img)
            .filter(|t| t.size() == square_size)
            .ok_or(Error::TileGeometry {
                width: detector_img.width(),
                height: detector_img.height(),
                square_size,
            })?;

        let fingerprints =
            ReferenceFingerprint::load_directory(dir.join(PROFILE_SQUARES_DIR), square_size)?;
        let thresholds =
            Thresholds::from_path(dir.join("thresholds").with_extension(THRESHOLD_FILE_EXT))?;

        tracing::debug!(
            profile = %label,
            fingerprints = fingerprints.len(),
            "loaded streamer profile"
        );

        Ok(Self::new(label, detector_tile.into(), fingerprints, thresholds))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn detector(&self) -> &DetectorSpec {
        &self.detector
    }

    pub fn fingerprints(&self) -> &[ReferenceFingerprint] {
        &self.fingerprints
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }
}

impl From<Tile> for DetectorSpec {
    fn from(tile: Tile) -> Self {
        Self::new(tile)
    }
}

/// Result of first-frame identity resolution.
///
/// [IdentityOutcome::Ambiguous] is not an error: the caller decides the
/// fallback policy, typically running detection for every plausible candidate
/// in a single pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IdentityOutcome {
    /// Index of the matching profile.
    Resolved(usize),
    Ambiguous,
}

/// Determines, from the first frame of a session, which known source identity
/// is active.
///
/// Each candidate's detector square is scored with the mean-difference metric
/// against the tile at that candidate's anchor. A candidate wins only if its
/// score strictly exceeds every other candidate's *and* the detector
/// threshold.
pub fn resolve_identity(
    first_frame: &Frame,
    profiles: &[StreamerProfile],
    square_size: u32,
    detector_threshold: f64,
) -> Result<IdentityOutcome> {
    let mut scores = Vec::with_capacity(profiles.len());
    for profile in profiles {
        let (x, y) = profile
            .detector
            .origin(first_frame.width(), first_frame.height(), square_size);
        let target = first_frame.tile_at(x, y, square_size)?;
        let score = mean_diff_score(&target, profile.detector.tile());
        tracing::info!(profile = %profile.label, score, "identity candidate");
        scores.push(score);
    }

    let best = match (0..scores.len()).max_by(|&a, &b| scores[a].total_cmp(&scores[b])) {
        Some(best) => best,
        None => return Ok(IdentityOutcome::Ambiguous),
    };
    let strictly_best = scores
        .iter()
        .enumerate()
        .all(|(i, &s)| i == best || s < scores[best]);

    if strictly_best && scores[best] > detector_threshold {
        tracing::info!(profile = %profiles[best].label, "identity resolved");
        Ok(IdentityOutcome::Resolved(best))
    } else {
        tracing::info!("identity is ambiguous");
        Ok(IdentityOutcome::Ambiguous)
    }
}
