use std::path::Path;

use serde::{Deserialize, Serialize};

use super::Tile;
use crate::{Error, Result};

/// One immutable reference tile whose reappearance in the stream is being
/// detected.
///
/// `square_index` addresses the tile grid of the cropped frame (row-major);
/// every frame, the cropped tile at that index is scored against `tile`.
#[derive(Clone, Debug)]
pub struct ReferenceFingerprint {
    square_index: usize,
    tile: Tile,
}

impl ReferenceFingerprint {
    pub fn new(square_index: usize, tile: Tile) -> Self {
        Self { square_index, tile }
    }

    pub fn square_index(&self) -> usize {
        self.square_index
    }

    pub fn tile(&self) -> &Tile {
        &self.tile
    }

    /// Loads all reference fingerprints from a directory of PNG tiles.
    ///
    /// File names encode the grid address as `square_{index}_{sequence}.png`;
    /// the sequence number is informational only. Files that do not match the
    /// pattern, or that are not actually images, are skipped with a warning.
    /// Load order is sorted by file name, which keeps fingerprint order stable
    /// across runs and aligned with persisted thresholds.
    pub fn load_directory(dir: impl AsRef<Path>, square_size: u32) -> Result<Vec<Self>> {
        let dir = dir.as_ref();
        let mut names: Vec<_> = std::fs::read_dir(dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .collect();
        names.sort();

        let mut fingerprints = Vec::new();
        for path in names {
            let file_name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_owned(),
                None => continue,
            };
            let square_index = match parse_square_file_name(&file_name) {
                Some(idx) => idx,
                None => {
                    tracing::warn!(file = %file_name, "does not match the tile pattern, skipping");
                    continue;
                }
            };

            let buf = std::fs::read(&path)?;
            if !infer::is_image(&buf) {
                tracing::warn!(file = %file_name, "not an image, skipping");
                continue;
            }
            let img = image::load_from_memory(&buf)?.to_rgb8();
            let tile = Tile::from_rgb_image(&img)
                .filter(|t| t.size() == square_size)
                .ok_or(Error::TileGeometry {
                    width: img.width(),
                    height: img.height(),
                    square_size,
                })?;

            fingerprints.push(Self::new(square_index, tile));
        }

        if fingerprints.is_empty() {
            return Err(Error::NoFingerprints(dir.to_owned()));
        }

        tracing::debug!(
            count = fingerprints.len(),
            "loaded reference fingerprints from {}",
            dir.display()
        );

        Ok(fingerprints)
    }
}

// Extracts the grid index from a `square_{index}_{sequence}.png` file name.
fn parse_square_file_name(name: &str) -> Option<usize> {
    let rest = name.strip_prefix("square_")?.strip_suffix(".png")?;
    let (index, sequence) = rest.split_once('_')?;
    sequence.parse::<u64>().ok()?;
    index.parse().ok()
}

/// Calibrated decision statistics for one fingerprint: the mean and minimum of
/// the maximum score the fingerprint achieved across a labeled training
/// corpus.
#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
pub struct ThresholdEntry {
    pub mean: f64,
    pub min: f64,
}

/// The calibrated threshold set for one profile. This is the output of a
/// [Calibrator](super::Calibrator) run.
///
/// The entries are index-aligned with the reference fingerprints they were
/// calibrated against. The raw per-training-stream score matrix is retained
/// for auditing and recalibration.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Thresholds {
    pub(crate) entries: Vec<ThresholdEntry>,
    pub(crate) score_matrix: Vec<Vec<f64>>,
}

impl Thresholds {
    /// Aggregates per-stream running-maximum rows into threshold entries.
    ///
    /// Rows whose every score falls below `floor` are discarded first: such a
    /// stream never actually showed a reference tile and would drag the
    /// minimums down. If the floor rejects every row, the full matrix is kept
    /// instead.
    pub fn from_score_matrix(matrix: Vec<Vec<f64>>, floor: f64) -> Self {
        let kept: Vec<&Vec<f64>> = matrix
            .iter()
            .filter(|row| row.iter().any(|&s| s >= floor))
            .collect();
        let rows = if kept.is_empty() {
            tracing::warn!(floor, "calibration floor rejected every training stream");
            matrix.iter().collect()
        } else {
            if kept.len() < matrix.len() {
                tracing::info!(
                    dropped = matrix.len() - kept.len(),
                    floor,
                    "dropped training streams below the calibration floor"
                );
            }
            kept
        };

        let columns = rows.first().map_or(0, |r| r.len());
        let mut entries = Vec::with_capacity(columns);
        for f in 0..columns {
            let mut sum = 0.0;
            let mut min = f64::INFINITY;
            for row in &rows {
                sum += row[f];
                min = min.min(row[f]);
            }
            entries.push(ThresholdEntry {
                mean: sum / rows.len() as f64,
                min,
            });
        }

        Self {
            entries,
            score_matrix: matrix,
        }
    }

    /// Loads thresholds from a path.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::ThresholdDataNotFound(path.to_owned()));
        }
        let f = std::fs::File::open(path)?;
        Ok(bincode::deserialize_from(&f)?)
    }

    /// Writes thresholds to a path.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut f = std::fs::File::create(path)?;
        Ok(bincode::serialize_into(&mut f, self)?)
    }

    pub fn entries(&self) -> &[ThresholdEntry] {
        &self.entries
    }

    pub fn score_matrix(&self) -> &[Vec<f64>] {
        &self.score_matrix
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cached running-maximum row for one training stream, stored alongside the
/// recording. The header checksum detects a changed recording.
#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct CalibrationRow {
    pub(crate) md5: String,
    pub(crate) scores: Vec<f64>,
}
