#[cfg(feature = "rayon")]
extern crate rayon;

use std::path::Path;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use super::data::CalibrationRow;
use super::{
    DetectorSpec, FrameReader, GracePolicy, ReferenceFingerprint, Scrutinizer, Termination,
    Thresholds,
};
use crate::{util, Error, Result};

/// Derives per-fingerprint decision thresholds from a corpus of labeled
/// training recordings.
///
/// Each recording is processed as an independent detection session collecting
/// the full running-maximum vector; sessions share nothing mutable, so the
/// recordings are distributed across threads when the `rayon` feature is on.
/// Rows are aggregated into mean/min statistics only after every session has
/// terminated, so worker ordering cannot affect the result.
///
/// Per-recording rows are cached on disk next to each recording, keyed by a
/// header checksum; `force` ignores any cached rows.
#[derive(Debug)]
pub struct Calibrator<P: AsRef<Path>> {
    recordings: Vec<P>,
    floor: f64,
    force: bool,
    engine: Scrutinizer,
}

impl<P: AsRef<Path>> Default for Calibrator<P> {
    fn default() -> Self {
        Self {
            recordings: Default::default(),
            floor: super::DEFAULT_CALIBRATION_FLOOR,
            force: false,
            // Recordings are not paced in real time, so the grace window is
            // counted in frames.
            engine: Scrutinizer::default()
                .with_grace_policy(GracePolicy::Frames(super::DEFAULT_GRACE_FRAMES)),
        }
    }
}

impl<P: AsRef<Path>> Calibrator<P> {
    /// Constructs a new [Calibrator] from a list of recording paths.
    pub fn from_files(recordings: impl Into<Vec<P>>, force: bool) -> Self {
        let mut calibrator = Self::default().with_force(force);
        calibrator.recordings = recordings.into();
        calibrator
    }

    /// Returns the recording paths used by this calibrator.
    pub fn recordings(&self) -> &[P] {
        &self.recordings
    }

    /// Returns a new [Calibrator] with the provided calibration floor.
    pub fn with_floor(mut self, floor: f64) -> Self {
        self.floor = floor;
        self
    }

    /// Returns a new [Calibrator] with `force` set to the provided value.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Returns a new [Calibrator] running sessions with the provided engine.
    pub fn with_engine(mut self, engine: Scrutinizer) -> Self {
        self.engine = engine;
        self
    }

    pub(crate) fn run_single(
        &self,
        path: impl AsRef<Path>,
        fingerprints: &[ReferenceFingerprint],
        detector: &DetectorSpec,
        persist: bool,
    ) -> Result<Vec<f64>> {
        let span = tracing::span!(tracing::Level::TRACE, "run_single");
        let _enter = span.enter();

        let path = path.as_ref();
        let row_path = path.with_extension(super::CALIBRATION_ROW_FILE_EXT);

        // Check if we've already scanned this recording by comparing header
        // checksums.
        let md5 = util::compute_header_md5sum(path)?;
        if !self.force {
            if let Ok(f) = std::fs::File::open(&row_path) {
                if let Ok(row) = bincode::deserialize_from::<_, CalibrationRow>(&f) {
                    if row.md5 == md5 && row.scores.len() == fingerprints.len() {
                        tracing::info!("skipping scan for {}, using cached row", path.display());
                        return Ok(row.scores);
                    }
                }
            }
        }

        tracing::debug!("starting scan of {}", path.display());
        let reader = FrameReader::new(std::fs::File::open(path)?);
        let scan = self.engine.scan(reader, fingerprints, detector)?;
        if scan.termination == Termination::Timeout {
            tracing::warn!(
                "scan of {} hit the session timeout, row may be partial",
                path.display()
            );
        }
        tracing::debug!(
            frames = scan.frames,
            "completed scan of {}",
            path.display()
        );

        if persist {
            let row = CalibrationRow {
                md5,
                scores: scan.running_max.clone(),
            };
            let mut f = std::fs::File::create(&row_path)?;
            bincode::serialize_into(&mut f, &row)?;
        }

        Ok(scan.running_max)
    }
}

impl<P: AsRef<Path> + Sync> Calibrator<P> {
    /// Runs this calibrator and aggregates the per-recording rows into a
    /// [Thresholds] set.
    pub fn run(
        &self,
        fingerprints: &[ReferenceFingerprint],
        detector: &DetectorSpec,
        persist: bool,
        threading: bool,
    ) -> Result<Thresholds> {
        if self.recordings.is_empty() {
            return Err(Error::CalibratorMissingRecordings);
        }

        let mut rows = Vec::new();

        if cfg!(feature = "rayon") && threading {
            #[cfg(feature = "rayon")]
            {
                rows = self
                    .recordings
                    .par_iter()
                    .map(|path| self.run_single(path, fingerprints, detector, persist))
                    .collect::<Result<Vec<_>>>()?;
            }
        } else {
            for path in &self.recordings {
                rows.push(self.run_single(path, fingerprints, detector, persist)?);
            }
        }

        Ok(Thresholds::from_score_matrix(rows, self.floor))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vision::testutil::{gradient_frame, ppm_stream, solid_frame};
    use crate::vision::{CropRegion, Frame, Tile};
    use std::path::PathBuf;

    const SQ: u32 = 20;

    fn solid_tile(rgb: [u8; 3]) -> Tile {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take((SQ * SQ * 3) as usize)
            .collect();
        Tile::from_raw(SQ, data).unwrap()
    }

    fn engine() -> Scrutinizer {
        Scrutinizer::default()
            .with_square_size(SQ)
            .with_crop_region(CropRegion::full())
            .with_grace_policy(GracePolicy::Frames(15))
    }

    // A recording whose detector square is always visible and that optionally
    // shows the fingerprint tile at index 4 in its second frame.
    fn write_recording(path: &PathBuf, detector_rgb: [u8; 3], mark: Option<&Tile>) {
        let base = {
            let mut tiles = gradient_frame(60, 60).segment(SQ).unwrap();
            tiles[0] = solid_tile(detector_rgb);
            Frame::reassemble(&tiles, SQ, 60, 60).unwrap()
        };
        let second = match mark {
            Some(mark) => {
                let mut tiles = base.segment(SQ).unwrap();
                tiles[4] = mark.clone();
                Frame::reassemble(&tiles, SQ, 60, 60).unwrap()
            }
            None => base.clone(),
        };
        std::fs::write(path, ppm_stream(&[base, second])).unwrap();
    }

    #[test]
    fn test_calibration_aggregates_across_recordings() {
        let dir = std::env::temp_dir().join("scrutineer-test-calibrate");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let detector_rgb = [10, 20, 30];
        let mark = solid_tile([200, 50, 50]);
        let shown = dir.join("shown.ppm");
        let unshown = dir.join("unshown.ppm");
        write_recording(&shown, detector_rgb, Some(&mark));
        write_recording(&unshown, detector_rgb, None);

        let fingerprints = vec![ReferenceFingerprint::new(4, mark)];
        let detector = DetectorSpec::new(solid_tile(detector_rgb));

        let calibrator = Calibrator::from_files(vec![&shown, &unshown], false)
            .with_engine(engine())
            .with_floor(0.0);
        let thresholds = calibrator
            .run(&fingerprints, &detector, true, false)
            .unwrap();

        assert_eq!(thresholds.len(), 1);
        let entry = thresholds.entries()[0];
        // One recording matched exactly, the other did not.
        assert!(entry.min < 1.0);
        assert!(entry.mean > entry.min);
        assert!((entry.mean - (1.0 + entry.min) / 2.0).abs() < 1e-12);
        assert_eq!(thresholds.score_matrix().len(), 2);

        // Rows were cached alongside the recordings.
        assert!(dir.join("shown.scrut.row.bin").exists());
        assert!(dir.join("unshown.scrut.row.bin").exists());

        // A second run is served from the cache and agrees.
        let again = calibrator
            .run(&fingerprints, &detector, true, false)
            .unwrap();
        assert_eq!(again.entries()[0].min, entry.min);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_force_ignores_cached_rows() {
        let dir = std::env::temp_dir().join("scrutineer-test-calibrate-force");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let detector_rgb = [10, 20, 30];
        let mark = solid_tile([200, 50, 50]);
        let recording = dir.join("stream.ppm");
        write_recording(&recording, detector_rgb, Some(&mark));

        let fingerprints = vec![ReferenceFingerprint::new(4, mark)];
        let detector = DetectorSpec::new(solid_tile(detector_rgb));

        // Plant a stale cached row with a matching checksum but wrong scores.
        let md5 = util::compute_header_md5sum(&recording).unwrap();
        let row = CalibrationRow {
            md5,
            scores: vec![0.123],
        };
        let mut f = std::fs::File::create(dir.join("stream.scrut.row.bin")).unwrap();
        bincode::serialize_into(&mut f, &row).unwrap();
        drop(f);

        let calibrator = Calibrator::from_files(vec![&recording], false).with_engine(engine());
        let scores = calibrator
            .run_single(&recording, &fingerprints, &detector, true)
            .unwrap();
        assert_eq!(scores, vec![0.123]);

        let forced = Calibrator::from_files(vec![&recording], true).with_engine(engine());
        let scores = forced
            .run_single(&recording, &fingerprints, &detector, true)
            .unwrap();
        assert_eq!(scores, vec![1.0]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_liveness_loss_truncates_calibration_row() {
        let dir = std::env::temp_dir().join("scrutineer-test-calibrate-liveness");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        // The detector square is missing for 19 frames; the fingerprint only
        // shows up in the final frame. The frame-count grace must end the
        // session before that frame is ever scored.
        let detector_rgb = [10, 20, 30];
        let mark = solid_tile([200, 50, 50]);
        let mut frames = vec![solid_frame(60, 60, [255, 255, 255]); 19];
        frames.push({
            let mut tiles = gradient_frame(60, 60).segment(SQ).unwrap();
            tiles[0] = solid_tile(detector_rgb);
            tiles[4] = mark.clone();
            Frame::reassemble(&tiles, SQ, 60, 60).unwrap()
        });
        let recording = dir.join("lossy.ppm");
        std::fs::write(&recording, ppm_stream(&frames)).unwrap();

        let fingerprints = vec![ReferenceFingerprint::new(4, mark)];
        let detector = DetectorSpec::new(solid_tile(detector_rgb));

        let calibrator = Calibrator::from_files(vec![&recording], false).with_engine(engine());
        let scores = calibrator
            .run_single(&recording, &fingerprints, &detector, false)
            .unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(scores.len(), 1);
        assert!(scores[0] < 1.0, "row scored past the grace cutoff");
    }

    #[test]
    fn test_run_requires_recordings() {
        let calibrator: Calibrator<PathBuf> = Calibrator::default();
        let detector = DetectorSpec::new(solid_tile([0, 0, 0]));
        assert!(matches!(
            calibrator.run(&[], &detector, false, false),
            Err(Error::CalibratorMissingRecordings)
        ));
    }
}
