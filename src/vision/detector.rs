use std::io::Read;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::{
    mean_diff_score, structural_score, CropRegion, DetectorSpec, Frame, FrameReader,
    ReferenceFingerprint, StreamerProfile, Tile,
};
use crate::{util, Error, Result};

/// How long a missing detector square is tolerated before a session terminates
/// with a liveness loss.
///
/// Live single-profile sessions use wall-clock time; batch/offline sessions
/// (calibration, multi-profile fan-out over recordings) are not paced by a real
/// stream, so they count consecutive mismatched frames instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GracePolicy {
    Time(Duration),
    Frames(u64),
}

/// Terminal state of a detection session.
///
/// None of these are errors: each yields whatever verdict the running maxima
/// support at that point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The stream ended (decoder closed its output).
    Normal,
    /// The session outlived its timeout.
    Timeout,
    /// The detector square stayed missing beyond the grace window.
    LivenessLost,
}

/// Raw result of one pass over a stream: the running maximum structural score
/// per fingerprint, before thresholds are applied.
#[derive(Clone, Debug)]
pub struct Scan {
    pub running_max: Vec<f64>,
    pub termination: Termination,
    pub frames: u64,
}

/// Final per-fingerprint presence verdict for one identity, serialized as JSON
/// for downstream consumers.
#[derive(Clone, Debug, Serialize)]
pub struct Outcome {
    pub identity: String,
    pub termination: Termination,
    pub verdicts: Vec<bool>,
    pub running_max: Vec<f64>,
}

impl Outcome {
    fn new(profile: &StreamerProfile, termination: Termination, running_max: Vec<f64>) -> Self {
        // Kept verbatim from the calibrated production logic. Note that
        // `score + (mean - min) >= mean` reduces to `score >= min`; the mean
        // term is retained for compatibility with existing threshold files.
        let verdicts = profile
            .thresholds()
            .entries()
            .iter()
            .zip(&running_max)
            .map(|(t, &score)| score + (t.mean - t.min) >= t.mean)
            .collect();
        Self {
            identity: profile.label().to_owned(),
            termination,
            verdicts,
            running_max,
        }
    }
}

// Liveness grace accumulator. Recovery resets it fully: one matching frame
// returns it to Clear no matter how long the lapse had been running.
enum GraceState {
    Clear,
    Lapsed {
        since: Instant,
        failed_frames: u64,
    },
}

/// The streaming detection engine.
///
/// Pulls frames out of a [FrameReader] one at a time, checks that the resolved
/// identity's detector square is still visible (with grace-period tolerance for
/// transient signal loss), and tracks the running maximum structural score of
/// every reference fingerprint against its assigned tile. Processing within a
/// session is strictly sequential; backpressure is the blocking read on the
/// decoder pipe.
#[derive(Clone, Debug)]
pub struct Scrutinizer {
    square_size: u32,
    detector_threshold: f64,
    session_timeout: Duration,
    grace: GracePolicy,
    crop: CropRegion,
}

impl Default for Scrutinizer {
    fn default() -> Self {
        Self {
            square_size: super::DEFAULT_SQUARE_SIZE,
            detector_threshold: super::DEFAULT_DETECTOR_THRESHOLD,
            session_timeout: super::DEFAULT_SESSION_TIMEOUT,
            grace: GracePolicy::Time(super::DEFAULT_GRACE_PERIOD),
            crop: CropRegion::default(),
        }
    }
}

impl Scrutinizer {
    /// Returns a new [Scrutinizer] with the provided tile size.
    pub fn with_square_size(mut self, square_size: u32) -> Self {
        self.square_size = square_size;
        self
    }

    /// Returns a new [Scrutinizer] with the provided detector threshold.
    pub fn with_detector_threshold(mut self, detector_threshold: f64) -> Self {
        self.detector_threshold = detector_threshold;
        self
    }

    /// Returns a new [Scrutinizer] with the provided session timeout.
    pub fn with_session_timeout(mut self, session_timeout: Duration) -> Self {
        self.session_timeout = session_timeout;
        self
    }

    /// Returns a new [Scrutinizer] with the provided grace policy.
    pub fn with_grace_policy(mut self, grace: GracePolicy) -> Self {
        self.grace = grace;
        self
    }

    /// Returns a new [Scrutinizer] with the provided crop region.
    pub fn with_crop_region(mut self, crop: CropRegion) -> Self {
        self.crop = crop;
        self
    }

    pub fn square_size(&self) -> u32 {
        self.square_size
    }

    /// Runs a full detection session for one resolved profile and applies its
    /// calibrated thresholds.
    ///
    /// The fingerprint/threshold alignment is checked before the first frame
    /// is read; a mismatch refuses to start rather than failing mid-loop.
    pub fn run<R: Read>(&self, reader: FrameReader<R>, profile: &StreamerProfile) -> Result<Outcome> {
        Self::check_alignment(profile)?;
        let scan = self.scan(reader, profile.fingerprints(), profile.detector())?;
        Ok(Outcome::new(profile, scan.termination, scan.running_max))
    }

    /// Runs detection for several candidate profiles over the *same* frame
    /// sequence in a single pass.
    ///
    /// This is the fallback when identity resolution is ambiguous: a live
    /// stream cannot be replayed once per candidate, so every candidate gets
    /// its own independent session state and liveness tracking within one
    /// loop. A candidate whose own grace window expires drops out without
    /// stopping the others; the loop ends when every candidate has dropped
    /// out, the timeout is hit, or the stream ends.
    pub fn run_all<R: Read>(
        &self,
        mut reader: FrameReader<R>,
        profiles: &[StreamerProfile],
    ) -> Result<Vec<Outcome>> {
        for profile in profiles {
            Self::check_alignment(profile)?;
        }

        struct Candidate<'a> {
            profile: &'a StreamerProfile,
            grace: GraceState,
            running_max: Vec<f64>,
            termination: Option<Termination>,
        }

        let span = tracing::span!(tracing::Level::TRACE, "run_all");
        let _enter = span.enter();

        let started = Instant::now();
        let mut candidates: Vec<Candidate> = profiles
            .iter()
            .map(|profile| Candidate {
                profile,
                grace: GraceState::Clear,
                running_max: vec![-1.0; profile.fingerprints().len()],
                termination: None,
            })
            .collect();

        let shared_term = loop {
            if candidates.iter().all(|c| c.termination.is_some()) {
                break None;
            }
            if started.elapsed() > self.session_timeout {
                tracing::warn!("monitoring timeout, stopping all candidates");
                break Some(Termination::Timeout);
            }
            let frame = match reader.next_frame()? {
                Some(frame) => frame,
                None => break Some(Termination::Normal),
            };

            // Crop and tile once; candidates share the grid.
            let tiles = frame.crop(&self.crop).segment(self.square_size)?;

            for candidate in candidates.iter_mut().filter(|c| c.termination.is_none()) {
                if self.liveness_step(&frame, candidate.profile.detector(), &mut candidate.grace)? {
                    tracing::info!(
                        profile = %candidate.profile.label(),
                        "candidate dropped: detector square lost beyond the grace window"
                    );
                    candidate.termination = Some(Termination::LivenessLost);
                    continue;
                }
                Self::update_running_max(
                    &tiles,
                    candidate.profile.fingerprints(),
                    &mut candidate.running_max,
                )?;
            }
        };

        tracing::info!(
            frames = reader.frames_read(),
            elapsed = %util::format_time(started.elapsed()),
            "multi-profile session ended"
        );

        Ok(candidates
            .into_iter()
            .map(|c| {
                let termination = c
                    .termination
                    .or(shared_term)
                    .unwrap_or(Termination::Normal);
                Outcome::new(c.profile, termination, c.running_max)
            })
            .collect())
    }

    /// Runs the detection loop without thresholds, returning the raw running
    /// maxima. This is the engine variant the calibrator uses on labeled
    /// training streams.
    pub fn scan<R: Read>(
        &self,
        mut reader: FrameReader<R>,
        fingerprints: &[ReferenceFingerprint],
        detector: &DetectorSpec,
    ) -> Result<Scan> {
        let span = tracing::span!(tracing::Level::TRACE, "scan");
        let _enter = span.enter();

        let started = Instant::now();
        let mut grace = GraceState::Clear;
        let mut running_max = vec![-1.0; fingerprints.len()];

        let termination = loop {
            if started.elapsed() > self.session_timeout {
                tracing::warn!("monitoring timeout, stopping with partial maxima");
                break Termination::Timeout;
            }
            let frame = match reader.next_frame()? {
                Some(frame) => frame,
                None => break Termination::Normal,
            };

            if self.liveness_step(&frame, detector, &mut grace)? {
                tracing::info!("detector square lost beyond the grace window");
                break Termination::LivenessLost;
            }

            let tiles = frame.crop(&self.crop).segment(self.square_size)?;
            Self::update_running_max(&tiles, fingerprints, &mut running_max)?;
        };

        tracing::info!(
            ?termination,
            frames = reader.frames_read(),
            elapsed = %util::format_time(started.elapsed()),
            "session ended"
        );

        Ok(Scan {
            running_max,
            termination,
            frames: reader.frames_read(),
        })
    }

    fn check_alignment(profile: &StreamerProfile) -> Result<()> {
        let (fingerprints, thresholds) =
            (profile.fingerprints().len(), profile.thresholds().len());
        if fingerprints != thresholds {
            return Err(Error::ConfigMismatch {
                fingerprints,
                thresholds,
            });
        }
        Ok(())
    }

    // One liveness check. Returns true when the grace window has expired and
    // the session must terminate. The frame that merely starts or extends a
    // lapse is still scored by the caller.
    fn liveness_step(
        &self,
        frame: &Frame,
        detector: &DetectorSpec,
        grace: &mut GraceState,
    ) -> Result<bool> {
        let (x, y) = detector.origin(frame.width(), frame.height(), self.square_size);
        let target = frame.tile_at(x, y, self.square_size)?;
        let score = mean_diff_score(&target, detector.tile());

        if score >= self.detector_threshold {
            if let GraceState::Lapsed { since, .. } = *grace {
                tracing::info!(
                    lost_for = ?since.elapsed(),
                    "detector square recovered"
                );
            }
            *grace = GraceState::Clear;
            return Ok(false);
        }

        match grace {
            GraceState::Clear => {
                tracing::info!(score, "detector square not found, grace period started");
                *grace = GraceState::Lapsed {
                    since: Instant::now(),
                    failed_frames: 1,
                };
                Ok(false)
            }
            GraceState::Lapsed {
                since,
                failed_frames,
            } => {
                *failed_frames += 1;
                let expired = match self.grace {
                    GracePolicy::Time(window) => since.elapsed() > window,
                    GracePolicy::Frames(limit) => *failed_frames > limit,
                };
                Ok(expired)
            }
        }
    }

    fn update_running_max(
        tiles: &[Tile],
        fingerprints: &[ReferenceFingerprint],
        running_max: &mut [f64],
    ) -> Result<()> {
        for (max, fingerprint) in running_max.iter_mut().zip(fingerprints) {
            let tile =
                tiles
                    .get(fingerprint.square_index())
                    .ok_or(Error::SquareIndexOutOfRange {
                        square_index: fingerprint.square_index(),
                        tile_count: tiles.len(),
                    })?;
            let score = structural_score(tile, fingerprint.tile());
            if score > *max {
                *max = score;
            }
        }
        Ok(())
    }
}
