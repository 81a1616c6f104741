use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, CommandFactory, ErrorKind, Parser, Subcommand};

use scrutineer::vision::{
    self, resolve_identity, Calibrator, DetectorSpec, FrameReader, GracePolicy, IdentityOutcome,
    Outcome, ReferenceFingerprint, Scrutinizer, StreamerProfile, Tile,
};

#[derive(Debug, Subcommand)]
enum Commands {
    #[clap(after_help = "Displays info about scrutineer and its configured defaults.")]
    Info,

    #[clap(
        arg_required_else_help = true,
        after_help = "Monitor a raw frame stream for the appearance of known reference tiles. The stream is read from stdin (live decoder pipe) or from a recorded file. The active source identity is resolved on the first frame; if it is ambiguous, every candidate profile is evaluated against the same stream in a single pass. Verdicts are emitted as JSON."
    )]
    Watch {
        #[clap(
            required = true,
            value_parser = clap::value_parser!(PathBuf),
            help = "Directory of streamer profiles. Each subdirectory is one identity and contains detector.png, squares/ and thresholds.scrut.bin."
        )]
        profiles: PathBuf,

        #[clap(
            long,
            value_parser = clap::value_parser!(PathBuf),
            help = "Recorded stream to read instead of stdin. Recordings use the frame-count grace window; live stdin uses the wall-clock one."
        )]
        input: Option<PathBuf>,

        #[clap(
            long,
            value_parser = clap::value_parser!(PathBuf),
            help = "Write the JSON verdicts to this file instead of stdout."
        )]
        output: Option<PathBuf>,

        #[clap(
            long,
            default_value_t = vision::DEFAULT_DETECTOR_THRESHOLD,
            value_parser = clap::value_parser!(f64),
            help = "Minimum detector-square score for identity resolution and the per-frame liveness check. Range 0 (no match) to 1 (exact match)."
        )]
        detector_threshold: f64,

        #[clap(
            long,
            default_value_t = vision::DEFAULT_SESSION_TIMEOUT.as_secs(),
            value_parser = clap::value_parser!(u64),
            help = "Session timeout in seconds. A session still running after this long stops and reports whatever it has seen."
        )]
        timeout: u64,

        #[clap(
            long,
            default_value_t = vision::DEFAULT_GRACE_PERIOD.as_secs(),
            value_parser = clap::value_parser!(u64),
            help = "Liveness grace period in seconds (live streams). A missing detector square is tolerated for this long before the session stops."
        )]
        grace_seconds: u64,

        #[clap(
            long,
            default_value_t = vision::DEFAULT_GRACE_FRAMES,
            value_parser = clap::value_parser!(u64),
            help = "Liveness grace window in frames (recorded streams)."
        )]
        grace_frames: u64,

        #[clap(
            long,
            default_value_t = vision::DEFAULT_SQUARE_SIZE,
            value_parser = clap::value_parser!(u32),
            help = "Tile edge length in pixels."
        )]
        square_size: u32,
    },

    #[clap(
        arg_required_else_help = true,
        after_help = "Derive per-fingerprint decision thresholds from labeled training recordings. Each recording is scanned independently (in parallel when possible) and the per-recording score rows are aggregated into mean/min statistics. Rows are cached alongside each recording and reused on later runs."
    )]
    Calibrate {
        #[clap(
            required = true,
            multiple_values = true,
            value_parser = clap::value_parser!(PathBuf),
            help = "Recorded raw frame streams to calibrate against."
        )]
        recordings: Vec<PathBuf>,

        #[clap(
            long,
            required = true,
            value_parser = clap::value_parser!(PathBuf),
            help = "Directory of reference fingerprint tiles (square_{index}_{sequence}.png)."
        )]
        fingerprints: PathBuf,

        #[clap(
            long,
            required = true,
            value_parser = clap::value_parser!(PathBuf),
            help = "Detector square image for the identity being calibrated."
        )]
        detector: PathBuf,

        #[clap(
            long,
            required = true,
            value_parser = clap::value_parser!(PathBuf),
            help = "Write the calibrated thresholds to this file."
        )]
        output: PathBuf,

        #[clap(
            long,
            default_value_t = vision::DEFAULT_CALIBRATION_FLOOR,
            value_parser = clap::value_parser!(f64),
            help = "Training streams whose every score stays below this floor are dropped before thresholds are computed."
        )]
        floor: f64,

        #[clap(
            long,
            default_value_t = vision::DEFAULT_SQUARE_SIZE,
            value_parser = clap::value_parser!(u32),
            help = "Tile edge length in pixels."
        )]
        square_size: u32,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Re-scan all recordings and ignore any cached score rows on disk."
        )]
        force: bool,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Scan recordings sequentially instead of across threads."
        )]
        no_threading: bool,
    },
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

impl Cli {
    fn validate(&self) {
        let mut cmd = Cli::command();
        match self.command {
            Commands::Info => (),
            Commands::Watch {
                detector_threshold,
                square_size,
                ..
            } => {
                if !(0.0..=1.0).contains(&detector_threshold) {
                    cmd.error(
                        ErrorKind::InvalidValue,
                        "detector_threshold must be between 0.0 and 1.0",
                    )
                    .exit();
                }
                if square_size == 0 {
                    cmd.error(ErrorKind::InvalidValue, "square_size must be positive")
                        .exit();
                }
            }
            Commands::Calibrate {
                floor, square_size, ..
            } => {
                if !(0.0..=1.0).contains(&floor) {
                    cmd.error(ErrorKind::InvalidValue, "floor must be between 0.0 and 1.0")
                        .exit();
                }
                if square_size == 0 {
                    cmd.error(ErrorKind::InvalidValue, "square_size must be positive")
                        .exit();
                }
            }
        }
    }
}

fn load_profiles(dir: &PathBuf, square_size: u32) -> scrutineer::Result<Vec<StreamerProfile>> {
    let mut subdirs: Vec<_> = std::fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    subdirs.sort();
    subdirs
        .iter()
        .map(|p| StreamerProfile::from_dir(p, square_size))
        .collect()
}

fn load_detector_tile(path: &PathBuf, square_size: u32) -> scrutineer::Result<Tile> {
    let img = image::open(path)?.to_rgb8();
    Tile::from_rgb_image(&img)
        .filter(|t| t.size() == square_size)
        .ok_or(scrutineer::Error::TileGeometry {
            width: img.width(),
            height: img.height(),
            square_size,
        })
}

fn emit_verdicts(outcomes: &[Outcome], output: Option<&PathBuf>) -> scrutineer::Result<()> {
    let json = serde_json::to_string_pretty(outcomes)?;
    match output {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{}", json),
    }
    Ok(())
}

fn watch(
    profiles_dir: &PathBuf,
    input: Option<&PathBuf>,
    output: Option<&PathBuf>,
    scrutinizer: Scrutinizer,
    detector_threshold: f64,
    square_size: u32,
) -> scrutineer::Result<()> {
    let profiles = load_profiles(profiles_dir, square_size)?;
    if profiles.is_empty() {
        let mut cmd = Cli::command();
        cmd.error(
            ErrorKind::InvalidValue,
            format!("no profile directories found in {}", profiles_dir.display()),
        )
        .exit();
    }

    let source: Box<dyn Read> = match input {
        Some(path) => Box::new(std::fs::File::open(path)?),
        None => Box::new(std::io::stdin()),
    };
    let mut reader = FrameReader::new(source);

    // The first frame is consumed by identity resolution; scoring starts on
    // the next one.
    let first = match reader.next_frame()? {
        Some(frame) => frame,
        None => {
            tracing::warn!("stream ended before the first frame");
            return emit_verdicts(&[], output);
        }
    };

    let outcomes = match resolve_identity(&first, &profiles, square_size, detector_threshold)? {
        IdentityOutcome::Resolved(idx) => {
            vec![scrutinizer.run(reader, &profiles[idx])?]
        }
        IdentityOutcome::Ambiguous => {
            tracing::warn!("identity is ambiguous, evaluating every candidate profile");
            scrutinizer.run_all(reader, &profiles)?
        }
    };

    emit_verdicts(&outcomes, output)
}

fn main() -> scrutineer::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let args = Cli::parse();
    args.validate();

    match args.command {
        Commands::Watch {
            ref profiles,
            ref input,
            ref output,
            detector_threshold,
            timeout,
            grace_seconds,
            grace_frames,
            square_size,
        } => {
            // A recorded file is not paced in real time, so its grace window
            // is counted in frames; a live pipe uses wall-clock seconds.
            let grace = match input {
                Some(_) => GracePolicy::Frames(grace_frames),
                None => GracePolicy::Time(Duration::from_secs(grace_seconds)),
            };
            let scrutinizer = Scrutinizer::default()
                .with_square_size(square_size)
                .with_detector_threshold(detector_threshold)
                .with_session_timeout(Duration::from_secs(timeout))
                .with_grace_policy(grace);
            watch(
                profiles,
                input.as_ref(),
                output.as_ref(),
                scrutinizer,
                detector_threshold,
                square_size,
            )?;
        }
        Commands::Calibrate {
            ref recordings,
            ref fingerprints,
            ref detector,
            ref output,
            floor,
            square_size,
            force,
            no_threading,
        } => {
            let fingerprints = ReferenceFingerprint::load_directory(fingerprints, square_size)?;
            let detector = DetectorSpec::new(load_detector_tile(detector, square_size)?);
            // Recordings are not paced in real time, so the grace window is
            // counted in frames.
            let engine = Scrutinizer::default()
                .with_square_size(square_size)
                .with_grace_policy(GracePolicy::Frames(vision::DEFAULT_GRACE_FRAMES));
            let calibrator = Calibrator::from_files(recordings.clone(), force)
                .with_floor(floor)
                .with_engine(engine);
            let thresholds = calibrator.run(&fingerprints, &detector, true, !no_threading)?;
            thresholds.persist(output)?;

            println!("Calibrated {} fingerprints:", thresholds.len());
            for (fingerprint, entry) in fingerprints.iter().zip(thresholds.entries()) {
                println!(
                    "* square {:>3} - mean: {:.4}, min: {:.4}",
                    fingerprint.square_index(),
                    entry.mean,
                    entry.min
                );
            }
        }
        Commands::Info => {
            println!("scrutineer {}", env!("CARGO_PKG_VERSION"));
            println!(
                "* detector threshold: {}",
                vision::DEFAULT_DETECTOR_THRESHOLD
            );
            println!("* square size: {}", vision::DEFAULT_SQUARE_SIZE);
            println!(
                "* session timeout: {}s",
                vision::DEFAULT_SESSION_TIMEOUT.as_secs()
            );
            println!(
                "* grace: {}s live / {} frames batch",
                vision::DEFAULT_GRACE_PERIOD.as_secs(),
                vision::DEFAULT_GRACE_FRAMES
            );
            println!(
                "* calibration floor: {}",
                vision::DEFAULT_CALIBRATION_FLOOR
            );
            println!(
                "* expected input: {}x{}",
                vision::DEFAULT_EXPECTED_WIDTH,
                vision::DEFAULT_EXPECTED_HEIGHT
            );
        }
    }

    Ok(())
}
