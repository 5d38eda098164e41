use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use roster_engine::{
    load_models, spawn_engine, AttendanceService, Config, EngineHandle, EnrollRequest,
    IdentityUpdate, Policy, StabilityState, StabilityTracker,
};
use roster_store::{AttendanceStore, Cohort, SqliteStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "roster", about = "Face recognition attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new person from one or more camera frames
    Enroll {
        #[arg(short, long)]
        name: String,
        /// Student number, badge id or similar
        #[arg(short, long)]
        external_id: String,
        #[command(flatten)]
        cohort: CohortArgs,
        /// Enroll from the first frame without waiting for a still face
        #[arg(long)]
        no_wait: bool,
        /// Image files sampled in order (repeated until the face is still)
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// Run attendance over a sequence of frames
    Scan {
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// List enrolled identities; cohort flags narrow the list
    Identities {
        #[command(flatten)]
        cohort: CohortArgs,
    },
    /// Edit an enrolled identity
    Edit {
        id: i64,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        external_id: Option<String>,
        #[command(flatten)]
        cohort: CohortArgs,
    },
    /// Remove an identity and its attendance history
    Remove { id: i64 },
    /// Manage class sessions
    #[command(subcommand)]
    Session(SessionCommand),
    /// Print attendance records, newest first
    Attendance {
        /// Only records for this day (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Only the history of the person with this external id
        #[arg(short, long)]
        external_id: Option<String>,
    },
    /// Show configuration, model and database status
    Status,
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Start a session; cohort flags left out match anyone
    Start {
        #[arg(long)]
        owner: String,
        #[command(flatten)]
        cohort: CohortArgs,
    },
    /// End an active session
    End { id: i64 },
    /// List active sessions, or every session of one owner
    List {
        #[arg(long)]
        owner: Option<String>,
    },
}

#[derive(Args, Clone, Default)]
struct CohortArgs {
    #[arg(long)]
    course: Option<String>,
    #[arg(long)]
    year: Option<String>,
    #[arg(long)]
    semester: Option<String>,
    #[arg(long)]
    group: Option<String>,
}

impl From<CohortArgs> for Cohort {
    fn from(args: CohortArgs) -> Self {
        Cohort {
            course: args.course,
            year: args.year,
            semester: args.semester,
            group: args.group,
        }
    }
}

#[derive(Serialize)]
struct StatusReport {
    model_dir: PathBuf,
    detector_model: bool,
    recognizer_model: bool,
    db_path: PathBuf,
    identities: usize,
    active_sessions: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Enroll {
            name,
            external_id,
            cohort,
            no_wait,
            frames,
        } => {
            let engine = start_engine(&config)?;
            let image = if no_wait {
                read_frame(&frames[0]).await?
            } else {
                wait_for_still_face(&engine, &config, &frames).await?
            };
            let identity = engine
                .enroll(EnrollRequest {
                    name,
                    external_id,
                    cohort: cohort.into(),
                    image,
                })
                .await?;
            print_json(&identity)?;
        }
        Commands::Scan { frames } => {
            let engine = start_engine(&config)?;
            tracing::info!(
                identities = engine.identities().len(),
                frames = frames.len(),
                "scanning"
            );

            let mut ticker = tokio::time::interval(config.frame_interval());
            for path in &frames {
                ticker.tick().await;
                let frame = read_frame(path).await?;
                match engine.try_process_frame(frame).await {
                    Ok(Some(outcomes)) => {
                        for outcome in &outcomes {
                            print_json(outcome)?;
                        }
                    }
                    Ok(None) => tracing::debug!(path = %path.display(), "frame dropped"),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "frame not processed")
                    }
                }
            }
        }
        Commands::Identities { cohort } => {
            let store = SqliteStore::open(&config.db_path)?;
            let filter = Cohort::from(cohort);
            for identity in store.list_identities()? {
                if filter.admits(&identity.cohort) {
                    print_json(&identity)?;
                }
            }
        }
        Commands::Edit {
            id,
            name,
            external_id,
            cohort,
        } => {
            let engine = start_engine(&config)?;
            let update = IdentityUpdate {
                name,
                external_id,
                course: cohort.course,
                year: cohort.year,
                semester: cohort.semester,
                group: cohort.group,
            };
            let identity = engine.update_identity(id, update).await?;
            print_json(&identity)?;
        }
        Commands::Remove { id } => {
            let engine = start_engine(&config)?;
            if !engine.delete_identity(id).await? {
                bail!("no identity with id {id}");
            }
            println!("Removed identity {id}");
        }
        Commands::Session(command) => {
            let store = SqliteStore::open(&config.db_path)?;
            match command {
                SessionCommand::Start { owner, cohort } => {
                    let session = store.start_session(&owner, &cohort.into())?;
                    print_json(&session)?;
                }
                SessionCommand::End { id } => {
                    if !store.end_session(id)? {
                        bail!("no active session with id {id}");
                    }
                    println!("Ended session {id}");
                }
                SessionCommand::List { owner } => {
                    let sessions = match owner {
                        Some(owner) => store.sessions_for_owner(&owner)?,
                        None => store.list_active_sessions()?,
                    };
                    for session in &sessions {
                        print_json(session)?;
                    }
                }
            }
        }
        Commands::Attendance { date, external_id } => {
            let store = SqliteStore::open(&config.db_path)?;
            let entries: Vec<_> = match external_id {
                Some(external_id) => {
                    let Some(identity) = store.find_identity_by_external_id(&external_id)? else {
                        bail!("no identity with external id {external_id}");
                    };
                    store
                        .attendance_for_identity(identity.id)?
                        .into_iter()
                        .filter(|entry| date.map_or(true, |day| entry.record.date == day))
                        .collect()
                }
                None => store.attendance_records(date)?,
            };
            for entry in &entries {
                print_json(entry)?;
            }
        }
        Commands::Status => {
            let store = SqliteStore::open(&config.db_path)?;
            let report = StatusReport {
                model_dir: config.model_dir.clone(),
                detector_model: config.detector_model_path().exists(),
                recognizer_model: config.recognizer_model_path().exists(),
                db_path: config.db_path.clone(),
                identities: store.list_identities()?.len(),
                active_sessions: store.list_active_sessions()?.len(),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn start_engine(config: &Config) -> Result<EngineHandle> {
    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let (detector, recognizer) = load_models(config);
    let service = AttendanceService::new(detector, recognizer, store, Policy::from(config))?
        .with_thumbnail_dir(config.thumbnail_dir.clone());
    Ok(spawn_engine(service)?)
}

async fn read_frame(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("reading frame {}", path.display()))
}

/// Wait for a still face, giving up after the configured timeout.
async fn wait_for_still_face(
    engine: &EngineHandle,
    config: &Config,
    frames: &[PathBuf],
) -> Result<Vec<u8>> {
    let tracker = StabilityTracker::from_config(config);
    let sample_delay = Duration::from_millis(config.stability_sample_ms);
    let wait = sample_until_still(engine, tracker, frames, sample_delay);

    match tokio::time::timeout(config.stability_timeout(), wait).await {
        Ok(result) => result,
        Err(_) => bail!(
            "could not capture a still face within {}s; try again",
            config.stability_timeout_secs
        ),
    }
}

/// Sample the frames in a loop until one confident face holds still, and
/// return the frame that completed the streak.
async fn sample_until_still(
    engine: &EngineHandle,
    mut tracker: StabilityTracker,
    frames: &[PathBuf],
    sample_delay: Duration,
) -> Result<Vec<u8>> {
    for path in frames.iter().cycle() {
        let frame = read_frame(path).await?;
        let detections = engine.detect(frame.clone()).await?;
        match tracker.observe(&detections) {
            StabilityState::Stable(face) => {
                tracing::info!(score = face.score, path = %path.display(), "face is still");
                return Ok(frame);
            }
            StabilityState::Searching => {
                tracing::debug!(faces = detections.len(), "looking for a single clear face")
            }
            StabilityState::Moving => tracing::debug!("movement detected"),
            StabilityState::Holding { streak } => tracing::debug!(streak, "holding still"),
        }
        tokio::time::sleep(sample_delay).await;
    }
    bail!("no frames to sample")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
