use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use facewatch_core::{best_detection, DetectorSettings, FaceAnalyzer, OnnxFaceAnalyzer};
use facewatch_store::{summarize, window_start, EventLog, GalleryStore, NewIdentity, NewSource, SqliteStore};
use facewatch_video::{check_source, Camera, DeviceLeases, SourceType, VideoSource};
use facewatchd::Config;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facewatch", about = "facewatch face identification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from a reference photo
    Enroll {
        /// Photo containing the person's face
        image: PathBuf,
        /// Display name shown on the stream and in events
        #[arg(short, long)]
        name: String,
        /// Unique external code (employee number, case reference)
        #[arg(short, long)]
        code: String,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        /// Identity ID to remove
        id: i64,
    },
    /// Manage registered video sources
    Sources {
        #[command(subcommand)]
        command: SourceCommands,
    },
    /// Inspect the identification event log
    Events {
        #[command(subcommand)]
        command: EventCommands,
    },
    /// Show who was identified within the cooldown window
    Status,
    /// List local capture devices
    Devices,
    /// Open a capture device and read one frame
    Test {
        /// Device index (default: first working device)
        #[arg(short, long)]
        device: Option<u32>,
    },
}

#[derive(Subcommand)]
enum SourceCommands {
    /// Register a camera or stream
    Add {
        #[arg(short, long)]
        name: String,
        /// device, file, rtsp, rtmp, ip, http or cctv
        #[arg(short, long)]
        kind: String,
        /// Device index, file path or stream URL
        #[arg(short = 'u', long)]
        locator: String,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Register without enabling it
        #[arg(long)]
        inactive: bool,
    },
    /// List registered sources
    List,
    /// Enable a source
    Activate { id: i64 },
    /// Disable a source; streams requesting it receive a placeholder
    Deactivate { id: i64 },
    /// Remove a source
    Remove { id: i64 },
    /// Open a registered source and read one frame
    Test { id: i64 },
}

#[derive(Subcommand)]
enum EventCommands {
    /// List events, oldest first
    List {
        /// Only events for this identity name
        #[arg(short, long)]
        identity: Option<String>,
        /// Only events from the last N seconds
        #[arg(short, long)]
        since_secs: Option<u64>,
        /// Print JSON lines instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Delete one event
    Delete { id: i64 },
    /// Delete every event
    Clear,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Enroll { image, name, code } => enroll(&config, &image, name, code)?,
        Commands::List => {
            let identities = open_store(&config)?.load_all_identities()?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in identities {
                println!(
                    "{:>4}  {:<24} {:<12} dim={}",
                    identity.id,
                    identity.display_name,
                    identity.external_code,
                    identity.embedding.dim()
                );
            }
        }
        Commands::Remove { id } => {
            open_store(&config)?.remove_identity(id)?;
            println!("Removed identity {id}");
        }
        Commands::Sources { command } => sources(&config, command)?,
        Commands::Events { command } => events(&config, command)?,
        Commands::Status => {
            let store = open_store(&config)?;
            let now = Utc::now();
            let identities = store.load_all_identities()?;
            let recent = store.query_recent(None, window_start(now, config.cooldown_secs))?;
            let report = summarize(&identities, &recent, config.cooldown_secs, now);
            for status in &report.identities {
                let mark = if status.present { "present" } else { "absent" };
                println!("{:<24} {:<8} detections={}", status.display_name, mark, status.detections);
            }
            println!(
                "{} of {} present ({}%) in the last {}s",
                report.summary.present, report.summary.total, report.summary.attendance_rate, report.window_secs
            );
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for device in devices {
                println!("{}  {} ({}, {})", device.path, device.name, device.driver, device.bus);
            }
        }
        Commands::Test { device } => {
            let source = match device {
                Some(index) => VideoSource::device(index),
                None => VideoSource::any_device(),
            };
            let (width, height) = check_source(&source, &config.source_settings(), &DeviceLeases::new())?;
            println!("Camera OK: {width}x{height}");
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<SqliteStore> {
    SqliteStore::open(&config.db_path).with_context(|| format!("failed to open database {}", config.db_path.display()))
}

fn enroll(config: &Config, image_path: &Path, name: String, code: String) -> Result<()> {
    let rgb = image::open(image_path)
        .with_context(|| format!("failed to read {}", image_path.display()))?
        .to_rgb8();
    let (width, height) = rgb.dimensions();

    let mut analyzer = OnnxFaceAnalyzer::load(
        &config.detector_model_path(),
        &config.recognizer_model_path(),
        DetectorSettings::default(),
    )?;
    let Some(best) = best_detection(analyzer.analyze(rgb.as_raw(), width, height)?) else {
        bail!("no face detected in {}", image_path.display());
    };
    tracing::debug!(confidence = best.bbox.confidence, "reference face selected");

    let reference = std::fs::canonicalize(image_path).unwrap_or_else(|_| image_path.to_path_buf());
    let identity = open_store(config)?.enroll(NewIdentity {
        display_name: name,
        external_code: code,
        embedding: best.embedding,
        reference_image: Some(reference.to_string_lossy().into_owned()),
    })?;
    println!("Enrolled {} ({}) as identity {}", identity.display_name, identity.external_code, identity.id);
    Ok(())
}

fn sources(config: &Config, command: SourceCommands) -> Result<()> {
    let store = open_store(config)?;
    match command {
        SourceCommands::Add {
            name,
            kind,
            locator,
            location,
            description,
            inactive,
        } => {
            let record = store.add_source(NewSource {
                name,
                kind,
                locator,
                location,
                description,
                active: !inactive,
            })?;
            println!("Registered source {} ({})", record.id, record.name);
        }
        SourceCommands::List => {
            for record in store.list_sources()? {
                let state = if record.active { "active" } else { "inactive" };
                println!(
                    "{:>4}  {:<20} {:<8} {:<8} {}",
                    record.id, record.name, record.kind, state, record.locator
                );
            }
        }
        SourceCommands::Activate { id } => {
            store.set_source_active(id, true)?;
            println!("Source {id} activated");
        }
        SourceCommands::Deactivate { id } => {
            store.set_source_active(id, false)?;
            println!("Source {id} deactivated");
        }
        SourceCommands::Remove { id } => {
            store.remove_source(id)?;
            println!("Removed source {id}");
        }
        SourceCommands::Test { id } => {
            let record = store.source(id)?;
            let source = VideoSource {
                kind: SourceType::from_registry(&record.kind),
                locator: record.locator,
                active: record.active,
            };
            let (width, height) = check_source(&source, &config.source_settings(), &DeviceLeases::new())?;
            println!("Source {} is working: {width}x{height}", record.name);
        }
    }
    Ok(())
}

fn events(config: &Config, command: EventCommands) -> Result<()> {
    let store = open_store(config)?;
    match command {
        EventCommands::List {
            identity,
            since_secs,
            json,
        } => {
            let since = match since_secs {
                Some(secs) => window_start(Utc::now(), secs),
                None => DateTime::<Utc>::UNIX_EPOCH,
            };
            for stored in store.query_recent(identity.as_deref(), since)? {
                if json {
                    println!("{}", serde_json::to_string(&stored)?);
                    continue;
                }
                let event = &stored.event;
                println!(
                    "{:>6}  {}  {:<20} {:.2}  {} {}",
                    stored.id,
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.identity_name,
                    event.confidence,
                    event.source_kind,
                    event.source_ref.as_deref().unwrap_or("-")
                );
            }
        }
        EventCommands::Delete { id } => {
            store.delete_event(id)?;
            println!("Deleted event {id}");
        }
        EventCommands::Clear => {
            let deleted = store.delete_all_events()?;
            println!("Deleted {deleted} events");
        }
    }
    Ok(())
}
