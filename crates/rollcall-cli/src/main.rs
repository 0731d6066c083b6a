use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{BoundingBox, Commit, DetectedFace};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, watch};

mod kiosk;
mod proxy;

use proxy::AttendanceProxy;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity
    Enroll {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        /// Where attendance confirmations are sent
        #[arg(long)]
        contact: String,
        /// Group (e.g. department) used to filter reports
        #[arg(long)]
        group: String,
        /// JSON array of detector output for the enrollment image
        #[arg(long)]
        faces: PathBuf,
    },
    /// Mark attendance from a single image's detector output
    Record {
        #[arg(short, long)]
        session: String,
        /// YYYY-MM-DD; defaults to today (UTC) on the daemon
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        faces: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Attendance report (defaults to the last 7 days, all groups)
    Report {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        #[arg(long, default_value = "all")]
        group: String,
    },
    /// Show daemon status
    Status,
    /// Replay a JSONL stream of frames through the confirmer and record each commit
    Kiosk {
        #[arg(short, long)]
        session: String,
        /// Frame stream; reads stdin when omitted
        #[arg(long)]
        frames: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let builder = if cli.system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = builder.build().await.context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld not reachable")?;

    match cli.command {
        Commands::Enroll {
            id,
            name,
            contact,
            group,
            faces,
        } => {
            let payload = json!({
                "identity_id": id,
                "display_name": name,
                "contact_address": contact,
                "group_tag": group,
                "faces": read_faces(&faces)?,
            });
            print_json(&proxy.enroll(&payload.to_string()).await?)?;
        }
        Commands::Record {
            session,
            date,
            faces,
        } => {
            let payload = json!({
                "session_tag": session,
                "date": date,
                "faces": read_faces(&faces)?,
            });
            print_json(&proxy.record(&payload.to_string()).await?)?;
        }
        Commands::List => {
            print_json(&proxy.list_identities().await?)?;
        }
        Commands::Report { from, to, group } => {
            let rows = proxy
                .report(
                    from.as_deref().unwrap_or(""),
                    to.as_deref().unwrap_or(""),
                    &group,
                )
                .await?;
            print_json(&rows)?;
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
        Commands::Kiosk { session, frames } => {
            run_kiosk(&proxy, session, frames).await?;
        }
    }

    Ok(())
}

async fn run_kiosk(
    proxy: &AttendanceProxy<'_>,
    session: String,
    frames: Option<PathBuf>,
) -> Result<()> {
    let config = kiosk::confirmer_config(|key| std::env::var(key).ok());
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let cancelled = cancel_rx.clone();
    let (commit_tx, mut commit_rx) = mpsc::channel::<Commit>(4);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; stopping kiosk");
            let _ = cancel_tx.send(true);
        }
    });

    let sampler = match frames {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            tokio::spawn(kiosk::run_sampler(
                kiosk::JsonlFrames::new(file),
                config,
                cancel_rx,
                commit_tx,
            ))
        }
        None => tokio::spawn(kiosk::run_sampler(
            kiosk::JsonlFrames::new(tokio::io::stdin()),
            config,
            cancel_rx,
            commit_tx,
        )),
    };

    kiosk::forward_commits(&mut commit_rx, &cancelled, |commit| {
        let payload = json!({
            "session_tag": session,
            "faces": [commit_face(commit)],
        })
        .to_string();
        async move {
            match proxy.record(&payload).await {
                Ok(reply) => {
                    if let Err(e) = print_json(&reply) {
                        tracing::error!(error = %e, "unreadable record reply");
                    }
                }
                Err(e) => tracing::error!(error = %e, "record call failed"),
            }
        }
    })
    .await;

    let stats = sampler.await.context("sampler task")?;
    println!(
        "kiosk stopped: {} frames, {} commits{}",
        stats.frames,
        stats.commits,
        if stats.cancelled { " (cancelled)" } else { "" }
    );
    Ok(())
}

fn commit_face(commit: Commit) -> DetectedFace {
    DetectedFace {
        bbox: BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
            confidence: 0.0,
        },
        embedding: commit.embedding,
    }
}

fn read_faces(path: &Path) -> Result<Vec<DetectedFace>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing faces in {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
