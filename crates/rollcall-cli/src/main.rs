use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn status(&self) -> zbus::Result<String>;
    fn snapshot(&self) -> zbus::Result<String>;
    fn overlay(&self) -> zbus::Result<String>;
    fn generate_report(&self) -> zbus::Result<String>;
    fn reset_session(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall classroom attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Show who is present and who is absent
    Roster,
    /// Show the faces seen on the most recent tick
    Overlay,
    /// Generate a written attendance summary
    Report,
    /// Start a new session with everyone absent
    Reset,
    /// Run camera diagnostics
    Test {
        /// V4L2 device to test
        #[arg(short, long, default_value = rollcall_hw::DEFAULT_DEVICE)]
        device: String,
        /// Write the captured frame to this PNG
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

async fn proxy(system: bool) -> Result<AttendanceProxy<'static>> {
    tracing::debug!(system, "connecting to rollcalld");
    let connection = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    AttendanceProxy::new(&connection)
        .await
        .context("rollcalld is not reachable; is it running?")
}

fn print_json(raw: &str) -> Result<()> {
    let value: Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// "present" and "absent" name columns from a snapshot.
fn roster_lines(snapshot: &Value) -> Vec<String> {
    let entries = snapshot["entries"].as_array().cloned().unwrap_or_default();
    let present = entries.iter().filter(|e| e["status"] == "Present").count();
    let mut lines = vec![format!("Present {present}/{}", entries.len())];
    for entry in &entries {
        let mark = if entry["status"] == "Present" { "x" } else { " " };
        let name = entry["identity"]["name"].as_str().unwrap_or("?");
        lines.push(format!("  [{mark}] {name}"));
    }
    lines
}

fn overlay_lines(overlay: &Value) -> Vec<String> {
    let boxes = overlay["boxes"].as_array().cloned().unwrap_or_default();
    let mut lines = vec![format!("tick {}: {} face(s)", overlay["tick"], boxes.len())];
    for b in &boxes {
        let bbox = &b["bbox"];
        lines.push(format!(
            "  {} at ({:.0}, {:.0}) {:.0}x{:.0}",
            b["label"].as_str().unwrap_or("?"),
            bbox["x"].as_f64().unwrap_or(0.0),
            bbox["y"].as_f64().unwrap_or(0.0),
            bbox["width"].as_f64().unwrap_or(0.0),
            bbox["height"].as_f64().unwrap_or(0.0),
        ));
    }
    lines
}

fn camera_test(device: &str, save: Option<PathBuf>) -> Result<()> {
    println!("Video capture devices:");
    let devices = rollcall_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("  (none found)");
    }
    for d in &devices {
        println!("  {}  {} [{}] {}", d.path, d.name, d.driver, d.bus);
    }

    let camera = rollcall_hw::Camera::open(device, 0)
        .with_context(|| format!("failed to open {device}"))?;
    println!(
        "Opened {device}: {}x{} {:?}",
        camera.width, camera.height, camera.pixel_format
    );
    let frame = camera.capture_raw().context("failed to capture a frame")?;
    println!(
        "Frame #{}: mean brightness {:.1}, {}",
        frame.sequence,
        frame.mean_brightness(),
        if frame.is_dark { "DARK" } else { "ok" }
    );

    if let Some(path) = save {
        let img = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame buffer does not match its dimensions")?;
        img.save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Saved {}", path.display());
    }
    camera.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => print_json(&proxy(cli.system).await?.status().await?)?,
        Commands::Roster => {
            let snapshot: Value =
                serde_json::from_str(&proxy(cli.system).await?.snapshot().await?)?;
            roster_lines(&snapshot).iter().for_each(|l| println!("{l}"));
        }
        Commands::Overlay => {
            let overlay: Value = serde_json::from_str(&proxy(cli.system).await?.overlay().await?)?;
            overlay_lines(&overlay).iter().for_each(|l| println!("{l}"));
        }
        Commands::Report => {
            println!("{}", proxy(cli.system).await?.generate_report().await?);
        }
        Commands::Reset => {
            let session = proxy(cli.system).await?.reset_session().await?;
            println!("New session: {session}");
        }
        Commands::Test { device, save } => {
            println!("Running camera diagnostics...");
            tokio::task::spawn_blocking(move || camera_test(&device, save)).await??;
        }
    }

    Ok(())
}
