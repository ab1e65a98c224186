use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use uuid::Uuid;

use carrel::Result;
use carrel::config::{
    AppSettings, DEFAULT_DATABASE_URL, DEFAULT_LIBRARY_DIR, DEFAULT_STAGING_DIR,
};
use carrel::database::models::ArchiveDbModel;
use carrel::downloads::{DownloadService, TransferEvent};
use carrel::logging;
use carrel::services::ServiceContainer;

#[derive(Parser)]
#[command(
    name = "carrel",
    version,
    about = "Offline content library: resumable archive downloads"
)]
struct Cli {
    /// SQLite database URL
    #[arg(long, env = "CARREL_DATABASE_URL", default_value = DEFAULT_DATABASE_URL, global = true)]
    database_url: String,

    /// Destination directory for completed archives
    #[arg(long, env = "CARREL_LIBRARY_DIR", default_value = DEFAULT_LIBRARY_DIR, global = true)]
    library_dir: PathBuf,

    /// Directory for in-flight partial files
    #[arg(long, env = "CARREL_STAGING_DIR", default_value = DEFAULT_STAGING_DIR, global = true)]
    staging_dir: PathBuf,

    /// Directory for rotated log files (console only when unset)
    #[arg(long, env = "CARREL_LOG_DIR", global = true)]
    log_dir: Option<PathBuf>,

    /// Progress flush interval in milliseconds
    #[arg(long, env = "CARREL_HEARTBEAT_MS", default_value_t = 1000, global = true)]
    heartbeat_ms: u64,

    /// Allow transfers over metered connections by default
    #[arg(long, env = "CARREL_ALLOW_METERED", global = true)]
    allow_metered: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a new archive in the catalog
    Add {
        #[arg(long)]
        url: String,
        /// Display title; defaults to the URL
        #[arg(long)]
        title: Option<String>,
        /// Expected size in bytes, when the catalog knows it
        #[arg(long)]
        total_bytes: Option<i64>,
    },
    /// List all archives with their transfer state
    List,
    /// Show one archive record in detail
    Show { id: Uuid },
    /// Download an archive and follow progress until it settles.
    /// Ctrl-C pauses the transfer instead of abandoning it.
    Fetch {
        id: Uuid,
        /// Allow this transfer over a metered connection
        #[arg(long)]
        metered: bool,
    },
    /// Continue a paused transfer and follow progress
    Resume { id: Uuid },
    /// Ask a live transfer to pause
    Pause { id: Uuid },
    /// Abandon a transfer and reset its record
    Cancel { id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = AppSettings {
        database_url: cli.database_url,
        library_dir: cli.library_dir,
        staging_dir: cli.staging_dir,
        log_dir: cli.log_dir,
        heartbeat_period: Duration::from_millis(cli.heartbeat_ms),
        allow_metered: cli.allow_metered,
        ..AppSettings::default()
    };

    let _guard = logging::init_logging(settings.log_dir.as_deref())?;

    let container = ServiceContainer::new(&settings).await?;
    container.initialize().await?;

    run_command(&container, &settings, cli.command).await?;

    container.shutdown().await?;
    Ok(())
}

async fn run_command(
    container: &ServiceContainer,
    settings: &AppSettings,
    command: Command,
) -> Result<()> {
    match command {
        Command::Add {
            url,
            title,
            total_bytes,
        } => {
            let title = title.unwrap_or_else(|| url.clone());
            let mut record = ArchiveDbModel::new(title, url);
            if let Some(total) = total_bytes {
                record = record.with_total_bytes(total);
            }
            container.archives.create_archive(&record).await?;
            println!("{}", record.id);
        }
        Command::List => {
            for record in container.archives.list_archives().await? {
                println!(
                    "{}  {:<11}  {:>14}  {}",
                    record.id,
                    record.status,
                    format_progress(record.bytes_written, record.total_bytes),
                    record.title
                );
            }
        }
        Command::Show { id } => {
            let record = container.archives.get_archive(&id.to_string()).await?;
            println!("id:            {}", record.id);
            println!("title:         {}", record.title);
            println!("source url:    {}", record.source_url.as_deref().unwrap_or("-"));
            println!("status:        {}", record.status);
            println!(
                "progress:      {}",
                format_progress(record.bytes_written, record.total_bytes)
            );
            println!(
                "resume token:  {}",
                match &record.resume_token {
                    Some(token) => format!("{} bytes", token.len()),
                    None => "-".to_string(),
                }
            );
            println!("last error:    {}", record.last_error.as_deref().unwrap_or("-"));
            println!("updated at:    {}", record.updated_at);
        }
        Command::Fetch { id, metered } => {
            let mut events = container.downloads.subscribe();
            if container
                .downloads
                .start(id, metered || settings.allow_metered)
                .await
            {
                follow_transfer(&container.downloads, &mut events, id).await;
            } else {
                eprintln!("nothing to fetch: {id} is unknown or has no source URL");
            }
        }
        Command::Resume { id } => {
            let mut events = container.downloads.subscribe();
            if container.downloads.resume(id).await {
                follow_transfer(&container.downloads, &mut events, id).await;
            } else {
                eprintln!("nothing to resume: {id} has no resume token");
            }
        }
        Command::Pause { id } => {
            container.downloads.pause(id);
            println!("pause requested for {id}");
        }
        Command::Cancel { id } => {
            container.downloads.cancel(id).await;
            println!("cancelled {id}");
        }
    }
    Ok(())
}

/// Follow one transfer's events until it reaches a settled state. Ctrl-C
/// requests a pause and keeps following until the paused write lands.
async fn follow_transfer(
    downloads: &DownloadService,
    events: &mut broadcast::Receiver<TransferEvent>,
    id: Uuid,
) {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("pausing {id}...");
                downloads.pause(id);
            }
            event = events.recv() => match event {
                Ok(TransferEvent::Queued { id: event_id }) if event_id == id => {
                    println!("queued");
                }
                Ok(TransferEvent::Progress { id: event_id, bytes_written, total_bytes })
                    if event_id == id =>
                {
                    println!("{}", format_progress(bytes_written as i64, total_bytes.unwrap_or(0) as i64));
                }
                Ok(TransferEvent::Paused { id: event_id }) if event_id == id => {
                    println!("paused");
                    return;
                }
                Ok(TransferEvent::Cancelled { id: event_id }) if event_id == id => {
                    println!("cancelled");
                    return;
                }
                Ok(TransferEvent::Completed { id: event_id, path }) if event_id == id => {
                    println!("completed: {}", path.display());
                    return;
                }
                Ok(TransferEvent::Failed { id: event_id, error }) if event_id == id => {
                    eprintln!("failed: {error}");
                    return;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

fn format_progress(bytes_written: i64, total_bytes: i64) -> String {
    if total_bytes > 0 {
        let percent = bytes_written as f64 / total_bytes as f64 * 100.0;
        format!("{bytes_written}/{total_bytes} ({percent:.1}%)")
    } else {
        format!("{bytes_written} bytes")
    }
}
