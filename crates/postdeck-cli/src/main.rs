//! Postdeck - schedule social media posts from the command line

mod backend;
mod session;
mod settings;

use anyhow::{bail, Context, Result};
use backend::{read_media, Backend, DRY_RUN_EMAIL};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use postdeck_client::{
    MultipartStrategy, PostDraft, PostType, ScheduleFailure, ScheduleProgress, UploadProgress,
};
use postdeck_core::sanitize_file_name;
use session::{SavedSession, SessionFile};
use settings::Settings;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "postdeck")]
#[command(about = "Schedule social media posts with large media uploads")]
#[command(version)]
struct Args {
    /// Record API URL
    #[arg(long, env = "POSTDECK_API_URL", global = true)]
    api_url: Option<String>,

    /// Storage API URL
    #[arg(long, env = "POSTDECK_STORAGE_URL", global = true)]
    storage_url: Option<String>,

    /// Settings file (defaults to ./postdeck.toml when present)
    #[arg(short, long, env = "POSTDECK_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Run against in-memory stores, nothing leaves the process
    #[arg(long, env = "POSTDECK_DRY_RUN", global = true)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(short, long, env = "POSTDECK_DEBUG", global = true)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long, env = "POSTDECK_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and save the session
    Login {
        #[arg(long, env = "POSTDECK_EMAIL")]
        email: String,
        #[arg(long, env = "POSTDECK_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// End the session and forget the saved token
    Logout,
    /// Show who the saved token belongs to
    Whoami,
    /// List client accounts
    Clients,
    /// Upload one file
    Upload {
        file: PathBuf,
        /// Object key (defaults to uploads/<file name>)
        #[arg(long)]
        dest: Option<String>,
        /// presigned-parts or multipart
        #[arg(long)]
        strategy: Option<MultipartStrategy>,
    },
    /// Create a post, upload its media and link it
    Schedule {
        /// Client account ID
        #[arg(long)]
        client: String,
        /// single, carousel, reel or story
        #[arg(long = "type", value_name = "TYPE")]
        post_type: PostType,
        #[arg(long, default_value = "")]
        caption: String,
        /// Publish time, RFC 3339
        #[arg(long)]
        at: DateTime<Utc>,
        /// presigned-parts or multipart
        #[arg(long)]
        strategy: Option<MultipartStrategy>,
        /// Media files in display order
        #[arg(required = true)]
        media: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("postdeck={0},postdeck_client={0},postdeck_core={0}", log_level).into()
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(args.log_json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!args.log_json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(url) = args.api_url.clone() {
        settings.api_url = url;
    }
    if let Some(url) = args.storage_url.clone() {
        settings.storage_url = url;
    }

    let session_file = SessionFile::in_dir(&settings.config_dir());
    let saved = session_file.load()?;
    let token = settings.token.clone().or_else(|| saved.as_ref().map(|s| s.token.clone()));

    let backend = if args.dry_run {
        tracing::info!("Dry run: using in-memory stores");
        match &args.command {
            Command::Login { email, password } => {
                Backend::memory(Some(email.as_str()), Some(password.as_str())).await?
            }
            _ => Backend::memory(None, None).await?,
        }
    } else {
        tracing::debug!("Record API: {}", settings.api_url);
        tracing::debug!("Storage API: {}", settings.storage_url);
        Backend::http(&settings, token)?
    };

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            trigger.cancel();
        }
    });

    match args.command {
        Command::Login { email, password } => {
            let auth = backend.records.login(&email, &password).await?;
            if !backend.dry_run {
                session_file.save(&SavedSession::new(&auth.token, &auth.user.email))?;
                tracing::debug!("Session saved to {}", session_file.path().display());
            }
            println!("Logged in as {}", auth.user.email);
        }

        Command::Logout => {
            if let Err(e) = backend.records.logout().await {
                tracing::warn!("Logout request failed: {}", e);
            }
            if !backend.dry_run && session_file.clear()? {
                println!("Logged out");
            } else {
                println!("No saved session");
            }
        }

        Command::Whoami => {
            let user = backend
                .records
                .verify_token()
                .await
                .context("not logged in, run `postdeck login`")?;
            println!("{}", user.email);
            if let Some(name) = user.name {
                println!("name: {}", name);
            }
            if let Some(role) = user.role {
                println!("role: {}", role);
            }
            if backend.dry_run {
                println!("(dry run as {})", DRY_RUN_EMAIL);
            }
        }

        Command::Clients => {
            let clients = backend.records.get_clients().await?;
            if clients.is_empty() {
                println!("No clients");
            }
            for client in clients {
                match client.handle {
                    Some(handle) => println!("{}\t{}\t@{}", client.id, client.name, handle),
                    None => println!("{}\t{}", client.id, client.name),
                }
            }
        }

        Command::Upload {
            file,
            dest,
            strategy,
        } => {
            let strategy = resolve_strategy(strategy, &settings)?;
            let blob = read_media(&file).await?;
            let dest = dest.unwrap_or_else(|| format!("uploads/{}", sanitize_file_name(&blob.name)));
            let uploader = backend.file_uploader(&settings, strategy)?;

            let bar = progress_bar(args.log_json);
            let on_progress = {
                let bar = bar.clone();
                move |p: UploadProgress| {
                    bar.set_position(p.percent.round() as u64);
                    bar.set_message(format!("part {}/{}", p.completed_parts, p.total_parts));
                }
            };

            tracing::info!("Uploading {} ({} bytes) via {}", blob.name, blob.size(), strategy);
            match uploader.upload(&dest, &blob, Some(&on_progress), &cancel).await {
                Ok(object) => {
                    bar.finish_with_message("done");
                    println!("path: {}", object.path);
                    println!("url: {}", object.public_url);
                    println!(
                        "{} bytes in {} part(s), {} retries, {:.1}s",
                        object.size,
                        object.parts,
                        object.retries,
                        object.elapsed.as_secs_f64()
                    );
                }
                Err(e) => {
                    bar.abandon_with_message("failed");
                    return Err(e).with_context(|| format!("upload of {} failed", file.display()));
                }
            }
        }

        Command::Schedule {
            client,
            post_type,
            caption,
            at,
            strategy,
            media,
        } => {
            let strategy = resolve_strategy(strategy, &settings)?;
            let mut blobs = Vec::with_capacity(media.len());
            for path in &media {
                blobs.push(read_media(path).await?);
            }
            let draft = PostDraft {
                client_id: Some(client),
                post_type: Some(post_type),
                caption,
                scheduled_at: Some(at),
                media: blobs,
            };
            let orchestrator = backend.orchestrator(&settings, strategy)?;

            let bar = progress_bar(args.log_json);
            let on_progress = {
                let bar = bar.clone();
                move |p: ScheduleProgress| {
                    bar.set_position(p.percent.round() as u64);
                    bar.set_message(p.message);
                }
            };

            match orchestrator.run(&draft, Some(&on_progress), &cancel).await {
                Ok(report) => {
                    bar.finish_with_message("scheduled");
                    println!("post: {}", report.post_id);
                    println!(
                        "{} file(s), {} bytes in {:.1}s",
                        report.file_count,
                        report.total_bytes,
                        report.elapsed.as_secs_f64()
                    );
                    for media in &report.media {
                        println!("  {}. {}", media.order + 1, media.url);
                    }
                }
                Err(failure) => {
                    bar.abandon_with_message("failed");
                    print_failure(&failure);
                    bail!("scheduling failed during {}", failure.stage);
                }
            }
        }
    }

    Ok(())
}

fn resolve_strategy(flag: Option<MultipartStrategy>, settings: &Settings) -> Result<MultipartStrategy> {
    match flag {
        Some(strategy) => Ok(strategy),
        None => settings.strategy(),
    }
}

fn progress_bar(hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::with_template("{spinner} [{bar:40}] {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    bar.set_style(style);
    bar
}

fn print_failure(failure: &ScheduleFailure) {
    eprintln!("error: {}", failure.message());
    if let Some(detail) = failure.detail() {
        for line in detail.lines() {
            eprintln!("  {}", line);
        }
    }
    if let Some(rollback) = &failure.rollback {
        let record = if rollback.record_deleted { "deleted" } else { "NOT deleted" };
        eprintln!("rollback: post record {}", record);
        eprintln!("rollback: {} uploaded file(s) deleted", rollback.deleted_paths.len());
        if !rollback.is_clean() {
            eprintln!("rollback: incomplete, clean up manually");
        }
    }
    if failure.error.status() == Some(401) {
        eprintln!("hint: run `postdeck login`");
    }
}
