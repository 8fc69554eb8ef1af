use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use newsync::api::{Article, HttpBackend, NewsBackend, PageFilter, QueueKind};
use newsync::bus::ChangeFeed;
use newsync::config::Config;
use newsync::ingest::StreamUpdate;
use newsync::query::PageMode;
use newsync::storage::{Database, DatabaseError, KeyValueStore};
use newsync::stores::{MutationOutcome, NoticeLevel};
use newsync::NewsSync;

/// Get the config directory path (~/.config/newsync/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("newsync"))
}

#[derive(Parser, Debug)]
#[command(name = "newsync", about = "News sync client: paginated cache, streaming fetch, user state")]
struct Args {
    /// Config file (default: ~/.config/newsync/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backend base URL, overrides the config file
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print paginated news
    Page {
        /// Use the live cursor listing instead of the cached one
        #[arg(long)]
        live: bool,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        search: Option<String>,
        /// Number of pages to load
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },
    /// Run a streaming multi-source fetch
    Stream {
        #[arg(long)]
        category: Option<String>,
        /// Skip the backend's article cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Keep a listing mounted and print it whenever the backend invalidates it
    Watch {
        #[arg(long)]
        category: Option<String>,
    },
    /// Toggle the liked state of an article id
    Like { article_id: i64 },
    /// Manage the reading queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Manage the source filter
    Filter {
        #[command(subcommand)]
        action: FilterAction,
    },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    Add {
        url: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value = "")]
        source: String,
        /// Keep the item past today
        #[arg(long)]
        permanent: bool,
    },
    Remove {
        url: String,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum FilterAction {
    Toggle { source: String },
    Clear,
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    // User-only access, the state database holds reading history
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(&config_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(&config_dir, perms) {
                    tracing::warn!(
                        path = %config_dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }

    let config_path = args
        .config
        .clone()
        .or_else(Config::default_path)
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if let Some(url) = args.api_url.clone() {
        config.api_base_url = url;
    }

    let db_path = config_dir.join("state.db");
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::Locked) => {
            eprintln!("Error: The state database is locked by another process. Try again shortly.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    let backend: Arc<dyn NewsBackend> = Arc::new(
        HttpBackend::new(&config.api_base_url, config.request_timeout())
            .context("Invalid backend URL")?,
    );
    let store: Arc<dyn KeyValueStore> = Arc::new(db);
    let session = NewsSync::new(config, backend, store, ChangeFeed::new());
    session.start().await;

    let result = run(&session, args.command).await;
    session.shutdown().await;
    result
}

async fn run(session: &NewsSync, command: Command) -> Result<()> {
    let mut notices = session.notices().subscribe();

    match command {
        Command::Page {
            live,
            category,
            search,
            pages,
        } => {
            let mode = if live { PageMode::Cursor } else { PageMode::Offset };
            let filter = PageFilter {
                category,
                search,
                ..Default::default()
            };
            let query = session.news_query(mode, &filter);
            let mut state = query.fetch().await;
            for _ in 1..pages {
                if !state.has_next_page {
                    break;
                }
                state = query.fetch_next_page().await;
            }
            if let Some(error) = &state.error {
                anyhow::bail!("Failed to load news: {error}");
            }
            print_articles(&state.articles);
            println!(
                "{} of {} articles{}",
                state.articles.len(),
                state.total,
                if state.has_next_page { ", more available" } else { "" }
            );
        }
        Command::Stream { category, no_cache } => {
            let mut updates = session
                .stream()
                .start(newsync::api::StreamRequest {
                    use_cache: !no_cache && session.config().use_cache,
                    category,
                })
                .context("A stream is already running")?;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        session.stream().cancel();
                    }
                    update = updates.recv() => match update {
                        Some(StreamUpdate::Status(status)) => println!("status: {status}"),
                        Some(StreamUpdate::Progress(p)) => {
                            println!("progress: {}/{} ({}%)", p.completed, p.total, p.percentage)
                        }
                        Some(StreamUpdate::Articles { source, articles }) => {
                            println!("{source}: {} articles so far", articles.len())
                        }
                        Some(StreamUpdate::SourceFailed { source, error }) => {
                            eprintln!("{source} failed: {error}")
                        }
                        Some(StreamUpdate::Finished(outcome)) => {
                            print_articles(&outcome.articles);
                            println!(
                                "{}: {} articles from {} sources, {} errors",
                                outcome.status,
                                outcome.articles.len(),
                                outcome.sources.len(),
                                outcome.errors.len()
                            );
                        }
                        None => break,
                    }
                }
            }
        }
        Command::Watch { category } => {
            let filter = PageFilter {
                category,
                ..Default::default()
            };
            let query = session.news_query(PageMode::Offset, &filter);
            let mut last = query.fetch().await;
            println!("{} articles, waiting for updates (Ctrl+C to stop)", last.articles.len());

            let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = tick.tick() => {
                        let state = query.read();
                        if state.articles != last.articles {
                            println!("Listing updated: {} articles", state.articles.len());
                            print_articles(&state.articles);
                            last = state;
                        }
                    }
                }
            }
        }
        Command::Like { article_id } => {
            let outcome = session.liked().toggle_liked(article_id).await;
            let liked = session.liked().is_liked(article_id);
            report(&outcome, &format!("article {article_id} liked: {liked}"));
        }
        Command::Queue { action } => match action {
            QueueAction::Add {
                url,
                title,
                source,
                permanent,
            } => {
                let kind = if permanent {
                    QueueKind::Permanent
                } else {
                    QueueKind::Daily
                };
                let outcome = session
                    .queue()
                    .add_to_queue(Article::new(url.clone(), title, source), kind)
                    .await;
                report(&outcome, &format!("queued {url}"));
            }
            QueueAction::Remove { url } => {
                let outcome = session.queue().remove_from_queue(&url).await;
                report(&outcome, &format!("removed {url}"));
            }
            QueueAction::List => {
                for item in session.queue().items() {
                    println!(
                        "{}  [{}] {} ({})",
                        item.added_at.format("%Y-%m-%d %H:%M"),
                        item.kind,
                        item.article.title,
                        item.article.url
                    );
                }
            }
        },
        Command::Filter { action } => match action {
            FilterAction::Toggle { source } => {
                let selected = session.sources().toggle(&source).await;
                println!("{source}: {}", if selected { "selected" } else { "unselected" });
            }
            FilterAction::Clear => {
                session.sources().clear().await;
                println!("Showing all sources");
            }
            FilterAction::List => {
                let selected = session.sources().selected();
                if selected.is_empty() {
                    println!("All sources");
                }
                for source in selected {
                    println!("{source}");
                }
            }
        },
    }

    while let Ok(notice) = notices.try_recv() {
        match notice.level {
            NoticeLevel::Info => println!("{}", notice.message),
            NoticeLevel::Error => eprintln!("{}", notice.message),
        }
    }
    Ok(())
}

fn report(outcome: &MutationOutcome, applied: &str) {
    match outcome {
        MutationOutcome::Applied => println!("{applied}"),
        // Reported through notices
        MutationOutcome::AlreadyPresent
        | MutationOutcome::NotFound
        | MutationOutcome::RolledBack { .. } => {}
    }
}

fn print_articles(articles: &[Article]) {
    for article in articles {
        println!("[{}] {}\n    {}", article.source, article.title, article.url);
    }
}
