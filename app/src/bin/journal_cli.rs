use api_client::StyleParameters;
use bytes::Bytes;
use cache::{DurableKeyValueStore, GalleryStateStore, SqliteBlobStore, GALLERY_STATE_KEY};
use chrono::Utc;
use clap::{Parser, Subcommand};
use photojournal::config::{AppConfig, AppConfigOverrides};
use photojournal::{init_logging, AppContext};
use std::path::PathBuf;
use std::sync::Arc;
use sync::RefreshOutcome;

#[derive(Parser)]
#[command(
    name = "journal_cli",
    author,
    version,
    about = "Photo journal command line client"
)]
struct Cli {
    /// Override log level (e.g. info, debug)
    #[arg(long)]
    log_level: Option<String>,
    /// Override the backend URL
    #[arg(long)]
    backend_url: Option<String>,
    /// Override the feed page size
    #[arg(long)]
    page_size: Option<usize>,
    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Enable tokio console for debugging
    #[arg(long)]
    debug_console: bool,
    /// Enable tracing spans instrumentation
    #[arg(long)]
    trace_spans: bool,
    /// Store the session in ~/.photojournal/session.json instead of the system keyring
    #[arg(long)]
    use_file_store: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with email and password
    SignIn {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Forget the stored session
    SignOut,
    /// Show the signed-in user
    Whoami,
    /// Print the cached gallery without contacting the backend
    Gallery,
    /// Reconcile the gallery with the backend
    Refresh,
    /// Transform a photo and add it to the gallery
    Transform {
        /// Image file to transform
        file: PathBuf,
        /// Style name passed to the transform service
        #[arg(long, default_value = "watercolor")]
        style: String,
        /// Optional prompt for the style
        #[arg(long)]
        prompt: Option<String>,
    },
    /// Delete a photo from the gallery by its storage path
    DeletePhoto { path: String },
    /// Show the feed
    Feed {
        /// Number of pages to load
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },
    /// Like or unlike a post
    Like { post_id: String },
    /// Show the comments on a post
    Comments { post_id: String },
    /// Comment on a post
    Comment { post_id: String, text: String },
    /// Publish a post
    Post {
        image_url: String,
        #[arg(long)]
        caption: Option<String>,
    },
    /// Delete one of your posts
    DeletePost { post_id: String },
    /// Show a user's profile
    Profile { user_id: String },
    /// Delete the cached gallery state
    ClearCache,
}

#[cfg_attr(feature = "trace-spans", tracing::instrument)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.use_file_store {
        std::env::set_var(auth::USE_FILE_STORE_ENV, "1");
    }

    let overrides = AppConfigOverrides {
        log_level: cli.log_level.clone(),
        backend_url: cli.backend_url.clone(),
        feed_page_size: cli.page_size,
        refresh_interval_minutes: None,
        debug_console: cli.debug_console,
        trace_spans: cli.trace_spans,
    };
    let cfg = AppConfig::load_from(cli.config.clone()).apply_overrides(&overrides);
    let _guard = init_logging(&cfg, "journal_cli.log")?;
    let db_path = cfg.db_path();

    match cli.command {
        Commands::Gallery => {
            if !db_path.exists() {
                println!("No cache found at {:?}", db_path);
                return Ok(());
            }
            let store = GalleryStateStore::new(Arc::new(SqliteBlobStore::new(&db_path)?));
            let state = store.load();
            if state.is_empty() {
                println!("No cached photos");
            }
            for (path, url) in state.iter() {
                println!("{}\t{}", path, url);
            }
        }
        Commands::ClearCache => {
            if !db_path.exists() {
                println!("No cache found at {:?}", db_path);
                return Ok(());
            }
            let store = SqliteBlobStore::new(&db_path)?;
            store.delete_blob(GALLERY_STATE_KEY)?;
            println!("Cache cleared");
        }
        command => run_online(cfg, command).await?,
    }
    Ok(())
}

async fn run_online(cfg: AppConfig, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    let page_size = cfg.feed_page_size;
    let ctx = AppContext::build(cfg)?;

    if let Commands::SignIn { email, password } = &command {
        let session = ctx.sign_in(email, password).await?;
        println!("Signed in as {}", session.email.unwrap_or(session.user_id));
        return Ok(());
    }

    let session = match ctx.restore_session().await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(error = %e, "Stored session unusable");
            None
        }
    };

    match command {
        Commands::SignOut => {
            ctx.sign_out()?;
            println!("Signed out");
        }
        Commands::Whoami => match session {
            Some(s) => println!("{} ({})", s.user_id, s.email.unwrap_or_default()),
            None => println!("Not signed in"),
        },
        Commands::Refresh => match ctx.reconciler.refresh_current().await {
            RefreshOutcome::Unchanged => println!("Gallery unchanged"),
            RefreshOutcome::Replaced { count } => println!("Gallery updated: {} photos", count),
            RefreshOutcome::Failed(reason) => println!("Refresh failed: {}", reason),
            RefreshOutcome::Unauthenticated => println!("Not signed in"),
        },
        Commands::Transform { file, style, prompt } => {
            let bytes = Bytes::from(tokio::fs::read(&file).await?);
            let job_id = format!("job-{}", Utc::now().timestamp_millis());
            let style = StyleParameters {
                style,
                prompt,
                strength: None,
            };
            if let Some(n) = ctx.tracker.notification() {
                println!("{}", n.message);
            }
            let record = ctx.pipeline.process(&job_id, bytes, &style).await?;
            if let Some(n) = ctx.tracker.notification() {
                println!("{}", n.message);
            }
            println!("Added {}", record.identity_path);
        }
        Commands::DeletePhoto { path } => {
            ctx.pipeline.delete_photo(&path).await?;
            println!("Deleted {}", path);
        }
        Commands::Feed { pages } => {
            ctx.feed.load_first_page(page_size).await?;
            for _ in 1..pages {
                if !ctx.feed.has_more() {
                    break;
                }
                ctx.feed.load_next_page(page_size).await?;
            }
            for post in ctx.feed.posts() {
                let author = post
                    .author
                    .as_ref()
                    .map(|a| a.username.as_str())
                    .unwrap_or("unknown");
                let liked = if post.is_liked { " (liked)" } else { "" };
                println!(
                    "{}\t{}\t{} likes{}\t{} comments\t{}",
                    post.id(),
                    author,
                    post.like_count,
                    liked,
                    post.comment_count,
                    post.post.caption.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Like { post_id } => {
            ctx.feed.load_first_page(page_size).await?;
            while ctx.feed.post(&post_id).is_none() && ctx.feed.has_more() {
                if ctx.feed.load_next_page(page_size).await? == 0 {
                    break;
                }
            }
            let liked = ctx.feed.toggle_like(&post_id).await?;
            println!("{} {}", if liked { "Liked" } else { "Unliked" }, post_id);
        }
        Commands::Comments { post_id } => {
            for c in ctx.feed.load_comments(&post_id).await? {
                let author = c.author.map(|a| a.username).unwrap_or(c.user_id);
                println!("{}\t{}: {}", c.created_at.to_rfc3339(), author, c.content);
            }
        }
        Commands::Comment { post_id, text } => {
            let comment = ctx.feed.add_comment(&post_id, &text).await?;
            println!("Comment added ({})", comment.id);
        }
        Commands::Post { image_url, caption } => {
            let post = ctx.feed.create_post(&image_url, caption.as_deref()).await?;
            println!("Post created ({})", post.id());
        }
        Commands::DeletePost { post_id } => {
            ctx.feed.delete_post(&post_id).await?;
            println!("Post deleted");
        }
        Commands::Profile { user_id } => {
            let profile = ctx.feed.load_profile(&user_id).await?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
        Commands::SignIn { .. } | Commands::Gallery | Commands::ClearCache => {}
    }
    Ok(())
}
