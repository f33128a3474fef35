//! Background client: keeps the gallery reconciled and the image cache warm
//! until interrupted.

use photojournal::config::AppConfig;
use photojournal::{init_logging, AppContext};
use std::sync::Arc;
use sync::RefreshOutcome;
use tokio::sync::mpsc;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = AppConfig::load_from(None);
    let _guard = init_logging(&cfg, "photojournal.log")?;
    tracing::info!(backend = %cfg.backend_url, "Starting photo journal client");

    let interval = Duration::from_secs(cfg.refresh_interval_minutes.max(1) * 60);
    let ctx = Arc::new(AppContext::build(cfg)?);
    match ctx.restore_session().await {
        Ok(Some(session)) => tracing::info!(user_id = %session.user_id, "Session restored"),
        Ok(None) => {
            println!("Not signed in. Run `journal_cli sign-in` first.");
            return Ok(());
        }
        Err(e) => {
            eprintln!("Could not restore the session: {}", e);
            return Ok(());
        }
    }
    println!("Cached photos: {}", ctx.reconciler.gallery().len());

    let mut notifications = ctx.tracker.subscribe();
    tokio::spawn(async move {
        while notifications.changed().await.is_ok() {
            if let Some(n) = notifications.borrow_and_update().clone() {
                println!("{}", n.message);
            }
        }
    });

    let (token_handle, token_shutdown) =
        ctx.start_token_refresh(auth::DEFAULT_TOKEN_REFRESH_INTERVAL, None);

    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let (handle, shutdown) = ctx
        .reconciler
        .clone()
        .start_periodic_refresh(interval, Some(outcome_tx));

    let warm_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        while let Some(outcome) = outcome_rx.recv().await {
            if let RefreshOutcome::Replaced { count } = outcome {
                println!("Gallery updated: {} photos", count);
                let items: Vec<(String, String)> = warm_ctx
                    .reconciler
                    .images()
                    .into_iter()
                    .map(|img| (img.identity_path, img.access_url))
                    .collect();
                warm_ctx.loader.preload(&items).await;
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    let _ = shutdown.send(());
    let _ = token_shutdown.send(());
    let _ = handle.await;
    let _ = token_handle.await;
    Ok(())
}
