use std::process;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};

use whalewatch::classifier::ClipDetector;
use whalewatch::config::{self, WatchConfig};
use whalewatch::credentials;
use whalewatch::drive::DriveClient;
use whalewatch::logging;
use whalewatch::telegram::TelegramNotifier;
use whalewatch::watcher::{WatchSettings, Watcher};

fn main() {
    let dotenv = config::load_dotenv();
    logging::init();
    match dotenv {
        Ok(Some(path)) => debug!("Loaded environment from {}", path.display()),
        Ok(None) => {}
        Err(err) => warn!("Ignoring unreadable .env file: {err}"),
    }

    if let Err(err) = run() {
        error!("Fatal: {err:#}");
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = WatchConfig::from_env()?;

    let auth = credentials::authorize(&config.token_file, &config.credentials_file)
        .context("Google authorization failed")?;
    let drive = DriveClient::new(auth)?;
    let detector = ClipDetector::load().context("Failed to load CLIP model")?;
    let notifier = TelegramNotifier::new(
        &config.telegram_api_url,
        &config.telegram_token,
        config.telegram_chat_id.clone(),
    )?;

    let settings = WatchSettings {
        folder_id: config.folder_id.clone(),
        save_dir: config.save_dir.clone(),
        temp_dir: config.temp_dir.clone(),
        alert_text: config.alert_text.clone(),
    };
    let mut watcher = Watcher::new(
        settings,
        Box::new(drive),
        Box::new(detector),
        Box::new(notifier),
    )
    .with_context(|| format!("Failed to prepare {}", config.save_dir.display()))?;

    info!("Saving whales to {}", config.save_dir.display());
    watcher.run(config.check_interval)
}
