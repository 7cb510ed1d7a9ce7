mod settings;

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use save_cloud_sync_cloud::{client, CloudProvider, Credentials, OperationStatus, ProgressUpdate, SyncService};
use save_cloud_sync_core::{
    filter_saves, AlwaysGranted, DirectBackend, LocalStorageService, PrivilegedServiceBackend, SaveInfo,
    SaveListing, Storage,
};

use settings::AppSettings;

/// Keeps saves in sync with a cloud drive.
#[derive(Debug, Parser)]
#[command(name = "save-cloud-sync", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Command {
    /// List local saves
    Local { query: Option<String> },
    /// List saves in the cloud
    Cloud { query: Option<String> },
    /// List cloud backups
    Backups,
    /// Upload a local save
    Upload {
        save: String,
        /// Overwrite a cloud copy that has been played longer
        #[arg(long)]
        force: bool,
    },
    /// Replace a local save with the cloud copy
    Restore {
        save: String,
        /// Overwrite a local copy that has been played longer
        #[arg(long)]
        force: bool,
    },
    /// Replace a local save with a backup
    RestoreBackup { backup: String },
    /// Back up the cloud copy of a save
    Backup { save: String },
    /// Delete a save from the cloud
    Delete { save: String },
    /// Delete a backup
    DeleteBackup { backup: String },
    /// Delete old backups
    Purge,
    /// Store the credentials of a provider and make it the active one
    SignIn {
        provider: ProviderArg,
        client_id: String,
        refresh_token: String,
        client_secret: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProviderArg {
    Dropbox,
    GoogleDrive,
}

impl From<ProviderArg> for CloudProvider {
    fn from(provider: ProviderArg) -> Self {
        match provider {
            ProviderArg::Dropbox => CloudProvider::Dropbox,
            ProviderArg::GoogleDrive => CloudProvider::GoogleDrive,
        }
    }
}

fn storage(settings: &AppSettings) -> Arc<Storage> {
    let privileged = PrivilegedServiceBackend::new(Arc::new(LocalStorageService::default()), Arc::new(AlwaysGranted));
    Arc::new(
        Storage::for_platform(&settings.platform(), Arc::new(DirectBackend::unrestricted()))
            .with_privileged_service(Arc::new(privileged)),
    )
}

fn print_saves(listing: &SaveListing, query: &str) {
    let saves: Vec<&SaveInfo> = filter_saves(&listing.saves, query);
    for save in &saves {
        println!(
            "{:<32} {:<20} {:<20} day {}",
            save.folder_name, save.farm_name, save.farmer_name, save.days_played
        );
    }
    if saves.is_empty() {
        println!("No saves found.");
    }
    if listing.load_failed {
        println!("Some saves could not be read.");
    }
}

fn log_progress(mut rx: mpsc::UnboundedReceiver<ProgressUpdate>) {
    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            match update.status {
                OperationStatus::Failed => debug!(
                    "{:?} {} failed: {}",
                    update.operation_type,
                    update.target,
                    update.error.unwrap_or_default()
                ),
                status => info!("{:?} {}: {status:?}", update.operation_type, update.target),
            }
        }
    });
}

async fn run(command: Command, mut settings: AppSettings) -> Result<()> {
    if let Command::SignIn {
        provider,
        client_id,
        refresh_token,
        client_secret,
    } = command
    {
        let provider = CloudProvider::from(provider);
        settings.provider = provider;
        *settings.credentials_mut() = Credentials {
            client_id,
            client_secret,
            refresh_token,
        };
        settings.save()?;
        println!("Signed in to {}.", provider.display_name());
        return Ok(());
    }

    let mode = settings.storage_mode()?;
    let storage = storage(&settings);
    let cloud = client(settings.provider, settings.credentials(), storage.clone())?;
    let (tx, rx) = mpsc::unbounded_channel();
    log_progress(rx);

    let service = SyncService::new(Arc::from(cloud), storage, mode, settings.saves_path())
        .with_options(settings.sync_options())
        .with_progress_channel(tx);
    debug!("Using {mode:?} storage at {}", service.saves_path());

    // Old backups are trimmed once per run, like at app start. Uploads purge
    // after their own backup.
    if !matches!(command, Command::Local { .. } | Command::Upload { .. } | Command::Purge) {
        if let Err(e) = service.purge_backups().await {
            warn!("Failed to purge old backups: {e}");
        }
    }

    match command {
        Command::Local { query } => {
            service.ensure_permission().await?;
            print_saves(&service.local_saves().await?, query.as_deref().unwrap_or_default());
        }
        Command::Cloud { query } => {
            print_saves(&service.cloud_saves().await?, query.as_deref().unwrap_or_default())
        }
        Command::Backups => {
            let backups = service.backups().await?;
            for backup in &backups {
                println!("{:<48} {}", backup.cloud_folder_name, backup.date.to_rfc2822());
            }
            if backups.is_empty() {
                println!("No backups found.");
            }
        }
        Command::Upload { save, force } => {
            service.ensure_permission().await?;
            if let Some(conflict) = service.upload_conflict(&save).await? {
                if !force {
                    bail!(
                        "The cloud copy of {} has {} days played, the local one {}. Use --force to overwrite.",
                        conflict.folder_name,
                        conflict.existing_days_played,
                        conflict.days_played
                    );
                }
            }
            service.upload_save(&save).await?;
            println!("Uploaded {save}.");
        }
        Command::Restore { save, force } => {
            service.ensure_permission().await?;
            if let Some(conflict) = service.download_conflict(&save).await? {
                if !force {
                    bail!(
                        "The local copy of {} has {} days played, the cloud one {}. Use --force to overwrite.",
                        conflict.folder_name,
                        conflict.existing_days_played,
                        conflict.days_played
                    );
                }
            }
            service.restore_save(&save).await?;
            println!("Restored {save}.");
        }
        Command::RestoreBackup { backup } => {
            service.ensure_permission().await?;
            let backups = service.backups().await?;
            let Some(found) = backups.iter().find(|b| b.cloud_folder_name == backup) else {
                bail!("The backup \"{backup}\" doesn't exist.");
            };
            service.restore_backup(found).await?;
            println!("Restored {} from {backup}.", found.folder_name);
        }
        Command::Backup { save } => {
            service.backup_save(&save).await?;
            println!("Backed up {save}.");
        }
        Command::Delete { save } => {
            service.delete_cloud_save(&save).await?;
            println!("Deleted {save}.");
        }
        Command::DeleteBackup { backup } => {
            service.delete_backup(&backup).await?;
            println!("Deleted {backup}.");
        }
        Command::Purge => {
            service.purge_backups().await?;
            println!("Old backups purged.");
        }
        Command::SignIn { .. } => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init();

    let cli = Cli::parse();
    let settings = AppSettings::load()?;
    run(cli.command, settings).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<Command, clap::Error> {
        Cli::try_parse_from(std::iter::once("save-cloud-sync").chain(line.split_whitespace()))
            .map(|cli| cli.command)
    }

    #[test]
    fn test_parse_transfers() {
        assert_eq!(
            parse("upload Farm_1 --force").unwrap(),
            Command::Upload { save: "Farm_1".into(), force: true }
        );
        assert_eq!(
            parse("restore Farm_1").unwrap(),
            Command::Restore { save: "Farm_1".into(), force: false }
        );
        assert_eq!(
            parse("restore-backup Farm_1_[2024-05-01T01.00.00+0000]").unwrap(),
            Command::RestoreBackup { backup: "Farm_1_[2024-05-01T01.00.00+0000]".into() }
        );
        assert!(parse("upload").is_err());
    }

    #[test]
    fn test_parse_listing() {
        assert_eq!(parse("local").unwrap(), Command::Local { query: None });
        assert_eq!(parse("cloud sunny").unwrap(), Command::Cloud { query: Some("sunny".into()) });
        assert!(parse("").is_err());
        assert!(parse("frobnicate").is_err());
    }

    #[test]
    fn test_parse_sign_in() {
        assert_eq!(
            parse("sign-in google-drive app refresh secret").unwrap(),
            Command::SignIn {
                provider: ProviderArg::GoogleDrive,
                client_id: "app".into(),
                refresh_token: "refresh".into(),
                client_secret: Some("secret".into()),
            }
        );
        assert!(parse("sign-in onedrive app refresh").is_err());
        assert!(parse("sign-in dropbox app").is_err());
        assert_eq!(CloudProvider::from(ProviderArg::Dropbox), CloudProvider::Dropbox);
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
