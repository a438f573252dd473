use crate::output::Output;
use chrono::Utc;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use std::fs;
use watchmatch_config::PathManager;
use watchmatch_core::Store;

#[derive(Debug, Default, Clone, Copy)]
pub struct ClearOptions {
    pub all: bool,
    pub data: bool,
    pub metadata: bool,
    pub exports: bool,
    pub credentials: bool,
}

pub async fn run_clear(options: ClearOptions, output: &Output) -> Result<()> {
    clear_with_paths(&PathManager::default(), options, output)
}

fn clear_with_paths(paths: &PathManager, options: ClearOptions, output: &Output) -> Result<()> {
    let ClearOptions {
        all,
        data,
        metadata,
        exports,
        credentials,
    } = options;

    if !(all || data || metadata || exports || credentials) {
        output.warn("No clear option specified. Use --data, --metadata, --exports, --credentials, or --all");
        output.println("\nExample: watchmatch clear --metadata");
        return Ok(());
    }

    // --all wipes the store outright, which also drops cached metadata
    if all || data {
        clear_data(paths, output)?;
    } else if metadata {
        purge_metadata(paths, output)?;
    }
    if all || exports {
        clear_exports(paths, output)?;
    }
    if all || credentials {
        clear_credentials(paths, output)?;
    }

    if all {
        output.success("All data, exports and credentials cleared");
    }
    Ok(())
}

fn open_existing_store(paths: &PathManager, output: &Output) -> Result<Option<Store>> {
    let database = paths.database_file();
    if !database.exists() {
        output.info("No database found to clear");
        return Ok(None);
    }
    let store = Store::open(&database).wrap_err_with(|| format!("Failed to open {}", database.display()))?;
    Ok(Some(store))
}

fn clear_data(paths: &PathManager, output: &Output) -> Result<()> {
    if let Some(store) = open_existing_store(paths, output)? {
        store.clear().wrap_err("Failed to clear the database")?;
        output.success(format!(
            "Cleared friends, watchlists, metadata and sync history: {}",
            paths.database_file().display()
        ));
    }
    Ok(())
}

fn purge_metadata(paths: &PathManager, output: &Output) -> Result<()> {
    if let Some(store) = open_existing_store(paths, output)? {
        let purged = store
            .purge_expired_metadata(Utc::now())
            .wrap_err("Failed to purge expired metadata")?;
        output.success(format!("Purged {} expired metadata entries", purged));
    }
    Ok(())
}

fn clear_exports(paths: &PathManager, output: &Output) -> Result<()> {
    let export_dir = paths.export_dir();
    if export_dir.exists() {
        fs::remove_dir_all(&export_dir)
            .map_err(|e| eyre!("Failed to remove exports at {}: {}", export_dir.display(), e))?;
        output.success(format!("Cleared exports: {}", export_dir.display()));
    } else {
        output.info("No exports found to clear");
    }
    Ok(())
}

fn clear_credentials(paths: &PathManager, output: &Output) -> Result<()> {
    let credentials_file = paths.credentials_file();
    if credentials_file.exists() {
        fs::remove_file(&credentials_file)
            .map_err(|e| eyre!("Failed to remove credentials file at {}: {}", credentials_file.display(), e))?;
        output.success(format!("Cleared credentials: {}", credentials_file.display()));
    } else {
        output.info("No credentials file found to clear");
    }
    Ok(())
}
