//! Demo schema deployment

use std::path::Path;

use anyhow::{Context, Result};

use crate::storage::SqliteStore;

/// Create the jobs/partitions schema in a SQLite database.
pub fn deploy(db: &Path) -> Result<()> {
    if let Some(parent) = db.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let store = SqliteStore::open(db).context("opening store")?;
    store.deploy_schema().context("deploying schema")?;
    println!("schema deployed at {}", db.display());
    Ok(())
}

/// Drop the jobs/partitions schema from a SQLite database.
pub fn remove(db: &Path) -> Result<()> {
    let store = SqliteStore::open(db).context("opening store")?;
    store.remove_schema().context("removing schema")?;
    println!("schema removed from {}", db.display());
    Ok(())
}
