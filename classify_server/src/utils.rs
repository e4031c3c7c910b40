//! Utility functions
//!
use std::{fs::File, io::Cursor, path::Path};

use anyhow::{bail, Context, Result};
use reqwest::Client;

/// Download a file from a URL to a given filepath.
///
/// The content is written next to `filepath` first and moved in place once complete.
pub async fn download_file(client: &Client, url: &str, filepath: impl AsRef<Path>) -> Result<()> {
    let filepath = filepath.as_ref();
    log::info!("Downloading {} to {}", url, filepath.display());

    let resp = client.get(url).send().await?.error_for_status()?;

    let partial = filepath.with_extension("part");
    let mut file = File::create(&partial)
        .with_context(|| format!("failed to create {}", partial.display()))?;
    let mut content = Cursor::new(resp.bytes().await?);
    std::io::copy(&mut content, &mut file)?;
    std::fs::rename(&partial, filepath)?;

    Ok(())
}

/// Make sure `filepath` exists, downloading it from `url` if needed.
pub async fn ensure_file(filepath: &Path, url: Option<&str>) -> Result<()> {
    if filepath.exists() {
        return Ok(());
    }

    let Some(url) = url else {
        bail!(
            "{} not found and there is no download source for it",
            filepath.display()
        );
    };

    if let Some(dir) = filepath.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    download_file(&Client::new(), url, filepath).await
}
