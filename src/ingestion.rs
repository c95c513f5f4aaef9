use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter},
    time::Duration,
};

use anyhow::{Context, Result};

use crate::{
    common::{create_directories, get_size},
    entity::DataIngestionConfig,
};

/// Downloads the dataset archive and unpacks it into the artifacts tree.
pub struct DataIngestion {
    config: DataIngestionConfig,
}

impl DataIngestion {
    pub fn new(config: DataIngestionConfig) -> Self {
        Self { config }
    }

    /// Fetch `source_url` unless the archive is already on disk.
    pub fn download_file(&self) -> Result<()> {
        let target = &self.config.local_data_file;
        if target.exists() {
            tracing::info!(
                "File already exists of size: {}",
                get_size(target).with_context(|| format!("stat {}", target.display()))?
            );
            return Ok(());
        }

        if let Some(parent) = target.parent() {
            create_directories(&[parent])?;
        }

        tracing::info!(
            "Downloading data from {} into file {}",
            self.config.source_url,
            target.display()
        );

        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(None::<Duration>)
            .build()
            .context("building HTTP client")?;

        let mut response = client
            .get(&self.config.source_url)
            .send()
            .with_context(|| format!("requesting {}", self.config.source_url))?
            .error_for_status()
            .with_context(|| format!("downloading {}", self.config.source_url))?;

        // the archive path only ever holds a complete download
        let partial = target.with_extension("part");
        {
            let mut writer = BufWriter::new(
                File::create(&partial).with_context(|| format!("creating {}", partial.display()))?,
            );
            io::copy(&mut response, &mut writer)
                .with_context(|| format!("writing {}", partial.display()))?;
        }
        fs::rename(&partial, target)
            .with_context(|| format!("moving download to {}", target.display()))?;

        tracing::info!(
            "Downloaded data from {} into file {} ({})",
            self.config.source_url,
            target.display(),
            get_size(target)?
        );
        Ok(())
    }

    /// Unpack the archive into `unzip_dir`.
    pub fn extract_zip_file(&self) -> Result<()> {
        let unzip_dir = &self.config.unzip_dir;
        create_directories(&[unzip_dir])?;

        let archive_path = &self.config.local_data_file;
        let file = File::open(archive_path)
            .with_context(|| format!("opening {}", archive_path.display()))?;
        let mut archive = zip::ZipArchive::new(BufReader::new(file))
            .with_context(|| format!("reading zip archive {}", archive_path.display()))?;

        let entries = archive.len();
        archive
            .extract(unzip_dir)
            .with_context(|| format!("extracting into {}", unzip_dir.display()))?;

        tracing::info!(
            "Extracted {} entries from {} into {}",
            entries,
            archive_path.display(),
            unzip_dir.display()
        );
        Ok(())
    }
}
