//! HTTP retrieval and atomic file persistence.

use crate::common::*;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt as _;

/// Check whether the location is an HTTP(S) URL.
pub fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// A shared HTTP client without retries.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self { client })
    }

    /// Reuse a configured client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Fetch the whole response body into memory.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        ensure!(is_remote(url), "unsupported URL scheme in '{}'", url);

        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to request '{}'", url))?
            .error_for_status()?
            .bytes()
            .await
            .with_context(|| format!("failed to read response body of '{}'", url))?;
        Ok(bytes.to_vec())
    }

    /// Stream the response body to `dest`. The file appears only when the
    /// transfer completes.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        ensure!(is_remote(url), "unsupported URL scheme in '{}'", url);
        info!("downloading '{}'", url);

        let dir = parent_dir(dest);
        tokio::fs::create_dir_all(&dir).await?;
        let (file, temp_path) = NamedTempFile::new_in(&dir)?.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to request '{}'", url))?
            .error_for_status()?;

        let mut size = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        temp_path
            .persist(dest)
            .with_context(|| format!("failed to move download to '{}'", dest.display()))?;
        debug!("saved {} bytes to '{}'", size, dest.display());

        Ok(size)
    }
}

/// Write `data` to a sibling temporary file and rename it onto `dest`.
///
/// Concurrent writers of the same path each replace the whole file, so a
/// reader never observes a partial write.
pub fn write_atomic_blocking(dest: &Path, data: &[u8]) -> Result<()> {
    let dir = parent_dir(dest);
    fs::create_dir_all(&dir)?;

    let mut file = NamedTempFile::new_in(&dir)?;
    file.write_all(data)?;
    file.flush()?;
    file.persist(dest)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to persist '{}'", dest.display()))?;
    Ok(())
}

pub async fn write_atomic(dest: PathBuf, data: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || write_atomic_blocking(&dest, &data)).await?
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_owned(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_schemes() {
        assert!(is_remote("http://images.cocodataset.org/a.jpg"));
        assert!(is_remote("https://example.com/b.jpg"));
        assert!(!is_remote("batch_1/000001.jpg"));
        assert!(!is_remote("ftp://example.com/c.jpg"));
    }

    #[test]
    fn atomic_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("cache.bin");

        write_atomic_blocking(&dest, b"first").unwrap();
        write_atomic_blocking(&dest, b"second").unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"second");
        assert_eq!(fs::read_dir(dest.parent().unwrap()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn reject_local_paths() {
        let fetcher = Fetcher::new(Duration::from_secs(1)).unwrap();
        assert!(fetcher.fetch_bytes("/tmp/image.jpg").await.is_err());
    }
}
