//! COCO-style annotation documents and their acquisition.

use crate::{
    common::*,
    config::AnnotationLocation,
    fetch::{self, Fetcher},
};
use tempfile::NamedTempFile;

/// A detection annotation document with `categories`, `images` and
/// `annotations` arrays. Missing arrays read as empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnnotationDocument {
    #[serde(default)]
    pub categories: Vec<CategoryEntry>,
    #[serde(default)]
    pub images: Vec<ImageEntry>,
    #[serde(default)]
    pub annotations: Vec<AnnotationEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryEntry {
    #[serde(default = "missing_id")]
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEntry {
    #[serde(default = "missing_id")]
    pub id: i64,
    #[serde(default)]
    pub width: i64,
    #[serde(default)]
    pub height: i64,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub coco_url: Option<String>,
    #[serde(default)]
    pub flickr_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationEntry {
    #[serde(default = "missing_id")]
    pub id: i64,
    #[serde(default = "missing_id")]
    pub image_id: i64,
    #[serde(default = "missing_id")]
    pub category_id: i64,
    /// `[x, y, w, h]` in image pixels.
    #[serde(default)]
    pub bbox: Vec<f64>,
    #[serde(default)]
    pub iscrowd: i64,
}

fn missing_id() -> i64 {
    -1
}

impl AnnotationEntry {
    pub fn is_crowd(&self) -> bool {
        self.iscrowd == 1
    }
}

impl AnnotationDocument {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let reader = io::BufReader::new(
            fs::File::open(path)
                .with_context(|| format!("failed to open '{}'", path.display()))?,
        );
        let doc = serde_json::from_reader(reader)
            .with_context(|| format!("failed to parse annotations '{}'", path.display()))?;
        Ok(doc)
    }

    pub async fn open_async(path: PathBuf) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::open(path)).await?
    }

    /// Category names keyed by id, with surrounding whitespace removed.
    pub fn category_names(&self) -> HashMap<i64, &str> {
        self.categories
            .iter()
            .map(|category| (category.id, category.name.trim()))
            .collect()
    }

    pub fn images_by_id(&self) -> HashMap<i64, &ImageEntry> {
        self.images.iter().map(|image| (image.id, image)).collect()
    }
}

/// Locate the annotation document of a partition, downloading it when needed.
///
/// Returns `None` when the document cannot be obtained. An explicit `path`
/// is authoritative: when it is missing, the URLs are not tried.
pub async fn resolve(
    location: &AnnotationLocation,
    fetcher: &Fetcher,
    cache_dir: &Path,
    partition: &str,
) -> Result<Option<PathBuf>> {
    if let Some(path) = &location.path {
        if path.is_file() {
            return Ok(Some(path.clone()));
        }
        warn!("annotation file '{}' does not exist", path.display());
        return Ok(None);
    }

    let target = cache_dir.join(format!("{}.json", partition));
    if target.is_file() {
        debug!("reuse downloaded annotations '{}'", target.display());
        return Ok(Some(target));
    }

    for url in &location.urls {
        let result = match &location.archive_member {
            Some(member) => {
                // partitions shipped in the same archive share one download
                let archive = cache_dir.join(archive_name(url, partition));
                let downloaded = if archive.is_file() {
                    Ok(())
                } else {
                    fetcher.download(url, &archive).await.map(|_| ())
                };
                match downloaded {
                    Ok(()) => extract_member(archive, member.clone(), target.clone()).await,
                    Err(err) => Err(err),
                }
            }
            None => fetcher.download(url, &target).await.map(|_| ()),
        };

        match result {
            Ok(()) => return Ok(Some(target)),
            Err(err) => warn!("failed to obtain annotations from '{}': {:#}", url, err),
        }
    }

    Ok(None)
}

/// The last URL path segment, or a name derived from the partition.
fn archive_name(url: &str, partition: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);
    match path
        .split_once('/')
        .and_then(|(_, path)| path.rsplit('/').next())
    {
        Some(name) if !name.is_empty() => name.to_owned(),
        _ => format!("{}.zip", partition),
    }
}

/// Extract one member of a zip archive to `dest`.
async fn extract_member(archive: PathBuf, member: String, dest: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = fs::File::open(&archive)?;
        let mut zip = zip::ZipArchive::new(io::BufReader::new(file))
            .with_context(|| format!("'{}' is not a zip archive", archive.display()))?;
        let mut entry = zip
            .by_name(&member)
            .with_context(|| format!("member '{}' is not found in the archive", member))?;

        let dir = dest.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir)?;
        io::copy(&mut entry, &mut temp)?;
        temp.persist(&dest).map_err(|err| err.error)?;
        Ok(())
    })
    .await?
}

/// Write a document to `path`.
pub fn save(doc: &AnnotationDocument, path: &Path) -> Result<()> {
    let text = serde_json::to_vec(doc)?;
    fetch::write_atomic_blocking(path, &text)
}
