//! Concurrent image acquisition and box cropping.

use crate::{
    common::*,
    fetch::{self, Fetcher},
    planner::{CropTask, ImageSource},
};
use bbox::{CropWindow, HW, TLBR};
use image::{codecs::jpeg::JpegEncoder, imageops};

/// The padding added to each side of a box, relative to its own extent.
pub const PAD_RATIO: f64 = 0.04;
pub const JPEG_QUALITY: u8 = 92;

/// A crop that was saved to the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CropResult {
    pub leaf: String,
    pub source_category: String,
    pub source: String,
    pub partition: String,
    pub image_id: i64,
    pub annotation_id: i64,
    pub crop_path: PathBuf,
}

/// Task outcome counts of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteStats {
    pub tasks: usize,
    pub saved: usize,
    pub fetch_failed: usize,
    pub decode_failed: usize,
    pub crop_failed: usize,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Fetch,
    Decode,
    Crop,
}

#[derive(Debug)]
struct TaskFailure {
    stage: Stage,
    error: Error,
}

trait StageContext<T> {
    fn stage(self, stage: Stage) -> Result<T, TaskFailure>;
}

impl<T, E> StageContext<T> for Result<T, E>
where
    E: Into<Error>,
{
    fn stage(self, stage: Stage) -> Result<T, TaskFailure> {
        self.map_err(|error| TaskFailure {
            stage,
            error: error.into(),
        })
    }
}

/// A bounded pool that turns crop tasks into crop files.
///
/// Source images are cached under `cache_dir` by image id and crops are saved
/// to `crops_dir/{leaf}/{source}_{image_id}_{annotation_id}.jpg`. A failing
/// task is logged and counted, and never affects the other tasks.
#[derive(Debug, Clone)]
pub struct FetchCropExecutor {
    fetcher: Fetcher,
    cache_dir: PathBuf,
    crops_dir: PathBuf,
    workers: NonZeroUsize,
    pad_ratio: f64,
    quality: u8,
}

impl FetchCropExecutor {
    pub fn new(
        fetcher: Fetcher,
        cache_dir: impl Into<PathBuf>,
        crops_dir: impl Into<PathBuf>,
        workers: NonZeroUsize,
    ) -> Self {
        Self {
            fetcher,
            cache_dir: cache_dir.into(),
            crops_dir: crops_dir.into(),
            workers,
            pad_ratio: PAD_RATIO,
            quality: JPEG_QUALITY,
        }
    }

    pub fn crops_dir(&self) -> &Path {
        &self.crops_dir
    }

    pub fn crop_path(&self, task: &CropTask) -> PathBuf {
        self.crops_dir.join(&task.leaf).join(task.crop_file_name())
    }

    /// Process every task. Results come in completion order.
    pub async fn execute(&self, tasks: Vec<CropTask>) -> (Vec<CropResult>, ExecuteStats) {
        let mut stats = ExecuteStats {
            tasks: tasks.len(),
            ..Default::default()
        };

        let outcomes: Vec<_> = stream::iter(tasks)
            .map(|task| async move {
                let outcome = self.run_task(&task).await;
                (task, outcome)
            })
            .buffer_unordered(self.workers.get())
            .collect()
            .await;

        let mut results = Vec::with_capacity(outcomes.len());
        for (task, outcome) in outcomes {
            match outcome {
                Ok(result) => {
                    stats.saved += 1;
                    results.push(result);
                }
                Err(TaskFailure { stage, error }) => {
                    match stage {
                        Stage::Fetch => stats.fetch_failed += 1,
                        Stage::Decode => stats.decode_failed += 1,
                        Stage::Crop => stats.crop_failed += 1,
                    }
                    warn!(
                        "drop task {} ({:?} failed): {:#}",
                        task.crop_file_name(),
                        stage,
                        error
                    );
                }
            }
        }

        info!(
            "saved {} of {} crops ({} fetch, {} decode, {} crop failures)",
            stats.saved, stats.tasks, stats.fetch_failed, stats.decode_failed, stats.crop_failed
        );

        (results, stats)
    }

    async fn run_task(&self, task: &CropTask) -> Result<CropResult, TaskFailure> {
        let data = self.acquire(task).await.stage(Stage::Fetch)?;

        let crop_path = self.crop_path(task);
        let bbox = task.bbox.clone();
        let image_size = task.image_size;
        let pad_ratio = self.pad_ratio;
        let quality = self.quality;
        {
            let crop_path = crop_path.clone();
            tokio::task::spawn_blocking(move || {
                crop_and_save(&data, &bbox, &image_size, pad_ratio, quality, &crop_path)
            })
            .await
            .stage(Stage::Crop)??;
        }

        Ok(CropResult {
            leaf: task.leaf.clone(),
            source_category: task.source_category.clone(),
            source: task.source.clone(),
            partition: task.partition.clone(),
            image_id: task.image_id,
            annotation_id: task.annotation_id,
            crop_path,
        })
    }

    /// Get the image bytes, from the cache when present.
    async fn acquire(&self, task: &CropTask) -> Result<Vec<u8>> {
        let cached = self.cache_dir.join(format!("{}.jpg", task.image_id));
        match tokio::fs::read(&cached).await {
            Ok(data) => return Ok(data),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let data = match &task.image {
            ImageSource::Url(url) => self.fetcher.fetch_bytes(url).await?,
            ImageSource::Local(path) => tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read '{}'", path.display()))?,
        };

        // cache misses are tolerated, the bytes are already in hand
        if let Err(err) = fetch::write_atomic(cached.clone(), data.clone()).await {
            debug!("failed to cache '{}': {:#}", cached.display(), err);
        }

        Ok(data)
    }
}

/// Decode, crop the padded box and save the crop as JPEG.
fn crop_and_save(
    data: &[u8],
    bbox: &TLBR<f64>,
    image_size: &HW<u32>,
    pad_ratio: f64,
    quality: u8,
    dest: &Path,
) -> Result<(), TaskFailure> {
    let image = image::load_from_memory(data).stage(Stage::Decode)?.to_rgb8();

    let window = CropWindow::padded(bbox, image_size, pad_ratio).stage(Stage::Crop)?;
    let [x, y, w, h] = window.xywh();
    let crop = imageops::crop_imm(&image, x, y, w, h).to_image();
    if crop.width() == 0 || crop.height() == 0 {
        return Err(format_err!(
            "crop window {:?} lies outside the {}x{} image",
            window,
            image.width(),
            image.height()
        ))
        .stage(Stage::Crop);
    }

    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(&crop)
        .stage(Stage::Crop)?;
    fetch::write_atomic_blocking(dest, &buf).stage(Stage::Crop)?;
    Ok(())
}
