//! Turns annotation records into capped, shuffled per-class crop tasks.

use crate::{
    annotation::{AnnotationDocument, AnnotationEntry, ImageEntry},
    common::*,
    config::FilterConfig,
    fetch,
    mapper::CategoryMapper,
    taxonomy::TaxonomyIndex,
};
use bbox::{prelude::*, HW, TLBR};

/// Where the pixels of a source image come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageSource {
    Url(String),
    Local(PathBuf),
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// One box to fetch, crop and save.
#[derive(Debug, Clone, PartialEq)]
pub struct CropTask {
    pub source: String,
    /// The partition the record came from.
    pub partition: String,
    pub image_id: i64,
    pub annotation_id: i64,
    pub image: ImageSource,
    /// The annotated box in source image pixels.
    pub bbox: TLBR<f64>,
    /// The image size declared by the annotation document.
    pub image_size: HW<u32>,
    pub leaf: String,
    pub source_category: String,
}

impl CropTask {
    /// The crop file name, unique per (source, image, annotation).
    pub fn crop_file_name(&self) -> String {
        format!("{}_{}_{}.jpg", self.source, self.image_id, self.annotation_id)
    }
}

/// Record counts by planning outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStats {
    pub records: usize,
    pub crowd: usize,
    pub unmapped: usize,
    pub malformed: usize,
    pub too_small: usize,
    pub bad_image: usize,
    pub no_source: usize,
    pub accepted: usize,
    pub selected: usize,
}

impl PlanStats {
    fn absorb(&mut self, other: &PlanStats) {
        self.records += other.records;
        self.crowd += other.crowd;
        self.unmapped += other.unmapped;
        self.malformed += other.malformed;
        self.too_small += other.too_small;
        self.bad_image += other.bad_image;
        self.no_source += other.no_source;
        self.accepted += other.accepted;
    }
}

/// Selected tasks grouped by taxonomy leaf, with keys in lexicographic order.
#[derive(Debug, Clone, Default)]
pub struct TaskPlan {
    pub buckets: IndexMap<String, Vec<CropTask>>,
    pub stats: PlanStats,
}

impl TaskPlan {
    pub fn is_empty(&self) -> bool {
        self.num_tasks() == 0
    }

    pub fn num_tasks(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn class_counts(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.buckets
            .iter()
            .map(|(leaf, tasks)| (leaf.as_str(), tasks.len()))
    }

    pub fn into_tasks(self) -> Vec<CropTask> {
        self.buckets.into_values().flatten().collect()
    }

    /// Shuffle every bucket and keep at most `cap` tasks of each.
    fn sample(&mut self, cap: usize, rng: &mut StdRng) {
        self.buckets.sort_keys();
        self.buckets
            .values_mut()
            .for_each(|tasks| tasks.shuffle(rng));
        self.truncate(cap);
    }

    /// Keep the first `cap` tasks of every bucket.
    fn truncate(&mut self, cap: usize) {
        self.buckets
            .values_mut()
            .for_each(|tasks| tasks.truncate(cap));
        self.stats.selected = self.num_tasks();
    }
}

enum Verdict {
    Accept(CropTask),
    Crowd,
    Unmapped,
    Malformed,
    TooSmall,
    BadImage,
    NoSource,
}

/// Applies mapping and geometric filters to one source's records.
#[derive(Debug, Clone)]
pub struct CropTaskPlanner<'a> {
    source: &'a str,
    taxonomy: &'a TaxonomyIndex,
    mapper: &'a CategoryMapper,
    filter: &'a FilterConfig,
    images_root: Option<&'a Path>,
}

impl<'a> CropTaskPlanner<'a> {
    pub fn new(
        source: &'a str,
        taxonomy: &'a TaxonomyIndex,
        mapper: &'a CategoryMapper,
        filter: &'a FilterConfig,
        images_root: Option<&'a Path>,
    ) -> Self {
        Self {
            source,
            taxonomy,
            mapper,
            filter,
            images_root,
        }
    }

    /// Plan all partitions of the source with one random stream.
    ///
    /// Each partition is sampled with its own cap. When there is more than one
    /// partition the buckets are concatenated in partition order and sampled
    /// again with `source_cap`.
    pub fn plan<'d, I>(&self, partitions: I, source_cap: usize, seed: u64) -> TaskPlan
    where
        I: IntoIterator<Item = (&'d str, &'d AnnotationDocument, usize)>,
    {
        let mut rng = StdRng::seed_from_u64(seed);
        let plans: Vec<_> = partitions
            .into_iter()
            .map(|(partition, doc, cap)| self.plan_partition(doc, partition, cap, &mut rng))
            .collect();
        Self::merge(plans, source_cap, &mut rng)
    }

    /// Scan one annotation document.
    pub fn plan_partition(
        &self,
        doc: &AnnotationDocument,
        partition: &str,
        cap: usize,
        rng: &mut StdRng,
    ) -> TaskPlan {
        let categories = doc.category_names();
        let images = doc.images_by_id();

        let mut plan = TaskPlan::default();
        for record in &doc.annotations {
            plan.stats.records += 1;

            let category = categories
                .get(&record.category_id)
                .copied()
                .unwrap_or_default();
            let image = images.get(&record.image_id).copied();

            match self.judge(record, category, image, partition) {
                Verdict::Accept(task) => {
                    plan.stats.accepted += 1;
                    plan.buckets
                        .entry(task.leaf.clone())
                        .or_insert_with(Vec::new)
                        .push(task);
                }
                Verdict::Crowd => plan.stats.crowd += 1,
                Verdict::Unmapped => plan.stats.unmapped += 1,
                Verdict::Malformed => plan.stats.malformed += 1,
                Verdict::TooSmall => plan.stats.too_small += 1,
                Verdict::BadImage => plan.stats.bad_image += 1,
                Verdict::NoSource => plan.stats.no_source += 1,
            }
        }

        plan.sample(cap, rng);

        info!(
            "{}/{}: {} records, {} accepted, {} selected",
            self.source, partition, plan.stats.records, plan.stats.accepted, plan.stats.selected
        );
        debug!("{}/{}: {:?}", self.source, partition, plan.stats);
        if plan.is_empty() {
            warn!("{}/{}: no usable tasks after mapping and filtering", self.source, partition);
        }

        plan
    }

    /// Merge partition plans and cap the merged buckets.
    pub fn merge(plans: Vec<TaskPlan>, cap: usize, rng: &mut StdRng) -> TaskPlan {
        // a lone partition is already shuffled, only the source cap applies
        if plans.len() == 1 {
            let mut plan = plans.into_iter().next().unwrap_or_default();
            plan.truncate(cap);
            return plan;
        }

        let mut merged = TaskPlan::default();
        for plan in plans {
            merged.stats.absorb(&plan.stats);
            for (leaf, tasks) in plan.buckets {
                merged
                    .buckets
                    .entry(leaf)
                    .or_insert_with(Vec::new)
                    .extend(tasks);
            }
        }
        merged.sample(cap, rng);
        merged
    }

    fn judge(
        &self,
        record: &AnnotationEntry,
        category: &str,
        image: Option<&ImageEntry>,
        partition: &str,
    ) -> Verdict {
        if record.is_crowd() {
            return Verdict::Crowd;
        }
        let image = match image {
            Some(image) => image,
            None => return Verdict::BadImage,
        };
        let leaf = match self.mapper.map(category, self.taxonomy) {
            Some(leaf) => leaf,
            None => return Verdict::Unmapped,
        };

        let xywh: [f64; 4] = match record.bbox.as_slice().try_into() {
            Ok(xywh) => xywh,
            Err(_) => return Verdict::Malformed,
        };
        if !xywh.iter().all(|value| value.is_finite()) {
            return Verdict::Malformed;
        }
        let [_, _, w, h] = xywh;
        let min_size = self.filter.min_box_size.raw();
        if w < min_size || h < min_size {
            return Verdict::TooSmall;
        }
        let bbox = match TLBR::try_from_xywh(xywh) {
            Ok(bbox) => bbox,
            Err(_) => return Verdict::Malformed,
        };

        let image_size = match (u32::try_from(image.height), u32::try_from(image.width)) {
            (Ok(h), Ok(w)) => match HW::try_from_hw([h, w]) {
                Ok(size) if size.is_positive() => size,
                _ => return Verdict::BadImage,
            },
            _ => return Verdict::BadImage,
        };
        let image_area = image_size.h() as f64 * image_size.w() as f64;
        if w * h / image_area < self.filter.min_box_area_ratio.raw() {
            return Verdict::TooSmall;
        }

        let source = match self.image_source(image) {
            Some(source) => source,
            None => return Verdict::NoSource,
        };

        Verdict::Accept(CropTask {
            source: self.source.to_owned(),
            partition: partition.to_owned(),
            image_id: record.image_id,
            annotation_id: record.id,
            image: source,
            bbox,
            image_size,
            leaf: leaf.to_owned(),
            source_category: category.to_owned(),
        })
    }

    /// Prefer remote URLs, then fall back to the local image root.
    fn image_source(&self, image: &ImageEntry) -> Option<ImageSource> {
        let remote = [image.coco_url.as_deref(), image.flickr_url.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|url| fetch::is_remote(url));
        if let Some(url) = remote {
            return Some(ImageSource::Url(url.to_owned()));
        }

        let file_name = image.file_name.trim();
        if fetch::is_remote(file_name) {
            return Some(ImageSource::Url(file_name.to_owned()));
        }
        match self.images_root {
            Some(root) if !file_name.is_empty() => Some(ImageSource::Local(root.join(file_name))),
            _ => None,
        }
    }
}
