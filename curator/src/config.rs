//! Dataset build configuration format.

use crate::{
    common::*,
    mapper::{CategoryMapper, KeywordRule},
    split::SplitRatios,
};

pub use filter::*;
pub use source::*;

/// The main build configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The target taxonomy document.
    pub taxonomy_file: PathBuf,
    /// The dataset root receiving `train`, `val` and `test` folders.
    pub output_dir: PathBuf,
    /// Scratch space for annotation downloads, image cache and temporary crops.
    pub work_dir: PathBuf,
    pub seed: u64,
    /// The fetch-and-crop pool width. It defaults to the number of CPUs.
    #[serde(default)]
    pub workers: Option<NonZeroUsize>,
    /// Classes with fewer merged images than this are dropped.
    pub min_images_per_class: NonZeroUsize,
    pub split: SplitConfig,
    pub filter: FilterConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    pub sources: Vec<SourceConfig>,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = fs::read_to_string(path)?;
        let config: Self = json5::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.split.ratios()?;
        self.filter.validate()?;
        ensure!(self.fetch.timeout_secs > 0, "fetch.timeout_secs must be positive");

        let mut names = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            ensure!(
                names.insert(source.name.as_str()),
                "duplicated source name '{}'",
                source.name
            );
        }

        Ok(())
    }

    pub fn workers(&self) -> NonZeroUsize {
        self.workers
            .or_else(|| NonZeroUsize::new(num_cpus::get()))
            .unwrap_or(NonZeroUsize::MIN)
    }

    /// The directory holding scratch files of a source.
    pub fn source_work_dir(&self, source: &SourceConfig) -> PathBuf {
        self.work_dir.join(&source.name)
    }
}

/// Target split proportions. The test share is the remainder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    pub train_ratio: R64,
    pub val_ratio: R64,
}

impl SplitConfig {
    pub fn ratios(&self) -> Result<SplitRatios> {
        SplitRatios::new(self.train_ratio.raw(), self.val_ratio.raw())
    }
}

/// Network fetch options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub timeout_secs: u64,
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { timeout_secs: 45 }
    }
}

mod filter {
    use super::*;

    /// Geometric filters applied to every annotation.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FilterConfig {
        /// The minimum box width and height in pixels.
        pub min_box_size: R64,
        /// The minimum box area over image area.
        pub min_box_area_ratio: R64,
    }

    impl FilterConfig {
        pub fn validate(&self) -> Result<()> {
            ensure!(
                self.min_box_size >= 1.0,
                "filter.min_box_size must be at least 1 pixel"
            );
            ensure!(
                self.min_box_area_ratio >= 0.0,
                "filter.min_box_area_ratio must be non-negative"
            );
            Ok(())
        }
    }
}

mod source {
    use super::*;

    /// One annotation corpus feeding the dataset.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SourceConfig {
        /// Short name used in crop file names and scratch directories.
        pub name: String,
        /// Cap of selected crops per class after merging partitions.
        pub max_images_per_class: NonZeroUsize,
        /// Classes of this source with fewer saved crops are not copied into
        /// the dataset.
        #[serde(default)]
        pub min_images_per_class: Option<NonZeroUsize>,
        /// Added to the global seed to derive this source's random streams.
        #[serde(default)]
        pub seed_offset: u64,
        pub mapping: MappingConfig,
        /// Optional local root for images referenced by relative file names.
        #[serde(default)]
        pub images_root: Option<PathBuf>,
        pub partitions: Vec<PartitionConfig>,
    }

    impl SourceConfig {
        pub fn validate(&self) -> Result<()> {
            ensure!(
                !self.name.is_empty()
                    && self
                        .name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-'),
                "source name '{}' must be non-empty and contain only ASCII letters, digits or '-'",
                self.name
            );
            ensure!(
                !self.partitions.is_empty(),
                "source '{}' has no partitions",
                self.name
            );

            let mut names = HashSet::new();
            for partition in &self.partitions {
                ensure!(
                    names.insert(partition.name.as_str()),
                    "duplicated partition name '{}' in source '{}'",
                    partition.name,
                    self.name
                );
                ensure!(
                    partition.annotations.path.is_some() || !partition.annotations.urls.is_empty(),
                    "partition '{}' of source '{}' has neither a path nor urls",
                    partition.name,
                    self.name
                );
            }

            self.mapping.build()?;
            Ok(())
        }

        pub fn min_images_per_class(&self) -> usize {
            self.min_images_per_class.map(NonZeroUsize::get).unwrap_or(1)
        }

        /// The random seed of this source's planning stream.
        pub fn seed(&self, global_seed: u64) -> u64 {
            global_seed.wrapping_add(self.seed_offset)
        }

        /// The per-class cap of a partition before the partitions are merged.
        pub fn partition_cap(&self, partition: &PartitionConfig) -> usize {
            partition
                .max_images_per_class
                .unwrap_or(self.max_images_per_class)
                .get()
        }
    }

    /// A sub-corpus of a source, e.g. the train or val release of COCO.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PartitionConfig {
        pub name: String,
        #[serde(default)]
        pub max_images_per_class: Option<NonZeroUsize>,
        pub annotations: AnnotationLocation,
    }

    /// Where to find an annotation document.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct AnnotationLocation {
        /// A pre-downloaded JSON document.
        #[serde(default)]
        pub path: Option<PathBuf>,
        /// Download locations tried in order.
        #[serde(default)]
        pub urls: Vec<String>,
        /// The JSON member to extract when the download is a zip archive.
        #[serde(default)]
        pub archive_member: Option<String>,
    }

    /// Category mapping policy of a source.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum MappingConfig {
        /// Exact name table. The builtin COCO table is used when omitted.
        Exact {
            #[serde(default)]
            table: Option<IndexMap<String, String>>,
        },
        /// Ordered keyword rules. The builtin litter rules are used when omitted.
        Heuristic {
            #[serde(default)]
            rules: Option<Vec<KeywordRule>>,
        },
    }

    impl MappingConfig {
        pub fn build(&self) -> Result<CategoryMapper> {
            let mapper = match self {
                Self::Exact { table: Some(table) } => CategoryMapper::exact(table.clone()),
                Self::Exact { table: None } => CategoryMapper::coco_preset(),
                Self::Heuristic { rules: Some(rules) } => CategoryMapper::heuristic(rules.clone())?,
                Self::Heuristic { rules: None } => CategoryMapper::litter_preset(),
            };
            Ok(mapper)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const CONFIG: &str = r#"{
        taxonomy_file: "taxonomy.json",
        output_dir: "out",
        work_dir: "work",
        seed: 42,
        min_images_per_class: 80,
        split: { train_ratio: 0.8, val_ratio: 0.1 },
        filter: { min_box_size: 48, min_box_area_ratio: 0.015 },
        sources: [
            {
                name: "coco",
                max_images_per_class: 260,
                min_images_per_class: 40,
                mapping: { type: "Exact" },
                partitions: [
                    { name: "train", annotations: { path: "train.json" } },
                    { name: "val", max_images_per_class: 130, annotations: { urls: ["http://localhost/a.zip"], archive_member: "a.json" } },
                ],
            },
            {
                name: "taco",
                max_images_per_class: 160,
                seed_offset: 17,
                mapping: { type: "Heuristic", rules: [ { keywords: [["can"]], leaf: "aluminum_can" } ] },
                partitions: [ { name: "taco", annotations: { path: "taco.json" } } ],
            },
        ],
    }"#;

    #[test]
    fn parse_config() {
        let config: Config = json5::from_str(CONFIG).unwrap();
        config.validate().unwrap();

        assert_eq!(config.fetch.timeout_secs, 45);
        assert_abs_diff_eq!(config.filter.min_box_area_ratio.raw(), 0.015);
        let ratios = config.split.ratios().unwrap();
        assert_abs_diff_eq!(ratios.train() + ratios.val(), 0.9, epsilon = 1e-12);
        assert_eq!(config.sources.len(), 2);

        let coco = &config.sources[0];
        assert_eq!(coco.partition_cap(&coco.partitions[0]), 260);
        assert_eq!(coco.partition_cap(&coco.partitions[1]), 130);
        assert_eq!(coco.min_images_per_class(), 40);
        assert_eq!(coco.seed(config.seed), 42);
        assert!(matches!(coco.mapping.build().unwrap(), CategoryMapper::Exact(_)));

        let taco = &config.sources[1];
        assert_eq!(taco.seed(config.seed), 59);
        assert_eq!(taco.min_images_per_class(), 1);
        let mapper = taco.mapping.build().unwrap();
        assert_eq!(mapper.map_label("Drink can"), Some("aluminum_can"));
        assert_eq!(mapper.map_label("Glass bottle"), None);
    }

    #[test]
    fn reject_bad_ratios() {
        let mut config: Config = json5::from_str(CONFIG).unwrap();
        config.split.val_ratio = r64(1.2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_duplicated_sources() {
        let mut config: Config = json5::from_str(CONFIG).unwrap();
        config.sources[1].name = "coco".into();
        assert!(config.validate().is_err());
    }
}
