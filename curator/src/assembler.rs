//! Merges crops of every source into the dataset tree.

use crate::{
    common::*,
    error::CurateError,
    executor::CropResult,
    manifest::{self, DatasetManifest, LabelIndex, SplitSizes},
    split::{Split, SplitRatios},
    taxonomy::TaxonomyIndex,
};

/// Copy counts of one [DatasetAssembler::materialize] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializeStats {
    pub results: usize,
    pub copied: usize,
    /// Crops whose scratch file vanished before copying.
    pub missing: usize,
    /// Classes skipped for having too few crops in this source.
    pub skipped_classes: Vec<String>,
}

/// The final product of a build.
#[derive(Debug, Clone)]
pub struct AssembledDataset {
    pub labels: LabelIndex,
    pub manifest: DatasetManifest,
    pub pruned: Vec<String>,
}

/// Owns the `{output_dir}/{split}/{class_key}/` tree.
#[derive(Debug, Clone)]
pub struct DatasetAssembler {
    output_dir: PathBuf,
    ratios: SplitRatios,
}

impl DatasetAssembler {
    pub fn new(output_dir: impl Into<PathBuf>, ratios: SplitRatios) -> Self {
        Self {
            output_dir: output_dir.into(),
            ratios,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Remove split folders and metadata of a previous build.
    pub fn prepare(&self) -> Result<()> {
        for split in Split::ALL {
            let dir = self.output_dir.join(split.as_str());
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("failed to clear '{}'", dir.display()))?;
            }
            fs::create_dir_all(&dir)?;
        }

        for file in [
            manifest::LABELS_FILE,
            manifest::CLASS_TO_INDEX_FILE,
            manifest::MANIFEST_FILE,
        ] {
            let path = self.output_dir.join(file);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }

        Ok(())
    }

    /// Split and copy the crops of one source.
    ///
    /// Results are ordered by image and annotation id before the seeded
    /// shuffle, so the outcome does not depend on completion order. Classes
    /// with fewer than `min_results` crops are left out.
    pub fn materialize(
        &self,
        results: Vec<CropResult>,
        min_results: usize,
        seed: u64,
    ) -> Result<MaterializeStats> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut stats = MaterializeStats {
            results: results.len(),
            ..Default::default()
        };

        let mut by_class: BTreeMap<String, Vec<CropResult>> = BTreeMap::new();
        for result in results {
            by_class.entry(result.leaf.clone()).or_default().push(result);
        }

        for (class_key, mut results) in by_class {
            if results.len() < min_results {
                debug!(
                    "skip class '{}' with {} crops, below {}",
                    class_key,
                    results.len(),
                    min_results
                );
                stats.skipped_classes.push(class_key);
                continue;
            }

            results.sort_by(|lhs, rhs| {
                (lhs.image_id, lhs.annotation_id, &lhs.partition).cmp(&(
                    rhs.image_id,
                    rhs.annotation_id,
                    &rhs.partition,
                ))
            });
            results.shuffle(&mut rng);

            let plan = self.ratios.plan(results.len());
            debug!("class '{}': {:?}", class_key, plan);

            for (result, split) in results.iter().zip(plan.assignments()) {
                if !result.crop_path.is_file() {
                    warn!("crop '{}' disappeared", result.crop_path.display());
                    stats.missing += 1;
                    continue;
                }
                let file_name = result
                    .crop_path
                    .file_name()
                    .ok_or_else(|| format_err!("invalid crop path '{}'", result.crop_path.display()))?;

                let class_dir = self.output_dir.join(split.as_str()).join(&class_key);
                fs::create_dir_all(&class_dir)?;
                let dest = class_dir.join(file_name);
                fs::copy(&result.crop_path, &dest).with_context(|| {
                    format!(
                        "failed to copy '{}' to '{}'",
                        result.crop_path.display(),
                        dest.display()
                    )
                })?;
                stats.copied += 1;
            }
        }

        Ok(stats)
    }

    /// Per-class, per-split file counts read from the tree.
    pub fn count_classes(&self) -> Result<BTreeMap<String, SplitSizes>> {
        let mut counts: BTreeMap<String, SplitSizes> = BTreeMap::new();

        for split in Split::ALL {
            let split_dir = self.output_dir.join(split.as_str());
            if !split_dir.is_dir() {
                continue;
            }

            for entry in fs::read_dir(&split_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let class_key = entry.file_name().to_string_lossy().into_owned();
                let count = manifest::list_files(&entry.path())?.len();
                let sizes = counts.entry(class_key).or_default();
                match split {
                    Split::Train => sizes.train = count,
                    Split::Val => sizes.val = count,
                    Split::Test => sizes.test = count,
                }
            }
        }

        Ok(counts)
    }

    /// Delete classes with fewer than `min_images` files across all splits.
    ///
    /// Returns the kept and the pruned class keys, both sorted.
    pub fn prune(&self, min_images: usize) -> Result<(Vec<String>, Vec<String>)> {
        let (kept, pruned): (Vec<_>, Vec<_>) = self
            .count_classes()?
            .into_iter()
            .partition(|(_, sizes)| sizes.total() >= min_images);

        for (class_key, sizes) in &pruned {
            info!(
                "prune class '{}' with {} images, below {}",
                class_key,
                sizes.total(),
                min_images
            );
            for split in Split::ALL {
                let dir = self.output_dir.join(split.as_str()).join(class_key);
                if dir.exists() {
                    fs::remove_dir_all(&dir)?;
                }
            }
        }

        let kept = kept.into_iter().map(|(class_key, _)| class_key).collect();
        let pruned = pruned.into_iter().map(|(class_key, _)| class_key).collect();
        Ok((kept, pruned))
    }

    /// Prune, index the kept classes and write the metadata files.
    pub fn finalize(&self, taxonomy: &TaxonomyIndex, min_images: usize) -> Result<AssembledDataset> {
        let (kept, pruned) = self.prune(min_images)?;

        if kept.len() < 2 {
            return Err(CurateError::InsufficientClasses {
                kept: kept.len(),
                min_images_per_class: min_images,
            }
            .into());
        }

        let labels = LabelIndex::new(kept, taxonomy);
        let manifest = DatasetManifest::scan(&self.output_dir, &labels)?;
        labels.write(&self.output_dir)?;
        manifest.write(&self.output_dir)?;

        let SplitSizes { train, val, test } = manifest.split_sizes;
        info!(
            "dataset at '{}': {} classes kept, {} pruned, train={}, val={}, test={}",
            self.output_dir.display(),
            labels.len(),
            pruned.len(),
            train,
            val,
            test
        );

        Ok(AssembledDataset {
            labels,
            manifest,
            pruned,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(dir: &Path, leaf: &str, count: i64) -> Vec<CropResult> {
        let crops = dir.join("crops").join(leaf);
        fs::create_dir_all(&crops).unwrap();
        (0..count)
            .map(|index| {
                let crop_path = crops.join(format!("taco_{}_{}.jpg", index, index + 1000));
                fs::write(&crop_path, index.to_le_bytes()).unwrap();
                CropResult {
                    leaf: leaf.into(),
                    source_category: leaf.into(),
                    source: "taco".into(),
                    partition: "taco".into(),
                    image_id: index,
                    annotation_id: index + 1000,
                    crop_path,
                }
            })
            .collect()
    }

    fn assembler(dir: &Path) -> DatasetAssembler {
        DatasetAssembler::new(dir.join("out"), SplitRatios::new(0.8, 0.1).unwrap())
    }

    #[test]
    fn materialize_splits_each_class() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = assembler(dir.path());
        assembler.prepare().unwrap();

        let mut all = results(dir.path(), "aluminum_can", 10);
        all.extend(results(dir.path(), "paper_cup", 5));
        all.extend(results(dir.path(), "straw_plastic", 1));
        let stats = assembler.materialize(all, 2, 42).unwrap();

        assert_eq!(stats.copied, 15);
        assert_eq!(stats.skipped_classes, ["straw_plastic"]);

        let counts = assembler.count_classes().unwrap();
        assert_eq!(
            counts["aluminum_can"],
            SplitSizes {
                train: 8,
                val: 1,
                test: 1
            }
        );
        assert_eq!(
            counts["paper_cup"],
            SplitSizes {
                train: 3,
                val: 1,
                test: 1
            }
        );
        assert!(!counts.contains_key("straw_plastic"));
    }

    #[test]
    fn materialize_ignores_completion_order() {
        let first_dir = tempfile::tempdir().unwrap();
        let second_dir = tempfile::tempdir().unwrap();

        let listing = |dir: &Path, reverse: bool| {
            let assembler = assembler(dir);
            assembler.prepare().unwrap();
            let mut all = results(dir, "aluminum_can", 12);
            if reverse {
                all.reverse();
            }
            assembler.materialize(all, 1, 7).unwrap();
            let labels = LabelIndex::new(["aluminum_can"], &TaxonomyIndex::default());
            DatasetManifest::scan(assembler.output_dir(), &labels).unwrap()
        };

        assert_eq!(
            listing(first_dir.path(), false),
            listing(second_dir.path(), true)
        );
    }

    #[test]
    fn missing_crop_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = assembler(dir.path());
        assembler.prepare().unwrap();

        let all = results(dir.path(), "aluminum_can", 4);
        fs::remove_file(&all[2].crop_path).unwrap();
        let stats = assembler.materialize(all, 1, 0).unwrap();
        assert_eq!(stats.copied, 3);
        assert_eq!(stats.missing, 1);
    }

    #[test]
    fn prune_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = assembler(dir.path());
        assembler.prepare().unwrap();

        let mut all = results(dir.path(), "aluminum_can", 6);
        all.extend(results(dir.path(), "paper_cup", 4));
        all.extend(results(dir.path(), "straw_plastic", 2));
        assembler.materialize(all, 1, 3).unwrap();

        let taxonomy = TaxonomyIndex::default();
        let first = assembler.finalize(&taxonomy, 3).unwrap();
        assert_eq!(first.pruned, ["straw_plastic"]);
        assert!(!dir.path().join("out/train/straw_plastic").exists());

        let second = assembler.finalize(&taxonomy, 3).unwrap();
        assert!(second.pruned.is_empty());
        assert_eq!(first.manifest, second.manifest);
        assert_eq!(first.labels, second.labels);
        assert_eq!(first.manifest.split_sizes.total(), 10);
    }

    #[test]
    fn too_few_classes_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = assembler(dir.path());
        assembler.prepare().unwrap();

        let mut all = results(dir.path(), "aluminum_can", 5);
        all.extend(results(dir.path(), "paper_cup", 1));
        assembler.materialize(all, 1, 42).unwrap();

        let err = assembler
            .finalize(&TaxonomyIndex::default(), 2)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CurateError>(),
            Some(CurateError::InsufficientClasses {
                kept: 1,
                min_images_per_class: 2
            })
        ));
        assert!(!dir.path().join("out").join(manifest::MANIFEST_FILE).exists());
    }
}
