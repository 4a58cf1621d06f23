//! Class indices and the dataset manifest.

use crate::{common::*, fetch, split::Split, taxonomy::TaxonomyIndex};

pub const LABELS_FILE: &str = "labels.json";
pub const CLASS_TO_INDEX_FILE: &str = "class_to_index.json";
pub const MANIFEST_FILE: &str = "dataset_manifest.json";

/// Display metadata of an indexed class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelEntry {
    pub name: String,
    pub class_key: String,
    pub category: String,
}

/// Kept classes numbered by the lexicographic order of their keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelIndex {
    entries: IndexMap<String, LabelEntry>,
}

impl LabelIndex {
    pub fn new<I, S>(class_keys: I, taxonomy: &TaxonomyIndex) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = class_keys
            .into_iter()
            .map(Into::into)
            .sorted()
            .dedup()
            .map(|class_key| {
                let entry = match taxonomy.get(&class_key) {
                    Some(class) => LabelEntry {
                        name: class.name.clone(),
                        class_key: class_key.clone(),
                        category: class.category.clone(),
                    },
                    None => LabelEntry {
                        name: title_case(&class_key.replace('_', " ")),
                        class_key: class_key.clone(),
                        category: String::new(),
                    },
                };
                (class_key, entry)
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn index_of(&self, class_key: &str) -> Option<usize> {
        self.entries.get_index_of(class_key)
    }

    pub fn class_keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (usize, &LabelEntry)> + '_ {
        self.entries.values().enumerate()
    }

    pub fn class_to_index(&self) -> IndexMap<String, usize> {
        self.entries
            .keys()
            .enumerate()
            .map(|(index, key)| (key.clone(), index))
            .collect()
    }

    pub fn id2label(&self) -> IndexMap<String, LabelEntry> {
        self.entries()
            .map(|(index, entry)| (index.to_string(), entry.clone()))
            .collect()
    }

    /// Write `labels.json` and `class_to_index.json`.
    pub fn write(&self, output_dir: &Path) -> Result<()> {
        let labels = serde_json::json!({ "id2label": self.id2label() });
        write_json(&output_dir.join(LABELS_FILE), &labels)?;
        write_json(&output_dir.join(CLASS_TO_INDEX_FILE), &self.class_to_index())?;
        Ok(())
    }
}

/// Capitalize the first letter of every word and lower-case the rest.
fn title_case(text: &str) -> String {
    let mut prev_is_letter = false;
    text.chars()
        .flat_map(|ch| {
            let is_letter = ch.is_alphabetic();
            let upper = is_letter && !prev_is_letter;
            prev_is_letter = is_letter;
            let mapped: Vec<char> = if upper {
                ch.to_uppercase().collect()
            } else {
                ch.to_lowercase().collect()
            };
            mapped
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRow {
    pub split: Split,
    pub class_key: String,
    pub class_index: usize,
    /// The `/`-separated path under the dataset root.
    pub relative_path: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSizes {
    pub train: usize,
    pub val: usize,
    pub test: usize,
}

impl SplitSizes {
    pub fn get(&self, split: Split) -> usize {
        match split {
            Split::Train => self.train,
            Split::Val => self.val,
            Split::Test => self.test,
        }
    }

    fn get_mut(&mut self, split: Split) -> &mut usize {
        match split {
            Split::Train => &mut self.train,
            Split::Val => &mut self.val,
            Split::Test => &mut self.test,
        }
    }

    pub fn total(&self) -> usize {
        self.train + self.val + self.test
    }
}

/// Every file of the dataset tree with its split and class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetManifest {
    pub class_count: usize,
    pub split_sizes: SplitSizes,
    pub rows: Vec<ManifestRow>,
}

impl DatasetManifest {
    /// Walk `output_dir` in split, class key, file name order.
    ///
    /// Only classes of the label index are listed.
    pub fn scan(output_dir: &Path, labels: &LabelIndex) -> Result<Self> {
        let mut rows = vec![];
        let mut split_sizes = SplitSizes::default();

        for split in Split::ALL {
            let split_dir = output_dir.join(split.as_str());
            if !split_dir.is_dir() {
                continue;
            }

            for (class_index, entry) in labels.entries() {
                let class_dir = split_dir.join(&entry.class_key);
                if !class_dir.is_dir() {
                    continue;
                }

                let file_names: Vec<_> = list_files(&class_dir)?.into_iter().sorted().collect();
                for file_name in file_names {
                    rows.push(ManifestRow {
                        split,
                        class_key: entry.class_key.clone(),
                        class_index,
                        relative_path: format!("{}/{}/{}", split, entry.class_key, file_name),
                    });
                    *split_sizes.get_mut(split) += 1;
                }
            }
        }

        Ok(Self {
            class_count: labels.len(),
            split_sizes,
            rows,
        })
    }

    pub fn write(&self, output_dir: &Path) -> Result<()> {
        write_json(&output_dir.join(MANIFEST_FILE), self)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Names of the regular files in `dir`.
pub(crate) fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = vec![];
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

fn write_json<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let text = serde_json::to_string_pretty(value)?;
    fetch::write_atomic_blocking(path, text.as_bytes())
        .with_context(|| format!("failed to write '{}'", path.display()))
}
