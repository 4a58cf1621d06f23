//! The target class taxonomy.

use crate::{common::*, error::CurateError};

/// Display metadata of a taxonomy leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaxonomyClass {
    pub name: String,
    pub category: String,
    pub parent_id: String,
}

/// Lookup table from leaf class id to its metadata.
#[derive(Debug, Clone, Default)]
pub struct TaxonomyIndex {
    classes: IndexMap<String, TaxonomyClass>,
}

#[derive(Debug, Deserialize)]
struct TaxonomyDoc {
    groups: Vec<GroupDoc>,
}

#[derive(Debug, Deserialize)]
struct GroupDoc {
    #[serde(default)]
    id: String,
    #[serde(default)]
    label: String,
    classes: Vec<ClassDoc>,
}

#[derive(Debug, Deserialize)]
struct ClassDoc {
    #[serde(default)]
    id: String,
    #[serde(default)]
    label: String,
}

impl TaxonomyIndex {
    /// Load the taxonomy document at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| CurateError::TaxonomyLoad {
            origin: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::parse(&text, &path.display().to_string())
    }

    /// Parse a taxonomy document held in memory.
    pub fn from_json_str(text: &str) -> Result<Self> {
        Self::parse(text, "<memory>")
    }

    fn parse(text: &str, origin: &str) -> Result<Self> {
        let doc: TaxonomyDoc =
            serde_json::from_str(text).map_err(|err| CurateError::TaxonomyLoad {
                origin: origin.to_owned(),
                reason: err.to_string(),
            })?;

        let mut classes = IndexMap::new();
        for group in doc.groups {
            let parent_id = group.id.trim().to_owned();
            let category = group.label.trim().to_owned();

            for class in group.classes {
                let id = class.id.trim();
                if id.is_empty() {
                    continue;
                }
                let name = match class.label.trim() {
                    "" => id.to_owned(),
                    label => label.to_owned(),
                };
                classes.insert(
                    id.to_owned(),
                    TaxonomyClass {
                        name,
                        category: category.clone(),
                        parent_id: parent_id.clone(),
                    },
                );
            }
        }

        Ok(Self { classes })
    }

    pub fn get(&self, class_id: &str) -> Option<&TaxonomyClass> {
        self.classes.get(class_id)
    }

    pub fn contains(&self, class_id: &str) -> bool {
        self.classes.contains_key(class_id)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn class_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.classes.keys().map(String::as_str)
    }
}
