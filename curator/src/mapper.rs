//! Mapping from external category labels to taxonomy leaves.

use crate::{common::*, taxonomy::TaxonomyIndex};

/// Category names of the COCO detection vocabulary and their taxonomy leaves.
pub const COCO_CATEGORY_TABLE: &[(&str, &str)] = &[
    ("backpack", "backpack"),
    ("handbag", "messenger_bag"),
    ("laptop", "laptop"),
    ("cell phone", "smartphone"),
    ("tv", "tv_monitor"),
    ("book", "notebook"),
    ("toothbrush", "toothbrush_plastic"),
    ("bottle", "single_use_plastic_bottle"),
    ("cup", "paper_cup"),
    ("fork", "plastic_fork_spoon"),
    ("knife", "plastic_fork_spoon"),
    ("spoon", "plastic_fork_spoon"),
];

/// Keyword rules for free-form litter labels such as the TACO vocabulary.
///
/// Order matters. Every inner slice is a group of alternatives and a rule
/// fires when each group has a keyword contained in the label.
// NOTE: every "cup" variant lands on paper_cup; kept as-is pending a labeling review.
pub const LITTER_KEYWORD_RULES: &[(&[&[&str]], &str)] = &[
    (&[&["bottle"], &["glass"]], "glass_bottle"),
    (&[&["bottle"], &["plastic", "pet"]], "single_use_plastic_bottle"),
    (&[&["bottle"]], "single_use_plastic_bottle"),
    (&[&["can"]], "aluminum_can"),
    (&[&["cup"], &["paper"]], "paper_cup"),
    (&[&["cup"], &["plastic"]], "paper_cup"),
    (&[&["cup"]], "paper_cup"),
    (&[&["straw"]], "straw_plastic"),
    (&[&["wrapper", "sachet"]], "snack_wrapper"),
    (&[&["carton"]], "paper_bag"),
    (&[&["bag"], &["paper"]], "paper_shopping_bag"),
    (&[&["bag"], &["plastic"]], "plastic_bag"),
    (&[&["bag"]], "plastic_bag"),
    (&[&["fork", "spoon", "knife", "cutlery"]], "plastic_fork_spoon"),
    (&[&["plate"]], "paper_plate"),
    (&[&["container", "takeout"], &["foam", "styro"]], "styrofoam_box"),
    (&[&["container", "takeout"], &["fiber", "paper"]], "takeout_container_fiber"),
    (&[&["container", "takeout"]], "takeout_container_plastic"),
    (&[&["paper"]], "paper_bag"),
    (&[&["toothbrush"]], "toothbrush_plastic"),
    (&[&["battery"]], "battery_disposable"),
    (&[&["tissue"]], "tissue_box"),
];

/// One substring rule of the heuristic policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRule {
    /// Groups of alternative keywords, all of which must be satisfied.
    pub keywords: Vec<Vec<String>>,
    /// The taxonomy leaf assigned on match.
    pub leaf: String,
}

impl KeywordRule {
    pub fn new(groups: &[&[&str]], leaf: &str) -> Self {
        Self {
            keywords: groups
                .iter()
                .map(|group| group.iter().map(|word| word.to_lowercase()).collect())
                .collect(),
            leaf: leaf.to_owned(),
        }
    }

    /// Check the rule against an already lower-cased label.
    pub fn matches(&self, text: &str) -> bool {
        self.keywords
            .iter()
            .all(|group| group.iter().any(|word| text.contains(word.as_str())))
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            !self.keywords.is_empty(),
            "rule for '{}' has no keyword groups",
            self.leaf
        );
        ensure!(
            self.keywords
                .iter()
                .all(|group| !group.is_empty() && group.iter().all(|word| !word.is_empty())),
            "rule for '{}' contains an empty keyword group or keyword",
            self.leaf
        );
        ensure!(!self.leaf.is_empty(), "rule leaf must not be empty");
        Ok(())
    }
}

/// Resolves external category labels to taxonomy leaf ids.
#[derive(Debug, Clone)]
pub enum CategoryMapper {
    /// Fixed table keyed by lower-cased category name.
    Exact(IndexMap<String, String>),
    /// Ordered keyword rules, first match wins.
    Heuristic(Vec<KeywordRule>),
}

impl CategoryMapper {
    pub fn exact<I, K, V>(table: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let table = table
            .into_iter()
            .map(|(name, leaf)| (name.as_ref().trim().to_lowercase(), leaf.into()))
            .collect();
        Self::Exact(table)
    }

    pub fn heuristic(rules: Vec<KeywordRule>) -> Result<Self> {
        rules.iter().try_for_each(KeywordRule::validate)?;
        Ok(Self::Heuristic(rules))
    }

    /// The exact table for the COCO vocabulary.
    pub fn coco_preset() -> Self {
        Self::exact(COCO_CATEGORY_TABLE.iter().copied())
    }

    /// The keyword rules for litter labels.
    pub fn litter_preset() -> Self {
        Self::Heuristic(
            LITTER_KEYWORD_RULES
                .iter()
                .map(|&(groups, leaf)| KeywordRule::new(groups, leaf))
                .collect(),
        )
    }

    /// Map a label without consulting the taxonomy.
    pub fn map_label(&self, label: &str) -> Option<&str> {
        let text = label.trim().to_lowercase();
        if text.is_empty() {
            return None;
        }

        match self {
            Self::Exact(table) => table.get(&text).map(String::as_str),
            Self::Heuristic(rules) => rules
                .iter()
                .find(|rule| rule.matches(&text))
                .map(|rule| rule.leaf.as_str()),
        }
    }

    /// Map a label to a leaf that exists in the taxonomy.
    pub fn map<'a>(&'a self, label: &str, taxonomy: &TaxonomyIndex) -> Option<&'a str> {
        self.map_label(label)
            .filter(|leaf| taxonomy.contains(leaf))
    }

    /// Leaf ids this mapper can produce that the taxonomy does not define.
    pub fn unknown_leaves(&self, taxonomy: &TaxonomyIndex) -> Vec<&str> {
        let leaves: Box<dyn Iterator<Item = &str> + '_> = match self {
            Self::Exact(table) => Box::new(table.values().map(String::as_str)),
            Self::Heuristic(rules) => Box::new(rules.iter().map(|rule| rule.leaf.as_str())),
        };
        leaves
            .filter(|leaf| !taxonomy.contains(leaf))
            .sorted()
            .dedup()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LITTER_GOLDEN: &[(&str, Option<&str>)] = &[
        ("Glass bottle", Some("glass_bottle")),
        ("Clear plastic bottle", Some("single_use_plastic_bottle")),
        ("Other plastic bottle", Some("single_use_plastic_bottle")),
        ("Metal bottle cap", Some("single_use_plastic_bottle")),
        ("Drink can", Some("aluminum_can")),
        ("Food Can", Some("aluminum_can")),
        ("Paper cup", Some("paper_cup")),
        ("Disposable plastic cup", Some("paper_cup")),
        ("Foam cup", Some("paper_cup")),
        ("Paper straw", Some("straw_plastic")),
        ("Other plastic wrapper", Some("snack_wrapper")),
        ("Drink carton", Some("paper_bag")),
        ("Paper bag", Some("paper_shopping_bag")),
        ("Plastified paper bag", Some("paper_shopping_bag")),
        ("Garbage bag", Some("plastic_bag")),
        ("Single-use carrier bag", Some("plastic_bag")),
        ("Foam food container", Some("styrofoam_box")),
        ("Disposable food container", Some("takeout_container_plastic")),
        ("Wrapping paper", Some("paper_bag")),
        ("Normal paper", Some("paper_bag")),
        ("Battery", Some("battery_disposable")),
        ("Tissues", Some("tissue_box")),
        ("Plastic utensils", None),
        ("Pizza box", None),
        ("Cigarette", None),
        ("Styrofoam piece", None),
        ("", None),
    ];

    #[test]
    fn litter_rules_golden() {
        let mapper = CategoryMapper::litter_preset();
        for &(label, expect) in LITTER_GOLDEN {
            assert_eq!(mapper.map_label(label), expect, "label '{}'", label);
        }
    }

    #[test]
    fn exact_table_normalizes_labels() {
        let mapper = CategoryMapper::coco_preset();
        assert_eq!(mapper.map_label(" Cell Phone "), Some("smartphone"));
        assert_eq!(mapper.map_label("knife"), Some("plastic_fork_spoon"));
        assert_eq!(mapper.map_label("person"), None);
    }

    #[test]
    fn unknown_leaves_are_dropped() {
        let taxonomy = TaxonomyIndex::from_json_str(
            r#"{"groups": [{"id": "g", "label": "G", "classes": [{"id": "paper_cup", "label": "Paper Cup"}]}]}"#,
        )
        .unwrap();
        let mapper = CategoryMapper::coco_preset();

        assert_eq!(mapper.map("cup", &taxonomy), Some("paper_cup"));
        assert_eq!(mapper.map("laptop", &taxonomy), None);

        let unknown = mapper.unknown_leaves(&taxonomy);
        assert!(unknown.contains(&"laptop"));
        assert!(!unknown.contains(&"paper_cup"));
        assert_eq!(
            unknown.iter().filter(|&&leaf| leaf == "plastic_fork_spoon").count(),
            1
        );
    }

    #[test]
    fn empty_rule_is_rejected() {
        let rule = KeywordRule {
            keywords: vec![vec![]],
            leaf: "paper_cup".into(),
        };
        assert!(CategoryMapper::heuristic(vec![rule]).is_err());
    }
}
