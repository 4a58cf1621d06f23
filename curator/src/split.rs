//! Per-class train/val/test split sizes.

use crate::common::*;

/// One of the dataset splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target train and val shares. The test share is the remainder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitRatios {
    train: R64,
    val: R64,
}

impl SplitRatios {
    pub fn new(train: f64, val: f64) -> Result<Self> {
        ensure!(
            train > 0.0 && train < 1.0,
            "train ratio must be in range (0, 1), but get {}",
            train
        );
        ensure!(
            val > 0.0 && val < 1.0,
            "val ratio must be in range (0, 1), but get {}",
            val
        );

        Ok(Self {
            train: r64(train),
            val: r64(val),
        })
    }

    pub fn train(&self) -> f64 {
        self.train.raw()
    }

    pub fn val(&self) -> f64 {
        self.val.raw()
    }

    pub fn plan(&self, n: usize) -> SplitPlan {
        SplitPlan::new(n, self.train(), self.val())
    }
}

/// Item counts of one class in each split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SplitPlan {
    pub train: usize,
    pub val: usize,
    pub test: usize,
}

impl SplitPlan {
    /// Split `n` items by the given ratios.
    ///
    /// A single item goes to train and a pair to train and val. From three
    /// items up every split receives at least one item, which overrides the
    /// ratios for small classes.
    pub fn new(n: usize, train_ratio: f64, val_ratio: f64) -> Self {
        match n {
            0 | 1 => Self {
                train: n,
                val: 0,
                test: 0,
            },
            2 => Self {
                train: 1,
                val: 1,
                test: 0,
            },
            _ => {
                let n = n as i64;
                let round = |ratio: f64| (n as f64 * ratio).round_ties_even() as i64;

                // leave room for at least one val and one test item
                let train = round(train_ratio).clamp(1, n - 2);
                let val = round(val_ratio).clamp(1, n - train - 1);
                let test = n - train - val;

                Self {
                    train: train as usize,
                    val: val as usize,
                    test: test as usize,
                }
            }
        }
    }

    pub fn total(&self) -> usize {
        self.train + self.val + self.test
    }

    pub fn get(&self, split: Split) -> usize {
        match split {
            Split::Train => self.train,
            Split::Val => self.val,
            Split::Test => self.test,
        }
    }

    /// The split of each item position, in train, val, test order.
    pub fn assignments(&self) -> impl Iterator<Item = Split> + '_ {
        Split::ALL
            .into_iter()
            .flat_map(move |split| itertools::repeat_n(split, self.get(split)))
    }
}
