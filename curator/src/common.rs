pub use anyhow::{ensure, format_err, Context as _, Error, Result};
pub use futures::stream::{self, StreamExt as _};
pub use indexmap::IndexMap;
pub use itertools::Itertools as _;
pub use log::{debug, info, warn};
pub use noisy_float::prelude::*;
pub use rand::{prelude::*, rngs::StdRng};
pub use serde::{Deserialize, Serialize};
pub use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt, fs,
    io::{self, Write as _},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};
