//! The end-to-end dataset build.

use crate::{
    annotation::{self, AnnotationDocument},
    assembler::{AssembledDataset, DatasetAssembler, MaterializeStats},
    common::*,
    config::{Config, SourceConfig},
    error::CurateError,
    executor::{ExecuteStats, FetchCropExecutor},
    fetch::{self, Fetcher},
    manifest::SplitSizes,
    mapper::CategoryMapper,
    planner::{CropTaskPlanner, PlanStats, TaskPlan},
    taxonomy::TaxonomyIndex,
};

pub const BUILD_REPORT_FILE: &str = "build_report.json";

/// Separates the assembly stream of a source from its planning stream.
const ASSEMBLY_SALT: u64 = 0x9e37_79b9_7f4a_7c15;

/// The planned tasks of one source.
#[derive(Debug, Clone)]
pub struct SourcePlan {
    pub name: String,
    /// Partitions whose annotations were obtained.
    pub partitions: Vec<String>,
    pub plan: TaskPlan,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReport {
    pub name: String,
    pub partitions: Vec<String>,
    pub plan: PlanStats,
    pub tasks_selected: usize,
    pub execute: ExecuteStats,
    pub materialize: MaterializeStats,
}

/// Run summary written to `{work_dir}/build_report.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    pub sources: Vec<SourceReport>,
    pub class_count: usize,
    pub split_sizes: SplitSizes,
    pub pruned: Vec<String>,
}

/// Plan, fetch, crop and assemble every source, then prune and index the
/// merged dataset.
pub async fn build(config: &Config) -> Result<BuildReport> {
    let taxonomy = TaxonomyIndex::open(&config.taxonomy_file)?;
    info!("loaded {} taxonomy classes", taxonomy.len());

    let fetcher = Fetcher::new(config.fetch.timeout())?;
    let assembler = DatasetAssembler::new(&config.output_dir, config.split.ratios()?);
    assembler.prepare()?;

    let mut reports = vec![];
    let mut any_tasks = false;

    for source in &config.sources {
        let SourcePlan {
            name,
            partitions,
            plan,
        } = match plan_source(config, source, &taxonomy, &fetcher).await {
            Ok(planned) => planned,
            Err(err) => {
                warn!("skip source '{}': {:#}", source.name, err);
                reports.push(SourceReport {
                    name: source.name.clone(),
                    ..Default::default()
                });
                continue;
            }
        };

        let mut report = SourceReport {
            name,
            partitions,
            plan: plan.stats.clone(),
            tasks_selected: plan.num_tasks(),
            ..Default::default()
        };

        if plan.is_empty() {
            warn!("source '{}' yields no crop tasks", source.name);
            reports.push(report);
            continue;
        }
        any_tasks = true;

        let work_dir = config.source_work_dir(source);
        let executor = FetchCropExecutor::new(
            fetcher.clone(),
            work_dir.join("images_cache"),
            work_dir.join("crops_tmp"),
            config.workers(),
        );
        let crops_dir = executor.crops_dir();
        if crops_dir.exists() {
            tokio::fs::remove_dir_all(crops_dir).await?;
        }
        tokio::fs::create_dir_all(crops_dir).await?;

        let (results, execute) = executor.execute(plan.into_tasks()).await;
        report.execute = execute;
        if results.is_empty() {
            warn!("source '{}' produced no crops", source.name);
        }

        let materialize = {
            let assembler = assembler.clone();
            let min_results = source.min_images_per_class();
            let seed = source.seed(config.seed) ^ ASSEMBLY_SALT;
            tokio::task::spawn_blocking(move || assembler.materialize(results, min_results, seed))
                .await??
        };
        info!(
            "source '{}': {} crops copied into the dataset",
            source.name, materialize.copied
        );
        report.materialize = materialize;

        reports.push(report);
    }

    if !any_tasks {
        return Err(CurateError::NoCropTasks.into());
    }

    let AssembledDataset {
        labels,
        manifest,
        pruned,
    } = {
        let min_images = config.min_images_per_class.get();
        tokio::task::spawn_blocking(move || assembler.finalize(&taxonomy, min_images)).await??
    };

    let report = BuildReport {
        sources: reports,
        class_count: labels.len(),
        split_sizes: manifest.split_sizes,
        pruned,
    };
    let text = serde_json::to_vec_pretty(&report)?;
    fetch::write_atomic(config.work_dir.join(BUILD_REPORT_FILE), text).await?;

    Ok(report)
}

/// Resolve annotations and plan every source without fetching images.
pub async fn plan_sources(config: &Config) -> Result<Vec<SourcePlan>> {
    let taxonomy = TaxonomyIndex::open(&config.taxonomy_file)?;
    let fetcher = Fetcher::new(config.fetch.timeout())?;

    let mut plans = vec![];
    for source in &config.sources {
        match plan_source(config, source, &taxonomy, &fetcher).await {
            Ok(planned) => plans.push(planned),
            Err(err) => warn!("skip source '{}': {:#}", source.name, err),
        }
    }
    Ok(plans)
}

/// Prune the existing dataset tree and rewrite its metadata.
pub fn reindex(config: &Config) -> Result<AssembledDataset> {
    let taxonomy = TaxonomyIndex::open(&config.taxonomy_file)?;
    let assembler = DatasetAssembler::new(&config.output_dir, config.split.ratios()?);
    assembler.finalize(&taxonomy, config.min_images_per_class.get())
}

async fn plan_source(
    config: &Config,
    source: &SourceConfig,
    taxonomy: &TaxonomyIndex,
    fetcher: &Fetcher,
) -> Result<SourcePlan> {
    let mapper = source.mapping.build()?;
    if let CategoryMapper::Exact(_) = &mapper {
        let unknown = mapper.unknown_leaves(taxonomy);
        if !unknown.is_empty() {
            warn!(
                "source '{}' maps to classes missing in the taxonomy: {}",
                source.name,
                unknown.join(", ")
            );
        }
    }

    let annotations_dir = config.source_work_dir(source).join("annotations");
    let mut docs = vec![];
    for partition in &source.partitions {
        let path = match annotation::resolve(
            &partition.annotations,
            fetcher,
            &annotations_dir,
            &partition.name,
        )
        .await?
        {
            Some(path) => path,
            None => {
                warn!(
                    "annotations of '{}/{}' are unavailable",
                    source.name, partition.name
                );
                continue;
            }
        };

        match AnnotationDocument::open_async(path).await {
            Ok(doc) => docs.push((partition, doc)),
            Err(err) => warn!(
                "skip partition '{}/{}': {:#}",
                source.name, partition.name, err
            ),
        }
    }

    let planner = CropTaskPlanner::new(
        &source.name,
        taxonomy,
        &mapper,
        &config.filter,
        source.images_root.as_deref(),
    );
    let plan = planner.plan(
        docs.iter().map(|(partition, doc)| {
            (
                partition.name.as_str(),
                doc,
                source.partition_cap(partition),
            )
        }),
        source.max_images_per_class.get(),
        source.seed(config.seed),
    );

    for (leaf, count) in plan.class_counts() {
        debug!("{}: {} tasks of '{}'", source.name, count, leaf);
    }
    info!(
        "source '{}': {} tasks selected for {} classes",
        source.name,
        plan.num_tasks(),
        plan.buckets.len()
    );

    Ok(SourcePlan {
        name: source.name.clone(),
        partitions: docs
            .iter()
            .map(|(partition, _)| partition.name.clone())
            .collect(),
        plan,
    })
}
