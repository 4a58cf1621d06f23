use anyhow::{Context, Result};
use curator::{config::Config, pipeline};
use prettytable::{cell, row, Table};
use std::{env, path::PathBuf};
use structopt::StructOpt;
use tracing::{info, trace_span, Instrument};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, StructOpt)]
/// Build class-balanced image folder datasets from detection corpora
enum Opts {
    /// Run the whole pipeline
    Build {
        #[structopt(long, default_value = "curate.json5")]
        /// configuration file
        config_file: PathBuf,
    },
    /// Resolve annotations and print the planned crop tasks
    Plan {
        #[structopt(long, default_value = "curate.json5")]
        /// configuration file
        config_file: PathBuf,
    },
    /// Prune the existing dataset and rewrite its metadata files
    Reindex {
        #[structopt(long, default_value = "curate.json5")]
        /// configuration file
        config_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    match Opts::from_args() {
        Opts::Build { config_file } => {
            let config = open_config(config_file)?;
            let report = pipeline::build(&config)
                .instrument(trace_span!("build"))
                .await?;

            let sizes = &report.split_sizes;
            info!(
                "built {} classes, train={}, val={}, test={}",
                report.class_count, sizes.train, sizes.val, sizes.test
            );
        }
        Opts::Plan { config_file } => {
            let config = open_config(config_file)?;
            let plans = pipeline::plan_sources(&config)
                .instrument(trace_span!("plan"))
                .await?;

            let mut table = Table::new();
            table.add_row(row!["source", "class", "tasks"]);
            for source in &plans {
                for (leaf, count) in source.plan.class_counts() {
                    table.add_row(row![source.name, leaf, count]);
                }
                table.add_row(row![source.name, "(total)", source.plan.num_tasks()]);
            }
            table.printstd();
        }
        Opts::Reindex { config_file } => {
            let config = open_config(config_file)?;
            let dataset = trace_span!("reindex").in_scope(|| pipeline::reindex(&config))?;
            info!(
                "indexed {} classes with {} images, pruned {:?}",
                dataset.labels.len(),
                dataset.manifest.rows.len(),
                dataset.pruned
            );
        }
    }

    Ok(())
}

fn open_config(config_file: PathBuf) -> Result<Config> {
    Config::open(&config_file)
        .with_context(|| format!("failed to load config file '{}'", config_file.display()))
}
