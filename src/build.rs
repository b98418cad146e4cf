use anyhow::Context;
use serde::Serialize;

use crate::cli::BuildArgs;
use crate::index::namaste::RebuildReport;
use crate::services;
use crate::storage::write_atomic;

const META_FILE: &str = "meta.json";

#[derive(Debug, Serialize)]
struct BuildMeta<'a> {
    built_at_utc: String,
    assets_dir: &'a str,
    #[serde(flatten)]
    report: &'a RebuildReport,
    total_indexed: u64,
}

pub async fn run(opts: BuildArgs) -> anyhow::Result<()> {
    tracing::info!("terminology-backend build");
    tracing::info!(
        "data_dir={} assets_dir={}",
        opts.storage.data_dir,
        opts.storage.assets_dir
    );

    let index = services::open_index(&opts.storage)?;

    let t0 = std::time::Instant::now();
    let report = index.rebuild().await.context("rebuild NAMASTE index")?;
    for c in &report.categories {
        tracing::info!(
            "{}: {} rows read, {} indexed, {} skipped (empty term)",
            c.category,
            c.rows_read,
            c.indexed,
            c.skipped_empty_term
        );
    }
    tracing::info!(
        "Built generation {} with {} records in {:.1}s",
        report.generation,
        report.total_indexed(),
        t0.elapsed().as_secs_f64()
    );

    let meta = BuildMeta {
        built_at_utc: chrono::Utc::now().to_rfc3339(),
        assets_dir: &opts.storage.assets_dir,
        report: &report,
        total_indexed: report.total_indexed(),
    };
    let meta_path = index.root().join(META_FILE);
    let body = serde_json::to_string_pretty(&meta).context("encode build meta")?;
    write_atomic(&meta_path, &body)
        .with_context(|| format!("write {}", meta_path.display()))?;
    tracing::info!("Wrote {}", meta_path.display());

    Ok(())
}
