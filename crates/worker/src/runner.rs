//! End-to-end batch run: inputs -> feature sets -> tracked jobs ->
//! collected artifacts.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use cardsmith_comfyui::api::ComfyUIApi;
use cardsmith_comfyui::backend::ComfyUIBackend;
use cardsmith_comfyui::retry::RetryPolicies;
use cardsmith_core::features::{build_feature_set, FeatureSet, MapperContext, StyleSeed};
use cardsmith_core::template::WorkflowTemplate;
use cardsmith_pipeline::clock::{Clock, TokioClock};
use cardsmith_pipeline::collector::{ArtifactCollector, ArtifactManifest};
use cardsmith_pipeline::error::PipelineError;
use cardsmith_pipeline::inputs;
use cardsmith_pipeline::store::BatchStore;
use cardsmith_pipeline::summary::BatchSummary;
use cardsmith_pipeline::tracker::JobTracker;

use crate::config::RunnerConfig;

/// Template plus one feature set per selected user and style seed.
/// Users keep table order; seeds are sorted within each user.
#[derive(Debug)]
pub struct Batch {
    pub template: WorkflowTemplate,
    pub features: Vec<FeatureSet>,
}

#[derive(Debug)]
pub struct RunOutcome {
    /// Computed after collection, so it reflects collection demotions.
    pub summary: BatchSummary,
    pub manifest: ArtifactManifest,
}

/// Load every static input and map the selected users to feature sets.
///
/// Each user is fused with the pinned style seed, or with every seed in
/// the seeds directory when none is pinned. Without any seed, each user
/// gets one unstyled job.
pub fn load_batch(config: &RunnerConfig) -> Result<Batch, PipelineError> {
    let mapping = inputs::load_keyword_mapping(&config.keyword_mapping_path)?;
    let template = inputs::load_template(&config.workflow_template_path)?;

    let records = inputs::load_user_records(&config.user_records_csv, &mapping.id_column)?;
    let records = inputs::select_users(records, config.run_users.as_deref(), config.run_limit);

    let seed_ids = match &config.style_seed_id {
        Some(id) => vec![id.clone()],
        None => inputs::list_style_seeds(&config.input_seeds_dir)?,
    };
    let style_seeds = seed_ids
        .iter()
        .map(|id| inputs::load_style_seed(&config.input_seeds_dir, id))
        .collect::<Result<Vec<StyleSeed>, _>>()?;
    if style_seeds.is_empty() {
        tracing::info!(dir = %config.input_seeds_dir.display(), "No style seeds, running unstyled jobs");
    }

    let contexts: Vec<MapperContext<'_>> = if style_seeds.is_empty() {
        vec![MapperContext {
            user_images_dir: Some(config.user_images_dir.as_path()),
            style_seed: None,
        }]
    } else {
        style_seeds
            .iter()
            .map(|seed| MapperContext {
                user_images_dir: Some(config.user_images_dir.as_path()),
                style_seed: Some(seed),
            })
            .collect()
    };

    let mapping = &mapping;
    let features: Vec<FeatureSet> = records
        .iter()
        .flat_map(|record| {
            contexts
                .iter()
                .map(move |ctx| build_feature_set(record, mapping, *ctx))
        })
        .collect();

    for feature_set in &features {
        for note in feature_set.notes() {
            tracing::warn!(key = feature_set.key(), note = %note, "Feature downgraded");
        }
    }
    tracing::info!(
        users = records.len(),
        style_seeds = style_seeds.len(),
        jobs = features.len(),
        "Batch mapped",
    );

    Ok(Batch { template, features })
}

/// Run the configured batch until every job is terminal or `cancel` fires.
pub async fn run(config: &RunnerConfig, cancel: &CancellationToken) -> anyhow::Result<RunOutcome> {
    let api = ComfyUIApi::new(config.comfyui_url.clone(), config.request_timeout)
        .context("failed to build HTTP client")?;
    let backend = Arc::new(ComfyUIBackend::new(
        api,
        RetryPolicies::uniform(config.retry.clone()),
    ));
    backend
        .health_check()
        .await
        .with_context(|| format!("ComfyUI at {} is not reachable", config.comfyui_url))?;
    tracing::info!(url = %config.comfyui_url, "ComfyUI reachable");

    let batch = load_batch(config)?;
    if batch.features.is_empty() {
        tracing::warn!("No users selected, nothing to do");
    }

    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .with_context(|| format!("failed to create {}", config.output_dir.display()))?;
    inputs::write_feature_sets(&config.features_path(), &batch.features)?;

    let mut store = BatchStore::open(config.state_path()).await?;
    let clock: Arc<dyn Clock> = Arc::new(TokioClock::new());

    let tracker = JobTracker::new(backend.clone(), clock.clone(), config.tracker.clone());
    tracker
        .run(&mut store, &batch.template, &batch.features, cancel)
        .await?;

    let collector = ArtifactCollector::new(backend, clock, config.images_dir());
    let manifest = collector.collect_batch(&mut store, &batch.features).await?;
    manifest.write(&config.manifest_path()).await?;
    tracing::info!(
        path = %config.manifest_path().display(),
        ready = manifest.ready_count(),
        "Manifest written",
    );

    let keys: HashSet<&str> = batch.features.iter().map(FeatureSet::key).collect();
    let summary = BatchSummary::from_records(
        store
            .records()
            .iter()
            .filter(|r| keys.contains(r.user_id.as_str())),
    );

    Ok(RunOutcome { summary, manifest })
}
