use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cardsmith_worker::config::{LogFormat, RunnerConfig};
use cardsmith_worker::runner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = RunnerConfig::from_env().context("invalid configuration")?;
    init_tracing(config.log_format);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, no new jobs will be submitted");
            on_interrupt.cancel();
        }
    });

    tracing::info!(
        url = %config.comfyui_url,
        output_dir = %config.output_dir.display(),
        concurrency = config.tracker.concurrency,
        "Worker starting",
    );

    let outcome = runner::run(&config, &cancel).await?;

    for failure in &outcome.summary.failures {
        tracing::warn!(
            user_id = %failure.user_id,
            status = %failure.status,
            kind = failure.kind.map(|k| k.as_str()).unwrap_or("-"),
            message = %failure.message,
            "User not completed",
        );
    }
    tracing::info!(
        summary = %outcome.summary,
        artifacts = outcome.manifest.ready_count(),
        complete = outcome.summary.is_complete(),
        "Worker finished",
    );
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let json = format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cardsmith_worker=info,cardsmith_pipeline=info,cardsmith_comfyui=info".into()
            }),
        )
        .with((!json).then(tracing_subscriber::fmt::layer))
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .init();
}
