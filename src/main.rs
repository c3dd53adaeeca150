use std::{path::Path, process, sync::Arc};

use docgen::{
    application::error::AppError,
    config::{self, ClogsSettings, Command, HashArgs, PutArgs, Settings},
    infra::{
        error::InfraError,
        evictor::{CacheEvictor, EvictionPolicy, SkipReason, spawn_periodic_cleanup},
        file_cache::{FileCache, WriteOptions},
        telemetry,
    },
    logging::{
        BatchQueueConfig, ForwardLayer, HttpTransport, HttpTransportConfig, Logger,
        StdoutTransport, Transformer, TransformerConfig, Transport, spawn_forwarder,
    },
    util::bytes::format_bytes,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(error = %error, causes = ?report.messages, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, causes = ?report.messages, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args.command;
    if !matches!(command, Command::Run(_)) {
        telemetry::init(&settings.logging, None)?;
    }

    match command {
        Command::Cleanup => run_cleanup(&settings).await,
        Command::Put(args) => run_put(&settings, args).await,
        Command::Find(args) => run_find(&settings, args).await,
        Command::Remove(args) => run_remove(&settings, args).await,
        Command::Run(_) => run_maintenance(settings).await,
    }
}

fn cache_evictor(settings: &Settings) -> CacheEvictor {
    CacheEvictor::new(
        &settings.cache.directory,
        EvictionPolicy::from_settings(&settings.cache),
    )
}

async fn run_cleanup(settings: &Settings) -> Result<(), AppError> {
    let report = cache_evictor(settings)
        .run_cleanup()
        .await
        .map_err(InfraError::from)?;

    match report.skipped {
        Some(SkipReason::Disabled) => {
            info!(target = "docgen::cleanup", "cache.max_size not set; nothing to do")
        }
        Some(SkipReason::TempDir) => info!(
            target = "docgen::cleanup",
            directory = %settings.cache.directory.display(),
            "cache directory is the OS temp directory; refusing to prune"
        ),
        None => info!(
            target = "docgen::cleanup",
            removed = report.removed.len(),
            reclaimed = %format_bytes(report.removed_bytes()),
            size = %format_bytes(report.final_bytes),
            target_size = %format_bytes(report.target_bytes),
            "cleanup completed"
        ),
    }
    Ok(())
}

async fn run_put(settings: &Settings, args: PutArgs) -> Result<(), AppError> {
    let cache = FileCache::new(&settings.cache.directory)?;
    let name = match args.name {
        Some(name) => name,
        None => file_name(&args.file)?,
    };

    // Hidden staging copy so the evictor ignores it and the source survives.
    let staged = tempfile::Builder::new()
        .prefix(".put-")
        .tempfile_in(cache.root())
        .map_err(InfraError::from)?
        .into_temp_path();
    tokio::fs::copy(&args.file, &staged)
        .await
        .map_err(InfraError::from)?;

    let options = WriteOptions {
        overwrite: args.overwrite,
    };
    let stored = cache.move_in(&staged, &name, options).await?;
    println!("{}", stored.hash);
    Ok(())
}

fn file_name(path: &Path) -> Result<String, AppError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| AppError::validation(format!("`{}` has no file name", path.display())))
}

async fn run_find(settings: &Settings, args: HashArgs) -> Result<(), AppError> {
    let cache = FileCache::new(&settings.cache.directory)?;
    let entry = cache.find(&args.hash).await?;
    let rendered = serde_json::to_string_pretty(&entry)
        .map_err(|err| AppError::unexpected(format!("failed to encode entry: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn run_remove(settings: &Settings, args: HashArgs) -> Result<(), AppError> {
    let cache = FileCache::new(&settings.cache.directory)?;
    cache.remove(&args.hash).await?;
    Ok(())
}

async fn run_maintenance(settings: Settings) -> Result<(), AppError> {
    let logger = Arc::new(build_logger(&settings.clogs)?);

    // Application events only reach the collector when one is configured;
    // otherwise they would be printed twice.
    let forwarder = if settings.clogs.enabled {
        let (layer, events) = ForwardLayer::new();
        telemetry::init(&settings.logging, Some(layer))?;
        Some(spawn_forwarder(Arc::clone(&logger), events))
    } else {
        telemetry::init(&settings.logging, None)?;
        None
    };

    FileCache::new(&settings.cache.directory)?;
    let evictor = Arc::new(cache_evictor(&settings));
    let cleanup_handle = settings
        .cache
        .cleanup_interval
        .map(|every| spawn_periodic_cleanup(Arc::clone(&evictor), every));

    info!(
        target = "docgen::run",
        directory = %settings.cache.directory.display(),
        periodic_cleanup = cleanup_handle.is_some(),
        clogs = settings.clogs.enabled,
        "maintenance mode started"
    );
    logger.log_text("info", "docgen maintenance mode started").await;

    let signal = tokio::signal::ctrl_c().await.map_err(InfraError::from);

    if let Some(handle) = cleanup_handle {
        handle.abort();
        let _ = handle.await;
    }

    info!(target = "docgen::run", "shutting down");
    logger.log_text("info", "docgen maintenance mode stopped").await;
    if let Some(handle) = forwarder {
        // Let already-forwarded events reach the queue before the final drain.
        tokio::task::yield_now().await;
        handle.abort();
        let _ = handle.await;
    }

    let outcome = logger.flush_immediate().await;
    info!(
        target = "docgen::run",
        success = outcome.success,
        status = outcome.status.code(),
        "final log flush"
    );

    signal?;
    Ok(())
}

fn build_logger(clogs: &ClogsSettings) -> Result<Logger, AppError> {
    let transport: Arc<dyn Transport> = match (clogs.enabled, &clogs.http) {
        (true, Some(http)) => {
            let config = HttpTransportConfig::new(
                http.api_url.as_str(),
                http.token_url.as_str(),
                http.client_id.clone(),
                http.client_secret.clone(),
            )
            .map_err(InfraError::from)?;
            Arc::new(HttpTransport::new(config).map_err(InfraError::from)?)
        }
        _ => Arc::new(StdoutTransport),
    };

    let transformer = Transformer::new(TransformerConfig {
        env: clogs.defaults.env.clone(),
        level: clogs.defaults.level.clone(),
        pattern: clogs.defaults.pattern.clone(),
        retention: clogs.defaults.retention.clone(),
        metadata: clogs.metadata.clone(),
        data: clogs.data.clone(),
    });
    let queue = BatchQueueConfig {
        max_batch_size: clogs.queue.max_batch_size,
        batch_timeout: clogs.queue.batch_timeout,
        initial_delay: clogs.queue.initial_delay,
    };

    Ok(Logger::new(transformer, queue, transport))
}
