use std::sync::Arc;

use clap::Parser;
use tracing::info;

use eventforge::config::{Cli, Config};
use eventforge::pipeline::Pipeline;
use eventforge::script::NullScriptHost;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "eventforge=debug"
    } else {
        "eventforge=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("eventforge v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    if let Some(dir) = &cli.samples_dir {
        config.read_samples_dir(dir);
    }
    info!(
        samples = config.samples.len(),
        generator_workers = config.global.generator_workers,
        output_workers = config.global.output_workers,
        outputter = %config.global.output.outputter,
        template = %config.global.output.output_template,
        "configuration loaded"
    );

    let pipeline = Pipeline::new(config, Arc::new(NullScriptHost))?;

    let handle = pipeline.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining pipeline");
            handle.close();
        }
    });

    let summary = pipeline.run().await;
    info!(
        events = summary.events,
        bytes = summary.bytes,
        "pipeline complete"
    );
    Ok(())
}
