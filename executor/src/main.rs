mod attempt;
mod runner;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("executor=debug,commit_protocol=debug,reqwest=info")
            }),
        )
        .init();

    runner::run(runner::ExecutorConfig::from_env()).await
}
