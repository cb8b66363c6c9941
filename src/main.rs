use anyhow::Context;
use oci_crane::cli::{Args, Runner};
use oci_crane::logging::init_tracing;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let args = Args::parse_args();
    init_tracing(args.global.verbose);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let runner = Runner::new(args, cancel);
    if let Err(e) = run(&runner).await {
        runner.output().error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(runner: &Runner) -> anyhow::Result<()> {
    runner.run().await.context("crane failed")
}
