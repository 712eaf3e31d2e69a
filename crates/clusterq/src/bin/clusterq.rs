use clap::Parser;

use clusterq::CLUSTERQ_VERSION;
use clusterq::client::cli::RootOptions;
use clusterq::client::submit_inputs;
use clusterq::common::setup::setup_logging;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let opts = RootOptions::parse();
    setup_logging(opts.debug);
    log::debug!("clusterq {CLUSTERQ_VERSION}");

    let result = tokio::select! {
        result = submit_inputs(opts) => result,
        _ = tokio::signal::ctrl_c() => {
            log::error!("Interrupted");
            std::process::exit(130);
        }
    };

    match result {
        Ok(summary) => {
            if summary.processed + summary.skipped > 1 {
                log::info!(
                    "{} job(s) processed, {} skipped",
                    summary.processed,
                    summary.skipped
                );
            }
            if summary.skipped > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(error) => {
            log::error!("{error:#}");
            std::process::exit(1);
        }
    }
}
