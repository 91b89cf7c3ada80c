mod backend;
mod cli;
mod config;
mod driver;
mod error;
mod filters;
mod functions;
mod kvstore;
mod options;
mod pgp;
mod processor;
mod resource;

use std::sync::Arc;

use cli::Cli;
use driver::Driver;
use error::{Error, Result};
use options::Mode;

/// Exit codes per §6.5: 0 clean, 1 fatal configuration/pipeline error,
/// 2 shutdown by signal.
const EXIT_FATAL: i32 = 1;
const EXIT_SIGNAL: i32 = 2;

fn main() {
    let cli = Cli::new().unwrap_or_else(|e| match e {
        Error::ClapError(e) => e.exit(),
        e => {
            eprintln!("{e}");
            std::process::exit(EXIT_FATAL);
        }
    });

    cli.generate_shell_completions();

    pretty_env_logger::formatted_timed_builder()
        .filter_module("tmpld", cli.verbosity())
        .parse_env("TMPLD_LOG")
        .init();

    let config = cli.engine_config().unwrap_or_else(|e| {
        log::error!("{e}");
        std::process::exit(EXIT_FATAL);
    });

    let options = cli.options(&config);
    let backend = cli.backend().unwrap_or_else(|e| {
        log::error!("{e}");
        std::process::exit(EXIT_FATAL);
    });

    // Onetime mode never suspends on a timer or a backend watch, so a
    // current_thread runtime is sufficient (mirrors the teacher's
    // run_oneshot); interval/watch mode spawns one task per descriptor and
    // wants a worker per core (mirrors the teacher's run_watch).
    let runtime_result = if matches!(options.mode(), Mode::Onetime) {
        tokio::runtime::Builder::new_current_thread().enable_all().build()
    } else {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(num_cpus::get())
            .thread_name("tmpld-worker")
            .enable_all()
            .build()
    };

    let runtime = runtime_result.unwrap_or_else(|e| {
        log::error!("could not create the tokio runtime: {e}");
        std::process::exit(EXIT_FATAL);
    });

    match runtime.block_on(run(config, backend, options)) {
        Outcome::Clean => std::process::exit(0),
        Outcome::Failed(e) => {
            log::error!("{e}");
            std::process::exit(EXIT_FATAL);
        }
        Outcome::Interrupted => {
            log::info!("shutting down on signal");
            std::process::exit(EXIT_SIGNAL);
        }
    }
}

enum Outcome {
    Clean,
    Failed(Error),
    Interrupted,
}

/// Enqueues one Call against the Driver and races it against Ctrl-C:
/// a signal closes the driver (cooperative cancellation, §5) and reports
/// `Interrupted` rather than whatever partial error the Call surfaces.
async fn run(config: config::EngineConfig, backend: Arc<dyn backend::Client>, options: options::Options) -> Outcome {
    let driver = Driver::new();
    let config = Arc::new(config);

    let call = match driver.go(config, backend, options).await {
        Ok(call) => call,
        Err(e) => return Outcome::Failed(e),
    };

    let outcome = tokio::select! {
        result = call.wait() => match result {
            Ok(()) => Outcome::Clean,
            Err(Error::Shutdown) => Outcome::Interrupted,
            Err(e) => Outcome::Failed(e),
        },
        _ = tokio::signal::ctrl_c() => {
            call.cancel();
            Outcome::Interrupted
        }
    };

    driver.close().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_reports_shutdown_after_close() {
        let driver = Driver::new();
        driver.close().await;

        let config = Arc::new(config::EngineConfig {
            conf_dir: std::env::temp_dir(),
            prefix: String::new(),
            interval_seconds: 0,
            noop: false,
            sync_only: false,
            keep_stage_file: false,
            pgp_private_key_path: None,
            ignored: Vec::new(),
            log_level: None,
            watch: false,
            file: None,
        });
        let backend: Arc<dyn backend::Client> = Arc::new(backend::EnvBackend::new());

        let result = driver.go(config, backend, options::Options::new()).await;
        assert!(matches!(result, Err(Error::Shutdown)));
    }
}
