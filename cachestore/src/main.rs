//! Entrypoint of the cachestore binary

use cachestore_clap_blocks::tokio::TokioConfig;
use dotenvy::dotenv;

mod commands {
    pub(crate) mod load;
    pub(crate) mod serve;
}

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "cachestore",
    version,
    about = "Caching data server and load generator",
    long_about = r#"Caching data server and load generator

Examples:
    # Run a server with in-memory storage, listening for update queues on port 7000
    cachestore serve --update-queue-bind 127.0.0.1:7000

    # Run three nodes against an in-process server for a minute
    cachestore load --nodes 3 --duration 1m

    # Run with full debug logging specified with LOG_FILTER
    LOG_FILTER=debug cachestore load
"#
)]
struct Config {
    #[clap(flatten)]
    runtime_config: TokioConfig,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Parser)]
enum Command {
    /// Run the caching server
    Serve(commands::serve::Config),

    /// Run a random workload on nodes of an in-process cluster
    Load(commands::load::Config),
}

fn main() -> Result<(), std::io::Error> {
    #[cfg(unix)]
    install_crash_handler();

    load_dotenv();

    let config: Config = clap::Parser::parse();

    let tokio_runtime = config.runtime_config.builder().build()?;

    tokio_runtime.block_on(async move {
        match config.command {
            None => println!("command required, -h/--help for help"),
            Some(Command::Serve(config)) => {
                init_logs(&config.logging_config);
                if let Err(e) = commands::serve::command(config).await {
                    eprintln!("Serve command failed: {e:#}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Load(config)) => {
                init_logs(&config.logging_config);
                if let Err(e) = commands::load::command(config).await {
                    eprintln!("Load command failed: {e:#}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
        }
    });

    Ok(())
}

fn init_logs(config: &cachestore_clap_blocks::logging::LoggingConfig) {
    if let Err(e) = config.install_global_subscriber("info") {
        eprintln!("Initializing logs failed: {e}");
        std::process::exit(ReturnCode::Failure as _);
    }
}

/// Source the .env file before parsing the config, so that its variables act as
/// defaults. Variables already in the environment win.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(ReturnCode::Failure as _);
        }
    };
}

#[cfg(unix)]
fn install_crash_handler() {
    unsafe {
        set_signal_handler(libc::SIGSEGV, signal_handler);
        set_signal_handler(libc::SIGILL, signal_handler);
        set_signal_handler(libc::SIGBUS, signal_handler);
    }
}

#[cfg(unix)]
unsafe extern "C" fn signal_handler(sig: i32) {
    use backtrace::Backtrace;
    let name = std::thread::current()
        .name()
        .map(|n| format!(" for thread \"{n}\""))
        .unwrap_or_default();
    eprintln!("Signal {sig}, Stack trace{name}\n{:?}", Backtrace::new());
    std::process::abort();
}

#[cfg(unix)]
unsafe fn set_signal_handler(signal: libc::c_int, handler: unsafe extern "C" fn(libc::c_int)) {
    use libc::{sigaction, sigfillset, sighandler_t};
    unsafe {
        let mut sigset = std::mem::zeroed();

        // Block all signals during the handler
        if sigfillset(&mut sigset) != -1 {
            let mut action: sigaction = std::mem::zeroed();
            action.sa_mask = sigset;
            action.sa_sigaction = handler as sighandler_t;
            sigaction(signal, &action, std::ptr::null_mut());
        }
    }
}
