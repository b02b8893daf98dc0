use prosper_core::{
    error, info,
    log::{Logger, init_logger},
};
use prosperd_lib::{
    args::parse_args,
    daemon::{Daemon, run_until_interrupted},
};

pub fn main() {
    let args = parse_args();

    if let Err(err) = init_logger(args.logdir.as_deref(), &args.log_level) {
        eprintln!("{err}");
        std::process::exit(1);
    }
    let logger = Logger::global("prosperd");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(logger, "Failed to start the async runtime: {}", err);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        let daemon = Daemon::new(&args, logger.clone())?;
        run_until_interrupted(daemon, logger.clone()).await
    });
    if let Err(err) = result {
        error!(logger, "{}", err);
        std::process::exit(1);
    }
    info!(logger, "Prosperd has stopped...");
}

