// src/main.rs

use runguard::{cli, logging, run};

#[tokio::main]
async fn main() {
    let args = cli::parse();
    if let Err(err) = logging::init_logging(args.log_level) {
        eprintln!("runguard logging setup failed: {err:?}");
        std::process::exit(2);
    }

    match run(args).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("runguard error: {err:?}");
            std::process::exit(2);
        }
    }
}
