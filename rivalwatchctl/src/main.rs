use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RIVALWATCH_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = rivalwatchctl::Cli::parse();
    if let Err(err) = rivalwatchctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
