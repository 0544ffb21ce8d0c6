use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = vigiactl::Cli::parse();
    if let Err(err) = vigiactl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
