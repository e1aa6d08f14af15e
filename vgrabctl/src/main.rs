use clap::Parser;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = vgrabctl::Cli::parse();
    if let Err(err) = vgrabctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
