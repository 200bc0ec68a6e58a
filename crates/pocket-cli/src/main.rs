use clap::Parser;
use pocket_cli::{init_tracing, run, Cli};

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut stdout = std::io::stdout().lock();
    if let Err(e) = run(cli, &mut stdout) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
