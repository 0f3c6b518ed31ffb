use anyhow::Result;
use clap::Parser;

mod cli;
mod fw;
mod link;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    init_logging(args.verbose);
    match args.cmd {
        cli::Cmd::Resources { protocol } => link::resources(protocol.as_deref()),
        cli::Cmd::Probe(opts) => link::probe(&opts),
        cli::Cmd::Get(opts) => link::get(&opts),
        cli::Cmd::Set(opts) => link::set(&opts),
        cli::Cmd::Capture(opts) => link::capture(&opts),
        cli::Cmd::Fw(opts) => fw::run(opts.action),
        cli::Cmd::Sim(opts) => link::serve(&opts),
    }
}
