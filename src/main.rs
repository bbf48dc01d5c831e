use anyhow::Context;
use clap::Parser;
use srvsh::config::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    srvsh::init_logging(cli.log_level);

    let code = srvsh::run_script(&cli.script).context("run script")?;
    std::process::exit(code);
}
