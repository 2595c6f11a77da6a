use clap::Parser;

fn main() -> anyhow::Result<()> {
    let cli = competitive_analysis_cli::Cli::parse();
    competitive_analysis_cli::init_tracing(cli.log_json())?;
    competitive_analysis_cli::run_cli(cli)
}
