use clap::Parser;
use owo_colors::OwoColorize;
use switchover_orchestrator::args::Args;
use switchover_orchestrator::error::Error;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    switchover_common::init();
    let format = match args.parsed_log_format() {
        Ok(format) => format,
        Err(e) => {
            eprintln!("{}", e.to_string().red());
            std::process::exit(1);
        }
    };
    switchover_common::logging::init(format, args.verbose);

    if let Err(e) = switchover_orchestrator::run(args).await {
        eprintln!("\n{} {e}", "error:".red().bold());
        match &e {
            Error::Cancelled(_) => {
                eprintln!("The active phase was interrupted; rerun the same command to resume.");
            }
            Error::Validation(_) | Error::Security(_) => {
                eprintln!("Fix the reported input and rerun.");
            }
            _ => {
                eprintln!(
                    "Fix the reported condition and rerun the same command; completed steps are \
                     skipped automatically. Add --force only to re-execute completed steps."
                );
            }
        }
        std::process::exit(e.exit_code());
    }
}
