use std::process::ExitCode;

use bellows::{PipelineError, cli, logging};

fn main() -> ExitCode {
    let args = cli::parse();
    logging::init_logging(args.log_level);

    match bellows::run(args) {
        Ok(true) => ExitCode::SUCCESS,
        // At least one task failed; the summary already named it.
        Ok(false) => ExitCode::from(1),
        Err(e @ (PipelineError::Config(_) | PipelineError::Graph(_))) => {
            eprintln!("bellows error: {e}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("bellows error: {e}");
            ExitCode::from(1)
        }
    }
}
