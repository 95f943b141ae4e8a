//! Refinery CLI - local merge queue
//!
//! Binary name: `refinery`

use std::process;

use refinery::{
    cli::handlers::{format_error, run_cli},
    setup,
};

#[tokio::main]
async fn main() {
    if let Err(e) = setup::init_tracing() {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("Warning: {e}");
        }
    }

    if let Err(err) = run_cli().await {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("Error: {}", format_error(&err));
        }

        let code = err
            .downcast_ref::<refinery_core::Error>()
            .map_or(1, refinery_core::Error::exit_code);

        #[allow(clippy::exit)]
        process::exit(code);
    }
}
