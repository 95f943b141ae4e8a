mod engine;
mod events;
mod mq;

use std::path::PathBuf;

use anyhow::Result;
use clap::ArgMatches;

use super::build_cli;
use crate::{context::AppContext, output::OutputFormat};

/// Parse the process arguments and run the selected command.
///
/// # Errors
///
/// Returns the command's error; core errors keep their type so `main` can
/// map them to exit codes.
pub async fn run_cli() -> Result<()> {
    let matches = build_cli().get_matches();
    dispatch(&matches).await
}

/// # Errors
///
/// Returns an error if configuration fails to load or the command fails.
pub async fn dispatch(matches: &ArgMatches) -> Result<()> {
    let format = OutputFormat::from_json_flag(matches.get_flag("json"));
    let config_path = matches.get_one::<PathBuf>("config").cloned();
    let ctx = AppContext::load(config_path, format)?;

    match matches.subcommand() {
        Some(("mq", sub_m)) => mq::handle(sub_m, &ctx).await,
        Some(("engine", sub_m)) => engine::handle(sub_m, &ctx).await,
        Some(("events", sub_m)) => events::handle(sub_m, &ctx).await,
        _ => anyhow::bail!("Unknown command. Run 'refinery --help' for usage."),
    }
}

/// Error message followed by the first cause not already contained in it.
pub fn format_error(err: &anyhow::Error) -> String {
    let msg = err.to_string();
    for cause in err.chain().skip(1) {
        let cause_msg = cause.to_string();
        if !cause_msg.is_empty() && !msg.contains(&cause_msg) {
            return format!("{msg}\nCause: {cause_msg}");
        }
    }
    msg
}

/// Required positional id of a subcommand
fn required_id(matches: &ArgMatches) -> Result<String> {
    matches
        .get_one::<String>("id")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Merge request id required"))
}
