use anyhow::Result;
use clap::ArgMatches;

use crate::{commands::engine, context::AppContext};

pub async fn handle(matches: &ArgMatches, ctx: &AppContext) -> Result<()> {
    match matches.subcommand() {
        Some(("run", sub_m)) => {
            if sub_m.get_flag("once") {
                engine::run_once(ctx).await
            } else {
                engine::run(ctx).await
            }
        }
        Some(("status", _)) => engine::status(ctx).await,
        Some(("pause", _)) => engine::pause(ctx).await,
        Some(("resume", _)) => engine::resume(ctx).await,
        _ => anyhow::bail!("Unknown engine subcommand. Run 'refinery engine --help' for usage."),
    }
}
