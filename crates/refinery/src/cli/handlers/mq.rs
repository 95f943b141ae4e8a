use anyhow::Result;
use clap::ArgMatches;

use super::required_id;
use crate::{
    commands::mq::{self, SubmitOptions},
    context::AppContext,
};

pub async fn handle(matches: &ArgMatches, ctx: &AppContext) -> Result<()> {
    match matches.subcommand() {
        Some(("submit", sub_m)) => mq::submit(ctx, &submit_options(sub_m)?).await,
        Some(("list", sub_m)) => mq::list(ctx, sub_m.get_flag("unclaimed")).await,
        Some(("queue", _)) => mq::queue(ctx).await,
        Some(("show", sub_m)) => mq::show(ctx, &required_id(sub_m)?).await,
        Some(("count", _)) => mq::count(ctx).await,
        Some(("claim", sub_m)) => mq::claim(ctx, &required_id(sub_m)?).await,
        Some(("release", sub_m)) => mq::release(ctx, &required_id(sub_m)?).await,
        Some(("remove", sub_m)) => mq::remove(ctx, &required_id(sub_m)?).await,
        _ => anyhow::bail!("Unknown mq subcommand. Run 'refinery mq --help' for usage."),
    }
}

fn submit_options(matches: &ArgMatches) -> Result<SubmitOptions> {
    let get = |name: &str| matches.get_one::<String>(name).cloned();
    Ok(SubmitOptions {
        branch: get("branch").ok_or_else(|| anyhow::anyhow!("--branch is required"))?,
        target: get("target"),
        issue: get("issue"),
        worker: get("worker"),
        title: get("title"),
        priority: matches.get_one::<i32>("priority").copied().unwrap_or(2),
        agent_bead: get("agent-bead"),
    })
}
