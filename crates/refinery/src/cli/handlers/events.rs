use anyhow::Result;
use clap::ArgMatches;

use crate::{
    commands::events::{self, EventsOptions},
    context::AppContext,
};

pub async fn handle(matches: &ArgMatches, ctx: &AppContext) -> Result<()> {
    let options = EventsOptions {
        tail: matches.get_one::<usize>("tail").copied(),
        rig: matches.get_one::<String>("rig").cloned(),
    };
    events::run(ctx, &options).await
}
