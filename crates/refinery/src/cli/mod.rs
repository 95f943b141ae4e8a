pub mod handlers;

use clap::{value_parser, Arg, ArgAction, Command};

pub fn build_cli() -> Command {
    Command::new("refinery")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Local merge queue: submit branches, run the refinery engine")
        .subcommand_required(true)
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Write machine-readable JSON to stdout"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_name("PATH")
                .value_parser(value_parser!(std::path::PathBuf))
                .help("Config file (default: .refinery/config.toml)"),
        )
        .subcommand(cmd_mq())
        .subcommand(cmd_engine())
        .subcommand(cmd_events())
}

fn id_arg() -> Arg {
    Arg::new("id").required(true).help("Merge request id")
}

fn cmd_mq() -> Command {
    Command::new("mq")
        .about("Manage merge requests")
        .subcommand_required(true)
        .subcommand(
            Command::new("submit")
                .about("Submit a branch to the merge queue")
                .arg(
                    Arg::new("branch")
                        .long("branch")
                        .short('b')
                        .required(true)
                        .help("Source branch to merge"),
                )
                .arg(
                    Arg::new("target")
                        .long("target")
                        .short('t')
                        .help("Target branch (default: configured default_target)"),
                )
                .arg(Arg::new("issue").long("issue").help("Source issue this MR resolves"))
                .arg(Arg::new("worker").long("worker").help("Producing worker (default: REFINERY_WORKER)"))
                .arg(Arg::new("title").long("title").help("Title (default: branch name)"))
                .arg(
                    Arg::new("priority")
                        .long("priority")
                        .short('p')
                        .value_parser(value_parser!(i32))
                        .allow_negative_numbers(true)
                        .default_value("2")
                        .help("Priority, lower merges first"),
                )
                .arg(
                    Arg::new("agent-bead")
                        .long("agent-bead")
                        .help("Actor record whose back-reference is cleared on merge"),
                ),
        )
        .subcommand(
            Command::new("list").about("List merge requests in queue order").arg(
                Arg::new("unclaimed")
                    .long("unclaimed")
                    .action(ArgAction::SetTrue)
                    .help("Only records without an active claim"),
            ),
        )
        .subcommand(Command::new("queue").about("Show the processing queue with positions"))
        .subcommand(Command::new("show").about("Show one merge request").arg(id_arg()))
        .subcommand(Command::new("count").about("Count stored merge requests"))
        .subcommand(Command::new("claim").about("Claim a merge request for REFINERY_WORKER").arg(id_arg()))
        .subcommand(Command::new("release").about("Release the claim on a merge request").arg(id_arg()))
        .subcommand(Command::new("remove").about("Delete a merge request record").arg(id_arg()))
}

fn cmd_engine() -> Command {
    Command::new("engine")
        .about("Run and control the refinery engine")
        .subcommand_required(true)
        .subcommand(
            Command::new("run").about("Process the queue until interrupted").arg(
                Arg::new("once")
                    .long("once")
                    .action(ArgAction::SetTrue)
                    .help("Run a single cycle and exit"),
            ),
        )
        .subcommand(Command::new("status").about("Show engine status"))
        .subcommand(Command::new("pause").about("Pause every engine on this queue"))
        .subcommand(Command::new("resume").about("Resume paused engines"))
}

fn cmd_events() -> Command {
    Command::new("events")
        .about("Show the merge event log")
        .arg(
            Arg::new("tail")
                .long("tail")
                .short('n')
                .value_parser(value_parser!(usize))
                .help("Only the last N events"),
        )
        .arg(Arg::new("rig").long("rig").help("Rig whose log to read (default: configured rig)"))
}
