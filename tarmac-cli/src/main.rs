/*!
The `tarmac` binary wraps the core library with a small set of commands
for registering machines, managing key files, and driving archives.
Archive payloads are opaque byte streams on stdin/stdout; pairing them
with a tar front end is left to the caller.
*/

mod archive;
mod cli;
mod keys;
mod register;

use anyhow::Result;
use cli::{Command, Opt};
use structopt::StructOpt;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("tarmac: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let options = Opt::from_args();
    let command = options.command.clone();
    match command {
        Command::Keygen {
            user,
            machine,
            root_key,
        } => register::keygen(&options, &user, &machine, root_key.as_deref()),
        Command::Keyregen {
            oldkey,
            user,
            machine,
        } => register::keyregen(&options, &oldkey, &user, &machine),
        Command::Keymgmt {
            outkeyfile,
            read_only,
            write_only,
            delete_only,
            keyfile,
        } => keys::keymgmt(&outkeyfile, read_only, write_only, delete_only, &keyfile),
        Command::Create {
            archive,
            input,
            dry_run,
            print_stats,
        } => archive::create(&options, &archive, input.as_deref(), dry_run, print_stats),
        Command::Extract { archive, output } => {
            archive::extract(&options, &archive, output.as_deref())
        }
        Command::List => archive::list(&options),
        Command::Delete {
            archive,
            print_stats,
        } => archive::delete(&options, &archive, print_stats),
        Command::Fsck { prune } => archive::fsck(&options, prune),
        Command::Nuke => archive::nuke(&options),
        Command::PrintStats => archive::print_stats(&options),
    }
}
