mod cmd_file;
mod cmd_stream;
mod error;
mod helpers;

use std::env;
use std::process;

use crate::error::{CliError, CliResult, EXIT_CORRUPT, EXIT_FAILURE, EXIT_USAGE};

/// One subcommand: dispatch target plus its help text.
struct CommandEntry {
    name: &'static str,
    usage: &'static str,
    description: &'static str,
    run: fn(&[String]) -> CliResult,
}

const VERSION: &str = env!("CARGO_PKG_VERSION");

const COMMANDS: &[CommandEntry] = &[
    CommandEntry {
        name: "info",
        usage: "ddff info <ddff-file>",
        description: "Show the stream table: block size, block count, first and last block",
        run: cmd_file::cmd_info,
    },
    CommandEntry {
        name: "ls",
        usage: "ddff ls <ddff-file>",
        description: "List named streams from the inventory",
        run: cmd_stream::cmd_ls,
    },
    CommandEntry {
        name: "tags",
        usage: "ddff tags <ddff-file>",
        description: "List recorded segments",
        run: cmd_stream::cmd_tags,
    },
    CommandEntry {
        name: "cat",
        usage: "ddff cat <ddff-file> <key>",
        description: "Print the contents of a named stream to stdout",
        run: cmd_stream::cmd_cat,
    },
    CommandEntry {
        name: "verify",
        usage: "ddff verify <ddff-file>",
        description: "Check block chains, checksums and block numbering",
        run: cmd_file::cmd_verify,
    },
];

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let code = match run(&args) {
        Ok(()) => 0,
        Err(e) if e.is_broken_pipe() => 0,
        Err(e) => {
            eprintln!("ddff: {}", e);
            if matches!(e, CliError::UnknownCommand(_)) {
                print_usage();
            }
            e.exit_code()
        }
    };
    process::exit(code);
}

fn run(args: &[String]) -> CliResult {
    let Some(first) = args.first() else {
        print_usage();
        return Err(CliError::Usage("ddff <command> [args...]"));
    };
    match first.as_str() {
        "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        "--version" | "-V" => {
            println!("ddff {}", VERSION);
            Ok(())
        }
        "help" => match args.get(1) {
            Some(name) => {
                let cmd = find_command(name)?;
                println!("{}\n\n  {}", cmd.usage, cmd.description);
                Ok(())
            }
            None => {
                print_usage();
                Ok(())
            }
        },
        name => (find_command(name)?.run)(&args[1..]),
    }
}

fn find_command(name: &str) -> Result<&'static CommandEntry, CliError> {
    COMMANDS
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| CliError::UnknownCommand(name.to_string()))
}

fn print_usage() {
    eprintln!("Usage: ddff <command> [args...]");
    eprintln!();
    eprintln!("Inspect DDFF block files. Files are always opened read-only.");
    eprintln!();
    eprintln!("Commands:");

    let max_usage_len = COMMANDS.iter().map(|c| c.usage.len()).max().unwrap_or(0);
    for cmd in COMMANDS {
        eprintln!("  {:<width$}  {}", cmd.usage, cmd.description, width = max_usage_len);
    }

    eprintln!();
    eprintln!("Options:");
    eprintln!("  --help, -h       Show this help message");
    eprintln!("  --version, -V    Show version");
    eprintln!();
    eprintln!("Exit status:");
    eprintln!("  0  success");
    eprintln!("  {}  failure (missing file, lock held, I/O error)", EXIT_FAILURE);
    eprintln!("  {}  bad command line", EXIT_USAGE);
    eprintln!("  {}  damaged file (checksum, chain or record errors)", EXIT_CORRUPT);
}
