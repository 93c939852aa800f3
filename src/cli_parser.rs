//! CLI argument helpers and help text for GG-ORCHESTRATOR.

/// Value following `flag` (`--config PATH`) or joined (`--config=PATH`).
pub fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let mut iter = args.iter().skip(2);
    while let Some(arg) = iter.next() {
        if arg == flag {
            return iter.next().map(|s| s.as_str());
        }
        if let Some(value) = arg.strip_prefix(flag).and_then(|rest| rest.strip_prefix('=')) {
            return Some(value);
        }
    }
    None
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().skip(2).any(|a| a == flag)
}

/// Print general usage information.
pub fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "GG-ORCHESTRATOR - VRAM-aware model lifecycle and routing core v{}

USAGE:
    gg-orchestrator [COMMAND] [OPTIONS]

COMMANDS:
    serve        Run the control-plane server (default when no command given)
    status       Show model, agent and backend health
    config       Validate or print configuration
    version      Show version information
    help         Show this help message

EXAMPLES:
    gg-orchestrator serve --config /etc/gg/orchestrator.toml
    gg-orchestrator serve --simulate        # demo catalog, simulated agents
    gg-orchestrator status --json
    gg-orchestrator config validate --config orchestrator.toml

ENVIRONMENT:
    GG_ORCH_CONFIG        Configuration file path
    GG_ORCH_SOCKET_PATH   Control-plane socket path
    GG_ORCH_LOG_FORMAT    Log format (text, json)
    RUST_LOG              Log filter (debug, info, warn, error)

EXIT CODES:
    0  Success
    1  Failure
    2  Configuration error
    3  Connection error
",
        version
    );
}

/// Print detailed help for a specific command.
pub fn print_command_help(command: &str) {
    match command {
        "serve" => print_serve_help(),
        "status" => print_status_help(),
        "config" => print_config_help(),
        _ => {
            eprintln!(
                "No detailed help available for '{}'. Use 'gg-orchestrator help' for general usage.",
                command
            );
        }
    }
}

fn print_serve_help() {
    eprintln!(
        "gg-orchestrator serve - Run the control-plane server

USAGE:
    gg-orchestrator serve [OPTIONS]

OPTIONS:
    --config FILE  Load configuration from file
    --simulate     Use simulated agents; without --config, the bundled demo catalog

DESCRIPTION:
    Validates configuration (a cyclic agent graph aborts startup), starts the
    VRAM monitor, agent supervisor and health reporter, and serves control-plane
    requests until Ctrl-C.
"
    );
}

fn print_status_help() {
    eprintln!(
        "gg-orchestrator status - Show orchestrator health

USAGE:
    gg-orchestrator status [OPTIONS]

OPTIONS:
    --socket PATH  Override control-plane socket path
    --json         Output in JSON format

EXIT CODES:
    0  Status retrieved
    1  Server returned an error
    3  Connection error
"
    );
}

fn print_config_help() {
    eprintln!(
        "gg-orchestrator config - Manage configuration

USAGE:
    gg-orchestrator config <SUBCOMMAND> [OPTIONS]

SUBCOMMANDS:
    validate       Validate configuration without serving (exit 2 if invalid)
    example        Print the bundled example configuration

OPTIONS:
    --config FILE  Configuration file to validate
"
    );
}
