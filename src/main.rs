//! GG-ORCHESTRATOR entry point.
//!
//! Loads configuration, wires the orchestrator, serves the control plane
//! and shuts down on Ctrl-C.

mod cli_parser;
mod runtime_init;

use std::process::ExitCode;

use gg_orchestrator::cli::run_status;
use gg_orchestrator::config;

use cli_parser::{flag_value, has_flag};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("serve");

    match command {
        "serve" | "" => {
            runtime_init::init_tracing();
            runtime_init::run_serve(flag_value(&args, "--config"), has_flag(&args, "--simulate")).await
        }
        "status" => {
            let sp = flag_value(&args, "--socket")
                .map(str::to_string)
                .unwrap_or_else(config::socket_path_from_env);
            ExitCode::from(run_status(&sp, has_flag(&args, "--json")).await as u8)
        }
        "config" => run_config_cmd(&args),
        "help" | "--help" | "-h" => {
            if let Some(sub) = args.get(2) {
                cli_parser::print_command_help(sub);
            } else {
                cli_parser::print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("GG-ORCHESTRATOR {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            cli_parser::print_usage();
            ExitCode::FAILURE
        }
    }
}

fn run_config_cmd(args: &[String]) -> ExitCode {
    let sub = args.get(2).map(|s| s.as_str()).unwrap_or("validate");
    match sub {
        "validate" => {
            match config::load(flag_value(args, "--config"), has_flag(args, "--simulate")) {
                Ok(cfg) => {
                    println!(
                        "Configuration valid: {} models, {} backends, {} agents, {} routing rules",
                        cfg.models.len(),
                        cfg.backends.len(),
                        cfg.agents.catalog.len(),
                        cfg.routing.rules.len()
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Configuration invalid: {}", e);
                    ExitCode::from(2u8)
                }
            }
        }
        "example" => {
            print!("{}", config::DEMO_CONFIG);
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown config subcommand: {}", sub);
            cli_parser::print_command_help("config");
            ExitCode::FAILURE
        }
    }
}
