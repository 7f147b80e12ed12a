use std::{io::IsTerminal, process::exit};

use anyhow::Context;
use clap::Parser;
use flicker::{
    compiler::CompileOptions, samples, ExitPolicy, LanguageVersion, Pipeline, PipelineConfig,
    SourceUnit,
};
use tracing::{debug, error, Level};

/// Compiles the built-in program, loads it into a fresh context, runs its
/// entry point and unloads it again.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Always exit with status 0.
    #[arg(long)]
    legacy_exit_status: bool,

    /// Treat every warning as an error.
    #[arg(long)]
    warnings_as_errors: bool,

    /// Language version the program is compiled as (v1 or v2).
    #[arg(long, default_value_t = LanguageVersion::LATEST)]
    language_version: LanguageVersion,

    /// Log more; repeat for more detail.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Accepted and ignored.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    rest: Vec<String>,
}

fn init_tracing(verbose: u8) -> anyhow::Result<()> {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .try_init()
        .map_err(anyhow::Error::msg)
        .context("installing the log subscriber")
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose)?;
    debug!(ignored = ?args.rest, "process arguments");

    let config = PipelineConfig {
        compile: CompileOptions {
            warnings_as_errors: args.warnings_as_errors,
            ..CompileOptions::default()
        },
        exit_policy: if args.legacy_exit_status {
            ExitPolicy::Legacy
        } else {
            ExitPolicy::Reflect
        },
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::builder().config(config).build();

    let source = SourceUnit::new(samples::FILTERED_ECHO, args.language_version);
    let outcome = pipeline.run(&source);
    let code = pipeline.exit_code(&outcome);
    if let Err(e) = outcome {
        let e = anyhow::Error::new(e).context("run did not complete");
        error!("{e:#}");
        eprintln!("error: {e:#}");
    }
    if code != 0 {
        exit(code);
    }
    Ok(())
}
