mod cli;
mod config;
mod engine;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Commands, ConfigCommand, FailureCategory, InputArgs, SimulateArgs};
use reconcile::{ErrorCategory, Reconciler};
use std::io;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub config: Option<std::path::PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        config: cli.config,
    };

    match cli.command {
        Commands::Diff(args) => diff(&ctx, &args),
        Commands::Plan(args) => plan(&ctx, &args),
        Commands::Simulate(args) => simulate(&ctx, &args),
        Commands::Config(cmd) => match cmd {
            ConfigCommand::Show => config_show(&ctx),
            ConfigCommand::Path => {
                println!("{}", config::config_path(ctx.config.as_deref())?.display());
                Ok(())
            }
        },
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "converge", &mut io::stdout());
            Ok(())
        }
    }
}

fn reconciler(ctx: &Context) -> Result<Reconciler> {
    Ok(Reconciler::new(config::load_engine_config(
        ctx.config.as_deref(),
    )?))
}

fn load_inputs(args: &InputArgs) -> Result<(reconcile::ClusterConfig, reconcile::ClusterConfig)> {
    let desired = config::load_tree(&args.desired)?;
    let observed = config::load_tree_or_empty(args.observed.as_deref())?;
    Ok((desired, observed))
}

fn diff(ctx: &Context, args: &InputArgs) -> Result<()> {
    let (desired, observed) = load_inputs(args)?;
    let preview = reconciler(ctx)?.preview(&desired, &observed)?;
    if args.json {
        let report = engine::DiffReport::new(&preview.diff);
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        engine::display_diff(&preview.diff);
    }
    Ok(())
}

fn plan(ctx: &Context, args: &InputArgs) -> Result<()> {
    let (desired, observed) = load_inputs(args)?;
    let preview = reconciler(ctx)?.preview(&desired, &observed)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&preview.plan)?);
    } else {
        if ctx.verbose > 0 {
            engine::display_diff(&preview.diff);
        }
        engine::display_plan(&preview.plan);
    }
    Ok(())
}

fn simulate(ctx: &Context, args: &SimulateArgs) -> Result<()> {
    let (desired, observed) = load_inputs(&args.input)?;
    let engine_config = config::load_engine_config(ctx.config.as_deref())?;
    let failures = args
        .fail
        .iter()
        .map(|arg| engine::parse_failure(arg))
        .collect::<Result<Vec<_>>>()?;

    let opts = engine::SimulateOptions {
        yes: args.yes,
        no_wait: args.no_wait,
        passes: args.passes,
        failures,
        category: match args.fail_as {
            FailureCategory::Transient => ErrorCategory::Transient,
            FailureCategory::Conflict => ErrorCategory::Conflict,
            FailureCategory::NotFound => ErrorCategory::NotFound,
            FailureCategory::Rejected => ErrorCategory::Rejected,
        },
        verbose: ctx.verbose > 0,
    };

    let (summary, state) = engine::simulate(&desired, observed, engine_config, &opts)?;
    if let Some(path) = &args.write_state {
        config::save_tree(path, &state)?;
        if !ctx.quiet {
            ui::success(&format!(
                "Wrote state after {} change(s) to {}",
                summary.total_changes(),
                path.display()
            ));
        }
    }
    Ok(())
}

fn config_show(ctx: &Context) -> Result<()> {
    let path = config::config_path(ctx.config.as_deref())?;
    let config = config::load_engine_config(ctx.config.as_deref())?;

    ui::header("Engine Configuration");
    ui::kv(
        "file",
        &if path.exists() {
            path.display().to_string()
        } else {
            format!("{} (not found, using defaults)", path.display())
        },
    );
    println!();
    ui::info("retry");
    ui::kv("max_attempts", &config.retry.max_attempts.to_string());
    ui::kv("base_delay", &ui::format_duration(config.retry.base_delay()));
    ui::kv("backoff_factor", &config.retry.backoff_factor.to_string());
    ui::kv("max_delay", &ui::format_duration(config.retry.max_delay()));
    ui::info("planner");
    ui::kv("max_batch_size", &config.planner.max_batch_size.to_string());
    ui::kv("allow_removals", &config.planner.allow_removals.to_string());
    if !config.planner.allow_removals {
        ui::dim("Entities missing from the desired configuration are rejected, not removed");
    }
    Ok(())
}
