//! Subcommand handlers.

use crate::{Commands, GlobalArgs};
use anyhow::Context;
use segrun_core::config::{Composer, Composition, Configuration, Overrides};
use segrun_core::registry::{StrategyKind, StrategyRegistry};
use segrun_core::reproducibility::SeedContext;
use segrun_core::training::AgentArgs;
use segrun_core::{Agent, LocalTracker, SubprocessRuntime, Tracker};
use std::sync::Arc;
use tracing::{error, info};

pub async fn handle_command(command: Commands, global: &GlobalArgs) -> anyhow::Result<()> {
    match command {
        Commands::Run { overrides } => handle_run(global, &overrides).await,
        Commands::Config { overrides } => {
            print!("{}", render_config(global, &overrides)?);
            Ok(())
        }
        Commands::Strategies => {
            let registry = StrategyRegistry::with_builtins()?;
            print!("{}", render_strategies(&registry));
            Ok(())
        }
    }
}

fn composer(global: &GlobalArgs) -> Composer {
    match &global.config {
        Some(path) => Composer::new().with_file(path),
        None => Composer::new(),
    }
}

fn compose(global: &GlobalArgs, pairs: &[String]) -> anyhow::Result<Composition> {
    let overrides = Overrides::parse(pairs)?;
    Ok(composer(global).compose(&overrides)?)
}

fn render_config(global: &GlobalArgs, pairs: &[String]) -> anyhow::Result<String> {
    let Composition { config, .. } = compose(global, pairs)?;
    Ok(config.to_toml()?)
}

fn render_strategies(registry: &StrategyRegistry) -> String {
    let mut out = String::new();
    for kind in [StrategyKind::Agent, StrategyKind::Model, StrategyKind::DataModule] {
        out.push_str(&format!("{kind}s:\n"));
        for name in registry.names(kind) {
            out.push_str(&format!("  {name}\n"));
        }
    }
    out
}

async fn handle_run(global: &GlobalArgs, pairs: &[String]) -> anyhow::Result<()> {
    let Composition { config, seeds } = compose(global, pairs)?;

    let tracker = Arc::new(
        LocalTracker::create(&config.run.save_dir, &config)
            .context("Failed to start tracking run")?,
    );
    let result = drive(global, config, seeds, &tracker).await;
    tracker.finish()?;

    match result {
        Ok(summary) => {
            println!("{summary}");
            println!("Run {} finished", tracker.run_id());
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Run failed");
            Err(e.context(format!("Run {} failed", tracker.run_id())))
        }
    }
}

/// Everything between opening and closing the tracking run.
async fn drive(
    global: &GlobalArgs,
    mut config: Configuration,
    seeds: SeedContext,
    tracker: &Arc<LocalTracker>,
) -> anyhow::Result<String> {
    let remote = tracker.remote_overrides()?;
    if !remote.is_empty() {
        config.apply_remote_overrides(&remote)?;
        info!(count = remote.len(), "Applied remote overrides");
        tracker.record_config(&config)?;
        tracker.log("config", serde_json::to_value(&config)?)?;
    }

    let registry = Arc::new(StrategyRegistry::with_builtins()?);
    let runtime = SubprocessRuntime::python(&global.trainer, &global.run_dir)
        .with_program(&global.python);
    let args = AgentArgs {
        config: Arc::new(config),
        seeds,
        registry: Arc::clone(&registry),
        runtime: Arc::new(runtime),
        tracker: tracker.clone(),
    };

    let mut agent = registry.agents.resolve(&args.config.run.agent, &args)?;
    let result = agent.run().await;
    agent.finalize();
    info!(state = %agent.state(), "Agent done");

    let metrics = result?;
    Ok(serde_json::to_string_pretty(&metrics)?)
}
