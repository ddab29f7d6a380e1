use super::Ctx;
use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use trellis_core::config::{Config, WarnLevel};

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Validate the config for common mistakes
    Validate,

    /// Print the effective configuration, defaults included
    Show,
}

pub fn run(ctx: &Ctx, subcmd: ConfigSubcommand) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Validate => validate(ctx),
        ConfigSubcommand::Show => show(ctx),
    }
}

fn read_config(ctx: &Ctx) -> anyhow::Result<Config> {
    // Config::load rejects error-level problems; validate wants to list them.
    let path = trellis_core::paths::config_path(&ctx.root);
    if !path.exists() {
        return Ok(Config::default());
    }
    let data = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))
}

fn validate(ctx: &Ctx) -> anyhow::Result<()> {
    let config = read_config(ctx)?;
    let warnings = config.validate();

    if ctx.json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!(trellis_core::TrellisError::Config(
            "config validation found errors".into()
        ));
    }
    Ok(())
}

fn show(ctx: &Ctx) -> anyhow::Result<()> {
    let config = Config::load(&ctx.root).context("failed to load config")?;
    if ctx.json {
        return print_json(&config);
    }
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
