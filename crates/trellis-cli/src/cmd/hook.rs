use super::{Ctx, Reported};
use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use std::io::{Read, Write};
use trellis_core::hook::{self, Caller};

#[derive(Subcommand)]
pub enum HookSubcommand {
    /// Entry point for external callers: reads the caller's JSON on stdin,
    /// runs matching hooks and answers in the caller's format
    Run {
        /// engine, git, claude-code, gemini or editor
        #[arg(long)]
        caller: Caller,
        /// Native event name; read from the payload when omitted
        #[arg(long)]
        event: Option<String>,
        /// Arguments git passes to the hook
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// List discovered hook scripts in run order
    List,

    /// Write git hook shims that call 'trellis hook run'
    Install,
}

pub fn run(ctx: &Ctx, subcmd: HookSubcommand) -> anyhow::Result<()> {
    match subcmd {
        HookSubcommand::Run {
            caller,
            event,
            args,
        } => run_hook(ctx, caller, event.as_deref(), args),
        HookSubcommand::List => list(ctx),
        HookSubcommand::Install => install(ctx),
    }
}

fn read_payload(caller: Caller, args: Vec<String>) -> anyhow::Result<serde_json::Value> {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("failed to read hook input from stdin")?;
    if caller == Caller::Git {
        // git feeds ref lines (pre-push) or nothing at all, never JSON.
        return Ok(serde_json::json!({ "args": args, "stdin": raw }));
    }
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(&raw).map_err(|e| {
        anyhow::Error::new(trellis_core::TrellisError::Validation(format!(
            "{caller} hook input is not JSON: {e}"
        )))
    })
}

fn run_hook(ctx: &Ctx, caller: Caller, event: Option<&str>, args: Vec<String>) -> anyhow::Result<()> {
    let payload = read_payload(caller, args)?;
    let engine = ctx.engine()?;
    let cwd = ctx.root.display().to_string();
    let input = hook::normalize(caller, event, payload, &cwd, &ctx.actor)?;

    let agg = engine.hooks().dispatch(&input);
    for result in &agg.results {
        tracing::debug!(
            script = %result.script,
            decision = result.decision.decision.as_str(),
            duration_ms = result.duration_ms,
            "hook script finished"
        );
    }
    let rendered = hook::render(caller, input.event, &agg.decision);
    if let Some(out) = &rendered.stdout {
        let mut stdout = std::io::stdout();
        writeln!(stdout, "{out}")?;
        stdout.flush()?;
    }
    if let Some(err) = &rendered.stderr {
        eprintln!("{err}");
    }
    if rendered.exit_code != 0 {
        return Err(Reported(rendered.exit_code).into());
    }
    Ok(())
}

fn list(ctx: &Ctx) -> anyhow::Result<()> {
    let engine = ctx.engine()?;
    let scripts = engine.hooks().scripts();

    if ctx.json {
        let items: Vec<_> = scripts
            .iter()
            .map(|s| {
                serde_json::json!({
                    "name": s.name,
                    "path": trellis_core::paths::relative(&ctx.root, &s.path),
                    "header": s.header,
                })
            })
            .collect();
        return print_json(&items);
    }
    if scripts.is_empty() {
        println!("No hook scripts.");
        return Ok(());
    }
    let rows = scripts
        .iter()
        .map(|s| {
            vec![
                s.priority().to_string(),
                s.name.clone(),
                s.header.caller.clone(),
                s.header.events.join(","),
                s.header.description.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["PRIO", "NAME", "CALLER", "EVENTS", "DESCRIPTION"], rows);
    Ok(())
}

fn install(ctx: &Ctx) -> anyhow::Result<()> {
    let engine = ctx.engine()?;
    let installed = engine
        .install_git_hooks()
        .context("failed to install git hooks")?;
    if ctx.json {
        return print_json(&serde_json::json!({ "installed": installed }));
    }
    if installed.is_empty() {
        println!("No git hooks installed (existing hooks left untouched).");
    }
    for path in &installed {
        println!("installed: {path}");
    }
    Ok(())
}
