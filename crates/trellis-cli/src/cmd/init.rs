use super::Ctx;
use crate::output::print_json;
use anyhow::Context;
use trellis_core::Engine;

pub fn run(ctx: &Ctx, hooks: bool) -> anyhow::Result<()> {
    let project = ctx
        .root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());

    let created = Engine::init(&ctx.root, &project)
        .with_context(|| format!("failed to initialise {}", ctx.root.display()))?;

    let installed = if hooks {
        ctx.engine()?
            .install_git_hooks()
            .context("failed to install git hooks")?
    } else {
        Vec::new()
    };

    if ctx.json {
        return print_json(&serde_json::json!({
            "root": ctx.root.display().to_string(),
            "created": created,
            "git_hooks": installed,
        }));
    }

    println!("Initialized trellis in: {}", ctx.root.display());
    if created.is_empty() {
        println!("  nothing to do, already set up");
    }
    for path in &created {
        println!("  created: {path}");
    }
    for path in &installed {
        println!("  hook:    {path}");
    }
    println!("Next: trellis create feature \"<title>\"");
    Ok(())
}
