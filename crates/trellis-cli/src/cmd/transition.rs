use super::Ctx;
use crate::output::print_json;
use trellis_core::config::IsolationMode;
use trellis_core::engine::TransitionOutcome;
use trellis_core::workflow::TransitionRequest;
use trellis_core::Action;

/// Per-action arguments beyond the issue id.
#[derive(Default)]
pub struct Extra {
    pub solution: Option<String>,
    pub message: Option<String>,
    pub isolation: Option<IsolationMode>,
}

pub fn run(ctx: &Ctx, id: &str, action: Action, extra: Extra) -> anyhow::Result<()> {
    let mut engine = ctx.engine()?;
    let mut req = TransitionRequest::new(id, action, ctx.actor.as_str());
    req.solution = extra.solution;
    req.message = extra.message;
    req.options.isolation = extra.isolation;
    req.options.auto_confirm = ctx.yes;

    let out = engine.transition(&req)?;
    if ctx.json {
        return print_json(&out);
    }
    print_outcome(&out);
    Ok(())
}

fn print_outcome(out: &TransitionOutcome) {
    if out.noop {
        println!(
            "{}: nothing to do ({})",
            out.id,
            out.reason.as_deref().unwrap_or("already there")
        );
        return;
    }
    println!("{}: {} -> {}", out.id, out.from, out.to);
    if let Some(iso) = &out.isolation {
        match &iso.worktree {
            Some(dir) => println!("  worktree: {dir} (branch {})", iso.branch),
            None => println!("  branch:   {}", iso.branch),
        }
    }
    if let Some(commit) = &out.commit {
        let short: String = commit.chars().take(10).collect();
        println!("  merged:   {short} ({} file(s))", out.merged_files.len());
    }
    for v in &out.verification {
        println!("  verified: {} ({} ms)", v.name, v.duration_ms);
    }
    for w in &out.warnings {
        println!("  warning:  [{}] {}", w.rule, w.message);
    }
    let next = match out.action {
        Action::Start => Some(format!("trellis sync {} && trellis submit {}", out.id, out.id)),
        Action::Submit => Some(format!("trellis close {}", out.id)),
        Action::Reject => Some(format!("trellis submit {}", out.id)),
        _ => None,
    };
    if let Some(next) = next {
        println!("Next: {next}");
    }
}
