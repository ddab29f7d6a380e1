use super::{Ctx, Reported};
use crate::output::{print_json, print_table};
use trellis_core::engine::ArchiveRequest;
use trellis_core::governance::Severity;

pub fn lint(ctx: &Ctx, fix: bool) -> anyhow::Result<()> {
    let mut engine = ctx.engine()?;
    let out = engine.lint(fix, &ctx.actor)?;

    if ctx.json {
        print_json(&out)?;
    } else {
        for record in &out.fixed {
            for change in &record.changes {
                println!("fixed {}: {change}", record.id);
            }
        }
        if out.findings.is_empty() {
            println!("{} record(s) checked, no findings.", out.checked);
        } else {
            let rows = out
                .findings
                .iter()
                .map(|f| {
                    let severity = match f.severity {
                        Severity::Error => "error",
                        Severity::Warning => "warning",
                    };
                    let fix = if f.fixable { "fixable" } else { "" };
                    vec![
                        f.issue.clone(),
                        severity.to_string(),
                        f.rule.clone(),
                        fix.to_string(),
                        f.message.clone(),
                    ]
                })
                .collect();
            print_table(&["ISSUE", "SEVERITY", "RULE", "FIX", "MESSAGE"], rows);
            println!();
            println!("{} record(s) checked, {} finding(s).", out.checked, out.findings.len());
        }
    }

    if !out.passed {
        return Err(Reported(3).into());
    }
    Ok(())
}

pub fn archive(
    ctx: &Ctx,
    ids: Vec<String>,
    older_than_days: Option<u32>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let mut engine = ctx.engine()?;
    let moved = engine.archive(&ArchiveRequest {
        ids,
        older_than_days,
        dry_run,
        actor: ctx.actor.clone(),
    })?;

    if ctx.json {
        return print_json(&serde_json::json!({ "dry_run": dry_run, "archived": moved }));
    }
    if moved.is_empty() {
        println!("Nothing to archive.");
        return Ok(());
    }
    let verb = if dry_run { "would archive" } else { "archived" };
    for entry in &moved {
        println!("{verb} {}: {} -> {}", entry.id, entry.from, entry.to);
    }
    Ok(())
}
