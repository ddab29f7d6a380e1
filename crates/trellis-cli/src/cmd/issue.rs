use super::Ctx;
use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::ValueEnum;
use trellis_core::engine::{CreateRequest, IssueView};
use trellis_core::issue::CheckMark;
use trellis_core::query::{Filter, Query};
use trellis_core::types::{Criticality, RelationKind, Stage, Status};
use trellis_core::Issue;

#[derive(Clone, Copy, ValueEnum)]
pub enum LinkKind {
    Parent,
    DependsOn,
    Related,
}

impl From<LinkKind> for RelationKind {
    fn from(kind: LinkKind) -> Self {
        match kind {
            LinkKind::Parent => RelationKind::Parent,
            LinkKind::DependsOn => RelationKind::Dependency,
            LinkKind::Related => RelationKind::Related,
        }
    }
}

pub struct CreateArgs {
    pub issue_type: String,
    pub title: String,
    pub parent: Option<String>,
    pub depends_on: Vec<String>,
    pub related: Vec<String>,
    pub domains: Vec<String>,
    pub tags: Vec<String>,
    pub files: Vec<String>,
    pub criticality: Option<Criticality>,
}

pub fn create(ctx: &Ctx, args: CreateArgs) -> anyhow::Result<()> {
    let mut engine = ctx.engine()?;
    let issue = engine
        .create(&CreateRequest {
            issue_type: args.issue_type,
            title: args.title,
            actor: ctx.actor.clone(),
            parent: args.parent,
            dependencies: args.depends_on,
            related: args.related,
            domains: args.domains,
            tags: args.tags,
            files: args.files,
            criticality: args.criticality,
            auto_confirm: ctx.yes,
        })
        .context("failed to create issue")?;
    let path = engine.store().locate(&issue.meta.id)?;

    if ctx.json {
        return print_json(&serde_json::json!({
            "id": issue.meta.id,
            "path": trellis_core::paths::relative(&ctx.root, &path),
            "issue": issue.meta,
        }));
    }
    println!("Created {}: {}", issue.meta.id, issue.meta.title);
    println!("  {}", trellis_core::paths::relative(&ctx.root, &path));
    println!("Next: trellis start {}", issue.meta.id);
    Ok(())
}

pub fn list(
    ctx: &Ctx,
    issue_type: Option<String>,
    status: Option<Status>,
    stage: Option<String>,
    query: Option<String>,
) -> anyhow::Result<()> {
    let engine = ctx.engine()?;
    let filter = Filter {
        issue_type,
        status,
        stage: stage.map(Stage::new),
        query: query.map(|q| Query::parse(&q)).filter(|q| !q.is_empty()),
    };
    let issues = engine.list(&filter).context("failed to list issues")?;

    if ctx.json {
        let metas: Vec<_> = issues.iter().map(|i| &i.meta).collect();
        return print_json(&metas);
    }
    if issues.is_empty() {
        println!("No issues.");
        return Ok(());
    }
    let rows = issues.iter().map(row).collect();
    print_table(&["ID", "STATUS", "STAGE", "CRIT", "TITLE"], rows);
    Ok(())
}

fn row(issue: &Issue) -> Vec<String> {
    let m = &issue.meta;
    vec![
        m.id.clone(),
        m.status.to_string(),
        m.stage.to_string(),
        m.criticality.as_str().to_string(),
        m.title.clone(),
    ]
}

pub fn show(ctx: &Ctx, id: &str) -> anyhow::Result<()> {
    let engine = ctx.engine()?;
    let view = engine.show(id)?;
    if ctx.json {
        return print_json(&view);
    }
    print_view(&view);
    Ok(())
}

fn print_view(view: &IssueView) {
    let m = &view.meta;
    println!("{}: {}", m.id, m.title);
    println!("  type:     {}", m.issue_type);
    println!("  state:    {}/{}", m.status, m.stage);
    println!("  path:     {}", view.path);
    if let Some(parent) = &m.parent {
        println!("  parent:   {parent}");
    }
    let lists = [
        ("children", &view.children),
        ("blockers", &view.blockers),
        ("blocks", &view.dependents),
        ("related", &view.related),
        ("files", &m.files),
    ];
    for (label, items) in lists {
        if !items.is_empty() {
            println!("  {label:<9} {}", items.join(", "));
        }
    }
    if let Some(iso) = &m.isolation {
        let state = if view.isolation_present { "" } else { " (missing)" };
        println!("  branch:   {}{state}", iso.branch);
    }
    if let Some(solution) = &m.solution {
        println!("  solution: {solution}");
    }
    if let Some(marker) = &m.recovery {
        println!("  RECOVERY: {} ({})", marker.reason, marker.at.format("%Y-%m-%d %H:%M"));
    }
    if !view.checklist.is_empty() {
        println!();
        for (i, item) in view.checklist.iter().enumerate() {
            println!("  {:>2}. [{}] {}", i + 1, item.mark.as_char(), item.text);
        }
    }
    for fb in &m.feedback {
        println!();
        println!("  feedback from {} at {}:", fb.actor, fb.at.format("%Y-%m-%d %H:%M"));
        println!("    {}", fb.message);
    }
}

pub fn link(ctx: &Ctx, id: &str, kind: LinkKind, target: &str) -> anyhow::Result<()> {
    let mut engine = ctx.engine()?;
    let issue = engine.link(id, kind.into(), target, &ctx.actor)?;
    report_edit(ctx, &issue, &format!("linked {id} -> {target} ({})", RelationKind::from(kind)))
}

pub fn unlink(ctx: &Ctx, id: &str, kind: LinkKind, target: &str) -> anyhow::Result<()> {
    let mut engine = ctx.engine()?;
    let issue = engine.unlink(id, kind.into(), target, &ctx.actor)?;
    report_edit(ctx, &issue, &format!("unlinked {id} -> {target} ({})", RelationKind::from(kind)))
}

pub fn check(ctx: &Ctx, id: &str, index: usize, mark: CheckMark) -> anyhow::Result<()> {
    let mut engine = ctx.engine()?;
    let issue = engine.check_item(id, index, mark, &ctx.actor)?;
    report_edit(ctx, &issue, &format!("{id}: item {index} marked [{}]", mark.as_char()))
}

pub fn note(ctx: &Ctx, id: &str, message: &str) -> anyhow::Result<()> {
    let mut engine = ctx.engine()?;
    let issue = engine.note(id, message, &ctx.actor)?;
    report_edit(ctx, &issue, &format!("{id}: note added"))
}

fn report_edit(ctx: &Ctx, issue: &Issue, summary: &str) -> anyhow::Result<()> {
    if ctx.json {
        return print_json(&issue.meta);
    }
    println!("{summary}");
    Ok(())
}

pub fn sync(ctx: &Ctx, id: &str) -> anyhow::Result<()> {
    let mut engine = ctx.engine()?;
    let out = engine.sync(id, &ctx.actor)?;
    if ctx.json {
        return print_json(&out);
    }
    println!("{}: {} tracked file(s)", out.id, out.files.len());
    for f in &out.added {
        println!("  + {f}");
    }
    for f in &out.removed {
        println!("  - {f}");
    }
    Ok(())
}

pub fn delete(ctx: &Ctx, id: &str, reason: &str, force: bool) -> anyhow::Result<()> {
    let mut engine = ctx.engine()?;
    let out = engine.delete(id, reason, force, &ctx.actor)?;
    if ctx.json {
        return print_json(&out);
    }
    println!("Deleted {} ({})", out.id, out.path);
    if !out.referrers.is_empty() {
        println!("  dangling references left in: {}", out.referrers.join(", "));
        println!("  run 'trellis lint' to find them");
    }
    Ok(())
}

pub fn recover(ctx: &Ctx, id: &str) -> anyhow::Result<()> {
    let mut engine = ctx.engine()?;
    let issue = engine.recover(id, &ctx.actor)?;
    report_edit(ctx, &issue, &format!("{id}: recovery marker cleared"))
}
