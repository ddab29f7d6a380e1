mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand,
    hook::HookSubcommand,
    issue::{CreateArgs, LinkKind},
    transition::Extra,
    Ctx, Reported,
};
use std::path::PathBuf;
use trellis_core::config::IsolationMode;
use trellis_core::issue::CheckMark;
use trellis_core::types::{Criticality, Status};
use trellis_core::{Action, TrellisError};

#[derive(Parser)]
#[command(
    name = "trellis",
    about = "Git-native issue workflow: records, transitions, governance and hooks",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .trellis/ or .git/)
    #[arg(long, global = true, env = "TRELLIS_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Skip every hook script (audited)
    #[arg(long, global = true)]
    bypass_hooks: bool,

    /// Who is acting, recorded in the audit log
    #[arg(long, global = true, env = "TRELLIS_ACTOR")]
    actor: Option<String>,

    /// Answer yes when a hook asks for confirmation
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize trellis in the current project
    Init {
        /// Also install git hook shims
        #[arg(long)]
        git_hooks: bool,
    },

    /// Create an issue
    Create {
        /// Issue type from the registry, e.g. feature
        #[arg(value_name = "TYPE")]
        issue_type: String,
        title: String,
        #[arg(long)]
        parent: Option<String>,
        #[arg(long = "depends-on", value_name = "ID")]
        depends_on: Vec<String>,
        #[arg(long, value_name = "ID")]
        related: Vec<String>,
        #[arg(long = "domain")]
        domains: Vec<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Files this issue will change
        #[arg(long = "file")]
        files: Vec<String>,
        #[arg(long)]
        criticality: Option<Criticality>,
    },

    /// List issues
    List {
        #[arg(long = "type", value_name = "TYPE")]
        issue_type: Option<String>,
        #[arg(long)]
        status: Option<Status>,
        #[arg(long)]
        stage: Option<String>,
        /// +must -exclude ~nice terms
        #[arg(long, short = 'q', allow_hyphen_values = true)]
        query: Option<String>,
    },

    /// Show one issue with its relations and checklist
    Show { id: String },

    /// Add a relation
    Link {
        id: String,
        kind: LinkKind,
        target: String,
    },

    /// Remove a relation
    Unlink {
        id: String,
        kind: LinkKind,
        target: String,
    },

    /// Mark the Nth checklist item (x done, - in progress, ! blocked, open)
    Check {
        id: String,
        index: usize,
        #[arg(long, default_value = "x")]
        mark: CheckMark,
    },

    /// Append a review note
    Note { id: String, message: String },

    /// Begin work: isolation branch or worktree, stage -> active
    Start {
        id: String,
        #[arg(long)]
        isolation: Option<IsolationMode>,
    },

    /// Hand in for review (governance gate and verification)
    Submit { id: String },

    /// Send back from review with feedback
    Reject {
        id: String,
        #[arg(long, short = 'm')]
        message: String,
    },

    /// Close: gate, scoped squash merge into trunk, cleanup
    Close {
        id: String,
        /// e.g. implemented, cancelled, wontfix, duplicate
        #[arg(long)]
        solution: Option<String>,
    },

    /// Park in the backlog
    Shelve { id: String },

    /// Bring back from the backlog
    Pull { id: String },

    /// Set tracked files from the isolation branch diff
    Sync { id: String },

    /// Check every record against the governance rules
    Lint {
        /// Apply mechanical fixes
        #[arg(long)]
        fix: bool,
    },

    /// Move closed issues into archived/
    Archive {
        /// Archive these issues regardless of age
        ids: Vec<String>,
        #[arg(long)]
        older_than_days: Option<u32>,
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete an issue record (snapshot kept in the audit log)
    Delete {
        id: String,
        #[arg(long)]
        reason: String,
        /// Delete even when other issues reference it
        #[arg(long)]
        force: bool,
    },

    /// Clear a needs-manual-recovery marker
    Recover { id: String },

    /// Run, list or install hooks
    Hook {
        #[command(subcommand)]
        subcommand: HookSubcommand,
    },

    /// Validate or print the project configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn default_actor() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let ctx = Ctx {
        root: root::resolve_root(cli.root.as_deref()),
        json: cli.json,
        actor: cli.actor.unwrap_or_else(default_actor),
        bypass_hooks: cli.bypass_hooks,
        yes: cli.yes,
    };

    let step = |id: &str, action: Action, extra: Extra| cmd::transition::run(&ctx, id, action, extra);
    let result = match cli.command {
        Commands::Init { git_hooks } => cmd::init::run(&ctx, git_hooks),
        Commands::Create {
            issue_type,
            title,
            parent,
            depends_on,
            related,
            domains,
            tags,
            files,
            criticality,
        } => cmd::issue::create(
            &ctx,
            CreateArgs {
                issue_type,
                title,
                parent,
                depends_on,
                related,
                domains,
                tags,
                files,
                criticality,
            },
        ),
        Commands::List {
            issue_type,
            status,
            stage,
            query,
        } => cmd::issue::list(&ctx, issue_type, status, stage, query),
        Commands::Show { id } => cmd::issue::show(&ctx, &id),
        Commands::Link { id, kind, target } => cmd::issue::link(&ctx, &id, kind, &target),
        Commands::Unlink { id, kind, target } => cmd::issue::unlink(&ctx, &id, kind, &target),
        Commands::Check { id, index, mark } => cmd::issue::check(&ctx, &id, index, mark),
        Commands::Note { id, message } => cmd::issue::note(&ctx, &id, &message),
        Commands::Start { id, isolation } => step(
            &id,
            Action::Start,
            Extra {
                isolation,
                ..Default::default()
            },
        ),
        Commands::Submit { id } => step(&id, Action::Submit, Extra::default()),
        Commands::Reject { id, message } => step(
            &id,
            Action::Reject,
            Extra {
                message: Some(message),
                ..Default::default()
            },
        ),
        Commands::Close { id, solution } => step(
            &id,
            Action::Close,
            Extra {
                solution,
                ..Default::default()
            },
        ),
        Commands::Shelve { id } => step(&id, Action::Shelve, Extra::default()),
        Commands::Pull { id } => step(&id, Action::Pull, Extra::default()),
        Commands::Sync { id } => cmd::issue::sync(&ctx, &id),
        Commands::Lint { fix } => cmd::lint::lint(&ctx, fix),
        Commands::Archive {
            ids,
            older_than_days,
            dry_run,
        } => cmd::lint::archive(&ctx, ids, older_than_days, dry_run),
        Commands::Delete { id, reason, force } => cmd::issue::delete(&ctx, &id, &reason, force),
        Commands::Recover { id } => cmd::issue::recover(&ctx, &id),
        Commands::Hook { subcommand } => cmd::hook::run(&ctx, subcommand),
        Commands::Config { subcommand } => cmd::config::run(&ctx, subcommand),
    };

    if let Err(e) = result {
        std::process::exit(report_error(&e, ctx.json));
    }
}

/// Print the error in the requested format and pick the exit code.
fn report_error(e: &anyhow::Error, json: bool) -> i32 {
    if let Some(Reported(code)) = e.downcast_ref::<Reported>() {
        return *code;
    }
    let core = e.chain().find_map(|c| c.downcast_ref::<TrellisError>());

    if json {
        let mut body = serde_json::json!({
            "code": core.map(|c| c.code()).unwrap_or("internal"),
            "message": format!("{e:#}"),
        });
        if let Some(c) = core {
            body["suggestion"] = serde_json::json!(c.suggestion());
            match c {
                TrellisError::Governance { findings, .. } => body["findings"] = serde_json::json!(findings),
                TrellisError::Conflict { paths, .. } => body["paths"] = serde_json::json!(paths),
                TrellisError::HookDenied { reason, .. } => body["reason"] = serde_json::json!(reason),
                _ => {}
            }
        }
        println!("{}", serde_json::json!({ "error": body }));
    } else {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        if let Some(c) = core {
            if let TrellisError::Governance { findings, .. } = c {
                for f in findings {
                    eprintln!("  [{}] {}: {}", f.rule, f.issue, f.message);
                }
            }
            if let TrellisError::Conflict { paths, .. } = c {
                for p in paths {
                    eprintln!("  conflict: {p}");
                }
            }
            eprintln!("hint: {}", c.suggestion());
        }
    }
    core.map(TrellisError::exit_code).unwrap_or(1)
}
