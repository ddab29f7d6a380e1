pub mod config;
pub mod hook;
pub mod init;
pub mod issue;
pub mod lint;
pub mod transition;

use anyhow::Context;
use std::fmt;
use std::path::PathBuf;
use trellis_core::Engine;

/// Global flags every subcommand sees.
pub struct Ctx {
    pub root: PathBuf,
    pub json: bool,
    pub actor: String,
    pub bypass_hooks: bool,
    pub yes: bool,
}

impl Ctx {
    pub fn engine(&self) -> anyhow::Result<Engine> {
        let engine = Engine::open(&self.root)
            .with_context(|| format!("failed to open project at {}", self.root.display()))?;
        Ok(engine.with_bypass_hooks(self.bypass_hooks))
    }
}

/// The command already printed its own result; exit with this code.
#[derive(Debug)]
pub struct Reported(pub i32);

impl fmt::Display for Reported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit status {}", self.0)
    }
}

impl std::error::Error for Reported {}
