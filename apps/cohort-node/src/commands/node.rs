use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use cohort_core::{load_config, Config, Coordination, OccurrenceContext};
use cohort_events::Bus;
use cohort_kernel::{Kernel, OccurrenceId};

#[derive(Args, Clone)]
pub struct NodeArgs {
    /// Config file (TOML); defaults apply when omitted
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Occurrence id; overrides the config file and COHORT_OCCURRENCE_ID
    #[arg(long, global = true)]
    pub occurrence: Option<String>,
    /// Directory holding the shared store; overrides COHORT_STATE_DIR
    #[arg(long, global = true, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,
}

/// One occurrence wired to the shared store.
pub struct Node {
    pub config: Config,
    pub coordination: Coordination,
    pub ctx: OccurrenceContext,
}

impl NodeArgs {
    pub fn config(&self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => load_config(&path.to_string_lossy())
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::default(),
        }
        .with_env_overrides();
        if let Some(id) = &self.occurrence {
            cfg.occurrence.id = Some(id.clone());
        }
        if let Some(dir) = &self.state_dir {
            cfg.store.dir = Some(dir.to_string_lossy().into_owned());
        }
        Ok(cfg)
    }

    pub fn open(&self) -> Result<Node> {
        let config = self.config()?;
        let raw_id = config.occurrence_id().ok_or_else(|| {
            anyhow!("no occurrence id; pass --occurrence or set COHORT_OCCURRENCE_ID")
        })?;
        let occurrence = OccurrenceId::new(raw_id).context("invalid occurrence id")?;
        let dir = config.state_dir();
        let kernel = Kernel::open_with(&dir, config.kernel_options())
            .with_context(|| format!("opening store in {}", dir.display()))?;
        let coordination = Coordination::new(kernel, Bus::default(), &config)?;
        Ok(Node {
            config,
            coordination,
            ctx: OccurrenceContext::system(occurrence),
        })
    }
}
