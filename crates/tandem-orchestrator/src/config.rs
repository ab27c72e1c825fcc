use crate::assignment::AssignmentPolicy;
use crate::executor::ShellExecutorConfig;
use crate::profiles::default_agents;
use crate::types::AgentSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tandem_core::TandemResult;

/// Contents of `tandem.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TandemConfig {
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub executor: Option<ShellExecutorConfig>,
    #[serde(default)]
    pub scheduling: AssignmentPolicy,
}

impl TandemConfig {
    pub fn from_toml_str(input: &str) -> TandemResult<Self> {
        Ok(toml::from_str(input)?)
    }

    /// Read and parse a config file. Relative agent working directories and
    /// the executor's project root are resolved against the file's directory,
    /// which is also the project root when none is set.
    pub async fn load(path: &Path) -> TandemResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut config = Self::from_toml_str(&content)?;
        let base = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        config.resolve_paths(base);
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for agent in &mut self.agents {
            if let Some(dir) = &agent.working_dir {
                if dir.is_relative() {
                    agent.working_dir = Some(base.join(dir));
                }
            }
        }
        if let Some(executor) = &mut self.executor {
            executor.project_root = Some(match executor.project_root.take() {
                Some(root) if root.is_relative() => base.join(root),
                Some(root) => root,
                None => base.to_path_buf(),
            });
        }
    }

    /// Configured agents, or the built-in specialists when none are declared.
    pub fn agent_specs(&self) -> Vec<AgentSpec> {
        if self.agents.is_empty() {
            default_agents()
        } else {
            self.agents.clone()
        }
    }

    /// Agent specs with working directories placed under `root`.
    pub fn agent_specs_under(&self, root: &Path) -> Vec<AgentSpec> {
        self.agent_specs()
            .into_iter()
            .map(|mut spec| {
                if let Some(dir) = spec.working_dir.take() {
                    spec.working_dir = Some(if dir.is_relative() {
                        root.join(dir)
                    } else {
                        dir
                    });
                }
                spec
            })
            .collect()
    }
}

/// Default config file name looked up in the working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("tandem.toml")
}
