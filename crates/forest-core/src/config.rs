//! Router configuration, loaded from a TOML file with CLI overrides
//! layered on top (§1 ambient stack, §6).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::packet_store::{DEFAULT_MAX_BUFFERS, DEFAULT_MAX_DESCRIPTORS};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub router_name: String,
    pub my_adr: String,
    pub my_zip: i32,
    #[serde(default)]
    pub working_dir: PathBuf,
    #[serde(default = "default_max_descriptors")]
    pub max_descriptors: usize,
    #[serde(default = "default_max_buffers")]
    pub max_buffers: usize,
    #[serde(default = "default_log_capacity")]
    pub packet_log_capacity: usize,
    #[serde(default = "default_control_threads")]
    pub control_threads: usize,
}

fn default_max_descriptors() -> usize {
    DEFAULT_MAX_DESCRIPTORS
}

fn default_max_buffers() -> usize {
    DEFAULT_MAX_BUFFERS
}

fn default_log_capacity() -> usize {
    4096
}

fn default_control_threads() -> usize {
    10
}

impl RouterConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let cfg: RouterConfig = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        Ok(cfg)
    }

    pub fn ifaces_path(&self) -> PathBuf {
        self.working_dir.join("ifaces.txt")
    }

    pub fn links_path(&self) -> PathBuf {
        self.working_dir.join("links.txt")
    }

    pub fn comtrees_path(&self) -> PathBuf {
        self.working_dir.join("comtrees.txt")
    }

    pub fn routes_path(&self) -> PathBuf {
        self.working_dir.join("routes.txt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_in_defaults() {
        let toml = r#"
            router_name = "r1"
            my_adr = "1.1"
            my_zip = 1
        "#;
        let cfg: RouterConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.control_threads, 10);
        assert_eq!(cfg.max_descriptors, DEFAULT_MAX_DESCRIPTORS);
    }
}
