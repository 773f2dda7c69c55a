//! Optional YAML configuration file
//!
//! Values here fill in whatever was not given on the command line or in the
//! environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default)]
    pub server: ServerFileConfig,

    #[serde(default)]
    pub agent: AgentFileConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    pub listen: Option<String>,
    pub tunnel_id: Option<String>,
    pub token: Option<String>,
    pub peer_token: Option<String>,
    #[serde(default)]
    pub peers: Vec<String>,
    pub connect_url: Option<String>,
    pub cluster_address_header: Option<String>,
    pub index_header: Option<String>,
    pub index_path_prefix: Option<String>,
    pub proxy_prefix: Option<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub ca_file: Option<String>,
    pub insecure: Option<bool>,
    pub plain_peers: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentFileConfig {
    pub cluster_id: Option<String>,
    pub token: Option<String>,
    pub proxy: Option<String>,
    pub local_endpoint: Option<String>,
    pub proxy_token: Option<String>,
    pub cluster_address_header: Option<String>,
    pub ca_file: Option<String>,
    pub insecure: Option<bool>,
    pub metrics_addr: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse YAML config")
    }
}
