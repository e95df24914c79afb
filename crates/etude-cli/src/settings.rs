//! Configuration layering: defaults, then the TOML file, then `ETUDE_*`
//! variables, then command-line flags.

use crate::Cli;
use anyhow::Context;
use etude_core::ServerConfig;
use std::path::Path;

pub fn load_file(path: &Path) -> anyhow::Result<ServerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
}

pub fn resolve(
    cli: &Cli,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<ServerConfig> {
    let base = match &cli.config {
        Some(path) => load_file(path)?,
        None => ServerConfig::default(),
    };
    let mut config = base.merge_from(lookup).context("invalid ETUDE_* variable")?;

    config.port = cli.port;
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(root) = &cli.root {
        config.doc_root = root.clone();
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(max_requests) = cli.max_requests {
        config.max_requests = max_requests;
    }
    if let Some(timeslot) = cli.timeslot {
        config.set_timeslot(timeslot);
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}
