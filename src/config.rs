//! CLI surface and top-level configuration loading.
//!
//! The positional argument order is the external CLI contract:
//! `controller <image> <conf> <log-path> <nthreads> <max-runtime-sec>
//! <hosts-file>`. Argument parsing style follows
//! `examples/zebra-rs-zebra-rs/zebra-rs/src/main.rs`'s `Arg` (clap
//! derive), generalized from flags to positionals since this CLI's
//! shape is fixed by the original tool rather than negotiable.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::collaborators::Image;
use crate::error::ConfigError;
use crate::topology::{self, Blueprint, HostsFile, PartitionFile, Topology};

#[derive(Parser, Debug)]
#[command(author, version, about = "Centralized controller for time-compressed BGP emulation replay")]
pub struct Cli {
    /// Which emulated router image's shell commands the collaborator uses.
    #[arg(value_enum)]
    pub image: Image,

    /// Directory containing blueprint.json and (optionally) partition.json.
    pub conf: PathBuf,

    /// Output directory, not a file: tracing's file sink, the
    /// collaborator's execution log, and the stage-transition timestamp
    /// files all land under it.
    pub log_path: PathBuf,

    pub nthreads: usize,

    pub max_runtime_sec: u64,

    pub hosts_file: PathBuf,

    /// Run as a background daemon (syslog logging, detached).
    #[arg(short, long)]
    pub daemon: bool,
}

impl Cli {
    pub fn max_runtime(&self) -> Option<Duration> {
        if self.max_runtime_sec == 0 {
            None
        } else {
            Some(Duration::from_secs(self.max_runtime_sec))
        }
    }
}

pub struct LoadedConfig {
    pub topology: Topology,
    pub hosts: HostsFile,
    pub n_nodes: usize,
}

pub fn load(cli: &Cli) -> Result<LoadedConfig, ConfigError> {
    let blueprint: Blueprint = topology::load_blueprint(&cli.conf)?;
    let partitions: PartitionFile = topology::load_partitions(&cli.conf, &blueprint)?;
    let hosts: HostsFile = topology::load_hosts(&cli.hosts_file)?;

    if !hosts.hosts.iter().any(|h| h.id == hosts.self_id) {
        return Err(ConfigError::MissingSelfHost(hosts.self_id));
    }

    let n_nodes = blueprint.nodes.iter().map(|n| n.id).max().unwrap_or(0).max(0) as usize;
    let n_hosts = hosts.hosts.len() as u32;
    let self_host = hosts.self_id;
    let topology = Topology::build(blueprint, partitions, self_host, n_hosts)?;

    Ok(LoadedConfig { topology, hosts, n_nodes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_self_host_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut bp = std::fs::File::create(dir.path().join("blueprint.json")).unwrap();
        writeln!(bp, r#"{{"nodes":[{{"id":1,"neighbors":[2]}},{{"id":2,"neighbors":[1]}}]}}"#).unwrap();
        let hosts_path = dir.path().join("hosts.json");
        std::fs::write(&hosts_path, r#"{"hosts":[{"id":1,"ip":"127.0.0.1","port":9000}],"self_id":0}"#).unwrap();

        let cli = Cli {
            image: Image::Frr,
            conf: dir.path().to_path_buf(),
            log_path: dir.path().join("log"),
            nthreads: 2,
            max_runtime_sec: 0,
            hosts_file: hosts_path,
            daemon: false,
        };
        let err = load(&cli).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSelfHost(0)));
    }
}
