//! Process-spawn shims for the emulated-router collaborator: start,
//! stop, restart, and route-dump shell commands, one thread per node.
//!
//! Treated as an external, out-of-scope collaborator; grounded on
//! `original_source/controller/node_ops.cpp`'s per-node dispatch and
//! shell-command templates.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum Image {
    Frr,
    Bird,
    Crpd,
}

impl Image {
    fn start_cmd(self, node: i32) -> String {
        match self {
            Image::Frr => format!("/opt/lwc/bin/start_frr.sh {node}"),
            Image::Bird => format!("/opt/lwc/bin/start_bird.sh {node}"),
            Image::Crpd => format!("/opt/lwc/bin/start_crpd.sh {node}"),
        }
    }

    fn stop_cmd(self, node: i32) -> String {
        format!("/opt/lwc/bin/stop_node.sh {node}")
    }

    fn restart_cmd(self, node: i32) -> String {
        match self {
            Image::Frr => format!("/opt/lwc/bin/restart_frr.sh {node}"),
            Image::Bird => format!("/opt/lwc/bin/restart_bird.sh {node}"),
            Image::Crpd => format!("/opt/lwc/bin/restart_crpd.sh {node}"),
        }
    }

    fn export_cmd(self, node: i32, tag: &str) -> String {
        match self {
            Image::Frr => format!("/opt/lwc/bin/dump_frr_routes.sh {node} {tag}"),
            Image::Bird => format!("/opt/lwc/bin/dump_bird_routes.sh {node} {tag}"),
            Image::Crpd => format!("/opt/lwc/bin/dump_crpd_routes.sh {node} {tag}"),
        }
    }
}

/// Dispatches one shell command per node on its own thread and waits for
/// all of them; a node whose command fails only logs a warning (a dead
/// router process must not stall the stage machine). Every invocation
/// is additionally appended to `log_path/switch_pods.log`, timestamped,
/// matching `node_ops.cpp`'s `execInst()`.
pub struct Collaborator {
    image: Image,
    log_path: PathBuf,
}

impl Collaborator {
    pub fn new(image: Image, log_path: PathBuf) -> Self {
        Collaborator { image, log_path }
    }

    fn dispatch(&self, nodes: &[i32], cmd_for: impl Fn(i32) -> String + Sync) {
        std::thread::scope(|scope| {
            for &node in nodes {
                let cmd_str = cmd_for(node);
                scope.spawn(move || run_one(node, &cmd_str, &self.log_path));
            }
        });
    }

    pub fn start_nodes(&self, nodes: &[i32]) {
        self.dispatch(nodes, |n| self.image.start_cmd(n));
    }

    pub fn restart_nodes(&self, nodes: &[i32]) {
        self.dispatch(nodes, |n| self.image.restart_cmd(n));
    }

    pub fn stop_nodes(&self, nodes: &[i32]) {
        self.dispatch(nodes, |n| self.image.stop_cmd(n));
    }

    /// Dumps routes for `nodes`, tagged with `tag` (either a running
    /// counter or `"final"`). Large node sets are sampled down to their
    /// first two and last two (by id), matching the original's
    /// flood-avoidance optimization for big partitions.
    pub fn export_routes(&self, nodes: &[i32], tag: &str) {
        let mut sorted: Vec<i32> = nodes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let n = sorted.len();
        let sampled: Vec<i32> = sorted
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| *idx < 2 || idx + 2 >= n)
            .map(|(_, node)| node)
            .collect();
        self.dispatch(&sampled, |n| self.image.export_cmd(n, tag));
    }
}

fn exec_log_ts() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

fn log_exec(log_path: &Path, line: &str) {
    let path = log_path.join("switch_pods.log");
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(mut f) => {
            if let Err(e) = writeln!(f, "{line}") {
                tracing::warn!(path = %path.display(), error = %e, "failed to append to collaborator exec log");
            }
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to open collaborator exec log");
        }
    }
}

fn run_one(node: i32, cmd_str: &str, log_path: &Path) {
    let ts = exec_log_ts();
    match Command::new("sh").arg("-c").arg(cmd_str).output() {
        Ok(output) if output.status.success() => {
            log_exec(log_path, &format!("{ts:.6}: {cmd_str}"));
        }
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            log_exec(
                log_path,
                &format!("{ts:.6}: {cmd_str}\nReturn code: {:?}\nStdout:\n{stdout}", output.status.code()),
            );
            tracing::warn!(node, cmd_str, code = output.status.code(), "collaborator command exited non-zero");
        }
        Err(e) => {
            log_exec(log_path, &format!("{ts:.6}: Failed to run command `{cmd_str}`: {e}"));
            tracing::error!(node, cmd_str, error = %e, "failed to spawn collaborator command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_cmd_is_templated_per_image() {
        assert!(Image::Frr.start_cmd(7).contains("start_frr.sh 7"));
        assert!(Image::Bird.start_cmd(7).contains("start_bird.sh 7"));
        assert!(Image::Crpd.start_cmd(7).contains("start_crpd.sh 7"));
    }

    #[test]
    fn dispatch_runs_for_every_node() {
        let dir = tempfile::tempdir().unwrap();
        let collab = Collaborator::new(Image::Frr, dir.path().to_path_buf());
        // `true` never fails, exercising the dispatch path without
        // depending on any image binary being installed.
        collab.dispatch(&[1, 2, 3], |_| "true".to_string());
        let log = std::fs::read_to_string(dir.path().join("switch_pods.log")).unwrap();
        assert_eq!(log.lines().count(), 3);
    }

    #[test]
    fn export_routes_samples_large_node_sets() {
        let dir = tempfile::tempdir().unwrap();
        let collab = Collaborator::new(Image::Frr, dir.path().to_path_buf());
        let nodes: Vec<i32> = (1..=10).collect();
        // first two (1, 2) and last two (9, 10) each emit two export
        // commands (summary + routes), the middle six are skipped.
        collab.export_routes(&nodes, "3");
        let log = std::fs::read_to_string(dir.path().join("switch_pods.log")).unwrap();
        assert_eq!(log.lines().count(), 4);
        assert!(log.contains("dump_frr_routes.sh 1 3"));
        assert!(log.contains("dump_frr_routes.sh 10 3"));
        assert!(!log.contains("dump_frr_routes.sh 5 3"));
    }
}
