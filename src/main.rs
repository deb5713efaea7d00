// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;

use clap::Parser;
use daemonize::Daemonize;

use real_controller::collaborators::Collaborator;
use real_controller::config::{self, Cli};
use real_controller::engine::{Engine, EngineConfig};
use real_controller::logging;
use real_controller::reactor;

fn daemonize() -> anyhow::Result<()> {
    Daemonize::new()
        .pid_file("/var/run/real-controller.pid")
        .chown_pid_file(true)
        .working_directory("/")
        .umask(0o027)
        .start()
        .map_err(|e| anyhow::anyhow!("failed to daemonize: {e}"))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.daemon {
        daemonize()?;
    }
    logging::init(cli.daemon, &cli.log_path);

    let loaded = config::load(&cli)?;
    tracing::info!(self_host = loaded.hosts.self_id, n_nodes = loaded.n_nodes, "real-controller starting");
    loaded.topology.log_debug_dump();

    let self_host_entry = loaded
        .hosts
        .hosts
        .iter()
        .find(|h| h.id == loaded.hosts.self_id)
        .expect("config::load already validated self_id is present");
    let listen_port = self_host_entry.port;

    let links = reactor::spawn_remote_links(loaded.hosts.self_id, &loaded.hosts.hosts, listen_port);
    let remotes: HashMap<u32, _> = links.iter().map(|(id, (remote, _))| (*id, remote.clone())).collect();

    let engine_config = EngineConfig {
        nthreads: cli.nthreads,
        max_runtime: cli.max_runtime(),
        self_host: loaded.hosts.self_id,
        log_path: cli.log_path.clone(),
    };
    let collaborator = Collaborator::new(cli.image, cli.log_path.clone());
    let engine = Engine::new(engine_config, loaded.topology, loaded.n_nodes, collaborator, remotes);

    let worker_ctrl = reactor::spawn_workers(engine.clone());

    let socket_path = std::path::PathBuf::from("/opt/lwc/volumes/ripc/msg_manager_socket");
    reactor::spawn_acceptor(engine.clone(), socket_path, worker_ctrl.clone());

    let remote_channels: HashMap<u32, _> = links.into_iter().map(|(id, (remote, _))| (id, remote)).collect();
    reactor::run_main_loop(engine, &remote_channels, &worker_ctrl);

    Ok(())
}
