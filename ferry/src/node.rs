//! One node: a kernel plus both gateways wired to real sockets.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::info;

use kern::{Clock, EnvId, Errno, Kern, ProgramRegistry};

use crate::client::{ClientConfig, ClientGateway};
use crate::server::ServerGateway;
use crate::{GCTIME, RETRIES, SPORT};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address peers reach this node at; also the listen address.
    pub addr: Ipv4Addr,
    /// Server gateway port; zero binds an ephemeral port.
    #[serde(default = "default_port")]
    pub serv_port: u16,
    /// Where this node ships environments that ask to migrate.
    pub lease_to: SocketAddrV4,
    #[serde(default = "default_gc_time")]
    pub gc_time_ms: u32,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_port() -> u16 {
    SPORT
}

fn default_gc_time() -> u32 {
    GCTIME
}

fn default_retries() -> u32 {
    RETRIES
}

pub struct Node {
    kern: Arc<Kern>,
    client: Arc<ClientGateway>,
    server: Arc<ServerGateway>,
    serv_addr: SocketAddrV4,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bind the server socket, register both gateway slots, and start their
    /// threads.
    pub fn start(
        cfg: NodeConfig,
        programs: ProgramRegistry,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Node> {
        let kern = Kern::new(clock, programs);

        let listener = TcpListener::bind(SocketAddrV4::new(cfg.addr, cfg.serv_port))
            .with_context(|| format!("binding server gateway on {}:{}", cfg.addr, cfg.serv_port))?;
        let serv_addr = match listener.local_addr()? {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(a) => bail!("unexpected v6 listener address {a}"),
        };

        let server = ServerGateway::new(kern.clone(), cfg.gc_time_ms)
            .map_err(|e| anyhow::anyhow!("registering server gateway: {e}"))?;
        let client = ClientGateway::new(
            kern.clone(),
            ClientConfig {
                my_ip: cfg.addr,
                my_serv_port: serv_addr.port(),
                lease_to: cfg.lease_to,
                retries: cfg.retries,
            },
        )
        .map_err(|e| anyhow::anyhow!("registering client gateway: {e}"))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        {
            let server = server.clone();
            let flag = shutdown.clone();
            threads.push(
                thread::Builder::new()
                    .name("ferry-server".into())
                    .spawn(move || server.run(listener, flag))?,
            );
        }
        {
            let client = client.clone();
            threads.push(
                thread::Builder::new()
                    .name("ferry-client".into())
                    .spawn(move || client.run())?,
            );
        }

        // Give the client gateway a moment to park in receive so early
        // migrate calls do not bounce off an absent listener.
        let ready_by = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while std::time::Instant::now() < ready_by {
            match kern.env_snapshot(client.env_id()) {
                Ok(rec) if rec.ipc_recving => break,
                _ => thread::sleep(std::time::Duration::from_millis(2)),
            }
        }

        info!(target: "node", "node up at {serv_addr}, leasing to {}", cfg.lease_to);
        Ok(Node {
            kern,
            client,
            server,
            serv_addr,
            shutdown,
            threads,
        })
    }

    pub fn kern(&self) -> &Arc<Kern> {
        &self.kern
    }

    pub fn client(&self) -> &Arc<ClientGateway> {
        &self.client
    }

    pub fn server(&self) -> &Arc<ServerGateway> {
        &self.server
    }

    /// Actual server gateway address (relevant when bound ephemeral).
    pub fn serv_addr(&self) -> SocketAddrV4 {
        self.serv_addr
    }

    /// Launch a user environment running the registered program `entry`.
    pub fn spawn(&self, entry: u32) -> Result<EnvId, Errno> {
        self.kern.spawn_user(entry)
    }

    /// Stop both gateways and join their threads. User environment bodies
    /// that are still parked die with the process.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Destroying the client gateway slot wakes it out of its IPC wait.
        let _ = self.kern.sys_env_destroy(self.client.env_id(), EnvId::NONE);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}
