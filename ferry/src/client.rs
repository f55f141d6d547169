//! Client gateway: receives lease/IPC requests from suspended local
//! environments over kernel IPC, drives the ship-out protocol against the
//! remote server, and reports outcomes back through `env_unsuspend`.

use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use kern::kern::{CLIENT_LEASE_COMPLETED, CLIENT_LEASE_REQUEST, CLIENT_SEND_IPC};
use kern::layout::{IPCRCV, UTEXT, UTOP};
use kern::{EnvId, EnvRecord, Errno, Kern, Kind, Perm, Status, CHUNK, PGSIZE, REG_RETVAL};

use crate::wire::{IpcPacket, Reply, Request, WireError};
use crate::CLEASES;

/// One outstanding lease: a local environment and the node it was shipped
/// to. A zero id marks the entry free.
#[derive(Debug, Clone, Copy)]
pub struct LeaseEntry {
    pub env: EnvId,
    pub lessee: SocketAddrV4,
}

const FREE_LESSEE: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);

/// Linear table of outstanding client leases, scanned by id.
pub struct ClientLeases {
    entries: [LeaseEntry; CLEASES],
}

impl ClientLeases {
    pub fn new() -> ClientLeases {
        ClientLeases {
            entries: [LeaseEntry {
                env: EnvId::NONE,
                lessee: FREE_LESSEE,
            }; CLEASES],
        }
    }

    pub fn put(&mut self, env: EnvId, lessee: SocketAddrV4) -> Option<usize> {
        for (i, e) in self.entries.iter_mut().enumerate() {
            if e.env.is_none() {
                e.env = env;
                e.lessee = lessee;
                return Some(i);
            }
        }
        None
    }

    pub fn find(&self, env: EnvId) -> Option<usize> {
        self.entries.iter().position(|e| e.env == env)
    }

    pub fn lessee_of(&self, env: EnvId) -> Option<SocketAddrV4> {
        self.find(env).map(|i| self.entries[i].lessee)
    }

    pub fn delete(&mut self, env: EnvId) -> Option<usize> {
        let i = self.find(env)?;
        self.entries[i] = LeaseEntry {
            env: EnvId::NONE,
            lessee: FREE_LESSEE,
        };
        Some(i)
    }

    /// Release entries whose local slot has left `Leased` — an environment
    /// that returned home or was reaped.
    pub fn sweep(&mut self, kern: &Kern) {
        for e in self.entries.iter_mut() {
            if e.env.is_none() {
                continue;
            }
            if kern.env_status(e.env) != Some(Status::Leased) {
                trace!(target: "client", "sweeping lease entry for {}", e.env);
                *e = LeaseEntry {
                    env: EnvId::NONE,
                    lessee: FREE_LESSEE,
                };
            }
        }
    }

    pub fn occupied(&self) -> usize {
        self.entries.iter().filter(|e| !e.env.is_none()).count()
    }
}

impl Default for ClientLeases {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// This node's address as peers can reach it; stamped into shipped
    /// records for reverse IPC routing.
    pub my_ip: Ipv4Addr,
    /// This node's server gateway port (completions come back to it).
    pub my_serv_port: u16,
    /// Default migration target.
    pub lease_to: SocketAddrV4,
    pub retries: u32,
}

pub struct ClientGateway {
    kern: Arc<Kern>,
    id: EnvId,
    cfg: ClientConfig,
    leases: Mutex<ClientLeases>,
}

impl ClientGateway {
    pub fn new(kern: Arc<Kern>, cfg: ClientConfig) -> Result<Arc<ClientGateway>, Errno> {
        let id = kern.register_gateway(Kind::GatewayClient)?;
        Ok(Arc::new(ClientGateway {
            kern,
            id,
            cfg,
            leases: Mutex::new(ClientLeases::new()),
        }))
    }

    pub fn env_id(&self) -> EnvId {
        self.id
    }

    pub fn lease_count(&self) -> usize {
        self.leases.lock().occupied()
    }

    /// Run the completed-lease sweep outside the request loop (the loop
    /// itself only sweeps between requests).
    pub fn sweep_now(&self) {
        self.leases.lock().sweep(&self.kern);
    }

    /// Request loop: sweep completed leases, then block for the next
    /// kernel-IPC request. Exits when the gateway's slot is destroyed.
    pub fn run(&self) {
        info!(target: "client", "client gateway {} serving", self.id);
        loop {
            self.leases.lock().sweep(&self.kern);

            let (code, sender, _perm) = match self.kern.sys_ipc_recv(self.id, IPCRCV) {
                Ok(got) => got,
                Err(_) => break,
            };
            let mut raw = [0u8; 12];
            if let Err(err) = self.kern.read_user(self.id, EnvId::NONE, IPCRCV, &mut raw) {
                warn!(target: "client", "bad request page from {sender}: {err}");
                continue;
            }
            let arg = |i: usize| u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());

            match code {
                CLIENT_LEASE_REQUEST => self.try_send_lease(EnvId(arg(0)), arg(1)),
                CLIENT_LEASE_COMPLETED => self.try_send_lease_completed(EnvId(arg(0))),
                CLIENT_SEND_IPC => self.try_send_ipc(sender, EnvId(arg(0)), arg(1), arg(2)),
                other => warn!(target: "client", "unknown gateway request {other} from {sender}"),
            }
        }
        debug!(target: "client", "client gateway {} stopping", self.id);
    }

    /// Ship a suspended environment out, then wake its slot with the
    /// outcome: `Leased` on success so the stub stays pinned, `Runnable`
    /// with a negative resume value on failure.
    pub fn try_send_lease(&self, env_id: EnvId, thisenv: u32) {
        info!(target: "client", "sending lease request for {env_id}");

        let Ok(mut rec) = self.kern.env_snapshot(env_id) else {
            warn!(target: "client", "lease request names unknown env {env_id}");
            return;
        };

        let shipped = if rec.status != Status::Suspended {
            warn!(target: "client", "cannot lease {env_id}: not suspended");
            Err(Errno::Fail)
        } else {
            // Resume register reads success on the far side; host fields
            // route completions and reverse IPC back to this node.
            rec.tf.regs[REG_RETVAL] = 0;
            rec.host_ip = u32::from(self.cfg.my_ip);
            rec.host_port = self.cfg.my_serv_port;

            if self.leases.lock().put(env_id, self.cfg.lease_to).is_some() {
                self.send_env(&rec, thisenv)
            } else {
                Err(Errno::Fail)
            }
        };

        match shipped {
            Ok(()) => {
                let _ = self
                    .kern
                    .sys_env_unsuspend(self.id, env_id, Status::Leased, 0);
            }
            Err(err) => {
                warn!(target: "client", "lease of {env_id} failed ({err}), resuming locally");
                let _ = self.kern.sys_env_unsuspend(
                    self.id,
                    env_id,
                    Status::Runnable,
                    Errno::Inval.code(),
                );
                self.leases.lock().delete(env_id);
            }
        }
    }

    /// Tell the remote origin of a finished alien to reap its stub, then
    /// let the local alien resume so its normal exit frees the slot.
    pub fn try_send_lease_completed(&self, env_id: EnvId) {
        let Ok(rec) = self.kern.env_snapshot(env_id) else {
            warn!(target: "client", "lease completion names unknown env {env_id}");
            return;
        };

        let reported = if rec.status != Status::Suspended {
            warn!(target: "client", "cannot complete lease of {env_id}: not suspended");
            Err(Errno::Fail)
        } else {
            info!(target: "client", "finished executing {env_id} -> {}", rec.host_eid);
            let origin = SocketAddrV4::new(Ipv4Addr::from(rec.host_ip), rec.host_port);
            let mut reported = Err(Errno::Fail);
            let mut tries = 0;
            while tries <= self.cfg.retries {
                tries += 1;
                reported = self.request_to(origin, &Request::CompletedLease { src: rec.host_eid });
                match reported {
                    Ok(()) => break,
                    // The origin no longer knows the stub; nothing to retry.
                    Err(Errno::BadReq) => break,
                    Err(_) => continue,
                }
            }
            reported
        };

        let code = match reported {
            Ok(()) => 0,
            Err(_) => Errno::Inval.code(),
        };
        let _ = self
            .kern
            .sys_env_unsuspend(self.id, env_id, Status::Runnable, code);
    }

    /// Forward a diverted IPC send. An alien sender reverse-routes to its
    /// origin node; a native sender must name a leased destination present
    /// in the lease table.
    pub fn try_send_ipc(&self, src_id: EnvId, dst: EnvId, value: u32, perm: u32) {
        let Ok(snd) = self.kern.env_snapshot(src_id) else {
            return;
        };

        let mut pkt = IpcPacket {
            dst,
            src: src_id,
            value,
            va: 0,
            perm,
            from_alien: false,
        };

        let route = if snd.alien {
            pkt.src = snd.host_eid;
            pkt.from_alien = true;
            Ok(SocketAddrV4::new(Ipv4Addr::from(snd.host_ip), snd.host_port))
        } else {
            match self.kern.env_snapshot(dst) {
                Ok(d) if d.status == Status::Leased => {
                    self.leases.lock().lessee_of(dst).ok_or(Errno::BadEnv)
                }
                _ => {
                    warn!(
                        target: "client",
                        "ipc divert for unleased destination {dst} from non-alien {src_id}"
                    );
                    Err(Errno::BadEnv)
                }
            }
        };

        let sent = route.and_then(|addr| self.send_ipc_req(&pkt, addr));
        let code = match sent {
            Ok(()) => 0,
            Err(err) => {
                warn!(target: "client", "remote ipc {src_id} -> {dst} failed: {err}");
                err.code()
            }
        };
        let _ = self
            .kern
            .sys_env_unsuspend(self.id, src_id, Status::Runnable, code);
    }

    /// One whole environment shipment: lease, pages ascending, done; abort
    /// tears down the remote half-build before another attempt.
    fn send_env(&self, rec: &EnvRecord, thisenv: u32) -> Result<(), Errno> {
        let mut tries = 0;
        while tries <= self.cfg.retries {
            tries += 1;

            match self.request(&Request::StartLease {
                src: rec.id,
                record: rec.clone(),
                thisenv,
            }) {
                Ok(()) => {}
                Err(Errno::Fail) | Err(Errno::NoLease) => continue,
                Err(_) => {
                    self.abort(rec.id);
                    continue;
                }
            }

            match self.send_pages(rec.id) {
                Ok(()) => {}
                Err(Errno::NoMem) => return Err(Errno::Fail),
                Err(Errno::Fail) => continue,
                Err(_) => {
                    self.abort(rec.id);
                    continue;
                }
            }

            match self.request(&Request::DoneLease { src: rec.id }) {
                Ok(()) => return Ok(()),
                Err(_) => {
                    self.abort(rec.id);
                    continue;
                }
            }
        }
        Err(Errno::Fail)
    }

    fn abort(&self, src: EnvId) {
        debug!(target: "client", "aborting partial lease of {src}");
        let _ = self.request(&Request::AbortLease { src });
    }

    /// Walk `[UTEXT, UTOP)` and ship every mapped page.
    fn send_pages(&self, env: EnvId) -> Result<(), Errno> {
        let mut va = UTEXT;
        while va < UTOP {
            if let Ok(perm) = self.kern.sys_get_perms(self.id, env, va) {
                self.send_page(env, va, perm)?;
            }
            va += PGSIZE as u32;
        }
        Ok(())
    }

    fn send_page(&self, env: EnvId, va: u32, perm: Perm) -> Result<(), Errno> {
        for chunk in 0..(PGSIZE / CHUNK) as u8 {
            let mut data = Box::new([0u8; CHUNK]);
            self.kern
                .sys_copy_mem_out(self.id, env, va + chunk as u32 * CHUNK as u32, &mut data)?;
            trace!(target: "client", "sending page {env} va {va:#x} chunk {chunk}");
            self.request(&Request::Page {
                src: env,
                va,
                perm: perm.bits(),
                chunk,
                data,
            })?;
        }
        Ok(())
    }

    fn send_ipc_req(&self, pkt: &IpcPacket, addr: SocketAddrV4) -> Result<(), Errno> {
        match self.request_to(addr, &Request::StartIpc(*pkt)) {
            Ok(()) => Ok(()),
            Err(Errno::NoIpc) => Err(Errno::IpcNotRecv),
            Err(Errno::BadReq) => Err(Errno::Inval),
            Err(Errno::Fail) => Err(Errno::BadEnv),
            Err(err) => Err(err),
        }
    }

    fn request(&self, req: &Request) -> Result<(), Errno> {
        self.request_to(self.cfg.lease_to, req)
    }

    /// One request, one reply, one connection. Transport failures retry up
    /// to the budget; a negative reply status is returned as-is.
    fn request_to(&self, addr: SocketAddrV4, req: &Request) -> Result<(), Errno> {
        let mut tries = 0;
        while tries <= self.cfg.retries {
            tries += 1;
            match self.round_trip(addr, req) {
                Ok(reply) if reply.status == 0 => return Ok(()),
                Ok(reply) => {
                    return Err(Errno::from_code(reply.status).unwrap_or(Errno::Fail));
                }
                Err(err) => {
                    debug!(target: "client", "request to {addr} failed: {err}");
                }
            }
        }
        Err(Errno::Fail)
    }

    fn round_trip(&self, addr: SocketAddrV4, req: &Request) -> Result<Reply, WireError> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        req.write_to(&mut stream)?;
        Reply::read_from(&mut stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn put_find_delete() {
        let mut t = ClientLeases::new();
        assert_eq!(t.put(EnvId(0x1001), addr(7)), Some(0));
        assert_eq!(t.put(EnvId(0x2001), addr(8)), Some(1));
        assert_eq!(t.find(EnvId(0x2001)), Some(1));
        assert_eq!(t.lessee_of(EnvId(0x1001)), Some(addr(7)));
        assert_eq!(t.delete(EnvId(0x1001)), Some(0));
        assert_eq!(t.find(EnvId(0x1001)), None);
        // The freed entry is reusable.
        assert_eq!(t.put(EnvId(0x3001), addr(9)), Some(0));
    }

    #[test]
    fn table_fills_up() {
        let mut t = ClientLeases::new();
        for i in 0..CLEASES {
            assert!(t.put(EnvId(0x1000 + i as u32), addr(7)).is_some());
        }
        assert_eq!(t.put(EnvId(0x9001), addr(7)), None);
        assert_eq!(t.occupied(), CLEASES);
    }
}
