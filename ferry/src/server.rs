//! Server gateway: accepts one request per connection, reconstitutes
//! incoming environments into fresh kernel slots, arms them, and reaps
//! leased-out stubs when their remote copies complete.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use kern::layout::UTOP;
use kern::{EnvId, EnvRecord, Errno, Kern, Kind, Perm, Status, CHUNK, PGSIZE};

use crate::wire::{IpcPacket, Reply, Request, WireError};
use crate::SLEASES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Free,
    /// Pages still streaming in; subject to the GC deadline.
    Busy,
    /// Armed; running or finished under the local scheduler.
    Done,
}

/// One incoming lease: origin identity, local reconstruction, progress, and
/// the deadline base.
#[derive(Debug, Clone, Copy)]
pub struct LeaseSlot {
    pub src: EnvId,
    pub dst: EnvId,
    pub status: LeaseStatus,
    pub start_ms: u32,
    pub thisenv: u32,
}

const EMPTY_SLOT: LeaseSlot = LeaseSlot {
    src: EnvId::NONE,
    dst: EnvId::NONE,
    status: LeaseStatus::Free,
    start_ms: 0,
    thisenv: 0,
};

pub struct ServerLeases {
    slots: [LeaseSlot; SLEASES],
}

impl ServerLeases {
    pub fn new() -> ServerLeases {
        ServerLeases {
            slots: [EMPTY_SLOT; SLEASES],
        }
    }

    pub fn find_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.status == LeaseStatus::Free)
    }

    pub fn find_by_src(&self, src: EnvId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| !s.src.is_none() && s.src == src)
    }

    pub fn get(&self, i: usize) -> LeaseSlot {
        self.slots[i]
    }

    pub fn set(&mut self, i: usize, slot: LeaseSlot) {
        self.slots[i] = slot;
    }

    pub fn clear(&mut self, i: usize) {
        self.slots[i] = EMPTY_SLOT;
    }

    pub fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.status != LeaseStatus::Free)
            .count()
    }
}

impl Default for ServerLeases {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ServerGateway {
    kern: Arc<Kern>,
    id: EnvId,
    leases: Mutex<ServerLeases>,
    gc_time_ms: u32,
}

impl ServerGateway {
    pub fn new(kern: Arc<Kern>, gc_time_ms: u32) -> Result<Arc<ServerGateway>, Errno> {
        let id = kern.register_gateway(Kind::GatewayServer)?;
        Ok(Arc::new(ServerGateway {
            kern,
            id,
            gc_time_ms,
            leases: Mutex::new(ServerLeases::new()),
        }))
    }

    pub fn env_id(&self) -> EnvId {
        self.id
    }

    pub fn lease_count(&self) -> usize {
        self.leases.lock().occupied()
    }

    /// Local id a given origin environment was reconstituted as, if any.
    pub fn local_of(&self, src: EnvId) -> Option<EnvId> {
        let leases = self.leases.lock();
        leases.find_by_src(src).map(|i| leases.get(i).dst)
    }

    /// Accept loop: one request per connection. Between connections the GC
    /// pass runs once per TTL period and the completion sweep every
    /// iteration, so an idle node still collects abandoned leases.
    pub fn run(&self, listener: TcpListener, shutdown: Arc<AtomicBool>) {
        info!(target: "server", "server gateway {} listening on {:?}", self.id, listener.local_addr().ok());
        if let Err(err) = listener.set_nonblocking(true) {
            warn!(target: "server", "cannot poll listener: {err}");
            return;
        }

        let mut last_gc = self.kern.sys_time_msec();
        while !shutdown.load(Ordering::SeqCst) {
            let now = self.kern.sys_time_msec();
            if now.wrapping_sub(last_gc) > self.gc_time_ms {
                last_gc = now;
                self.gc(now);
            }
            self.sweep_completed();

            match listener.accept() {
                Ok((stream, peer)) => {
                    trace!(target: "server", "client connected from {peer}");
                    self.handle_client(stream);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => {
                    warn!(target: "server", "accept failed: {err}");
                }
            }
        }
        debug!(target: "server", "server gateway {} stopping", self.id);
    }

    fn handle_client(&self, mut stream: TcpStream) {
        let _ = stream.set_nonblocking(false);
        let _ = stream.set_read_timeout(Some(Duration::from_secs(10)));

        match Request::read_from(&mut stream) {
            Ok(req) => {
                let reply = self.dispatch(&req);
                trace!(target: "server", "request {req:?} -> {reply:?}");
                if let Err(err) = reply.write_to(&mut stream) {
                    debug!(target: "server", "reply write failed: {err}");
                }
            }
            Err(WireError::BadFrame) => {
                let _ = Reply {
                    status: Errno::BadReq.code(),
                    env: 0,
                }
                .write_to(&mut stream);
            }
            Err(WireError::Io(err)) => {
                debug!(target: "server", "request read failed: {err}");
            }
        }
    }

    /// Route one request; the reply echoes the environment id it named.
    pub fn dispatch(&self, req: &Request) -> Reply {
        let env = req.echo_id();
        let handled = match req {
            Request::Page {
                src,
                va,
                perm,
                chunk,
                data,
            } => self.process_page(*src, *va, *perm, *chunk, data),
            Request::StartLease {
                src,
                record,
                thisenv,
            } => self.process_start_lease(*src, record, *thisenv),
            Request::DoneLease { src } => self.process_done_lease(*src),
            Request::AbortLease { src } => self.process_abort_lease(*src),
            Request::CompletedLease { src } => self.process_completed_lease(*src),
            Request::StartIpc(pkt) => self.process_ipc_start(pkt),
            // Reserved code; nothing speaks it yet.
            Request::DoneIpc { .. } => Err(Errno::BadReq),
        };
        Reply {
            status: handled.map_or_else(Errno::code, |()| 0),
            env,
        }
    }

    fn process_start_lease(
        &self,
        src: EnvId,
        record: &EnvRecord,
        thisenv: u32,
    ) -> Result<(), Errno> {
        let mut leases = self.leases.lock();
        let slot = leases.find_free().ok_or(Errno::NoLease)?;

        debug!(
            target: "server",
            "new lease request: env {} parent {} status {:?} host {:#x}",
            record.id, record.parent, record.status, record.host_ip
        );

        if record.status != Status::Suspended {
            return Err(Errno::BadReq);
        }

        let mut rec = record.clone();
        rec.host_eid = src;
        let dst = self
            .kern
            .sys_env_lease(self.id, &rec)
            .map_err(|_| Errno::NoLease)?;

        leases.set(
            slot,
            LeaseSlot {
                src,
                dst,
                status: LeaseStatus::Busy,
                start_ms: self.kern.sys_time_msec(),
                thisenv,
            },
        );
        info!(target: "server", "new lease received, mapped {src} -> {dst}");
        Ok(())
    }

    fn process_page(
        &self,
        src: EnvId,
        va: u32,
        perm: u32,
        chunk: u8,
        data: &[u8; CHUNK],
    ) -> Result<(), Errno> {
        let dst = {
            let leases = self.leases.lock();
            let i = leases.find_by_src(src).ok_or(Errno::Fail)?;
            leases.get(i).dst
        };
        if dst.is_none() {
            return Err(Errno::Fail);
        }
        if va % PGSIZE as u32 != 0 {
            return Err(Errno::BadReq);
        }
        if chunk as usize >= PGSIZE / CHUNK {
            return Err(Errno::BadReq);
        }

        // The destination loses sharing with its origin: copy-on-write
        // pages become private writable on arrival.
        let mut perm = Perm::from_bits_retain(perm);
        if perm.contains(Perm::COW) {
            perm.remove(Perm::COW);
            perm.insert(Perm::W);
        }

        trace!(target: "server", "page request {src}: va {va:#x} perm {perm:?} chunk {chunk}");

        if chunk == 0 {
            self.kern
                .sys_page_alloc(self.id, dst, va, perm)
                .map_err(|e| match e {
                    Errno::Inval => Errno::BadReq,
                    Errno::BadEnv => Errno::Fail,
                    _ => Errno::NoMem,
                })?;
        }

        self.kern
            .sys_copy_mem_in(self.id, dst, va + chunk as u32 * CHUNK as u32, data)
            .map_err(|_| Errno::Fail)
    }

    fn process_done_lease(&self, src: EnvId) -> Result<(), Errno> {
        let (dst, thisenv) = {
            let mut leases = self.leases.lock();
            let i = leases.find_by_src(src).ok_or(Errno::Fail)?;
            let slot = leases.get(i);
            if slot.dst.is_none() {
                return Err(Errno::Fail);
            }
            let mut armed = slot;
            armed.status = LeaseStatus::Done;
            leases.set(i, armed);
            (slot.dst, slot.thisenv)
        };

        // Point the user-level self-pointer at the reconstructed slot.
        let _ = self.kern.sys_env_set_thisenv(self.id, dst, thisenv);

        // All state is in place; hand the environment to the scheduler.
        self.kern
            .sys_env_set_status(self.id, dst, Status::Runnable)
            .map_err(|_| Errno::Fail)?;
        info!(target: "server", "lease {src} armed as {dst}");
        Ok(())
    }

    fn process_abort_lease(&self, src: EnvId) -> Result<(), Errno> {
        debug!(target: "server", "aborting lease of {src}");
        self.destroy_lease(src);
        Ok(())
    }

    fn process_completed_lease(&self, src: EnvId) -> Result<(), Errno> {
        info!(target: "server", "process {src} completed remotely");
        if self.kern.env_status(src) == Some(Status::Leased) {
            self.kern
                .sys_env_destroy(self.id, src)
                .map_err(|_| Errno::BadReq)?;
        }
        Ok(())
    }

    fn process_ipc_start(&self, pkt: &IpcPacket) -> Result<(), Errno> {
        // A packet from an alien targets a local environment it is replying
        // to; otherwise the destination is an environment leased to us and
        // must be translated through the table.
        let dst = if pkt.from_alien {
            pkt.dst
        } else {
            let leases = self.leases.lock();
            let i = leases.find_by_src(pkt.dst).ok_or(Errno::Fail)?;
            leases.get(i).dst
        };

        let va = if pkt.va == 0 { UTOP } else { pkt.va };
        debug!(
            target: "server",
            "ipc delivery {} -> {} (local {dst}), value {:#x}",
            pkt.src, pkt.dst, pkt.value
        );

        self.kern
            .sys_ipc_try_send_as(
                self.id,
                pkt.src,
                dst,
                pkt.value,
                va,
                Perm::from_bits_retain(pkt.perm),
            )
            .map_err(|e| match e {
                Errno::IpcNotRecv => Errno::NoIpc,
                Errno::Inval => Errno::BadReq,
                Errno::BadEnv => Errno::Fail,
                other => other,
            })
    }

    /// Evict `Busy` entries whose deadline expired, destroying the
    /// partially built destination environment.
    pub fn gc(&self, now_ms: u32) {
        debug!(target: "server", "garbage collecting leases");
        let mut leases = self.leases.lock();
        for i in 0..SLEASES {
            let slot = leases.get(i);
            if slot.src.is_none() || slot.status != LeaseStatus::Busy {
                continue;
            }
            if now_ms.wrapping_sub(slot.start_ms) > self.gc_time_ms {
                info!(target: "server", "collecting expired lease {} -> {}", slot.src, slot.dst);
                leases.clear(i);
                let _ = self.kern.sys_env_destroy(self.id, slot.dst);
            }
        }
    }

    /// Reap `Done` entries whose local environment has exited (or lost its
    /// alien marking).
    pub fn sweep_completed(&self) {
        let mut leases = self.leases.lock();
        for i in 0..SLEASES {
            let slot = leases.get(i);
            if slot.src.is_none() || slot.status != LeaseStatus::Done {
                continue;
            }
            let reap = match self.kern.env_snapshot(slot.dst) {
                Err(_) => true,
                Ok(rec) => !rec.alien,
            };
            if reap {
                debug!(target: "server", "sweeping completed lease {} -> {}", slot.src, slot.dst);
                leases.clear(i);
                let _ = self.kern.sys_env_destroy(self.id, slot.dst);
            }
        }
    }

    fn destroy_lease(&self, src: EnvId) {
        let mut leases = self.leases.lock();
        if let Some(i) = leases.find_by_src(src) {
            let dst = leases.get(i).dst;
            leases.clear(i);
            let _ = self.kern.sys_env_destroy(self.id, dst);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use kern::env::TrapFrame;
    use kern::layout::UTEXT;
    use kern::{ManualClock, ProgramRegistry};

    const ENTRY: u32 = 0x60;

    fn record(id: u32) -> EnvRecord {
        EnvRecord {
            id: EnvId(id),
            parent: EnvId::NONE,
            status: Status::Suspended,
            kind: Kind::User,
            runs: 1,
            tf: TrapFrame {
                ip: ENTRY,
                ..TrapFrame::default()
            },
            pgfault_upcall: 0,
            ipc_recving: false,
            ipc_dstva: 0,
            ipc_value: 0,
            ipc_from: EnvId::NONE,
            ipc_perm: 0,
            alien: false,
            host_ip: 0x7f00_0001,
            host_port: 7,
            host_eid: EnvId::NONE,
        }
    }

    fn start_req(id: u32) -> Request {
        Request::StartLease {
            src: EnvId(id),
            record: record(id),
            thisenv: UTEXT + 4,
        }
    }

    fn page_req(id: u32, va: u32, chunk: u8) -> Request {
        Request::Page {
            src: EnvId(id),
            va,
            perm: (Perm::P | Perm::U | Perm::W).bits(),
            chunk,
            data: Box::new([chunk + 1; CHUNK]),
        }
    }

    fn gateway(programs: ProgramRegistry) -> Arc<ServerGateway> {
        let kern = kern::Kern::new(Arc::new(ManualClock::new(0)), programs);
        ServerGateway::new(kern, 5_000).unwrap()
    }

    #[test]
    fn lease_table_exhaustion_reports_no_lease() {
        let gw = gateway(ProgramRegistry::new());
        for i in 0..SLEASES as u32 {
            let reply = gw.dispatch(&start_req(0x1001 + i));
            assert_eq!(reply.status, 0);
        }
        let reply = gw.dispatch(&start_req(0x9001));
        assert_eq!(reply.status, Errno::NoLease.code());
        assert_eq!(reply.env, 0x9001);
    }

    #[test]
    fn page_without_lease_fails() {
        let gw = gateway(ProgramRegistry::new());
        let reply = gw.dispatch(&page_req(0x1001, UTEXT, 0));
        assert_eq!(reply.status, Errno::Fail.code());
    }

    #[test]
    fn nonzero_chunk_without_allocation_fails() {
        let gw = gateway(ProgramRegistry::new());
        assert_eq!(gw.dispatch(&start_req(0x1001)).status, 0);
        // Chunk 1 before chunk 0: nothing is allocated at the target.
        let reply = gw.dispatch(&page_req(0x1001, UTEXT, 1));
        assert_eq!(reply.status, Errno::Fail.code());
        // Chunk index out of range is malformed.
        let reply = gw.dispatch(&page_req(0x1001, UTEXT, 4));
        assert_eq!(reply.status, Errno::BadReq.code());
        // Unaligned target address is malformed.
        let reply = gw.dispatch(&page_req(0x1001, UTEXT + 5, 0));
        assert_eq!(reply.status, Errno::BadReq.code());
    }

    #[test]
    fn non_suspended_record_is_rejected() {
        let gw = gateway(ProgramRegistry::new());
        let mut rec = record(0x1001);
        rec.status = Status::Runnable;
        let reply = gw.dispatch(&Request::StartLease {
            src: EnvId(0x1001),
            record: rec,
            thisenv: 0,
        });
        assert_eq!(reply.status, Errno::BadReq.code());
        assert_eq!(gw.lease_count(), 0);
    }

    #[test]
    fn full_lease_arms_and_runs() {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let mut programs = ProgramRegistry::new();
        programs.register(ENTRY, move |env| {
            let me = env.load_u32(UTEXT + 4)?;
            tx.lock().unwrap().send(me).unwrap();
            Ok(())
        });
        let gw = gateway(programs);

        assert_eq!(gw.dispatch(&start_req(0x1001)).status, 0);
        for chunk in 0..(PGSIZE / CHUNK) as u8 {
            assert_eq!(gw.dispatch(&page_req(0x1001, UTEXT, chunk)).status, 0);
        }
        let local = gw.local_of(EnvId(0x1001)).unwrap();
        assert_eq!(gw.dispatch(&Request::DoneLease { src: EnvId(0x1001) }).status, 0);

        // The reconstituted environment runs with its self-pointer fixed.
        let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(seen, local.0);
    }

    #[test]
    fn abort_tears_down_partial_build() {
        let gw = gateway(ProgramRegistry::new());
        assert_eq!(gw.dispatch(&start_req(0x1001)).status, 0);
        let local = gw.local_of(EnvId(0x1001)).unwrap();

        assert_eq!(
            gw.dispatch(&Request::AbortLease { src: EnvId(0x1001) }).status,
            0
        );
        assert_eq!(gw.lease_count(), 0);
        assert!(gw.kern.env_status(local).is_none());
        // Pages for the aborted build now miss their lease.
        let reply = gw.dispatch(&page_req(0x1001, UTEXT, 0));
        assert_eq!(reply.status, Errno::Fail.code());
    }

    #[test]
    fn expired_busy_lease_is_garbage_collected() {
        let gw = gateway(ProgramRegistry::new());
        assert_eq!(gw.dispatch(&start_req(0x1001)).status, 0);
        let local = gw.local_of(EnvId(0x1001)).unwrap();

        // Inside the TTL nothing happens.
        gw.gc(4_000);
        assert_eq!(gw.lease_count(), 1);

        gw.gc(10_000);
        assert_eq!(gw.lease_count(), 0);
        assert!(gw.kern.env_status(local).is_none());
    }

    #[test]
    fn ipc_without_receiver_is_no_ipc() {
        let gw = gateway(ProgramRegistry::new());
        assert_eq!(gw.dispatch(&start_req(0x1001)).status, 0);
        // The destination is still suspended mid-reconstruction.
        let reply = gw.dispatch(&Request::StartIpc(IpcPacket {
            dst: EnvId(0x1001),
            src: EnvId(0x1000),
            value: 7,
            va: 0,
            perm: 0,
            from_alien: false,
        }));
        assert_eq!(reply.status, Errno::NoIpc.code());
    }
}
