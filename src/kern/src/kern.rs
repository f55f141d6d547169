//! The kernel proper: one big lock around the environment table, a condvar
//! for resume/IPC wakeups, and the syscall surface.
//!
//! Threading model: every runnable user environment body executes on its own
//! thread and calls into here. A trap into the kernel is a method call that
//! takes the lock; suspension and IPC wait park the calling thread on the
//! condvar while still holding its slot pinned. The gateways are external
//! threads that registered a slot and use the same surface.

use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::env::{Env, EnvId, EnvRecord, EnvTable, Kind, Status, TrapFrame, REG_RETVAL};
use crate::error::Errno;
use crate::layout::{page_aligned, IPCSND, UTOP};
use crate::mem::{Perm, CHUNK};
use crate::user::{self, ProgramRegistry};

/// Request codes a suspending environment IPCs to the client gateway.
pub const CLIENT_LEASE_REQUEST: u32 = 0;
pub const CLIENT_LEASE_COMPLETED: u32 = 1;
pub const CLIENT_SEND_IPC: u32 = 2;

/// Outcome of a suspension: either the gateway put the environment back on
/// its feet locally (carrying the resume register), or ownership moved and
/// this thread must stop running the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Resumed(i32),
    Departed,
}

pub struct Kern {
    table: Mutex<EnvTable>,
    resume: Condvar,
    clock: Arc<dyn Clock>,
    programs: ProgramRegistry,
}

impl Kern {
    pub fn new(clock: Arc<dyn Clock>, programs: ProgramRegistry) -> Arc<Kern> {
        Arc::new(Kern {
            table: Mutex::new(EnvTable::new()),
            resume: Condvar::new(),
            clock,
            programs,
        })
    }

    pub fn programs(&self) -> &ProgramRegistry {
        &self.programs
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    // === Spawning and introspection === //

    /// Allocate a fresh user environment running the registered program
    /// `entry` and start its body thread.
    pub fn spawn_user(self: &Arc<Self>, entry: u32) -> Result<EnvId, Errno> {
        let mut table = self.table.lock();
        let id = table.alloc(EnvId::NONE)?;
        table.get_mut(id).unwrap().tf.ip = entry;
        self.start_env_locked(&mut table, id);
        Ok(id)
    }

    /// Claim a slot for a gateway thread. The thread itself lives outside
    /// the kernel; the slot exists so the bridge can find and IPC it.
    pub fn register_gateway(&self, kind: Kind) -> Result<EnvId, Errno> {
        let mut table = self.table.lock();
        let id = table.alloc(EnvId::NONE)?;
        let e = table.get_mut(id).unwrap();
        e.kind = kind;
        e.started = true;
        Ok(id)
    }

    pub fn env_status(&self, id: EnvId) -> Option<Status> {
        self.table.lock().get(id).map(|e| e.status)
    }

    /// Read-only snapshot of a slot's control state, the equivalent of the
    /// user-visible environment table window.
    pub fn env_snapshot(&self, id: EnvId) -> Result<EnvRecord, Errno> {
        let table = self.table.lock();
        Ok(table.get(id).ok_or(Errno::BadEnv)?.snapshot())
    }

    /// Number of occupied slots, for the slot-accounting checks in tests.
    pub fn live_envs(&self) -> usize {
        self.table.lock().live_count()
    }

    // === Console and time === //

    pub fn sys_cputs(&self, caller: EnvId, s: &str) {
        info!(target: "console", "[{caller}] {s}");
    }

    pub fn sys_getenvid(&self, caller: EnvId) -> EnvId {
        caller
    }

    pub fn sys_time_msec(&self) -> u32 {
        self.clock.now_ms()
    }

    pub fn sys_yield(&self) {
        thread::yield_now();
    }

    // === Environment management === //

    /// Gateway-privileged: the origin's server gateway reaps leased stubs
    /// it is not related to.
    pub fn sys_env_destroy(&self, caller: EnvId, id: EnvId) -> Result<(), Errno> {
        let mut table = self.table.lock();
        let checkperm = table.lookup(EnvId::NONE, caller, false)?.kind == Kind::User;
        let victim = table.lookup(id, caller, checkperm)?.id;
        self.destroy_locked(&mut table, victim)
    }

    fn destroy_locked(&self, table: &mut EnvTable, id: EnvId) -> Result<(), Errno> {
        table.transition(id, Status::Dying)?;
        let e = table.get_mut(id).unwrap();
        e.aspace.clear();
        debug!(target: "kern", "destroyed env {id}");
        table.free(id);
        // Anyone parked on this slot must notice it vanished.
        self.resume.notify_all();
        Ok(())
    }

    pub fn sys_exofork(&self, caller: EnvId) -> Result<EnvId, Errno> {
        let mut table = self.table.lock();
        let parent_tf = table.lookup(EnvId::NONE, caller, false)?.tf;
        let id = table.alloc(caller)?;
        table.transition(id, Status::NotRunnable)?;
        let e = table.get_mut(id).unwrap();
        e.tf = parent_tf;
        e.tf.regs[REG_RETVAL] = 0;
        Ok(id)
    }

    /// Only `Runnable`/`NotRunnable` may be requested here; arming a
    /// reconstituted environment starts its body thread.
    pub fn sys_env_set_status(
        self: &Arc<Self>,
        caller: EnvId,
        id: EnvId,
        status: Status,
    ) -> Result<(), Errno> {
        if status != Status::Runnable && status != Status::NotRunnable {
            return Err(Errno::Inval);
        }
        let mut table = self.table.lock();
        let id = table.lookup(id, caller, true)?.id;
        table.transition(id, status)?;
        if status == Status::Runnable {
            self.start_env_locked(&mut table, id);
            self.resume.notify_all();
        }
        Ok(())
    }

    pub fn sys_env_set_trapframe(
        &self,
        caller: EnvId,
        id: EnvId,
        tf: TrapFrame,
    ) -> Result<(), Errno> {
        if tf.ip >= UTOP {
            return Err(Errno::Inval);
        }
        let mut table = self.table.lock();
        let e = table.lookup_mut(id, caller, true)?;
        e.tf = tf;
        Ok(())
    }

    pub fn sys_env_set_pgfault_upcall(
        &self,
        caller: EnvId,
        id: EnvId,
        va: u32,
    ) -> Result<(), Errno> {
        let mut table = self.table.lock();
        let e = table.lookup_mut(id, caller, true)?;
        e.pgfault_upcall = va;
        Ok(())
    }

    /// Exchange control state with a not-runnable environment and destroy
    /// the donor. Not used by the migration path; behavior for alien
    /// environments is deliberately left unspecified.
    pub fn sys_env_swap(&self, caller: EnvId, id: EnvId) -> Result<(), Errno> {
        let mut table = self.table.lock();
        let target = table.lookup(id, caller, true)?.id;
        if table.get(target).ok_or(Errno::BadEnv)?.status != Status::NotRunnable {
            return Err(Errno::BadEnv);
        }
        let (me, other) = table.pair_mut(caller, target).ok_or(Errno::BadEnv)?;
        std::mem::swap(&mut me.tf, &mut other.tf);
        std::mem::swap(&mut me.aspace, &mut other.aspace);
        self.destroy_locked(&mut table, target)
    }

    // === Pages === //

    pub fn sys_page_alloc(
        &self,
        caller: EnvId,
        id: EnvId,
        va: u32,
        perm: Perm,
    ) -> Result<(), Errno> {
        if va >= UTOP || !page_aligned(va) || !perm.user_ok() {
            return Err(Errno::Inval);
        }
        let mut table = self.table.lock();
        let e = table.lookup_mut(id, caller, true)?;
        e.aspace.alloc_page(va, perm);
        Ok(())
    }

    pub fn sys_page_map(
        &self,
        caller: EnvId,
        src: EnvId,
        src_va: u32,
        dst: EnvId,
        dst_va: u32,
        perm: Perm,
    ) -> Result<(), Errno> {
        if src_va >= UTOP || !page_aligned(src_va) || dst_va >= UTOP || !page_aligned(dst_va) {
            return Err(Errno::Inval);
        }
        if !perm.user_ok() {
            return Err(Errno::Inval);
        }
        let mut table = self.table.lock();
        let src = table.lookup(src, caller, true)?.id;
        let dst = table.lookup(dst, caller, true)?.id;

        let (frame, src_perm) = {
            let m = table
                .get(src)
                .ok_or(Errno::BadEnv)?
                .aspace
                .lookup(src_va)
                .ok_or(Errno::Inval)?;
            (m.frame.clone(), m.perm)
        };
        // Cannot grant write access to a read-only page.
        if perm.contains(Perm::W) && !src_perm.contains(Perm::W) {
            return Err(Errno::Inval);
        }
        table
            .get_mut(dst)
            .ok_or(Errno::BadEnv)?
            .aspace
            .map(dst_va, frame, perm);
        Ok(())
    }

    pub fn sys_page_unmap(&self, caller: EnvId, id: EnvId, va: u32) -> Result<(), Errno> {
        if va >= UTOP || !page_aligned(va) {
            return Err(Errno::Inval);
        }
        let mut table = self.table.lock();
        let e = table.lookup_mut(id, caller, true)?;
        e.aspace.unmap(va);
        Ok(())
    }

    /// Permissions of the mapping covering `va`, masked to the user-visible
    /// bits. No rights check, like reading the page walker window.
    pub fn sys_get_perms(&self, caller: EnvId, id: EnvId, va: u32) -> Result<Perm, Errno> {
        if !page_aligned(va) {
            return Err(Errno::Inval);
        }
        let table = self.table.lock();
        let e = table.lookup(id, caller, false)?;
        let perm = e.aspace.lookup_perm(va).ok_or(Errno::Inval)?;
        Ok(perm & Perm::SYSCALL)
    }

    /// 1024-byte window copy out of an environment's page into a
    /// caller-local buffer. Gateway-privileged: the gateways stream pages of
    /// environments they are not related to.
    pub fn sys_copy_mem_out(
        &self,
        caller: EnvId,
        id: EnvId,
        addr: u32,
        buf: &mut [u8; CHUNK],
    ) -> Result<(), Errno> {
        let table = self.table.lock();
        let e = Self::copy_mem_target(&table, caller, id)?;
        e.aspace.read_window(addr, buf)
    }

    /// Window copy into an environment's page.
    pub fn sys_copy_mem_in(
        &self,
        caller: EnvId,
        id: EnvId,
        addr: u32,
        buf: &[u8; CHUNK],
    ) -> Result<(), Errno> {
        let table = self.table.lock();
        let e = Self::copy_mem_target(&table, caller, id)?;
        e.aspace.write_window(addr, buf)
    }

    fn copy_mem_target<'t>(
        table: &'t EnvTable,
        caller: EnvId,
        id: EnvId,
    ) -> Result<&'t Env, Errno> {
        let me = table.lookup(EnvId::NONE, caller, false)?;
        let privileged = me.kind != Kind::User;
        table.lookup(id, caller, !privileged)
    }

    /// Read user memory of an environment the caller controls (or its own),
    /// without the 1024-byte framing.
    pub fn read_user(
        &self,
        caller: EnvId,
        id: EnvId,
        addr: u32,
        buf: &mut [u8],
    ) -> Result<(), Errno> {
        let table = self.table.lock();
        let e = table.lookup(id, caller, true)?;
        e.aspace.read_window(addr, buf)
    }

    pub fn write_user(&self, caller: EnvId, id: EnvId, addr: u32, buf: &[u8]) -> Result<(), Errno> {
        let table = self.table.lock();
        let e = table.lookup(id, caller, true)?;
        e.aspace.write_window(addr, buf)
    }

    // === IPC === //

    /// Block until another environment sends. `dstva < UTOP` announces
    /// willingness to receive a page there.
    pub fn sys_ipc_recv(&self, caller: EnvId, dstva: u32) -> Result<(u32, EnvId, Perm), Errno> {
        if dstva < UTOP && !page_aligned(dstva) {
            return Err(Errno::Inval);
        }
        let mut table = self.table.lock();
        {
            let e = table.get_mut(caller).ok_or(Errno::BadEnv)?;
            e.ipc.recving = true;
            e.ipc.dstva = dstva;
            e.ipc.value = 0;
            e.ipc.from = EnvId::NONE;
            e.ipc.perm = Perm::empty();
        }
        table.transition(caller, Status::NotRunnable)?;

        loop {
            match table.get(caller) {
                None => return Err(Errno::BadEnv),
                Some(e) if !e.ipc.recving && e.status == Status::Runnable => {
                    return Ok((e.ipc.value, e.ipc.from, e.ipc.perm));
                }
                Some(_) => {}
            }
            self.resume.wait(&mut table);
        }
    }

    /// The send syscall, including the bridge decision tree: aliens replying
    /// into their origin id family and sends to leased stubs divert through
    /// the client gateway instead of delivering locally.
    pub fn sys_ipc_try_send(
        self: &Arc<Self>,
        caller: EnvId,
        dst: EnvId,
        value: u32,
        srcva: u32,
        perm: Perm,
    ) -> Result<i32, Errno> {
        let mut table = self.table.lock();
        let (alien, host_family) = {
            let me = table.get(caller).ok_or(Errno::BadEnv)?;
            (me.alien, me.host_eid.family())
        };

        if alien && host_family == dst.family() {
            return self.bridge_send_locked(table, caller, dst, value, perm);
        }

        let status = table.lookup(dst, caller, false)?.status;
        match status {
            Status::Suspended => Err(Errno::IpcNotRecv),
            Status::Leased => self.bridge_send_locked(table, caller, dst, value, perm),
            _ => self
                .deliver_local_locked(&mut table, caller, dst, value, srcva, perm, None)
                .map(|_| 0),
        }
    }

    /// Gateway-privileged delivery that preserves the original sender's
    /// identity on a cross-node hop: the receiver observes `as_src`, not the
    /// gateway.
    pub fn sys_ipc_try_send_as(
        self: &Arc<Self>,
        caller: EnvId,
        as_src: EnvId,
        dst: EnvId,
        value: u32,
        srcva: u32,
        perm: Perm,
    ) -> Result<(), Errno> {
        let mut table = self.table.lock();
        self.require_gateway(&table, caller)?;
        if table.lookup(dst, caller, false)?.status == Status::Suspended {
            return Err(Errno::IpcNotRecv);
        }
        self.deliver_local_locked(&mut table, caller, dst, value, srcva, perm, Some(as_src))
    }

    fn deliver_local_locked(
        &self,
        table: &mut EnvTable,
        sender: EnvId,
        dst: EnvId,
        value: u32,
        srcva: u32,
        perm: Perm,
        as_src: Option<EnvId>,
    ) -> Result<(), Errno> {
        let (snd, rcv) = table.pair_mut(sender, dst).ok_or(Errno::BadEnv)?;
        if !rcv.ipc.recving {
            return Err(Errno::IpcNotRecv);
        }

        let mut granted = Perm::empty();
        if rcv.ipc.dstva < UTOP && srcva < UTOP {
            if !page_aligned(srcva) || !perm.user_ok() {
                return Err(Errno::Inval);
            }
            let m = snd.aspace.lookup(srcva).ok_or(Errno::Inval)?;
            if perm.contains(Perm::W) && !m.perm.contains(Perm::W) {
                return Err(Errno::Inval);
            }
            let frame = m.frame.clone();
            rcv.aspace.map(rcv.ipc.dstva, frame, perm);
            granted = perm;
        }

        rcv.ipc.recving = false;
        rcv.ipc.dstva = UTOP;
        rcv.ipc.value = value;
        rcv.ipc.from = as_src.unwrap_or(sender);
        rcv.ipc.perm = granted;
        // Receivers wait in NotRunnable by construction of sys_ipc_recv.
        debug_assert!(rcv.status.may_become(Status::Runnable));
        rcv.status = Status::Runnable;
        self.resume.notify_all();
        Ok(())
    }

    // === Suspension and the gateway hand-off === //

    /// Suspend the caller and hand a request to the client gateway: pack the
    /// argument words into a scratch page at `IPCSND`, grant it to the
    /// gateway read-only, unmap it, then park until `env_unsuspend`.
    fn suspend_to_gateway_locked(
        &self,
        mut table: MutexGuard<'_, EnvTable>,
        caller: EnvId,
        code: u32,
        words: &[u32],
    ) -> Result<Wake, Errno> {
        let gw = table.find_kind(Kind::GatewayClient).ok_or(Errno::BadEnv)?;

        table.transition(caller, Status::Suspended)?;
        {
            let e = table.get_mut(caller).ok_or(Errno::BadEnv)?;
            e.aspace.alloc_page(IPCSND, Perm::P | Perm::U | Perm::W);
            let mut buf = vec![0u8; words.len() * 4];
            for (i, w) in words.iter().enumerate() {
                buf[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
            }
            e.aspace.write_window(IPCSND, &buf).unwrap();
        }

        let sent = self.deliver_local_locked(
            &mut table,
            caller,
            gw,
            code,
            IPCSND,
            Perm::P | Perm::U,
            None,
        );
        if let Some(e) = table.get_mut(caller) {
            e.aspace.unmap(IPCSND);
        }

        if let Err(err) = sent {
            // Could not reach the gateway: back to running.
            warn!(target: "kern", "gateway hand-off for {caller} failed: {err}");
            let _ = table.transition(caller, Status::Runnable);
            return Err(err);
        }

        Ok(self.wait_resume_locked(table, caller))
    }

    fn wait_resume_locked(&self, mut table: MutexGuard<'_, EnvTable>, id: EnvId) -> Wake {
        loop {
            match table.get(id) {
                None => return Wake::Departed,
                Some(e) => match e.status {
                    Status::Suspended => {}
                    Status::Leased => return Wake::Departed,
                    _ => return Wake::Resumed(e.tf.regs[REG_RETVAL] as i32),
                },
            }
            self.resume.wait(&mut table);
        }
    }

    fn bridge_send_locked(
        &self,
        table: MutexGuard<'_, EnvTable>,
        caller: EnvId,
        dst: EnvId,
        value: u32,
        perm: Perm,
    ) -> Result<i32, Errno> {
        trace!(target: "kern", "diverting ipc {caller} -> {dst} through gateway");
        let wake = self.suspend_to_gateway_locked(
            table,
            caller,
            CLIENT_SEND_IPC,
            &[dst.0, value, perm.bits()],
        )?;
        match wake {
            Wake::Resumed(v) => Ok(v),
            // Destroyed while suspended; the body must stop.
            Wake::Departed => Err(Errno::BadEnv),
        }
    }

    /// Self-migration entry point. `Ok(Wake::Departed)` means the
    /// environment now runs elsewhere and this thread must unwind;
    /// `Ok(Wake::Resumed(v))` means migration failed and the body continues
    /// locally with `v` as the syscall result.
    pub fn sys_migrate(&self, caller: EnvId, thisenv_addr: u32) -> Result<Wake, Errno> {
        let table = self.table.lock();
        debug!(target: "kern", "migrate requested by {caller}");
        self.suspend_to_gateway_locked(
            table,
            caller,
            CLIENT_LEASE_REQUEST,
            &[caller.0, thisenv_addr],
        )
    }

    /// Invoked by an alien environment on exit so its origin node reaps the
    /// leased stub.
    pub fn sys_lease_complete(&self, caller: EnvId) -> Result<Wake, Errno> {
        let table = self.table.lock();
        debug!(target: "kern", "lease complete from {caller}");
        self.suspend_to_gateway_locked(table, caller, CLIENT_LEASE_COMPLETED, &[caller.0])
    }

    /// Gateway-only: report the outcome of out-of-band work on a suspended
    /// environment by overwriting its status and resume register.
    pub fn sys_env_unsuspend(
        &self,
        caller: EnvId,
        id: EnvId,
        status: Status,
        retval: i32,
    ) -> Result<(), Errno> {
        let mut table = self.table.lock();
        self.require_gateway(&table, caller)?;
        table.get_mut(id).ok_or(Errno::BadEnv)?.tf.regs[REG_RETVAL] = retval as u32;
        table.transition(id, status)?;
        self.resume.notify_all();
        Ok(())
    }

    /// Server-only: materialize an incoming lease as a fresh alien slot.
    /// The local parent is the gateway so it keeps build rights over the
    /// slot while pages stream in.
    pub fn sys_env_lease(&self, caller: EnvId, record: &EnvRecord) -> Result<EnvId, Errno> {
        let mut table = self.table.lock();
        self.require_gateway(&table, caller)?;
        if record.status != Status::Suspended {
            return Err(Errno::Inval);
        }

        let id = table.alloc(caller)?;
        let e = table.get_mut(id).unwrap();
        e.kind = record.kind;
        e.runs = record.runs;
        e.tf = record.tf;
        e.pgfault_upcall = record.pgfault_upcall;
        e.ipc.recving = record.ipc_recving;
        e.ipc.dstva = record.ipc_dstva;
        e.ipc.value = record.ipc_value;
        e.ipc.from = record.ipc_from;
        e.ipc.perm = Perm::from_bits_retain(record.ipc_perm);
        e.alien = true;
        e.host_ip = record.host_ip;
        e.host_port = record.host_port;
        e.host_eid = record.host_eid;
        // Pin the slot until DONE_LEASE arms it.
        table.transition(id, Status::Suspended)?;
        info!(target: "kern", "leased in {} as {id}", record.id);
        Ok(id)
    }

    /// Server-only: fix the reconstituted environment's user-level
    /// self-pointer to name its new local slot.
    pub fn sys_env_set_thisenv(
        &self,
        caller: EnvId,
        id: EnvId,
        user_addr: u32,
    ) -> Result<(), Errno> {
        let mut table = self.table.lock();
        self.require_gateway(&table, caller)?;
        let e = table.lookup_mut(id, caller, true)?;
        let local = e.id.0.to_le_bytes();
        e.aspace.write_window(user_addr, &local)
    }

    fn require_gateway(&self, table: &EnvTable, caller: EnvId) -> Result<(), Errno> {
        let me = table.get(caller).ok_or(Errno::BadEnv)?;
        if me.kind == Kind::User {
            return Err(Errno::BadEnv);
        }
        Ok(())
    }

    // === Body threads === //

    fn start_env_locked(self: &Arc<Self>, table: &mut EnvTable, id: EnvId) {
        let Some(e) = table.get_mut(id) else { return };
        if e.started || e.kind != Kind::User {
            return;
        }
        e.started = true;
        e.runs += 1;

        let kern = self.clone();
        let res = thread::Builder::new()
            .name(format!("env-{id}"))
            .spawn(move || user::run_env(kern, id));
        if let Err(err) = res {
            warn!(target: "kern", "could not start body thread for {id}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{channel, Sender};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::layout::UTEXT;
    use crate::mem::PGSIZE;

    const ENTRY_BASE: u32 = 0x40;
    const THISENV_VA: u32 = UTEXT + 4;

    fn kern_with<F>(register: F) -> Arc<Kern>
    where
        F: FnOnce(&mut ProgramRegistry),
    {
        let mut programs = ProgramRegistry::new();
        register(&mut programs);
        Kern::new(Arc::new(ManualClock::new(0)), programs)
    }

    fn report(tx: &Mutex<Sender<i32>>, v: i32) {
        tx.lock().unwrap().send(v).unwrap();
    }

    #[test]
    fn migrate_without_gateway_fails_fast() {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let kern = kern_with(|p| {
            p.register(ENTRY_BASE, move |env| {
                let r = env.migrate(0)?;
                report(&tx, r);
                Ok(())
            });
        });
        kern.spawn_user(ENTRY_BASE).unwrap();
        let r = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(r, Errno::BadEnv.code());
    }

    #[test]
    fn local_ipc_carries_value_sender_and_page() {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let kern = kern_with(|p| {
            p.register(ENTRY_BASE, move |env| {
                let (value, _from, perm) = env.ipc_recv(Some(UTEXT))?;
                assert!(perm.contains(Perm::P));
                let word = env.load_u32(UTEXT)?;
                report(&tx, value as i32);
                report(&tx, word as i32);
                Ok(())
            });
        });
        let rcv = kern.spawn_user(ENTRY_BASE).unwrap();

        // The test plays a second environment through a gateway slot.
        let me = kern.register_gateway(Kind::GatewayClient).unwrap();
        kern.sys_page_alloc(me, EnvId::NONE, UTEXT, Perm::P | Perm::U | Perm::W)
            .unwrap();
        kern.write_user(me, EnvId::NONE, UTEXT, &0x55aa_1234u32.to_le_bytes())
            .unwrap();

        // Spin until the receiver is parked.
        let sent = loop {
            match kern.sys_ipc_try_send(me, rcv, 0x42, UTEXT, Perm::P | Perm::U) {
                Err(Errno::IpcNotRecv) => thread::sleep(Duration::from_millis(2)),
                other => break other,
            }
        };
        assert_eq!(sent.unwrap(), 0);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0x42);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            0x55aa_1234u32 as i32
        );
    }

    #[test]
    fn suspension_handoff_and_resume_value() {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let kern = kern_with(|p| {
            p.register(ENTRY_BASE, move |env| {
                // Retry until the fake gateway below is parked in receive;
                // it then resumes us with a negative value and we keep
                // running locally.
                let r = loop {
                    let r = env.migrate(THISENV_VA)?;
                    if r != Errno::IpcNotRecv.code() {
                        break r;
                    }
                    thread::sleep(Duration::from_millis(2));
                };
                report(&tx, r);
                Ok(())
            });
        });

        let gw = kern.register_gateway(Kind::GatewayClient).unwrap();
        let migrator = kern.spawn_user(ENTRY_BASE).unwrap();

        // Act as the client gateway: receive the lease request.
        let (code, sender, _) = kern.sys_ipc_recv(gw, crate::layout::IPCRCV).unwrap();
        assert_eq!(code, CLIENT_LEASE_REQUEST);
        assert_eq!(sender, migrator);
        let mut raw = [0u8; 8];
        kern.read_user(gw, EnvId::NONE, crate::layout::IPCRCV, &mut raw)
            .unwrap();
        assert_eq!(
            u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            migrator.0
        );
        assert_eq!(
            u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            THISENV_VA
        );

        // While suspended, nobody can IPC the migrator.
        assert_eq!(
            kern.sys_ipc_try_send(gw, migrator, 1, crate::layout::UTOP, Perm::empty()),
            Err(Errno::IpcNotRecv)
        );
        assert_eq!(kern.env_status(migrator), Some(Status::Suspended));

        // Report failure; the environment resumes with the value we chose.
        kern.sys_env_unsuspend(gw, migrator, Status::Runnable, Errno::Inval.code())
            .unwrap();
        let r = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(r, Errno::Inval.code());
    }

    #[test]
    fn unsuspend_is_gateway_only() {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let kern = kern_with(|p| {
            p.register(ENTRY_BASE, move |env| {
                let r = match env
                    .kern()
                    .sys_env_unsuspend(env.id(), env.id(), Status::Runnable, 0)
                {
                    Ok(()) => 0,
                    Err(e) => e.code(),
                };
                report(&tx, r);
                Ok(())
            });
        });
        kern.spawn_user(ENTRY_BASE).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Errno::BadEnv.code()
        );
    }

    #[test]
    fn lease_in_stream_pages_and_arm() {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let kern = kern_with(|p| {
            p.register(ENTRY_BASE, move |env| {
                // Re-entered on the "destination": our self-pointer was
                // fixed up by the server before arming.
                let me = env.load_u32(THISENV_VA)?;
                report(&tx, me as i32);
                Ok(())
            });
        });

        let gw = kern.register_gateway(Kind::GatewayServer).unwrap();
        let mut tf = TrapFrame::default();
        tf.ip = ENTRY_BASE;
        let record = EnvRecord {
            id: EnvId(0x7b001),
            parent: EnvId(0x7b000),
            status: Status::Suspended,
            kind: Kind::User,
            runs: 1,
            tf,
            pgfault_upcall: 0,
            ipc_recving: false,
            ipc_dstva: 0,
            ipc_value: 0,
            ipc_from: EnvId::NONE,
            ipc_perm: 0,
            alien: false,
            host_ip: 0x7f00_0001,
            host_port: 7,
            host_eid: EnvId(0x7b001),
        };

        let local = kern.sys_env_lease(gw, &record).unwrap();
        let snap = kern.env_snapshot(local).unwrap();
        assert!(snap.alien);
        assert_eq!(snap.host_eid, EnvId(0x7b001));
        assert_eq!(snap.status, Status::Suspended);

        // Stream one page in, four chunks at a time, and check it
        // reassembles byte for byte.
        kern.sys_page_alloc(gw, local, UTEXT, Perm::P | Perm::U | Perm::W)
            .unwrap();
        for chunk in 0..(PGSIZE / CHUNK) as u32 {
            let fill = [chunk as u8 + 1; CHUNK];
            kern.sys_copy_mem_in(gw, local, UTEXT + chunk * CHUNK as u32, &fill)
                .unwrap();
        }
        for chunk in 0..(PGSIZE / CHUNK) as u32 {
            let mut back = [0u8; CHUNK];
            kern.sys_copy_mem_out(gw, local, UTEXT + chunk * CHUNK as u32, &mut back)
                .unwrap();
            assert_eq!(back, [chunk as u8 + 1; CHUNK]);
        }
        kern.sys_env_set_thisenv(gw, local, THISENV_VA).unwrap();
        kern.sys_env_set_status(gw, local, Status::Runnable).unwrap();

        let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap() as u32;
        assert_eq!(seen, local.0);
    }
}
