//! User-side runtime: registered program bodies, the per-environment thread
//! entry, and the syscall handle bodies program against.
//!
//! A program is a named body registered identically on every node, the moral
//! equivalent of both nodes running the same binary: the trap frame's
//! instruction pointer names the entry, and any progress a body wants to
//! survive migration must live in its pages, which it re-reads when the
//! destination node re-enters it.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::env::{EnvId, Status, TrapFrame};
use crate::error::Errno;
use crate::kern::{Kern, Wake};
use crate::layout::UTOP;
use crate::mem::Perm;

/// Why a body stopped running on this node: either its environment now runs
/// elsewhere (or was reaped under it), or it hit a fault the runner must
/// clean up after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departed {
    Migrated,
    Fault,
}

pub type UserResult = Result<(), Departed>;

pub type Program = Arc<dyn Fn(&UserEnv) -> UserResult + Send + Sync>;

/// Entry-point table shared by every node of a deployment.
#[derive(Clone, Default)]
pub struct ProgramRegistry {
    entries: HashMap<u32, Program>,
}

impl ProgramRegistry {
    pub fn new() -> ProgramRegistry {
        ProgramRegistry::default()
    }

    pub fn register<F>(&mut self, entry: u32, body: F)
    where
        F: Fn(&UserEnv) -> UserResult + Send + Sync + 'static,
    {
        self.entries.insert(entry, Arc::new(body));
    }

    pub fn get(&self, entry: u32) -> Option<Program> {
        self.entries.get(&entry).cloned()
    }
}

/// Thread entry for an environment body. Mirrors the user-space exit path:
/// a body that returns normally exits, which for an alien environment first
/// notifies its origin so the leased stub is reaped.
pub(crate) fn run_env(kern: Arc<Kern>, id: EnvId) {
    let entry = match kern.env_snapshot(id) {
        Ok(r) => r.tf.ip,
        Err(_) => return,
    };
    let Some(body) = kern.programs().get(entry) else {
        warn!(target: "user", "env {id} names unknown program entry {entry}");
        let _ = kern.sys_env_destroy(id, EnvId::NONE);
        return;
    };

    let env = UserEnv { kern: kern.clone(), id };
    match body(&env) {
        Ok(()) => env.exit(),
        Err(Departed::Migrated) => {
            trace!(target: "user", "env {id} departed this node");
        }
        Err(Departed::Fault) => {
            let _ = kern.sys_env_destroy(id, EnvId::NONE);
        }
    }
}

/// Handle a program body uses to talk to its kernel. Most calls return the
/// syscall's integer result (negative errno codes included) so bodies read
/// like their syscall-level originals; `Err(Departed)` is reserved for "stop
/// running this body here".
pub struct UserEnv {
    kern: Arc<Kern>,
    id: EnvId,
}

impl UserEnv {
    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn kern(&self) -> &Arc<Kern> {
        &self.kern
    }

    fn still_here(&self) -> bool {
        self.kern
            .env_status(self.id)
            .is_some_and(|s| s != Status::Leased)
    }

    /// Classify a syscall error: a vanished or leased-away slot ends the
    /// body silently, anything else is a body bug worth a warning.
    fn departed(&self, call: &str, err: Errno) -> Departed {
        if !self.still_here() {
            return Departed::Migrated;
        }
        warn!(target: "user", "env {}: {call} failed: {err}", self.id);
        Departed::Fault
    }

    fn code(&self, r: Result<(), Errno>) -> Result<i32, Departed> {
        match r {
            Ok(()) => Ok(0),
            Err(e) if !self.still_here() => Err(self.departed("syscall", e)),
            Err(e) => Ok(e.code()),
        }
    }

    // === Plain syscalls === //

    pub fn print(&self, msg: &str) {
        self.kern.sys_cputs(self.id, msg);
    }

    pub fn getenvid(&self) -> EnvId {
        self.kern.sys_getenvid(self.id)
    }

    pub fn time_msec(&self) -> u32 {
        self.kern.sys_time_msec()
    }

    pub fn yield_now(&self) {
        self.kern.sys_yield();
    }

    pub fn page_alloc(&self, env: EnvId, va: u32, perm: Perm) -> Result<i32, Departed> {
        self.code(self.kern.sys_page_alloc(self.id, env, va, perm))
    }

    pub fn page_map(
        &self,
        src: EnvId,
        src_va: u32,
        dst: EnvId,
        dst_va: u32,
        perm: Perm,
    ) -> Result<i32, Departed> {
        self.code(self.kern.sys_page_map(self.id, src, src_va, dst, dst_va, perm))
    }

    pub fn page_unmap(&self, env: EnvId, va: u32) -> Result<i32, Departed> {
        self.code(self.kern.sys_page_unmap(self.id, env, va))
    }

    /// Mapping permissions at `va`, or a negative code when unmapped.
    pub fn get_perms(&self, env: EnvId, va: u32) -> Result<i32, Departed> {
        match self.kern.sys_get_perms(self.id, env, va) {
            Ok(p) => Ok(p.bits() as i32),
            Err(e) if !self.still_here() => Err(self.departed("get_perms", e)),
            Err(e) => Ok(e.code()),
        }
    }

    pub fn set_status(&self, env: EnvId, status: Status) -> Result<i32, Departed> {
        self.code(self.kern.sys_env_set_status(self.id, env, status))
    }

    pub fn set_trapframe(&self, env: EnvId, tf: TrapFrame) -> Result<i32, Departed> {
        self.code(self.kern.sys_env_set_trapframe(self.id, env, tf))
    }

    pub fn set_pgfault_upcall(&self, env: EnvId, va: u32) -> Result<i32, Departed> {
        self.code(self.kern.sys_env_set_pgfault_upcall(self.id, env, va))
    }

    pub fn env_destroy(&self, env: EnvId) -> Result<i32, Departed> {
        self.code(self.kern.sys_env_destroy(self.id, env))
    }

    // === Own-memory access === //

    pub fn load_u32(&self, va: u32) -> Result<u32, Departed> {
        let mut buf = [0u8; 4];
        self.kern
            .read_user(self.id, EnvId::NONE, va, &mut buf)
            .map_err(|e| self.departed("load", e))?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn store_u32(&self, va: u32, value: u32) -> Result<(), Departed> {
        self.kern
            .write_user(self.id, EnvId::NONE, va, &value.to_le_bytes())
            .map_err(|e| self.departed("store", e))
    }

    // === IPC === //

    pub fn ipc_recv(&self, dstva: Option<u32>) -> Result<(u32, EnvId, Perm), Departed> {
        self.kern
            .sys_ipc_recv(self.id, dstva.unwrap_or(UTOP))
            .map_err(|e| self.departed("ipc_recv", e))
    }

    pub fn ipc_try_send(
        &self,
        to: EnvId,
        value: u32,
        srcva: Option<u32>,
        perm: Perm,
    ) -> Result<i32, Departed> {
        match self
            .kern
            .sys_ipc_try_send(self.id, to, value, srcva.unwrap_or(UTOP), perm)
        {
            Ok(v) => Ok(v),
            Err(e) if !self.still_here() => Err(self.departed("ipc_try_send", e)),
            Err(e) => Ok(e.code()),
        }
    }

    /// Send, spinning while the target is not ready — the user-library loop
    /// around the raw syscall. Returns the final non-retryable code.
    pub fn ipc_send(
        &self,
        to: EnvId,
        value: u32,
        srcva: Option<u32>,
        perm: Perm,
    ) -> Result<i32, Departed> {
        loop {
            let r = self.ipc_try_send(to, value, srcva, perm)?;
            if r == Errno::IpcNotRecv.code() {
                thread::sleep(Duration::from_millis(2));
                continue;
            }
            return Ok(r);
        }
    }

    // === Migration === //

    /// Ship this environment to the configured remote node. On success the
    /// body never observes a return here; it is re-entered on the remote
    /// side. A negative return means the migration failed and execution
    /// continues locally.
    pub fn migrate(&self, thisenv_addr: u32) -> Result<i32, Departed> {
        match self.kern.sys_migrate(self.id, thisenv_addr) {
            Ok(Wake::Resumed(v)) => Ok(v),
            Ok(Wake::Departed) => Err(Departed::Migrated),
            // Failed before suspension (no gateway, gateway busy): still
            // local, surface the code.
            Err(e) => Ok(e.code()),
        }
    }

    pub fn lease_complete(&self) -> Result<i32, Departed> {
        match self.kern.sys_lease_complete(self.id) {
            Ok(Wake::Resumed(v)) => Ok(v),
            Ok(Wake::Departed) => Err(Departed::Migrated),
            Err(e) => Ok(e.code()),
        }
    }

    // === Process management sugar === //

    /// Create a child running the registered program `entry` — exofork plus
    /// the trap-frame and status dance of a user-space spawn.
    pub fn spawn(&self, entry: u32) -> Result<EnvId, Departed> {
        let child = self
            .kern
            .sys_exofork(self.id)
            .map_err(|e| self.departed("exofork", e))?;
        let tf = TrapFrame {
            ip: entry,
            ..TrapFrame::default()
        };
        let r = self.set_trapframe(child, tf)?;
        debug_assert_eq!(r, 0);
        let r = self.set_status(child, Status::Runnable)?;
        debug_assert_eq!(r, 0);
        debug!(target: "user", "env {} spawned {child} at entry {entry}", self.id);
        Ok(child)
    }

    /// The user-space exit path: an alien environment tells its origin to
    /// reap the leased stub before freeing itself.
    pub fn exit(&self) {
        let alien = self
            .kern
            .env_snapshot(self.id)
            .map(|r| r.alien)
            .unwrap_or(false);
        if alien {
            let _ = self.lease_complete();
        }
        let _ = self.kern.sys_env_destroy(self.id, EnvId::NONE);
    }
}
