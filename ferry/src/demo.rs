//! Demo programs for `ferryd` and the integration tests.
//!
//! Bodies are phase machines: everything that must survive migration lives
//! in the environment's pages, so a body re-entered on the destination node
//! reads its phase word and picks up where the origin left off.

use std::thread;
use std::time::Duration;

use kern::layout::{USTACKTOP, UTEXT};
use kern::{Departed, EnvId, Errno, Perm, ProgramRegistry, UserEnv, UserResult, PGSIZE};

pub const HELLO: u32 = 1;
pub const SHUTTLE_PARENT: u32 = 2;
pub const SHUTTLE_CHILD: u32 = 3;

/// Word the body's progress phase lives at.
pub const PHASE_VA: u32 = UTEXT;
/// User-level self-pointer; `DONE_LEASE` rewrites it on the destination.
pub const THISENV_VA: u32 = UTEXT + 4;
/// Scratch result word programs leave for observers.
pub const RESULT_VA: u32 = UTEXT + 8;

const STACK_VA: u32 = USTACKTOP - PGSIZE as u32;

pub fn register_demos(reg: &mut ProgramRegistry) {
    reg.register(HELLO, hello);
    reg.register(SHUTTLE_PARENT, shuttle_parent);
    reg.register(SHUTTLE_CHILD, shuttle_child);
}

/// First-run setup: a fresh environment has no pages yet; one re-entered
/// after migration arrives with them shipped.
pub fn boot(env: &UserEnv) -> Result<(), Departed> {
    if env.get_perms(EnvId::NONE, UTEXT)? < 0 {
        env.page_alloc(EnvId::NONE, UTEXT, Perm::P | Perm::U | Perm::W)?;
        env.page_alloc(EnvId::NONE, STACK_VA, Perm::P | Perm::U | Perm::W)?;
        env.store_u32(PHASE_VA, 0)?;
        env.store_u32(THISENV_VA, env.getenvid().0)?;
    }
    Ok(())
}

/// Migrate, retrying while the gateway is momentarily busy with another
/// request (the raw syscall fails fast rather than queueing).
pub fn migrate_retry(env: &UserEnv, thisenv: u32) -> Result<i32, Departed> {
    loop {
        let r = env.migrate(thisenv)?;
        if r == Errno::IpcNotRecv.code() {
            thread::sleep(Duration::from_millis(2));
            continue;
        }
        return Ok(r);
    }
}

/// Migrate once, then say hello from wherever we landed.
fn hello(env: &UserEnv) -> UserResult {
    boot(env)?;
    if env.load_u32(PHASE_VA)? == 0 {
        env.store_u32(PHASE_VA, 1)?;
        let r = migrate_retry(env, THISENV_VA)?;
        if r < 0 {
            env.print("migration failed, staying home");
        }
    }
    let me = env.load_u32(THISENV_VA)?;
    env.print(&format!("hello world, i am environment {me:08x}"));
    Ok(())
}

/// Spawn a child that migrates, then IPC it a value across the node
/// boundary.
fn shuttle_parent(env: &UserEnv) -> UserResult {
    boot(env)?;
    let child = env.spawn(SHUTTLE_CHILD)?;
    env.store_u32(RESULT_VA, child.0)?;
    env.print(&format!("i am parent environment {}", env.getenvid()));

    let r = env.ipc_send(child, 0x100, None, Perm::empty())?;
    if r == 0 {
        env.print("sent child 0x100");
    } else {
        env.print(&format!("ipc to child failed: {r}"));
    }
    Ok(())
}

fn shuttle_child(env: &UserEnv) -> UserResult {
    boot(env)?;
    if env.load_u32(PHASE_VA)? == 0 {
        env.store_u32(PHASE_VA, 1)?;
        let r = migrate_retry(env, THISENV_VA)?;
        if r < 0 {
            env.print("migration failed, receiving at home");
        }
    }
    let me = env.load_u32(THISENV_VA)?;
    env.print(&format!("hello world, i am child environment {me:08x}"));

    let (value, from, _perm) = env.ipc_recv(None)?;
    env.store_u32(RESULT_VA, value)?;
    env.print(&format!("parent {from} sent me {value:#x}"));
    Ok(())
}
