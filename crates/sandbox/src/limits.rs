//! Process-level isolation applied to every spawned child.
//!
//! The child becomes the leader of a new session (and therefore of a new
//! process group) before exec, and resource limits are applied in the same
//! pre-exec hook. Programs can still leave that group with `setsid` or by
//! daemonizing, so [`ProcessTree`] also tracks processes through an
//! environment marker and, with the worker acting as child subreaper,
//! through reparenting.

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::process::{Child, Command};

/// Largest file a program may create.
pub const MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Open file descriptor ceiling.
pub const MAX_OPEN_FILES: u64 = 256;

/// Resource limits for one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildLimits {
    /// `RLIMIT_AS`, when the runtime tolerates it.
    pub address_space: Option<u64>,
    pub file_size: u64,
    pub open_files: u64,
}

impl ChildLimits {
    /// Default limits with an optional address-space ceiling.
    pub fn new(address_space: Option<u64>) -> Self {
        Self {
            address_space,
            file_size: MAX_FILE_SIZE,
            open_files: MAX_OPEN_FILES,
        }
    }
}

/// Install the new session, rlimits and (optionally) reduced credentials.
pub fn apply(cmd: &mut Command, limits: ChildLimits, run_as: Option<(u32, u32)>) {
    if let Some((uid, gid)) = run_as {
        cmd.gid(gid);
        cmd.uid(uid);
    }

    // SAFETY: the hook runs between fork and exec and only calls
    // async-signal-safe functions (setsid, setrlimit).
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            apply_rlimits(&limits)
        });
    }
}

fn set_limit(resource: libc::c_int, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    // SAFETY: plain syscall on a stack value.
    if unsafe { libc::setrlimit(resource as _, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn apply_rlimits(limits: &ChildLimits) -> std::io::Result<()> {
    set_limit(libc::RLIMIT_CORE as libc::c_int, 0)?;
    set_limit(libc::RLIMIT_FSIZE as libc::c_int, limits.file_size)?;
    set_limit(libc::RLIMIT_NOFILE as libc::c_int, limits.open_files)?;
    if let Some(bytes) = limits.address_space {
        set_limit(libc::RLIMIT_AS as libc::c_int, bytes)?;
    }
    Ok(())
}

/// Environment variable tagging every process of one step.
pub const EXECUTION_MARKER: &str = "CODERUNNER_EXECUTION";

/// Leaders spawned by this process that tokio still owns. Spawning and
/// sweeping both hold the lock, so a fresh leader is never mistaken for an
/// orphan.
static LEADERS: Mutex<Vec<i32>> = Mutex::new(Vec::new());

static SUBREAPER: OnceLock<bool> = OnceLock::new();

fn leaders() -> MutexGuard<'static, Vec<i32>> {
    LEADERS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Make this process the reaper of every orphaned descendant, so programs
/// that daemonize stay attributable. Idempotent.
pub fn enable_subreaper() -> bool {
    *SUBREAPER.get_or_init(|| {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: plain prctl on the calling process.
            let rc = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1 as libc::c_ulong, 0, 0, 0) };
            if rc != 0 {
                tracing::warn!(
                    error = %std::io::Error::last_os_error(),
                    "Cannot become child subreaper; escaped processes reparent to init"
                );
            }
            rc == 0
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    })
}

#[cfg(target_os = "linux")]
fn subreaper_active() -> bool {
    SUBREAPER.get().copied().unwrap_or(false)
}

/// Spawn `cmd` tagged with a fresh marker and track everything it starts.
pub fn spawn_contained(cmd: &mut Command) -> std::io::Result<(Child, ProcessTree)> {
    let token = uuid::Uuid::new_v4().simple().to_string();
    cmd.env(EXECUTION_MARKER, &token);

    let mut registered = leaders();
    let child = cmd.spawn()?;
    let leader = child.id().map(|p| p as i32);
    if let Some(pid) = leader {
        registered.push(pid);
    }
    Ok((child, ProcessTree { leader, token }))
}

/// Every process started by one step: the leader's group and session,
/// anything carrying the step's marker, and their descendants. Killed as a
/// whole on timeout, after the leader exits, and on drop.
#[derive(Debug)]
pub struct ProcessTree {
    leader: Option<i32>,
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    token: String,
}

impl ProcessTree {
    /// `SIGKILL` the whole tree and reap what was reparented to us.
    ///
    /// The leader itself is signalled but never reaped here; its `Child`
    /// handle owns that.
    pub fn kill(&self) {
        let Some(leader) = self.leader else {
            return;
        };
        // SAFETY: negative pid targets the process group; ESRCH (group
        // already gone) is expected and ignored.
        unsafe {
            libc::kill(-leader, libc::SIGKILL);
        }
        #[cfg(target_os = "linux")]
        procfs::sweep(leader, &self.token);
    }
}

impl Drop for ProcessTree {
    fn drop(&mut self) {
        self.kill();
        if let Some(pid) = self.leader {
            leaders().retain(|p| *p != pid);
        }
    }
}

#[cfg(target_os = "linux")]
mod procfs {
    use std::collections::HashSet;
    use std::fs;
    use std::time::{Duration, Instant};

    use super::{leaders, subreaper_active, EXECUTION_MARKER};

    /// Bound on kill rounds against a tree that keeps forking.
    const MAX_ROUNDS: usize = 16;
    /// How long to wait for killed orphans to become reapable.
    const REAP_WINDOW: Duration = Duration::from_millis(200);

    #[derive(Debug, Clone, Copy)]
    pub(super) struct ProcInfo {
        pub pid: i32,
        pub ppid: i32,
        pub pgrp: i32,
        pub session: i32,
        pub zombie: bool,
    }

    /// Parse `/proc/<pid>/stat`; the command name may contain spaces and
    /// parentheses, so fields are read after the last `)`.
    pub(super) fn parse_stat(pid: i32, stat: &str) -> Option<ProcInfo> {
        let rest = &stat[stat.rfind(')')? + 1..];
        let mut fields = rest.split_whitespace();
        let state = fields.next()?;
        Some(ProcInfo {
            pid,
            ppid: fields.next()?.parse().ok()?,
            pgrp: fields.next()?.parse().ok()?,
            session: fields.next()?.parse().ok()?,
            zombie: state == "Z",
        })
    }

    fn snapshot() -> Vec<ProcInfo> {
        let Ok(entries) = fs::read_dir("/proc") else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|e| e.file_name().to_str()?.parse::<i32>().ok())
            .filter_map(|pid| {
                let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
                parse_stat(pid, &stat)
            })
            .collect()
    }

    fn has_marker(pid: i32, needle: &[u8]) -> bool {
        fs::read(format!("/proc/{}/environ", pid))
            .map(|env| env.split(|b| *b == 0).any(|var| var == needle))
            .unwrap_or(false)
    }

    /// Processes belonging to the tree of `leader`, excluding the leader.
    pub(super) fn members(
        procs: &[ProcInfo],
        leader: i32,
        me: i32,
        live_leaders: &[i32],
        adopt_orphans: bool,
        marked: impl Fn(i32) -> bool,
    ) -> HashSet<i32> {
        let mut found: HashSet<i32> = procs
            .iter()
            .filter(|p| p.pid != leader && p.pid != me)
            .filter(|p| {
                p.pgrp == leader
                    || p.session == leader
                    || p.ppid == leader
                    || (adopt_orphans && p.ppid == me && !live_leaders.contains(&p.pid))
                    || (!p.zombie && marked(p.pid))
            })
            .map(|p| p.pid)
            .collect();

        loop {
            let before = found.len();
            for p in procs {
                if p.pid != leader && found.contains(&p.ppid) {
                    found.insert(p.pid);
                }
            }
            if found.len() == before {
                return found;
            }
        }
    }

    pub(super) fn sweep(leader: i32, token: &str) {
        let me = std::process::id() as i32;
        let needle = format!("{}={}", EXECUTION_MARKER, token).into_bytes();
        let adopt = subreaper_active();

        let mut killed: HashSet<i32> = HashSet::new();
        for _ in 0..MAX_ROUNDS {
            let fresh: Vec<i32> = {
                let live = leaders();
                let procs = snapshot();
                let members = members(&procs, leader, me, &live, adopt, |pid| {
                    has_marker(pid, &needle)
                });
                let fresh: Vec<i32> = members.into_iter().filter(|p| !killed.contains(p)).collect();
                for pid in &fresh {
                    // SAFETY: plain signal; ESRCH for an already-gone pid is harmless.
                    unsafe {
                        libc::kill(*pid, libc::SIGKILL);
                    }
                }
                fresh
            };
            if fresh.is_empty() {
                break;
            }
            killed.extend(fresh);
        }

        if !killed.is_empty() {
            tracing::debug!(leader, killed = killed.len(), "Killed escaped processes");
        }
        if adopt {
            reap_orphans(me);
        }
    }

    /// Collect exit statuses of orphans reparented to this process so they
    /// do not linger as zombies. Registered leaders are left to tokio.
    fn reap_orphans(me: i32) {
        let started = Instant::now();
        loop {
            let orphans: Vec<i32> = {
                let live = leaders();
                snapshot()
                    .into_iter()
                    .filter(|p| p.ppid == me && !live.contains(&p.pid))
                    .map(|p| p.pid)
                    .collect()
            };
            let mut pending = false;
            for pid in orphans {
                let mut status = 0;
                // SAFETY: waits on one specific pid that tokio does not own.
                let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
                if rc == 0 {
                    pending = true;
                }
            }
            if !pending || started.elapsed() >= REAP_WINDOW {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::procfs::{members, parse_stat, ProcInfo};

    fn proc(pid: i32, ppid: i32, pgrp: i32, session: i32) -> ProcInfo {
        ProcInfo {
            pid,
            ppid,
            pgrp,
            session,
            zombie: false,
        }
    }

    #[test]
    fn test_parse_stat_with_awkward_name() {
        let info = parse_stat(42, "42 (evil) name)) S 7 42 42 0 -1 4194304").unwrap();
        assert_eq!(info.ppid, 7);
        assert_eq!(info.pgrp, 42);
        assert_eq!(info.session, 42);
        assert!(!info.zombie);

        assert!(parse_stat(43, "43 (sh) Z 1 43 43").unwrap().zombie);
        assert!(parse_stat(44, "garbage").is_none());
    }

    #[test]
    fn test_members_follow_group_session_marker_and_descendants() {
        let me = 100;
        let leader = 200;
        let procs = [
            proc(me, 1, me, me),
            proc(leader, me, leader, leader),
            proc(201, leader, leader, leader),
            // setsid escapee: new group and session, still a child.
            proc(202, leader, 202, 202),
            proc(203, 202, 202, 202),
            // Daemonized, reparented to us, environment scrubbed.
            proc(204, me, 204, 204),
            // Another execution's live leader and its child.
            proc(300, me, 300, 300),
            proc(301, 300, 300, 300),
            // Marked, parented elsewhere.
            proc(400, 1, 400, 400),
            proc(401, 400, 400, 400),
            // Unrelated.
            proc(500, 1, 500, 500),
        ];

        let found = members(&procs, leader, me, &[leader, 300], true, |pid| pid == 400);
        let mut found: Vec<i32> = found.into_iter().collect();
        found.sort();
        assert_eq!(found, vec![201, 202, 203, 204, 400, 401]);

        let without_adoption = members(&procs, leader, me, &[leader, 300], false, |_| false);
        assert!(!without_adoption.contains(&204));
        assert!(without_adoption.contains(&203));
    }
}
