//! Process-tree ownership. On POSIX children run in their own process group
//! so signals reach the full tree. On Windows each child is placed in a
//! kill-on-close Job Object: closing the handle terminates the whole tree,
//! and the job's accounting answers "is anything still alive". `taskkill /T`
//! is only the fallback for children a job could not be attached to.

#[cfg(windows)]
use crate::sm::events::sm_event;

/// Owns the platform facility that binds one child's descendants together.
/// One handle per spawned child; replaced on every spawn, dropped when the
/// tree is confirmed dead.
pub struct TreeHandle {
    pid: u32,
    #[cfg(windows)]
    job: Option<job::JobHandle>,
}

#[cfg(unix)]
pub fn prepare_command(cmd: &mut tokio::process::Command) {
    unsafe {
        cmd.pre_exec(|| {
            if nix::libc::setpgid(0, 0) == 0 {
                Ok(())
            } else {
                Err(std::io::Error::last_os_error())
            }
        });
    }
}

#[cfg(windows)]
pub fn prepare_command(cmd: &mut tokio::process::Command) {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(unix)]
pub fn attach_tree(pid: u32, _child: &tokio::process::Child) -> TreeHandle {
    TreeHandle { pid }
}

/// Create a kill-on-close job and put the child in it. When that fails the
/// handle degrades to taskkill-based control of the visible tree.
#[cfg(windows)]
pub fn attach_tree(pid: u32, child: &tokio::process::Child) -> TreeHandle {
    let job = match job::JobHandle::create_kill_on_close() {
        Ok(job) => match child.raw_handle() {
            Some(handle) => match job.assign(handle) {
                Ok(()) => Some(job),
                Err(e) => {
                    sm_event(
                        "process",
                        None,
                        format!("pid={pid} job assign failed err={e}; falling back to taskkill"),
                    );
                    None
                }
            },
            None => None,
        },
        Err(e) => {
            sm_event(
                "process",
                None,
                format!("pid={pid} job object unavailable err={e}; falling back to taskkill"),
            );
            None
        }
    };
    TreeHandle { pid, job }
}

#[cfg(unix)]
impl TreeHandle {
    /// Ask the whole tree to exit (SIGTERM to the process group).
    pub fn terminate(&mut self) -> anyhow::Result<()> {
        signal_group(self.pid, nix::sys::signal::Signal::SIGTERM)
    }

    /// Forcibly kill the whole tree (SIGKILL to the process group).
    pub fn kill(&mut self) -> anyhow::Result<()> {
        signal_group(self.pid, nix::sys::signal::Signal::SIGKILL)
    }

    /// True while any member of the child's process group is still alive.
    pub fn alive(&self) -> bool {
        group_alive(self.pid)
    }
}

#[cfg(windows)]
impl TreeHandle {
    /// Terminate the tree. The job handle is kill-on-close, so releasing it
    /// takes every member down with it; jobless children get `taskkill /T`.
    pub fn terminate(&mut self) -> anyhow::Result<()> {
        match self.job.take() {
            Some(job) => {
                job.terminate();
                Ok(())
            }
            None => taskkill(self.pid, false),
        }
    }

    pub fn kill(&mut self) -> anyhow::Result<()> {
        match self.job.take() {
            Some(job) => {
                job.terminate();
                Ok(())
            }
            None => taskkill(self.pid, true),
        }
    }

    /// True while the job still accounts live processes (or, without a job,
    /// while the direct child has not exited).
    pub fn alive(&self) -> bool {
        match &self.job {
            Some(job) => job.active_processes() > 0,
            None => process_alive(self.pid),
        }
    }
}

#[cfg(unix)]
pub fn group_alive(pid: u32) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    kill(Pid::from_raw(-(pid as i32)), None::<Signal>).is_ok()
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: nix::sys::signal::Signal) -> anyhow::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), sig) {
        Ok(()) => Ok(()),
        // Group already gone.
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow::anyhow!(
            "failed to signal process group {pid} with {sig}: {e}"
        )),
    }
}

#[cfg(windows)]
fn process_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return false;
        }
        let mut code: u32 = 0;
        let ok = GetExitCodeProcess(handle, &mut code);
        CloseHandle(handle);
        ok != 0 && code == STILL_ACTIVE as u32
    }
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> anyhow::Result<()> {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.arg("/PID").arg(pid.to_string()).arg("/T");
    if force {
        cmd.arg("/F");
    }
    let out = cmd
        .output()
        .map_err(|e| anyhow::anyhow!("failed to run taskkill for pid {pid}: {e}"))?;
    // taskkill exits 128 when the target is already gone; that is not an error here.
    if out.status.success() || out.status.code() == Some(128) {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "taskkill for pid {pid} failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ))
    }
}

#[cfg(windows)]
mod job {
    use std::io;
    use std::os::windows::io::RawHandle;

    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
        JOBOBJECT_BASIC_ACCOUNTING_INFORMATION, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JobObjectBasicAccountingInformation, JobObjectExtendedLimitInformation,
        QueryInformationJobObject, SetInformationJobObject, TerminateJobObject,
    };

    /// A kill-on-close job object. Dropping the handle terminates every
    /// process still assigned to the job.
    pub struct JobHandle(HANDLE);

    // HANDLE is a raw pointer; the job object itself is thread-safe.
    unsafe impl Send for JobHandle {}

    impl JobHandle {
        pub fn create_kill_on_close() -> io::Result<Self> {
            unsafe {
                let handle = CreateJobObjectW(std::ptr::null(), std::ptr::null());
                if handle.is_null() {
                    return Err(io::Error::last_os_error());
                }
                let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = std::mem::zeroed();
                info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
                let ok = SetInformationJobObject(
                    handle,
                    JobObjectExtendedLimitInformation,
                    &info as *const _ as *const core::ffi::c_void,
                    size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
                );
                if ok == 0 {
                    let err = io::Error::last_os_error();
                    CloseHandle(handle);
                    return Err(err);
                }
                Ok(Self(handle))
            }
        }

        pub fn assign(&self, process: RawHandle) -> io::Result<()> {
            unsafe {
                if AssignProcessToJobObject(self.0, process as HANDLE) == 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }

        /// Number of processes currently alive in the job.
        pub fn active_processes(&self) -> u32 {
            unsafe {
                let mut info: JOBOBJECT_BASIC_ACCOUNTING_INFORMATION = std::mem::zeroed();
                let ok = QueryInformationJobObject(
                    self.0,
                    JobObjectBasicAccountingInformation,
                    &mut info as *mut _ as *mut core::ffi::c_void,
                    size_of::<JOBOBJECT_BASIC_ACCOUNTING_INFORMATION>() as u32,
                    std::ptr::null_mut(),
                );
                if ok == 0 {
                    return 0;
                }
                info.ActiveProcesses
            }
        }

        pub fn terminate(&self) {
            unsafe {
                TerminateJobObject(self.0, 1);
            }
        }
    }

    impl Drop for JobHandle {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #[cfg(unix)]
    #[test]
    fn signaling_a_dead_group_is_not_an_error() {
        // A PID far above any live process: ESRCH is swallowed.
        let mut tree = super::TreeHandle { pid: 0x3FFF_FF00 };
        assert!(tree.terminate().is_ok());
        assert!(tree.kill().is_ok());
        assert!(!tree.alive());
        assert!(!super::group_alive(0x3FFF_FF00));
    }
}
