use crate::config::Config;
use crate::supervisor::{self, master_title};
use anyhow::{bail, Context};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

/// How long `stop` waits for the master to drain before giving up.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

pub fn write_pid_file(path: &str) -> anyhow::Result<()> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("creating pid file {path}"))?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}

pub fn read_pid_file(path: &str) -> anyhow::Result<libc::pid_t> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading pid file {path}"))?;
    content
        .trim()
        .parse::<libc::pid_t>()
        .with_context(|| format!("invalid pid in {path}"))
}

pub fn remove_pid_file(path: &str) {
    let _ = std::fs::remove_file(path);
}

fn pid_alive(pid: libc::pid_t) -> bool {
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// The process name the kernel reports for `pid`, when readable.
fn process_comm(pid: libc::pid_t) -> Option<String> {
    let comm = std::fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
    Some(comm.trim_end().to_string())
}

/// A pid file names a running master when the pid is alive AND its
/// process name matches ours; if the platform will not let us read
/// process names, pid liveness alone has to suffice.
pub fn master_running(pid_file: &str) -> Option<libc::pid_t> {
    let pid = read_pid_file(pid_file).ok()?;
    if !pid_alive(pid) {
        return None;
    }
    match process_comm(pid) {
        Some(comm) => {
            let expected: String = master_title().chars().take(15).collect();
            if comm == expected {
                Some(pid)
            } else {
                None
            }
        }
        None => Some(pid),
    }
}

/// `status` exit code: 0 running, nonzero otherwise.
pub fn status(pid_file: &str) -> i32 {
    match master_running(pid_file) {
        Some(pid) => {
            println!("{} is running (pid {pid})", supervisor::IDENT);
            0
        }
        None => {
            println!("{} is not running", supervisor::IDENT);
            1
        }
    }
}

/// Stop a running master with SIGQUIT (drain and exit) and wait for it
/// to go away.
pub fn stop(pid_file: &str) -> i32 {
    let Some(pid) = master_running(pid_file) else {
        eprintln!("{} is not running", supervisor::IDENT);
        return 1;
    };
    unsafe {
        libc::kill(pid, libc::SIGQUIT);
    }
    let deadline = Instant::now() + STOP_TIMEOUT;
    while pid_alive(pid) {
        if Instant::now() > deadline {
            eprintln!("master {pid} did not exit within {}s", STOP_TIMEOUT.as_secs());
            return 1;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    remove_pid_file(pid_file);
    println!("{} stopped", supervisor::IDENT);
    0
}

/// Start the master: daemonize (root only; otherwise logged and run in
/// the foreground), redirect stderr to the error log, write the pid
/// file, and enter the supervisor's restart loop.
pub fn start(config_path: &str, pid_file: &str, config: Config, foreground: bool) -> i32 {
    if master_running(pid_file).is_some() {
        eprintln!("{} is already running", supervisor::IDENT);
        return 1;
    }

    let euid = unsafe { libc::geteuid() };
    if !foreground {
        if euid == 0 {
            if let Err(err) = daemonize() {
                eprintln!("daemonization failed: {err:#}");
                return 1;
            }
        } else {
            log::warn!("daemonization requires euid 0; staying in the foreground");
        }
    }

    if let Err(err) = open_error_log(&config) {
        log::warn!("cannot open error log {}: {err:#}", config.error_log);
    }
    if let Err(err) = write_pid_file(pid_file) {
        log::error!("cannot write pid file: {err:#}");
        return 1;
    }

    let code = supervisor::run_master(config_path, config);
    remove_pid_file(pid_file);
    code
}

pub fn restart(config_path: &str, pid_file: &str, config: Config, foreground: bool) -> i32 {
    if master_running(pid_file).is_some() && stop(pid_file) != 0 {
        return 1;
    }
    start(config_path, pid_file, config, foreground)
}

/// Classic double-dissociation: fork, setsid, chdir /, detach stdio.
fn daemonize() -> anyhow::Result<()> {
    match unsafe { libc::fork() } {
        -1 => bail!("fork: {}", std::io::Error::last_os_error()),
        0 => {}
        _ => std::process::exit(0),
    }
    if unsafe { libc::setsid() } == -1 {
        bail!("setsid: {}", std::io::Error::last_os_error());
    }
    std::env::set_current_dir("/")?;

    // stdin/stdout to /dev/null, stderr to the error log so panics and
    // env_logger output land somewhere useful.
    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    unsafe {
        use std::os::fd::AsRawFd;
        libc::dup2(devnull.as_raw_fd(), 0);
        libc::dup2(devnull.as_raw_fd(), 1);
        libc::dup2(devnull.as_raw_fd(), 2);
    }
    Ok(())
}

/// The error log is opened before privileges drop and handed to the
/// runas user so workers can keep writing to it.
fn open_error_log(config: &Config) -> anyhow::Result<()> {
    let path = &config.error_log;
    if let Some(parent) = Path::new(path).parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {path}"))?;

    if unsafe { libc::geteuid() } == 0 {
        if let Some(user) = &config.runas {
            if let Some(uid) = supervisor::lookup_uid(user) {
                let cpath = std::ffi::CString::new(path.as_str())?;
                unsafe {
                    libc::chown(cpath.as_ptr(), uid, libc::gid_t::MAX);
                }
            }
        }
    }

    unsafe {
        use std::os::fd::AsRawFd;
        libc::dup2(file.as_raw_fd(), 2);
    }
    // The dup keeps fd 2 alive; the File handle may close.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_round_trip() {
        let path = std::env::temp_dir().join(format!("authmilter-test-{}.pid", std::process::id()));
        let path = path.to_str().unwrap().to_string();
        write_pid_file(&path).unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), std::process::id() as libc::pid_t);
        remove_pid_file(&path);
        assert!(read_pid_file(&path).is_err());
    }

    #[test]
    fn test_own_pid_is_alive() {
        assert!(pid_alive(std::process::id() as libc::pid_t));
        assert!(!pid_alive(0));
    }

    #[test]
    fn test_master_running_rejects_foreign_process() {
        // Our own pid is alive but is not named authmilter:master, so a
        // pid file pointing at us must not count as running.
        let path =
            std::env::temp_dir().join(format!("authmilter-test-mr-{}.pid", std::process::id()));
        let path = path.to_str().unwrap().to_string();
        write_pid_file(&path).unwrap();
        assert!(master_running(&path).is_none());
        remove_pid_file(&path);
    }

    #[test]
    fn test_missing_pid_file_is_not_running() {
        assert!(master_running("/nonexistent/authmilter.pid").is_none());
    }
}
