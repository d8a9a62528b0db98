use crate::config::{Config, ListenerSpec, NetworkClassifier, Protocol};
use crate::dns::Resolver;
use crate::handlers;
use crate::metrics::{self, Aggregator, ChildReport};
use crate::milter::MilterConnection;
use crate::pipeline::Pipeline;
use crate::smtp;
use anyhow::{bail, Context};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const IDENT: &str = "authmilter";

/// Seconds between a failed run and the automatic restart.
const RESTART_DELAY: Duration = Duration::from_secs(10);
/// Restarts inside this window before the master gives up.
const RESTART_WINDOW: Duration = Duration::from_secs(120);
const RESTART_LIMIT: usize = 4;

static SIG_CHLD: AtomicBool = AtomicBool::new(false);
static SIG_HUP: AtomicBool = AtomicBool::new(false);
static SIG_QUIT: AtomicBool = AtomicBool::new(false);
static SIG_TERM: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(signal: libc::c_int) {
    match signal {
        libc::SIGCHLD => SIG_CHLD.store(true, Ordering::SeqCst),
        libc::SIGHUP => SIG_HUP.store(true, Ordering::SeqCst),
        libc::SIGQUIT | libc::SIGINT => SIG_QUIT.store(true, Ordering::SeqCst),
        libc::SIGTERM => SIG_TERM.store(true, Ordering::SeqCst),
        _ => {}
    }
}

fn install_signal(signal: libc::c_int) {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signal, &action, std::ptr::null_mut());
    }
}

/// An error no restart can fix: bad handler list, pipeline cycle, or a
/// worker-signaled fatality. The master exits nonzero instead of looping.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct FatalGlobalError(pub String);

fn install_parent_signals() {
    for signal in [libc::SIGCHLD, libc::SIGHUP, libc::SIGQUIT, libc::SIGINT, libc::SIGTERM] {
        install_signal(signal);
    }
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn install_worker_signals() {
    // Workers only care about TERM (finish the current message, then
    // exit); everything else reverts to the default disposition.
    for signal in [libc::SIGCHLD, libc::SIGHUP, libc::SIGQUIT, libc::SIGINT] {
        unsafe {
            libc::signal(signal, libc::SIG_DFL);
        }
    }
    SIG_TERM.store(false, Ordering::SeqCst);
    SIG_QUIT.store(false, Ordering::SeqCst);
    install_signal(libc::SIGTERM);
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// True once this worker has been asked to stop; checked between
/// messages, never mid-message.
pub fn worker_should_exit() -> bool {
    SIG_TERM.load(Ordering::SeqCst) || SIG_QUIT.load(Ordering::SeqCst)
}

/// Set the process title visible in ps / /proc/<pid>/comm.
pub fn set_process_title(title: &str) {
    let truncated: String = title.chars().take(15).collect();
    if let Ok(cstr) = std::ffi::CString::new(truncated) {
        unsafe {
            libc::prctl(libc::PR_SET_NAME, cstr.as_ptr(), 0, 0, 0);
        }
    }
}

pub fn master_title() -> String {
    format!("{IDENT}:master")
}

/// Tracks failed runs so a crash loop cannot spin forever: four or more
/// restarts inside the window mean the master abandons and exits nonzero.
pub struct RestartThrottle {
    failures: Vec<Instant>,
}

impl RestartThrottle {
    pub fn new() -> Self {
        RestartThrottle { failures: Vec::new() }
    }

    /// Record one failure; returns true when automatic restart should be
    /// abandoned.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.failures.push(now);
        self.failures
            .retain(|t| now.duration_since(*t) <= RESTART_WINDOW);
        self.failures.len() >= RESTART_LIMIT
    }
}

impl Default for RestartThrottle {
    fn default() -> Self {
        Self::new()
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    fn raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Unix(l) => l.as_raw_fd(),
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()> {
        match self {
            Listener::Tcp(l) => l.set_nonblocking(nonblocking),
            Listener::Unix(l) => l.set_nonblocking(nonblocking),
        }
    }
}

enum Accepted {
    Tcp(TcpStream, SocketAddr),
    Unix(UnixStream),
}

pub struct BoundListener {
    name: String,
    listener: Listener,
    is_metrics: bool,
}

/// Bind every configured listener up front, in the parent, before
/// privileges are dropped.
pub fn bind_listeners(config: &Config) -> anyhow::Result<Vec<BoundListener>> {
    let mut bound = Vec::new();
    for (name, spec, umask) in config.data_listeners()? {
        log::info!("binding listener {name} on {spec}");
        bound.push(BoundListener {
            name,
            listener: bind_spec(&spec, config.listen_backlog, umask)?,
            is_metrics: false,
        });
    }
    if let Some(spec) = config.metric_listener()? {
        log::info!("binding metrics listener on {spec}");
        bound.push(BoundListener {
            name: "metrics".to_string(),
            listener: bind_spec(&spec, config.listen_backlog, None)?,
            is_metrics: true,
        });
    }
    Ok(bound)
}

fn bind_spec(spec: &ListenerSpec, backlog: i32, umask: Option<u32>) -> anyhow::Result<Listener> {
    match spec {
        ListenerSpec::Inet { port, host } => Ok(Listener::Tcp(bind_tcp(host, *port, backlog)?)),
        ListenerSpec::Unix { path } => Ok(Listener::Unix(bind_unix(path, backlog, umask)?)),
    }
}

fn bind_tcp(host: &str, port: u16, backlog: i32) -> anyhow::Result<TcpListener> {
    let addr = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving listener host {host}"))?
        .next()
        .with_context(|| format!("no addresses for listener host {host}"))?;

    unsafe {
        let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            bail!("socket: {}", std::io::Error::last_os_error());
        }
        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let rc = match addr {
            SocketAddr::V4(v4) => {
                let mut sa: libc::sockaddr_in = std::mem::zeroed();
                sa.sin_family = libc::AF_INET as libc::sa_family_t;
                sa.sin_port = v4.port().to_be();
                sa.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                libc::bind(
                    fd,
                    &sa as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
            SocketAddr::V6(v6) => {
                let mut sa: libc::sockaddr_in6 = std::mem::zeroed();
                sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sa.sin6_port = v6.port().to_be();
                sa.sin6_addr.s6_addr = v6.ip().octets();
                libc::bind(
                    fd,
                    &sa as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            bail!("bind {host}:{port}: {err}");
        }
        if libc::listen(fd, backlog) != 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            bail!("listen {host}:{port}: {err}");
        }
        Ok(TcpListener::from_raw_fd(fd))
    }
}

fn bind_unix(path: &Path, backlog: i32, umask: Option<u32>) -> anyhow::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let old_umask = umask.map(|mask| unsafe { libc::umask(mask as libc::mode_t) });

    let result = (|| -> anyhow::Result<UnixListener> {
        unsafe {
            let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
            if fd < 0 {
                bail!("socket: {}", std::io::Error::last_os_error());
            }
            let mut sa: libc::sockaddr_un = std::mem::zeroed();
            sa.sun_family = libc::AF_UNIX as libc::sa_family_t;
            let bytes = path.as_os_str().as_encoded_bytes();
            if bytes.len() >= sa.sun_path.len() {
                libc::close(fd);
                bail!("socket path too long: {}", path.display());
            }
            for (i, b) in bytes.iter().enumerate() {
                sa.sun_path[i] = *b as libc::c_char;
            }
            let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
            if libc::bind(fd, &sa as *const _ as *const libc::sockaddr, len as libc::socklen_t) != 0
            {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                bail!("bind {}: {err}", path.display());
            }
            if libc::listen(fd, backlog) != 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                bail!("listen {}: {err}", path.display());
            }
            Ok(UnixListener::from_raw_fd(fd))
        }
    })();

    if let Some(old) = old_umask {
        unsafe {
            libc::umask(old);
        }
    }
    result
}

/// Drop root privileges to `runas`/`rungroup`, optionally chrooting
/// first. A no-op (with a log line) when not started as root.
pub fn drop_privileges(config: &Config) -> anyhow::Result<()> {
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        if config.runas.is_some() || config.chroot.is_some() {
            log::warn!("not running as root; runas/chroot settings ignored");
        }
        return Ok(());
    }

    if let Some(group) = &config.rungroup {
        let gid = lookup_gid(group).with_context(|| format!("unknown rungroup {group}"))?;
        if unsafe { libc::setgid(gid) } != 0 {
            bail!("setgid {group}: {}", std::io::Error::last_os_error());
        }
    }
    if let Some(dir) = &config.chroot {
        let cdir = std::ffi::CString::new(dir.as_str())?;
        if unsafe { libc::chroot(cdir.as_ptr()) } != 0 {
            bail!("chroot {dir}: {}", std::io::Error::last_os_error());
        }
        std::env::set_current_dir("/")?;
    }
    if let Some(user) = &config.runas {
        let uid = lookup_uid(user).with_context(|| format!("unknown runas user {user}"))?;
        if unsafe { libc::setuid(uid) } != 0 {
            bail!("setuid {user}: {}", std::io::Error::last_os_error());
        }
        log::info!("dropped privileges to {user}");
    }
    Ok(())
}

pub fn lookup_uid(user: &str) -> Option<libc::uid_t> {
    let cuser = std::ffi::CString::new(user).ok()?;
    let pw = unsafe { libc::getpwnam(cuser.as_ptr()) };
    if pw.is_null() {
        None
    } else {
        Some(unsafe { (*pw).pw_uid })
    }
}

fn lookup_gid(group: &str) -> Option<libc::gid_t> {
    let cgroup = std::ffi::CString::new(group).ok()?;
    let gr = unsafe { libc::getgrnam(cgroup.as_ptr()) };
    if gr.is_null() {
        None
    } else {
        Some(unsafe { (*gr).gr_gid })
    }
}

#[derive(Clone, Copy, PartialEq)]
enum ChildState {
    Waiting,
    Processing,
}

type ChildTable = Arc<Mutex<HashMap<libc::pid_t, ChildState>>>;

/// The master run loop wrapper: restart on failure with a 10s delay,
/// abandon after too many failures in a short window.
pub fn run_master(config_path: &str, mut config: Config) -> i32 {
    let mut throttle = RestartThrottle::new();
    loop {
        match supervise(config_path, &mut config) {
            Ok(()) => return 0,
            Err(err) => {
                log::error!("supervisor failed: {err:#}");
                if err.downcast_ref::<FatalGlobalError>().is_some() {
                    return 1;
                }
                if throttle.record_failure(Instant::now()) {
                    log::error!("Abandoning automatic restart");
                    return 1;
                }
                log::info!("restarting in {}s", RESTART_DELAY.as_secs());
                std::thread::sleep(RESTART_DELAY);
                // Pick up configuration fixes between attempts.
                if let Ok(reloaded) = Config::from_file(config_path) {
                    config = reloaded;
                }
            }
        }
    }
}

/// The prefork supervisor proper: bind, drop privileges, then keep the
/// worker pool sized until asked to quit.
fn supervise(config_path: &str, config: &mut Config) -> anyhow::Result<()> {
    install_parent_signals();
    set_process_title(&master_title());

    let listeners = Arc::new(bind_listeners(config)?);
    drop_privileges(config)?;

    // Fail fast on configuration that can never produce a working
    // worker: an unknown handler name or an unbuildable pipeline order
    // would kill every child the same way.
    {
        let resolver = Arc::new(Resolver::new(
            Some(Duration::from_secs(config.dns_timeout)),
            config.dns_cache_size,
        )?);
        let handlers = handlers::build_handlers(config, &resolver)
            .map_err(|err| FatalGlobalError(format!("{err:#}")))?;
        Pipeline::build(handlers).map_err(|err| FatalGlobalError(format!("{err:#}")))?;
    }
    handlers::pre_loop_setup(config)?;

    let aggregator = Arc::new(Aggregator::default());
    let table: ChildTable = Arc::new(Mutex::new(HashMap::new()));
    let mut crash_throttle = RestartThrottle::new();

    log::info!(
        "supervisor running, workers {}..{} (spares {}..{})",
        config.min_children,
        config.max_children,
        config.min_spare_children,
        config.max_spare_children
    );

    loop {
        if SIG_CHLD.swap(false, Ordering::SeqCst) {
            let abnormal = reap_children(&table);
            for _ in 0..abnormal {
                if crash_throttle.record_failure(Instant::now()) {
                    log::error!("Abandoning automatic restart");
                    shutdown_children(&table);
                    cleanup_sockets(config);
                    return Err(
                        FatalGlobalError("too many worker failures".to_string()).into()
                    );
                }
            }
        }

        if SIG_QUIT.swap(false, Ordering::SeqCst) {
            log::info!("shutdown requested, draining workers");
            shutdown_children(&table);
            cleanup_sockets(config);
            return Ok(());
        }

        if SIG_TERM.swap(false, Ordering::SeqCst) {
            // A worker reports an unrecoverable startup problem this way.
            shutdown_children(&table);
            cleanup_sockets(config);
            return Err(FatalGlobalError("terminated by worker fatal error".to_string()).into());
        }

        if SIG_HUP.swap(false, Ordering::SeqCst) {
            log::info!("SIGHUP: reloading configuration");
            match Config::from_file(config_path) {
                Ok(reloaded) => {
                    if reloaded.data_listeners().ok() != config.data_listeners().ok() {
                        log::warn!(
                            "listener changes require a full restart; keeping existing sockets"
                        );
                    }
                    *config = reloaded;
                    // Old workers keep their current connections and exit
                    // once done; replacements pick up the new config.
                    for pid in table.lock().unwrap().keys() {
                        unsafe {
                            libc::kill(*pid, libc::SIGTERM);
                        }
                    }
                }
                Err(err) => log::error!("reload failed, keeping old configuration: {err:#}"),
            }
        }

        let (count, idle) = {
            let table = table.lock().unwrap();
            let idle = table.values().filter(|s| **s == ChildState::Waiting).count();
            (table.len(), idle)
        };

        if count < config.min_children
            || (idle < config.min_spare_children && count < config.max_children)
        {
            spawn_worker(config, &listeners, &aggregator, &table)?;
        } else if idle > config.max_spare_children && count > config.min_children {
            retire_one_idle_worker(&table);
        } else {
            std::thread::sleep(Duration::from_millis(200));
        }
    }
}

/// Reap exited workers; returns how many exited abnormally.
fn reap_children(table: &ChildTable) -> usize {
    let mut abnormal = 0;
    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        metrics::REAPED_CHILDREN.inc();
        table.lock().unwrap().remove(&pid);
        if libc::WIFSIGNALED(status)
            || (libc::WIFEXITED(status) && libc::WEXITSTATUS(status) != 0)
        {
            log::warn!("worker {pid} exited abnormally (status {status})");
            abnormal += 1;
        } else {
            log::debug!("reaped worker {pid}");
        }
    }
    abnormal
}

fn shutdown_children(table: &ChildTable) {
    for pid in table.lock().unwrap().keys() {
        unsafe {
            libc::kill(*pid, libc::SIGTERM);
        }
    }
    // Workers finish their current message, then exit.
    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        if pid > 0 {
            metrics::REAPED_CHILDREN.inc();
            table.lock().unwrap().remove(&pid);
            continue;
        }
        if pid == -1
            && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR)
        {
            continue;
        }
        break;
    }
}

fn cleanup_sockets(config: &Config) {
    let Ok(listeners) = config.data_listeners() else {
        return;
    };
    for (_, spec, _) in listeners {
        if let ListenerSpec::Unix { path } = spec {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn retire_one_idle_worker(table: &ChildTable) {
    let victim = table
        .lock()
        .unwrap()
        .iter()
        .find(|(_, state)| **state == ChildState::Waiting)
        .map(|(pid, _)| *pid);
    if let Some(pid) = victim {
        log::debug!("retiring surplus idle worker {pid}");
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
}

fn spawn_worker(
    config: &Config,
    listeners: &Arc<Vec<BoundListener>>,
    aggregator: &Arc<Aggregator>,
    table: &ChildTable,
) -> anyhow::Result<()> {
    handlers::pre_fork_setup(config);
    let (parent_side, child_side) = UnixStream::pair()?;

    let pid = unsafe { libc::fork() };
    match pid {
        -1 => bail!("fork: {}", std::io::Error::last_os_error()),
        0 => {
            drop(parent_side);
            let code = worker_main(config.clone(), listeners, child_side);
            std::process::exit(code);
        }
        pid => {
            drop(child_side);
            metrics::FORKED_CHILDREN.inc();
            table.lock().unwrap().insert(pid, ChildState::Waiting);
            log::debug!("forked worker {pid}");

            let aggregator = aggregator.clone();
            let table = table.clone();
            std::thread::spawn(move || child_channel_loop(pid, parent_side, aggregator, table));
            Ok(())
        }
    }
}

/// Parent-side thread servicing one worker's channel: metric deltas,
/// status flips, and aggregated dump requests.
fn child_channel_loop(
    pid: libc::pid_t,
    stream: UnixStream,
    aggregator: Arc<Aggregator>,
    table: ChildTable,
) {
    let Ok(writer) = stream.try_clone() else {
        return;
    };
    let mut writer = writer;
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else {
            break;
        };
        match aggregator.apply_line(&line) {
            ChildReport::Waiting => {
                table.lock().unwrap().insert(pid, ChildState::Waiting);
            }
            ChildReport::Processing => {
                table.lock().unwrap().insert(pid, ChildState::Processing);
            }
            ChildReport::DumpRequested => {
                let body = aggregator.render();
                if writer.write_all(body.as_bytes()).is_err()
                    || writer.write_all(b".\n").is_err()
                {
                    break;
                }
            }
            ChildReport::Metric | ChildReport::Unknown => {}
        }
    }
}

/// Worker entry point after fork. Never returns to the supervisor loop;
/// the exit code flows through `process::exit`.
fn worker_main(config: Config, listeners: &Arc<Vec<BoundListener>>, channel: UnixStream) -> i32 {
    install_worker_signals();
    unsafe {
        // Each worker gets its own RNG stream.
        libc::srand(libc::getpid() as libc::c_uint ^ libc::time(std::ptr::null_mut()) as libc::c_uint);
    }
    if let Err(err) = metrics::set_child_channel(channel) {
        log::error!("worker channel setup failed: {err:#}");
    }
    set_process_title(&format!("{IDENT}:waiting(0)"));

    match serve(config, listeners) {
        Ok(code) => code,
        Err(err) => {
            // Startup failures here are global: an unknown handler or an
            // unbuildable pipeline order will hit every future worker the
            // same way, so tell the parent to stop respawning us.
            log::error!("worker startup failed: {err:#}");
            unsafe {
                libc::kill(libc::getppid(), libc::SIGTERM);
            }
            1
        }
    }
}

fn serve(config: Config, listeners: &Arc<Vec<BoundListener>>) -> anyhow::Result<i32> {
    let resolver = Arc::new(Resolver::new(
        Some(Duration::from_secs(config.dns_timeout)),
        config.dns_cache_size,
    )?);
    let handlers = handlers::build_handlers(&config, &resolver)?;
    for handler in &handlers {
        handler.register_metrics();
    }
    let mut pipeline = Pipeline::build(handlers)?;
    let classifier = NetworkClassifier::from_config(&config)?;

    for listener in listeners.iter() {
        listener.listener.set_nonblocking(true)?;
    }
    metrics::report_status(false);

    let mut served = 0usize;
    let mut exit_code = 0;
    'accept: while served < config.max_requests_per_child && !worker_should_exit() {
        let mut fds: Vec<libc::pollfd> = listeners
            .iter()
            .map(|l| libc::pollfd {
                fd: l.listener.raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 1000) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            bail!("poll: {err}");
        }
        if rc == 0 {
            continue;
        }

        for (listener, fd) in listeners.iter().zip(&fds) {
            if fd.revents & libc::POLLIN == 0 {
                continue;
            }
            let accepted = match accept_on(&listener.listener) {
                Ok(Some(accepted)) => accepted,
                Ok(None) => continue, // raced with a sibling worker
                Err(err) => {
                    log::error!("accept on {} failed: {err}", listener.name);
                    continue;
                }
            };

            if listener.is_metrics {
                serve_metrics(accepted);
                continue;
            }

            metrics::connection(&listener.name);
            metrics::report_status(true);
            set_process_title(&format!("{IDENT}:processing({})", served + 1));

            let budget = config.max_requests_per_child - served;
            let outcome = serve_data_connection(
                accepted,
                &mut pipeline,
                &config,
                &classifier,
                &resolver,
                budget,
            );
            match outcome {
                Ok(outcome) => {
                    served += outcome.messages;
                    if outcome.exit_on_close {
                        if let Some(error) = outcome.exit_on_close_error {
                            log::error!("worker exiting on request: {error}");
                            exit_code = 1;
                        } else {
                            log::info!("worker exiting on request after diagnostic dump");
                        }
                        break 'accept;
                    }
                }
                Err(err) => {
                    // Connection-scoped failure; the worker carries on.
                    log::error!("connection failed: {err:#}");
                }
            }

            metrics::report_status(false);
            set_process_title(&format!("{IDENT}:waiting({served})"));
        }
    }

    if served >= config.max_requests_per_child {
        log::info!("request budget of {} served, worker retiring", config.max_requests_per_child);
    }
    Ok(exit_code)
}

fn accept_on(listener: &Listener) -> std::io::Result<Option<Accepted>> {
    match listener {
        Listener::Tcp(l) => match l.accept() {
            Ok((stream, addr)) => Ok(Some(Accepted::Tcp(stream, addr))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        },
        Listener::Unix(l) => match l.accept() {
            Ok((stream, _)) => Ok(Some(Accepted::Unix(stream))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        },
    }
}

fn serve_metrics(accepted: Accepted) {
    let result = match accepted {
        Accepted::Tcp(mut stream, _) => metrics::serve_scrape(&mut stream),
        Accepted::Unix(mut stream) => metrics::serve_scrape(&mut stream),
    };
    if let Err(err) = result {
        log::debug!("metrics scrape failed: {err}");
    }
}

fn serve_data_connection(
    accepted: Accepted,
    pipeline: &mut Pipeline,
    config: &Config,
    classifier: &NetworkClassifier,
    resolver: &Arc<Resolver>,
    budget: usize,
) -> anyhow::Result<crate::milter::ConnOutcome> {
    let timeout = Some(Duration::from_secs(config.message_timeout));
    match accepted {
        Accepted::Tcp(stream, addr) => {
            stream.set_read_timeout(timeout)?;
            stream.set_write_timeout(timeout)?;
            match config.protocol {
                Protocol::Milter => {
                    MilterConnection::new(stream, pipeline, config, classifier, budget).handle()
                }
                Protocol::Smtp => smtp::handle_connection(
                    stream,
                    Some(addr.ip()),
                    pipeline,
                    config,
                    classifier,
                    resolver,
                    budget,
                ),
            }
        }
        Accepted::Unix(stream) => {
            stream.set_read_timeout(timeout)?;
            stream.set_write_timeout(timeout)?;
            match config.protocol {
                Protocol::Milter => {
                    MilterConnection::new(stream, pipeline, config, classifier, budget).handle()
                }
                Protocol::Smtp => smtp::handle_connection(
                    stream, None, pipeline, config, classifier, resolver, budget,
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_throttle_abandons_after_four_in_window() {
        let mut throttle = RestartThrottle::new();
        let base = Instant::now();
        assert!(!throttle.record_failure(base));
        assert!(!throttle.record_failure(base + Duration::from_secs(15)));
        assert!(!throttle.record_failure(base + Duration::from_secs(30)));
        // Fourth failure within 120s: give up.
        assert!(throttle.record_failure(base + Duration::from_secs(45)));
    }

    #[test]
    fn test_restart_throttle_allows_spaced_failures() {
        let mut throttle = RestartThrottle::new();
        let base = Instant::now();
        for i in 0..6 {
            // One failure per 100s: never four inside any 120s window.
            assert!(
                !throttle.record_failure(base + Duration::from_secs(100 * i)),
                "failure {i} should not abandon"
            );
        }
    }

    #[test]
    fn test_restart_throttle_window_expiry() {
        let mut throttle = RestartThrottle::new();
        let base = Instant::now();
        assert!(!throttle.record_failure(base));
        assert!(!throttle.record_failure(base + Duration::from_secs(1)));
        assert!(!throttle.record_failure(base + Duration::from_secs(2)));
        // The early burst has aged out by the time of the fourth failure.
        assert!(!throttle.record_failure(base + Duration::from_secs(200)));
    }

    #[test]
    fn test_master_title() {
        assert_eq!(master_title(), "authmilter:master");
    }
}
