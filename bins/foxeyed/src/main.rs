//! foxeyed - the FoxEye daemon.
//!
//! Startup mirrors the historical tool: option parsing, config and PID
//! file handling, fork into the background, then the dispatcher loop.
//! Exit codes: 0 success, 1 option error, 3 fatal startup, 5 fork or PID
//! write failure, 6 already running, 7 lock stack corruption, 10 fatal
//! signal, 2 out of memory.

mod console;
mod debuglog;

use std::ffi::CString;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use foxeye::config::{split_lang, Settings};
use foxeye::core::Core;
use foxeye::dispatcher::{Flag, IfaceKind};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "foxeyed",
    disable_version_flag = true,
    about = "FoxEye chat/bot daemon",
    override_usage = "foxeyed [-n nick] [-cqdmt] <file>\n       foxeyed -cr [-n nick] [-dm] [-g <file>]\n       foxeyed -[h|v]"
)]
struct Cli {
    /// Don't detach console (chat simulation mode).
    #[arg(short = 'c')]
    console: bool,

    /// Increase the debug level by one.
    #[arg(short = 'd', action = clap::ArgAction::Count)]
    debug: u8,

    /// Keep a persistent debug log in ./foxeye.debug.
    #[arg(short = 'D')]
    debug_log: bool,

    /// Generate a config file.
    #[arg(short = 'g', value_name = "FILE")]
    generate: Option<PathBuf>,

    /// Make empty user and channel files.
    #[arg(short = 'm')]
    make_files: bool,

    /// Set the default nick.
    #[arg(short = 'n', value_name = "NICK")]
    nick: Option<String>,

    /// Print only fatal errors.
    #[arg(short = 'q')]
    quiet: bool,

    /// Reset parameters (don't use the config file statements).
    #[arg(short = 'r')]
    reset: bool,

    /// Test the configuration and exit.
    #[arg(short = 't')]
    test: bool,

    /// Version information.
    #[arg(short = 'v')]
    version: bool,

    /// Config file name.
    config: Option<PathBuf>,
}

fn print_version() {
    println!("FoxEye {}", env!("CARGO_PKG_VERSION"));
}

/// PID file lives beside the config, named `<nick>.pid`.
fn pid_path(config: Option<&Path>, nick: &str) -> PathBuf {
    let dir = config
        .and_then(|c| c.parent())
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    dir.join(format!("{nick}.pid"))
}

/// Exit 6 when a live daemon owns the PID file; stale files are removed.
fn check_pid_file(path: &Path, quiet: bool) -> Result<(), i32> {
    let Ok(body) = std::fs::read_to_string(path) else { return Ok(()) };
    let Ok(pid) = body.trim().parse::<i32>() else {
        let _ = std::fs::remove_file(path);
        return Ok(());
    };
    // SAFETY: kill with signal 0 only probes for existence.
    let alive = unsafe { libc::kill(pid, 0) } == 0;
    if alive {
        if !quiet {
            eprintln!("The bot already running!");
        }
        return Err(6);
    }
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    if errno != libc::ESRCH {
        if !quiet {
            eprintln!("kill PID file: {}", std::io::Error::last_os_error());
        }
        return Err(6);
    }
    let _ = std::fs::remove_file(path);
    Ok(())
}

fn write_pid(path: &Path, pid: i32) -> std::io::Result<()> {
    let mut f = std::fs::OpenOptions::new().write(true).create_new(true).open(path)?;
    write!(f, "{pid}")
}

/// Fatal CPU signals route through a best-effort cleanup then re-raise so
/// a core file is produced.
static FATAL_PID_PATH: std::sync::atomic::AtomicPtr<libc::c_char> =
    std::sync::atomic::AtomicPtr::new(std::ptr::null_mut());

extern "C" fn fatal_handler(signo: libc::c_int) {
    // SAFETY: async-signal context; only write(2), unlink(2), raise(2).
    unsafe {
        let msg = b"Caught fatal signal, shutdown...\n";
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        let p = FATAL_PID_PATH.load(std::sync::atomic::Ordering::Relaxed);
        if !p.is_null() {
            libc::unlink(p);
        }
        libc::signal(signo, libc::SIG_DFL);
        libc::raise(signo);
    }
}

fn install_fatal_handlers(pidfile: &Path) {
    if let Ok(c) = CString::new(pidfile.as_os_str().as_encoded_bytes()) {
        FATAL_PID_PATH.store(c.into_raw(), std::sync::atomic::Ordering::Relaxed);
    }
    // SAFETY: plain handler registration.
    unsafe {
        for sig in [
            libc::SIGQUIT,
            libc::SIGABRT,
            libc::SIGILL,
            libc::SIGFPE,
            libc::SIGSEGV,
            libc::SIGBUS,
            libc::SIGSYS,
        ] {
            libc::signal(sig, fatal_handler as libc::sighandler_t);
        }
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGUSR1, libc::SIG_IGN);
        libc::signal(libc::SIGUSR2, libc::SIG_IGN);
    }
}

fn main() {
    let mut lang_charset = None;
    if let Ok(lang) = std::env::var("LANG") {
        let (_locale, cs) = split_lang(&lang);
        lang_charset = cs.map(str::to_owned);
    }

    let cli = match Cli::try_parse() {
        Ok(c) => c,
        Err(e) => {
            // clap already prints usage for -h; anything else is an
            // option error
            if e.kind() == clap::error::ErrorKind::DisplayHelp {
                let _ = e.print();
                std::process::exit(0);
            }
            let _ = e.print();
            std::process::exit(1);
        }
    };
    if cli.version {
        if !cli.quiet {
            print_version();
        }
        std::process::exit(0);
    }
    let console = cli.console && !cli.quiet;

    // config path must be absolute so a restart finds it again
    let config_path = cli.config.as_ref().map(|p| {
        if p.is_absolute() {
            p.clone()
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    });
    if let Some(cp) = &config_path {
        if let Some(dir) = cp.parent() {
            if !dir.as_os_str().is_empty() && std::env::set_current_dir(dir).is_err() {
                eprintln!("cannot chdir: {}", dir.display());
                std::process::exit(1);
            }
        }
    }
    if config_path.is_none() && !cli.reset {
        if !cli.quiet {
            eprintln!("Incorrect options. Type 'foxeyed -h' for more help.");
        }
        std::process::exit(1);
    }

    let settings = Arc::new(Settings::with_core_defaults());
    if let Some(cs) = &lang_charset {
        let _ = foxeye::charset::startup_charset(cs);
    }
    let mut bad_lines = 0;
    if !cli.reset {
        if let Some(cp) = &config_path {
            match std::fs::read_to_string(cp) {
                Ok(body) => bad_lines = settings.apply(&body),
                Err(e) => {
                    if !cli.quiet {
                        eprintln!("cannot read config {}: {e}", cp.display());
                    }
                    std::process::exit(1);
                }
            }
        }
    }
    if let Some(n) = &cli.nick {
        settings.set("nick", n);
    }
    if cli.test {
        if bad_lines > 0 {
            if !cli.quiet {
                eprintln!("config test: {bad_lines} bad line(s)");
            }
            std::process::exit(1);
        }
        std::process::exit(0);
    }
    if let Some(g) = &cli.generate {
        let mut body = String::new();
        if let Ok(exe) = std::env::current_exe() {
            body.push_str(&format!("#!{}\n", exe.display()));
        }
        body.push_str(&settings.dump());
        if std::fs::write(g, body).is_err() {
            eprintln!("cannot write config {}", g.display());
            std::process::exit(1);
        }
    }
    let nick = settings.get_str("nick");
    if nick.is_empty() {
        if !cli.quiet {
            eprintln!("Cannot run without a nick!");
        }
        std::process::exit(3);
    }
    if cli.make_files {
        for ext in ["users", "channels"] {
            let _ = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(format!("{nick}.{ext}"));
        }
    }

    let pidfile = pid_path(config_path.as_deref(), &nick);
    if let Err(code) = check_pid_file(&pidfile, cli.quiet) {
        std::process::exit(code);
    }

    if !console {
        // SAFETY: single-threaded here; the runtime starts only in the
        // child.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => {
                eprintln!("fork dispatcher: {}", std::io::Error::last_os_error());
                std::process::exit(5);
            }
            child if child > 0 => {
                // parent: record the child and get out of the way
                if write_pid(&pidfile, child).is_err() {
                    eprintln!("write PID file: {}", std::io::Error::last_os_error());
                    // SAFETY: taking the half-started child down with us.
                    unsafe { libc::kill(child, libc::SIGTERM) };
                    std::process::exit(5);
                }
                std::process::exit(0);
            }
            _ => {
                // SAFETY: standard daemon detach in the fresh child.
                unsafe {
                    libc::setsid();
                    libc::umask(0);
                    let devnull = CString::new("/dev/null").unwrap();
                    let fd = libc::open(devnull.as_ptr(), libc::O_RDWR);
                    if fd >= 0 {
                        libc::dup2(fd, 0);
                        libc::dup2(fd, 1);
                        libc::dup2(fd, 2);
                        if fd > 2 {
                            libc::close(fd);
                        }
                    }
                }
            }
        }
    } else if write_pid(&pidfile, std::process::id() as i32).is_err() {
        eprintln!("Cannot write a PID file!");
        std::process::exit(3);
    }

    install_fatal_handlers(&pidfile);
    debuglog::init(cli.debug, cli.debug_log, console);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("cannot start runtime: {e}");
            std::process::exit(2);
        }
    };
    rt.block_on(daemon_main(settings, pidfile, cli, config_path));
}

async fn daemon_main(
    settings: Arc<Settings>,
    pidfile: PathBuf,
    cli: Cli,
    config_path: Option<PathBuf>,
) {
    let core = Core::new(settings.clone(), None);
    let r = core.handle();
    r.bus.lock().pid_path = Some(pidfile.clone());
    core.start_boot();
    let _dcc = foxeye::dcc::register(&r);
    if cli.console {
        console::attach(&r);
    }
    let listen = settings.get_int("listen-port");
    if listen > 0 {
        let spec = foxeye::listener::ListenSpec {
            client: None,
            host: None,
            port: listen as u16,
            confline: Some(format!("set listen-port {listen}")),
            on_bound: None,
            prehandler: None,
            handler: std::sync::Arc::new(foxeye::dcc::direct_accept_handler),
        };
        let mut bus = r.bus.lock();
        if foxeye::listener::listen_port(&mut bus, &r, spec).is_err() {
            error!(listen, "cannot open the direct-service port");
        }
    }
    info!(nick = settings.get_str("nick"), "FoxEye booted");
    core.end_boot();

    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("SIGTERM hook");
    let mut hup = signal(SignalKind::hangup()).expect("SIGHUP hook");
    let mut int = signal(SignalKind::interrupt()).expect("SIGINT hook");

    loop {
        tokio::select! {
            _ = core.run() => unreachable!("dispatcher loop never returns"),
            _ = term.recv() => {
                core.shutdown("Got SIGTERM, shutdown...", 0);
            }
            _ = hup.recv() => {
                debuglog::reopen(cli.debug_log);
                r.bus.add_request(IfaceKind::LOG, "*", Flag::BOOT, "Got SIGHUP: rehashing...");
                core.flush_all();
            }
            _ = int.recv() => {
                restart(&core, &cli, config_path.as_deref());
            }
        }
    }
}

/// SIGINT asks for a restart: stop everything and re-exec ourselves with
/// equivalent options.
fn restart(core: &Core, cli: &Cli, config: Option<&Path>) -> ! {
    let r = core.handle();
    r.bus.add_request(IfaceKind::LOG, "*", Flag::BOOT, "Got SIGINT: restarting...");
    {
        let mut bus = r.bus.lock();
        bus.shutdown_waves(Some("Restart requested."), false);
    }
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("foxeyed"));
    let mut opts = String::from("-");
    for _ in 0..cli.debug.min(5) {
        opts.push('d');
    }
    if cli.quiet {
        opts.push('q');
    }
    if cli.debug_log {
        opts.push('D');
    }
    let mut args: Vec<CString> = vec![CString::new(exe.as_os_str().as_encoded_bytes()).unwrap()];
    if opts.len() > 1 {
        args.push(CString::new(opts).unwrap());
    }
    if let Some(c) = config {
        args.push(CString::new(c.as_os_str().as_encoded_bytes()).unwrap());
    }
    let mut argv: Vec<*const libc::c_char> = args.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());
    // SAFETY: execv with a NUL-terminated argv built above.
    unsafe { libc::execv(argv[0], argv.as_ptr()) };
    error!("execv failed, plain exit instead of restart");
    std::process::exit(0);
}
