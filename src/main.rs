use std::error::Error;
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::process::exit;
use std::thread;

use clap::{App, AppSettings};
use log::info;
use nix::fcntl::{flock, FlockArg};
use nix::sys::signal::{kill, sigprocmask, SigSet, SigmaskHow, Signal};
use nix::unistd::{chdir, dup2, fork, setsid, ForkResult, Pid};

use bitcalm::config::{Config, DEFAULT_CONF};
use bitcalm::log_buffer;
use bitcalm::status::{bak_path, STATUS_PATH};
use bitcalm::supervisor::{emergency_worker, Supervisor};
use bitcalm::worker::{Worker, CRASH_PATH};

const PIDFILE_PATH: &str = "/var/run/bitcalmd.pid";

fn main() {
    let app = App::new("bitcalm")
        .version(bitcalm::VERSION)
        .about("Backup agent: scheduled filesystem and MySQL backups to S3")
        .subcommand(App::new("start").about("Start the backup daemon"))
        .subcommand(App::new("stop").about("Stop the backup daemon"))
        .subcommand(App::new("restart").about("Restart the backup daemon"))
        .subcommand(App::new("uninstall").about("Stop the daemon and remove local state"))
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .get_matches();

    let code = match app.subcommand() {
        Some(("start", _)) => cmd_start(),
        Some(("stop", _)) => cmd_stop(),
        Some(("restart", _)) => {
            let stopped = cmd_stop();
            if stopped != 0 {
                stopped
            } else {
                cmd_start()
            }
        }
        Some(("uninstall", _)) => cmd_uninstall(),
        _ => 2,
    };
    exit(code);
}

fn read_pid() -> Option<Pid> {
    let text = fs::read_to_string(PIDFILE_PATH).ok()?;
    text.trim().parse::<i32>().ok().map(Pid::from_raw)
}

fn alive(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

fn cmd_start() -> i32 {
    let config = match Config::read(DEFAULT_CONF) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };
    if let Some(pid) = read_pid() {
        if alive(pid) {
            eprintln!("bitcalm is already running with pid {}", pid);
            return 1;
        }
    }

    println!("Starting daemon");
    match daemonize() {
        Ok(true) => {}
        Ok(false) => return 0, // parent
        Err(e) => {
            eprintln!("could not daemonize: {}", e);
            return 1;
        }
    }

    // from here on we are the daemon
    let _pid_lock = match write_pidfile() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("could not take the pid file: {}", e);
            return 1;
        }
    };
    let log_upload = match log_buffer::init(log_buffer::LOG_PATH) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("could not open the log: {}", e);
            return 1;
        }
    };
    info!("daemon started with pid {}", std::process::id());

    // signal handling stays on the main thread; SIGTERM is the only clean
    // way out
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGTERM);
    if let Err(e) = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None) {
        eprintln!("could not mask signals: {}", e);
        return 1;
    }

    {
        let config = config.clone();
        let log_upload = log_upload.clone();
        thread::spawn(move || {
            let worker_config = config.clone();
            let worker = move || -> Result<(), String> {
                let config = worker_config.clone();
                let log_upload = log_upload.clone();
                let handle = thread::spawn(move || -> Result<(), String> {
                    let mut worker =
                        Worker::new(config, log_upload).map_err(|e| e.to_string())?;
                    worker.run().map_err(|e| e.to_string())
                });
                match handle.join() {
                    Ok(result) => result,
                    Err(_) => Err("worker panicked".to_string()),
                }
            };
            let emergency = move || -> bool { emergency_worker(&config).unwrap_or(true) };
            Supervisor::new(worker, emergency).run();
        });
    }

    loop {
        match mask.wait() {
            Ok(Signal::SIGTERM) => break,
            Ok(_) => continue,
            Err(e) => {
                info!("signal wait failed: {}", e);
                break;
            }
        }
    }
    info!("terminated process with pid {}", std::process::id());
    let _ = fs::remove_file(PIDFILE_PATH);
    0
}

fn cmd_stop() -> i32 {
    let pid = match read_pid() {
        Some(pid) => pid,
        None => {
            eprintln!("no pid file at {}", PIDFILE_PATH);
            return 1;
        }
    };
    match kill(pid, Signal::SIGTERM) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Failed to terminate {}: {}", pid, e);
            1
        }
    }
}

fn cmd_uninstall() -> i32 {
    if let Some(pid) = read_pid() {
        if alive(pid) {
            let _ = kill(pid, Signal::SIGTERM);
        }
    }
    for path in &[
        STATUS_PATH.to_string(),
        bak_path(STATUS_PATH),
        bitcalm::catalog::CATALOG_PATH.to_string(),
        PIDFILE_PATH.to_string(),
    ] {
        let _ = fs::remove_file(path);
    }
    println!("bitcalm state removed");
    0
}

/// Classic double fork. Returns false in the original process, true in the
/// detached daemon. stderr lands in the crash file so an unhandled failure
/// is reported on the next start.
fn daemonize() -> Result<bool, Box<dyn Error>> {
    match unsafe { fork()? } {
        ForkResult::Parent { .. } => return Ok(false),
        ForkResult::Child => {}
    }
    setsid()?;
    match unsafe { fork()? } {
        ForkResult::Parent { .. } => exit(0),
        ForkResult::Child => {}
    }
    chdir("/")?;
    let devnull = File::open("/dev/null")?;
    dup2(devnull.as_raw_fd(), 0)?;
    let devnull_out = OpenOptions::new().write(true).open("/dev/null")?;
    dup2(devnull_out.as_raw_fd(), 1)?;
    let crash = OpenOptions::new().create(true).append(true).open(CRASH_PATH)?;
    dup2(crash.as_raw_fd(), 2)?;
    Ok(true)
}

/// Takes the pid file with an exclusive lock held for the daemon lifetime.
fn write_pidfile() -> Result<File, Box<dyn Error>> {
    use std::io::Write;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(PIDFILE_PATH)?;
    flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(file)
}
