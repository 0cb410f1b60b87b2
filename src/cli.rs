use crate::config::settings::ZygoteSettings;
use crate::helper::{DirectoryFontCatalog, HelperProcess};
use crate::ipc::channel::Channel;
use crate::ipc::protocol::FontQuery;
use crate::kernel::process::CrashStatus;
use crate::worker::{acknowledge_chroot_request, run_worker, FontClient, WorkerReport};
use crate::zygote::{
    launch, DescriptorMapping, Launch, WorkerStartup, ZygoteController, PRIMARY_IPC_CHANNEL,
    SANDBOX_HANDSHAKE, SANDBOX_IPC_CHANNEL,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

/// Polls of DidProcessCrash before a worker is killed
const EXIT_POLL_ATTEMPTS: u32 = 500;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (JSON); `ZYGOTE_*` environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a zygote and spawn workers through it, each with its own helper
    Run {
        /// Number of workers to spawn one after another
        #[arg(long, default_value_t = 1)]
        workers: u32,
        /// Skip the sandbox handshake (no chroot)
        #[arg(long)]
        unsandboxed: bool,
        /// Font family each worker asks its helper for
        #[arg(long)]
        family: Option<String>,
    },
    /// Resolve a font through a sandbox helper
    Fonts {
        #[arg(long)]
        family: String,
        #[arg(long)]
        bold: bool,
        #[arg(long)]
        italic: bool,
        /// Text whose characters must all be renderable
        #[arg(long)]
        chars: Option<String>,
    },
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let settings = ZygoteSettings::load(cli.config.as_deref()).context("loading settings")?;

    match cli.command {
        Commands::Run {
            workers,
            unsandboxed,
            family,
        } => run_workers(&settings, workers, unsandboxed, family.as_deref()),
        Commands::Fonts {
            family,
            bold,
            italic,
            chars,
        } => lookup_font(&settings, family, bold, italic, chars.as_deref()),
    }
}

fn run_workers(
    settings: &ZygoteSettings,
    workers: u32,
    unsandboxed: bool,
    family: Option<&str>,
) -> Result<()> {
    if !unsandboxed && nix::unistd::getuid().as_raw() != 0 {
        eprintln!("Warning: workers chroot into {}; this needs root", settings.chroot_dir.display());
        eprintln!("Use --unsandboxed to skip the sandbox handshake");
    }

    // The zygote goes first so it never inherits helper or worker descriptors.
    let mut controller = match launch(settings)? {
        Launch::Controller(controller) => controller,
        Launch::Zygote(server) => {
            let startup = server.run_until_worker();
            std::process::exit(worker_main(startup, settings));
        }
    };

    let catalog = DirectoryFontCatalog::from_settings(settings);

    for index in 0..workers {
        let mut helper = HelperProcess::spawn(settings, catalog.clone())?;
        let outcome = spawn_one(settings, &mut controller, &mut helper, index, unsandboxed, family);
        helper.shutdown()?;
        outcome?;
    }

    controller.shutdown()?;
    Ok(())
}

fn spawn_one(
    settings: &ZygoteSettings,
    controller: &mut ZygoteController,
    helper: &mut HelperProcess,
    index: u32,
    unsandboxed: bool,
    family: Option<&str>,
) -> Result<()> {
    let helper_channel = helper
        .take_worker_channel()
        .context("helper channel already handed out")?;
    let (reports, worker_primary) = Channel::pair()?;
    let handshake = if unsandboxed {
        None
    } else {
        Some(UnixStream::pair()?)
    };

    let mut args = vec![
        "--type=worker".to_string(),
        format!("--worker-index={}", index),
    ];
    if let Some(family) = family {
        args.push(format!("--family={}", family));
    }

    let pid = {
        let mut mapping = DescriptorMapping::new()
            .with(PRIMARY_IPC_CHANNEL, worker_primary.as_fd()?)?
            .with(SANDBOX_IPC_CHANNEL, helper_channel.as_fd()?)?;
        if let Some((_, worker_end)) = &handshake {
            mapping.insert(SANDBOX_HANDSHAKE, worker_end.as_fd())?;
        }
        controller.fork(&args, mapping)?
    };
    drop(worker_primary);
    drop(helper_channel);

    if let Some((mut ours, worker_end)) = handshake {
        drop(worker_end);
        if let Err(e) = acknowledge_chroot_request(&mut ours) {
            log::warn!("Worker {} did not complete the handshake: {}", pid, e);
        }
    }

    match reports
        .receive(settings.max_message_bytes, 0)
        .and_then(|message| WorkerReport::decode(&message.payload))
    {
        Ok(report) => println!(
            "worker {} pid {}: sandboxed={} family={:?}",
            index, pid, report.sandboxed, report.family
        ),
        Err(e) => println!("worker {} pid {}: no report ({})", index, pid, e),
    }

    let status = wait_for_exit(controller, pid)?;
    controller.prune_reaped();
    println!(
        "worker {} pid {}: exited={} crashed={}",
        index, pid, status.exited, status.crashed
    );
    Ok(())
}

fn wait_for_exit(controller: &mut ZygoteController, pid: Pid) -> Result<CrashStatus> {
    for _ in 0..EXIT_POLL_ATTEMPTS {
        let status = controller.did_process_crash(pid)?;
        if status.exited {
            return Ok(status);
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }

    log::warn!("Worker {} did not exit; killing it", pid);
    kill(pid, Signal::SIGKILL).with_context(|| format!("killing worker {}", pid))?;
    controller.reap(pid)?;
    Ok(CrashStatus {
        crashed: true,
        exited: true,
    })
}

fn lookup_font(
    settings: &ZygoteSettings,
    family: String,
    bold: bool,
    italic: bool,
    chars: Option<&str>,
) -> Result<()> {
    let mut helper = HelperProcess::spawn(settings, DirectoryFontCatalog::from_settings(settings))?;
    let channel = helper
        .take_worker_channel()
        .context("helper channel already handed out")?;
    let client = FontClient::new(channel, settings.channel_limits());

    let query = FontQuery {
        fileid: None,
        is_bold: bold,
        is_italic: italic,
        family,
    };
    match client.match_font(&query)? {
        Some(found) => {
            let readable = client.open_font(found.fileid)?.is_some();
            println!(
                "{} -> {} (file {}, readable={})",
                query.family, found.family, found.fileid, readable
            );
        }
        None => println!("{} -> no matching font", query.family),
    }

    if let Some(text) = chars {
        let code_points: Vec<u32> = text.chars().map(u32::from).collect();
        let family = client.family_for_chars(&code_points)?;
        if family.is_empty() {
            println!("{:?} -> no family covers these characters", text);
        } else {
            println!("{:?} -> {}", text, family);
        }
    }

    drop(client);
    helper.shutdown()?;
    Ok(())
}

/// Body of a process that just left the zygote; returns its exit code
fn worker_main(startup: WorkerStartup, settings: &ZygoteSettings) -> i32 {
    match run_worker(startup, settings) {
        Ok(_) => 0,
        Err(e) => {
            log::error!("Worker start-up failed: {}", e);
            1
        }
    }
}
