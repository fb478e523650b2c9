//! `tbed` — the tape backup engine daemon.
//!
//! Deliberately thin: no HTTP/REST surface, auth, or embedded web UI; this
//! binary wires the engine crates together and runs the cron loop. A
//! handful of subcommands exist for
//! operating the engine without that surface: `run <job-id>` forces one
//! job to execute immediately, `serve` runs the scheduler loop, and
//! `restore` drives the Restore Engine directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use tbe::Config;
use tbe_catalog::CatalogStore;
use tbe_jobs::{EventBus, JobManager, LoggingNotificationSender};
use tbe_restore::{LoggingRestoreNotifier, RestoreRequest};
use tbe_scheduler::{DriveProvider, Scheduler};
use tbe_tape::{LinuxTapeDevice, SimulatedTapeDevice, TapeDriver};
use tbe_types::{Id, Job};

/// Picks a drive implementation per `tbe.toml`'s `simulated_tape_dir`:
/// a directory of flat files standing in for tape files when set (tests
/// and development without hardware), a real `/dev/nst*` device otherwise.
enum AnyDrive {
    Simulated(SimulatedTapeDevice),
    Linux(LinuxTapeDevice),
}

// The scheduler's `DriveProvider` is generic over a concrete device type, so
// `AnyDrive` implements `BlockDevice`/`TapeDriver` directly by delegating to
// whichever variant `open_drive` picked, rather than boxing a `dyn TapeDriver`.
impl tbe_tape::BlockDevice for AnyDrive {
    fn block_size(&self) -> usize {
        match self {
            AnyDrive::Simulated(d) => d.block_size(),
            AnyDrive::Linux(d) => d.block_size(),
        }
    }
    fn write_block(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            AnyDrive::Simulated(d) => d.write_block(data),
            AnyDrive::Linux(d) => d.write_block(data),
        }
    }
    fn write_filemark(&mut self) -> std::io::Result<()> {
        match self {
            AnyDrive::Simulated(d) => d.write_filemark(),
            AnyDrive::Linux(d) => d.write_filemark(),
        }
    }
    fn read_block(&mut self, buffer: &mut [u8]) -> Result<(), tbe_tape::BlockReadError> {
        match self {
            AnyDrive::Simulated(d) => d.read_block(buffer),
            AnyDrive::Linux(d) => d.read_block(buffer),
        }
    }
}

impl TapeDriver for AnyDrive {
    fn status(&mut self) -> Result<tbe_tape::DriveState> {
        match self {
            AnyDrive::Simulated(d) => d.status(),
            AnyDrive::Linux(d) => d.status(),
        }
    }
    fn rewind(&mut self) -> Result<()> {
        match self {
            AnyDrive::Simulated(d) => d.rewind(),
            AnyDrive::Linux(d) => d.rewind(),
        }
    }
    fn seek_to_file_mark(&mut self, n: u64) -> Result<()> {
        match self {
            AnyDrive::Simulated(d) => d.seek_to_file_mark(n),
            AnyDrive::Linux(d) => d.seek_to_file_mark(n),
        }
    }
    fn seek_to_block(&mut self, block: u64) -> Result<()> {
        match self {
            AnyDrive::Simulated(d) => d.seek_to_block(block),
            AnyDrive::Linux(d) => d.seek_to_block(block),
        }
    }
    fn get_position(&mut self) -> Result<tbe_tape::TapePosition> {
        match self {
            AnyDrive::Simulated(d) => d.get_position(),
            AnyDrive::Linux(d) => d.get_position(),
        }
    }
    fn write_file_mark(&mut self) -> Result<()> {
        match self {
            AnyDrive::Simulated(d) => d.write_file_mark(),
            AnyDrive::Linux(d) => d.write_file_mark(),
        }
    }
    fn erase(&mut self) -> Result<()> {
        match self {
            AnyDrive::Simulated(d) => d.erase(),
            AnyDrive::Linux(d) => d.erase(),
        }
    }
    fn eject(&mut self) -> Result<()> {
        match self {
            AnyDrive::Simulated(d) => d.eject(),
            AnyDrive::Linux(d) => d.eject(),
        }
    }
}

struct ConfiguredDriveProvider {
    config: Config,
}

impl DriveProvider for ConfiguredDriveProvider {
    type Device = AnyDrive;

    fn acquire(&self, _job: &Job) -> Result<AnyDrive> {
        open_drive(&self.config)
    }
}

fn open_drive(config: &Config) -> Result<AnyDrive> {
    match &config.simulated_tape_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("creating simulated tape directory")?;
            Ok(AnyDrive::Simulated(SimulatedTapeDevice::open(
                dir,
                config.block_size,
            )?))
        }
        None => Ok(AnyDrive::Linux(LinuxTapeDevice::open(
            std::path::Path::new(&config.device_path),
            config.block_size,
        )?)),
    }
}

fn load_config() -> Result<Config> {
    let path = std::env::var("TBE_CONFIG").unwrap_or_else(|_| "tbe.toml".to_string());
    let path = PathBuf::from(path);
    if path.exists() {
        Config::load(&path)
    } else {
        log::warn!("no config file at {}, using defaults", path.display());
        Ok(Config::default())
    }
}

fn open_catalog(config: &Config) -> Result<Arc<CatalogStore>> {
    Ok(Arc::new(CatalogStore::open(&config.catalog_path)?))
}

fn print_usage() {
    eprintln!(
        "usage: tbed <command> [args]\n\
         \n\
         commands:\n\
         \x20 serve                      run the scheduler loop until interrupted\n\
         \x20 run <job-id>                force one job to run immediately\n\
         \x20 restore <job-id> <dest-dir> restore a job's latest backup set into dest-dir\n"
    );
}

fn cmd_serve(config: Config) -> Result<()> {
    let store = open_catalog(&config)?;
    let events = Arc::new(EventBus::new());
    let notifier = Arc::new(LoggingNotificationSender);
    let manager = Arc::new(JobManager::new(
        Arc::clone(&store),
        events,
        notifier,
        config.engine_config(),
    ));
    let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&manager));
    let drives = ConfiguredDriveProvider { config };

    log::info!("tbed scheduler loop starting");
    loop {
        match scheduler.tick(&drives) {
            Ok(dispatched) if !dispatched.is_empty() => {
                log::info!("dispatched jobs: {dispatched:?}");
            }
            Ok(_) => {}
            Err(err) => log::error!("scheduler tick failed: {err:#}"),
        }
        thread::sleep(Duration::from_secs(30));
    }
}

fn cmd_run(config: Config, job_id: Id) -> Result<()> {
    let store = open_catalog(&config)?;
    let events = Arc::new(EventBus::new());
    let notifier = Arc::new(LoggingNotificationSender);
    let manager = JobManager::new(store, events, notifier, config.engine_config());
    let mut device = open_drive(&config)?;
    manager.run_job(job_id, &mut device)
}

fn cmd_restore(config: Config, job_id: Id, dest: PathBuf) -> Result<()> {
    let store = open_catalog(&config)?;
    let notifier = LoggingRestoreNotifier;
    let mut device = open_drive(&config)?;
    let request = RestoreRequest {
        job_id,
        target_backup_set_id: None,
        paths: Vec::new(),
        dest,
        passphrase: None,
        verify: true,
    };
    let cancel = AtomicBool::new(false);
    let outcome = tbe_restore::run_restore(
        &mut device,
        &store,
        &notifier,
        &request,
        config.engine_config().tape_change_poll_interval,
        &cancel,
    )?;
    println!(
        "restored {} files, {} bytes, {} checksum mismatches",
        outcome.files_restored,
        outcome.bytes_restored,
        outcome.checksum_errors.len()
    );
    for err in &outcome.checksum_errors {
        eprintln!("checksum mismatch: {err}");
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let command = match args.next() {
        Some(c) => c,
        None => {
            print_usage();
            bail!("missing command");
        }
    };
    let config = load_config()?;

    match command.as_str() {
        "serve" => cmd_serve(config),
        "run" => {
            let job_id: Id = args
                .next()
                .context("run requires a job id")?
                .parse()
                .context("job id must be an integer")?;
            cmd_run(config, job_id)
        }
        "restore" => {
            let job_id: Id = args
                .next()
                .context("restore requires a job id")?
                .parse()
                .context("job id must be an integer")?;
            let dest = PathBuf::from(args.next().context("restore requires a destination dir")?);
            cmd_restore(config, job_id, dest)
        }
        other => {
            print_usage();
            bail!("unknown command {other:?}");
        }
    }
}

