use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use process_utils::SysinfoProcessTable;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use channel_tracker::bus::Bus;
use channel_tracker::cli::Args;
use channel_tracker::config::{ConfigSource, Settings};
use channel_tracker::console::{self, Console};
use channel_tracker::fetcher::YtDlpFactory;
use channel_tracker::gate::PostprocessGate;
use channel_tracker::health::SystemHealth;
use channel_tracker::monitor::{MonitorConfig, SubprocessMonitor};
use channel_tracker::roster::RosterStore;
use channel_tracker::scheduler::{Manager, ManagerConfig, StopReason};
use channel_tracker::slot::SlotShared;
use channel_tracker::utils::fs;
use channel_tracker::{Error, error::exit_code, logging, panic_hook};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    match run(args).await {
        Ok(reason) => {
            info!(?reason, "Exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let code = e
                .downcast_ref::<Error>()
                .map(Error::exit_code)
                .unwrap_or(exit_code::FAILURE);
            error!("{:#}", e);
            eprintln!("Error ({code}): {e:#}");
            ExitCode::from(code)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<StopReason> {
    let mut source = ConfigSource::read(&args.config)?;
    for assignment in &args.overrides {
        source.apply_override(assignment)?;
    }
    if args.save {
        source.save()?;
    }
    let settings = Arc::new(Settings::try_from(source.config()?)?);

    fs::ensure_dir_all_with_op("creating output directory", &settings.output_directory).await?;
    fs::recreate_dir(&settings.scratch_dir()).await?;

    let filter = logging::build_filter(settings.log_filter.as_deref(), args.verbosity());
    let logging = logging::init_logging(&settings.log_dir(), filter)?;
    panic_hook::install(logging.log_dir());

    let background = CancellationToken::new();
    logging.start_retention_cleanup(background.child_token());

    let prefix = read_channel_prefix(&settings.channel_prefix_file)
        .await
        .context("Failed to read the channel prefix")?;
    let store = RosterStore::new(&settings.channels_file);
    let roster = store.load().await?;
    if roster.is_empty() {
        return Err(Error::NoChannels.into());
    }
    info!(
        channels = roster.len(),
        slots = settings.number_of_slots,
        "Imported channels"
    );

    let bus = Arc::new(Bus::new(settings.poll_interval));
    let gate = PostprocessGate::new(settings.gate_timeout);
    let shared = SlotShared {
        bus: bus.clone(),
        gate: gate.clone(),
        factory: Arc::new(YtDlpFactory::new(settings.clone(), prefix)),
        minimum_duration: settings.minimum_duration,
    };

    let mut manager = Manager::new(
        ManagerConfig::from_settings(&settings),
        roster,
        store,
        bus.clone(),
        Box::new(SystemHealth::new(&settings)),
    )?;
    manager.spawn_slots(settings.number_of_slots, shared);
    manager.spawn_monitor(SubprocessMonitor::new(
        bus.clone(),
        Box::new(SysinfoProcessTable::new()),
        MonitorConfig::from_settings(&settings),
    ));

    let display = tokio::spawn(
        Console::new(bus.clone(), settings.number_of_slots).run(background.child_token()),
    );
    if let Err(e) = console::spawn_key_reader(bus.clone(), settings.number_of_slots) {
        warn!("Operator keys unavailable: {}", e);
    }

    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, stopping");
                stop.cancel();
            }
        });
    }

    let result = manager.run(stop).await;
    gate.close();

    // Give the display a moment to show the final statuses.
    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        while bus.pending() > 0 {
            tokio::time::sleep(bus.poll_interval()).await;
        }
    })
    .await;
    background.cancel();
    let _ = display.await;

    Ok(result?)
}

/// First line of the prefix file, prepended to every channel name.
async fn read_channel_prefix(path: &Path) -> channel_tracker::Result<String> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| fs::io_error("reading channel prefix", path, e))?;
    Ok(text.lines().next().unwrap_or_default().trim().to_string())
}
