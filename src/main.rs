use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use env_logger::Env;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use syncplay::audio::{FrameDropPolicy, SyncType};
use syncplay::media::{SyntheticBackend, SyntheticConfig};
use syncplay::utils::{format_position, Config};
use syncplay::{MediaPlayerBuilder, PlayerConfig, PlayerEvent, PlayerEventHandler, PlayerState};

const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// syncplay - play a media source with A/V sync
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Media file or URL to play
    #[arg(value_name = "SOURCE", required_unless_present = "synthetic")]
    source: Option<String>,

    /// Times to play the source, 0 loops forever
    #[arg(long = "loop", value_name = "N")]
    loop_count: Option<i32>,

    /// Drop late video frames: never, always or auto
    #[arg(long, value_name = "POLICY")]
    framedrop: Option<FrameDropPolicy>,

    /// Set initial volume (0-100)
    #[arg(short, long, value_name = "VOLUME", value_parser = clap::value_parser!(u8).range(0..=100))]
    volume: Option<u8>,

    /// Start muted
    #[arg(long)]
    mute: bool,

    /// Disable hardware acceleration
    #[arg(long = "no-hw-accel", action = ArgAction::SetFalse)]
    hardware_accel: bool,

    /// Exit once playback ends
    #[arg(long)]
    autoexit: bool,

    /// Master clock: audio, video or ext
    #[arg(long, value_name = "SOURCE")]
    sync: Option<SyncType>,

    /// Play the built-in test source for SECONDS instead of SOURCE
    #[arg(long, value_name = "SECONDS")]
    synthetic: Option<f64>,

    /// Configuration file to use instead of the default locations
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn player_config(&self, config: &Config) -> PlayerConfig {
        let mut player_config = PlayerConfig::from(config);
        if let Some(count) = self.loop_count {
            player_config.loop_count = count;
        }
        if let Some(policy) = self.framedrop {
            player_config.frame_drop = policy;
        }
        if let Some(volume) = self.volume {
            player_config.volume = volume as f32 / 100.0;
        }
        if let Some(sync) = self.sync {
            player_config.sync = sync;
        }
        player_config.muted |= self.mute;
        player_config.autoexit |= self.autoexit;
        player_config.hardware_acceleration &= self.hardware_accel;
        player_config
    }

    /// Default log filter; `RUST_LOG` still wins
    fn log_filter<'a>(&self, config: &'a Config) -> &'a str {
        if self.debug {
            "debug"
        } else {
            &config.general.log_level
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load().context("loading configuration")?,
    };

    env_logger::Builder::from_env(Env::default().default_filter_or(args.log_filter(&config)))
        .format_timestamp_millis()
        .init();

    info!("Starting syncplay v{}", env!("CARGO_PKG_VERSION"));

    let player_config = args.player_config(&config);

    let mut builder = MediaPlayerBuilder::new()
        .with_config(player_config)
        .with_event_handler(Box::new(LoggingEventHandler));

    let source = match args.synthetic {
        Some(seconds) => {
            if !(seconds.is_finite() && seconds > 0.0) {
                bail!("--synthetic needs a positive duration, got {}", seconds);
            }
            builder = builder.with_backend(Arc::new(SyntheticBackend::new(SyntheticConfig {
                duration_secs: seconds,
                subtitles: true,
                ..Default::default()
            })));
            "synthetic".to_string()
        }
        None => args.source.clone().context("no source given")?,
    };

    let player = builder.build()?;
    let (ended_tx, ended_rx) = crossbeam_channel::bounded(1);
    let _subscription = player.subscribe_events(move |event| match event {
        PlayerEvent::StateChanged {
            new: PlayerState::Ended, ..
        } => {
            let _ = ended_tx.try_send(Ok(()));
        }
        PlayerEvent::OpenFailed { message, .. } => {
            let _ = ended_tx.try_send(Err(message));
        }
        _ => {}
    });

    info!("Loading {}", source);
    player.open(&source)?;
    let deadline = Instant::now() + OPEN_TIMEOUT;
    while !player.wait_for_state(PlayerState::Stoped, Duration::from_millis(50)) {
        if let Ok(Err(message)) = ended_rx.try_recv() {
            bail!("failed to open {}: {}", source, message);
        }
        if Instant::now() >= deadline {
            bail!("timed out opening {}", source);
        }
    }
    player.play()?;

    match ended_rx.recv() {
        Ok(Ok(())) => info!("End of media at {}", format_position(player.position().unwrap_or(f64::NAN))),
        Ok(Err(message)) => error!("Playback failed: {}", message),
        Err(_) => warn!("Player stopped without reporting the end"),
    }

    let drops = player.frame_drop_count();
    if drops > 0 {
        info!("{} frames dropped", drops);
    }
    player.close()?;
    Ok(())
}

/// Event handler that logs state transitions
struct LoggingEventHandler;

impl PlayerEventHandler for LoggingEventHandler {
    fn handle_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::StateChanged { old, new } => info!("{} -> {}", old, new),
            PlayerEvent::OpenFailed { source, message } => error!("cannot open {}: {}", source, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_follows_config() {
        let mut config = Config::default();
        config.general.log_level = "warn".to_string();

        let args = Args::try_parse_from(["syncplay", "clip.mkv"]).unwrap();
        assert_eq!(args.log_filter(&config), "warn");

        let args = Args::try_parse_from(["syncplay", "--debug", "clip.mkv"]).unwrap();
        assert_eq!(args.log_filter(&config), "debug");
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::try_parse_from([
            "syncplay",
            "--loop",
            "3",
            "--volume",
            "50",
            "--mute",
            "--no-hw-accel",
            "clip.mkv",
        ])
        .unwrap();
        let config = args.player_config(&Config::default());

        assert_eq!(config.loop_count, 3);
        assert_eq!(config.volume, 0.5);
        assert!(config.muted);
        assert!(!config.hardware_acceleration);
    }
}
