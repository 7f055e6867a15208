//! Integration tests for the syncplay media player
//!
//! These tests verify the complete player functionality including:
//! - Open, play and end-of-stream transitions
//! - Pause, resume, stop and seek
//! - Error handling and decoder fallback
//! - Audio-only, video-only and looping sources

use anyhow::Result;
use std::thread::sleep;
use std::time::Duration;
use syncplay::audio::SyncType;
use syncplay::media::SyntheticConfig;
use syncplay::utils::Config;
use syncplay::{PlayerConfig, PlayerEvent, PlayerState};
use syncplay_integration_tests::{wait_until, PlayerFixture, WAIT};

fn clip(duration_secs: f64) -> SyntheticConfig {
    SyntheticConfig {
        duration_secs,
        ..Default::default()
    }
}

#[test]
fn test_player_initialization() -> Result<()> {
    let fixture = PlayerFixture::new(clip(1.0))?;

    assert_eq!(fixture.player.state(), PlayerState::Closed);
    assert_eq!(fixture.player.position(), None);
    assert!(fixture.player.stats().is_none());
    assert!(fixture.events.events().is_empty());

    Ok(())
}

#[test]
fn test_playback_runs_to_end() -> Result<()> {
    let fixture = PlayerFixture::new(clip(0.6))?;
    fixture.open_and_play()?;

    assert!(fixture.player.wait_for_state(PlayerState::Ended, WAIT));
    assert_eq!(
        fixture.events.states(),
        vec![PlayerState::Stoped, PlayerState::Playing, PlayerState::Ended]
    );
    assert!(fixture.frames_uploaded() > 0);
    assert!(fixture.samples_played() > 0);

    let stats = fixture.player.stats().expect("stats while open");
    assert_eq!(stats.video_queue.nb_packets, 0);
    assert_eq!(stats.audio_queue.nb_packets, 0);

    fixture.player.close()?;
    assert!(fixture.player.wait_for_state(PlayerState::Closed, WAIT));
    Ok(())
}

#[test]
fn test_pause_freezes_position() -> Result<()> {
    let fixture = PlayerFixture::new(clip(3.0))?;
    fixture.open_and_play()?;
    assert!(fixture.wait_for_position(0.2));

    fixture.player.pause()?;
    assert!(fixture.player.wait_for_state(PlayerState::Paused, WAIT));
    let paused_at = fixture.player.position().expect("position while paused");

    sleep(Duration::from_millis(200));
    let later = fixture.player.position().expect("position while paused");
    assert!((later - paused_at).abs() < 0.01, "moved from {} to {}", paused_at, later);

    fixture.player.play()?;
    assert!(fixture.player.wait_for_state(PlayerState::Playing, WAIT));
    assert!(fixture.wait_for_position(paused_at + 0.1));

    Ok(())
}

#[test]
fn test_pause_ignored_unless_playing() -> Result<()> {
    let fixture = PlayerFixture::new(clip(1.0))?;
    fixture.open()?;

    fixture.player.pause()?;
    sleep(Duration::from_millis(100));
    assert_eq!(fixture.player.state(), PlayerState::Stoped);

    Ok(())
}

#[test]
fn test_seek_bumps_serials_and_moves_clock() -> Result<()> {
    let fixture = PlayerFixture::new(clip(4.0))?;
    fixture.open_and_play()?;

    let before = fixture.player.stats().expect("stats while open");
    fixture.player.seek(2.5)?;

    assert!(wait_until(WAIT, || {
        fixture
            .player
            .stats()
            .is_some_and(|s| s.video_queue.serial > before.video_queue.serial)
    }));
    let after = fixture.player.stats().expect("stats while open");
    assert!(after.audio_queue.serial > before.audio_queue.serial);
    assert!(after.subtitle_queue.serial > before.subtitle_queue.serial);

    // Playing from the start would take over two seconds to get here
    assert!(wait_until(Duration::from_millis(1500), || {
        fixture.player.position().is_some_and(|p| p >= 2.4)
    }));

    Ok(())
}

#[test]
fn test_stop_rewinds_and_replays() -> Result<()> {
    let fixture = PlayerFixture::new(clip(1.0))?;
    fixture.open_and_play()?;
    assert!(fixture.wait_for_position(0.3));
    let serial = fixture.player.stats().expect("stats").video_queue.serial;

    fixture.player.stop()?;
    assert!(fixture.player.wait_for_state(PlayerState::Stoped, WAIT));
    assert!(wait_until(WAIT, || {
        fixture.player.stats().is_some_and(|s| s.video_queue.serial > serial)
    }));

    fixture.player.play()?;
    assert!(fixture.player.wait_for_state(PlayerState::Ended, WAIT));
    assert_eq!(
        fixture.events.states(),
        vec![
            PlayerState::Stoped,
            PlayerState::Playing,
            PlayerState::Stoped,
            PlayerState::Playing,
            PlayerState::Ended
        ]
    );

    Ok(())
}

#[test]
fn test_open_failure_stays_closed() -> Result<()> {
    let fixture = PlayerFixture::new(SyntheticConfig {
        fail_open: true,
        ..Default::default()
    })?;

    fixture.player.open("unreadable")?;
    assert!(wait_until(WAIT, || fixture.events.open_failures() == 1));
    assert_eq!(fixture.player.state(), PlayerState::Closed);
    assert!(fixture.events.states().is_empty());

    match &fixture.events.events()[0] {
        PlayerEvent::OpenFailed { source, message } => {
            assert_eq!(source, "unreadable");
            assert!(!message.is_empty());
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Commands on a closed player are ignored
    fixture.player.play()?;
    fixture.player.seek(1.0)?;
    sleep(Duration::from_millis(50));
    assert_eq!(fixture.player.state(), PlayerState::Closed);

    Ok(())
}

#[test]
fn test_hardware_rejection_falls_back_to_software() -> Result<()> {
    let config = PlayerConfig {
        hardware_acceleration: true,
        ..Default::default()
    };
    let fixture = PlayerFixture::with_config(
        SyntheticConfig {
            duration_secs: 0.6,
            reject_hardware: true,
            ..Default::default()
        },
        config,
    )?;
    fixture.open_and_play()?;

    assert!(fixture.player.wait_for_state(PlayerState::Ended, WAIT));
    assert!(fixture.frames_uploaded() > 0);

    Ok(())
}

#[test]
fn test_audio_only_source() -> Result<()> {
    let fixture = PlayerFixture::new(SyntheticConfig {
        duration_secs: 0.5,
        video_fps: None,
        ..Default::default()
    })?;
    fixture.open_and_play()?;

    assert!(fixture.player.wait_for_state(PlayerState::Ended, WAIT));
    assert_eq!(fixture.frames_uploaded(), 0);
    assert!(fixture.samples_played() > 0);

    Ok(())
}

#[test]
fn test_video_only_source_loops() -> Result<()> {
    let config = PlayerConfig {
        loop_count: 2,
        sync: SyncType::Video,
        ..Default::default()
    };
    let fixture = PlayerFixture::with_config(
        SyntheticConfig {
            duration_secs: 0.4,
            audio_rate: None,
            ..Default::default()
        },
        config,
    )?;
    fixture.open_and_play()?;

    assert!(fixture.player.wait_for_state(PlayerState::Ended, WAIT));
    // Ten pictures per pass, none dropped while video is the master
    assert!(fixture.frames_uploaded() > 10, "uploaded {}", fixture.frames_uploaded());
    assert_eq!(fixture.player.frame_drop_count(), 0);
    assert_eq!(fixture.samples_played(), 0);

    Ok(())
}

#[test]
fn test_subtitles_are_presented() -> Result<()> {
    let fixture = PlayerFixture::new(SyntheticConfig {
        duration_secs: 1.5,
        subtitles: true,
        ..Default::default()
    })?;
    fixture.open_and_play()?;

    assert!(fixture.player.wait_for_state(PlayerState::Ended, WAIT));
    assert!(fixture.subtitles_shown() > 0);

    Ok(())
}

#[test]
fn test_reopen_replaces_session() -> Result<()> {
    let fixture = PlayerFixture::new(clip(2.0))?;
    fixture.open_and_play()?;
    assert!(fixture.wait_for_position(0.1));

    fixture.player.open("again")?;
    assert!(wait_until(WAIT, || {
        fixture.events.states().ends_with(&[PlayerState::Closed, PlayerState::Stoped])
    }));
    assert_eq!(fixture.player.state(), PlayerState::Stoped);

    Ok(())
}

#[test]
fn test_config_file_disables_audio() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[playback]\nsync = \"video\"\nframe_drop = \"never\"\n\n[audio]\ndisabled = true\nmuted = true\n",
    )?;

    let config = PlayerConfig::from(&Config::load_from(&path)?);
    assert!(config.audio_disabled);
    let fixture = PlayerFixture::with_config(clip(0.5), config)?;
    assert!(fixture.player.is_muted());

    fixture.open_and_play()?;
    assert!(fixture.player.wait_for_state(PlayerState::Ended, WAIT));
    assert!(fixture.frames_uploaded() > 0);
    assert_eq!(fixture.samples_played(), 0);
    assert_eq!(fixture.player.stats().expect("stats").audio_queue.nb_packets, 0);

    Ok(())
}
