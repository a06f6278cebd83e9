use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use twaindirect::{
    FakeScanner, ReceivedImage, Session, SessionConfig, SessionError, SessionEvent, SessionEvents,
    SessionState, TwainError,
};

const DEADLINE: Duration = Duration::from_secs(10);

fn config(scanner: &FakeScanner, dir: &Path) -> anyhow::Result<SessionConfig> {
    Ok(SessionConfig::builder()
        .scanner_url(scanner.direct_url()?)
        .download_dir(dir.to_path_buf())
        .poll_interval(Duration::from_millis(10))
        .command_timeout(Duration::from_secs(5))
        .build())
}

async fn collect_until_done(events: &mut SessionEvents) -> anyhow::Result<Vec<SessionEvent>> {
    let mut seen = Vec::new();
    loop {
        let event = timeout(DEADLINE, events.next())
            .await?
            .ok_or_else(|| anyhow!("event stream ended before capture finished"))?;
        let done = matches!(event, SessionEvent::DoneCapturing);
        seen.push(event);
        if done {
            return Ok(seen);
        }
    }
}

fn received_images(events: &[SessionEvent]) -> Vec<&ReceivedImage> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::ImageReceived(image) => Some(image),
            _ => None,
        })
        .collect()
}

fn scanner_commands(scanner: &FakeScanner) -> Vec<String> {
    scanner
        .received_methods()
        .into_iter()
        .filter(|method| method != "waitForEvents" && method != "readImageBlock")
        .collect()
}

#[tokio::test]
async fn full_capture_writes_each_image_and_finishes_once() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let scanner = Arc::new(FakeScanner::builder().images(2).parts_per_image(3).build());
    let (session, mut events) = Session::new(config(&scanner, dir.path())?, scanner.clone());

    session.open().await?;
    let accepted = session
        .send_task(json!({"actions": [{"action": "configure"}]}))
        .await?;
    session.start_capturing().await?;
    let seen = collect_until_done(&mut events).await?;

    assert_eq!(json!("ignore"), accepted["actions"][0]["exception"]);
    let images = received_images(&seen);
    let blocks: Vec<(u32, u32)> = images
        .iter()
        .map(|image| (image.first_block, image.last_block))
        .collect();
    assert_eq!(vec![(1, 3), (4, 6)], blocks);
    for (index, image) in images.iter().enumerate() {
        let image_number = u32::try_from(index)? + 1;
        assert_eq!(scanner.expected_image(image_number), std::fs::read(&image.path)?);
    }

    let extra = timeout(Duration::from_millis(200), events.next()).await;
    assert!(!matches!(extra, Ok(Some(SessionEvent::DoneCapturing))));
    assert_eq!(SessionState::NoSession, session.state());
    assert_eq!(Vec::<u32>::new(), scanner.ready_blocks());
    assert_eq!(
        vec![
            "createSession",
            "sendTask",
            "startCapturing",
            "releaseImageBlocks",
            "releaseImageBlocks",
            "closeSession",
        ],
        scanner_commands(&scanner)
    );
    assert_eq!(vec![(1, 3), (4, 6)], scanner.released_ranges());

    let leftover_parts = std::fs::read_dir(dir.path())?
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "part"))
        .count();
    assert_eq!(0, leftover_parts);
    Ok(())
}

#[tokio::test]
async fn three_block_image_is_delivered_once_then_released_as_one_range() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let scanner = Arc::new(FakeScanner::builder().images(1).parts_per_image(3).build());
    let (session, mut events) = Session::new(config(&scanner, dir.path())?, scanner.clone());

    session.open().await?;
    session.start_capturing().await?;
    let seen = collect_until_done(&mut events).await?;

    let images = received_images(&seen);
    assert_eq!(1, images.len());
    assert_eq!((1, 3), (images[0].first_block, images[0].last_block));
    assert_eq!(scanner.expected_image(1), std::fs::read(&images[0].path)?);
    assert_eq!(vec![(1, 3)], scanner.released_ranges());
    Ok(())
}

#[tokio::test]
async fn failed_close_after_drain_still_reports_done() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let scanner = Arc::new(FakeScanner::builder().fail_close(true).build());
    let (session, mut events) = Session::new(config(&scanner, dir.path())?, scanner.clone());

    session.open().await?;
    session.start_capturing().await?;
    let seen = collect_until_done(&mut events).await?;

    assert_eq!(1, received_images(&seen).len());
    assert_eq!(
        1,
        seen.iter()
            .filter(|event| matches!(event, SessionEvent::DoneCapturing))
            .count()
    );
    Ok(())
}

#[tokio::test]
async fn closing_mid_capture_releases_every_block() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let scanner = Arc::new(
        FakeScanner::builder()
            .images(2)
            .fail_block_reads(true)
            .build(),
    );
    let (session, mut events) = Session::new(config(&scanner, dir.path())?, scanner.clone());

    session.open().await?;
    session.start_capturing().await?;
    session.close().await?;
    let seen = collect_until_done(&mut events).await?;

    assert!(session.is_stopping());
    assert!(received_images(&seen).is_empty());
    assert_eq!(Vec::<u32>::new(), scanner.ready_blocks());
    assert_eq!(SessionState::NoSession, session.state());
    assert!(
        scanner_commands(&scanner)
            .iter()
            .any(|method| method == "releaseImageBlocks")
    );
    Ok(())
}

#[tokio::test]
async fn commands_before_open_are_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let scanner = Arc::new(FakeScanner::builder().build());
    let (session, _events) = Session::new(config(&scanner, dir.path())?, scanner.clone());

    let result = session.send_task(json!({})).await;

    assert_matches!(result, Err(TwainError::Session(SessionError::NotOpen)));
    assert!(scanner.received_methods().is_empty());
    Ok(())
}

#[tokio::test]
async fn opening_twice_is_an_invalid_state() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let scanner = Arc::new(FakeScanner::builder().build());
    let (session, _events) = Session::new(config(&scanner, dir.path())?, scanner.clone());

    session.open().await?;
    let result = session.open().await;

    assert_matches!(
        result,
        Err(TwainError::Session(SessionError::InvalidState {
            state: SessionState::Ready
        }))
    );
    Ok(())
}

#[tokio::test]
async fn stop_pauses_while_blocks_drain() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let scanner = Arc::new(FakeScanner::builder().fail_block_reads(true).build());
    let (session, _events) = Session::new(config(&scanner, dir.path())?, scanner.clone());

    session.open().await?;
    session.start_capturing().await?;
    session.stop().await?;

    assert!(session.is_paused());
    assert_eq!(SessionState::Draining, session.state());
    Ok(())
}
