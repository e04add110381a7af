use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use filterchain::{FrameRelay, Size};

const WAIT: Duration = Duration::from_millis(100);

#[test]
fn enable_then_disable_without_frames_never_calls_the_sink() {
    let calls = Arc::new(AtomicUsize::new(0));
    let relay = FrameRelay::new(8, WAIT);
    let counter = Arc::clone(&calls);
    relay
        .enable(Box::new(move |_: &[u8], _: u32, _: u32| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();
    assert!(relay.is_active());

    let started = Instant::now();
    relay.disable();
    assert!(started.elapsed() < WAIT * 10);
    assert!(!relay.is_active());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(relay.stats().delivered, 0);
}

#[test]
fn frames_arrive_in_push_order() {
    let (tx, rx) = unbounded();
    let relay = FrameRelay::new(8, WAIT);
    relay
        .enable(Box::new(move |rgba: &[u8], width: u32, height: u32| -> anyhow::Result<()> {
            tx.send((rgba[0], width, height))?;
            Ok(())
        }))
        .unwrap();

    for value in 1..=8u8 {
        let mut buffer = relay.acquire_buffer();
        buffer.extend_from_slice(&[value; 8]);
        assert!(relay.push(buffer, Size::new(2, 1)));
    }

    let received: Vec<(u8, u32, u32)> = (0..8)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    let expected: Vec<(u8, u32, u32)> = (1..=8).map(|value| (value, 2, 1)).collect();
    assert_eq!(received, expected);

    relay.disable();
    let stats = relay.stats();
    assert_eq!(stats.pushed, 8);
    assert_eq!(stats.delivered, 8);
    assert_eq!(stats.dropped, 0);
    assert!(rx.try_recv().is_err(), "no duplicate deliveries");
}

#[test]
fn failing_sink_does_not_stop_the_consumer() {
    let (tx, rx) = unbounded();
    let relay = FrameRelay::new(8, WAIT);
    relay
        .enable(Box::new(move |rgba: &[u8], _: u32, _: u32| -> anyhow::Result<()> {
            match rgba[0] {
                0 => anyhow::bail!("encoder rejected frame"),
                1 => panic!("encoder crashed"),
                value => {
                    tx.send(value)?;
                    Ok(())
                }
            }
        }))
        .unwrap();

    for value in 0..3u8 {
        assert!(relay.push(vec![value; 4], Size::new(1, 1)));
    }
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);

    relay.disable();
    let stats = relay.stats();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.delivered, 1);
}

#[test]
fn relay_can_be_enabled_again_after_disable() {
    let (tx, rx) = unbounded();
    let relay = FrameRelay::new(4, WAIT);
    for round in 0..2u8 {
        let tx = tx.clone();
        relay
            .enable(Box::new(move |rgba: &[u8], _: u32, _: u32| -> anyhow::Result<()> {
                tx.send(rgba[0])?;
                Ok(())
            }))
            .unwrap();
        assert!(relay.push(vec![round; 4], Size::new(1, 1)));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), round);
        relay.disable();
    }
    assert!(!relay.push(vec![9; 4], Size::new(1, 1)));
}
