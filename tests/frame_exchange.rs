//! End-to-end frame exchange over real shared memory segments
//!
//! Every handle maps the segment on its own, the same way separate
//! processes would; threads only stand in for the processes.

use frame_bus::{
    ChannelConfig, ConsumerChannel, Frame, FrameBusError, FrameGeometry, ProducerChannel,
    StopSignal,
};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

const GEOMETRY: FrameGeometry = FrameGeometry::new(32, 24, 3);

fn name(tag: &str) -> String {
    format!("it_{}_{}", tag, std::process::id())
}

fn config(consumers: usize) -> ChannelConfig {
    ChannelConfig::default()
        .with_geometry(GEOMETRY)
        .with_consumers(consumers)
        .with_open_timeout(Duration::from_secs(2))
}

fn frame(seed: u8) -> Frame {
    let bytes = (0..GEOMETRY.frame_len())
        .map(|i| (i as u8) ^ seed.wrapping_mul(31))
        .collect();
    Frame::from_bytes(GEOMETRY, bytes).unwrap()
}

#[test]
fn known_pattern_arrives_unmodified_on_every_index() {
    let channel = name("pattern");
    let producer = ProducerChannel::create(&channel, config(3)).unwrap();
    let consumers: Vec<_> = (0..3)
        .map(|i| ConsumerChannel::open_as(&channel, i, config(3)).unwrap())
        .collect();

    let sent = frame(0x5A);
    producer.publish(&sent).unwrap();

    for consumer in &consumers {
        let got = consumer.consume().unwrap();
        assert_eq!(got.as_bytes(), sent.as_bytes());
        assert_eq!(got.sequence(), 1);
    }
}

#[test]
fn drained_barrier_lets_next_publish_through() {
    let channel = name("drained");
    let producer = ProducerChannel::create(&channel, config(2)).unwrap();
    let c0 = ConsumerChannel::open(&channel, config(2)).unwrap();
    let c1 = ConsumerChannel::open(&channel, config(2)).unwrap();

    producer.publish(&frame(1)).unwrap();
    c0.consume().unwrap();
    c1.consume().unwrap();
    assert!(producer.state().unwrap().drained());

    let quick = frame_bus::WaitPolicy::timeout(Duration::from_millis(20));
    assert_eq!(producer.publish_with(&frame(2), &quick).unwrap(), 2);
}

#[test]
fn slow_consumer_holds_back_producer() {
    let channel = name("slow");
    let producer = ProducerChannel::create(&channel, config(2)).unwrap();
    let fast = ConsumerChannel::open_as(&channel, 0, config(2)).unwrap();
    let slow = ConsumerChannel::open_as(&channel, 1, config(2)).unwrap();

    let f1 = frame(1);
    let f2 = frame(2);
    producer.publish(&f1).unwrap();
    assert_eq!(fast.consume().unwrap().as_bytes(), f1.as_bytes());

    let (done_tx, done_rx) = mpsc::channel();
    let publisher = {
        let f2 = f2.clone();
        thread::spawn(move || {
            let result = producer.publish(&f2);
            done_tx.send(()).unwrap();
            (producer, result)
        })
    };

    // Blocked until the slow consumer reads F1
    assert!(done_rx.recv_timeout(Duration::from_millis(150)).is_err());
    assert_eq!(slow.consume().unwrap().as_bytes(), f1.as_bytes());
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let (_producer, result) = publisher.join().unwrap();
    assert_eq!(result.unwrap(), 2);

    let next = fast.consume().unwrap();
    assert_eq!(next.sequence(), 2);
    assert_eq!(next.as_bytes(), f2.as_bytes());
}

#[test]
fn missing_consumer_is_reported_as_stall() {
    let channel = name("stall");
    let producer = ProducerChannel::create(
        &channel,
        config(3).with_stall_timeout(Some(Duration::from_millis(200))),
    )
    .unwrap();
    let c0 = ConsumerChannel::open(&channel, config(3)).unwrap();
    let c1 = ConsumerChannel::open(&channel, config(3)).unwrap();

    producer.publish(&frame(1)).unwrap();
    c0.consume().unwrap();
    c1.consume().unwrap();

    match producer.publish(&frame(2)) {
        Err(FrameBusError::Stalled { pending, .. }) => assert_eq!(pending, vec![2]),
        other => panic!("expected a stall, got {:?}", other),
    }
    assert_eq!(producer.registered(), 2);
}

#[test]
fn every_consumer_sees_every_frame_in_order() {
    const FRAMES: u64 = 200;
    let channel = name("ordered");
    let producer = ProducerChannel::create(&channel, config(3)).unwrap();

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let consumer = ConsumerChannel::open(&channel, config(3)).unwrap();
            thread::spawn(move || {
                let mut buf = Frame::new(GEOMETRY);
                for expected in 1..=FRAMES {
                    let seq = consumer.consume_into(&mut buf).unwrap();
                    assert_eq!(seq, expected);
                    assert_eq!(buf.as_bytes(), frame(seq as u8).as_bytes());
                }
            })
        })
        .collect();

    for seq in 1..=FRAMES {
        producer.publish(&frame(seq as u8)).unwrap();
    }
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn stop_signal_releases_parked_consumer() {
    let channel = name("stop");
    let _producer = ProducerChannel::create(&channel, config(1)).unwrap();
    let stop = StopSignal::new();
    let consumer = ConsumerChannel::open(&channel, config(1))
        .unwrap()
        .with_stop(stop.clone());

    let reader = thread::spawn(move || consumer.consume().map(|_| ()));
    thread::sleep(Duration::from_millis(50));
    stop.stop();

    let err = reader.join().unwrap().unwrap_err();
    assert!(err.is_shutdown());
}

#[test]
fn consume_timeout_is_reported() {
    let channel = name("timeout");
    let _producer = ProducerChannel::create(&channel, config(1)).unwrap();
    let consumer = ConsumerChannel::open(
        &channel,
        config(1).with_consume_timeout(Some(Duration::from_millis(60))),
    )
    .unwrap();

    assert!(matches!(
        consumer.consume(),
        Err(FrameBusError::Timeout { .. })
    ));
}

#[test]
fn restarted_producer_replaces_channel() {
    let channel = name("restart");
    let first = ProducerChannel::create(&channel, config(1)).unwrap();
    first.publish(&frame(1)).unwrap();

    // A second creator removes the old segment and starts over
    let second = ProducerChannel::create(&channel, config(1)).unwrap();
    let consumer = ConsumerChannel::open(&channel, config(1)).unwrap();
    assert_eq!(consumer.state().unwrap().sequence, 0);

    second.publish(&frame(9)).unwrap();
    assert_eq!(consumer.consume().unwrap().as_bytes(), frame(9).as_bytes());

    drop(first);
}
