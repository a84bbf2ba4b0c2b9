//! High-level Channel API for FrameBus
//!
//! A channel is a named segment holding one frame buffer layout. The
//! producer process creates it and removes it on drop; consumer processes
//! attach to it, claim a consumer index and never initialize or remove it.

use crate::bus::{BusState, FrameBus};
use crate::error::{FrameBusError, Result};
use crate::frame::{Frame, FrameGeometry};
use crate::layout::{channel_state, FrameBufferHeader, MAX_CONSUMERS};
use crate::shm::SharedRegion;
use crate::wait::{StopSignal, WaitPolicy, DEFAULT_POLL_INTERVAL};
use std::ptr::NonNull;
use std::time::{Duration, Instant};

/// First retry delay while waiting for a channel to appear
const OPEN_BACKOFF_START: Duration = Duration::from_millis(5);
/// Longest retry delay while waiting for a channel to appear
const OPEN_BACKOFF_MAX: Duration = Duration::from_millis(200);

/// Channel configuration
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Frame dimensions; producer and consumers must agree
    pub geometry: FrameGeometry,
    /// Number of consumers the producer waits for before overwriting a frame
    pub consumers: usize,
    /// How long `publish` may wait on the consumer barrier before reporting a stall
    pub stall_timeout: Option<Duration>,
    /// How long `consume` may wait for a new frame
    pub consume_timeout: Option<Duration>,
    /// How long an opener keeps retrying while the channel is missing or initializing
    pub open_timeout: Duration,
    /// Wait slice used when a timeout or stop signal is in effect
    pub poll_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            geometry: FrameGeometry::default(),
            consumers: 1,
            stall_timeout: Some(Duration::from_secs(10)),
            consume_timeout: None,
            open_timeout: Duration::from_secs(5),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ChannelConfig {
    pub fn with_geometry(mut self, geometry: FrameGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn with_consumers(mut self, consumers: usize) -> Self {
        self.consumers = consumers;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_consume_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.consume_timeout = timeout;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    fn policy(&self, timeout: Option<Duration>) -> WaitPolicy {
        WaitPolicy {
            timeout,
            stop: None,
            poll_interval: self.poll_interval,
        }
    }
}

/// Bus handle over a mapped region
///
/// # Safety
/// `shm` must hold an initialized layout and outlive the returned bus.
unsafe fn bus_for(shm: &SharedRegion) -> FrameBus {
    let base = shm.as_ptr();
    // SharedRegion pointers are non-null mmap results
    let header = NonNull::new_unchecked(base.cast::<FrameBufferHeader>());
    let slot = NonNull::new_unchecked(base.add(FrameBufferHeader::slot_offset()));
    FrameBus::from_raw(header, slot)
}

/// Producer (creator) side of a channel
pub struct ProducerChannel {
    // Drop order: close through the bus, then unmap and unlink
    bus: FrameBus,
    shm: SharedRegion,
    geometry: FrameGeometry,
    policy: WaitPolicy,
}

impl ProducerChannel {
    /// Create a channel as its producer
    ///
    /// Any stale segment of the same name is removed first. The layout is
    /// fully initialized before it is marked ready for consumers.
    pub fn create(name: &str, config: ChannelConfig) -> Result<Self> {
        if config.consumers > MAX_CONSUMERS {
            return Err(FrameBusError::TooManyConsumers {
                max: MAX_CONSUMERS,
                got: config.consumers,
            });
        }
        config.geometry.validate()?;

        if SharedRegion::remove(name)? {
            tracing::warn!(channel = %name, "removed stale shared memory segment");
        }

        let total_size = FrameBufferHeader::total_size(&config.geometry);
        let shm = SharedRegion::create(name, total_size)?;

        let bus = unsafe {
            FrameBufferHeader::init(
                shm.as_ptr().cast::<FrameBufferHeader>(),
                config.geometry,
                config.consumers,
            )?;
            bus_for(&shm)
        };
        bus.header().mark_ready();

        tracing::info!(
            channel = %name,
            geometry = %config.geometry,
            consumers = config.consumers,
            bytes = total_size,
            "channel created"
        );

        Ok(Self {
            bus,
            shm,
            geometry: config.geometry,
            policy: config.policy(config.stall_timeout),
        })
    }

    /// Let `stop` interrupt a publish that is waiting on the barrier
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.policy.stop = Some(stop);
        self
    }

    /// Publish a frame to every consumer
    ///
    /// Blocks until all consumers have read the previous frame. Returns the
    /// sequence number assigned to this frame.
    pub fn publish(&self, frame: &Frame) -> Result<u64> {
        if frame.geometry() != self.geometry {
            return Err(FrameBusError::GeometryMismatch {
                expected: self.geometry.to_string(),
                got: frame.geometry().to_string(),
            });
        }
        self.publish_bytes(frame.as_bytes())
    }

    /// Publish raw pixel bytes; length must equal the frame size
    #[inline]
    pub fn publish_bytes(&self, data: &[u8]) -> Result<u64> {
        self.bus.publish(data, &self.policy)
    }

    /// Publish with an explicit wait policy
    pub fn publish_with(&self, frame: &Frame, policy: &WaitPolicy) -> Result<u64> {
        if frame.geometry() != self.geometry {
            return Err(FrameBusError::GeometryMismatch {
                expected: self.geometry.to_string(),
                got: frame.geometry().to_string(),
            });
        }
        self.bus.publish(frame.as_bytes(), policy)
    }

    /// Snapshot the barrier state
    pub fn state(&self) -> Result<BusState> {
        self.bus.state()
    }

    /// Number of consumer indices currently claimed
    pub fn registered(&self) -> usize {
        self.bus.header().registered()
    }

    pub fn consumers(&self) -> usize {
        self.bus.header().consumers()
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Get the name of the channel
    pub fn name(&self) -> &str {
        self.shm.name()
    }
}

impl Drop for ProducerChannel {
    fn drop(&mut self) {
        if let Err(e) = self.bus.close() {
            tracing::warn!(channel = %self.shm.name(), error = %e, "failed to close channel");
        }
        tracing::info!(channel = %self.shm.name(), "channel removed");
    }
}

/// How a consumer picks its index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Lowest free index
    Any,
    /// This exact index
    Index(usize),
}

/// Consumer (opener) side of a channel
pub struct ConsumerChannel {
    bus: FrameBus,
    shm: SharedRegion,
    index: usize,
    pid: u32,
    geometry: FrameGeometry,
    policy: WaitPolicy,
}

impl ConsumerChannel {
    /// Attach to a channel and claim the lowest free consumer index
    pub fn open(name: &str, config: ChannelConfig) -> Result<Self> {
        Self::open_with(name, Registration::Any, config)
    }

    /// Attach to a channel as consumer `index`
    pub fn open_as(name: &str, index: usize, config: ChannelConfig) -> Result<Self> {
        Self::open_with(name, Registration::Index(index), config)
    }

    pub fn open_with(name: &str, registration: Registration, config: ChannelConfig) -> Result<Self> {
        config.geometry.validate()?;
        let shm = Self::attach(name, &config)?;
        let bus = unsafe { bus_for(&shm) };
        let header = bus.header();
        let consumers = header.consumers();
        let pid = std::process::id();

        let index = match registration {
            Registration::Any => header
                .claim_any(pid)
                .ok_or(FrameBusError::NoFreeConsumerSlot { consumers })?,
            Registration::Index(index) => {
                if index >= consumers {
                    return Err(FrameBusError::InvalidConsumerIndex { index, consumers });
                }
                header
                    .claim(index, pid)
                    .map_err(|owner| FrameBusError::ConsumerIndexInUse { index, owner })?;
                index
            }
        };

        tracing::info!(channel = %name, index, consumers, "channel opened");

        Ok(Self {
            bus,
            shm,
            index,
            pid,
            geometry: config.geometry,
            policy: config.policy(config.consume_timeout),
        })
    }

    /// Map the segment once its creator has marked it ready
    ///
    /// Retries with exponential backoff while the segment is missing,
    /// unsized, still initializing or owned by a dead producer, up to
    /// `config.open_timeout`.
    fn attach(name: &str, config: &ChannelConfig) -> Result<SharedRegion> {
        let start = Instant::now();
        let mut backoff = OPEN_BACKOFF_START;

        loop {
            match Self::try_attach(name, config) {
                Ok(shm) => return Ok(shm),
                Err(e) if e.is_retryable() && start.elapsed() < config.open_timeout => {
                    tracing::debug!(channel = %name, error = %e, ?backoff, "channel not ready, retrying");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(OPEN_BACKOFF_MAX);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_attach(name: &str, config: &ChannelConfig) -> Result<SharedRegion> {
        let shm = SharedRegion::open(name)?;
        if shm.size() < FrameBufferHeader::slot_offset() {
            return Err(FrameBusError::NotReady {
                name: name.to_string(),
            });
        }

        let header = unsafe { &*shm.as_ptr().cast::<FrameBufferHeader>() };
        match header.state() {
            channel_state::READY if !header.creator_alive() => {
                // Left behind by a producer that died without closing
                return Err(FrameBusError::NotReady {
                    name: name.to_string(),
                });
            }
            channel_state::READY => {}
            channel_state::CLOSED => return Err(FrameBusError::Closed),
            _ => {
                return Err(FrameBusError::NotReady {
                    name: name.to_string(),
                })
            }
        }
        header.validate(shm.size(), Some(config.geometry))?;
        Ok(shm)
    }

    /// Let `stop` interrupt a consume that is waiting for a frame
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.policy.stop = Some(stop);
        self
    }

    /// Read the next frame this consumer has not seen
    pub fn consume(&self) -> Result<Frame> {
        let mut frame = Frame::new(self.geometry);
        self.consume_into(&mut frame)?;
        Ok(frame)
    }

    /// Read the next frame into an existing buffer, returning its sequence number
    pub fn consume_into(&self, frame: &mut Frame) -> Result<u64> {
        self.consume_into_with(frame, &self.policy)
    }

    /// Like [`ConsumerChannel::consume_into`] with an explicit wait policy
    pub fn consume_into_with(&self, frame: &mut Frame, policy: &WaitPolicy) -> Result<u64> {
        if frame.geometry() != self.geometry {
            return Err(FrameBusError::GeometryMismatch {
                expected: self.geometry.to_string(),
                got: frame.geometry().to_string(),
            });
        }
        let sequence = self.bus.consume_into(self.index, frame.as_bytes_mut(), policy)?;
        frame.set_sequence(sequence);
        Ok(sequence)
    }

    /// Snapshot the barrier state
    pub fn state(&self) -> Result<BusState> {
        self.bus.state()
    }

    /// Consumer index claimed by this handle
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Get the name of the channel
    pub fn name(&self) -> &str {
        self.shm.name()
    }
}

impl Drop for ConsumerChannel {
    fn drop(&mut self) {
        self.bus.header().release(self.index, self.pid);
        tracing::debug!(channel = %self.shm.name(), index = self.index, "consumer detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn unique(tag: &str) -> String {
        format!("chan_{}_{}", tag, std::process::id())
    }

    fn small(consumers: usize) -> ChannelConfig {
        ChannelConfig::default()
            .with_geometry(FrameGeometry::new(16, 8, 3))
            .with_consumers(consumers)
            .with_open_timeout(Duration::from_millis(100))
    }

    fn filled(geometry: FrameGeometry, value: u8) -> Frame {
        Frame::from_bytes(geometry, vec![value; geometry.frame_len()]).unwrap()
    }

    #[test]
    fn test_channel_create_open() {
        let name = unique("create_open");
        let config = small(2);

        let producer = ProducerChannel::create(&name, config.clone()).unwrap();
        let c0 = ConsumerChannel::open(&name, config.clone()).unwrap();
        let c1 = ConsumerChannel::open(&name, config.clone()).unwrap();
        assert_eq!((c0.index(), c1.index()), (0, 1));
        assert_eq!(producer.registered(), 2);

        let frame = filled(config.geometry, 0xAB);
        assert_eq!(producer.publish(&frame).unwrap(), 1);

        for consumer in [&c0, &c1] {
            let got = consumer.consume().unwrap();
            assert_eq!(got.sequence(), 1);
            assert_eq!(got.as_bytes(), frame.as_bytes());
        }
        assert!(producer.state().unwrap().drained());
    }

    #[test]
    fn test_open_missing_channel_fails() {
        let err = ConsumerChannel::open(&unique("missing"), small(1))
            .err()
            .unwrap();
        assert!(matches!(err, FrameBusError::ShmOpen { .. }));
    }

    #[test]
    fn test_opener_waits_for_late_creator() {
        let name = unique("late");
        let config = small(1).with_open_timeout(Duration::from_secs(5));

        let opener = {
            let name = name.clone();
            let config = config.clone();
            thread::spawn(move || ConsumerChannel::open(&name, config).map(|c| c.index()))
        };

        thread::sleep(Duration::from_millis(50));
        let _producer = ProducerChannel::create(&name, config).unwrap();
        assert_eq!(opener.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_size_mismatch_is_reported() {
        let name = unique("size");
        let _producer = ProducerChannel::create(&name, small(1)).unwrap();

        let other = small(1).with_geometry(FrameGeometry::new(32, 8, 3));
        assert!(matches!(
            ConsumerChannel::open(&name, other),
            Err(FrameBusError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_static_index_cannot_be_shared() {
        let name = unique("static");
        let config = small(3);
        let _producer = ProducerChannel::create(&name, config.clone()).unwrap();

        let viewer = ConsumerChannel::open_as(&name, 2, config.clone()).unwrap();
        assert_eq!(viewer.index(), 2);
        assert!(matches!(
            ConsumerChannel::open_as(&name, 2, config.clone()),
            Err(FrameBusError::ConsumerIndexInUse { index: 2, .. })
        ));
        assert!(matches!(
            ConsumerChannel::open_as(&name, 3, config.clone()),
            Err(FrameBusError::InvalidConsumerIndex { index: 3, consumers: 3 })
        ));

        // Released on drop
        drop(viewer);
        assert!(ConsumerChannel::open_as(&name, 2, config).is_ok());
    }

    #[test]
    fn test_registration_is_capped() {
        let name = unique("capped");
        let config = small(1);
        let _producer = ProducerChannel::create(&name, config.clone()).unwrap();

        let _first = ConsumerChannel::open(&name, config.clone()).unwrap();
        assert!(matches!(
            ConsumerChannel::open(&name, config),
            Err(FrameBusError::NoFreeConsumerSlot { consumers: 1 })
        ));
    }

    #[test]
    fn test_create_replaces_stale_segment() {
        let name = unique("stale");
        let stale = SharedRegion::create(&name, 128).unwrap();

        let producer = ProducerChannel::create(&name, small(1)).unwrap();
        assert_eq!(producer.name(), name);
        assert!(ConsumerChannel::open(&name, small(1)).is_ok());
        drop(stale);
    }

    #[test]
    fn test_producer_drop_wakes_consumer() {
        let name = unique("drop");
        let config = small(1);
        let producer = ProducerChannel::create(&name, config.clone()).unwrap();
        let consumer = ConsumerChannel::open(&name, config).unwrap();

        let reader = thread::spawn(move || consumer.consume().map(|_| ()));
        thread::sleep(Duration::from_millis(30));
        drop(producer);

        assert!(matches!(reader.join().unwrap(), Err(FrameBusError::Closed)));
    }

    #[test]
    fn test_stop_interrupts_publish() {
        let name = unique("stop_publish");
        let config = small(1).with_stall_timeout(None);
        let stop = StopSignal::new();
        let producer = ProducerChannel::create(&name, config.clone())
            .unwrap()
            .with_stop(stop.clone());
        let frame = Frame::new(config.geometry);

        producer.publish(&frame).unwrap();
        let publisher = thread::spawn(move || producer.publish(&frame));
        thread::sleep(Duration::from_millis(30));
        stop.stop();

        assert!(matches!(publisher.join().unwrap(), Err(FrameBusError::Cancelled)));
    }

    #[test]
    fn test_open_skips_segment_of_dead_producer() {
        let name = unique("dead_producer");

        // Killed before it could close or unlink
        let crashed = ProducerChannel::create(&name, small(1)).unwrap();
        crashed.bus.header().set_creator(crate::layout::exited_pid());
        std::mem::forget(crashed);

        let opener = {
            let name = name.clone();
            thread::spawn(move || {
                ConsumerChannel::open(&name, small(1).with_open_timeout(Duration::from_secs(3)))
            })
        };
        thread::sleep(Duration::from_millis(100));

        let producer = ProducerChannel::create(&name, small(1)).unwrap();
        let consumer = opener.join().unwrap().unwrap();

        producer.publish(&filled(producer.geometry(), 4)).unwrap();
        let frame = consumer.consume().unwrap();
        assert_eq!(frame.sequence(), 1);
        assert_eq!(frame.as_bytes()[0], 4);
    }

    #[test]
    fn test_open_rejects_invalid_geometry() {
        let name = unique("bad_geometry");
        let _producer = ProducerChannel::create(&name, small(1)).unwrap();

        let huge = small(1).with_geometry(FrameGeometry::new(u32::MAX, u32::MAX, u32::MAX));
        assert!(matches!(
            ConsumerChannel::open(&name, huge),
            Err(FrameBusError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_rejects_foreign_geometry() {
        let name = unique("geometry");
        let producer = ProducerChannel::create(&name, small(0)).unwrap();
        let wrong = Frame::new(FrameGeometry::new(1, 1, 1));
        assert!(matches!(
            producer.publish(&wrong),
            Err(FrameBusError::GeometryMismatch { .. })
        ));
    }
}
