/// Chunk queue module for handing audio from the capture thread to the detection thread
///
/// Implements a bounded ring of fixed-size PCM chunks. The audio callback pushes,
/// the detection loop pops with a timeout so it can re-check its stop flag.
/// When the ring is full the oldest queued chunk is dropped.

use cache_padded::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

pub const SAMPLE_RATE: u32 = 16000;
/// 80ms at 16kHz
pub const CHUNK_SIZE: usize = 1280;
/// 64 chunks of 80ms, a little over 5 seconds of audio
pub const QUEUE_CAPACITY: usize = 64;

/// Upper bound on a single condvar wait. The producer notifies without taking
/// the signal lock, so a wakeup can be missed; this caps the extra latency.
const WAKE_SLICE: Duration = Duration::from_millis(5);

/// One fixed-length span of mono PCM audio.
///
/// Immutable once captured. Moved from the audio source into the queue and
/// from the queue into the detection loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    samples: Box<[AudioSample]>,
}

impl AudioChunk {
    pub fn new(samples: Vec<AudioSample>) -> Self {
        Self {
            samples: samples.into_boxed_slice(),
        }
    }

    pub fn samples(&self) -> &[AudioSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration of the chunk at the given sample rate
    pub fn duration(&self, sample_rate: u32) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / sample_rate as f64)
    }
}

impl From<Vec<AudioSample>> for AudioChunk {
    fn from(samples: Vec<AudioSample>) -> Self {
        Self::new(samples)
    }
}

type RingBuffer = HeapRb<AudioChunk>;
type RingProducer = <RingBuffer as Split>::Prod;
type RingConsumer = <RingBuffer as Split>::Cons;

/// Bounded single-producer / single-consumer chunk queue.
///
/// Each half sits behind its own lock so the audio thread only ever contends
/// with the consumer for the duration of a single pop or skip.
pub struct ChunkQueue {
    producer: CachePadded<Mutex<RingProducer>>,
    consumer: CachePadded<Mutex<RingConsumer>>,
    signal: Mutex<()>,
    ready: Condvar,
    dropped: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChunkQueue {
    /// Create a queue with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    /// Create a queue holding at most `capacity` chunks (at least one)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        debug!("Creating chunk queue with capacity: {} chunks", capacity);

        let rb = RingBuffer::new(capacity);
        let (producer, consumer) = rb.split();

        Self {
            producer: CachePadded::new(Mutex::new(producer)),
            consumer: CachePadded::new(Mutex::new(consumer)),
            signal: Mutex::new(()),
            ready: Condvar::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a chunk without blocking on the consumer's wait.
    ///
    /// If the queue is full the oldest chunk is discarded to make room.
    pub fn push(&self, chunk: AudioChunk) {
        let mut producer = lock(&self.producer);

        if producer.is_full() {
            let mut consumer = lock(&self.consumer);
            let skipped = consumer.skip(1);
            drop(consumer);

            if skipped > 0 {
                let skipped = skipped as u64;
                let total = self.dropped.fetch_add(skipped, Ordering::Relaxed) + skipped;
                warn!("Chunk queue full, dropped oldest chunk ({} dropped so far)", total);
            }
        }

        if producer.try_push(chunk).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        drop(producer);

        self.ready.notify_one();
    }

    /// Dequeue a chunk if one is immediately available
    pub fn try_pop(&self) -> Option<AudioChunk> {
        lock(&self.consumer).try_pop()
    }

    /// Dequeue a chunk, waiting at most `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<AudioChunk> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(chunk) = self.try_pop() {
                return Some(chunk);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let wait = (deadline - now).min(WAKE_SLICE);
            let guard = lock(&self.signal);
            let _ = self.ready.wait_timeout(guard, wait);
        }
    }

    /// Discard every queued chunk, returning how many were discarded
    pub fn clear(&self) -> usize {
        let cleared = lock(&self.consumer).clear();
        debug!("Cleared {} chunks from queue", cleared);
        cleared
    }

    /// Number of chunks currently queued
    pub fn len(&self) -> usize {
        lock(&self.consumer).occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        lock(&self.consumer).capacity().get()
    }

    /// Total chunks discarded by the drop-oldest policy since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for ChunkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn chunk(marker: i16) -> AudioChunk {
        AudioChunk::new(vec![marker; 4])
    }

    #[test]
    fn test_queue_creation() {
        let queue = ChunkQueue::new();
        assert_eq!(queue.capacity(), QUEUE_CAPACITY);
        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_push_and_pop_in_order() {
        let queue = ChunkQueue::with_capacity(8);
        for marker in 0..3 {
            queue.push(chunk(marker));
        }
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.try_pop(), Some(chunk(0)));
        assert_eq!(queue.try_pop(), Some(chunk(1)));
        assert_eq!(queue.try_pop(), Some(chunk(2)));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = ChunkQueue::with_capacity(3);
        for marker in 0..5 {
            queue.push(chunk(marker));
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);

        // 0 and 1 were discarded, the newest three survive
        assert_eq!(queue.try_pop(), Some(chunk(2)));
        assert_eq!(queue.try_pop(), Some(chunk(3)));
        assert_eq!(queue.try_pop(), Some(chunk(4)));
    }

    #[test]
    fn test_pop_timeout_returns_none_when_empty() {
        let queue = ChunkQueue::with_capacity(4);
        let timeout = Duration::from_millis(30);

        let start = Instant::now();
        assert!(queue.pop_timeout(timeout).is_none());
        let elapsed = start.elapsed();

        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(200), "waited {:?}", elapsed);
    }

    #[test]
    fn test_pop_timeout_wakes_on_push() {
        let queue = Arc::new(ChunkQueue::with_capacity(4));
        let producer = Arc::clone(&queue);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(chunk(7));
        });

        let start = Instant::now();
        let popped = queue.pop_timeout(Duration::from_secs(2));
        handle.join().unwrap();

        assert_eq!(popped, Some(chunk(7)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_zero_capacity_holds_one_chunk() {
        let queue = ChunkQueue::with_capacity(0);
        assert_eq!(queue.capacity(), 1);

        queue.push(chunk(1));
        queue.push(chunk(2));

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop(), Some(chunk(2)));
    }

    #[test]
    fn test_clear() {
        let queue = ChunkQueue::with_capacity(8);
        for marker in 0..5 {
            queue.push(chunk(marker));
        }

        assert_eq!(queue.clear(), 5);
        assert!(queue.is_empty());
        assert!(queue.pop_timeout(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_chunk_duration() {
        let c = AudioChunk::new(vec![0; CHUNK_SIZE]);
        assert_eq!(c.duration(SAMPLE_RATE), Duration::from_millis(80));
        assert_eq!(c.len(), CHUNK_SIZE);
        assert!(!c.is_empty());
    }
}
