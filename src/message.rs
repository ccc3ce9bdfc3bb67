//! Pooled byte buffers for message payloads.
//!
//! This module primarily implements the [`Message`] type.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::TryReserveError;
use std::sync::Mutex;

/// Buffer size classes served by the pool, smallest first. Requests larger
/// than the last class bypass the pool entirely.
const CLASSES: [usize; 5] = [64, 256, 1024, 4096, 8192];

/// How many spare buffers each size class retains.
const CLASS_DEPTH: usize = 64;

static FREE_LISTS: [Mutex<Vec<Vec<u8>>>; CLASSES.len()] =
    [const { Mutex::new(Vec::new()) }; CLASSES.len()];

/// A unit of application payload with pooled backing storage.
///
/// A message carries a `body` and a small `header` reserved for protocol
/// framing. Both buffers are drawn from a process-wide pool so that sustained
/// traffic does not churn the allocator. A message has exactly one owner at a
/// time; handing it to [`Socket::send`](crate::Socket::send) transfers
/// ownership to the socket, and [`Socket::recv`](crate::Socket::recv)
/// transfers ownership of an arriving message to the caller.
///
/// Call [`free`](Message::free) to return the buffers to the pool when done.
/// Since `free` consumes the message, a released buffer can never be read or
/// written through a stale handle. Dropping a message recycles it as well, so
/// forgetting to free is a missed reuse, not a leak.
///
/// Recycled buffers are not zeroed. The body is expected to be written before
/// it is read; this is what keeps turnover cheap in a busy bus topology.
///
/// # Examples
///
/// ```
/// # use trellis::Message;
/// let mut message = Message::new(2);
/// message.body_mut().extend_from_slice(&[1, 2]);
/// assert_eq!(message.body(), &[1, 2]);
/// message.free();
/// ```
#[derive(Debug, Default)]
pub struct Message {
    header: Vec<u8>,
    body: Vec<u8>,
}

impl Message {
    /// Creates an empty message with at least `capacity` bytes of body
    /// storage, reusing a pooled buffer when one is available.
    pub fn new(capacity: usize) -> Self {
        Self {
            header: Vec::new(),
            body: take_buffer(capacity),
        }
    }

    /// Like [`new`](Message::new), but surfaces allocator exhaustion instead
    /// of aborting.
    pub fn try_new(capacity: usize) -> Result<Self, AllocError> {
        if let Some(body) = try_take_buffer(capacity) {
            return Ok(Self {
                header: Vec::new(),
                body,
            });
        }
        let mut body = Vec::new();
        body.try_reserve_exact(capacity)?;
        Ok(Self {
            header: Vec::new(),
            body,
        })
    }

    /// The message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Mutable access to the message body.
    pub fn body_mut(&mut self) -> &mut Vec<u8> {
        &mut self.body
    }

    /// The protocol header, if any. Empty for bus traffic.
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Mutable access to the protocol header.
    ///
    /// The split between header and body exists only on the sending side:
    /// the wire frame carries the two concatenated, and the receiving socket
    /// surfaces the whole frame as body with an empty header. A protocol
    /// that frames its traffic must parse its header back out of the body on
    /// arrival.
    pub fn header_mut(&mut self) -> &mut Vec<u8> {
        &mut self.header
    }

    /// Total length of header and body.
    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    /// Whether both header and body are empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encodes the header and body into a single wire frame. The frame is
    /// reference counted, so fanning it out to many pipes does not copy.
    pub fn to_bytes(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(self.len());
        frame.put_slice(&self.header);
        frame.put_slice(&self.body);
        frame.freeze()
    }

    /// Returns the message's buffers to the pool.
    pub fn free(self) {
        // Recycling happens in Drop.
        drop(self);
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        give_buffer(std::mem::take(&mut self.header));
        give_buffer(std::mem::take(&mut self.body));
    }
}

impl From<Vec<u8>> for Message {
    fn from(val: Vec<u8>) -> Self {
        Self {
            header: Vec::new(),
            body: val,
        }
    }
}

impl From<&[u8]> for Message {
    fn from(val: &[u8]) -> Self {
        let mut message = Message::new(val.len());
        message.body.extend_from_slice(val);
        message
    }
}

impl<const L: usize> From<[u8; L]> for Message {
    fn from(val: [u8; L]) -> Self {
        Self::from(&val[..])
    }
}

/// The buffer pool could not satisfy an allocation request.
#[derive(Debug, thiserror::Error)]
#[error("message buffer allocation failed: {0}")]
pub struct AllocError(#[from] TryReserveError);

/// The index of the smallest class that can hold `capacity` bytes.
fn class_for(capacity: usize) -> Option<usize> {
    CLASSES.iter().position(|&class| class >= capacity)
}

fn take_buffer(capacity: usize) -> Vec<u8> {
    try_take_buffer(capacity).unwrap_or_else(|| Vec::with_capacity(capacity))
}

/// Pops a pooled buffer that can hold `capacity` bytes, or `None` when the
/// pool has nothing suitable on hand.
fn try_take_buffer(capacity: usize) -> Option<Vec<u8>> {
    let class = class_for(capacity)?;
    let mut list = FREE_LISTS[class].lock().expect("pool lock poisoned");
    let mut buffer = list.pop()?;
    buffer.clear();
    Some(buffer)
}

/// Returns a buffer to the free list of the largest class it can serve.
/// Buffers outside the class range, in either direction, and overflow beyond
/// the class depth fall back to the allocator.
fn give_buffer(buffer: Vec<u8>) {
    let capacity = buffer.capacity();
    if capacity > CLASSES[CLASSES.len() - 1] {
        return;
    }
    let Some(class) = CLASSES
        .iter()
        .rposition(|&class| capacity >= class)
    else {
        return;
    };
    let mut list = FREE_LISTS[class].lock().expect("pool lock poisoned");
    if list.len() < CLASS_DEPTH {
        list.push(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_message() {
        let mut message = Message::new(4);
        assert!(message.is_empty());
        message.body_mut().extend_from_slice(b"body");
        assert_eq!(message.body(), b"body");
        assert_eq!(message.len(), 4);
        message.free();
    }

    #[test]
    fn header_and_body_framing() {
        let mut message = Message::from(&b"body"[..]);
        message.header_mut().extend_from_slice(b"header");
        assert_eq!(message.len(), 10);
        assert_eq!(&message.to_bytes()[..], b"headerbody");
    }

    #[test]
    fn header_arrives_merged_into_body() {
        let mut sent = Message::from(&b"payload"[..]);
        sent.header_mut().extend_from_slice(b"tag:");
        let frame = sent.to_bytes();

        // The receiving side sees one flat frame; the sender's header/body
        // split does not survive the wire.
        let received = Message::from(&frame[..]);
        assert!(received.header().is_empty());
        assert_eq!(received.body(), b"tag:payload");
    }

    #[test]
    fn try_new_reserves() {
        let message = Message::try_new(100).unwrap();
        assert!(message.body.capacity() >= 100);
    }

    #[test]
    fn class_selection() {
        assert_eq!(class_for(0), Some(0));
        assert_eq!(class_for(64), Some(0));
        assert_eq!(class_for(65), Some(1));
        assert_eq!(class_for(8192), Some(4));
        assert_eq!(class_for(8193), None);
    }

    #[test]
    fn pool_reuses_buffers() {
        // Drain anything other tests may have parked in the 1024 class so
        // the reuse below is observable.
        FREE_LISTS[2].lock().unwrap().clear();

        let mut message = Message::new(1024);
        message.body_mut().extend_from_slice(&[7; 1000]);
        let capacity = message.body.capacity();
        message.free();

        let recycled = Message::new(1024);
        assert_eq!(recycled.body.capacity(), capacity);
        assert!(recycled.body.is_empty());
    }

    #[test]
    fn oversize_requests_bypass_pool() {
        let message = Message::new(1 << 20);
        assert!(message.body.capacity() >= 1 << 20);
        message.free();
    }

    #[test]
    fn oversize_buffers_are_not_retained() {
        let message = Message::new(1 << 20);
        message.free();
        // The freed buffer must go back to the allocator, not sit in the
        // largest class where it would be pinned for the process lifetime.
        let biggest = FREE_LISTS[CLASSES.len() - 1].lock().unwrap();
        assert!(biggest
            .iter()
            .all(|buffer| buffer.capacity() <= CLASSES[CLASSES.len() - 1]));
    }

    #[test]
    fn concurrent_churn_does_not_alias() {
        let threads: Vec<_> = (0u8..8)
            .map(|fill| {
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let mut message = Message::new(256);
                        message.body_mut().resize(200, fill);
                        std::thread::yield_now();
                        assert!(message.body().iter().all(|&b| b == fill));
                        message.free();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
    }
}
