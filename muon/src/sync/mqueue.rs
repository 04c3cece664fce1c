//! Bounded message queues with per-message priority.
//!
//! Messages are fixed-size byte blocks in `capacity` slots. Slots are
//! threaded onto two index chains: a free chain and a ready chain sorted
//! by descending message priority, FIFO within equal priority, so a
//! receiver always takes the head. Blocked senders queue in priority
//! order and retry when a slot frees; blocked receivers are woken by the
//! next send.
//!
//! Storage is caller-provided ([`QueueStorage`] / [`make_message_queue!`]);
//! the queue allocates nothing.

use crate::cell::LockedRefCell;
use crate::error::{Error, Result};
use crate::kernel::fault::{kernel_fault, KernelFault};
use crate::kernel::hal;
use crate::kernel::klock::KernelLock;
use crate::kernel::scheduler;
use crate::kernel::waiter::{WaitList, WakeReason};
use crate::thread::ThreadState;
use crate::time::{Duration, Instant};
use core::mem::MaybeUninit;
use static_cell::ConstStaticCell;

const NIL: u16 = u16::MAX;

#[derive(Copy, Clone)]
pub struct SlotMeta {
    next: u16,
    len: u16,
    prio: u8,
}

impl SlotMeta {
    pub const EMPTY: SlotMeta = SlotMeta {
        next: NIL,
        len: 0,
        prio: 0,
    };
}

/// Static backing store for a [`MessageQueue`].
pub struct QueueStorage<const CAPACITY: usize, const MSG_SIZE: usize> {
    data: ConstStaticCell<[[MaybeUninit<u8>; MSG_SIZE]; CAPACITY]>,
    meta: ConstStaticCell<[SlotMeta; CAPACITY]>,
}

impl<const CAPACITY: usize, const MSG_SIZE: usize> QueueStorage<CAPACITY, MSG_SIZE> {
    pub const fn new() -> QueueStorage<CAPACITY, MSG_SIZE> {
        QueueStorage {
            data: ConstStaticCell::new([[MaybeUninit::uninit(); MSG_SIZE]; CAPACITY]),
            meta: ConstStaticCell::new([SlotMeta::EMPTY; CAPACITY]),
        }
    }

    /// Take the storage as erased slices. Panics on a second call.
    pub fn take(&'static self) -> (&'static mut [MaybeUninit<u8>], &'static mut [SlotMeta], usize) {
        let data = self.data.take();
        let data = unsafe {
            core::slice::from_raw_parts_mut(
                data.as_mut_ptr() as *mut MaybeUninit<u8>,
                CAPACITY * MSG_SIZE,
            )
        };
        (data, self.meta.take(), MSG_SIZE)
    }
}

/// Create a `&'static MessageQueue` with static storage:
/// `make_message_queue!(capacity, msg_size)`.
#[macro_export]
macro_rules! make_message_queue {
    ($capacity:expr, $msg_size:expr) => {{
        static STORAGE: $crate::sync::mqueue::QueueStorage<{ $capacity }, { $msg_size }> =
            $crate::sync::mqueue::QueueStorage::new();
        static QUEUE: $crate::static_cell::StaticCell<$crate::sync::mqueue::MessageQueue> =
            $crate::static_cell::StaticCell::new();
        let (data, meta, msg_size) = STORAGE.take();
        &*QUEUE.init($crate::sync::mqueue::MessageQueue::new(data, meta, msg_size))
    }};
}

/// The slot bookkeeping, free of any blocking concerns.
pub(crate) struct MsgRing {
    data: &'static mut [MaybeUninit<u8>],
    meta: &'static mut [SlotMeta],
    msg_size: usize,
    first: u16,
    free: u16,
    len: usize,
}

impl MsgRing {
    fn new(
        data: &'static mut [MaybeUninit<u8>],
        meta: &'static mut [SlotMeta],
        msg_size: usize,
    ) -> MsgRing {
        let capacity = meta.len();
        if capacity == 0
            || capacity >= NIL as usize
            || msg_size == 0
            || data.len() != capacity * msg_size
        {
            kernel_fault(KernelFault::ConfigError("bad message queue storage"));
        }
        let mut ring = MsgRing {
            data,
            meta,
            msg_size,
            first: NIL,
            free: NIL,
            len: 0,
        };
        ring.rebuild_free_chain();
        ring
    }

    fn rebuild_free_chain(&mut self) {
        let capacity = self.meta.len();
        for (index, slot) in self.meta.iter_mut().enumerate() {
            slot.next = if index + 1 < capacity {
                (index + 1) as u16
            } else {
                NIL
            };
        }
        self.first = NIL;
        self.free = 0;
        self.len = 0;
    }

    fn capacity(&self) -> usize {
        self.meta.len()
    }

    fn msg_size(&self) -> usize {
        self.msg_size
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn is_full(&self) -> bool {
        self.free == NIL
    }

    fn slot_data(&mut self, slot: u16) -> &mut [MaybeUninit<u8>] {
        let start = slot as usize * self.msg_size;
        &mut self.data[start..start + self.msg_size]
    }

    /// Insert a message, keeping the ready chain sorted by descending
    /// priority with FIFO among equals. `false` when full.
    fn push(&mut self, msg: &[u8], prio: u8) -> bool {
        let slot = self.free;
        if slot == NIL {
            return false;
        }
        self.free = self.meta[slot as usize].next;

        for (dst, src) in self.slot_data(slot).iter_mut().zip(msg.iter()) {
            dst.write(*src);
        }
        self.meta[slot as usize].len = msg.len() as u16;
        self.meta[slot as usize].prio = prio;

        // Skip past everything with equal or higher priority.
        let mut prev = NIL;
        let mut cursor = self.first;
        while cursor != NIL && self.meta[cursor as usize].prio >= prio {
            prev = cursor;
            cursor = self.meta[cursor as usize].next;
        }
        self.meta[slot as usize].next = cursor;
        if prev == NIL {
            self.first = slot;
        } else {
            self.meta[prev as usize].next = slot;
        }

        self.len += 1;
        true
    }

    /// Take the head message into `buf`; returns `(length, priority)`.
    fn pop(&mut self, buf: &mut [u8]) -> Option<(usize, u8)> {
        let slot = self.first;
        if slot == NIL {
            return None;
        }
        let meta = self.meta[slot as usize];
        self.first = meta.next;

        let len = meta.len as usize;
        let start = slot as usize * self.msg_size;
        for (dst, src) in buf.iter_mut().zip(self.data[start..start + len].iter()) {
            *dst = unsafe { src.assume_init() };
        }

        self.meta[slot as usize].next = self.free;
        self.free = slot;
        self.len -= 1;
        Some((len, meta.prio))
    }

    fn clear(&mut self) {
        self.rebuild_free_chain();
    }
}

pub struct MessageQueue {
    ring: LockedRefCell<MsgRing, KernelLock>,
    senders: WaitList,
    receivers: WaitList,
}

impl MessageQueue {
    /// Wrap caller-provided storage; see [`make_message_queue!`].
    pub fn new(
        data: &'static mut [MaybeUninit<u8>],
        meta: &'static mut [SlotMeta],
        msg_size: usize,
    ) -> MessageQueue {
        MessageQueue {
            ring: LockedRefCell::new(MsgRing::new(data, meta, msg_size)),
            senders: WaitList::new(),
            receivers: WaitList::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        KernelLock::with(|kkey| self.ring.borrow(kkey).capacity())
    }

    pub fn msg_size(&self) -> usize {
        KernelLock::with(|kkey| self.ring.borrow(kkey).msg_size())
    }

    pub fn len(&self) -> usize {
        KernelLock::with(|kkey| self.ring.borrow(kkey).len())
    }

    pub fn is_empty(&self) -> bool {
        KernelLock::with(|kkey| self.ring.borrow(kkey).is_empty())
    }

    pub fn is_full(&self) -> bool {
        KernelLock::with(|kkey| self.ring.borrow(kkey).is_full())
    }

    pub fn send(&self, msg: &[u8], prio: u8) -> Result<()> {
        self.send_inner(msg, prio, None, false)
    }

    /// Handler-safe send that never blocks.
    pub fn try_send(&self, msg: &[u8], prio: u8) -> Result<()> {
        self.send_inner(msg, prio, None, true)
    }

    pub fn send_until(&self, msg: &[u8], prio: u8, deadline: Instant) -> Result<()> {
        self.send_inner(msg, prio, Some(deadline), false)
    }

    pub fn send_for(&self, msg: &[u8], prio: u8, timeout: Duration) -> Result<()> {
        self.send_until(msg, prio, crate::kernel::clock::sysclock().now() + timeout)
    }

    fn send_inner(
        &self,
        msg: &[u8],
        prio: u8,
        deadline: Option<Instant>,
        try_only: bool,
    ) -> Result<()> {
        if !try_only && hal::in_handler_mode() {
            return Err(Error::Perm);
        }
        KernelLock::with(|kkey| {
            if msg.len() > self.ring.borrow(kkey).msg_size() {
                return Err(Error::MsgSize);
            }
            loop {
                let stored = self.ring.borrow_mut(kkey).push(msg, prio);
                if stored {
                    self.receivers.wake_one(kkey, WakeReason::Notify);
                    scheduler::reschedule(kkey);
                    return Ok(());
                }
                if try_only {
                    return Err(Error::WouldBlock);
                }

                let reason = scheduler::block_current(
                    kkey,
                    Some(&self.senders),
                    deadline,
                    ThreadState::Blocked,
                );
                match reason {
                    // A receive freed a slot; try again.
                    WakeReason::Notify | WakeReason::Transfer | WakeReason::Pending => continue,
                    WakeReason::Timeout => return Err(Error::TimedOut),
                    WakeReason::Interrupted => return Err(Error::Interrupted),
                }
            }
        })
    }

    /// Receive the highest-priority message into `buf`, blocking while
    /// the queue is empty. Returns the message length and its priority.
    pub fn receive(&self, buf: &mut [u8]) -> Result<(usize, u8)> {
        self.receive_inner(buf, None, false)
    }

    pub fn try_receive(&self, buf: &mut [u8]) -> Result<(usize, u8)> {
        self.receive_inner(buf, None, true)
    }

    pub fn receive_until(&self, buf: &mut [u8], deadline: Instant) -> Result<(usize, u8)> {
        self.receive_inner(buf, Some(deadline), false)
    }

    pub fn receive_for(&self, buf: &mut [u8], timeout: Duration) -> Result<(usize, u8)> {
        self.receive_until(buf, crate::kernel::clock::sysclock().now() + timeout)
    }

    fn receive_inner(
        &self,
        buf: &mut [u8],
        deadline: Option<Instant>,
        try_only: bool,
    ) -> Result<(usize, u8)> {
        if !try_only && hal::in_handler_mode() {
            return Err(Error::Perm);
        }
        KernelLock::with(|kkey| {
            if buf.len() < self.ring.borrow(kkey).msg_size() {
                return Err(Error::MsgSize);
            }
            loop {
                let taken = self.ring.borrow_mut(kkey).pop(buf);
                if let Some(received) = taken {
                    // A freed slot may unblock the best sender.
                    self.senders.wake_one(kkey, WakeReason::Notify);
                    scheduler::reschedule(kkey);
                    return Ok(received);
                }
                if try_only {
                    return Err(Error::WouldBlock);
                }

                let reason = scheduler::block_current(
                    kkey,
                    Some(&self.receivers),
                    deadline,
                    ThreadState::Blocked,
                );
                match reason {
                    WakeReason::Notify | WakeReason::Transfer | WakeReason::Pending => continue,
                    WakeReason::Timeout => return Err(Error::TimedOut),
                    WakeReason::Interrupted => return Err(Error::Interrupted),
                }
            }
        })
    }

    /// Drop all queued messages and abort every pending send and
    /// receive with `Interrupted`.
    pub fn reset(&self) -> Result<()> {
        KernelLock::with(|kkey| {
            self.ring.borrow_mut(kkey).clear();
            self.senders.wake_all(kkey, WakeReason::Interrupted);
            self.receivers.wake_all(kkey, WakeReason::Interrupted);
            scheduler::reschedule(kkey);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{MsgRing, SlotMeta};
    use core::mem::MaybeUninit;

    fn ring(capacity: usize, msg_size: usize) -> MsgRing {
        let data = Box::leak(vec![MaybeUninit::uninit(); capacity * msg_size].into_boxed_slice());
        let meta = Box::leak(vec![SlotMeta::EMPTY; capacity].into_boxed_slice());
        MsgRing::new(data, meta, msg_size)
    }

    fn pop_expect(ring: &mut MsgRing, expected: &[u8], prio: u8) {
        let mut buf = [0u8; 8];
        let (len, mprio) = ring.pop(&mut buf).unwrap();
        assert_eq!(&buf[..len], expected);
        assert_eq!(mprio, prio);
    }

    #[test]
    fn priority_order_fifo_within_equal() {
        let mut ring = ring(3, 4);
        assert!(ring.push(b"a", 1));
        assert!(ring.push(b"b", 5));
        assert!(ring.push(b"c", 5));

        pop_expect(&mut ring, b"b", 5);
        pop_expect(&mut ring, b"c", 5);
        pop_expect(&mut ring, b"a", 1);
        assert!(ring.is_empty());
    }

    #[test]
    fn full_and_slot_reuse() {
        let mut ring = ring(2, 4);
        assert!(ring.push(b"one", 0));
        assert!(ring.push(b"two", 0));
        assert!(!ring.push(b"three", 9));
        assert!(ring.is_full());

        pop_expect(&mut ring, b"one", 0);
        assert!(ring.push(b"four", 7));
        pop_expect(&mut ring, b"four", 7);
        pop_expect(&mut ring, b"two", 0);
    }

    #[test]
    fn variable_length_payloads() {
        let mut ring = ring(2, 8);
        assert!(ring.push(b"", 3));
        assert!(ring.push(b"12345678", 2));

        let mut buf = [0u8; 8];
        assert_eq!(ring.pop(&mut buf).unwrap(), (0, 3));
        assert_eq!(ring.pop(&mut buf).unwrap(), (8, 2));
        assert_eq!(&buf, b"12345678");
    }

    #[test]
    fn clear_restores_capacity() {
        let mut ring = ring(2, 4);
        assert!(ring.push(b"x", 1));
        assert!(ring.push(b"y", 1));
        ring.clear();
        assert!(ring.is_empty());
        assert!(ring.push(b"z", 1));
        pop_expect(&mut ring, b"z", 1);
    }
}
