//! Message queues: descending-priority delivery with FIFO among equals,
//! size checking, blocking producers and consumers, and reset.

use muon::prelude::*;
use muon_test::{test_assert, test_assert_eq};

const STACK_SIZE: usize = 64 * 1024;

fn consumer_entry(arg: *mut ()) {
    let queue = unsafe { &*(arg as *const MessageQueue) };
    let mut buf = [0u8; 4];
    let (len, prio) = queue.receive(&mut buf).unwrap();
    test_assert_eq!(&buf[..len], b"ping");
    test_assert_eq!(prio, 9);
}

fn producer_entry(arg: *mut ()) {
    let queue = unsafe { &*(arg as *const MessageQueue) };
    // The queue is full; this blocks until a slot frees.
    queue.send(b"late", 1).unwrap();
}

fn reset_victim_entry(arg: *mut ()) {
    let queue = unsafe { &*(arg as *const MessageQueue) };
    let mut buf = [0u8; 4];
    test_assert_eq!(queue.receive(&mut buf), Err(Error::Interrupted));
}

fn main_entry(_: *mut ()) {
    // Delivery order: descending priority, FIFO within equal priority.
    let ordered = muon::make_message_queue!(3, 4);
    ordered.send(b"a", 1).unwrap();
    ordered.send(b"b", 5).unwrap();
    ordered.send(b"c", 5).unwrap();
    test_assert!(ordered.is_full());

    let mut buf = [0u8; 4];
    test_assert_eq!(ordered.receive(&mut buf).unwrap(), (1, 5));
    test_assert_eq!(buf[0], b'b');
    test_assert_eq!(ordered.receive(&mut buf).unwrap(), (1, 5));
    test_assert_eq!(buf[0], b'c');
    test_assert_eq!(ordered.receive(&mut buf).unwrap(), (1, 1));
    test_assert_eq!(buf[0], b'a');
    test_assert!(ordered.is_empty());

    // Size checking on both ends.
    test_assert_eq!(ordered.send(b"toolong", 0), Err(Error::MsgSize));
    let mut small = [0u8; 2];
    test_assert_eq!(ordered.receive(&mut small), Err(Error::MsgSize));
    test_assert_eq!(ordered.try_receive(&mut buf), Err(Error::WouldBlock));

    // A blocked consumer is served by the next send.
    let consumer = muon::make_thread!("consumer", 7, STACK_SIZE);
    consumer
        .start(consumer_entry, ordered as *const MessageQueue as *mut ())
        .unwrap();
    test_assert_eq!(consumer.state(), muon::ThreadState::Blocked);
    ordered.send(b"ping", 9).unwrap();
    consumer.join().unwrap();

    // A blocked producer is served by the next receive.
    let single = muon::make_message_queue!(1, 4);
    single.send(b"old", 0).unwrap();
    let producer = muon::make_thread!("producer", 7, STACK_SIZE);
    producer
        .start(producer_entry, single as *const MessageQueue as *mut ())
        .unwrap();
    test_assert_eq!(producer.state(), muon::ThreadState::Blocked);
    test_assert_eq!(single.try_send(b"no", 0), Err(Error::WouldBlock));

    test_assert_eq!(single.receive(&mut buf).unwrap(), (3, 0));
    test_assert_eq!(&buf[..3], b"old");
    producer.join().unwrap();
    test_assert_eq!(single.receive(&mut buf).unwrap(), (4, 1));
    test_assert_eq!(&buf, b"late");

    // Timed receive on an empty queue.
    test_assert_eq!(
        single.receive_for(&mut buf, Duration::from_millis(30)),
        Err(Error::TimedOut)
    );

    // Reset interrupts every waiter and drops queued messages.
    single.send(b"drop", 0).unwrap();
    let victim = muon::make_thread!("victim", 7, STACK_SIZE);
    let drained = muon::make_message_queue!(1, 4);
    victim
        .start(reset_victim_entry, drained as *const MessageQueue as *mut ())
        .unwrap();
    drained.reset().unwrap();
    victim.join().unwrap();
    single.reset().unwrap();
    test_assert!(single.is_empty());

    muon_test::test_succeed();
}

fn main() {
    let main = muon::make_thread!("main", 5, STACK_SIZE);
    main.start(main_entry, core::ptr::null_mut()).unwrap();
    muon::kernel::start();
}
