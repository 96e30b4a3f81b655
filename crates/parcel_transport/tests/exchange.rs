//! Two endpoints exchanging datagrams through an in-memory link, exercising
//! the delivery-mode, resend, expiry, and head-of-line-blocking behaviour
//! end to end rather than unit-by-unit.
//!
//! The "transport" here is deliberately dumb: it only captures what was
//! sent into a queue. Each test drains that queue itself and feeds the
//! bytes to the peer's [`Context::recv_datagram`], which gives full control
//! over loss, duplication, and reordering without a real socket.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use parcel_io::sequencer::InlineSequencer;
use parcel_io::timer::InlineTimerDriver;
use parcel_io::transport::{IoSlice, SendError, Transport};
use parcel_io::worker::{Checksum, InlineWorker};
use parcel_io::Instant;

use parcel_transport::context::{Context, Delivery};
use parcel_transport::endpoint::Endpoint;
use parcel_transport::packet::header::FragmentType;
use parcel_transport::parcel::{Parcel, ParcelWriter};
use parcel_transport::sender::{Sender, Transmission};
use parcel_transport::{Config, Handle};

/// A checksum algorithm good enough to exercise the embedded/extra checksum
/// paths deterministically, without pulling in a real hashing crate just for
/// tests.
#[derive(Debug, Default, Clone, Copy)]
struct SumChecksum;

impl Checksum for SumChecksum {
    const LEN: usize = 4;

    fn compute(&self, chunks: &[&[u8]]) -> Vec<u8> {
        let mut sum: u32 = 0;
        for chunk in chunks {
            for &byte in *chunk {
                sum = sum.wrapping_add(u32::from(byte));
            }
        }
        sum.to_be_bytes().to_vec()
    }
}

type Outbox = Rc<RefCell<VecDeque<Vec<u8>>>>;

/// Captures every datagram sent through it; never produces anything from
/// `poll_recv` since these tests deliver datagrams by draining the outbox
/// and calling `recv_datagram` directly.
#[derive(Clone)]
struct FakeTransport {
    outbox: Outbox,
}

impl FakeTransport {
    fn new() -> (Self, Outbox) {
        let outbox: Outbox = Rc::new(RefCell::new(VecDeque::new()));
        (Self { outbox: outbox.clone() }, outbox)
    }
}

impl Transport for FakeTransport {
    fn send(&mut self, views: &[IoSlice<'_>]) -> Result<(), SendError> {
        let mut bytes = Vec::new();
        for view in views {
            bytes.extend_from_slice(view.as_slice());
        }
        self.outbox.borrow_mut().push_back(bytes);
        Ok(())
    }

    fn poll_recv(&mut self) -> Vec<Vec<u8>> {
        Vec::new()
    }
}

type TestContext = Context<FakeTransport, SumChecksum, InlineWorker, InlineSequencer, InlineTimerDriver>;

fn new_context() -> (TestContext, InlineTimerDriver) {
    let timer = InlineTimerDriver::new();
    let ctx: TestContext = Context::new(Config::new(64), SumChecksum, InlineWorker, InlineSequencer, timer.clone());
    (ctx, timer)
}

fn drain(outbox: &Outbox) -> Vec<Vec<u8>> {
    outbox.borrow_mut().drain(..).collect()
}

/// Drains every datagram queued in `from` and feeds it to `to_endpoint`, in
/// order.
fn deliver(ctx: &mut TestContext, from: &Outbox, to_endpoint: Handle<Endpoint>, now: Instant) {
    for datagram in drain(from) {
        ctx.recv_datagram(to_endpoint, now, &datagram);
    }
}

fn single_fragment_parcel(bytes: &[u8]) -> Parcel {
    let mut writer = ParcelWriter::new(256, 64);
    writer.write(bytes).unwrap();
    writer.finish().unwrap()
}

fn parcel_bytes(parcel: &Parcel) -> Vec<u8> {
    let mut reader = parcel.reader();
    let mut out = vec![0u8; reader.remain_bytes()];
    reader.read(&mut out);
    out
}

/// Ticks the shared heartbeat once and runs the ping/pong round trip to
/// completion on both sides, leaving both endpoints ready and their RTT
/// estimators seeded from a real (near-instant) sample.
fn settle_handshake(
    ctx: &mut TestContext,
    timer: &InlineTimerDriver,
    out_a: &Outbox,
    out_b: &Outbox,
    ep_a: Handle<Endpoint>,
    ep_b: Handle<Endpoint>,
    now: Instant,
) {
    timer.fire_all();
    ctx.poll(now);
    deliver(ctx, out_a, ep_b, now);
    deliver(ctx, out_b, ep_a, now);
    deliver(ctx, out_a, ep_b, now);

    assert!(ctx.endpoint(ep_a).unwrap().is_ready());
    assert!(ctx.endpoint(ep_b).unwrap().is_ready());
}

fn single_parcel_delivery(deliveries: &[Delivery], endpoint: Handle<Endpoint>, bus_id: u32, fragment_type: FragmentType) -> Vec<u8> {
    assert_eq!(deliveries.len(), 1);
    let Delivery::Parcel { endpoint: got_endpoint, bus_id: got_bus_id, fragment_type: got_fragment_type, parcel } = &deliveries[0] else {
        panic!("expected a Parcel delivery, got {:?}", deliveries[0]);
    };
    assert_eq!(*got_endpoint, endpoint);
    assert_eq!(*got_bus_id, bus_id);
    assert_eq!(*got_fragment_type, fragment_type);
    parcel_bytes(parcel)
}

/// Asserts `deliveries` holds exactly one [`Delivery::SendResult`] for
/// `sender`, from `endpoint`, with the given success count.
fn expect_send_result(deliveries: &[Delivery], sender: Handle<Sender>, endpoint: Handle<Endpoint>, bus_count_succeeded: usize) {
    assert_eq!(deliveries.len(), 1);
    let Delivery::SendResult { sender: got_sender, endpoint: got_endpoint, bus_count_succeeded: got_count } = &deliveries[0] else {
        panic!("expected a SendResult delivery, got {:?}", deliveries[0]);
    };
    assert_eq!(*got_sender, sender);
    assert_eq!(*got_endpoint, endpoint);
    assert_eq!(*got_count, bus_count_succeeded);
}

#[test]
fn ping_pong_handshake_marks_endpoints_ready_and_seeds_rtt() {
    let (mut ctx, timer) = new_context();
    let (transport_a, out_a) = FakeTransport::new();
    let (transport_b, out_b) = FakeTransport::new();
    let ep_a = ctx.create_endpoint(1, transport_a);
    let ep_b = ctx.create_endpoint(1, transport_b);
    let now = Instant::now();

    assert!(!ctx.endpoint(ep_a).unwrap().is_ready());
    settle_handshake(&mut ctx, &timer, &out_a, &out_b, ep_a, ep_b, now);

    // a near-instant local round trip should pull the smoothed RTT well
    // below the un-sampled seed value.
    assert!(ctx.endpoint(ep_a).unwrap().rtt().mean() < Config::new(64).initial_rtt);
    assert!(ctx.endpoint(ep_b).unwrap().rtt().mean() < Config::new(64).initial_rtt);
}

#[test]
fn unreliable_single_fragment_delivers() {
    let (mut ctx, timer) = new_context();
    let (transport_a, out_a) = FakeTransport::new();
    let (transport_b, out_b) = FakeTransport::new();
    let ep_a = ctx.create_endpoint(2, transport_a);
    let ep_b = ctx.create_endpoint(2, transport_b);
    let now = Instant::now();
    settle_handshake(&mut ctx, &timer, &out_a, &out_b, ep_a, ep_b, now);

    let parcel = single_fragment_parcel(b"hello");
    let sender = ctx
        .send(ep_a, vec![Transmission { bus_id: 1, fragment_type: FragmentType::Unreliable }], parcel)
        .unwrap();

    // an unreliable dispatcher completes the moment it's sent, so the
    // sender's result is already available before the peer sees anything.
    let send_result = ctx.drain_deliveries();
    expect_send_result(&send_result, sender, ep_a, 1);

    deliver(&mut ctx, &out_a, ep_b, now);

    let deliveries = ctx.drain_deliveries();
    let bytes = single_parcel_delivery(&deliveries, ep_b, 1, FragmentType::Unreliable);
    assert_eq!(bytes, b"hello");
    assert_eq!(ctx.stats().parcels_sent, 1);
    assert_eq!(ctx.stats().parcels_recv, 1);
}

#[test]
fn reliable_multi_fragment_resends_only_the_lost_fragment() {
    let (mut ctx, timer) = new_context();
    let (transport_a, out_a) = FakeTransport::new();
    let (transport_b, out_b) = FakeTransport::new();
    let ep_a = ctx.create_endpoint(1, transport_a);
    let ep_b = ctx.create_endpoint(1, transport_b);
    let now = Instant::now();
    settle_handshake(&mut ctx, &timer, &out_a, &out_b, ep_a, ep_b, now);

    let cap = ctx.config().fragment_content_capacity();
    // two full chunks plus a short final chunk, so the checksum embeds in
    // the last fragment's slack rather than spawning an extra fragment.
    let payload: Vec<u8> = (0..(cap * 2 + 5)).map(|i| (i % 256) as u8).collect();
    let mut writer = ParcelWriter::new(cap, 64);
    writer.write(&payload).unwrap();
    let parcel = writer.finish().unwrap();
    assert_eq!(parcel.chunks().len(), 3);

    let sender = ctx
        .send(ep_a, vec![Transmission { bus_id: 1, fragment_type: FragmentType::Reliable }], parcel)
        .unwrap();

    let mut sent = drain(&out_a);
    assert_eq!(sent.len(), 3, "one wire fragment per chunk, checksum embedded");
    sent.remove(1); // simulate the middle fragment getting lost
    for datagram in &sent {
        ctx.recv_datagram(ep_b, now, datagram);
    }
    deliver(&mut ctx, &out_b, ep_a, now); // acks for fragment 0 and 2

    assert!(ctx.drain_deliveries().is_empty(), "parcel can't complete with a fragment missing");

    timer.fire_all();
    ctx.poll(now);
    let resent = drain(&out_a);
    assert_eq!(resent.len(), 1, "only the unacked fragment is resent");
    ctx.recv_datagram(ep_b, now, &resent[0]);

    let deliveries = ctx.drain_deliveries();
    let bytes = single_parcel_delivery(&deliveries, ep_b, 1, FragmentType::Reliable);
    assert_eq!(bytes, payload);

    deliver(&mut ctx, &out_b, ep_a, now); // final ack completes the dispatcher and the sender
    let send_result = ctx.drain_deliveries();
    expect_send_result(&send_result, sender, ep_a, 1);
    assert_eq!(ctx.stats().fragments_resent, 1);
}

#[test]
fn sequenced_delivery_drops_stale_fragments_that_arrive_after_a_newer_one() {
    let (mut ctx, timer) = new_context();
    let (transport_a, out_a) = FakeTransport::new();
    let (transport_b, out_b) = FakeTransport::new();
    let ep_a = ctx.create_endpoint(1, transport_a);
    let ep_b = ctx.create_endpoint(1, transport_b);
    let now = Instant::now();
    settle_handshake(&mut ctx, &timer, &out_a, &out_b, ep_a, ep_b, now);

    for payload in [b"one".as_slice(), b"two".as_slice(), b"three".as_slice()] {
        let parcel = single_fragment_parcel(payload);
        let sender = ctx
            .send(ep_a, vec![Transmission { bus_id: 1, fragment_type: FragmentType::Sequenced }], parcel)
            .unwrap();
        // a sequenced dispatcher, like an unreliable one, completes the
        // moment it's sent.
        let send_result = ctx.drain_deliveries();
        expect_send_result(&send_result, sender, ep_a, 1);
    }
    let mut sent = drain(&out_a);
    assert_eq!(sent.len(), 3);

    // deliver newest first, then the two stale ones out of order
    let third = sent.remove(2);
    let first = sent.remove(0);
    let second = sent.remove(0);
    ctx.recv_datagram(ep_b, now, &third);
    ctx.recv_datagram(ep_b, now, &first);
    ctx.recv_datagram(ep_b, now, &second);

    let deliveries = ctx.drain_deliveries();
    let bytes = single_parcel_delivery(&deliveries, ep_b, 1, FragmentType::Sequenced);
    assert_eq!(bytes, b"three", "only the newest sequence number is ever delivered");
}

#[test]
fn unreliable_receiver_expires_and_frees_its_slot_when_a_fragment_never_arrives() {
    let (mut ctx, timer) = new_context();
    let (transport_a, out_a) = FakeTransport::new();
    let (transport_b, out_b) = FakeTransport::new();
    let ep_a = ctx.create_endpoint(1, transport_a);
    let ep_b = ctx.create_endpoint(1, transport_b);
    let now = Instant::now();
    settle_handshake(&mut ctx, &timer, &out_a, &out_b, ep_a, ep_b, now);

    let cap = ctx.config().fragment_content_capacity();
    let payload = vec![9u8; cap + 1]; // two chunks
    let mut writer = ParcelWriter::new(cap, 64);
    writer.write(&payload).unwrap();
    let parcel = writer.finish().unwrap();
    assert_eq!(parcel.chunks().len(), 2);

    let sender = ctx
        .send(ep_a, vec![Transmission { bus_id: 1, fragment_type: FragmentType::Unreliable }], parcel)
        .unwrap();
    let send_result = ctx.drain_deliveries();
    expect_send_result(&send_result, sender, ep_a, 1);
    let sent = drain(&out_a);
    assert_eq!(sent.len(), 2);

    // only the first fragment ever arrives
    ctx.recv_datagram(ep_b, now, &sent[0]);
    assert!(ctx.drain_deliveries().is_empty());

    let later = now + core::time::Duration::from_secs(2);
    ctx.poll(later);
    assert!(ctx.drain_deliveries().is_empty(), "still nothing - the receiver should have expired, not delivered");

    // the freed slot must accept a brand new parcel on the same bus
    let fresh = single_fragment_parcel(b"after expiry");
    let fresh_sender = ctx
        .send(ep_a, vec![Transmission { bus_id: 1, fragment_type: FragmentType::Unreliable }], fresh)
        .unwrap();
    let send_result = ctx.drain_deliveries();
    expect_send_result(&send_result, fresh_sender, ep_a, 1);
    deliver(&mut ctx, &out_a, ep_b, later);
    let deliveries = ctx.drain_deliveries();
    let bytes = single_parcel_delivery(&deliveries, ep_b, 1, FragmentType::Unreliable);
    assert_eq!(bytes, b"after expiry");
}

#[test]
fn duplicate_reliable_fragment_after_completion_only_reacks() {
    let (mut ctx, timer) = new_context();
    let (transport_a, out_a) = FakeTransport::new();
    let (transport_b, out_b) = FakeTransport::new();
    let ep_a = ctx.create_endpoint(1, transport_a);
    let ep_b = ctx.create_endpoint(1, transport_b);
    let now = Instant::now();
    settle_handshake(&mut ctx, &timer, &out_a, &out_b, ep_a, ep_b, now);

    let parcel = single_fragment_parcel(b"only once");
    let sender = ctx
        .send(ep_a, vec![Transmission { bus_id: 1, fragment_type: FragmentType::Reliable }], parcel)
        .unwrap();
    let sent = drain(&out_a);
    assert_eq!(sent.len(), 1);
    let fragment = sent[0].clone();

    ctx.recv_datagram(ep_b, now, &fragment);
    let deliveries = ctx.drain_deliveries();
    assert_eq!(single_parcel_delivery(&deliveries, ep_b, 1, FragmentType::Reliable), b"only once");

    deliver(&mut ctx, &out_b, ep_a, now); // ack completes the dispatcher and the sender
    let send_result = ctx.drain_deliveries();
    expect_send_result(&send_result, sender, ep_a, 1);

    // the same fragment arrives again (e.g. a spurious retransmit crossing
    // in flight with the ack)
    ctx.recv_datagram(ep_b, now, &fragment);
    assert!(ctx.drain_deliveries().is_empty(), "a duplicate of an already-completed parcel is never re-delivered");
    let reack = drain(&out_b);
    assert_eq!(reack.len(), 1, "the duplicate still gets acked, so the sender doesn't keep resending forever");
}

#[test]
fn reliable_send_blocks_a_following_unreliable_send_on_the_same_bus() {
    let (mut ctx, timer) = new_context();
    let (transport_a, out_a) = FakeTransport::new();
    let (transport_b, out_b) = FakeTransport::new();
    let ep_a = ctx.create_endpoint(1, transport_a);
    let ep_b = ctx.create_endpoint(1, transport_b);
    let now = Instant::now();
    settle_handshake(&mut ctx, &timer, &out_a, &out_b, ep_a, ep_b, now);

    let reliable = single_fragment_parcel(b"first");
    let reliable_sender = ctx
        .send(ep_a, vec![Transmission { bus_id: 1, fragment_type: FragmentType::Reliable }], reliable)
        .unwrap();
    let unreliable = single_fragment_parcel(b"second");
    let unreliable_sender = ctx
        .send(ep_a, vec![Transmission { bus_id: 1, fragment_type: FragmentType::Unreliable }], unreliable)
        .unwrap();
    assert!(
        ctx.drain_deliveries().is_empty(),
        "neither sender can finish until the reliable dispatcher is acked - the unreliable \
         one hasn't even been submitted to the bus yet"
    );

    let queued = drain(&out_a);
    assert_eq!(queued.len(), 1, "the unreliable send must wait behind the in-flight reliable dispatcher");

    ctx.recv_datagram(ep_b, now, &queued[0]);
    let first_delivery = ctx.drain_deliveries();
    assert_eq!(single_parcel_delivery(&first_delivery, ep_b, 1, FragmentType::Reliable), b"first");

    deliver(&mut ctx, &out_b, ep_a, now); // ack completes the reliable dispatcher, unblocking the bus

    // completing the reliable dispatcher finishes its sender and also
    // unblocks + immediately dispatches (and completes) the unreliable one,
    // so both results land in the same drain.
    let results = ctx.drain_deliveries();
    assert_eq!(results.len(), 2, "both senders report in once the reliable one is acked");
    for result in &results {
        let Delivery::SendResult { sender, endpoint, bus_count_succeeded } = result else {
            panic!("expected a SendResult delivery, got {result:?}");
        };
        assert_eq!(*endpoint, ep_a);
        assert_eq!(*bus_count_succeeded, 1);
        assert!(*sender == reliable_sender || *sender == unreliable_sender);
    }

    let unblocked = drain(&out_a);
    assert_eq!(unblocked.len(), 1, "the unreliable send proceeds once the reliable one completes");
    ctx.recv_datagram(ep_b, now, &unblocked[0]);

    let deliveries = ctx.drain_deliveries();
    let bytes = single_parcel_delivery(&deliveries, ep_b, 1, FragmentType::Unreliable);
    assert_eq!(bytes, b"second");
}
