//! See [`Context`].
//!
//! The pool owner: every pooled entity (senders, dispatchers, receivers,
//! endpoints) lives here, addressed only by [`Handle`]. Entity structs never
//! hold a reference to `Context` or to each other directly - they hold
//! handles, and the methods here re-resolve those handles each time they
//! need to touch another entity. This mirrors how the teacher's pool-based
//! aeronet code (and any entity-component system) avoids long-lived
//! overlapping borrows: look a thing up by id, act on it, let the borrow
//! end, look the next thing up.

use std::sync::Arc;

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};
use web_time::Instant;

use parcel_io::{
    sequencer::Sequencer,
    timer::{TimerDriver, TimerHandle},
    transport::{IoSlice, Transport},
    worker::{Checksum, Worker},
};

use crate::{
    bus::Bus,
    config::Config,
    dispatcher::{self, Dispatcher},
    endpoint::Endpoint,
    error::ResourceError,
    fragment,
    heartbeat::Heartbeat,
    packet::{
        header::{FragmentHeader, FragmentType},
        Seq,
    },
    parcel::{Parcel, ParcelWriter},
    pipeline::{drive, Advance},
    pool::{Handle, Pool},
    receiver::{BusRef, ExpiryEntry, Receiver},
    rtt::{expiry_timeout, resend_period},
    sender::{self, Sender, Transmission},
    stats::Stats,
    system::SystemMessage,
};

/// Outcome of handing a just-reassembled user-bus parcel to the
/// application, or a just-decoded system-bus message to the endpoint's
/// protocol handler.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// A parcel completed reassembly on a user bus and should be handed to
    /// the application.
    Parcel {
        /// The endpoint (peer connection) it arrived on.
        endpoint: Handle<Endpoint>,
        /// The bus it arrived on.
        bus_id: u32,
        /// Delivery mode it arrived under.
        fragment_type: FragmentType,
        /// The reassembled content.
        parcel: Parcel,
    },
    /// A [`Sender`] finished fanning a parcel out to every `(bus, mode)`
    /// destination it was given. Never raised for system-bus (ping/pong)
    /// senders.
    SendResult {
        /// The sender this result is for, as returned by [`Context::send`].
        sender: Handle<Sender>,
        /// The endpoint the parcel was sent from.
        endpoint: Handle<Endpoint>,
        /// How many of the sender's `(bus, mode)` destinations completed
        /// their dispatcher successfully.
        bus_count_succeeded: usize,
    },
}

/// The pool owner and top-level driver of the whole reliability layer.
///
/// Generic over the five external collaborators this crate treats as
/// out-of-scope: the datagram socket (`T`), the checksum algorithm (`C`),
/// off-thread work submission (`W`), callback serialisation (`S`), and
/// platform timers (`D`). An embedding application is expected to own one
/// `Context`, create an [`Endpoint`] per peer connection, feed inbound
/// datagrams to [`Context::recv_datagram`], and call [`Context::poll`]
/// periodically to drive timers and off-thread completions.
pub struct Context<T, C, W, S, D>
where
    T: Transport,
    C: Checksum,
    W: Worker,
    S: Sequencer,
    D: TimerDriver,
{
    config: Config,
    stats: Stats,
    epoch: Instant,
    checksum: Arc<C>,
    worker: W,
    sequencer: Arc<S>,
    timer: D,

    senders: Pool<Sender>,
    dispatchers: Pool<Dispatcher>,
    receivers: Pool<Receiver>,
    endpoints: Pool<Endpoint>,

    transports: AHashMap<Handle<Endpoint>, T>,
    resend_timers: AHashMap<Handle<Dispatcher>, D::Handle>,
    checksum_tasks: AHashMap<Handle<Sender>, W::TaskHandle>,
    verify_tasks: AHashMap<Handle<Receiver>, W::TaskHandle>,
    heartbeat: Heartbeat<D::Handle>,
    heartbeat_due: crate::timer_flag::TimerFlag,

    deliveries: Vec<Delivery>,
}

impl<T, C, W, S, D> Context<T, C, W, S, D>
where
    T: Transport,
    C: Checksum,
    W: Worker,
    S: Sequencer + Send + Sync + 'static,
    D: TimerDriver,
{
    /// Creates an empty context with no endpoints.
    pub fn new(config: Config, checksum: C, worker: W, sequencer: S, timer: D) -> Self {
        Self {
            config,
            stats: Stats::default(),
            epoch: Instant::now(),
            checksum: Arc::new(checksum),
            worker,
            sequencer: Arc::new(sequencer),
            timer,
            senders: Pool::new(),
            dispatchers: Pool::new(),
            receivers: Pool::new(),
            endpoints: Pool::new(),
            transports: AHashMap::new(),
            resend_timers: AHashMap::new(),
            checksum_tasks: AHashMap::new(),
            verify_tasks: AHashMap::new(),
            heartbeat: Heartbeat::new(),
            heartbeat_due: crate::timer_flag::TimerFlag::new(),
            deliveries: Vec::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn stats(&self) -> &Stats {
        &self.stats
    }

    #[must_use]
    pub fn endpoint(&self, handle: Handle<Endpoint>) -> Option<&Endpoint> {
        self.endpoints.get(handle)
    }

    /// Parcels (and system messages) delivered since the last call to this
    /// method. Call after [`Context::recv_datagram`]/[`Context::poll`].
    pub fn drain_deliveries(&mut self) -> Vec<Delivery> {
        std::mem::take(&mut self.deliveries)
    }

    fn now_nanos(&self, now: Instant) -> i64 {
        i64::try_from(now.duration_since(self.epoch).as_nanos()).unwrap_or(i64::MAX)
    }

    // ---- endpoint lifecycle -------------------------------------------------

    /// Creates an endpoint with `nbuses` user buses, backed by `transport`,
    /// and subscribes it to the shared heartbeat.
    pub fn create_endpoint(&mut self, nbuses: u32, transport: T) -> Handle<Endpoint> {
        let endpoint = Endpoint::new(nbuses, self.config);
        let handle = self.endpoints.acquire(endpoint);
        self.transports.insert(handle, transport);

        if self.heartbeat.subscribe(handle) {
            let flag = self.heartbeat_due.clone();
            let sequencer = self.sequencer.clone();
            let on_fire = Box::new(move || {
                let flag = flag.clone();
                sequencer.submit(Box::new(move || flag.mark()));
            });
            let timer_handle = self.timer.start(self.config.heartbeat_rate, true, on_fire);
            self.heartbeat.set_timer(timer_handle);
        }
        if let Some(endpoint) = self.endpoints.get_mut(handle) {
            endpoint.set_heartbeat_registered(true);
        }
        handle
    }

    /// Destroys an endpoint: cancels every dispatcher and receiver on its
    /// buses, unsubscribes it from the heartbeat (stopping the shared timer
    /// if it was the last subscriber), and releases it from the pool.
    pub fn destroy_endpoint(&mut self, handle: Handle<Endpoint>) {
        let bus_ids: Vec<u32> = self
            .endpoints
            .get(handle)
            .map(|e| (0..=e.nbuses()).collect())
            .unwrap_or_default();
        for bus_id in bus_ids {
            self.stop_bus(handle, bus_id);
        }
        if self.heartbeat.unsubscribe(handle) {
            if let Some(mut timer) = self.heartbeat.take_timer() {
                timer.cancel();
            }
        }
        self.transports.remove(&handle);
        self.endpoints.release(handle);
    }

    /// Stops one bus: defers if the bus is mid-callback, otherwise cancels
    /// every queued/in-flight dispatcher and every tracked receiver, then
    /// resets the bus's queues/maps/counters.
    fn stop_bus(&mut self, endpoint: Handle<Endpoint>, bus_id: u32) {
        let Some(bus) = self.endpoints.get_mut(endpoint).and_then(|e| e.bus_mut(bus_id)) else {
            return;
        };
        if !bus.begin_stop() {
            return;
        }
        let dispatchers = bus.all_dispatchers();
        let receivers = bus.all_receivers();
        for d in dispatchers {
            self.cancel_dispatcher(d);
        }
        for r in receivers {
            self.cancel_receiver(r);
        }
        if let Some(bus) = self.endpoints.get_mut(endpoint).and_then(|e| e.bus_mut(bus_id)) {
            bus.reset();
        }
    }

    // ---- sending --------------------------------------------------------

    /// Submits `parcel` for delivery on each `(bus, mode)` pair in
    /// `transmissions`, returning the [`Sender`] handle driving the fan-out.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::InvalidBus`] if any transmission names a bus
    /// that doesn't exist on `endpoint`.
    pub fn send(
        &mut self,
        endpoint: Handle<Endpoint>,
        transmissions: Vec<Transmission>,
        parcel: Parcel,
    ) -> Result<Handle<Sender>, ResourceError> {
        self.send_inner(endpoint, transmissions, parcel, false)
    }

    fn send_inner(
        &mut self,
        endpoint_handle: Handle<Endpoint>,
        transmissions: Vec<Transmission>,
        parcel: Parcel,
        system: bool,
    ) -> Result<Handle<Sender>, ResourceError> {
        let Some(endpoint) = self.endpoints.get(endpoint_handle) else {
            return Err(ResourceError::StaleHandle);
        };
        for t in &transmissions {
            if endpoint.bus(t.bus_id).is_none() {
                return Err(ResourceError::InvalidBus {
                    index: t.bus_id,
                    nbuses: endpoint.nbuses(),
                });
            }
        }
        let sender = Sender::new(endpoint_handle, parcel, transmissions, system);
        let handle = self.senders.acquire(sender);
        let advance = self
            .senders
            .get_mut(handle)
            .map(|s| s.pipeline_mut().begin())
            .unwrap_or(Advance::Deferred);
        self.run_sender_pipeline(handle, advance);
        Ok(handle)
    }

    fn run_sender_pipeline(&mut self, handle: Handle<Sender>, advance: Advance) {
        drive(
            self,
            sender::LAST_STAGE,
            advance,
            |ctx| ctx.senders.get_mut(handle).map(Sender::pipeline_mut),
            |ctx, stage| ctx.run_sender_stage(handle, stage),
        );
    }

    fn run_sender_stage(&mut self, handle: Handle<Sender>, stage: u8) {
        match stage {
            sender::stage::UPDATE_CHECKSUM => self.sender_update_checksum(handle),
            sender::stage::DISPATCH => self.sender_dispatch(handle),
            sender::stage::COMPLETE => self.sender_complete(handle),
            _ => unreachable!("sender has only 3 stages"),
        }
    }

    fn sender_update_checksum(&mut self, handle: Handle<Sender>) {
        let Some(sender) = self.senders.get(handle) else { return };
        if !sender.needs_checksum() {
            self.advance_sender_next(handle);
            return;
        }
        let chunks_owned: Vec<Vec<u8>> = sender
            .parcel()
            .chunks()
            .iter()
            .map(|c| c.as_slice().to_vec())
            .collect();
        let pending = sender.checksum_pending();
        let checksum = self.checksum.clone();
        let work: Box<dyn FnOnce() -> Vec<u8> + Send> = Box::new(move || {
            let refs: Vec<&[u8]> = chunks_owned.iter().map(Vec::as_slice).collect();
            checksum.compute(&refs)
        });
        let sequencer = self.sequencer.clone();
        let on_complete: Box<dyn FnOnce(Vec<u8>) + Send> = Box::new(move |result| {
            let pending = pending.clone();
            sequencer.submit(Box::new(move || pending.complete(result)));
        });
        let task = self.worker.submit(work, on_complete);
        self.checksum_tasks.insert(handle, task);
        self.try_complete_checksum(handle);
    }

    fn try_complete_checksum(&mut self, handle: Handle<Sender>) {
        let Some(sender) = self.senders.get(handle) else { return };
        let Some(result) = sender.checksum_pending().take() else { return };
        self.checksum_tasks.remove(&handle);
        let Some(sender) = self.senders.get_mut(handle) else { return };
        if sender.is_canceled() {
            let advance = sender.pipeline_mut().request_finish(sender::LAST_STAGE);
            self.run_sender_pipeline(handle, advance);
            return;
        }
        sender.set_checksum(result);
        self.advance_sender_next(handle);
    }

    fn advance_sender_next(&mut self, handle: Handle<Sender>) {
        let Some(sender) = self.senders.get_mut(handle) else { return };
        let advance = sender.pipeline_mut().request_next();
        self.run_sender_pipeline(handle, advance);
    }

    fn sender_dispatch(&mut self, handle: Handle<Sender>) {
        let Some(sender) = self.senders.get(handle) else { return };
        let endpoint_handle = sender.endpoint();
        let transmissions = sender.transmissions().to_vec();
        let parcel = sender.parcel().clone();
        let checksum = sender.checksum().map(<[u8]>::to_vec);
        if transmissions.is_empty() {
            self.advance_sender_next(handle);
            return;
        }
        let fragment_content_capacity = self.config.fragment_content_capacity();
        let checksum_len = C::LEN;

        for t in &transmissions {
            let Some(sequence) = self
                .endpoints
                .get_mut(endpoint_handle)
                .and_then(|e| e.bus_mut(t.bus_id))
                .map(Bus::next_sequence)
            else {
                self.on_dispatcher_result(handle, false);
                continue;
            };
            let bus_ref = BusRef::new(endpoint_handle, t.bus_id);
            let dispatcher = Dispatcher::new(
                bus_ref,
                t.fragment_type,
                sequence,
                parcel.clone(),
                fragment_content_capacity,
                checksum_len,
                checksum.clone(),
                handle,
            );
            let d_handle = self.dispatchers.acquire(dispatcher);
            if let Some(sender) = self.senders.get_mut(handle) {
                sender.register_dispatcher(d_handle);
            }
            if let Some(bus) = self.endpoints.get_mut(endpoint_handle).and_then(|e| e.bus_mut(t.bus_id)) {
                bus.enqueue_dispatcher(d_handle);
            }
            self.process_bus_sending(endpoint_handle, t.bus_id);
        }
    }

    /// Called once per dispatcher as it finishes (success, failure, or
    /// cancel). When every transmission has reported, advances the sender
    /// to `complete`.
    fn on_dispatcher_result(&mut self, sender_handle: Handle<Sender>, succeeded: bool) {
        let Some(sender) = self.senders.get_mut(sender_handle) else { return };
        if sender.record_dispatcher_result(succeeded) {
            let advance = sender.pipeline_mut().request_next();
            self.run_sender_pipeline(sender_handle, advance);
        }
    }

    fn sender_complete(&mut self, handle: Handle<Sender>) {
        if let Some(task) = self.checksum_tasks.remove(&handle) {
            self.worker.cancel(&task);
        }
        let Some(sender) = self.senders.release(handle) else { return };
        if !sender.is_system() && sender.success_count() > 0 {
            self.stats.parcels_sent += 1;
        }
        if !sender.is_system() && !sender.is_canceled() {
            self.deliveries.push(Delivery::SendResult {
                sender: handle,
                endpoint: sender.endpoint(),
                bus_count_succeeded: sender.success_count(),
            });
        }
    }

    /// Cancels a sender: cancels its checksum task (if in flight) and every
    /// dispatcher it still owns, then drives it to `complete`.
    pub fn cancel_sender(&mut self, handle: Handle<Sender>) {
        let Some(sender) = self.senders.get_mut(handle) else { return };
        if !sender.cancel() {
            return;
        }
        let dispatchers = sender.dispatchers().to_vec();
        for d in dispatchers {
            self.cancel_dispatcher(d);
        }
        let Some(sender) = self.senders.get_mut(handle) else { return };
        let advance = sender.pipeline_mut().request_finish(sender::LAST_STAGE);
        self.run_sender_pipeline(handle, advance);
    }

    // ---- bus send-side HOL gating ---------------------------------------

    fn process_bus_sending(&mut self, endpoint: Handle<Endpoint>, bus_id: u32) {
        loop {
            let next = {
                let dispatchers = &self.dispatchers;
                let Some(bus) = self.endpoints.get_mut(endpoint).and_then(|e| e.bus_mut(bus_id)) else {
                    return;
                };
                bus.pop_next_to_submit(|d| dispatchers.get(d).is_some_and(Dispatcher::is_reliable))
            };
            let Some(d_handle) = next else { break };
            self.begin_dispatcher(d_handle);
        }
    }

    fn begin_dispatcher(&mut self, handle: Handle<Dispatcher>) {
        let Some(dispatcher) = self.dispatchers.get_mut(handle) else { return };
        let advance = dispatcher.pipeline_mut().begin();
        self.run_dispatcher_pipeline(handle, advance);
    }

    fn run_dispatcher_pipeline(&mut self, handle: Handle<Dispatcher>, advance: Advance) {
        drive(
            self,
            dispatcher::LAST_STAGE,
            advance,
            |ctx| ctx.dispatchers.get_mut(handle).map(Dispatcher::pipeline_mut),
            |ctx, stage| ctx.run_dispatcher_stage(handle, stage),
        );
    }

    fn run_dispatcher_stage(&mut self, handle: Handle<Dispatcher>, stage: u8) {
        match stage {
            dispatcher::stage::DISPATCH => self.dispatcher_dispatch(handle),
            dispatcher::stage::COMPLETE => self.dispatcher_complete(handle),
            _ => unreachable!("dispatcher has only 2 stages"),
        }
    }

    /// Sends every currently-unacknowledged fragment once. Used both for the
    /// dispatcher's initial send and for resend timer ticks.
    fn send_unacked_fragments(&mut self, handle: Handle<Dispatcher>) -> bool {
        let Some(dispatcher) = self.dispatchers.get(handle) else { return true };
        let bus_ref = dispatcher.bus();
        let last_index = dispatcher.last_index();
        let sequence = dispatcher.sequence();
        let fragment_type = dispatcher.fragment_type();
        let fragments: Vec<(u32, Vec<u8>, Option<Vec<u8>>)> = dispatcher
            .unacked_fragments()
            .map(|(i, content, embed)| {
                let checksum = embed.then(|| dispatcher.embedded_checksum().map(<[u8]>::to_vec)).flatten();
                (i, content.to_vec(), checksum)
            })
            .collect();

        for (fragment_index, content, checksum) in fragments {
            let header = FragmentHeader {
                fragment_type,
                bus_id: bus_ref.bus_id,
                fragment_index,
                last_index,
                sequence: sequence.0,
            };
            let mut header_buf = BytesMut::new();
            if header.encode(&mut header_buf).is_err() {
                return false;
            }
            let header_bytes = header_buf.freeze();
            let mut views = vec![IoSlice::new(&header_bytes), IoSlice::new(&content)];
            if let Some(checksum) = &checksum {
                views.push(IoSlice::new(checksum));
            }
            let Some(transport) = self.transports.get_mut(&bus_ref.endpoint) else { return false };
            if transport.send(&views).is_err() {
                return false;
            }
        }
        true
    }

    fn dispatcher_dispatch(&mut self, handle: Handle<Dispatcher>) {
        if !self.send_unacked_fragments(handle) {
            if let Some(dispatcher) = self.dispatchers.get_mut(handle) {
                dispatcher.mark_failed();
            }
            self.advance_dispatcher_finish(handle);
            return;
        }
        let Some(dispatcher) = self.dispatchers.get(handle) else { return };
        if !dispatcher.is_reliable() {
            self.advance_dispatcher_next(handle);
            return;
        }
        if self.resend_timers.contains_key(&handle) {
            return;
        }
        let endpoint = dispatcher.bus().endpoint;
        let rtt_mean = self.endpoints.get(endpoint).map_or(self.config.initial_rtt, |e| e.rtt().mean());
        let period = resend_period(rtt_mean);
        let flag = dispatcher.resend_flag();
        let sequencer = self.sequencer.clone();
        let on_fire = Box::new(move || {
            let flag = flag.clone();
            sequencer.submit(Box::new(move || flag.mark()));
        });
        let timer_handle = self.timer.start(period, true, on_fire);
        self.resend_timers.insert(handle, timer_handle);
    }

    fn advance_dispatcher_next(&mut self, handle: Handle<Dispatcher>) {
        let Some(dispatcher) = self.dispatchers.get_mut(handle) else { return };
        let advance = dispatcher.pipeline_mut().request_next();
        self.run_dispatcher_pipeline(handle, advance);
    }

    fn advance_dispatcher_finish(&mut self, handle: Handle<Dispatcher>) {
        let Some(dispatcher) = self.dispatchers.get_mut(handle) else { return };
        let advance = dispatcher.pipeline_mut().request_finish(dispatcher::LAST_STAGE);
        self.run_dispatcher_pipeline(handle, advance);
    }

    fn dispatcher_complete(&mut self, handle: Handle<Dispatcher>) {
        if let Some(mut timer) = self.resend_timers.remove(&handle) {
            timer.cancel();
        }
        let Some(dispatcher) = self.dispatchers.get(handle) else { return };
        let owner = dispatcher.owner();
        let bus_ref = dispatcher.bus();
        let canceled = dispatcher.is_canceled();
        let succeeded = !dispatcher.is_failed() && !canceled;

        if let Some(sender) = self.senders.get_mut(owner) {
            sender.remove_dispatcher(handle);
        }
        self.on_dispatcher_result(owner, succeeded);

        if !canceled {
            if let Some(bus) = self
                .endpoints
                .get_mut(bus_ref.endpoint)
                .and_then(|e| e.bus_mut(bus_ref.bus_id))
            {
                bus.on_dispatcher_completed(handle);
            }
            self.process_bus_sending(bus_ref.endpoint, bus_ref.bus_id);
        }
        self.dispatchers.release(handle);
    }

    /// Cancels a dispatcher: stops its resend timer (if armed) and drives it
    /// to `complete`.
    pub fn cancel_dispatcher(&mut self, handle: Handle<Dispatcher>) {
        let Some(dispatcher) = self.dispatchers.get_mut(handle) else { return };
        if !dispatcher.cancel() {
            return;
        }
        if let Some(mut timer) = self.resend_timers.remove(&handle) {
            timer.cancel();
        }
        self.advance_dispatcher_finish(handle);
    }

    /// Handles an ACK fragment matching `handle`'s sequence. Returns `true`
    /// once every fragment is acknowledged (the caller should advance the
    /// dispatcher to `complete`).
    fn ack_dispatcher(&mut self, handle: Handle<Dispatcher>, fragment_index: u32) {
        let Some(dispatcher) = self.dispatchers.get_mut(handle) else { return };
        if dispatcher.ack(fragment_index) {
            self.stats.acks_recv += 1;
            self.advance_dispatcher_next(handle);
        } else {
            self.stats.acks_recv += 1;
        }
    }

    // ---- receiving --------------------------------------------------------

    /// Feeds one raw, complete datagram (as delivered by the transport) to
    /// the endpoint's receive path.
    pub fn recv_datagram(&mut self, endpoint: Handle<Endpoint>, now: Instant, bytes: &[u8]) {
        let mut buf = Bytes::copy_from_slice(bytes);
        let header = match FragmentHeader::decode(&mut buf) {
            Ok(header) => header,
            Err(err) => {
                debug!(?err, "dropping datagram with undecodable fragment header");
                return;
            }
        };
        if header.last_index >= self.config.max_fragments {
            debug!(
                last_index = header.last_index,
                max_fragments = self.config.max_fragments,
                "dropping fragment exceeding configured max_fragments"
            );
            return;
        }

        if header.bus_id == 0 {
            self.recv_system_fragment(endpoint, now, header, buf);
            return;
        }

        let Some(ep) = self.endpoints.get(endpoint) else { return };
        if !ep.is_ready() || ep.bus(header.bus_id).is_none() {
            return;
        }
        self.recv_user_fragment(endpoint, now, header, buf);
    }

    /// Drains every endpoint's transport and feeds whatever arrived to the
    /// receive path. Convenience for an application that doesn't want to
    /// drive `poll_recv` itself.
    pub fn poll_transports(&mut self, now: Instant) {
        let endpoints: Vec<Handle<Endpoint>> = self.transports.keys().copied().collect();
        for endpoint in endpoints {
            let datagrams = self
                .transports
                .get_mut(&endpoint)
                .map(Transport::poll_recv)
                .unwrap_or_default();
            for datagram in datagrams {
                self.recv_datagram(endpoint, now, &datagram);
            }
        }
    }

    fn recv_user_fragment(&mut self, endpoint: Handle<Endpoint>, now: Instant, header: FragmentHeader, content: Bytes) {
        let bus_id = header.bus_id;
        let expired = self
            .endpoints
            .get_mut(endpoint)
            .and_then(|e| e.bus_mut(bus_id))
            .map(|bus| bus.pop_expired(now))
            .unwrap_or_default();
        for r in expired {
            self.cancel_receiver(r);
        }

        let sequence = Seq(header.sequence);

        if header.fragment_type == FragmentType::Ack {
            let dispatcher = self
                .endpoints
                .get(endpoint)
                .and_then(|e| e.bus(bus_id))
                .and_then(Bus::incomplete_reliable_dispatcher)
                .filter(|&d| self.dispatchers.get(d).is_some_and(|d| d.sequence() == sequence));
            if let Some(dispatcher) = dispatcher {
                self.ack_dispatcher(dispatcher, header.fragment_index);
            }
            return;
        }

        {
            let Some(bus) = self.endpoints.get(endpoint).and_then(|e| e.bus(bus_id)) else { return };
            if header.fragment_type == FragmentType::Reliable {
                if let Some(incomplete) = bus.incomplete_reliable_receiver() {
                    let matches = self.receivers.get(incomplete).is_some_and(|r| r.sequence() == sequence);
                    if !matches {
                        return;
                    }
                } else if sequence == bus.last_recv_reliable_sequence() {
                    self.send_ack(endpoint, header);
                    return;
                }
            } else if header.fragment_type == FragmentType::Sequenced && sequence < bus.last_recv_sequenced_sequence() {
                return;
            }
        }

        let existing = self.endpoints.get(endpoint).and_then(|e| e.bus(bus_id)).and_then(|b| b.receiver_for(sequence));
        let receiver_handle = if let Some(h) = existing {
            let matches = self
                .receivers
                .get(h)
                .is_some_and(|r| r.matches(header.fragment_type, sequence, header.last_index));
            if !matches {
                return;
            }
            h
        } else {
            let bus_ref = BusRef::new(endpoint, bus_id);
            let receiver = Receiver::new(bus_ref, header.fragment_type, sequence, header.last_index + 1);
            let h = self.receivers.acquire(receiver);
            let is_reliable = header.fragment_type == FragmentType::Reliable;
            if let Some(bus) = self.endpoints.get_mut(endpoint).and_then(|e| e.bus_mut(bus_id)) {
                bus.insert_receiver(sequence, h, is_reliable);
            }
            let rtt_mean = self.endpoints.get(endpoint).map_or(self.config.initial_rtt, |e| e.rtt().mean());
            if let Some(receiver) = self.receivers.get_mut(h) {
                receiver.begin_wait(now, expiry_timeout(rtt_mean));
                if let Some(expires_at) = receiver.expires_at() {
                    if let Some(bus) = self.endpoints.get_mut(endpoint).and_then(|e| e.bus_mut(bus_id)) {
                        bus.push_expiry(ExpiryEntry { expires_at, receiver: h });
                    }
                }
                let advance = receiver.pipeline_mut().begin();
                self.run_receiver_pipeline(h, advance);
            }
            h
        };

        if header.fragment_type == FragmentType::Reliable {
            self.send_ack(endpoint, header);
        }

        let Some(receiver) = self.receivers.get_mut(receiver_handle) else { return };
        if receiver.has_fragment(header.fragment_index) {
            return;
        }
        let chunk = fragment::content_chunk(std::sync::Arc::from(content.as_ref()));
        let complete = receiver.add_fragment(header.fragment_index, chunk);
        if complete {
            let advance = receiver.pipeline_mut().request_next();
            self.run_receiver_pipeline(receiver_handle, advance);
        }
    }

    fn send_ack(&mut self, endpoint: Handle<Endpoint>, header: FragmentHeader) {
        let ack = header.to_ack();
        let mut buf = BytesMut::new();
        if ack.encode(&mut buf).is_err() {
            return;
        }
        let bytes = buf.freeze();
        if let Some(transport) = self.transports.get_mut(&endpoint) {
            let _ = transport.send(&[IoSlice::new(&bytes)]);
        }
    }

    fn run_receiver_pipeline(&mut self, handle: Handle<Receiver>, advance: Advance) {
        drive(
            self,
            crate::receiver::LAST_STAGE,
            advance,
            |ctx| ctx.receivers.get_mut(handle).map(Receiver::pipeline_mut),
            |ctx, stage| ctx.run_receiver_stage(handle, stage),
        );
    }

    fn run_receiver_stage(&mut self, handle: Handle<Receiver>, stage: u8) {
        match stage {
            crate::receiver::stage::WAIT_FRAGMENTS => {}
            crate::receiver::stage::VERIFY_CHECKSUM => self.receiver_verify_checksum(handle),
            crate::receiver::stage::COMPLETE => self.receiver_complete(handle),
            _ => unreachable!("receiver has only 3 stages"),
        }
    }

    fn receiver_verify_checksum(&mut self, handle: Handle<Receiver>) {
        let Some(receiver) = self.receivers.get_mut(handle) else { return };
        if receiver.prepare_checksum_verify(C::LEN).is_none() {
            self.advance_receiver_next(handle);
            return;
        }
        let Some(receiver) = self.receivers.get(handle) else { return };
        let chunks_owned: Vec<Vec<u8>> = receiver.cloned_fragment_contents();
        let pending = receiver.verify_pending();
        let checksum = self.checksum.clone();
        let work: Box<dyn FnOnce() -> Vec<u8> + Send> = Box::new(move || {
            let refs: Vec<&[u8]> = chunks_owned.iter().map(Vec::as_slice).collect();
            checksum.compute(&refs)
        });
        let sequencer = self.sequencer.clone();
        let on_complete: Box<dyn FnOnce(Vec<u8>) + Send> = Box::new(move |result| {
            let pending = pending.clone();
            sequencer.submit(Box::new(move || pending.complete(result)));
        });
        let task = self.worker.submit(work, on_complete);
        self.verify_tasks.insert(handle, task);
        self.try_complete_verify(handle);
    }

    fn try_complete_verify(&mut self, handle: Handle<Receiver>) {
        let Some(receiver) = self.receivers.get(handle) else { return };
        let Some(result) = receiver.verify_pending().take() else { return };
        self.verify_tasks.remove(&handle);
        let Some(receiver) = self.receivers.get_mut(handle) else { return };
        if receiver.is_canceled() {
            let advance = receiver.pipeline_mut().request_finish(crate::receiver::LAST_STAGE);
            self.run_receiver_pipeline(handle, advance);
            return;
        }
        receiver.set_computed_checksum(result);
        if !receiver.checksum_matches() {
            receiver.mark_failed();
            self.stats.checksum_failures += 1;
            warn!(sequence = receiver.sequence().0, "checksum verification failed, dropping parcel");
            let advance = receiver.pipeline_mut().request_finish(crate::receiver::LAST_STAGE);
            self.run_receiver_pipeline(handle, advance);
            return;
        }
        self.advance_receiver_next(handle);
    }

    fn advance_receiver_next(&mut self, handle: Handle<Receiver>) {
        let Some(receiver) = self.receivers.get_mut(handle) else { return };
        let advance = receiver.pipeline_mut().request_next();
        self.run_receiver_pipeline(handle, advance);
    }

    fn receiver_complete(&mut self, handle: Handle<Receiver>) {
        if let Some(task) = self.verify_tasks.remove(&handle) {
            self.worker.cancel(&task);
        }
        let Some(receiver) = self.receivers.get(handle) else { return };
        if receiver.is_canceled() {
            self.receivers.release(handle);
            return;
        }
        let bus_ref = receiver.bus();
        let sequence = receiver.sequence();
        let fragment_type = receiver.fragment_type();
        let failed = receiver.is_failed();

        if let Some(bus) = self
            .endpoints
            .get_mut(bus_ref.endpoint)
            .and_then(|e| e.bus_mut(bus_ref.bus_id))
        {
            bus.remove_receiver(sequence, handle);
        }
        let Some(receiver) = self.receivers.release(handle) else { return };
        if failed {
            return;
        }

        if bus_ref.bus_id == 0 {
            let parcel = receiver.into_parcel();
            let mut reader = parcel.reader();
            let mut all = vec![0u8; reader.remain_bytes()];
            reader.read(&mut all);
            let mut bytes = Bytes::from(all);
            match SystemMessage::decode(&mut bytes) {
                Ok(message) => self.dispatch_system_message(bus_ref.endpoint, message),
                Err(err) => debug!(?err, "failed to decode system message"),
            }
            return;
        }

        if fragment_type == FragmentType::Sequenced {
            let stale = self
                .endpoints
                .get(bus_ref.endpoint)
                .and_then(|e| e.bus(bus_ref.bus_id))
                .is_some_and(|bus| sequence < bus.last_recv_sequenced_sequence());
            if stale {
                return;
            }
            if let Some(bus) = self
                .endpoints
                .get_mut(bus_ref.endpoint)
                .and_then(|e| e.bus_mut(bus_ref.bus_id))
            {
                bus.advance_sequenced(sequence);
            }
        }

        self.stats.parcels_recv += 1;
        self.deliveries.push(Delivery::Parcel {
            endpoint: bus_ref.endpoint,
            bus_id: bus_ref.bus_id,
            fragment_type,
            parcel: receiver.into_parcel(),
        });
    }

    /// Cancels a receiver: idempotent, removes it from its bus's map (the
    /// expiry heap is left with a possibly-stale entry, harmless since the
    /// map lookup is the source of truth), cancels its verify task if in
    /// flight, and drives it to `complete`.
    pub fn cancel_receiver(&mut self, handle: Handle<Receiver>) {
        let Some(receiver) = self.receivers.get_mut(handle) else { return };
        if !receiver.cancel() {
            return;
        }
        let bus_ref = receiver.bus();
        let sequence = receiver.sequence();
        if let Some(bus) = self
            .endpoints
            .get_mut(bus_ref.endpoint)
            .and_then(|e| e.bus_mut(bus_ref.bus_id))
        {
            bus.remove_receiver(sequence, handle);
        }
        if let Some(task) = self.verify_tasks.remove(&handle) {
            self.worker.cancel(&task);
        }
        let Some(receiver) = self.receivers.get_mut(handle) else { return };
        let advance = receiver.pipeline_mut().request_finish(crate::receiver::LAST_STAGE);
        self.run_receiver_pipeline(handle, advance);
    }

    // ---- system bus: ping/pong RTT + clock sync --------------------------

    fn dispatch_system_message(&mut self, endpoint: Handle<Endpoint>, message: SystemMessage) {
        let now = Instant::now();
        if let Some(ep) = self.endpoints.get_mut(endpoint) {
            ep.mark_ready();
        }
        match message {
            SystemMessage::Ping { sequence, time_sync } => {
                let time = time_sync.then(|| self.now_nanos(now) as u64);
                let reply = SystemMessage::Pong { sequence, time_sync, time };
                let mut buf = BytesMut::new();
                reply.encode(&mut buf);
                if let Err(err) = self.send_system_payload(endpoint, &buf) {
                    warn!(?err, "failed to send pong");
                }
            }
            SystemMessage::Pong { sequence, time_sync, time } => {
                let local_send_nanos = self
                    .endpoints
                    .get_mut(endpoint)
                    .and_then(|e| e.complete_ping(sequence, now));
                if let (Some(local_send_nanos), true, Some(peer_time)) = (local_send_nanos, time_sync, time) {
                    if let Some(ep) = self.endpoints.get(endpoint) {
                        if ep.time_sync_enabled() {
                            let local_recv_nanos = self.now_nanos(now);
                            ep.clock().update(local_send_nanos, peer_time as i64, local_recv_nanos);
                        }
                    }
                }
            }
        }
    }

    fn send_system_payload(&mut self, endpoint: Handle<Endpoint>, payload: &[u8]) -> Result<(), ResourceError> {
        let mut writer = ParcelWriter::new(self.config.fragment_content_capacity(), self.config.max_fragments);
        writer.write(payload)?;
        let parcel = writer.finish()?;
        self.send_inner(
            endpoint,
            vec![Transmission { bus_id: 0, fragment_type: FragmentType::Unreliable }],
            parcel,
            true,
        )?;
        Ok(())
    }

    fn send_ping(&mut self, endpoint: Handle<Endpoint>, now: Instant) {
        let Some(ep) = self.endpoints.get_mut(endpoint) else { return };
        let local_nanos = self.now_nanos(now);
        let time_sync = ep.time_sync_enabled();
        let sequence = ep.begin_ping(now, local_nanos);
        let msg = SystemMessage::Ping { sequence, time_sync };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let _ = self.send_system_payload(endpoint, &buf);
    }

    fn recv_system_fragment(&mut self, endpoint: Handle<Endpoint>, now: Instant, header: FragmentHeader, content: Bytes) {
        self.recv_user_fragment(endpoint, now, header, content);
    }

    // ---- polling: heartbeat, resend, expiry, off-thread completions -----

    /// Drives every time-based and off-thread-completion-based behaviour:
    /// the shared heartbeat tick, reliable dispatcher resends, non-reliable
    /// receiver expiry, and any checksum compute/verify tasks that have
    /// finished since the last call. Call periodically from the embedding
    /// application's own event loop.
    pub fn poll(&mut self, now: Instant) {
        self.poll_heartbeat(now);
        self.poll_resends();
        self.poll_expiry(now);
        self.poll_checksum_tasks();
        self.poll_verify_tasks();
    }

    fn poll_heartbeat(&mut self, now: Instant) {
        if !self.heartbeat_due.take() {
            return;
        }
        let endpoints = self.heartbeat.endpoints().to_vec();
        for endpoint in endpoints {
            self.send_ping(endpoint, now);
        }
    }

    fn poll_resends(&mut self) {
        let due: Vec<Handle<Dispatcher>> = self
            .dispatchers
            .iter()
            .filter(|(h, _)| self.resend_timers.contains_key(h))
            .map(|(h, _)| h)
            .collect();
        for handle in due {
            let fired = self
                .dispatchers
                .get(handle)
                .is_some_and(Dispatcher::take_resend_due);
            if !fired {
                continue;
            }
            if self.send_unacked_fragments(handle) {
                self.stats.fragments_resent += 1;
                trace!(index = handle.index(), "resent unacked fragments for reliable dispatcher");
            } else {
                if let Some(dispatcher) = self.dispatchers.get_mut(handle) {
                    dispatcher.mark_failed();
                }
                warn!(index = handle.index(), "dispatcher resend failed, abandoning dispatch");
                self.advance_dispatcher_finish(handle);
            }
        }
    }

    fn poll_expiry(&mut self, now: Instant) {
        let endpoints: Vec<Handle<Endpoint>> = self.endpoints.handles();
        for endpoint in endpoints {
            let Some(ep) = self.endpoints.get(endpoint) else { continue };
            let bus_ids: Vec<u32> = (0..=ep.nbuses()).collect();
            for bus_id in bus_ids {
                let expired = self
                    .endpoints
                    .get_mut(endpoint)
                    .and_then(|e| e.bus_mut(bus_id))
                    .map(|bus| bus.pop_expired(now))
                    .unwrap_or_default();
                for r in expired {
                    trace!(index = r.index(), bus_id, "expiring incomplete non-reliable receiver");
                    self.cancel_receiver(r);
                }
            }
        }
    }

    fn poll_checksum_tasks(&mut self) {
        let senders: Vec<Handle<Sender>> = self.checksum_tasks.keys().copied().collect();
        for handle in senders {
            self.try_complete_checksum(handle);
        }
    }

    fn poll_verify_tasks(&mut self) {
        let receivers: Vec<Handle<Receiver>> = self.verify_tasks.keys().copied().collect();
        for handle in receivers {
            self.try_complete_verify(handle);
        }
    }
}
