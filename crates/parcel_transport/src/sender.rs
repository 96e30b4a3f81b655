//! See [`Sender`].

use crate::{parcel::Parcel, pending_result::PendingResult, pipeline::Pipeline, pool::Handle, receiver::BusRef};

/// Pipeline stage indices for a [`Sender`]:
/// `update_checksum -> dispatch -> complete`.
pub mod stage {
    /// Computing (off-thread) the checksum over the whole parcel, if it has
    /// 2 or more chunks.
    pub const UPDATE_CHECKSUM: u8 = 0;
    /// Spawning one [`crate::dispatcher::Dispatcher`] per transmission
    /// record.
    pub const DISPATCH: u8 = 1;
    /// Invoking the result callback and releasing to the pool.
    pub const COMPLETE: u8 = 2;
}

/// Last pipeline stage for a sender.
pub const LAST_STAGE: u8 = stage::COMPLETE;

/// One `(bus, mode)` destination a [`Sender`] was asked to transmit this
/// parcel on.
#[derive(Debug, Clone, Copy)]
pub struct Transmission {
    /// Target bus, addressed on the owning endpoint.
    pub bus_id: u32,
    /// Delivery mode for this destination.
    pub fragment_type: crate::packet::header::FragmentType,
}

/// Per-outgoing-parcel fan-out state: one parcel dispatched to any number of
/// `(bus, mode)` destinations.
#[derive(Debug)]
pub struct Sender {
    endpoint: Handle<crate::endpoint::Endpoint>,
    parcel: Parcel,
    transmissions: Vec<Transmission>,
    dispatchers: Vec<Handle<crate::dispatcher::Dispatcher>>,
    checksum: Option<Vec<u8>>,
    completed_counter: usize,
    success_counter: usize,
    pipeline: Pipeline,
    canceled: bool,
    failed: bool,
    /// System-bus senders (ping/pong) never invoke the user result callback.
    system: bool,
    checksum_pending: PendingResult,
}

impl Sender {
    /// Creates a sender for `parcel`, fanning out to `transmissions` on
    /// `endpoint`.
    #[must_use]
    pub fn new(
        endpoint: Handle<crate::endpoint::Endpoint>,
        parcel: Parcel,
        transmissions: Vec<Transmission>,
        system: bool,
    ) -> Self {
        Self {
            endpoint,
            parcel,
            transmissions,
            dispatchers: Vec::new(),
            checksum: None,
            completed_counter: 0,
            success_counter: 0,
            pipeline: Pipeline::new(),
            canceled: false,
            failed: false,
            system,
            checksum_pending: PendingResult::new(),
        }
    }

    /// The slot a checksum-compute worker task's completion callback writes
    /// into.
    #[must_use]
    pub fn checksum_pending(&self) -> PendingResult {
        self.checksum_pending.clone()
    }

    #[must_use]
    pub const fn endpoint(&self) -> Handle<crate::endpoint::Endpoint> {
        self.endpoint
    }

    #[must_use]
    pub const fn parcel(&self) -> &Parcel {
        &self.parcel
    }

    #[must_use]
    pub fn transmissions(&self) -> &[Transmission] {
        &self.transmissions
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        self.system
    }

    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        self.canceled
    }

    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.failed
    }

    pub(crate) const fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    pub(crate) const fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// `true` if the parcel needs an off-thread checksum pass (2+ chunks).
    #[must_use]
    pub fn needs_checksum(&self) -> bool {
        self.parcel.chunks().len() >= 2
    }

    pub fn set_checksum(&mut self, checksum: Vec<u8>) {
        self.checksum = Some(checksum);
    }

    #[must_use]
    pub fn checksum(&self) -> Option<&[u8]> {
        self.checksum.as_deref()
    }

    pub fn register_dispatcher(&mut self, dispatcher: Handle<crate::dispatcher::Dispatcher>) {
        self.dispatchers.push(dispatcher);
    }

    /// Drops a dispatcher from this sender's owned list (e.g. once it
    /// completes, or during cancellation).
    pub fn remove_dispatcher(&mut self, dispatcher: Handle<crate::dispatcher::Dispatcher>) {
        self.dispatchers.retain(|&d| d != dispatcher);
    }

    #[must_use]
    pub fn dispatchers(&self) -> &[Handle<crate::dispatcher::Dispatcher>] {
        &self.dispatchers
    }

    /// Records one dispatcher's outcome. Returns `true` once every
    /// transmission has reported (the caller should advance to `complete`).
    pub fn record_dispatcher_result(&mut self, succeeded: bool) -> bool {
        self.completed_counter += 1;
        if succeeded {
            self.success_counter += 1;
        }
        self.completed_counter == self.transmissions.len()
    }

    /// Number of destinations that succeeded, for the user result callback.
    #[must_use]
    pub const fn success_count(&self) -> usize {
        self.success_counter
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Marks canceled. Idempotent.
    pub fn cancel(&mut self) -> bool {
        if self.canceled {
            return false;
        }
        self.canceled = true;
        true
    }
}

impl BusRef {
    /// Convenience constructor, since `Sender`/`Dispatcher` both address a
    /// bus as `(endpoint, bus_id)`.
    #[must_use]
    pub const fn new(endpoint: Handle<crate::endpoint::Endpoint>, bus_id: u32) -> Self {
        Self { endpoint, bus_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::header::FragmentType;
    use crate::parcel::ParcelWriter;

    fn endpoint_handle() -> Handle<crate::endpoint::Endpoint> {
        let mut pool = crate::pool::Pool::new();
        pool.acquire(crate::endpoint::Endpoint::new(0, crate::config::Config::new(64)))
    }

    #[test]
    fn record_dispatcher_result_completes_after_all_transmissions_report() {
        let parcel = ParcelWriter::new(64, 64).finish().unwrap();
        let mut sender = Sender::new(
            endpoint_handle(),
            parcel,
            vec![
                Transmission { bus_id: 1, fragment_type: FragmentType::Reliable },
                Transmission { bus_id: 2, fragment_type: FragmentType::Unreliable },
            ],
            false,
        );
        assert!(!sender.record_dispatcher_result(true));
        assert!(sender.record_dispatcher_result(false));
        assert_eq!(sender.success_count(), 1);
    }

    #[test]
    fn single_chunk_parcel_skips_checksum() {
        let mut writer = ParcelWriter::new(64, 64);
        writer.write(b"short").unwrap();
        let parcel = writer.finish().unwrap();
        let sender = Sender::new(endpoint_handle(), parcel, vec![], false);
        assert!(!sender.needs_checksum());
    }
}
