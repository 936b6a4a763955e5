//! Queues and the per-connection queue arena.
//!
//! Every stage in a pipeline gets one queue per direction. Queues buffer packets,
//! track the byte count against `max`/`low` watermarks and form the chain the
//! packets travel along. They live in a [`Queues`] arena owned by the connection
//! and refer to each other by [`QueueId`], which also makes the service schedule
//! a plain deque of ids.
//!
//! # Flow control
//!
//! A producer asks [`Queues::will_next_accept`] before forwarding a packet. If the
//! downstream queue has no room the packet is first split to fit; if it still does
//! not fit, the producer's queue is disabled, the downstream queue is marked full
//! and scheduled, and the producer puts the packet back and returns. Once the
//! downstream queue drains below its low water mark [`Queues::get_packet`]
//! re-enables and reschedules the producer.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

use tracing::trace;

use crate::limits::Limits;
use crate::packet::{Packet, PacketFlags};
use crate::stage::StageDef;
use crate::utils::flags;

/// Index of a queue in its connection's [`Queues`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(usize);

/// Which way data flows through a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Receive,
    Transmit,
}

flags! {
    pub struct QueueFlags: u16 {
        /// Service is suspended until the queue is enabled again.
        const DISABLED = 0x1;
        /// The queue went over `max`; its producer is waiting for it to drain.
        const FULL = 0x2;
        /// The service routine ran at least once.
        const SERVICED = 0x4;
        const EOF = 0x8;
        const OPEN = 0x10;
        const STARTED = 0x20;
        /// The queue is on the service schedule.
        const SCHEDULED = 0x40;
        /// The service routine is running.
        const SERVICING = 0x80;
        /// The queue was scheduled while servicing and runs again afterwards.
        const RESERVICE = 0x100;
    }
}

pub struct Queue {
    stage: Arc<StageDef>,
    direction: Direction,
    packets: VecDeque<Packet>,
    count: usize,
    pub max: usize,
    pub low: usize,
    pub packet_size: usize,
    pub flags: QueueFlags,
    next: Option<QueueId>,
    prev: Option<QueueId>,
    pair: Option<QueueId>,
    data: Option<Box<dyn Any + Send>>,
}

impl Queue {
    pub fn stage(&self) -> &Arc<StageDef> {
        &self.stage
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Content bytes queued.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn next(&self) -> Option<QueueId> {
        self.next
    }

    pub fn prev(&self) -> Option<QueueId> {
        self.prev
    }

    /// The queue of the same stage in the opposite direction.
    pub fn pair(&self) -> Option<QueueId> {
        self.pair
    }

    pub fn first(&self) -> Option<&Packet> {
        self.packets.front()
    }

    pub fn last(&self) -> Option<&Packet> {
        self.packets.back()
    }

    pub fn packets(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }

    /// Queued packets for in place framing changes. Content lengths must not change.
    pub(crate) fn packets_mut(&mut self) -> impl Iterator<Item = &mut Packet> {
        self.packets.iter_mut()
    }

    /// Bytes that can still be queued before reaching `max`.
    pub fn room(&self) -> usize {
        self.max.saturating_sub(self.count)
    }

    pub fn set_limits(&mut self, max: usize, packet_size: usize) {
        self.max = max;
        self.low = Limits::low_water(max);
        self.packet_size = packet_size;
    }

    /// Per request stage state.
    pub fn data<T: Any>(&self) -> Option<&T> {
        self.data.as_ref().and_then(|data| data.downcast_ref())
    }

    pub fn data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.data.as_mut().and_then(|data| data.downcast_mut())
    }

    pub fn set_data<T: Any + Send>(&mut self, data: T) {
        self.data = Some(Box::new(data));
    }

    pub fn take_data<T: Any>(&mut self) -> Option<Box<T>> {
        let data = self.data.take()?;
        match data.downcast::<T>() {
            Ok(data) => Some(data),
            Err(data) => {
                self.data = Some(data);
                None
            }
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("stage", &self.stage.name())
            .field("direction", &self.direction)
            .field("count", &self.count)
            .field("packets", &self.packets.len())
            .field("max", &self.max)
            .field("packet_size", &self.packet_size)
            .field("flags", &self.flags)
            .finish()
    }
}

/// The queues of one connection plus its service schedule.
#[derive(Debug, Default)]
pub struct Queues {
    queues: Vec<Queue>,
    schedule: VecDeque<QueueId>,
}

impl Index<QueueId> for Queues {
    type Output = Queue;

    fn index(&self, id: QueueId) -> &Queue {
        &self.queues[id.0]
    }
}

impl IndexMut<QueueId> for Queues {
    fn index_mut(&mut self, id: QueueId) -> &mut Queue {
        &mut self.queues[id.0]
    }
}

impl Queues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an unlinked queue for `stage` with `max == packet_size == size`.
    pub fn add(&mut self, stage: Arc<StageDef>, direction: Direction, size: usize) -> QueueId {
        let id = QueueId(self.queues.len());
        self.queues.push(Queue {
            stage,
            direction,
            packets: VecDeque::new(),
            count: 0,
            max: size,
            low: Limits::low_water(size),
            packet_size: size,
            flags: QueueFlags::empty(),
            next: None,
            prev: None,
            pair: None,
            data: None,
        });
        id
    }

    /// Makes `next` the downstream neighbour of `prev`.
    pub fn link(&mut self, prev: QueueId, next: QueueId) {
        self[prev].next = Some(next);
        self[next].prev = Some(prev);
    }

    pub fn pair(&mut self, a: QueueId, b: QueueId) {
        self[a].pair = Some(b);
        self[b].pair = Some(a);
    }

    pub fn ids(&self) -> impl Iterator<Item = QueueId> + use<> {
        (0..self.queues.len()).map(QueueId)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Drops every queue and the schedule.
    pub fn clear(&mut self) {
        self.queues.clear();
        self.schedule.clear();
    }

    /// Removes the head packet.
    ///
    /// When a full queue drains below its low water mark the upstream queue that
    /// was disabled for flow control is enabled and scheduled again.
    pub fn get_packet(&mut self, q: QueueId) -> Option<Packet> {
        let queue = &mut self[q];
        let packet = queue.packets.pop_front()?;
        queue.count -= packet.len();

        if queue.flags.contains(QueueFlags::FULL) && queue.count < queue.low {
            queue.flags.remove(QueueFlags::FULL);
            if let Some(prev) = queue.prev {
                trace!(stage = self[prev].stage.name(), "downstream drained, enabling queue");
                self.enable(prev);
            }
        }
        Some(packet)
    }

    /// Appends a packet, scheduling the queue if asked to and not disabled.
    pub fn put_for_service(&mut self, q: QueueId, packet: Packet, schedule: bool) {
        let queue = &mut self[q];
        queue.count += packet.len();
        queue.packets.push_back(packet);
        if schedule && !queue.flags.contains(QueueFlags::DISABLED) {
            self.schedule(q);
        }
    }

    /// Puts a packet back at the head of the queue.
    pub fn put_back(&mut self, q: QueueId, packet: Packet) {
        let queue = &mut self[q];
        queue.count += packet.len();
        queue.packets.push_front(packet);
    }

    /// Appends a packet's data to the first packet of the queue.
    ///
    /// Used to aggregate a body on the last receive queue. Empty packets are
    /// dropped; packets that cannot be joined are queued on their own.
    pub fn join_for_service(&mut self, q: QueueId, packet: Packet, schedule: bool) {
        if packet.is_empty() {
            return;
        }
        let queue = &mut self[q];
        let joinable = queue.packets.front().is_some_and(|first| first.is_data() && !first.is_virtual());
        if !joinable {
            self.put_for_service(q, packet, schedule);
            return;
        }

        if let Some(first) = queue.packets.front_mut() {
            let before = first.len();
            match first.join(packet) {
                Ok(()) => queue.count += first.len() - before,
                Err(packet) => {
                    queue.count += packet.len();
                    queue.packets.push_back(packet);
                }
            }
        }
        if schedule && !queue.flags.contains(QueueFlags::DISABLED) {
            self.schedule(q);
        }
    }

    /// Splits `packet` so it fits the next queue and puts the tail back on `q`.
    ///
    /// `size` caps the result further when not zero.
    pub fn resize_packet(&mut self, q: QueueId, packet: &mut Packet, size: usize) {
        let Some(next) = self[q].next else {
            return;
        };
        let len = packet.len();
        let size = (if size == 0 { usize::MAX } else { size }).min(len).min(self[next].max).min(self[next].packet_size);

        if size == 0 || size == len {
            return;
        }
        if let Some(tail) = packet.split(size) {
            trace!(stage = self[q].stage.name(), size, tail = tail.len(), "split packet");
            self.put_back(q, tail);
        }
    }

    /// Returns true if the next queue has room for `packet`, splitting it first if needed.
    ///
    /// On false, `q` is disabled and the next queue is marked full and scheduled.
    /// The caller keeps `packet` and must put it back.
    pub fn will_next_accept(&mut self, q: QueueId, packet: &mut Packet) -> bool {
        let Some(next) = self[q].next else {
            return true;
        };
        if self.fits(next, packet.len()) {
            return true;
        }
        self.resize_packet(q, packet, 0);
        if self.fits(next, packet.len()) {
            return true;
        }

        trace!(stage = self[q].stage.name(), next = self[next].stage.name(), "downstream full, disabling queue");
        self.disable(q);
        self[next].flags.insert(QueueFlags::FULL);
        self.schedule(next);
        false
    }

    fn fits(&self, next: QueueId, size: usize) -> bool {
        let next = &self[next];
        size <= next.packet_size && size + next.count <= next.max
    }

    /// Drops queued body data. Header and end packets are kept.
    ///
    /// With `remove_packets` the data packets are removed, otherwise only their
    /// content is cleared so their framing still goes out. Returns the number of
    /// content bytes discarded.
    pub fn discard(&mut self, q: QueueId, remove_packets: bool) -> usize {
        let queue = &mut self[q];
        let mut discarded = 0;
        if remove_packets {
            queue.packets.retain(|packet| {
                if packet.flags.intersects(PacketFlags::DATA | PacketFlags::RANGE) {
                    discarded += packet.len();
                    false
                } else {
                    true
                }
            });
        } else {
            for packet in queue.packets.iter_mut().filter(|packet| packet.is_data()) {
                discarded += packet.len();
                packet.clear_content();
            }
        }
        queue.count -= discarded;
        discarded
    }

    /// Drops `n` wire bytes from the head packet after a partial write.
    pub fn consume_head(&mut self, q: QueueId, n: usize) {
        let queue = &mut self[q];
        if let Some(packet) = queue.packets.front_mut() {
            queue.count -= packet.consume(n);
        }
    }

    pub fn enable(&mut self, q: QueueId) {
        self[q].flags.remove(QueueFlags::DISABLED);
        self.schedule(q);
    }

    pub fn disable(&mut self, q: QueueId) {
        self[q].flags.insert(QueueFlags::DISABLED);
    }

    /// Adds the queue to the service schedule. Scheduling twice has no effect.
    pub fn schedule(&mut self, q: QueueId) {
        let queue = &mut self[q];
        if queue.flags.contains(QueueFlags::SERVICING) {
            queue.flags.insert(QueueFlags::RESERVICE);
        } else if !queue.flags.contains(QueueFlags::SCHEDULED) {
            queue.flags.insert(QueueFlags::SCHEDULED);
            self.schedule.push_back(q);
        }
    }

    /// Takes the next queue off the service schedule.
    pub fn next_scheduled(&mut self) -> Option<QueueId> {
        let q = self.schedule.pop_front()?;
        self[q].flags.remove(QueueFlags::SCHEDULED);
        Some(q)
    }

    pub fn has_scheduled(&self) -> bool {
        !self.schedule.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{Stage, StageFlags};
    use proptest::prelude::*;

    struct Plain;

    impl Stage for Plain {}

    fn stage(name: &str) -> Arc<StageDef> {
        Arc::new(StageDef::new(name, StageFlags::FILTER, Arc::new(Plain)))
    }

    fn chain(sizes: &[usize]) -> (Queues, Vec<QueueId>) {
        let mut queues = Queues::new();
        let ids: Vec<_> = sizes.iter().enumerate().map(|(i, size)| queues.add(stage(&format!("q{i}")), Direction::Transmit, *size)).collect();
        for pair in ids.windows(2) {
            queues.link(pair[0], pair[1]);
        }
        (queues, ids)
    }

    fn sum_of_lengths(queues: &Queues, q: QueueId) -> usize {
        queues[q].packets().map(Packet::len).sum()
    }

    #[test]
    fn get_and_put_back_keep_count() {
        let (mut queues, ids) = chain(&[1024]);
        let q = ids[0];
        queues.put_for_service(q, Packet::data(b"hello"), true);
        queues.put_for_service(q, Packet::end(), true);
        assert_eq!(queues[q].count(), 5);
        assert_eq!(queues.next_scheduled(), Some(q));
        assert_eq!(queues.next_scheduled(), None);

        let packet = queues.get_packet(q).unwrap();
        assert_eq!(queues[q].count(), 0);
        queues.put_back(q, packet);
        assert_eq!(queues[q].count(), 5);
        assert_eq!(queues[q].first().unwrap().len(), 5);
    }

    #[test]
    fn disabled_queue_is_not_scheduled() {
        let (mut queues, ids) = chain(&[1024]);
        queues.disable(ids[0]);
        queues.put_for_service(ids[0], Packet::data(b"x"), true);
        assert!(!queues.has_scheduled());

        queues.enable(ids[0]);
        assert_eq!(queues.next_scheduled(), Some(ids[0]));
    }

    #[test]
    fn join_aggregates_into_first_packet() {
        let (mut queues, ids) = chain(&[1024]);
        let q = ids[0];
        queues.join_for_service(q, Packet::data(b"Wiki"), false);
        queues.join_for_service(q, Packet::data(b"pedia"), false);
        queues.join_for_service(q, Packet::data(b""), false);

        assert_eq!(queues[q].len(), 1);
        assert_eq!(queues[q].count(), 9);
        assert_eq!(&queues[q].first().unwrap().content().unwrap()[..], b"Wikipedia");
    }

    #[test]
    fn will_next_accept_splits_to_packet_size() {
        let (mut queues, ids) = chain(&[1024, 1024]);
        queues[ids[1]].set_limits(1024, 100);

        let mut packet = Packet::data(&[7u8; 250]);
        assert!(queues.will_next_accept(ids[0], &mut packet));
        assert_eq!(packet.len(), 100);
        assert_eq!(queues[ids[0]].count(), 150);
        assert_eq!(sum_of_lengths(&queues, ids[0]), 150);
    }

    #[test]
    fn will_next_accept_disables_producer_when_full() {
        let (mut queues, ids) = chain(&[1024, 100]);
        queues.put_for_service(ids[1], Packet::data(&[0u8; 100]), false);

        let mut packet = Packet::data(&[1u8; 10]);
        assert!(!queues.will_next_accept(ids[0], &mut packet));
        assert!(queues[ids[0]].flags.contains(QueueFlags::DISABLED));
        assert!(queues[ids[1]].flags.contains(QueueFlags::FULL));
        assert_eq!(queues.next_scheduled(), Some(ids[1]));

        queues.put_back(ids[0], packet);
        queues.get_packet(ids[1]).unwrap();
        assert!(!queues[ids[0]].flags.contains(QueueFlags::DISABLED));
        assert_eq!(queues.next_scheduled(), Some(ids[0]));
    }

    #[test]
    fn discard_keeps_framing_packets() {
        let (mut queues, ids) = chain(&[1024]);
        let q = ids[0];
        queues.put_for_service(q, Packet::header(), false);
        queues.put_for_service(q, Packet::data(b"abc"), false);
        queues.put_for_service(q, Packet::end(), false);

        assert_eq!(queues.discard(q, false), 3);
        assert_eq!(queues[q].len(), 3);
        assert_eq!(queues[q].count(), 0);

        queues.put_for_service(q, Packet::data(b"defg"), false);
        assert_eq!(queues.discard(q, true), 4);
        assert_eq!(queues[q].len(), 2);
        assert!(queues[q].first().unwrap().is_header());
    }

    #[test]
    fn schedule_during_service_defers() {
        let (mut queues, ids) = chain(&[1024]);
        queues[ids[0]].flags.insert(QueueFlags::SERVICING);
        queues.schedule(ids[0]);
        assert!(!queues.has_scheduled());
        assert!(queues[ids[0]].flags.contains(QueueFlags::RESERVICE));
    }

    #[test]
    fn stage_data_round_trip() {
        let (mut queues, ids) = chain(&[1024]);
        queues[ids[0]].set_data(42u32);
        assert_eq!(queues[ids[0]].data::<u32>(), Some(&42));
        *queues[ids[0]].data_mut::<u32>().unwrap() += 1;
        assert!(queues[ids[0]].take_data::<String>().is_none());
        assert_eq!(queues[ids[0]].take_data::<u32>().map(|data| *data), Some(43));
    }

    /// Producer that forwards through `will_next_accept` while a consumer drains
    /// the downstream queue at its own pace.
    #[test]
    fn backpressure_bounds_downstream() {
        let (mut queues, ids) = chain(&[1 << 20, 4096]);
        let (producer, consumer) = (ids[0], ids[1]);
        for _ in 0..64 {
            queues.put_for_service(producer, Packet::data(&[9u8; 1000]), false);
        }

        let mut delivered = 0;
        for round in 0..10_000 {
            if !queues[producer].flags.contains(QueueFlags::DISABLED) {
                while let Some(mut packet) = queues.get_packet(producer) {
                    if !queues.will_next_accept(producer, &mut packet) {
                        queues.put_back(producer, packet);
                        break;
                    }
                    queues.put_for_service(consumer, packet, false);
                    assert!(queues[consumer].count() <= queues[consumer].max);
                }
            }
            if round % 3 == 0 {
                if let Some(packet) = queues.get_packet(consumer) {
                    delivered += packet.len();
                }
            }
            if queues[producer].is_empty() && queues[consumer].is_empty() {
                break;
            }
        }
        assert_eq!(delivered, 64_000);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(usize),
        Get,
        PutBack,
        Discard,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..300).prop_map(Op::Put),
            Just(Op::Get),
            Just(Op::PutBack),
            Just(Op::Discard),
        ]
    }

    proptest! {
        #[test]
        fn count_matches_queued_lengths(ops in proptest::collection::vec(op(), 1..200)) {
            let (mut queues, ids) = chain(&[1024, 256]);
            let q = ids[0];
            let mut held = Vec::new();
            for op in ops {
                match op {
                    Op::Put(len) => queues.put_for_service(q, Packet::data(&vec![1u8; len]), true),
                    Op::Get => {
                        if let Some(mut packet) = queues.get_packet(q) {
                            if !queues.will_next_accept(q, &mut packet) {
                                held.push(packet);
                            } else {
                                queues.put_for_service(ids[1], packet, false);
                            }
                        }
                    }
                    Op::PutBack => {
                        if let Some(packet) = held.pop() {
                            queues.put_back(q, packet);
                        }
                    }
                    Op::Discard => {
                        queues.discard(ids[1], true);
                    }
                }
                prop_assert_eq!(queues[q].count(), sum_of_lengths(&queues, q));
                prop_assert_eq!(queues[ids[1]].count(), sum_of_lengths(&queues, ids[1]));
            }
        }

        #[test]
        fn packets_come_out_in_order(script in proptest::collection::vec(any::<bool>(), 1..300)) {
            let (mut queues, ids) = chain(&[1 << 20]);
            let q = ids[0];
            let (mut next_in, mut next_out) = (0u32, 0u32);
            for put in script {
                if put {
                    queues.put_for_service(q, Packet::data(&next_in.to_be_bytes()), false);
                    next_in += 1;
                } else if let Some(packet) = queues.get_packet(q) {
                    prop_assert_eq!(&packet.content().unwrap()[..], &next_out.to_be_bytes()[..]);
                    next_out += 1;
                }
            }
            while let Some(packet) = queues.get_packet(q) {
                prop_assert_eq!(&packet.content().unwrap()[..], &next_out.to_be_bytes()[..]);
                next_out += 1;
            }
            prop_assert_eq!(next_in, next_out);
        }
    }
}
