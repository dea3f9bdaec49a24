//! In-flight tables for QoS 1 and QoS 2 exchanges
//!
//! Outbound QoS 1: `PendingSend -> AwaitingAck -> done (PUBACK)`
//! Outbound QoS 2: `PendingSend -> AwaitingPubRec -> AwaitingPubComp (PUBREC) -> done (PUBCOMP)`
//! Inbound QoS 2: `AwaitingRelease` from the first PUBLISH until PUBREL.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::error::BrokerError;
use crate::protocol::{Packet, PubRel, Publish, QoS};

/// State of an outbound QoS 1/2 message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    /// Packet id assigned, PUBLISH not handed to the writer yet
    PendingSend,
    /// QoS 1 PUBLISH sent
    AwaitingAck,
    /// QoS 2 PUBLISH sent
    AwaitingPubRec,
    /// PUBREC received, PUBREL sent
    AwaitingPubComp,
}

/// One outbound in-flight message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflightEntry {
    /// The PUBLISH as sent, packet id included
    pub publish: Publish,
    pub state: OutboundState,
    /// Last time the PUBLISH or PUBREL was handed to the writer
    pub sent_at: Option<Instant>,
    pub retry_count: u32,
    /// Allocation order within the session. Packet ids are reused, so
    /// resends follow this instead of the id.
    pub seq: u64,
}

impl InflightEntry {
    pub fn packet_id(&self) -> u16 {
        self.publish.packet_id.unwrap_or_default()
    }
}

/// A packet that has to go (again) to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resend {
    Publish(Publish),
    PubRel(u16),
}

impl Resend {
    pub fn into_packet(self) -> Packet {
        match self {
            Resend::Publish(p) => Packet::Publish(p),
            Resend::PubRel(id) => Packet::PubRel(PubRel::new(id)),
        }
    }
}

/// What a PUBREC did to the outbound table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubRecOutcome {
    /// Moved to AwaitingPubComp, PUBREL must be sent
    Released,
    /// Already awaiting PUBCOMP, PUBREL is sent again
    AlreadyReleased,
    /// No QoS 2 exchange with this id
    Unknown,
}

/// Delay before retry number `retry_count + 1`
pub fn retry_backoff(base: Duration, retry_count: u32, max: Duration) -> Duration {
    base.saturating_mul(1u32 << retry_count.min(16)).min(max)
}

/// Outbound in-flight table of one session
#[derive(Debug, Clone)]
pub struct Outbound {
    entries: BTreeMap<u16, InflightEntry>,
    max_inflight: usize,
    /// Every id below this one is in use
    lowest_free: u32,
    next_seq: u64,
}

impl Outbound {
    /// `max_inflight` of 0 allows the whole packet id space
    pub fn new(max_inflight: u16) -> Self {
        let max_inflight = if max_inflight == 0 {
            u16::MAX as usize
        } else {
            max_inflight as usize
        };
        Self {
            entries: BTreeMap::new(),
            max_inflight,
            lowest_free: 1,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, packet_id: u16) -> Option<&InflightEntry> {
        self.entries.get(&packet_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &InflightEntry> {
        self.entries.values()
    }

    /// Entries in the order they were allocated
    fn in_send_order(&self) -> Vec<&InflightEntry> {
        let mut ordered: Vec<&InflightEntry> = self.entries.values().collect();
        ordered.sort_by_key(|entry| entry.seq);
        ordered
    }

    /// True while some PUBLISH got an id but never reached the writer.
    /// Anything delivered after it must wait so the client sees the order
    /// the messages were published in.
    pub fn has_pending_send(&self) -> bool {
        self.entries
            .values()
            .any(|entry| entry.state == OutboundState::PendingSend)
    }

    /// `PendingSend` PUBLISHes, oldest first
    pub fn pending_sends(&self) -> Vec<Publish> {
        self.in_send_order()
            .into_iter()
            .filter(|entry| entry.state == OutboundState::PendingSend)
            .map(|entry| entry.publish.clone())
            .collect()
    }

    /// Smallest packet id not currently in use
    fn free_id(&self) -> Option<u16> {
        if self.entries.len() >= self.max_inflight {
            return None;
        }

        let mut candidate = u16::try_from(self.lowest_free).ok()?;
        for &id in self.entries.range(candidate..).map(|(id, _)| id) {
            if id != candidate {
                break;
            }
            candidate = candidate.checked_add(1)?;
        }
        Some(candidate)
    }

    fn remove_entry(&mut self, packet_id: u16) -> Option<InflightEntry> {
        let removed = self.entries.remove(&packet_id)?;
        self.lowest_free = self.lowest_free.min(packet_id as u32);
        Some(removed)
    }

    /// Record `publish` under the smallest free packet id.
    ///
    /// Returns the PUBLISH to send, with the id filled in and DUP cleared.
    pub fn allocate(&mut self, publish: &Publish) -> Result<Publish, BrokerError> {
        debug_assert!(publish.qos != QoS::AtMostOnce);

        let packet_id = self.free_id().ok_or(BrokerError::IdSpaceExhausted)?;
        let publish = Publish {
            dup: false,
            packet_id: Some(packet_id),
            ..publish.clone()
        };

        self.lowest_free = packet_id as u32 + 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            packet_id,
            InflightEntry {
                publish: publish.clone(),
                state: OutboundState::PendingSend,
                sent_at: None,
                retry_count: 0,
                seq,
            },
        );
        Ok(publish)
    }

    /// The packet for `packet_id` was handed to the writer.
    ///
    /// The first send moves a `PendingSend` entry to its awaiting state.
    /// Any later send is a retry: the retry count goes up and the stored
    /// PUBLISH keeps DUP from now on.
    pub fn mark_sent(&mut self, packet_id: u16, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&packet_id) {
            match entry.state {
                OutboundState::PendingSend => {
                    entry.state = match entry.publish.qos {
                        QoS::ExactlyOnce => OutboundState::AwaitingPubRec,
                        _ => OutboundState::AwaitingAck,
                    };
                }
                OutboundState::AwaitingPubComp => {
                    entry.retry_count = entry.retry_count.saturating_add(1);
                }
                OutboundState::AwaitingAck | OutboundState::AwaitingPubRec => {
                    entry.retry_count = entry.retry_count.saturating_add(1);
                    entry.publish.dup = true;
                }
            }
            entry.sent_at = Some(now);
        }
    }

    /// PUBACK received. Returns the completed entry.
    pub fn puback(&mut self, packet_id: u16) -> Option<InflightEntry> {
        self.remove_in_state(packet_id, OutboundState::AwaitingAck)
    }

    /// PUBREC received
    pub fn pubrec(&mut self, packet_id: u16, now: Instant) -> PubRecOutcome {
        match self.entries.get_mut(&packet_id) {
            Some(entry) if entry.state == OutboundState::AwaitingPubRec => {
                entry.state = OutboundState::AwaitingPubComp;
                entry.sent_at = Some(now);
                entry.retry_count = 0;
                PubRecOutcome::Released
            }
            Some(entry) if entry.state == OutboundState::AwaitingPubComp => {
                entry.sent_at = Some(now);
                PubRecOutcome::AlreadyReleased
            }
            _ => PubRecOutcome::Unknown,
        }
    }

    /// PUBCOMP received. Returns the completed entry.
    pub fn pubcomp(&mut self, packet_id: u16) -> Option<InflightEntry> {
        self.remove_in_state(packet_id, OutboundState::AwaitingPubComp)
    }

    fn remove_in_state(&mut self, packet_id: u16, state: OutboundState) -> Option<InflightEntry> {
        match self.entries.get(&packet_id) {
            Some(entry) if entry.state == state => self.remove_entry(packet_id),
            _ => None,
        }
    }

    /// Packets that have to be sent now, oldest allocation first.
    ///
    /// `PendingSend` entries are always due and come back without DUP.
    /// Entries waiting for an acknowledgement are due once their backoff
    /// elapsed; they come back with DUP set (or as PUBREL). Nothing changes
    /// here: the caller calls [`Outbound::mark_sent`] for every packet that
    /// actually reached the writer.
    pub fn due(&self, now: Instant, base: Duration, max: Duration) -> Vec<(u16, Resend)> {
        self.in_send_order()
            .into_iter()
            .filter(|entry| match entry.sent_at {
                None => true,
                Some(sent_at) => {
                    let wait = retry_backoff(base, entry.retry_count, max);
                    now.saturating_duration_since(sent_at) >= wait
                }
            })
            .map(|entry| (entry.packet_id(), Self::resend_of(entry)))
            .collect()
    }

    /// Every entry, oldest allocation first, for a persistent session that
    /// just reconnected
    pub fn resend_all(&self) -> Vec<(u16, Resend)> {
        self.in_send_order()
            .into_iter()
            .map(|entry| (entry.packet_id(), Self::resend_of(entry)))
            .collect()
    }

    fn resend_of(entry: &InflightEntry) -> Resend {
        match entry.state {
            OutboundState::PendingSend => Resend::Publish(entry.publish.clone()),
            OutboundState::AwaitingPubComp => Resend::PubRel(entry.packet_id()),
            OutboundState::AwaitingAck | OutboundState::AwaitingPubRec => {
                Resend::Publish(Publish {
                    dup: true,
                    ..entry.publish.clone()
                })
            }
        }
    }

    /// Put back an entry loaded from storage. Its send time is unknown, so it
    /// is resent on the next connection.
    pub fn restore(&mut self, mut entry: InflightEntry) {
        let Some(packet_id) = entry.publish.packet_id else {
            return;
        };
        entry.sent_at = (entry.state != OutboundState::PendingSend).then(Instant::now);
        self.next_seq = self.next_seq.max(entry.seq.saturating_add(1));
        self.entries.insert(packet_id, entry);
    }

    /// Drop every entry
    pub fn clear(&mut self) -> Vec<InflightEntry> {
        self.lowest_free = 1;
        self.next_seq = 0;
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

/// Result of receiving an inbound QoS 2 PUBLISH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundReceive {
    /// First delivery: route the message and send PUBREC
    New,
    /// Retransmission while awaiting PUBREL: only send PUBREC again
    Duplicate,
    /// Too many exchanges awaiting release
    Full,
}

/// Inbound QoS 2 table of one session
#[derive(Debug, Clone)]
pub struct Inbound {
    awaiting_release: BTreeMap<u16, Instant>,
    max_awaiting: usize,
}

impl Inbound {
    /// `max_awaiting` of 0 means unbounded
    pub fn new(max_awaiting: usize) -> Self {
        Self {
            awaiting_release: BTreeMap::new(),
            max_awaiting,
        }
    }

    pub fn receive(&mut self, packet_id: u16, now: Instant) -> InboundReceive {
        if self.awaiting_release.contains_key(&packet_id) {
            return InboundReceive::Duplicate;
        }
        if self.max_awaiting > 0 && self.awaiting_release.len() >= self.max_awaiting {
            return InboundReceive::Full;
        }
        self.awaiting_release.insert(packet_id, now);
        InboundReceive::New
    }

    /// PUBREL received. Returns true if the id was awaiting release.
    pub fn release(&mut self, packet_id: u16) -> bool {
        self.awaiting_release.remove(&packet_id).is_some()
    }

    pub fn is_awaiting(&self, packet_id: u16) -> bool {
        self.awaiting_release.contains_key(&packet_id)
    }

    pub fn packet_ids(&self) -> Vec<u16> {
        self.awaiting_release.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.awaiting_release.len()
    }

    pub fn is_empty(&self) -> bool {
        self.awaiting_release.is_empty()
    }
}
