use std::time::{Duration, Instant};

use crate::{avg::SlidingDurationAvg, counter::ThruputCounters};

/// At any given time, a connection with a peer is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ConnState {
    /// The peer connection has not yet been connected or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// The period after the handshake in which the peer announces its initial
    /// piece availability: a bitfield, have-all/have-none with the fast
    /// extension, or nothing, which means no pieces yet.
    AvailabilityExchange,
    /// This is the normal state of a peer session, in which any messages,
    /// apart from the handshake and the initial availability announcement,
    /// may be exchanged.
    Connected,
    Disconnecting,
}

impl Default for ConnState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// A peer is snubbing us if it hasn't sent a block this long while we had
/// outstanding requests to it.
pub(crate) const SNUB_TIMEOUT: Duration = Duration::from_secs(60);

/// The mutable state of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Debug)]
pub(crate) struct SessionState {
    /// The current state of the connection.
    pub conn_state: ConnState,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    pub is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    pub is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    pub is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    pub is_peer_interested: bool,
    /// Byte counters of both directions, payload and protocol chatter split.
    pub counters: ThruputCounters,
    /// The running average of a block request's round trip time, the basis of
    /// the request queue sizing and of request timeouts.
    pub request_rtt: SlidingDurationAvg,
    /// The number of block requests we try to keep outstanding to saturate
    /// the link, adapted from the bandwidth-delay product.
    pub target_request_queue_len: usize,
    pub connect_time: Option<Instant>,
    /// The last time any message arrived from the peer.
    pub last_incoming_msg_time: Option<Instant>,
    /// The last time we sent any message to the peer.
    pub last_outgoing_msg_time: Option<Instant>,
    /// The last time a block payload arrived from the peer.
    pub last_incoming_block_time: Option<Instant>,
    /// The time we last sent a block request while having none outstanding.
    pub last_outgoing_request_time: Option<Instant>,
}

/// The initial request queue size, before there are rate samples to adapt
/// to.
const START_REQUEST_QUEUE_LEN: usize = 4;

impl Default for SessionState {
    fn default() -> Self {
        Self {
            conn_state: ConnState::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            counters: ThruputCounters::default(),
            request_rtt: SlidingDurationAvg::default(),
            target_request_queue_len: START_REQUEST_QUEUE_LEN,
            connect_time: None,
            last_incoming_msg_time: None,
            last_outgoing_msg_time: None,
            last_incoming_block_time: None,
            last_outgoing_request_time: None,
        }
    }
}

impl SessionState {
    /// Closes the per-second counter rounds. Called once a second from the
    /// session tick.
    pub fn tick(&mut self) {
        self.counters.tick();
    }

    /// Records the round trip time of a served request and re-derives the
    /// target request queue length from the bandwidth-delay product, so the
    /// pipeline stays full without hoarding blocks a slow link can't absorb.
    pub fn update_request_timings(
        &mut self,
        rtt: Duration,
        pipeline_depth: usize,
    ) {
        self.request_rtt.update(rtt);
        let rate = self.counters.down.payload.avg_rate();
        let bandwidth_delay =
            rate as f64 * self.request_rtt.mean().as_secs_f64();
        let target =
            (bandwidth_delay / crate::BLOCK_LEN as f64).ceil() as usize;
        self.target_request_queue_len =
            target.max(START_REQUEST_QUEUE_LEN).min(pipeline_depth.max(1));
    }

    /// Whether the peer has been withholding blocks we asked for.
    pub fn is_snubbed(&self) -> bool {
        let reference = match (
            self.last_incoming_block_time,
            self.last_outgoing_request_time,
        ) {
            (Some(block), _) => block,
            (None, Some(request)) => request,
            (None, None) => return false,
        };
        reference.elapsed() > SNUB_TIMEOUT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_choked_and_uninterested() {
        let state = SessionState::default();
        assert!(state.is_choked);
        assert!(state.is_peer_choked);
        assert!(!state.is_interested);
        assert!(!state.is_peer_interested);
        assert_eq!(state.conn_state, ConnState::Disconnected);
    }

    #[test]
    fn test_request_queue_adapts_to_thruput() {
        let mut state = SessionState::default();
        // simulate a sustained 4 MiB/s link
        for _ in 0..30 {
            state.counters.down.payload.add(4 * 1024 * 1024);
            state.tick();
        }
        state.update_request_timings(Duration::from_millis(500), 500);
        // 2 MiB in flight at 16 KiB blocks is 128 requests
        assert_eq!(state.target_request_queue_len, 128);

        // the configured pipeline depth caps the queue
        state.update_request_timings(Duration::from_millis(500), 50);
        assert_eq!(state.target_request_queue_len, 50);
    }

    #[test]
    fn test_snub_detection() {
        let mut state = SessionState::default();
        assert!(!state.is_snubbed());
        state.last_outgoing_request_time =
            Some(Instant::now() - SNUB_TIMEOUT * 2);
        assert!(state.is_snubbed());
        state.last_incoming_block_time = Some(Instant::now());
        assert!(!state.is_snubbed());
    }
}
