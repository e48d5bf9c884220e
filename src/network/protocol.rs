//! The per-peer UDP protocol: handshake, input delivery with
//! delta-compression, acknowledgements, keepalives, quality feedback and
//! disconnect detection.
//!
//! One [`UdpProtocol`] instance exists per remote endpoint. It is driven
//! entirely by polling from the session; every timer compares against a
//! monotonic clock, nothing blocks and nothing retries outside of the
//! handshake and the input-retransmission schedule.

use std::collections::vec_deque::Drain;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{error, trace, warn};
use web_time::{Duration, Instant};

use crate::frame_info::PlayerInput;
use crate::network::codec;
use crate::network::compression;
use crate::network::messages::{
    ConnectionStatus, Input, InputAck, Message, MessageBody, MessageHeader, QualityReply,
    QualityReport, SyncReply, SyncRequest,
};
use crate::network::network_stats::NetworkStats;
use crate::time_sync::TimeSync;
use crate::{Config, Frame, NonBlockingSocket, PalisadeError, PlayerHandle};

/// Successful sync roundtrips required before the connection counts as
/// established.
pub(crate) const NUM_SYNC_ROUNDTRIPS: u32 = 5;
/// Unanswered sends allowed per sync roundtrip before the handshake is
/// declared failed.
const NUM_SYNC_RETRIES: u32 = 5;
/// Unacknowledged inputs a peer may accumulate before being dropped. Only an
/// endpoint that stopped acknowledging (a stalled spectator) ever gets here;
/// players hit the prediction barrier long before.
const PENDING_OUTPUT_LIMIT: usize = 128;
/// Messages whose sequence number lags the newest seen by more than this are
/// dropped as stale.
const MAX_SEQUENCE_DISTANCE: u16 = 32768;
/// Received inputs are kept for twice the prediction window so a
/// retransmitted burst can still be decoded against its reference.
const INPUT_HISTORY_MULTIPLIER: i32 = 2;
/// Assumed size of the IP + UDP headers per packet, for bandwidth estimates.
const UDP_HEADER_SIZE: usize = 28;

/// The timer knobs of the protocol, separated out so sessions (and tests)
/// can tighten them. The defaults are the tuned values for 60 fps play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProtocolOptions {
    pub disconnect_timeout: Duration,
    pub disconnect_notify_start: Duration,
    pub sync_retry_interval: Duration,
    pub keep_alive_interval: Duration,
    pub quality_report_interval: Duration,
    /// How long to wait before retransmitting pending inputs when no input
    /// traffic arrives from the peer.
    pub running_retry_interval: Duration,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            disconnect_timeout: Duration::from_millis(5000),
            disconnect_notify_start: Duration::from_millis(750),
            sync_retry_interval: Duration::from_millis(200),
            keep_alive_interval: Duration::from_millis(200),
            quality_report_interval: Duration::from_millis(1000),
            running_retry_interval: Duration::from_millis(200),
        }
    }
}

/// The connection state towards one peer.
///
/// ```text
/// Initializing ──► Synchronizing ──► Running ──► Disconnected
/// ```
///
/// `Disconnected` is terminal: it is entered on handshake exhaustion, on the
/// hard receive timeout, or on an explicit disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProtocolState {
    /// Created, but the handshake has not been started yet.
    Initializing,
    /// Exchanging sync request/reply roundtrips with the peer.
    Synchronizing,
    /// Established; exchanging inputs, acks and quality reports.
    Running,
    /// The peer is gone (timeout, failed handshake or explicit disconnect).
    Disconnected,
}

/// What a protocol instance reports back to its session when polled.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event<T>
where
    T: Config,
{
    /// Sync roundtrip `count` of `total` completed.
    Synchronizing { total: u32, count: u32 },
    /// Handshake complete; the endpoint is running.
    Synchronized,
    /// The handshake retry budget is exhausted.
    SynchronizationFailed,
    /// An authoritative remote input arrived.
    Input {
        input: PlayerInput<T::Input>,
        player: PlayerHandle,
    },
    /// The peer timed out or requested a disconnect.
    Disconnected,
    /// No traffic for a while; disconnect follows in `disconnect_timeout` ms.
    NetworkInterrupted { disconnect_timeout: u128 },
    /// Traffic resumed after an interruption.
    NetworkResumed,
    /// The peer piggybacked a state checksum for desync comparison.
    Checksum { frame: Frame, checksum: u64 },
}

/// A tick's worth of serialized inputs (all players hosted on one endpoint,
/// concatenated in handle order).
#[derive(Clone)]
struct InputBytes {
    frame: Frame,
    bytes: Vec<u8>,
}

impl InputBytes {
    fn zeroed(total_size: usize) -> Self {
        Self {
            frame: Frame::NULL,
            bytes: vec![0; total_size],
        }
    }

    fn from_inputs<T: Config>(
        inputs: &BTreeMap<PlayerHandle, PlayerInput<T::Input>>,
    ) -> Self {
        let mut frame = Frame::NULL;
        let mut bytes = Vec::new();
        // BTreeMap iteration is already in ascending handle order
        for input in inputs.values() {
            if frame.is_null() {
                frame = input.frame;
            }
            match codec::encode(&input.input) {
                Ok(mut serialized) => bytes.append(&mut serialized),
                Err(err) => {
                    error!("failed to serialize player input: {err}");
                    return Self {
                        frame: Frame::NULL,
                        bytes: Vec::new(),
                    };
                },
            }
        }
        Self { frame, bytes }
    }

    fn to_player_inputs<T: Config>(&self, num_players: usize) -> Vec<PlayerInput<T::Input>> {
        let mut player_inputs = Vec::with_capacity(num_players);
        if num_players == 0 || self.bytes.len() % num_players != 0 {
            warn!(
                bytes = self.bytes.len(),
                num_players, "input payload does not divide into per-player inputs"
            );
            return player_inputs;
        }
        let size = self.bytes.len() / num_players;
        for chunk in self.bytes.chunks_exact(size) {
            match codec::decode::<T::Input>(chunk) {
                Ok(input) => player_inputs.push(PlayerInput::new(self.frame, input)),
                Err(err) => {
                    warn!("failed to deserialize remote input: {err}");
                    return Vec::new();
                },
            }
        }
        player_inputs
    }
}

/// Protocol endpoint for a single remote peer.
pub(crate) struct UdpProtocol<T>
where
    T: Config,
{
    /// The handles of the players hosted at `peer_addr`, sorted.
    handles: Vec<PlayerHandle>,
    send_queue: VecDeque<Message>,
    event_queue: VecDeque<Event<T>>,

    // state machine
    state: ProtocolState,
    sync_remaining_roundtrips: u32,
    sync_retry_count: u32,
    sync_random_requests: BTreeSet<u32>,
    running_last_quality_report: Instant,
    running_last_input_recv: Instant,
    disconnect_notify_sent: bool,
    disconnect_event_sent: bool,

    // configuration
    options: ProtocolOptions,
    fps: usize,
    max_prediction: usize,
    magic: u16,

    // the other side
    peer_addr: T::Address,
    remote_magic: u16,
    peer_connect_status: Vec<ConnectionStatus>,

    // sequencing
    next_send_sequence: u16,
    next_recv_sequence: u16,
    /// Messages dropped for bad magic or stale sequence numbers.
    dropped_packets: usize,

    // input transfer
    /// Serialized width of a single player's input for one tick.
    input_size: usize,
    pending_output: VecDeque<InputBytes>,
    last_acked_input: InputBytes,
    recv_inputs: BTreeMap<Frame, InputBytes>,

    // time sync
    time_sync: TimeSync,
    local_frame_advantage: i32,
    remote_frame_advantage: i32,

    // disconnect notice to the peer
    disconnect_frame: Frame,

    // desync detection
    pending_outbound_checksum: Option<(Frame, u64)>,

    // stats
    stats_start: Instant,
    packets_sent: usize,
    bytes_sent: usize,
    round_trip_time: u32,
    last_send_time: Instant,
    last_recv_time: Instant,
}

impl<T: Config> UdpProtocol<T> {
    /// Builds an endpoint for the players in `handles` hosted at `peer_addr`.
    /// `local_inputs_per_frame` is how many player inputs this side transmits
    /// each tick (the local player count, or all players for a spectator
    /// feed).
    pub(crate) fn new(
        mut handles: Vec<PlayerHandle>,
        peer_addr: T::Address,
        num_players: usize,
        local_inputs_per_frame: usize,
        max_prediction: usize,
        fps: usize,
        options: ProtocolOptions,
    ) -> Result<Self, PalisadeError> {
        handles.sort_unstable();

        let input_size =
            codec::serialized_size::<T::Input>().map_err(|err| PalisadeError::InvalidRequest {
                info: format!("the input type cannot be serialized: {err}"),
            })?;

        let mut magic: u16 = rand::random();
        while magic == 0 {
            magic = rand::random();
        }

        // decoding the first burst needs a reference of the right width
        let mut recv_inputs = BTreeMap::new();
        recv_inputs.insert(Frame::NULL, InputBytes::zeroed(input_size * handles.len()));

        let now = Instant::now();
        Ok(Self {
            last_acked_input: InputBytes::zeroed(input_size * local_inputs_per_frame),
            handles,
            send_queue: VecDeque::new(),
            event_queue: VecDeque::new(),

            state: ProtocolState::Initializing,
            sync_remaining_roundtrips: NUM_SYNC_ROUNDTRIPS,
            sync_retry_count: 0,
            sync_random_requests: BTreeSet::new(),
            running_last_quality_report: now,
            running_last_input_recv: now,
            disconnect_notify_sent: false,
            disconnect_event_sent: false,

            options,
            fps,
            max_prediction,
            magic,

            peer_addr,
            remote_magic: 0,
            peer_connect_status: vec![ConnectionStatus::default(); num_players],

            next_send_sequence: 0,
            next_recv_sequence: 0,
            dropped_packets: 0,

            input_size,
            pending_output: VecDeque::new(),
            recv_inputs,

            time_sync: TimeSync::new(),
            local_frame_advantage: 0,
            remote_frame_advantage: 0,

            disconnect_frame: Frame::NULL,

            pending_outbound_checksum: None,

            stats_start: now,
            packets_sent: 0,
            bytes_sent: 0,
            round_trip_time: 0,
            last_send_time: now,
            last_recv_time: now,
        })
    }

    pub(crate) fn peer_addr(&self) -> T::Address {
        self.peer_addr.clone()
    }

    pub(crate) fn is_handling_message(&self, addr: &T::Address) -> bool {
        self.peer_addr == *addr
    }

    pub(crate) fn is_synchronized(&self) -> bool {
        self.state == ProtocolState::Running || self.state == ProtocolState::Disconnected
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state == ProtocolState::Running
    }

    pub(crate) fn peer_connect_status(&self, handle: PlayerHandle) -> ConnectionStatus {
        self.peer_connect_status
            .get(handle.as_usize())
            .copied()
            .unwrap_or_default()
    }

    /// Marks the endpoint disconnected. Any input sent on a later poll also
    /// carries a disconnect notice for the peer.
    pub(crate) fn disconnect(&mut self) {
        if self.state == ProtocolState::Disconnected {
            return;
        }
        self.disconnect_frame = self
            .pending_output
            .back()
            .map_or(self.last_acked_input.frame, |input| input.frame);
        self.state = ProtocolState::Disconnected;
    }

    /// Starts the handshake. By convention the session calls this on every
    /// endpoint right after construction; both sides run their own roundtrips
    /// and the connection counts once both have finished.
    pub(crate) fn synchronize(&mut self) {
        debug_assert!(self.state == ProtocolState::Initializing);
        self.state = ProtocolState::Synchronizing;
        self.sync_remaining_roundtrips = NUM_SYNC_ROUNDTRIPS;
        self.sync_retry_count = 0;
        self.stats_start = Instant::now();
        self.send_sync_request();
    }

    /// Attaches a state checksum to the next outbound input message.
    pub(crate) fn queue_checksum(&mut self, frame: Frame, checksum: u64) {
        self.pending_outbound_checksum = Some((frame, checksum));
    }

    /// Refreshes the estimate of how many frames ahead of the peer we run.
    pub(crate) fn update_local_frame_advantage(&mut self, local_frame: Frame) {
        let last_recv_frame = self.last_recv_frame();
        if local_frame.is_null() || last_recv_frame.is_null() {
            return;
        }
        // the peer has advanced past its last transmitted frame by roughly
        // half a round trip by the time its input reaches us
        let half_rtt_frames = (self.round_trip_time as i32 / 2) * self.fps as i32 / 1000;
        let estimated_remote_frame = last_recv_frame + half_rtt_frames;
        self.local_frame_advantage = local_frame - estimated_remote_frame;
    }

    /// Delegates to this endpoint's time-sync window.
    pub(crate) fn recommend_frame_wait(&mut self, current_frame: Frame) -> u32 {
        self.time_sync.recommend_frame_wait(current_frame)
    }

    pub(crate) fn network_stats(&self) -> Result<NetworkStats, PalisadeError> {
        if self.state != ProtocolState::Synchronizing && self.state != ProtocolState::Running {
            return Err(PalisadeError::NotSynchronized);
        }
        let seconds = self.stats_start.elapsed().as_secs() as usize;
        let total_bytes_sent = self.bytes_sent + self.packets_sent * UDP_HEADER_SIZE;
        Ok(NetworkStats {
            ping_ms: self.round_trip_time,
            send_queue_len: self.pending_output.len(),
            kbps_sent: if seconds > 0 {
                total_bytes_sent / seconds / 1024
            } else {
                0
            },
            local_frames_ahead: self.local_frame_advantage,
            remote_frames_ahead: self.remote_frame_advantage,
        })
    }

    /// Runs the polled timers and drains the events they produced.
    pub(crate) fn poll(&mut self, connect_status: &[ConnectionStatus]) -> Drain<'_, Event<T>> {
        let now = Instant::now();
        match self.state {
            ProtocolState::Synchronizing => {
                if self.last_send_time + self.options.sync_retry_interval < now {
                    if self.sync_retry_count >= NUM_SYNC_RETRIES {
                        warn!(
                            addr = ?self.peer_addr,
                            "handshake exhausted its retry budget"
                        );
                        self.state = ProtocolState::Disconnected;
                        self.event_queue.push_back(Event::SynchronizationFailed);
                    } else {
                        self.send_sync_request();
                    }
                }
            },
            ProtocolState::Running => {
                // retransmit pending inputs when the peer has gone quiet
                if self.running_last_input_recv + self.options.running_retry_interval < now {
                    if let Err(err) = self.send_pending_output(connect_status) {
                        error!("failed to encode pending inputs for retransmission: {err}");
                    }
                    self.running_last_input_recv = now;
                }

                if self.running_last_quality_report + self.options.quality_report_interval < now {
                    self.send_quality_report();
                }

                if self.last_send_time + self.options.keep_alive_interval < now {
                    self.queue_message(MessageBody::KeepAlive);
                }

                if !self.disconnect_notify_sent
                    && self.last_recv_time + self.options.disconnect_notify_start < now
                {
                    let remaining = self
                        .options
                        .disconnect_timeout
                        .saturating_sub(self.options.disconnect_notify_start);
                    self.event_queue.push_back(Event::NetworkInterrupted {
                        disconnect_timeout: remaining.as_millis(),
                    });
                    self.disconnect_notify_sent = true;
                }

                if !self.disconnect_event_sent
                    && self.last_recv_time + self.options.disconnect_timeout < now
                {
                    self.event_queue.push_back(Event::Disconnected);
                    self.disconnect_event_sent = true;
                    self.state = ProtocolState::Disconnected;
                }
            },
            ProtocolState::Initializing | ProtocolState::Disconnected => (),
        }
        self.event_queue.drain(..)
    }

    /*
     * sending
     */

    pub(crate) fn send_all_messages(
        &mut self,
        socket: &mut Box<dyn NonBlockingSocket<T::Address>>,
    ) {
        if self.send_queue.is_empty() {
            return;
        }
        trace!(
            count = self.send_queue.len(),
            addr = ?self.peer_addr,
            "flushing messages to socket"
        );
        for msg in self.send_queue.drain(..) {
            socket.send_to(&msg, &self.peer_addr);
        }
    }

    /// Queues a freshly confirmed tick of local inputs for delivery.
    pub(crate) fn send_input(
        &mut self,
        inputs: &BTreeMap<PlayerHandle, PlayerInput<T::Input>>,
        connect_status: &[ConnectionStatus],
    ) -> Result<(), PalisadeError> {
        if self.state != ProtocolState::Running {
            return Ok(());
        }

        let tick = InputBytes::from_inputs::<T>(inputs);

        self.time_sync.advance_frame(
            tick.frame,
            self.local_frame_advantage,
            self.remote_frame_advantage,
        );

        self.pending_output.push_back(tick);
        if self.pending_output.len() > PENDING_OUTPUT_LIMIT {
            // the peer stopped acknowledging; players would have hit the
            // prediction barrier long ago, so this is a dead spectator
            warn!(
                addr = ?self.peer_addr,
                pending = self.pending_output.len(),
                "peer stopped acknowledging inputs, disconnecting"
            );
            self.event_queue.push_back(Event::Disconnected);
            self.disconnect_event_sent = true;
            self.state = ProtocolState::Disconnected;
            return Ok(());
        }

        self.send_pending_output(connect_status)
    }

    fn send_pending_output(
        &mut self,
        connect_status: &[ConnectionStatus],
    ) -> Result<(), PalisadeError> {
        let Some(front) = self.pending_output.front() else {
            return Ok(());
        };

        if !self.last_acked_input.frame.is_null()
            && front.frame != self.last_acked_input.frame + 1
        {
            // should be unreachable: acks only ever pop full prefixes
            error!(
                last_acked = self.last_acked_input.frame.as_i32(),
                pending_front = front.frame.as_i32(),
                "pending input is not contiguous with the last acked input"
            );
            return Ok(());
        }

        let mut body = Input {
            start_frame: front.frame,
            bytes: compression::encode(
                &self.last_acked_input.bytes,
                self.pending_output.iter().map(|tick| &tick.bytes),
            )?,
            ..Input::default()
        };
        body.num_bits = u16::try_from(body.bytes.len().saturating_mul(8)).unwrap_or(u16::MAX);
        body.input_size = u8::try_from(self.input_size).unwrap_or(u8::MAX);
        body.ack_frame = self.last_recv_frame();
        body.disconnect_requested = self.state == ProtocolState::Disconnected;
        body.disconnect_frame = self.disconnect_frame;
        if let Some((frame, checksum)) = self.pending_outbound_checksum.take() {
            body.checksum_frame = frame;
            body.checksum = checksum;
        }
        connect_status.clone_into(&mut body.peer_connect_status);

        self.queue_message(MessageBody::Input(body));
        Ok(())
    }

    fn send_input_ack(&mut self) {
        self.queue_message(MessageBody::InputAck(InputAck {
            ack_frame: self.last_recv_frame(),
        }));
    }

    fn send_sync_request(&mut self) {
        self.sync_retry_count += 1;
        let random = rand::random();
        self.sync_random_requests.insert(random);
        self.queue_message(MessageBody::SyncRequest(SyncRequest { random }));
    }

    fn send_quality_report(&mut self) {
        self.running_last_quality_report = Instant::now();
        let frame_advantage = self
            .local_frame_advantage
            .clamp(i8::MIN as i32, i8::MAX as i32) as i8;
        self.queue_message(MessageBody::QualityReport(QualityReport {
            frame_advantage,
            ping: wall_clock_millis(),
        }));
    }

    fn queue_message(&mut self, body: MessageBody) {
        let header = MessageHeader {
            magic: self.magic,
            sequence: self.next_send_sequence,
        };
        self.next_send_sequence = self.next_send_sequence.wrapping_add(1);
        let msg = Message { header, body };

        self.packets_sent += 1;
        self.last_send_time = Instant::now();
        self.bytes_sent += std::mem::size_of_val(&msg);
        self.send_queue.push_back(msg);
    }

    /*
     * receiving
     */

    pub(crate) fn handle_message(&mut self, msg: &Message) {
        if self.state == ProtocolState::Disconnected {
            return;
        }

        // only accept traffic from the magic learned during the handshake
        if self.remote_magic != 0 && msg.header.magic != self.remote_magic {
            self.dropped_packets += 1;
            trace!(
                dropped_so_far = self.dropped_packets,
                "dropping message with wrong magic"
            );
            return;
        }

        // replayed and very stale packets are dropped; frame-indexed payloads
        // make anything else idempotent
        let skipped = msg.header.sequence.wrapping_sub(self.next_recv_sequence);
        if skipped > MAX_SEQUENCE_DISTANCE {
            self.dropped_packets += 1;
            trace!(
                sequence = msg.header.sequence,
                expected = self.next_recv_sequence,
                dropped_so_far = self.dropped_packets,
                "dropping out-of-order message"
            );
            return;
        }
        self.next_recv_sequence = msg.header.sequence.wrapping_add(1);

        self.last_recv_time = Instant::now();
        if self.disconnect_notify_sent && self.state == ProtocolState::Running {
            self.disconnect_notify_sent = false;
            self.event_queue.push_back(Event::NetworkResumed);
        }

        match &msg.body {
            MessageBody::SyncRequest(body) => self.on_sync_request(*body),
            MessageBody::SyncReply(body) => self.on_sync_reply(msg.header, *body),
            MessageBody::Input(body) => self.on_input(body),
            MessageBody::InputAck(body) => self.on_input_ack(*body),
            MessageBody::QualityReport(body) => self.on_quality_report(*body),
            MessageBody::QualityReply(body) => self.on_quality_reply(*body),
            MessageBody::KeepAlive => (),
        }
    }

    fn on_sync_request(&mut self, body: SyncRequest) {
        self.queue_message(MessageBody::SyncReply(SyncReply {
            random: body.random,
        }));
    }

    fn on_sync_reply(&mut self, header: MessageHeader, body: SyncReply) {
        if self.state != ProtocolState::Synchronizing {
            return;
        }
        // only accept echoes of nonces we actually sent
        if !self.sync_random_requests.remove(&body.random) {
            return;
        }

        self.sync_retry_count = 0;
        self.sync_remaining_roundtrips -= 1;
        if self.sync_remaining_roundtrips > 0 {
            self.event_queue.push_back(Event::Synchronizing {
                total: NUM_SYNC_ROUNDTRIPS,
                count: NUM_SYNC_ROUNDTRIPS - self.sync_remaining_roundtrips,
            });
            self.send_sync_request();
        } else {
            self.state = ProtocolState::Running;
            self.event_queue.push_back(Event::Synchronized);
            self.remote_magic = header.magic;
        }
    }

    fn on_input(&mut self, body: &Input) {
        // the piggybacked ack frees everything the peer has seen
        self.pop_pending_output(body.ack_frame);

        if body.disconnect_requested {
            if self.state != ProtocolState::Disconnected && !self.disconnect_event_sent {
                self.event_queue.push_back(Event::Disconnected);
                self.disconnect_event_sent = true;
            }
        } else {
            // merge the sender's view: last_frame only grows, disconnected is sticky
            for (local, remote) in self
                .peer_connect_status
                .iter_mut()
                .zip(body.peer_connect_status.iter())
            {
                local.disconnected = remote.disconnected || local.disconnected;
                local.last_frame = std::cmp::max(local.last_frame, remote.last_frame);
            }
        }

        // a burst starting beyond the next expected frame cannot be decoded
        // (its reference input never arrived); drop and wait for retransmission
        let last_recv_frame = self.last_recv_frame();
        if !last_recv_frame.is_null() && body.start_frame > last_recv_frame + 1 {
            trace!(
                start_frame = body.start_frame.as_i32(),
                last_recv = last_recv_frame.as_i32(),
                "input burst starts past the decodable window"
            );
            return;
        }

        let reference_frame = if last_recv_frame.is_null() {
            Frame::NULL
        } else {
            body.start_frame - 1
        };

        let Some(reference) = self.recv_inputs.get(&reference_frame) else {
            trace!(
                reference = reference_frame.as_i32(),
                "reference input for burst no longer available"
            );
            return;
        };

        self.running_last_input_recv = Instant::now();

        let ticks = match compression::decode(&reference.bytes, &body.bytes) {
            Ok(ticks) => ticks,
            Err(err) => {
                self.dropped_packets += 1;
                warn!("failed to decode input burst: {err}");
                return;
            },
        };

        for (i, bytes) in ticks.into_iter().enumerate() {
            let frame = body.start_frame + i as i32;
            if frame <= self.last_recv_frame() {
                // duplicate of something we already handed to the session
                continue;
            }
            let tick = InputBytes { frame, bytes };
            let player_inputs = tick.to_player_inputs::<T>(self.handles.len());
            self.recv_inputs.insert(frame, tick);
            for (handle_index, input) in player_inputs.into_iter().enumerate() {
                if let Some(&player) = self.handles.get(handle_index) {
                    self.event_queue.push_back(Event::Input { input, player });
                }
            }
        }

        if body.checksum_frame.is_valid() {
            self.event_queue.push_back(Event::Checksum {
                frame: body.checksum_frame,
                checksum: body.checksum,
            });
        }

        self.send_input_ack();

        // drop received inputs that can no longer serve as a decode reference
        let horizon = self
            .last_recv_frame()
            .saturating_sub(INPUT_HISTORY_MULTIPLIER * self.max_prediction as i32);
        self.recv_inputs
            .retain(|&frame, _| frame.is_null() || frame >= horizon);
    }

    fn on_input_ack(&mut self, body: InputAck) {
        self.pop_pending_output(body.ack_frame);
    }

    fn on_quality_report(&mut self, body: QualityReport) {
        self.remote_frame_advantage = body.frame_advantage as i32;
        self.queue_message(MessageBody::QualityReply(QualityReply { pong: body.ping }));
    }

    fn on_quality_reply(&mut self, body: QualityReply) {
        // the pong is our own clock echoed back, so the difference is valid
        // even if the two hosts' clocks disagree
        self.round_trip_time = wall_clock_millis().wrapping_sub(body.pong);
    }

    fn pop_pending_output(&mut self, ack_frame: Frame) {
        while let Some(front) = self.pending_output.front() {
            if front.frame <= ack_frame {
                if let Some(acked) = self.pending_output.pop_front() {
                    self.last_acked_input = acked;
                }
            } else {
                break;
            }
        }
    }

    /// The newest frame an input was received for, [`Frame::NULL`] before the
    /// first input.
    fn last_recv_frame(&self) -> Frame {
        match self.recv_inputs.keys().next_back() {
            Some(&frame) => frame,
            None => Frame::NULL,
        }
    }
}

/// Wall-clock milliseconds, truncated to `u32`. Only used for the ping/pong
/// exchange, where the value is echoed back and differenced against the same
/// clock; wrapping every ~49 days is harmless there.
fn wall_clock_millis() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct TestInput {
        buttons: u8,
    }

    #[derive(Debug, PartialEq)]
    struct TestConfig;

    impl Config for TestConfig {
        type Input = TestInput;
        type State = Vec<u8>;
        type Address = SocketAddr;
    }

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7000)
    }

    fn create_protocol() -> UdpProtocol<TestConfig> {
        UdpProtocol::new(
            vec![PlayerHandle::new(1)],
            test_addr(),
            2,
            1,
            8,
            60,
            ProtocolOptions::default(),
        )
        .unwrap()
    }

    /// Completes the handshake from the protocol's perspective by echoing
    /// every queued sync request.
    fn complete_sync(protocol: &mut UdpProtocol<TestConfig>, remote_magic: u16) {
        for _ in 0..NUM_SYNC_ROUNDTRIPS {
            let random = protocol
                .send_queue
                .iter()
                .rev()
                .find_map(|msg| match &msg.body {
                    MessageBody::SyncRequest(req) => Some(req.random),
                    _ => None,
                })
                .expect("a sync request should be queued");
            protocol.handle_message(&Message {
                header: MessageHeader {
                    magic: remote_magic,
                    sequence: protocol.next_recv_sequence,
                },
                body: MessageBody::SyncReply(SyncReply { random }),
            });
        }
    }

    #[test]
    fn new_protocol_is_initializing() {
        let protocol = create_protocol();
        assert_eq!(protocol.state, ProtocolState::Initializing);
        assert_ne!(protocol.magic, 0);
    }

    #[test]
    fn synchronize_sends_a_request() {
        let mut protocol = create_protocol();
        protocol.synchronize();
        assert_eq!(protocol.state, ProtocolState::Synchronizing);
        assert!(matches!(
            protocol.send_queue.front().map(|msg| &msg.body),
            Some(MessageBody::SyncRequest(_))
        ));
    }

    #[test]
    fn sync_request_is_answered_with_echo() {
        let mut protocol = create_protocol();
        protocol.handle_message(&Message {
            header: MessageHeader {
                magic: 50,
                sequence: 0,
            },
            body: MessageBody::SyncRequest(SyncRequest { random: 42 }),
        });
        assert!(matches!(
            protocol.send_queue.back().map(|msg| &msg.body),
            Some(MessageBody::SyncReply(SyncReply { random: 42 }))
        ));
    }

    #[test]
    fn completed_handshake_reaches_running() {
        let mut protocol = create_protocol();
        protocol.synchronize();
        complete_sync(&mut protocol, 50);
        assert_eq!(protocol.state, ProtocolState::Running);
        assert_eq!(protocol.remote_magic, 50);
        let events: Vec<_> = protocol.poll(&[]).collect();
        assert!(events.contains(&Event::Synchronized));
        let progress = events
            .iter()
            .filter(|event| matches!(event, Event::Synchronizing { .. }))
            .count();
        assert_eq!(progress, NUM_SYNC_ROUNDTRIPS as usize - 1);
    }

    #[test]
    fn sync_reply_with_unknown_nonce_is_ignored() {
        let mut protocol = create_protocol();
        protocol.synchronize();
        protocol.handle_message(&Message {
            header: MessageHeader {
                magic: 50,
                sequence: 0,
            },
            body: MessageBody::SyncReply(SyncReply { random: 123_456 }),
        });
        assert_eq!(protocol.state, ProtocolState::Synchronizing);
        assert_eq!(protocol.sync_remaining_roundtrips, NUM_SYNC_ROUNDTRIPS);
    }

    #[test]
    fn handshake_fails_after_retry_budget() {
        let mut protocol = UdpProtocol::<TestConfig>::new(
            vec![PlayerHandle::new(1)],
            test_addr(),
            2,
            1,
            8,
            60,
            ProtocolOptions {
                sync_retry_interval: Duration::from_millis(0),
                ..ProtocolOptions::default()
            },
        )
        .unwrap();
        protocol.synchronize();
        let mut failed = false;
        for _ in 0..=NUM_SYNC_RETRIES {
            std::thread::sleep(std::time::Duration::from_millis(1));
            failed = protocol
                .poll(&[])
                .any(|event| event == Event::SynchronizationFailed);
            if failed {
                break;
            }
        }
        assert!(failed);
        assert_eq!(protocol.state, ProtocolState::Disconnected);
    }

    #[test]
    fn wrong_magic_is_dropped_after_handshake() {
        let mut protocol = create_protocol();
        protocol.synchronize();
        complete_sync(&mut protocol, 50);

        let before = protocol.dropped_packets;
        protocol.handle_message(&Message {
            header: MessageHeader {
                magic: 51,
                sequence: protocol.next_recv_sequence,
            },
            body: MessageBody::KeepAlive,
        });
        assert_eq!(protocol.dropped_packets, before + 1);
    }

    #[test]
    fn stale_sequence_is_dropped() {
        let mut protocol = create_protocol();
        protocol.synchronize();
        complete_sync(&mut protocol, 50);

        // far in the "past" relative to the next expected sequence number
        let stale = protocol.next_recv_sequence.wrapping_sub(1_000);
        let before = protocol.dropped_packets;
        protocol.handle_message(&Message {
            header: MessageHeader {
                magic: 50,
                sequence: stale,
            },
            body: MessageBody::KeepAlive,
        });
        assert_eq!(protocol.dropped_packets, before + 1);
    }

    #[test]
    fn quality_report_triggers_reply_and_stores_advantage() {
        let mut protocol = create_protocol();
        protocol.synchronize();
        complete_sync(&mut protocol, 50);

        protocol.handle_message(&Message {
            header: MessageHeader {
                magic: 50,
                sequence: protocol.next_recv_sequence,
            },
            body: MessageBody::QualityReport(QualityReport {
                frame_advantage: 4,
                ping: 111,
            }),
        });
        assert_eq!(protocol.remote_frame_advantage, 4);
        assert!(matches!(
            protocol.send_queue.back().map(|msg| &msg.body),
            Some(MessageBody::QualityReply(QualityReply { pong: 111 }))
        ));
    }

    #[test]
    fn input_ack_pops_pending_output() {
        let mut protocol = create_protocol();
        protocol.synchronize();
        complete_sync(&mut protocol, 50);

        let status = vec![ConnectionStatus::default(); 2];
        for frame in 0..3i32 {
            let mut inputs = BTreeMap::new();
            inputs.insert(
                PlayerHandle::new(0),
                PlayerInput::new(Frame::new(frame), TestInput { buttons: 7 }),
            );
            protocol.send_input(&inputs, &status).unwrap();
        }
        assert_eq!(protocol.pending_output.len(), 3);

        protocol.handle_message(&Message {
            header: MessageHeader {
                magic: 50,
                sequence: protocol.next_recv_sequence,
            },
            body: MessageBody::InputAck(InputAck {
                ack_frame: Frame::new(1),
            }),
        });
        assert_eq!(protocol.pending_output.len(), 1);
        assert_eq!(protocol.last_acked_input.frame, Frame::new(1));
    }

    #[test]
    fn send_input_does_nothing_before_running() {
        let mut protocol = create_protocol();
        let mut inputs = BTreeMap::new();
        inputs.insert(
            PlayerHandle::new(0),
            PlayerInput::new(Frame::new(0), TestInput { buttons: 1 }),
        );
        protocol.send_input(&inputs, &[]).unwrap();
        assert!(protocol.pending_output.is_empty());
        assert!(protocol.send_queue.is_empty());
    }

    #[test]
    fn received_input_burst_emits_input_events() {
        // two endpoints talking to each other: a sends inputs, b receives
        let mut a = create_protocol();
        let mut b = create_protocol();
        a.synchronize();
        b.synchronize();
        complete_sync(&mut a, b.magic);
        complete_sync(&mut b, a.magic);
        a.send_queue.clear();
        b.send_queue.clear();
        a.next_recv_sequence = b.next_send_sequence;
        b.next_recv_sequence = a.next_send_sequence;

        let status = vec![ConnectionStatus::default(); 2];
        for frame in 0..3i32 {
            let mut inputs = BTreeMap::new();
            inputs.insert(
                PlayerHandle::new(0),
                PlayerInput::new(Frame::new(frame), TestInput {
                    buttons: frame as u8 + 1,
                }),
            );
            a.send_input(&inputs, &status).unwrap();
        }

        let outbound: Vec<_> = a.send_queue.drain(..).collect();
        for msg in &outbound {
            b.handle_message(msg);
        }

        let events: Vec<_> = b.poll(&status).collect();
        let received: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                Event::Input { input, player } => Some((*player, input.frame, input.input.buttons)),
                _ => None,
            })
            .collect();
        assert_eq!(
            received,
            vec![
                (PlayerHandle::new(1), Frame::new(0), 1),
                (PlayerHandle::new(1), Frame::new(1), 2),
                (PlayerHandle::new(1), Frame::new(2), 3),
            ]
        );
        // the receiver acknowledged the burst
        assert!(b
            .send_queue
            .iter()
            .any(|msg| matches!(&msg.body, MessageBody::InputAck(ack) if ack.ack_frame == Frame::new(2))));
    }

    #[test]
    fn connection_status_merge_is_monotone_and_sticky() {
        let mut protocol = create_protocol();
        protocol.synchronize();
        complete_sync(&mut protocol, 50);

        let make_input = |status: Vec<ConnectionStatus>| {
            MessageBody::Input(Input {
                peer_connect_status: status,
                start_frame: Frame::new(90),
                ..Input::default()
            })
        };

        protocol.handle_message(&Message {
            header: MessageHeader {
                magic: 50,
                sequence: protocol.next_recv_sequence,
            },
            body: make_input(vec![
                ConnectionStatus {
                    disconnected: true,
                    last_frame: Frame::new(10),
                },
                ConnectionStatus {
                    disconnected: false,
                    last_frame: Frame::new(12),
                },
            ]),
        });
        protocol.handle_message(&Message {
            header: MessageHeader {
                magic: 50,
                sequence: protocol.next_recv_sequence,
            },
            body: make_input(vec![
                ConnectionStatus {
                    disconnected: false,
                    last_frame: Frame::new(5),
                },
                ConnectionStatus {
                    disconnected: false,
                    last_frame: Frame::new(11),
                },
            ]),
        });

        let status0 = protocol.peer_connect_status(PlayerHandle::new(0));
        assert!(status0.disconnected);
        assert_eq!(status0.last_frame, Frame::new(10));
        let status1 = protocol.peer_connect_status(PlayerHandle::new(1));
        assert_eq!(status1.last_frame, Frame::new(12));
    }

    #[test]
    fn checksum_piggyback_surfaces_as_event() {
        let mut a = create_protocol();
        let mut b = create_protocol();
        a.synchronize();
        b.synchronize();
        complete_sync(&mut a, b.magic);
        complete_sync(&mut b, a.magic);
        a.send_queue.clear();
        b.send_queue.clear();
        a.next_recv_sequence = b.next_send_sequence;
        b.next_recv_sequence = a.next_send_sequence;

        a.queue_checksum(Frame::new(0), 0xfeed);
        let status = vec![ConnectionStatus::default(); 2];
        let mut inputs = BTreeMap::new();
        inputs.insert(
            PlayerHandle::new(0),
            PlayerInput::new(Frame::new(0), TestInput { buttons: 1 }),
        );
        a.send_input(&inputs, &status).unwrap();

        let outbound: Vec<_> = a.send_queue.drain(..).collect();
        for msg in &outbound {
            b.handle_message(msg);
        }
        let events: Vec<_> = b.poll(&status).collect();
        assert!(events.contains(&Event::Checksum {
            frame: Frame::new(0),
            checksum: 0xfeed
        }));
    }

    #[test]
    fn network_stats_unavailable_before_handshake() {
        let protocol = create_protocol();
        assert!(matches!(
            protocol.network_stats(),
            Err(PalisadeError::NotSynchronized)
        ));
    }

    #[test]
    fn frame_advantage_accounts_for_half_rtt() {
        let mut protocol = create_protocol();
        protocol.round_trip_time = 100;
        protocol.recv_inputs.insert(
            Frame::new(10),
            InputBytes {
                frame: Frame::new(10),
                bytes: vec![0],
            },
        );
        // estimated remote frame: 10 + 50ms * 60fps / 1000 = 13
        protocol.update_local_frame_advantage(Frame::new(20));
        assert_eq!(protocol.local_frame_advantage, 7);
    }
}
