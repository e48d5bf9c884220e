use std::collections::vec_deque::Drain;
use std::collections::VecDeque;

use tracing::warn;

use crate::frame_info::PlayerInput;
use crate::network::messages::ConnectionStatus;
use crate::network::network_stats::NetworkStats;
use crate::network::protocol::{Event, UdpProtocol};
use crate::sessions::p2p_session::MAX_EVENT_QUEUE_SIZE;
use crate::{
    Config, Frame, InputStatus, InputVec, NonBlockingSocket, PalisadeError, PalisadeEvent,
    PalisadeRequest, PlayerHandle, RequestVec, SessionState,
};

/// Frames of host inputs the spectator buffers. The host throttles itself to
/// its confirmed frame, so a healthy spectator stays well within this. The
/// builder keeps `max_frames_behind` below this bound; past it, the inputs a
/// lagging spectator would need for catching up are already overwritten.
pub(crate) const SPECTATOR_BUFFER_SIZE: usize = 60;

/// Replicates a running match by consuming the confirmed inputs one host
/// peer broadcasts. No inputs are contributed, no prediction happens and
/// nothing ever rolls back; [`advance_frame`](Self::advance_frame) yields
/// plain `AdvanceFrame` requests only.
pub struct SpectatorSession<T>
where
    T: Config,
{
    state: SessionState,
    num_players: usize,
    inputs: Vec<Vec<PlayerInput<T::Input>>>,
    host_connect_status: Vec<ConnectionStatus>,
    socket: Box<dyn NonBlockingSocket<T::Address>>,
    host: UdpProtocol<T>,
    host_disconnected: bool,
    event_queue: VecDeque<PalisadeEvent<T>>,
    current_frame: Frame,
    last_recv_frame: Frame,
    max_frames_behind: usize,
    catchup_speed: usize,
}

impl<T: Config> SpectatorSession<T> {
    pub(crate) fn new(
        num_players: usize,
        socket: Box<dyn NonBlockingSocket<T::Address>>,
        host: UdpProtocol<T>,
        max_frames_behind: usize,
        catchup_speed: usize,
    ) -> Self {
        Self {
            state: SessionState::Synchronizing,
            num_players,
            inputs: vec![
                vec![PlayerInput::blank(Frame::NULL); num_players];
                SPECTATOR_BUFFER_SIZE
            ],
            host_connect_status: vec![ConnectionStatus::default(); num_players],
            socket,
            host,
            host_disconnected: false,
            event_queue: VecDeque::new(),
            current_frame: Frame::NULL,
            last_recv_frame: Frame::NULL,
            max_frames_behind,
            catchup_speed,
        }
    }

    /// The current [`SessionState`].
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// The frame the spectator will replicate next.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    /// The number of players in the spectated match.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// How many frames the replication lags behind the newest input received
    /// from the host.
    #[must_use]
    pub fn frames_behind_host(&self) -> usize {
        let behind = self.last_recv_frame - self.current_frame;
        if behind < 0 {
            return 0;
        }
        behind as usize
    }

    /// Connection quality statistics for the host connection.
    ///
    /// # Errors
    /// [`PalisadeError::NotSynchronized`] before the handshake completed.
    pub fn network_stats(&self) -> Result<NetworkStats, PalisadeError> {
        self.host.network_stats()
    }

    /// Drains all events queued since the last call.
    pub fn events(&mut self) -> Drain<'_, PalisadeEvent<T>> {
        self.event_queue.drain(..)
    }

    /// Replicates the next confirmed frame(s). Normally one frame per call;
    /// when the replication has fallen more than `max_frames_behind` frames
    /// behind the host, `catchup_speed` frames are advanced per call until
    /// it has caught up. Frames whose inputs have not arrived yet simply
    /// yield fewer (possibly zero) requests.
    ///
    /// # Errors
    /// - [`PalisadeError::NotSynchronized`] while synchronizing with the host.
    /// - [`PalisadeError::HostDisconnected`] once the host is gone; the
    ///   replication has ended for good.
    /// - [`PalisadeError::SpectatorTooFarBehind`] if needed inputs were
    ///   already overwritten in the buffer.
    pub fn advance_frame(&mut self) -> Result<RequestVec<T>, PalisadeError> {
        self.poll_remote_clients();

        if self.host_disconnected {
            return Err(PalisadeError::HostDisconnected);
        }
        if self.state != SessionState::Running {
            return Err(PalisadeError::NotSynchronized);
        }

        let frames_to_advance = if self.frames_behind_host() > self.max_frames_behind {
            self.catchup_speed
        } else {
            1
        };

        let mut requests = RequestVec::new();
        for _ in 0..frames_to_advance {
            let frame_to_grab = self.current_frame + 1;
            match self.inputs_at_frame(frame_to_grab)? {
                Some(inputs) => {
                    requests.push(PalisadeRequest::AdvanceFrame { inputs });
                    self.current_frame = frame_to_grab;
                },
                // the host has not delivered this frame yet; wait
                None => break,
            }
        }
        Ok(requests)
    }

    /// Pumps the socket and the host endpoint. Called by
    /// [`advance_frame`](Self::advance_frame); call it directly when not
    /// advancing to keep the connection alive.
    pub fn poll_remote_clients(&mut self) {
        for (from_addr, msg) in &self.socket.receive_all_messages() {
            if self.host.is_handling_message(from_addr) {
                self.host.handle_message(msg);
            }
        }

        let addr = self.host.peer_addr();
        let events: Vec<_> = self.host.poll(&self.host_connect_status).collect();
        for event in events {
            self.handle_event(event, addr.clone());
        }

        self.host.send_all_messages(&mut self.socket);
    }

    fn inputs_at_frame(
        &self,
        frame_to_grab: Frame,
    ) -> Result<Option<InputVec<T::Input>>, PalisadeError> {
        let Some(index) = frame_to_grab.ring_index(SPECTATOR_BUFFER_SIZE) else {
            return Err(PalisadeError::InvalidFrame {
                frame: frame_to_grab,
                reason: "spectators replicate non-negative frames only".to_owned(),
            });
        };
        let player_inputs = &self.inputs[index];

        // not arrived yet
        if player_inputs[0].frame < frame_to_grab {
            return Ok(None);
        }
        // the buffer wrapped past this frame; the inputs are gone for good
        if player_inputs[0].frame > frame_to_grab {
            return Err(PalisadeError::SpectatorTooFarBehind);
        }

        Ok(Some(
            player_inputs
                .iter()
                .enumerate()
                .map(|(handle_index, player_input)| {
                    let status = &self.host_connect_status[handle_index];
                    if status.disconnected && status.last_frame < frame_to_grab {
                        (player_input.input, InputStatus::Disconnected)
                    } else {
                        (player_input.input, InputStatus::Confirmed)
                    }
                })
                .collect(),
        ))
    }

    fn handle_event(&mut self, event: Event<T>, addr: T::Address) {
        match event {
            Event::Synchronizing { total, count } => {
                self.push_event(PalisadeEvent::Synchronizing { addr, total, count });
            },
            Event::Synchronized => {
                self.state = SessionState::Running;
                self.push_event(PalisadeEvent::Synchronized { addr });
            },
            Event::SynchronizationFailed => {
                self.host_disconnected = true;
                self.push_event(PalisadeEvent::SynchronizationFailed { addr });
            },
            Event::Disconnected => {
                self.host_disconnected = true;
                self.push_event(PalisadeEvent::Disconnected { addr });
            },
            Event::NetworkInterrupted { disconnect_timeout } => {
                self.push_event(PalisadeEvent::NetworkInterrupted {
                    addr,
                    disconnect_timeout,
                });
            },
            Event::NetworkResumed => {
                self.push_event(PalisadeEvent::NetworkResumed { addr });
            },
            Event::Input { input, player } => {
                if !input.frame.is_valid() || player.as_usize() >= self.num_players {
                    warn!(
                        frame = input.frame.as_i32(),
                        player = player.as_usize(),
                        "dropping malformed host input"
                    );
                    return;
                }
                let Some(index) = input.frame.ring_index(SPECTATOR_BUFFER_SIZE) else {
                    return;
                };
                self.inputs[index][player.as_usize()] = input;
                if input.frame > self.last_recv_frame {
                    self.last_recv_frame = input.frame;
                }
                self.host.update_local_frame_advantage(input.frame);
                for handle_index in 0..self.num_players {
                    self.host_connect_status[handle_index] = self
                        .host
                        .peer_connect_status(PlayerHandle::new(handle_index));
                }
            },
            // spectators have no state to compare checksums against
            Event::Checksum { .. } => (),
        }
    }

    fn push_event(&mut self, event: PalisadeEvent<T>) {
        self.event_queue.push_back(event);
        while self.event_queue.len() > MAX_EVENT_QUEUE_SIZE {
            self.event_queue.pop_front();
        }
    }
}
