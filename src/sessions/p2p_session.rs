use std::collections::vec_deque::Drain;
use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, trace, warn};

use crate::frame_info::PlayerInput;
use crate::network::messages::ConnectionStatus;
use crate::network::network_stats::NetworkStats;
use crate::network::protocol::Event;
use crate::sessions::player_registry::PlayerRegistry;
use crate::sync_layer::SyncLayer;
use crate::{
    Config, DesyncDetection, Frame, NonBlockingSocket, PalisadeError, PalisadeEvent,
    PalisadeRequest, PlayerHandle, PlayerType, RequestVec, SessionState,
};

/// Events kept before the oldest are dropped; prevents unbounded growth if
/// the host never drains.
pub(crate) const MAX_EVENT_QUEUE_SIZE: usize = 100;
/// Checksums kept per peer for desync comparison.
const MAX_CHECKSUM_HISTORY: usize = 32;

/// A peer-to-peer rollback session: the host's window into input exchange,
/// prediction, rollback scheduling and connection management for one match.
///
/// Every tick of the outer game loop should
/// [`add_local_input`](Self::add_local_input) for each local player, call
/// [`advance_frame`](Self::advance_frame) and fulfill the returned requests
/// in order, then drain [`events`](Self::events).
pub struct P2PSession<T>
where
    T: Config,
{
    num_players: usize,
    /// How many frames the session may run ahead of the last confirmed frame.
    max_prediction: usize,
    sync_layer: SyncLayer<T>,

    /// When a disconnect comes in for a past frame, the frames after it were
    /// simulated with wrong (predicted) inputs and must be replayed.
    disconnect_frame: Frame,

    state: SessionState,

    socket: Box<dyn NonBlockingSocket<T::Address>>,
    player_reg: PlayerRegistry<T>,
    /// This client's own view of every player's connection, propagated to
    /// all peers in outbound input headers.
    local_connect_status: Vec<ConnectionStatus>,

    /// The next confirmed frame to broadcast to spectators.
    next_spectator_frame: Frame,

    event_queue: VecDeque<PalisadeEvent<T>>,
    /// Inputs queued for the upcoming advance, one per local player.
    local_inputs: BTreeMap<PlayerHandle, PlayerInput<T::Input>>,

    // desync detection
    desync_detection: DesyncDetection,
    local_checksum_history: BTreeMap<Frame, u64>,
    remote_checksums: BTreeMap<T::Address, BTreeMap<Frame, u64>>,
    /// The next confirmed frame whose checksum is due for exchange.
    next_checksum_frame: Frame,
}

impl<T: Config> P2PSession<T> {
    pub(crate) fn new(
        num_players: usize,
        max_prediction: usize,
        socket: Box<dyn NonBlockingSocket<T::Address>>,
        players: PlayerRegistry<T>,
        input_delay: usize,
        desync_detection: DesyncDetection,
    ) -> Self {
        let mut sync_layer = SyncLayer::new(num_players, max_prediction);
        for (player_handle, player_type) in players.handles.iter() {
            if matches!(player_type, PlayerType::Local) {
                // handles were validated by the builder
                let _ = sync_layer.set_frame_delay(*player_handle, input_delay);
            }
        }

        // without any endpoints there is nobody to synchronize with
        let state = if players.remotes.is_empty() && players.spectators.is_empty() {
            SessionState::Running
        } else {
            SessionState::Synchronizing
        };

        Self {
            num_players,
            max_prediction,
            sync_layer,
            disconnect_frame: Frame::NULL,
            state,
            socket,
            player_reg: players,
            local_connect_status: vec![ConnectionStatus::default(); num_players],
            next_spectator_frame: Frame::new(0),
            event_queue: VecDeque::new(),
            local_inputs: BTreeMap::new(),
            desync_detection,
            local_checksum_history: BTreeMap::new(),
            remote_checksums: BTreeMap::new(),
            next_checksum_frame: Frame::new(0),
        }
    }

    /// Registers the input of a local player for the current frame. Must be
    /// called for every local player before [`advance_frame`]. Calling it
    /// again for the same player before advancing overwrites the older input.
    ///
    /// # Errors
    /// - [`PalisadeError::NotSynchronized`] while the session is still
    ///   synchronizing.
    /// - [`PalisadeError::InvalidRequest`] if the handle is not a local
    ///   player.
    ///
    /// [`advance_frame`]: Self::advance_frame
    pub fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: T::Input,
    ) -> Result<(), PalisadeError> {
        if self.state != SessionState::Running {
            return Err(PalisadeError::NotSynchronized);
        }
        if !self
            .player_reg
            .local_player_handles()
            .contains(&player_handle)
        {
            return Err(PalisadeError::InvalidRequest {
                info: "the provided handle does not refer to a local player".to_owned(),
            });
        }
        self.local_inputs.insert(
            player_handle,
            PlayerInput::new(self.sync_layer.current_frame(), input),
        );
        Ok(())
    }

    /// Advances the session by one tick and returns the requests the game
    /// must fulfill, in order: a rollback (load + replayed advances and
    /// saves) when a misprediction surfaced, then the advance of one new
    /// frame with its save.
    ///
    /// An empty request list is the prediction barrier: the session is
    /// `max_prediction` frames past the last confirmed frame and must wait
    /// for remote inputs; the current frame does not move.
    ///
    /// # Errors
    /// - [`PalisadeError::NotSynchronized`] while synchronizing.
    /// - [`PalisadeError::MissingInput`] if a local player has not had input
    ///   registered this tick.
    pub fn advance_frame(&mut self) -> Result<RequestVec<T>, PalisadeError> {
        // pump the network first; this may confirm inputs or disconnects
        self.poll_remote_clients();

        if self.state != SessionState::Running {
            return Err(PalisadeError::NotSynchronized);
        }

        for handle in self.player_reg.local_player_handles() {
            if !self.local_inputs.contains_key(&handle) {
                return Err(PalisadeError::MissingInput {
                    player_handle: handle,
                    frame: self.sync_layer.current_frame(),
                });
            }
        }

        // Exchange checksums before anything moves this tick: frames at or
        // below the previously confirmed frame have final saved states, so
        // their checksums are stable on every peer.
        if self.desync_detection != DesyncDetection::Off {
            self.collect_local_checksums();
            self.compare_remote_checksums();
        }

        let mut requests = RequestVec::new();

        // the state at frame 0 is saved once, before anything is simulated
        if self.sync_layer.current_frame() == 0 && self.sync_layer.last_saved_frame().is_null() {
            requests.push(self.sync_layer.save_current_state());
        }

        // adopt disconnects other peers have observed before judging
        // which frames are confirmed
        self.update_player_disconnects();

        let confirmed_frame = self.min_confirmed_frame();

        // roll back if any queue confirmed an input that contradicts a
        // prediction (or a disconnect invalidated predicted frames)
        let first_incorrect = self
            .sync_layer
            .check_simulation_consistency(self.disconnect_frame);
        if !first_incorrect.is_null() {
            self.rollback_to(first_incorrect, &mut requests)?;
            self.disconnect_frame = Frame::NULL;
        }

        // broadcast confirmed inputs to spectators before the input queues
        // discard them
        self.send_confirmed_inputs_to_spectators(confirmed_frame)?;
        self.sync_layer.set_last_confirmed_frame(confirmed_frame);

        self.check_wait_recommendation();

        // feed the queued local inputs into the sync layer and onto the wire
        for handle in self.player_reg.local_player_handles() {
            let player_input =
                self.local_inputs
                    .get_mut(&handle)
                    .ok_or(PalisadeError::MissingInput {
                        player_handle: handle,
                        frame: self.sync_layer.current_frame(),
                    })?;
            let actual_frame = self.sync_layer.add_local_input(handle, *player_input);
            player_input.frame = actual_frame;
            if !actual_frame.is_null() {
                if let Some(status) = self.local_connect_status.get_mut(handle.as_usize()) {
                    status.last_frame = actual_frame;
                }
            }
        }

        // a dropped input means this tick's inputs were already transmitted
        // on an earlier (stalled) tick
        if !self
            .local_inputs
            .values()
            .any(|input| input.frame.is_null())
        {
            for endpoint in self.player_reg.remotes.values_mut() {
                endpoint.send_input(&self.local_inputs, &self.local_connect_status)?;
                endpoint.send_all_messages(&mut self.socket);
            }
        }

        // the prediction barrier: never run more than max_prediction frames
        // past the last confirmed frame
        let frames_ahead =
            self.sync_layer.current_frame() - self.sync_layer.last_confirmed_frame();
        if frames_ahead <= self.max_prediction as i32 {
            let inputs = self
                .sync_layer
                .synchronized_inputs(&self.local_connect_status);
            self.sync_layer.advance_frame();
            self.local_inputs.clear();
            requests.push(PalisadeRequest::AdvanceFrame { inputs });
            requests.push(self.sync_layer.save_current_state());
        } else {
            debug!(
                frame = self.sync_layer.current_frame().as_i32(),
                "prediction barrier reached, stalling"
            );
        }

        Ok(requests)
    }

    /// Pumps the socket, routes messages to the per-peer endpoints, handles
    /// their events and flushes outbound traffic. Called by
    /// [`advance_frame`](Self::advance_frame); call it directly whenever the
    /// game is not advancing (loading screens, pauses) to keep connections
    /// alive.
    pub fn poll_remote_clients(&mut self) {
        for (from_addr, msg) in &self.socket.receive_all_messages() {
            if let Some(endpoint) = self.player_reg.remotes.get_mut(from_addr) {
                endpoint.handle_message(msg);
            }
            if let Some(endpoint) = self.player_reg.spectators.get_mut(from_addr) {
                endpoint.handle_message(msg);
            }
        }

        let current_frame = self.sync_layer.current_frame();
        for endpoint in self.player_reg.remotes.values_mut() {
            if endpoint.is_running() {
                endpoint.update_local_frame_advantage(current_frame);
            }
        }

        let mut events = VecDeque::new();
        for endpoint in self.player_reg.remotes.values_mut() {
            let addr = endpoint.peer_addr();
            for event in endpoint.poll(&self.local_connect_status) {
                events.push_back((event, addr.clone()));
            }
        }
        for endpoint in self.player_reg.spectators.values_mut() {
            let addr = endpoint.peer_addr();
            for event in endpoint.poll(&self.local_connect_status) {
                events.push_back((event, addr.clone()));
            }
        }
        for (event, addr) in events {
            self.handle_event(event, addr);
        }

        for endpoint in self.player_reg.remotes.values_mut() {
            endpoint.send_all_messages(&mut self.socket);
        }
        for endpoint in self.player_reg.spectators.values_mut() {
            endpoint.send_all_messages(&mut self.socket);
        }
    }

    /// Disconnects a remote player (and every other participant sharing its
    /// address). Other peers learn of the disconnect through the status
    /// table in the input headers.
    ///
    /// # Errors
    /// [`PalisadeError::InvalidRequest`] for local players, unknown handles
    /// and already-disconnected players.
    pub fn disconnect_player(&mut self, player_handle: PlayerHandle) -> Result<(), PalisadeError> {
        match self.player_reg.handles.get(&player_handle) {
            None => Err(PalisadeError::InvalidRequest {
                info: "the provided handle does not refer to any player".to_owned(),
            }),
            Some(PlayerType::Local) => Err(PalisadeError::InvalidRequest {
                info: "local players cannot be disconnected".to_owned(),
            }),
            Some(PlayerType::Remote(_)) => {
                let status = self
                    .local_connect_status
                    .get(player_handle.as_usize())
                    .copied()
                    .unwrap_or_default();
                if status.disconnected {
                    return Err(PalisadeError::InvalidRequest {
                        info: "the player is already disconnected".to_owned(),
                    });
                }
                self.disconnect_player_at_frame(player_handle, status.last_frame);
                Ok(())
            },
            Some(PlayerType::Spectator(_)) => {
                self.disconnect_player_at_frame(player_handle, Frame::NULL);
                Ok(())
            },
        }
    }

    /// Connection quality statistics for a remote player or spectator.
    ///
    /// # Errors
    /// [`PalisadeError::InvalidRequest`] if the handle has no endpoint;
    /// [`PalisadeError::NotSynchronized`] before the handshake completed.
    pub fn network_stats(&self, player_handle: PlayerHandle) -> Result<NetworkStats, PalisadeError> {
        let endpoint = match self.player_reg.handles.get(&player_handle) {
            Some(PlayerType::Remote(addr)) => self.player_reg.remotes.get(addr),
            Some(PlayerType::Spectator(addr)) => self.player_reg.spectators.get(addr),
            _ => None,
        };
        endpoint
            .ok_or(PalisadeError::InvalidRequest {
                info: "the provided handle does not refer to a remote player or spectator"
                    .to_owned(),
            })?
            .network_stats()
    }

    /// Changes the frame delay of a local player.
    ///
    /// # Errors
    /// [`PalisadeError::InvalidRequest`] if the handle is not a local player.
    pub fn set_frame_delay(
        &mut self,
        player_handle: PlayerHandle,
        delay: usize,
    ) -> Result<(), PalisadeError> {
        if !self
            .player_reg
            .local_player_handles()
            .contains(&player_handle)
        {
            return Err(PalisadeError::InvalidRequest {
                info: "frame delay can only be set for local players".to_owned(),
            });
        }
        self.sync_layer.set_frame_delay(player_handle, delay)
    }

    /// Drains all events queued since the last call. At most
    /// `MAX_EVENT_QUEUE_SIZE` events are retained; beyond that the oldest
    /// are discarded.
    pub fn events(&mut self) -> Drain<'_, PalisadeEvent<T>> {
        self.event_queue.drain(..)
    }

    /// The current [`SessionState`].
    #[must_use]
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// The frame the session will advance next.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.sync_layer.current_frame()
    }

    /// The highest frame for which authoritative inputs from every connected
    /// player are known. Frames at or below it will never roll back.
    #[must_use]
    pub fn confirmed_frame(&self) -> Frame {
        self.sync_layer.last_confirmed_frame()
    }

    /// The maximum rollback depth of this session.
    #[must_use]
    pub fn max_prediction(&self) -> usize {
        self.max_prediction
    }

    /// The number of players (excluding spectators).
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// The number of registered spectators.
    #[must_use]
    pub fn num_spectators(&self) -> usize {
        self.player_reg.num_spectators()
    }

    /// Handles of all local players.
    #[must_use]
    pub fn local_player_handles(&self) -> Vec<PlayerHandle> {
        self.player_reg.local_player_handles()
    }

    /// Handles of all remote players.
    #[must_use]
    pub fn remote_player_handles(&self) -> Vec<PlayerHandle> {
        self.player_reg.remote_player_handles()
    }

    /// Handles of all registered spectators.
    #[must_use]
    pub fn spectator_handles(&self) -> Vec<PlayerHandle> {
        self.player_reg.spectator_handles()
    }

    /*
     * internals
     */

    fn push_event(&mut self, event: PalisadeEvent<T>) {
        self.event_queue.push_back(event);
        while self.event_queue.len() > MAX_EVENT_QUEUE_SIZE {
            self.event_queue.pop_front();
        }
    }

    fn handle_event(&mut self, event: Event<T>, addr: T::Address) {
        match event {
            Event::Synchronizing { total, count } => {
                self.push_event(PalisadeEvent::Synchronizing { addr, total, count });
            },
            Event::Synchronized => {
                self.push_event(PalisadeEvent::Synchronized { addr });
                self.check_initial_sync();
            },
            Event::SynchronizationFailed => {
                // the endpoint is out of the match before it ever joined
                for handle in self.player_reg.handles_for_address(&addr) {
                    self.disconnect_player_at_frame(handle, Frame::NULL);
                }
                self.push_event(PalisadeEvent::SynchronizationFailed { addr });
                self.check_initial_sync();
            },
            Event::Input { input, player } => {
                let Some(status) = self.local_connect_status.get_mut(player.as_usize()) else {
                    return;
                };
                if status.disconnected {
                    return;
                }
                trace!(
                    player = player.as_usize(),
                    frame = input.frame.as_i32(),
                    "received remote input"
                );
                status.last_frame = std::cmp::max(status.last_frame, input.frame);
                self.sync_layer.add_remote_input(player, input);
            },
            Event::Disconnected => {
                for handle in self.player_reg.handles_for_address(&addr) {
                    let last_frame = self
                        .local_connect_status
                        .get(handle.as_usize())
                        .map_or(Frame::NULL, |status| status.last_frame);
                    self.disconnect_player_at_frame(handle, last_frame);
                }
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
            Event::Checksum { frame, checksum } => {
                let history = self.remote_checksums.entry(addr).or_default();
                history.insert(frame, checksum);
                while history.len() > MAX_CHECKSUM_HISTORY {
                    history.pop_first();
                }
            },
        }
    }

    /// Moves the session to `Running` once every endpoint has finished (or
    /// conclusively failed) its handshake.
    fn check_initial_sync(&mut self) {
        if self.state != SessionState::Synchronizing {
            return;
        }
        let all_done = self
            .player_reg
            .remotes
            .values()
            .chain(self.player_reg.spectators.values())
            .all(|endpoint| endpoint.is_synchronized());
        if all_done {
            self.state = SessionState::Running;
        }
    }

    /// Marks a player as disconnected and schedules the replay of any frames
    /// simulated with inputs predicted past their last confirmed frame.
    fn disconnect_player_at_frame(&mut self, player_handle: PlayerHandle, last_frame: Frame) {
        let Some(player_type) = self.player_reg.handles.get(&player_handle).cloned() else {
            return;
        };
        match player_type {
            PlayerType::Remote(addr) => {
                let affected = self.player_reg.handles_for_address(&addr);
                let already_disconnected = affected.iter().all(|handle| {
                    self.local_connect_status
                        .get(handle.as_usize())
                        .is_some_and(|status| status.disconnected)
                });
                if already_disconnected {
                    return;
                }
                for handle in affected {
                    if let Some(status) = self.local_connect_status.get_mut(handle.as_usize()) {
                        status.disconnected = true;
                    }
                }
                if let Some(endpoint) = self.player_reg.remotes.get_mut(&addr) {
                    endpoint.disconnect();
                }
                // frames after the last authoritative input were predicted
                // and must be replayed with blank (disconnected) inputs
                if !last_frame.is_null() && self.sync_layer.current_frame() > last_frame {
                    let replay_from = last_frame + 1;
                    if self.disconnect_frame.is_null() || replay_from < self.disconnect_frame {
                        self.disconnect_frame = replay_from;
                    }
                }
                self.push_event(PalisadeEvent::Disconnected { addr });
            },
            PlayerType::Spectator(addr) => {
                if let Some(endpoint) = self.player_reg.spectators.get_mut(&addr) {
                    endpoint.disconnect();
                }
                self.push_event(PalisadeEvent::Disconnected { addr });
            },
            PlayerType::Local => (),
        }
        self.check_initial_sync();
    }

    /// Adopts disconnects observed by other peers so every client converges
    /// on the same view.
    fn update_player_disconnects(&mut self) {
        for handle_index in 0..self.num_players {
            let handle = PlayerHandle::new(handle_index);
            let local_status = self
                .local_connect_status
                .get(handle_index)
                .copied()
                .unwrap_or_default();
            if local_status.disconnected {
                continue;
            }
            let observed = self
                .player_reg
                .remotes
                .values()
                .map(|endpoint| endpoint.peer_connect_status(handle))
                .find(|status| status.disconnected);
            if let Some(status) = observed {
                debug!(
                    player = handle_index,
                    frame = status.last_frame.as_i32(),
                    "peer reports player as disconnected"
                );
                self.disconnect_player_at_frame(handle, status.last_frame);
            }
        }
    }

    /// The highest frame every connected player has delivered inputs for.
    fn min_confirmed_frame(&mut self) -> Frame {
        let mut confirmed = Frame::new(i32::MAX);
        let mut any_connected = false;
        for status in &self.local_connect_status {
            if !status.disconnected {
                confirmed = std::cmp::min(confirmed, status.last_frame);
                any_connected = true;
            }
        }
        if !any_connected {
            warn!("all players are disconnected, nothing can be confirmed");
            return Frame::new(0);
        }
        confirmed
    }

    /// Loads the first incorrect frame and replays everything after it with
    /// authoritative inputs: one load, then an advance + save per frame.
    fn rollback_to(
        &mut self,
        first_incorrect: Frame,
        requests: &mut RequestVec<T>,
    ) -> Result<(), PalisadeError> {
        let current_frame = self.sync_layer.current_frame();
        if first_incorrect >= current_frame {
            // the misprediction is at the frame we have not advanced yet;
            // clearing the prediction state is enough
            self.sync_layer.reset_prediction(first_incorrect);
            return Ok(());
        }

        debug!(
            from = first_incorrect.as_i32(),
            to = current_frame.as_i32(),
            "rolling back"
        );
        let replay_count = current_frame - first_incorrect;
        requests.push(self.sync_layer.load_frame(first_incorrect)?);
        self.sync_layer.reset_prediction(first_incorrect);

        for _ in 0..replay_count {
            let inputs = self
                .sync_layer
                .synchronized_inputs(&self.local_connect_status);
            self.sync_layer.advance_frame();
            requests.push(PalisadeRequest::AdvanceFrame { inputs });
            requests.push(self.sync_layer.save_current_state());
        }
        debug_assert_eq!(self.sync_layer.current_frame(), current_frame);
        Ok(())
    }

    fn send_confirmed_inputs_to_spectators(
        &mut self,
        confirmed_frame: Frame,
    ) -> Result<(), PalisadeError> {
        if self.player_reg.spectators.is_empty() {
            return Ok(());
        }
        while self.next_spectator_frame <= confirmed_frame {
            let frame = self.next_spectator_frame;
            let inputs = self
                .sync_layer
                .confirmed_inputs(frame, &self.local_connect_status)?;
            let mut tick = BTreeMap::new();
            for (handle_index, input) in inputs.into_iter().enumerate() {
                tick.insert(
                    PlayerHandle::new(handle_index),
                    PlayerInput::new(frame, input.input),
                );
            }
            for endpoint in self.player_reg.spectators.values_mut() {
                endpoint.send_input(&tick, &self.local_connect_status)?;
            }
            self.next_spectator_frame += 1;
        }
        Ok(())
    }

    fn check_wait_recommendation(&mut self) {
        let current_frame = self.sync_layer.current_frame();
        let mut skip_frames = 0;
        for endpoint in self.player_reg.remotes.values_mut() {
            if endpoint.is_running() {
                skip_frames = skip_frames.max(endpoint.recommend_frame_wait(current_frame));
            }
        }
        if skip_frames > 0 {
            self.push_event(PalisadeEvent::WaitRecommendation { skip_frames });
        }
    }

    /// Records the checksums of newly confirmed frames and queues them for
    /// the peers. Only frames at or below the previously confirmed frame are
    /// collected; their saved states can no longer change.
    fn collect_local_checksums(&mut self) {
        let DesyncDetection::On { interval } = self.desync_detection else {
            return;
        };
        let interval = interval.max(1) as i32;
        let confirmed_frame = self.sync_layer.last_confirmed_frame();
        if confirmed_frame.is_null() {
            return;
        }
        while self.next_checksum_frame <= confirmed_frame {
            let frame = self.next_checksum_frame;
            if let Some(checksum) = self
                .sync_layer
                .saved_state_by_frame(frame)
                .and_then(|cell| cell.checksum())
            {
                self.local_checksum_history.insert(frame, checksum);
                while self.local_checksum_history.len() > MAX_CHECKSUM_HISTORY {
                    self.local_checksum_history.pop_first();
                }
                for endpoint in self.player_reg.remotes.values_mut() {
                    endpoint.queue_checksum(frame, checksum);
                }
            }
            self.next_checksum_frame += interval;
        }
    }

    /// Compares received checksums against the local history, emitting a
    /// [`PalisadeEvent::DesyncDetected`] per mismatch. The session keeps
    /// running either way.
    fn compare_remote_checksums(&mut self) {
        let mut mismatches = Vec::new();
        for (addr, history) in &mut self.remote_checksums {
            let mut compared = Vec::new();
            for (&frame, &remote_checksum) in history.iter() {
                let Some(&local_checksum) = self.local_checksum_history.get(&frame) else {
                    continue;
                };
                compared.push(frame);
                if local_checksum != remote_checksum {
                    warn!(
                        frame = frame.as_i32(),
                        local = local_checksum,
                        remote = remote_checksum,
                        "desync detected"
                    );
                    mismatches.push(PalisadeEvent::DesyncDetected {
                        frame,
                        local_checksum,
                        remote_checksum,
                        addr: addr.clone(),
                    });
                }
            }
            for frame in compared {
                history.remove(&frame);
            }
        }
        for event in mismatches {
            self.push_event(event);
        }
    }
}
