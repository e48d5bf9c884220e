//! Shared test infrastructure: a deterministic game stub and an in-memory
//! message-passing socket with a controllable link.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;

use palisade::{
    Config, Frame, GameStateCell, InputVec, Message, NonBlockingSocket, PalisadeRequest,
    RequestVec,
};
use serde::{Deserialize, Serialize};

pub fn test_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

#[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StubInput {
    pub buttons: u32,
}

impl StubInput {
    pub fn new(buttons: u32) -> Self {
        Self { buttons }
    }
}

#[derive(Debug, Copy, Clone, Default, Hash, PartialEq, Eq)]
pub struct StubState {
    pub frame: i32,
    pub state: u64,
}

impl StubState {
    fn advance(&mut self, inputs: &[(StubInput, palisade::InputStatus)]) {
        self.frame += 1;
        for (input, _) in inputs {
            self.state = self
                .state
                .wrapping_mul(31)
                .wrapping_add(u64::from(input.buttons) + 1);
        }
    }
}

pub struct StubConfig;

impl Config for StubConfig {
    type Input = StubInput;
    type State = StubState;
    type Address = SocketAddr;
}

fn hash_state(state: &StubState) -> u64 {
    let mut hasher = DefaultHasher::new();
    state.hash(&mut hasher);
    hasher.finish()
}

/// A deterministic toy simulation fulfilling save/load/advance requests.
#[derive(Default)]
pub struct GameStub {
    pub gs: StubState,
    pub saves: usize,
    pub loads: usize,
    pub advances: usize,
}

impl GameStub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_requests(&mut self, requests: RequestVec<StubConfig>) {
        for request in requests {
            match request {
                PalisadeRequest::SaveGameState { cell, frame } => self.save(cell, frame),
                PalisadeRequest::LoadGameState { cell, .. } => self.load(cell),
                PalisadeRequest::AdvanceFrame { inputs } => self.advance(inputs),
            }
        }
    }

    fn save(&mut self, cell: GameStateCell<StubState>, frame: Frame) {
        assert_eq!(self.gs.frame, frame.as_i32());
        cell.save(frame, Some(self.gs), Some(hash_state(&self.gs)));
        self.saves += 1;
    }

    fn load(&mut self, cell: GameStateCell<StubState>) {
        self.gs = cell.load().expect("the cell should hold a saved state");
        self.loads += 1;
    }

    fn advance(&mut self, inputs: InputVec<StubInput>) {
        self.gs.advance(&inputs);
        self.advances += 1;
    }
}

/// A stub whose reported checksum changes on every save, guaranteeing a
/// sync test failure.
#[derive(Default)]
pub struct NonDeterministicStub {
    pub gs: StubState,
    save_counter: u64,
}

impl NonDeterministicStub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_requests(&mut self, requests: RequestVec<StubConfig>) {
        for request in requests {
            match request {
                PalisadeRequest::SaveGameState { cell, frame } => {
                    self.save_counter += 1;
                    cell.save(frame, Some(self.gs), Some(self.save_counter));
                },
                PalisadeRequest::LoadGameState { cell, .. } => {
                    self.gs = cell.load().expect("the cell should hold a saved state");
                },
                PalisadeRequest::AdvanceFrame { inputs } => self.gs.advance(&inputs),
            }
        }
    }
}

type Inbox = Rc<RefCell<VecDeque<(SocketAddr, Message)>>>;

/// One end of an in-memory network. Delivery is instant and lossless while
/// the link is up; a blocked link swallows everything sent over it.
pub struct InMemorySocket {
    own_addr: SocketAddr,
    inbox: Inbox,
    peers: HashMap<SocketAddr, Inbox>,
    blocked: Rc<Cell<bool>>,
}

impl NonBlockingSocket<SocketAddr> for InMemorySocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        if self.blocked.get() {
            return;
        }
        if let Some(peer_inbox) = self.peers.get(addr) {
            peer_inbox
                .borrow_mut()
                .push_back((self.own_addr, msg.clone()));
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        self.inbox.borrow_mut().drain(..).collect()
    }
}

/// Builds a fully connected in-memory network between the given addresses.
/// The returned flag blocks every link while set.
pub fn in_memory_network(addrs: &[SocketAddr]) -> (Vec<InMemorySocket>, Rc<Cell<bool>>) {
    let blocked = Rc::new(Cell::new(false));
    let inboxes: HashMap<SocketAddr, Inbox> = addrs
        .iter()
        .map(|addr| (*addr, Rc::new(RefCell::new(VecDeque::new()))))
        .collect();
    let sockets = addrs
        .iter()
        .map(|addr| InMemorySocket {
            own_addr: *addr,
            inbox: Rc::clone(&inboxes[addr]),
            peers: inboxes
                .iter()
                .filter(|(peer_addr, _)| *peer_addr != addr)
                .map(|(peer_addr, inbox)| (*peer_addr, Rc::clone(inbox)))
                .collect(),
            blocked: Rc::clone(&blocked),
        })
        .collect();
    (sockets, blocked)
}
