//! Scripted in-memory bed used by the unit tests.

use super::error::BleError;
use super::protocol::{self, BedCommand};
use super::transport::{Advertisement, BleBackend, BleLink};
use crate::domain::models::{MacAddress, Pin};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const ACCEPTED: [u8; 8] = [0x40, 0x21, 0x43, 0x00, 0x01, 0x1A, 0x01, 0x40];
pub const REJECTED: [u8; 8] = [0x40, 0x21, 0x43, 0x00, 0x01, 0x1B, 0x00, 0x40];
pub const NO_PIN: [u8; 8] = [0x40, 0x21, 0x43, 0x00, 0x01, 0x1F, 0x00, 0x40];

pub fn bed_address() -> MacAddress {
    MacAddress::new([0xF6, 0x21, 0xDD, 0xDD, 0x6F, 0x19])
}

#[derive(Debug, Clone, Copy)]
pub enum ConnectFault {
    Timeout,
    MissingCharacteristic,
}

struct LinkState {
    connected: bool,
    subscribers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
}

struct WriteFault {
    frame: Vec<u8>,
    nth: usize,
    seen: usize,
}

struct FakeState {
    advertised: Vec<Advertisement>,
    visible: bool,
    device_pin: Option<Pin>,
    enforces_pin: bool,
    notify: bool,
    disconnect_on_wrong_pin: bool,
    yield_on_lookup: bool,
    connect_faults: VecDeque<ConnectFault>,
    write_faults: Vec<WriteFault>,
    links: Vec<LinkState>,
    frames: Vec<(Instant, Vec<u8>)>,
    connects: usize,
    disconnects: usize,
}

/// Fake bed plus adapter. Cloning shares the same scripted device.
#[derive(Clone)]
pub struct FakeBed {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBed {
    /// A visible bed named `RC2` with PIN `1234` that answers with notifications.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                advertised: vec![Advertisement {
                    name: Some("RC2".to_string()),
                    address: bed_address(),
                }],
                visible: true,
                device_pin: Some(Pin::normalize("1234")),
                enforces_pin: true,
                notify: true,
                disconnect_on_wrong_pin: false,
                yield_on_lookup: false,
                connect_faults: VecDeque::new(),
                write_faults: Vec::new(),
                links: Vec::new(),
                frames: Vec::new(),
                connects: 0,
                disconnects: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_advertised(&self, advertised: Vec<Advertisement>) {
        self.state().advertised = advertised;
    }

    pub fn set_visible(&self, visible: bool) {
        self.state().visible = visible;
    }

    pub fn set_device_pin(&self, pin: Option<&str>) {
        self.state().device_pin = pin.map(Pin::normalize);
    }

    pub fn set_enforces_pin(&self, enforces: bool) {
        self.state().enforces_pin = enforces;
    }

    pub fn set_notify(&self, notify: bool) {
        self.state().notify = notify;
    }

    pub fn set_disconnect_on_wrong_pin(&self, disconnect: bool) {
        self.state().disconnect_on_wrong_pin = disconnect;
    }

    /// Make presence checks suspend once, like a real adapter query.
    pub fn set_yield_on_lookup(&self, yield_on_lookup: bool) {
        self.state().yield_on_lookup = yield_on_lookup;
    }

    pub fn fail_next_connects(&self, fault: ConnectFault, count: usize) {
        let mut state = self.state();
        for _ in 0..count {
            state.connect_faults.push_back(fault);
        }
    }

    /// Fail the `nth` (1-based) write of `frame` with a missing-characteristic error.
    pub fn fail_write(&self, frame: &[u8], nth: usize) {
        self.state().write_faults.push(WriteFault {
            frame: frame.to_vec(),
            nth,
            seen: 0,
        });
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state().frames.iter().map(|(_, f)| f.clone()).collect()
    }

    pub fn timed_frames(&self) -> Vec<(Instant, Vec<u8>)> {
        self.state().frames.clone()
    }

    pub fn count(&self, frame: &[u8]) -> usize {
        self.state().frames.iter().filter(|(_, f)| f == frame).count()
    }

    pub fn clear_frames(&self) {
        self.state().frames.clear();
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    pub fn open_links(&self) -> usize {
        self.state().links.iter().filter(|l| l.connected).count()
    }

    /// Push an unsolicited notification to every subscriber.
    pub fn notify_all(&self, bytes: &[u8]) {
        let state = self.state();
        for link in &state.links {
            for tx in &link.subscribers {
                let _ = tx.send(bytes.to_vec());
            }
        }
    }
}

fn respond(state: &mut FakeState, link: usize, frame: &[u8]) {
    let keep_alive_prefix = &protocol::keep_alive_frame(&Pin::default())[..6];
    let set_pin_prefix = &protocol::set_pin_frame(&Pin::default())[..8];

    let reply: Option<Vec<u8>> = if frame.len() == 11 && frame.starts_with(keep_alive_prefix) {
        let sent = Pin::normalize(
            &frame[6..10]
                .iter()
                .map(|d| char::from(b'0' + d))
                .collect::<String>(),
        );
        match state.device_pin {
            None => Some(NO_PIN.to_vec()),
            Some(pin) if pin == sent => Some(ACCEPTED.to_vec()),
            Some(_) if !state.enforces_pin => None,
            Some(_) if state.disconnect_on_wrong_pin => {
                state.links[link].connected = false;
                state.links[link].subscribers.clear();
                return;
            }
            Some(_) => Some(REJECTED.to_vec()),
        }
    } else if frame.starts_with(set_pin_prefix) {
        let digits: String = frame[8..12].iter().map(|d| char::from(b'0' + d)).collect();
        state.device_pin = Some(Pin::normalize(&digits));
        Some(ACCEPTED.to_vec())
    } else if frame == BedCommand::AppInit.as_bytes() {
        None
    } else if frame.len() >= 3 && frame[1] == 0x20 {
        // Echo unknown request opcodes with a non-classifying status
        Some(vec![0x40, 0x21, frame[2], 0x00, 0x01, 0x55, 0x40])
    } else {
        None
    };

    if let (Some(reply), true) = (reply, state.notify) {
        for tx in &state.links[link].subscribers {
            let _ = tx.send(reply.clone());
        }
    }
}

#[async_trait]
impl BleBackend for FakeBed {
    async fn is_present(&self, address: &MacAddress) -> bool {
        let yield_first = self.state().yield_on_lookup;
        if yield_first {
            tokio::task::yield_now().await;
        }
        let state = self.state();
        state.visible && state.advertised.iter().any(|a| a.address == *address)
    }

    async fn discovered(&self) -> Result<Vec<Advertisement>, BleError> {
        let state = self.state();
        if !state.visible {
            return Ok(Vec::new());
        }
        Ok(state.advertised.clone())
    }

    async fn connect(
        &self,
        address: &MacAddress,
        timeout: Duration,
    ) -> Result<Arc<dyn BleLink>, BleError> {
        let fault = {
            let mut state = self.state();
            if !state.visible || !state.advertised.iter().any(|a| a.address == *address) {
                return Err(BleError::DeviceNotVisible(*address));
            }
            state.connect_faults.pop_front()
        };

        match fault {
            Some(ConnectFault::Timeout) => {
                tokio::time::sleep(timeout).await;
                Err(BleError::ConnectionTimeout(*address))
            }
            Some(ConnectFault::MissingCharacteristic) => Err(BleError::CharacteristicNotFound),
            None => {
                let mut state = self.state();
                state.connects += 1;
                state.links.push(LinkState {
                    connected: true,
                    subscribers: Vec::new(),
                });
                let id = state.links.len() - 1;
                Ok(Arc::new(FakeLink {
                    id,
                    bed: self.clone(),
                }))
            }
        }
    }
}

struct FakeLink {
    id: usize,
    bed: FakeBed,
}

#[async_trait]
impl BleLink for FakeLink {
    async fn write(&self, frame: &[u8]) -> Result<(), BleError> {
        let mut state = self.bed.state();
        if !state.links[self.id].connected {
            return Err(BleError::NotConnected);
        }

        let mut failed = false;
        for fault in state.write_faults.iter_mut() {
            if fault.frame == frame {
                fault.seen += 1;
                if fault.seen == fault.nth {
                    failed = true;
                }
            }
        }
        if failed {
            return Err(BleError::CharacteristicNotFound);
        }

        state.frames.push((Instant::now(), frame.to_vec()));
        respond(&mut state, self.id, frame);
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, BleError> {
        let mut state = self.bed.state();
        if !state.links[self.id].connected {
            return Err(BleError::NotConnected);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.links[self.id].subscribers.push(tx);
        Ok(rx)
    }

    async fn is_connected(&self) -> bool {
        self.bed.state().links[self.id].connected
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        let mut state = self.bed.state();
        if !state.links[self.id].connected {
            return Err(BleError::NotConnected);
        }
        state.links[self.id].connected = false;
        state.links[self.id].subscribers.clear();
        state.disconnects += 1;
        Ok(())
    }
}
