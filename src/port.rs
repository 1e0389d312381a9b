//! Process-global port map.
//!
//! Ports name message-loop endpoints across isolates. The map is the only
//! piece of state shared between isolate threads and is guarded by a
//! mutex; everything that crosses it is an owned, serialized message.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Mutex, OnceLock};

use rand::Rng;

use crate::message_loop::{IsolateMessage, LoopEvent};

pub type Port = i64;

/// Distinguished port id for messages without a destination (the initial
/// message of an isolate).
pub const ILLEGAL_PORT: Port = 0;

pub struct PortMap;

fn map() -> &'static Mutex<HashMap<Port, Sender<LoopEvent>>> {
    static MAP: OnceLock<Mutex<HashMap<Port, Sender<LoopEvent>>>> = OnceLock::new();
    MAP.get_or_init(|| Mutex::new(HashMap::new()))
}

impl PortMap {
    /// Mint a fresh nonzero port id bound to `sender`.
    pub fn create_port(sender: Sender<LoopEvent>) -> Port {
        let mut ports = map().lock().expect("port map");
        let mut rng = rand::thread_rng();
        loop {
            let port: Port = (rng.gen::<u64>() >> 1) as Port;
            if port == ILLEGAL_PORT || ports.contains_key(&port) {
                continue;
            }
            ports.insert(port, sender.clone());
            return port;
        }
    }

    /// Whether the port existed.
    pub fn close_port(port: Port) -> bool {
        map().lock().expect("port map").remove(&port).is_some()
    }

    /// Whether the message was delivered to a live port.
    pub fn post_message(message: IsolateMessage) -> bool {
        let ports = map().lock().expect("port map");
        match ports.get(&message.port) {
            Some(sender) => sender.send(LoopEvent::Message(message)).is_ok(),
            None => false,
        }
    }
}
