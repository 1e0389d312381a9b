//! Per-isolate message loop.
//!
//! Incoming messages queue on a channel; the isolate drains them one at a
//! time, running the interpreter to completion for each. Between messages
//! the loop sleeps until the next message or the image-requested wakeup
//! deadline. The loop finishes when the image exits explicitly or when no
//! ports remain open and no wakeup is pending.

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::port::{Port, PortMap};

/// Process-global monotonic epoch, so monotonic times cross isolates.
fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Nanoseconds since the process epoch.
pub fn monotonic_nanos() -> i64 {
    epoch().elapsed().as_nanos() as i64
}

/// A serialized inter-isolate message, or the initial argv message.
pub struct IsolateMessage {
    pub port: Port,
    pub payload: Payload,
}

pub enum Payload {
    Bytes(Vec<u8>),
    Argv(Vec<String>),
}

pub enum LoopEvent {
    Message(IsolateMessage),
    /// Wake the loop so it can observe an interrupt.
    Interrupt,
}

/// What the loop observed while waiting.
pub(crate) enum Wait {
    Message(IsolateMessage),
    Wakeup,
    /// Nothing can arrive anymore: no open ports and no wakeup.
    Quiescent,
    Interrupted,
}

pub struct MessageLoop {
    sender: Sender<LoopEvent>,
    receiver: Receiver<LoopEvent>,
    open_ports: usize,
    wakeup: Option<Instant>,
    exit_code: i64,
    running: bool,
}

impl MessageLoop {
    pub fn new() -> MessageLoop {
        let (sender, receiver) = channel();
        MessageLoop {
            sender,
            receiver,
            open_ports: 0,
            wakeup: None,
            exit_code: 0,
            running: true,
        }
    }

    pub fn sender(&self) -> Sender<LoopEvent> {
        self.sender.clone()
    }

    pub fn post_message(&self, message: IsolateMessage) {
        let _ = self.sender.send(LoopEvent::Message(message));
    }

    pub fn open_port(&mut self) -> Port {
        self.open_ports += 1;
        PortMap::create_port(self.sender.clone())
    }

    pub fn close_port(&mut self, port: Port) {
        if PortMap::close_port(port) {
            self.open_ports -= 1;
        }
    }

    /// Record the wakeup requested when a message dispatch finished.
    /// Zero cancels any wakeup; other values are absolute monotonic nanos.
    pub fn message_epilogue(&mut self, new_wakeup: i64) {
        self.wakeup = if new_wakeup == 0 {
            None
        } else {
            Some(epoch() + Duration::from_nanos(new_wakeup.max(0) as u64))
        };
    }

    pub fn exit(&mut self, exit_code: i64) {
        self.exit_code = exit_code;
        self.running = false;
    }

    pub fn exit_code(&self) -> i64 {
        self.exit_code
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Wake the loop from another thread.
    pub fn interrupt(&self) {
        let _ = self.sender.send(LoopEvent::Interrupt);
    }

    pub(crate) fn wait(&mut self) -> Wait {
        if let Some(deadline) = self.wakeup {
            let now = Instant::now();
            if now >= deadline {
                self.wakeup = None;
                return Wait::Wakeup;
            }
            return match self.receiver.recv_timeout(deadline - now) {
                Ok(LoopEvent::Message(message)) => Wait::Message(message),
                Ok(LoopEvent::Interrupt) => Wait::Interrupted,
                Err(RecvTimeoutError::Timeout) => {
                    self.wakeup = None;
                    Wait::Wakeup
                }
                Err(RecvTimeoutError::Disconnected) => Wait::Quiescent,
            };
        }

        if self.open_ports == 0 {
            // Only already-queued work is possible.
            return match self.receiver.try_recv() {
                Ok(LoopEvent::Message(message)) => Wait::Message(message),
                Ok(LoopEvent::Interrupt) => Wait::Interrupted,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Wait::Quiescent,
            };
        }

        match self.receiver.recv() {
            Ok(LoopEvent::Message(message)) => Wait::Message(message),
            Ok(LoopEvent::Interrupt) => Wait::Interrupted,
            Err(_) => Wait::Quiescent,
        }
    }
}
