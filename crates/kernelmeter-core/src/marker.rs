//! Marker pipe demultiplexer.
//!
//! Owns the named pipe, tokenizes its byte stream, and dispatches typed
//! events to whichever counters are currently armed. Runs its token-reading
//! and 60-second refresh timer on two background threads that both publish
//! onto a single event channel — no process-global mutable flags, per the
//! message-passing redesign of the original callback-driven implementation.

use crate::pulse::PulseEmitter;
use crate::socket::SocketCounter;
use crate::timer::TimerCounter;
use log::{debug, warn};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// A parsed marker-pipe token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Begin(String),
    End,
    DisarmScope,
    DisarmSocket,
    DisarmTimer,
    Empty,
    Unknown(String),
}

/// Classify a single token (the bytes between two `;` delimiters).
pub fn classify(token: &str) -> Token {
    if token.is_empty() {
        Token::Empty
    } else if let Some(name) = token.strip_prefix("B:") {
        let name = if name.is_empty() { "unknown" } else { name };
        Token::Begin(name.to_string())
    } else if token == "E" {
        Token::End
    } else if token == "SS" {
        Token::DisarmScope
    } else if token == "SR" {
        Token::DisarmSocket
    } else if token == "ST" {
        Token::DisarmTimer
    } else {
        Token::Unknown(token.to_string())
    }
}

enum Event {
    Token(Token),
    Refresh,
}

/// Shared armed/measuring state, checked by the dispatch loop and flipped
/// by the RPC layer's arm/disarm handlers.
#[derive(Default)]
pub struct ArmState {
    pub socket_armed: AtomicBool,
    pub timer_armed: AtomicBool,
    pub scope_armed: AtomicBool,
    pub measuring: AtomicBool,
}

impl ArmState {
    /// Transition false -> true; returns whether this call performed it.
    pub fn arm(flag: &AtomicBool) -> bool {
        !flag.swap(true, Ordering::SeqCst)
    }

    /// Transition to false; idempotent, always returns true.
    pub fn disarm(flag: &AtomicBool) -> bool {
        flag.store(false, Ordering::SeqCst);
        true
    }

    pub fn all_disarmed(&self) -> bool {
        !self.socket_armed.load(Ordering::SeqCst)
            && !self.timer_armed.load(Ordering::SeqCst)
            && !self.scope_armed.load(Ordering::SeqCst)
    }
}

pub struct MarkerDemultiplexer<P: PulseEmitter> {
    fifo_path: String,
    socket: Arc<Mutex<SocketCounter>>,
    timer: Arc<Mutex<TimerCounter>>,
    pulse: Arc<Mutex<P>>,
    arm_state: Arc<ArmState>,
}

impl<P: PulseEmitter + 'static> MarkerDemultiplexer<P> {
    pub fn new(
        fifo_path: String,
        socket: Arc<Mutex<SocketCounter>>,
        timer: Arc<Mutex<TimerCounter>>,
        pulse: Arc<Mutex<P>>,
        arm_state: Arc<ArmState>,
    ) -> Self {
        Self {
            fifo_path,
            socket,
            timer,
            pulse,
            arm_state,
        }
    }

    /// Create the FIFO if it doesn't already exist, world read-write.
    fn ensure_fifo(path: &str) -> std::io::Result<()> {
        if std::path::Path::new(path).exists() {
            return Ok(());
        }
        let c_path = std::ffi::CString::new(path).map_err(|_| {
            std::io::Error::new(ErrorKind::InvalidInput, "fifo path contains a NUL byte")
        })?;
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Run the demultiplexer until every source is disarmed. Spawns a pipe
    /// reader thread and a refresh-ticker thread, both of which publish
    /// [`Event`]s onto a shared channel that this call drains.
    pub fn run(&self) {
        if let Err(e) = Self::ensure_fifo(&self.fifo_path) {
            warn!("marker pipe {}: {}", self.fifo_path, e);
        }

        let (tx, rx): (Sender<Event>, Receiver<Event>) = mpsc::channel();

        let reader_tx = tx.clone();
        let reader_path = self.fifo_path.clone();
        let reader_arm = self.arm_state.clone();
        std::thread::spawn(move || Self::read_loop(&reader_path, reader_tx, reader_arm));

        let ticker_tx = tx;
        let ticker_arm = self.arm_state.clone();
        std::thread::spawn(move || loop {
            std::thread::sleep(REFRESH_INTERVAL);
            if ticker_arm.all_disarmed() {
                return;
            }
            if ticker_tx.send(Event::Refresh).is_err() {
                return;
            }
        });

        while let Ok(event) = rx.recv() {
            match event {
                Event::Token(token) => self.dispatch(token),
                Event::Refresh => self.refresh(),
            }
            if self.arm_state.all_disarmed() {
                break;
            }
        }
    }

    fn read_loop(path: &str, tx: Sender<Event>, arm_state: Arc<ArmState>) {
        loop {
            if arm_state.all_disarmed() {
                return;
            }
            let file = match File::open(path) {
                Ok(f) => f,
                Err(e) => {
                    warn!("marker pipe {path}: open failed: {e}");
                    std::thread::sleep(Duration::from_millis(200));
                    continue;
                }
            };
            if let Err(e) = Self::drain(file, &tx) {
                warn!("marker pipe {path}: read failed, reopening: {e}");
            }
            if arm_state.all_disarmed() {
                return;
            }
        }
    }

    fn drain(mut file: File, tx: &Sender<Event>) -> std::io::Result<()> {
        let mut token = String::new();
        let mut byte = [0u8; 1];
        loop {
            let n = file.read(&mut byte)?;
            if n == 0 {
                return Ok(()); // writer closed; caller reopens
            }
            if byte[0] == b';' {
                let parsed = classify(&token);
                token.clear();
                if tx.send(Event::Token(parsed)).is_err() {
                    return Ok(());
                }
            } else {
                token.push(byte[0] as char);
            }
        }
    }

    fn dispatch(&self, token: Token) {
        match token {
            Token::Begin(name) => {
                let measuring_already = self.arm_state.measuring.swap(true, Ordering::SeqCst);
                let _ = measuring_already;
                if self.arm_state.socket_armed.load(Ordering::SeqCst) {
                    self.socket.lock().unwrap().calculate(&name, true);
                }
                if self.arm_state.timer_armed.load(Ordering::SeqCst) {
                    self.timer.lock().unwrap().calculate(&name, true);
                }
                if self.arm_state.scope_armed.load(Ordering::SeqCst) {
                    if let Err(e) = self.pulse.lock().unwrap().raise() {
                        warn!("kernel {name}: pulse raise failed: {e}");
                    }
                }
            }
            Token::End => {
                if !self.arm_state.measuring.swap(false, Ordering::SeqCst) {
                    return;
                }
                if self.arm_state.socket_armed.load(Ordering::SeqCst) {
                    self.socket.lock().unwrap().calculate("", false);
                }
                if self.arm_state.timer_armed.load(Ordering::SeqCst) {
                    self.timer.lock().unwrap().calculate("", false);
                }
                if self.arm_state.scope_armed.load(Ordering::SeqCst) {
                    if let Err(e) = self.pulse.lock().unwrap().lower() {
                        warn!("pulse lower failed: {e}");
                    }
                }
            }
            Token::DisarmScope => {
                ArmState::disarm(&self.arm_state.scope_armed);
            }
            Token::DisarmSocket => {
                ArmState::disarm(&self.arm_state.socket_armed);
            }
            Token::DisarmTimer => {
                ArmState::disarm(&self.arm_state.timer_armed);
            }
            Token::Empty => {}
            Token::Unknown(raw) => {
                debug!("marker pipe: ignoring unrecognized token {raw:?}");
            }
        }
    }

    /// A refresh sample: only takes effect while the socket source is armed
    /// and a kernel is in flight (see SPEC_FULL.md §4's refresh-timer gate).
    /// `pub(crate)` so tests can drive it directly instead of waiting out
    /// the real 60-second ticker in [`Self::run`].
    pub(crate) fn refresh(&self) {
        if !self.arm_state.socket_armed.load(Ordering::SeqCst) {
            return;
        }
        if !self.arm_state.measuring.load(Ordering::SeqCst) {
            return;
        }
        self.socket.lock().unwrap().calculate("", false);
    }
}
