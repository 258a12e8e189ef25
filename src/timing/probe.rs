use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// A point in a probe's lifecycle at which an instant may be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    Start,
    ConnectionRequest,
    ConnectionObtained,
    FirstResponseByte,
    DnsStart,
    DnsDone,
    ConnectStart,
    ConnectDone,
    RequestWritten,
    End,
}

impl Checkpoint {
    pub fn name(self) -> &'static str {
        match self {
            Checkpoint::Start => "start",
            Checkpoint::ConnectionRequest => "connection-request",
            Checkpoint::ConnectionObtained => "connection-obtained",
            Checkpoint::FirstResponseByte => "first-response-byte",
            Checkpoint::DnsStart => "dns-start",
            Checkpoint::DnsDone => "dns-done",
            Checkpoint::ConnectStart => "connect-start",
            Checkpoint::ConnectDone => "connect-done",
            Checkpoint::RequestWritten => "request-written",
            Checkpoint::End => "end",
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Instants recorded for one probe. `None` means the event never happened.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Instants {
    pub start: Option<Instant>,
    pub connection_request: Option<Instant>,
    pub connection_obtained: Option<Instant>,
    pub first_response_byte: Option<Instant>,
    pub dns_start: Option<Instant>,
    pub dns_done: Option<Instant>,
    pub connect_start: Option<Instant>,
    pub connect_done: Option<Instant>,
    pub request_written: Option<Instant>,
    pub end: Option<Instant>,
}

impl Instants {
    pub fn get(&self, checkpoint: Checkpoint) -> Option<Instant> {
        *self.slot(checkpoint)
    }

    fn slot(&self, checkpoint: Checkpoint) -> &Option<Instant> {
        match checkpoint {
            Checkpoint::Start => &self.start,
            Checkpoint::ConnectionRequest => &self.connection_request,
            Checkpoint::ConnectionObtained => &self.connection_obtained,
            Checkpoint::FirstResponseByte => &self.first_response_byte,
            Checkpoint::DnsStart => &self.dns_start,
            Checkpoint::DnsDone => &self.dns_done,
            Checkpoint::ConnectStart => &self.connect_start,
            Checkpoint::ConnectDone => &self.connect_done,
            Checkpoint::RequestWritten => &self.request_written,
            Checkpoint::End => &self.end,
        }
    }

    fn slot_mut(&mut self, checkpoint: Checkpoint) -> &mut Option<Instant> {
        match checkpoint {
            Checkpoint::Start => &mut self.start,
            Checkpoint::ConnectionRequest => &mut self.connection_request,
            Checkpoint::ConnectionObtained => &mut self.connection_obtained,
            Checkpoint::FirstResponseByte => &mut self.first_response_byte,
            Checkpoint::DnsStart => &mut self.dns_start,
            Checkpoint::DnsDone => &mut self.dns_done,
            Checkpoint::ConnectStart => &mut self.connect_start,
            Checkpoint::ConnectDone => &mut self.connect_done,
            Checkpoint::RequestWritten => &mut self.request_written,
            Checkpoint::End => &mut self.end,
        }
    }

    /// Records `at` unless the checkpoint already fired. Returns whether it was stored.
    pub fn mark(&mut self, checkpoint: Checkpoint, at: Instant) -> bool {
        let slot = self.slot_mut(checkpoint);
        if slot.is_some() {
            return false;
        }
        *slot = Some(at);
        true
    }
}

/// Per-probe facts that are not instants.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProbeFlags {
    pub connection_reused: bool,
    pub tls_used: bool,
    pub tls_resumed: bool,
    pub dns_coalesced: bool,
    pub status: u16,
    pub local_addr: String,
    pub remote_addr: String,
}

/// One request attempt: what happened and when.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Probe {
    pub instants: Instants,
    pub flags: ProbeFlags,
}

impl Probe {
    pub fn is_finished(&self) -> bool {
        self.instants.end.is_some()
    }
}

/// Lifecycle hooks a transport invokes while it executes a request.
///
/// Each hook is called synchronously at the moment the event happens and must
/// return quickly without doing I/O.
pub trait Checkpoints {
    fn connection_requested(&self);
    fn connection_obtained(&self, reused: bool, local_addr: &str, remote_addr: &str);
    fn dns_started(&self);
    fn dns_done(&self, coalesced: bool);
    fn connect_started(&self);
    fn connect_done(&self);
    fn request_written(&self);
    fn first_response_byte(&self);
}

#[derive(Debug, Default)]
struct RecorderState {
    probe: Probe,
    finished: bool,
}

/// Shared handle that records checkpoints into a single [`Probe`].
///
/// Hooks may fire on the connection task rather than the task driving the
/// probe; the mutex makes every write visible to the driver once the
/// transport call has returned.
#[derive(Debug, Clone, Default)]
pub struct ProbeRecorder {
    state: Arc<Mutex<RecorderState>>,
}

impl ProbeRecorder {
    /// Starts a probe now.
    pub fn start() -> Self {
        Self::start_at(Instant::now())
    }

    pub fn start_at(at: Instant) -> Self {
        let recorder = Self::default();
        recorder.lock().probe.instants.start = Some(at);
        recorder
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark(&self, checkpoint: Checkpoint) {
        let now = Instant::now();
        let mut state = self.lock();
        if state.finished {
            trace!("Ignoring {} after the probe finished", checkpoint);
            return;
        }
        if state.probe.instants.mark(checkpoint, now) {
            trace!("{}", checkpoint);
        }
    }

    /// Forgets everything but `start` before the next redirect hop, so the
    /// recorded timeline describes the final request.
    pub fn begin_hop(&self) {
        let mut state = self.lock();
        let start = state.probe.instants.start;
        state.probe = Probe::default();
        state.probe.instants.start = start;
    }

    /// Connection security state, known once the response is in.
    pub fn set_tls(&self, tls_used: bool, tls_resumed: bool) {
        let mut state = self.lock();
        state.probe.flags.tls_used = tls_used;
        state.probe.flags.tls_resumed = tls_resumed;
    }

    pub fn set_status(&self, status: u16) {
        self.lock().probe.flags.status = status;
    }

    /// Copy of what has been recorded so far.
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Probe {
        self.lock().probe.clone()
    }

    /// Records `end` and freezes the probe. Later hooks on other clones of
    /// this handle are ignored.
    pub fn finish(self) -> Probe {
        self.finish_at(Instant::now())
    }

    pub fn finish_at(self, at: Instant) -> Probe {
        let mut state = self.lock();
        state.probe.instants.mark(Checkpoint::End, at);
        state.finished = true;
        state.probe.clone()
    }
}

impl Checkpoints for ProbeRecorder {
    fn connection_requested(&self) {
        self.mark(Checkpoint::ConnectionRequest);
    }

    fn connection_obtained(&self, reused: bool, local_addr: &str, remote_addr: &str) {
        let now = Instant::now();
        let mut state = self.lock();
        if state.finished || !state.probe.instants.mark(Checkpoint::ConnectionObtained, now) {
            return;
        }
        state.probe.flags.connection_reused = reused;
        state.probe.flags.local_addr = local_addr.to_string();
        state.probe.flags.remote_addr = remote_addr.to_string();
        trace!("connection-obtained reused={} local={} remote={}", reused, local_addr, remote_addr);
    }

    fn dns_started(&self) {
        self.mark(Checkpoint::DnsStart);
    }

    fn dns_done(&self, coalesced: bool) {
        let now = Instant::now();
        let mut state = self.lock();
        if state.finished || !state.probe.instants.mark(Checkpoint::DnsDone, now) {
            return;
        }
        state.probe.flags.dns_coalesced = coalesced;
    }

    fn connect_started(&self) {
        self.mark(Checkpoint::ConnectStart);
    }

    fn connect_done(&self) {
        self.mark(Checkpoint::ConnectDone);
    }

    fn request_written(&self) {
        self.mark(Checkpoint::RequestWritten);
    }

    fn first_response_byte(&self) {
        self.mark(Checkpoint::FirstResponseByte);
    }
}

/// Slot through which a long-lived connection reports to whichever probe is
/// currently using it.
#[derive(Debug, Clone, Default)]
pub struct ProbeSlot {
    current: Arc<Mutex<Option<ProbeRecorder>>>,
}

impl ProbeSlot {
    fn lock(&self) -> MutexGuard<'_, Option<ProbeRecorder>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attach(&self, recorder: &ProbeRecorder) {
        *self.lock() = Some(recorder.clone());
    }

    pub fn detach(&self) {
        self.lock().take();
    }

    pub fn notify(&self, hook: impl FnOnce(&ProbeRecorder)) {
        if let Some(recorder) = self.lock().as_ref() {
            hook(recorder);
        }
    }
}
