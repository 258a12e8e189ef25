use super::probe::{Checkpoint, Instants, Probe};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Named segments of a probe's timeline, in report order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Dns,
    TcpConnect,
    TlsHandshake,
    ConnectionAcquire,
    ServerProcessing,
    Transfer,
    Total,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Dns,
        Phase::TcpConnect,
        Phase::TlsHandshake,
        Phase::ConnectionAcquire,
        Phase::ServerProcessing,
        Phase::Transfer,
        Phase::Total,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Dns => "dns",
            Phase::TcpConnect => "tcp-connect",
            Phase::TlsHandshake => "tls-handshake",
            Phase::ConnectionAcquire => "connection-acquire",
            Phase::ServerProcessing => "server-processing",
            Phase::Transfer => "transfer",
            Phase::Total => "total",
        }
    }

    /// Short column label used in reports.
    pub fn label(self) -> &'static str {
        match self {
            Phase::Dns => "DNS",
            Phase::TcpConnect => "TCP",
            Phase::TlsHandshake => "SSL",
            Phase::ConnectionAcquire => "TConn",
            Phase::ServerProcessing => "Srv",
            Phase::Transfer => "Reply",
            Phase::Total => "Total",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntervalError {
    #[error("probe is incomplete: checkpoint `{0}` was never recorded")]
    Missing(Checkpoint),
    #[error("{phase} would be negative: `{to}` happened {millis:.3} ms before `{from}`")]
    OutOfOrder {
        phase: Phase,
        from: Checkpoint,
        to: Checkpoint,
        millis: f64,
    },
}

/// Which window measures the TCP connect phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpWindow {
    /// No dial happened for this probe.
    Skipped,
    /// `connect-done - connect-start`, used when no lookup was done.
    FromConnectStart,
    /// `connect-done - dns-done`, so DNS and connect never overlap.
    FromDnsDone,
}

pub fn tcp_connect_window(reused: bool, dns_done: bool, connect_done: bool) -> TcpWindow {
    match (reused, dns_done, connect_done) {
        (true, _, _) | (false, _, false) => TcpWindow::Skipped,
        (false, false, true) => TcpWindow::FromConnectStart,
        (false, true, true) => TcpWindow::FromDnsDone,
    }
}

/// Durations in fractional milliseconds derived from one finished probe.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Intervals {
    pub dns: f64,
    pub tcp_connect: f64,
    pub tls_handshake: f64,
    pub connection_acquire: f64,
    pub server_processing: f64,
    pub transfer: f64,
    pub total: f64,
}

pub fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1e6
}

fn elapsed(
    instants: &Instants,
    phase: Phase,
    from: Checkpoint,
    to: Checkpoint,
) -> Result<f64, IntervalError> {
    let start = instants.get(from).ok_or(IntervalError::Missing(from))?;
    let end = instants.get(to).ok_or(IntervalError::Missing(to))?;
    match end.checked_duration_since(start) {
        Some(duration) => Ok(as_millis_f64(duration)),
        None => Err(IntervalError::OutOfOrder {
            phase,
            from,
            to,
            millis: as_millis_f64(start.duration_since(end)),
        }),
    }
}

impl Intervals {
    /// Derives every interval of `probe`. Phases that did not happen yield 0;
    /// a missing mandatory checkpoint or a negative span is an error.
    pub fn from_probe(probe: &Probe) -> Result<Self, IntervalError> {
        let instants = &probe.instants;
        let reused = probe.flags.connection_reused;

        let dns = match (reused, instants.dns_start, instants.dns_done) {
            (false, Some(_), Some(_)) => {
                elapsed(instants, Phase::Dns, Checkpoint::DnsStart, Checkpoint::DnsDone)?
            }
            _ => 0.0,
        };

        let tcp_connect = match tcp_connect_window(
            reused,
            instants.dns_done.is_some(),
            instants.connect_done.is_some(),
        ) {
            TcpWindow::Skipped => 0.0,
            TcpWindow::FromConnectStart => elapsed(
                instants,
                Phase::TcpConnect,
                Checkpoint::ConnectStart,
                Checkpoint::ConnectDone,
            )?,
            TcpWindow::FromDnsDone => elapsed(
                instants,
                Phase::TcpConnect,
                Checkpoint::DnsDone,
                Checkpoint::ConnectDone,
            )?,
        };

        let tls_handshake = if probe.flags.tls_used && instants.connect_done.is_some() {
            elapsed(
                instants,
                Phase::TlsHandshake,
                Checkpoint::ConnectDone,
                Checkpoint::RequestWritten,
            )?
        } else {
            0.0
        };

        Ok(Intervals {
            dns,
            tcp_connect,
            tls_handshake,
            connection_acquire: elapsed(
                instants,
                Phase::ConnectionAcquire,
                Checkpoint::ConnectionRequest,
                Checkpoint::ConnectionObtained,
            )?,
            server_processing: elapsed(
                instants,
                Phase::ServerProcessing,
                Checkpoint::RequestWritten,
                Checkpoint::FirstResponseByte,
            )?,
            transfer: elapsed(
                instants,
                Phase::Transfer,
                Checkpoint::FirstResponseByte,
                Checkpoint::End,
            )?,
            total: elapsed(instants, Phase::Total, Checkpoint::Start, Checkpoint::End)?,
        })
    }

    pub fn get(&self, phase: Phase) -> f64 {
        match phase {
            Phase::Dns => self.dns,
            Phase::TcpConnect => self.tcp_connect,
            Phase::TlsHandshake => self.tls_handshake,
            Phase::ConnectionAcquire => self.connection_acquire,
            Phase::ServerProcessing => self.server_processing,
            Phase::Transfer => self.transfer,
            Phase::Total => self.total,
        }
    }
}
