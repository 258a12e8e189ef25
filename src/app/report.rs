use crate::timing::{Intervals, Phase, Probe, SampleAggregator};
use std::fmt;

pub const HEADER: &str =
    "lport Remote Address        Rsp DTS DNS   TCP   SSL   TConn Srv   Reply Total";

/// One line per probe, aligned under [`HEADER`].
pub struct ProbeLine<'a> {
    pub probe: &'a Probe,
    pub intervals: &'a Intervals,
}

fn local_port(addr: &str) -> &str {
    addr.rsplit(':').next().unwrap_or(addr)
}

impl fmt::Display for ProbeLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = &self.probe.flags;
        write!(
            f,
            "{:<5} {:<21} {:<3} {}{}{}",
            local_port(&flags.local_addr),
            flags.remote_addr,
            flags.status,
            u8::from(flags.dns_coalesced),
            u8::from(flags.connection_reused),
            u8::from(flags.tls_resumed),
        )?;
        for phase in Phase::ALL {
            write!(f, " {:<5.1}", self.intervals.get(phase))?;
        }
        Ok(())
    }
}

/// Summary block: one row per phase, or the reason a row has no numbers.
pub struct SummaryTable<'a>(pub &'a SampleAggregator);

impl fmt::Display for SummaryTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Summary Statistics ---")?;
        writeln!(f, "         Min    Max    Mean   StdDev  Median  MAD")?;
        for (phase, summary) in self.0.summaries() {
            match summary {
                Ok(s) => writeln!(
                    f,
                    "{:<8} {:<6.1} {:<6.1} {:<6.1} {:<7.1} {:<7.1} {:<7.1}",
                    phase.label(),
                    s.min,
                    s.max,
                    s.mean,
                    s.std_dev,
                    s.median,
                    s.mad
                )?,
                Err(e) => writeln!(f, "{:<8} no completed probes ({})", phase.label(), e)?,
            }
        }
        Ok(())
    }
}
