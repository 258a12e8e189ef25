use crate::app::report::{ProbeLine, SummaryTable, HEADER};
use crate::cli::app_config::Cli;
use crate::http::{HttpTransport, RequestTemplate, Transport, TransportSettings};
use crate::timing::{
    Checkpoint, IntervalError, Intervals, Probe, ProbeRecorder, SampleAggregator,
};
use crate::tls::client_config;
use clap::Parser;
use std::io::Write;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// What to do when a repetition fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Print the summary of what completed, then stop with the error.
    Abort,
    /// Log the failure and carry on with the next repetition.
    Skip,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub repetitions: usize,
    pub wait: Duration,
    pub failure_policy: FailurePolicy,
}

impl RunSettings {
    pub fn from_cli(cli: &Cli) -> Self {
        RunSettings {
            repetitions: cli.repetitions,
            wait: cli.wait,
            failure_policy: if cli.keep_going {
                FailurePolicy::Skip
            } else {
                FailurePolicy::Abort
            },
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub aggregator: SampleAggregator,
    pub failed: usize,
}

pub async fn main_with_error() -> Result<RunReport, anyhow::Error> {
    let cli: Cli = Cli::parse();
    init_logging(cli.verbosity)?;

    let template = RequestTemplate::from_cli(&cli)?;
    let tls_config = client_config(cli.insecure, cli.cacert.as_deref())?;
    let mut transport = HttpTransport::new(
        template,
        TransportSettings {
            max_redirects: cli.max_redirects,
            proxy: cli.proxy.clone(),
            noproxy: cli.noproxy,
        },
        tls_config,
    );
    let settings = RunSettings::from_cli(&cli);
    let mut stdout = std::io::stdout();
    run(&mut transport, &settings, &mut stdout).await
}

fn init_logging(verbosity: u8) -> Result<(), anyhow::Error> {
    let log_level = match verbosity {
        0 => Level::WARN,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy()
        .add_directive("hyper_util=off".parse()?);
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .without_time()
        .with_level(true)
        .with_target(false)
        .with_span_events(FmtSpan::NONE)
        .with_env_filter(filter)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(())
}

/// Derives the intervals of a finished probe and adds them to the run.
/// A probe that was never finished, or whose instants are unusable, is not
/// aggregated.
pub fn record_probe(
    aggregator: &mut SampleAggregator,
    probe: &Probe,
) -> Result<Intervals, IntervalError> {
    if !probe.is_finished() {
        return Err(IntervalError::Missing(Checkpoint::End));
    }
    let intervals = Intervals::from_probe(probe)?;
    aggregator.add_sample(intervals);
    Ok(intervals)
}

/// Runs one probe to completion: executes the request, then freezes the
/// recorded timeline.
pub async fn probe_once<T: Transport>(transport: &mut T) -> Result<Probe, anyhow::Error> {
    let recorder = ProbeRecorder::start();
    let response = transport.execute(&recorder).await?;
    let probe = recorder.finish();
    trace!("Probe finished: {:?} {:?}", response, probe.flags);
    Ok(probe)
}

/// Executes `settings.repetitions` probes one after another, printing a line
/// per probe and the summary at the end.
pub async fn run<T: Transport, W: Write>(
    transport: &mut T,
    settings: &RunSettings,
    out: &mut W,
) -> Result<RunReport, anyhow::Error> {
    let mut aggregator = SampleAggregator::new();
    let mut failed = 0;

    writeln!(out, "{}", HEADER)?;
    for i in 0..settings.repetitions {
        let outcome = match probe_once(transport).await {
            Ok(probe) => record_probe(&mut aggregator, &probe)
                .map(|intervals| (probe, intervals))
                .map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };
        match outcome {
            Ok((probe, intervals)) => {
                writeln!(
                    out,
                    "{}",
                    ProbeLine {
                        probe: &probe,
                        intervals: &intervals,
                    }
                )?;
                out.flush()?;
            }
            Err(e) => match settings.failure_policy {
                FailurePolicy::Abort => {
                    write!(out, "{}", SummaryTable(&aggregator))?;
                    return Err(e.context(format!(
                        "Repetition {} of {} failed",
                        i + 1,
                        settings.repetitions
                    )));
                }
                FailurePolicy::Skip => {
                    warn!("Repetition {} of {} failed: {:#}", i + 1, settings.repetitions, e);
                    failed += 1;
                }
            },
        }

        if i + 1 < settings.repetitions {
            tokio::time::sleep(settings.wait).await;
        }
    }

    write!(out, "{}", SummaryTable(&aggregator))?;
    if failed > 0 {
        warn!("{} of {} repetitions failed", failed, settings.repetitions);
    }
    Ok(RunReport { aggregator, failed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ProbeResponse;
    use crate::timing::{Checkpoints, Phase};
    use futures::future::BoxFuture;
    use futures::FutureExt;

    /// Walks the recorder through a reused plain-HTTP request, failing on the
    /// listed calls.
    struct ScriptedTransport {
        calls: usize,
        fail_on: Vec<usize>,
    }

    impl Transport for ScriptedTransport {
        fn execute<'a>(
            &'a mut self,
            recorder: &'a ProbeRecorder,
        ) -> BoxFuture<'a, Result<ProbeResponse, anyhow::Error>> {
            async move {
                self.calls += 1;
                if self.fail_on.contains(&self.calls) {
                    return Err(anyhow!("connection refused"));
                }
                recorder.connection_requested();
                recorder.connection_obtained(self.calls > 1, "127.0.0.1:40000", "127.0.0.1:80");
                recorder.request_written();
                recorder.first_response_byte();
                recorder.set_status(204);
                Ok(ProbeResponse {
                    status: 204,
                    tls_used: false,
                    tls_resumed: false,
                })
            }
            .boxed()
        }
    }

    fn settings(repetitions: usize, failure_policy: FailurePolicy) -> RunSettings {
        RunSettings {
            repetitions,
            wait: Duration::ZERO,
            failure_policy,
        }
    }

    #[tokio::test]
    async fn test_run_aggregates_every_probe() {
        let mut transport = ScriptedTransport {
            calls: 0,
            fail_on: vec![],
        };
        let mut out = Vec::new();
        let report = run(&mut transport, &settings(3, FailurePolicy::Abort), &mut out)
            .await
            .unwrap();
        assert_eq!(3, report.aggregator.len());
        assert_eq!(0, report.failed);
        for phase in Phase::ALL {
            assert_eq!(3, report.aggregator.samples(phase).len());
        }
        assert_eq!(&[0.0, 0.0, 0.0], report.aggregator.samples(Phase::Dns));

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(HEADER, lines[0]);
        assert!(lines[1].starts_with("40000 127.0.0.1:80          204 000"));
        assert!(lines[2].starts_with("40000 127.0.0.1:80          204 010"));
        assert_eq!("--- Summary Statistics ---", lines[4]);
    }

    #[tokio::test]
    async fn test_abort_prints_partial_summary() {
        let mut transport = ScriptedTransport {
            calls: 0,
            fail_on: vec![2],
        };
        let mut out = Vec::new();
        let err = run(&mut transport, &settings(3, FailurePolicy::Abort), &mut out)
            .await
            .unwrap_err();
        assert_eq!(2, transport.calls);
        assert!(format!("{:#}", err).contains("Repetition 2 of 3 failed"));
        assert!(format!("{:#}", err).contains("connection refused"));
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("--- Summary Statistics ---"));
        assert!(!text.contains("no completed probes"));
    }

    #[tokio::test]
    async fn test_skip_policy_keeps_going() {
        let mut transport = ScriptedTransport {
            calls: 0,
            fail_on: vec![1, 3],
        };
        let mut out = Vec::new();
        let report = run(&mut transport, &settings(4, FailurePolicy::Skip), &mut out)
            .await
            .unwrap();
        assert_eq!(4, transport.calls);
        assert_eq!(2, report.failed);
        assert_eq!(2, report.aggregator.len());
    }

    #[tokio::test]
    async fn test_all_failed_reports_empty_columns() {
        let mut transport = ScriptedTransport {
            calls: 0,
            fail_on: vec![1, 2],
        };
        let mut out = Vec::new();
        let report = run(&mut transport, &settings(2, FailurePolicy::Skip), &mut out)
            .await
            .unwrap();
        assert!(report.aggregator.is_empty());
        let text = String::from_utf8(out).unwrap();
        assert_eq!(7, text.matches("no completed probes").count());
    }

    #[test]
    fn test_unfinished_probe_is_not_aggregated() {
        let mut aggregator = SampleAggregator::new();
        let recorder = ProbeRecorder::start();
        recorder.connection_requested();
        recorder.connection_obtained(true, "127.0.0.1:40000", "127.0.0.1:80");
        recorder.request_written();
        recorder.first_response_byte();
        let mut probe = recorder.finish();
        probe.instants.end = None;
        assert!(!probe.is_finished());
        assert_eq!(
            IntervalError::Missing(Checkpoint::End),
            record_probe(&mut aggregator, &probe).unwrap_err()
        );
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_broken_probe_is_not_aggregated() {
        let mut aggregator = SampleAggregator::new();
        let probe = Probe::default();
        assert!(record_probe(&mut aggregator, &probe).is_err());
        assert!(aggregator.is_empty());
    }
}
