//! Built-in processors
//!
//! - `passthrough`: result payload = input payload
//! - `reverse`: result payload = input payload reversed byte-wise
//! - `chaos`: passthrough with injected faults, for exercising crash recovery
//!
//! `chaos` arguments are `key=value` pairs, repeatable:
//!
//! | key        | effect when the record's sequence matches          |
//! |------------|----------------------------------------------------|
//! | `abort-on` | `abort()` the worker process                       |
//! | `exit-on`  | `_exit(17)` without saying goodbye                 |
//! | `stall-on` | sleep forever (simulates a hung worker)            |
//! | `panic-on` | panic inside the processor                         |
//! | `fail-on`  | return a processing error                          |
//! | `delay-ms` | sleep this long before every record                |
//! | `once`     | marker file; faults fire only while it is absent   |

use crate::processor::{EventProcessor, ProcessError, ProcessorDef};
use evtflow_ipc::EventRecord;
use std::path::PathBuf;
use std::time::Duration;

pub(crate) static BUILTINS: [ProcessorDef; 3] = [
    ProcessorDef {
        name: "passthrough",
        description: "emit every payload unchanged",
        factory: build_passthrough,
    },
    ProcessorDef {
        name: "reverse",
        description: "emit every payload with its bytes reversed",
        factory: build_reverse,
    },
    ProcessorDef {
        name: "chaos",
        description: "passthrough with injected crashes, stalls and failures",
        factory: build_chaos,
    },
];

fn build_passthrough(args: &[String]) -> Result<Box<dyn EventProcessor>, ProcessError> {
    reject_args("passthrough", args)?;
    Ok(Box::new(Passthrough))
}

fn build_reverse(args: &[String]) -> Result<Box<dyn EventProcessor>, ProcessError> {
    reject_args("reverse", args)?;
    Ok(Box::new(Reverse))
}

fn build_chaos(args: &[String]) -> Result<Box<dyn EventProcessor>, ProcessError> {
    Ok(Box::new(ChaosProcessor::from_args(args)?))
}

fn reject_args(name: &str, args: &[String]) -> Result<(), ProcessError> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(ProcessError::InvalidArguments(format!(
            "{} takes no arguments, got {:?}",
            name, args
        )))
    }
}

/// Emits every payload unchanged
#[derive(Debug, Default)]
pub struct Passthrough;

impl EventProcessor for Passthrough {
    fn process(&mut self, record: &EventRecord) -> Result<Vec<u8>, ProcessError> {
        Ok(record.payload.clone())
    }
}

/// Emits every payload reversed
#[derive(Debug, Default)]
pub struct Reverse;

impl EventProcessor for Reverse {
    fn process(&mut self, record: &EventRecord) -> Result<Vec<u8>, ProcessError> {
        let mut payload = record.payload.clone();
        payload.reverse();
        Ok(payload)
    }
}

/// Passthrough processor with fault injection
#[derive(Debug, Default)]
pub struct ChaosProcessor {
    abort_on: Vec<u64>,
    exit_on: Vec<u64>,
    stall_on: Vec<u64>,
    panic_on: Vec<u64>,
    fail_on: Vec<u64>,
    delay: Option<Duration>,
    once: Option<PathBuf>,
}

impl ChaosProcessor {
    /// Parse `key=value` arguments
    pub fn from_args(args: &[String]) -> Result<Self, ProcessError> {
        let mut chaos = ChaosProcessor::default();
        for arg in args {
            let (key, value) = arg.split_once('=').ok_or_else(|| {
                ProcessError::InvalidArguments(format!("expected key=value, got '{}'", arg))
            })?;
            match key {
                "abort-on" => chaos.abort_on.push(parse_number(key, value)?),
                "exit-on" => chaos.exit_on.push(parse_number(key, value)?),
                "stall-on" => chaos.stall_on.push(parse_number(key, value)?),
                "panic-on" => chaos.panic_on.push(parse_number(key, value)?),
                "fail-on" => chaos.fail_on.push(parse_number(key, value)?),
                "delay-ms" => {
                    chaos.delay = Some(Duration::from_millis(parse_number(key, value)?));
                }
                "once" => chaos.once = Some(PathBuf::from(value)),
                other => {
                    return Err(ProcessError::InvalidArguments(format!(
                        "unknown chaos option '{}'",
                        other
                    )));
                }
            }
        }
        Ok(chaos)
    }

    /// Whether a fault should fire now. With a `once` marker the first
    /// trigger creates the marker, so later workers skip the fault.
    fn trigger(&self) -> bool {
        match &self.once {
            None => true,
            Some(marker) if marker.exists() => false,
            Some(marker) => {
                if let Err(e) = std::fs::write(marker, b"fired") {
                    tracing::warn!(
                        marker = %marker.display(),
                        "could not create chaos marker: {}",
                        e
                    );
                }
                true
            }
        }
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, ProcessError> {
    value.parse().map_err(|_| {
        ProcessError::InvalidArguments(format!("{} expects a number, got '{}'", key, value))
    })
}

impl EventProcessor for ChaosProcessor {
    fn process(&mut self, record: &EventRecord) -> Result<Vec<u8>, ProcessError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let seq = record.sequence;
        if self.abort_on.contains(&seq) && self.trigger() {
            tracing::warn!(sequence = seq, "chaos: aborting worker");
            std::process::abort();
        }
        if self.exit_on.contains(&seq) && self.trigger() {
            tracing::warn!(sequence = seq, "chaos: exiting worker");
            unsafe { libc::_exit(17) };
        }
        if self.stall_on.contains(&seq) && self.trigger() {
            tracing::warn!(sequence = seq, "chaos: stalling worker");
            loop {
                std::thread::sleep(Duration::from_secs(3600));
            }
        }
        if self.panic_on.contains(&seq) && self.trigger() {
            panic!("chaos: panic on sequence {}", seq);
        }
        if self.fail_on.contains(&seq) && self.trigger() {
            return Err(ProcessError::Failed(format!(
                "chaos: injected failure on sequence {}",
                seq
            )));
        }
        Ok(record.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_reverse() {
        let mut p = Reverse;
        let record = EventRecord::new(1, 0, 0, b"abc".to_vec());
        assert_eq!(p.process(&record).unwrap(), b"cba");
    }

    #[test]
    fn test_passthrough_rejects_args() {
        assert!(build_passthrough(&args(&["x=1"])).is_err());
        assert!(build_passthrough(&[]).is_ok());
    }

    #[test]
    fn test_chaos_fail_on() {
        let mut chaos = ChaosProcessor::from_args(&args(&["fail-on=2"])).unwrap();
        assert!(chaos.process(&EventRecord::new(1, 0, 0, vec![1])).is_ok());
        assert!(matches!(
            chaos.process(&EventRecord::new(2, 0, 0, vec![2])),
            Err(ProcessError::Failed(_))
        ));
    }

    #[test]
    fn test_chaos_once_marker() {
        let marker = std::env::temp_dir().join(format!("evtflow-chaos-{}", std::process::id()));
        let _ = std::fs::remove_file(&marker);
        let spec = format!("once={}", marker.display());

        let mut chaos = ChaosProcessor::from_args(&args(&["fail-on=5", &spec])).unwrap();
        let record = EventRecord::new(5, 0, 0, vec![]);
        assert!(chaos.process(&record).is_err());
        assert!(marker.exists());
        // A restarted worker sees the marker and behaves
        let mut again = ChaosProcessor::from_args(&args(&["fail-on=5", &spec])).unwrap();
        assert!(again.process(&record).is_ok());

        std::fs::remove_file(&marker).unwrap();
    }

    #[test]
    fn test_chaos_panic_on() {
        let mut chaos = ChaosProcessor::from_args(&args(&["panic-on=3"])).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            chaos.process(&EventRecord::new(3, 0, 0, vec![]))
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_chaos_bad_args() {
        assert!(ChaosProcessor::from_args(&args(&["fail-on"])).is_err());
        assert!(ChaosProcessor::from_args(&args(&["fail-on=x"])).is_err());
        assert!(ChaosProcessor::from_args(&args(&["explode=1"])).is_err());
    }
}
