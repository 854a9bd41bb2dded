//! Event processors and their registry
//!
//! A processor is looked up by name in the worker process, so registration
//! has to be static: either one of the built-ins or an
//! `inventory::submit!(ProcessorDef { .. })` linked into the binary.

use crate::builtin::BUILTINS;
use evtflow_ipc::EventRecord;
use thiserror::Error;

/// Errors raised by processors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// The event could not be processed; the result carries the error flag
    #[error("{0}")]
    Failed(String),

    /// The factory rejected its arguments
    #[error("invalid processor arguments: {0}")]
    InvalidArguments(String),
}

/// Per-event computation run inside a worker process.
///
/// Implementations only see the opaque payload and its header. A returned
/// error or a panic is reported downstream as an error-flagged result; it
/// does not kill the worker.
pub trait EventProcessor: Send {
    /// Turn one input record into an output payload
    fn process(&mut self, record: &EventRecord) -> Result<Vec<u8>, ProcessError>;

    /// Called once before the worker exits cleanly
    fn finish(&mut self) {}
}

/// Processor registration
#[derive(Debug, Clone, Copy)]
pub struct ProcessorDef {
    /// Name used in configuration and on the command line
    pub name: &'static str,
    /// One-line description
    pub description: &'static str,
    /// Build a processor from its arguments
    pub factory: fn(&[String]) -> Result<Box<dyn EventProcessor>, ProcessError>,
}

/// Look up a processor by name. Built-ins shadow inventory entries.
pub fn find_processor(name: &str) -> Option<&'static ProcessorDef> {
    BUILTINS.iter().find(|def| def.name == name).or_else(|| {
        inventory::iter::<ProcessorDef>
            .into_iter()
            .find(|def| def.name == name)
    })
}

/// Every known processor, sorted by name, built-ins first on name clashes
pub fn registered_processors() -> Vec<&'static ProcessorDef> {
    let mut defs: Vec<&'static ProcessorDef> = BUILTINS.iter().collect();
    for def in inventory::iter::<ProcessorDef> {
        if !defs.iter().any(|d| d.name == def.name) {
            defs.push(def);
        }
    }
    defs.sort_by_key(|def| def.name);
    defs
}

/// Find and build a processor in one step
pub fn instantiate(name: &str, args: &[String]) -> Result<Box<dyn EventProcessor>, ProcessError> {
    let def = find_processor(name)
        .ok_or_else(|| ProcessError::InvalidArguments(format!("unknown processor '{}'", name)))?;
    (def.factory)(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl EventProcessor for Upper {
        fn process(&mut self, record: &EventRecord) -> Result<Vec<u8>, ProcessError> {
            Ok(record.payload.to_ascii_uppercase())
        }
    }

    fn build_upper(_args: &[String]) -> Result<Box<dyn EventProcessor>, ProcessError> {
        Ok(Box::new(Upper))
    }

    inventory::submit! {
        ProcessorDef {
            name: "test-upper",
            description: "uppercase ASCII payloads",
            factory: build_upper,
        }
    }

    #[test]
    fn test_builtins_found() {
        for name in ["passthrough", "reverse", "chaos"] {
            assert!(find_processor(name).is_some(), "{} missing", name);
        }
        assert!(find_processor("no-such-processor").is_none());
    }

    #[test]
    fn test_inventory_registration() {
        let mut processor = instantiate("test-upper", &[]).unwrap();
        let record = EventRecord::new(1, 0, 0, b"abc".to_vec());
        assert_eq!(processor.process(&record).unwrap(), b"ABC");
        assert!(
            registered_processors()
                .iter()
                .any(|def| def.name == "test-upper")
        );
    }

    #[test]
    fn test_registered_sorted() {
        let names: Vec<&str> = registered_processors().iter().map(|d| d.name).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_unknown_processor() {
        assert!(matches!(
            instantiate("missing", &[]),
            Err(ProcessError::InvalidArguments(_))
        ));
    }
}
