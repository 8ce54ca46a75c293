//! Output sinks for sampled global states

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use ecmc_core::{EcmcError, EcmcResult, Node, Time};

/// One written global state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub output: String,
    pub time: f64,
    pub branches: Vec<Node>,
}

impl OutputRecord {
    pub fn new(output: &str, time: Time, branches: &[Node]) -> Self {
        OutputRecord {
            output: output.to_string(),
            time: time.to_float(),
            branches: branches.to_vec(),
        }
    }
}

/// Destination of the mediating actions that write the global state.
pub trait OutputSink: Send {
    /// Names of the outputs this sink accepts.
    fn outputs(&self) -> &BTreeSet<String>;

    fn write(&mut self, output: &str, time: Time, branches: &[Node]) -> EcmcResult<()>;

    fn flush(&mut self) -> EcmcResult<()> {
        Ok(())
    }
}

fn unknown_output(output: &str) -> EcmcError {
    EcmcError::Output(format!("no output named '{}'", output))
}

fn output_names(outputs: &[&str]) -> BTreeSet<String> {
    outputs.iter().map(|output| output.to_string()).collect()
}

/// Keeps every record in memory. Clones share the records.
#[derive(Clone, Debug, Default)]
pub struct MemoryOutputSink {
    outputs: BTreeSet<String>,
    records: Arc<Mutex<Vec<OutputRecord>>>,
}

impl MemoryOutputSink {
    pub fn new(outputs: &[&str]) -> Self {
        MemoryOutputSink {
            outputs: output_names(outputs),
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn records(&self) -> Vec<OutputRecord> {
        self.records.lock().clone()
    }

    pub fn records_of(&self, output: &str) -> Vec<OutputRecord> {
        self.records
            .lock()
            .iter()
            .filter(|record| record.output == output)
            .cloned()
            .collect()
    }
}

impl OutputSink for MemoryOutputSink {
    fn outputs(&self) -> &BTreeSet<String> {
        &self.outputs
    }

    fn write(&mut self, output: &str, time: Time, branches: &[Node]) -> EcmcResult<()> {
        if !self.outputs.contains(output) {
            return Err(unknown_output(output));
        }
        self.records.lock().push(OutputRecord::new(output, time, branches));
        Ok(())
    }
}

/// Writes one JSON object per record and line.
pub struct JsonLinesOutputSink<W: Write + Send> {
    outputs: BTreeSet<String>,
    writer: W,
}

impl<W: Write + Send> JsonLinesOutputSink<W> {
    pub fn new(writer: W, outputs: &[&str]) -> Self {
        JsonLinesOutputSink {
            outputs: output_names(outputs),
            writer,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> OutputSink for JsonLinesOutputSink<W> {
    fn outputs(&self) -> &BTreeSet<String> {
        &self.outputs
    }

    fn write(&mut self, output: &str, time: Time, branches: &[Node]) -> EcmcResult<()> {
        if !self.outputs.contains(output) {
            return Err(unknown_output(output));
        }
        let record = OutputRecord::new(output, time, branches);
        serde_json::to_writer(&mut self.writer, &record).map_err(|e| EcmcError::Output(e.to_string()))?;
        self.writer
            .write_all(b"\n")
            .map_err(|e| EcmcError::Output(e.to_string()))
    }

    fn flush(&mut self) -> EcmcResult<()> {
        self.writer.flush().map_err(|e| EcmcError::Output(e.to_string()))
    }
}
