//! Modular, distributed spelling- and grammar-correction pipeline
//!
//! Provides a library for running a configurable ordered set of correction
//! modules against a linguistically annotated document, either in-process or
//! against remote module servers, and collecting the modules' suggestions
//! for correction back into the document.
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use thiserror::Error;
use tokio::time::Duration;

/// Contains configuration and module registration primitives for module development
pub mod config;
/// The in-memory annotated document tree and the edit-query interpreter
pub mod document;
/// Shared unit-filter predicates selectable from configuration
pub mod filters;
pub mod modules;
/// Newline-framed TCP client and server endpoints for remote modules
pub mod net;
pub mod pipeline;
/// Filesystem-backed catalog of running module servers
pub mod registry;

pub use document::query::EditQuery;
pub use document::{Correction, Document, Paragraph, Sentence, Suggestion, Word};
pub use pipeline::Runtime;

/// Control request a client sends to query a module server's load.
pub const LOAD_PROBE: &str = "%GETLOAD%";

/// Fixed budget for answering (and awaiting) a load probe, independent of the
/// configured queue timeout.
pub const LOAD_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Deserialize an optional duration from a string like "10s", "5m", "1h", etc.
pub(crate) fn deserialize_optional_duration<'de, D>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    match opt {
        Some(s) => parse_duration::parse(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Free-form `key=value` parameters passed on the command line and handed to
/// every module's `prepare_input` and `process_output`.
pub type Parameters = HashMap<String, String>;

/// The document structure level a module operates on. Every module declares
/// exactly one unit type; the pipeline only dispatches elements of that type
/// to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    /// The whole document, dispatched once per run
    Document,
    /// One paragraph per dispatch
    Paragraph,
    /// One sentence per dispatch
    Sentence,
    /// One word (token) per dispatch
    Word,
}

impl std::fmt::Display for UnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let msg = match self {
            UnitType::Document => "document",
            UnitType::Paragraph => "paragraph",
            UnitType::Sentence => "sentence",
            UnitType::Word => "word",
        };
        write!(f, "{}", msg)
    }
}

/// Borrowed view of one document structure element, handed to modules during
/// unit filtering and input preparation.
#[derive(Debug, Clone, Copy)]
pub enum Unit<'a> {
    /// The whole document
    Document(&'a Document),
    /// A paragraph element
    Paragraph(&'a Paragraph),
    /// A sentence element
    Sentence(&'a Sentence),
    /// A word element
    Word(&'a Word),
}

impl<'a> Unit<'a> {
    /// Stable identifier of the underlying element.
    pub fn id(&self) -> &str {
        match self {
            Unit::Document(d) => &d.id,
            Unit::Paragraph(p) => &p.id,
            Unit::Sentence(s) => &s.id,
            Unit::Word(w) => &w.id,
        }
    }

    /// The unit type of the underlying element.
    pub fn unit_type(&self) -> UnitType {
        match self {
            Unit::Document(_) => UnitType::Document,
            Unit::Paragraph(_) => UnitType::Paragraph,
            Unit::Sentence(_) => UnitType::Sentence,
            Unit::Word(_) => UnitType::Word,
        }
    }

    /// Plain text of the underlying element, words joined by single spaces.
    pub fn text(&self) -> String {
        match self {
            Unit::Document(d) => d.text(),
            Unit::Paragraph(p) => p.text(),
            Unit::Sentence(s) => s.text(),
            Unit::Word(w) => w.text.clone(),
        }
    }

    /// The word element, when this unit is one.
    pub fn word(&self) -> Option<&'a Word> {
        match self {
            Unit::Word(w) => Some(w),
            _ => None,
        }
    }
}

/// Module is the correction-specialist trait every corrigo module implements.
///
/// A module never touches the document concurrently: `init` and `finish` run
/// serially in the consumer, `prepare_input` runs serially in the producer,
/// `run` is the only concurrent operation (and may execute in a remote server
/// process), and `process_output` runs under the single-writer consumer.
#[async_trait]
pub trait Module: Send + Sync {
    /// The document structure level this module processes.
    fn unit_type(&self) -> UnitType;

    /// Additional per-unit acceptance predicate. Units rejected here are never
    /// dispatched to this module.
    fn unit_filter(&self, unit: &Unit) -> bool {
        let _ = unit;
        true
    }

    /// Called once per run, serially, before any dispatch. Declares the
    /// module's correction set on the document if not already declared.
    fn init(&self, doc: &mut Document) -> Result<(), Error>;

    /// Serialize an input payload for one unit. Returning `None` drops this
    /// unit for this module. Producer-side, serial.
    fn prepare_input(
        &self,
        unit: &Unit,
        parameters: &Parameters,
    ) -> Result<Option<serde_json::Value>, Error>;

    /// Execute the module on one payload. May run in-process or inside a
    /// remote server; the payload and output must be JSON-serializable on
    /// both sides. `None` yields no output record.
    async fn run(&self, payload: serde_json::Value) -> Result<Option<serde_json::Value>, Error>;

    /// Interpret one `run` output into zero or more edit queries. Consumer
    /// side, single writer.
    fn process_output(
        &self,
        output: serde_json::Value,
        payload: serde_json::Value,
        unit_id: &str,
        parameters: &Parameters,
    ) -> Result<Vec<EditQuery>, Error>;

    /// Called once per run, serially, after all results have been applied.
    fn finish(&self, doc: &mut Document) -> Result<(), Error> {
        let _ = doc;
        Ok(())
    }

    /// Heavy one-time initialization (model files). Called in the process
    /// that will execute `run`: the master for local modules, the server
    /// runtime for remote ones.
    async fn load(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Lighter-weight variant of [`Module::load`] the controller calls in the
    /// master process when the module runs remotely.
    async fn client_load(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Current load of this module's server process, used to answer the load
    /// probe. `0.0` is idle, `1.0` saturated, `>1.0` overloaded.
    fn server_load(&self) -> f64 {
        default_server_load()
    }
}

/// Normalized 1-minute system load average divided by CPU count; the default
/// answer to the load probe.
pub fn default_server_load() -> f64 {
    let cpus = num_cpus::get().max(1) as f64;
    sysinfo::System::load_average().one / cpus
}

/// Enum to capture errors occurring through the pipeline.
///
/// Configuration and document-IO faults abort the run; everything else is
/// contained per unit, per server, or per record.
#[derive(Debug, Error)]
pub enum Error {
    /// Yaml parsing errors found within the declarative configuration provided
    #[error("Unable to serialize YAML object")]
    UnableToSerializeYamlObject(
        #[from]
        #[source]
        serde_yaml::Error,
    ),

    /// JSON (de)serialization failure on a wire payload, a document dump, or
    /// the jsonschema preparsing step of module settings validation
    #[error("Unable to serialize JSON object")]
    UnableToSerializeJsonObject(
        #[from]
        #[source]
        serde_json::Error,
    ),

    /// Validation errors in the pipeline-level configuration
    #[error("Validation error: {0}")]
    Validation(String),

    /// The provided jsonschema for a module's settings is itself invalid
    #[error("Invalid validation schema: {0}")]
    InvalidValidationSchema(String),

    /// Settings provided to a module do not match its registered schema
    #[error("Configuration validation failed: {0}")]
    ConfigFailedValidation(String),

    /// The `module:` selector names no registered module implementation
    #[error("Module implementation not registered: {0}")]
    ModuleNotRegistered(String),

    /// Two module specifications share one id
    #[error("Duplicate module id: {0}")]
    DuplicateModuleId(String),

    /// Module ids name PID files unambiguously; dots, slashes, and spaces are
    /// forbidden
    #[error("Forbidden module id {0:?}: ids may not contain '.', '/', or spaces")]
    ForbiddenModuleId(String),

    /// `depends` references an id absent from the configuration
    #[error("Module {module} depends on unknown module {depends}")]
    UnknownDependency {
        /// The declaring module
        module: String,
        /// The missing dependency id
        depends: String,
    },

    /// The `depends` graph is not a DAG
    #[error("Cyclic module dependencies involving: {0}")]
    DependencyCycle(String),

    /// Submodules are only reachable through their servers
    #[error("Submodule {0} has no servers configured")]
    SubmoduleWithoutServers(String),

    /// `sources` and `models` must pair up when both are given
    #[error("Module {0} declares mismatched source/model counts")]
    MismatchedSourcesAndModels(String),

    /// A module model file is missing or malformed
    #[error("Invalid model: {0}")]
    InvalidModel(String),

    /// Transport-level failure on a specific socket
    #[error("Transport error")]
    Transport(
        #[from]
        #[source]
        std::io::Error,
    ),

    /// Every configured server for a remote module failed for one unit
    #[error("No server reachable for module {module} (unit {unit})")]
    ServerUnreachable {
        /// The remote module
        module: String,
        /// The unit whose dispatch was abandoned
        unit: String,
    },

    /// Exception inside a module's `run` or `process_output`
    #[error("Module failure: {0}")]
    ModuleRunError(String),

    /// Malformed edit query or bad target id
    #[error("Query error: {0}")]
    QueryError(String),

    /// Cannot read the input document or write the output document
    #[error("Document I/O error on {path}")]
    DocumentIo {
        /// The offending path
        path: String,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// Error with the processing pipeline due to a failure of internal
    /// libraries or queue plumbing
    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// Failure to send to an internal channel
    #[error("Pipeline processing error: {0}")]
    UnableToSendToChannel(String),

    /// Failure to receive from an internal channel
    #[error("Channel receive error")]
    RecvChannelError(
        #[from]
        #[source]
        flume::RecvError,
    ),

    /// Unable to secure an internal mutex lock
    #[error("Internal error: unable to secure lock")]
    UnableToSecureLock,

    /// A module of the same name has already been registered
    #[error("Duplicate registered name: {0}")]
    DuplicateRegisteredName(String),
}
