//! Pipeline configuration: a declarative YAML file enumerating pipeline
//! settings and module specifications. Configs may `inherit` from a base
//! config; environment variables are templated into the raw YAML before
//! parsing; per-module `settings` are validated against the jsonschema the
//! module registered.
use handlebars::Handlebars;
use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, trace};

use core::future::Future;
use std::pin::Pin;

use crate::filters::FilterKind;
use crate::{deserialize_optional_duration, Error, Module};
use tokio::time::Duration;

mod registration;
mod validate;
pub use registration::register_module;
pub(crate) use registration::get_registered;
pub use validate::dependency_order;

/// Callback provides the pinned async function that will create the module
/// instance being supplied to the corrigo runtime
pub type Callback =
    fn(ModuleContext) -> Pin<Box<dyn Future<Output = Result<Box<dyn Module>, Error>> + Send>>;

/// Default queue timeout when the configuration does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default minimum interval between server probes.
pub const DEFAULT_MIN_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Default correction set declared by modules that do not configure one.
pub const DEFAULT_SET: &str = "spellingcorrection";

/// Everything a module constructor receives: the resolved specification
/// fields plus the free-form settings map.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    /// The module id from the configuration
    pub id: String,
    /// Correction set, when configured
    pub set: Option<String>,
    /// Correction class, when configured
    pub class: Option<String>,
    /// Annotator name; defaults to the module id
    pub annotator: String,
    /// Model files the module loads in `load`
    pub models: Vec<PathBuf>,
    /// Source files paired with the models (training-side concern)
    pub sources: Vec<PathBuf>,
    /// Module-specific settings, already validated against the registered
    /// schema
    pub settings: Value,
}

impl ModuleContext {
    /// The configured set or the pipeline default.
    pub fn set_or_default(&self) -> String {
        self.set.clone().unwrap_or_else(|| DEFAULT_SET.into())
    }

    /// The configured class or the module's own default.
    pub fn class_or(&self, default: &str) -> String {
        self.class.clone().unwrap_or_else(|| default.into())
    }
}

/// Parsed and validated registration entry
#[derive(Clone)]
pub(crate) struct RegisteredModule {
    pub creator: Callback,
    pub format: ConfigSpec,
}

/// One `{host, port}` server endpoint in a module specification. The port is
/// optional; `startservers` picks a random free one when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Host name or address the server runs on
    pub host: String,
    /// Fixed port, when configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

fn default_settings() -> Value {
    Value::Mapping(serde_yaml::Mapping::new())
}

fn deserialize_one_or_many<'de, D>(deserializer: D) -> Result<Vec<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(PathBuf),
        Many(Vec<PathBuf>),
    }
    match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Ok(Vec::new()),
        Some(OneOrMany::One(p)) => Ok(vec![p]),
        Some(OneOrMany::Many(v)) => Ok(v),
    }
}

/// Unparsed module specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSpec {
    /// Unique module id; no `.`, `/`, or spaces (it names PID files)
    pub id: String,
    /// Selector naming the registered module implementation
    pub module: String,
    /// Whether the module participates in runs (default true)
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Shorthand for `enabled: false`
    #[serde(default)]
    pub disabled: Option<bool>,
    /// Submodules are only callable by other modules, never dispatched
    #[serde(default)]
    pub submodule: bool,
    /// Ids of modules that must complete before this one runs
    #[serde(default)]
    pub depends: Vec<String>,
    /// Remote server endpoints; empty means the module runs locally
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
    /// Correction set
    #[serde(default)]
    pub set: Option<String>,
    /// Correction class
    #[serde(default)]
    pub class: Option<String>,
    /// Annotator name; defaults to the id
    #[serde(default)]
    pub annotator: Option<String>,
    /// Source files (training-side); must pair with `models` when both given
    #[serde(default, alias = "source", deserialize_with = "deserialize_one_or_many")]
    pub sources: Vec<PathBuf>,
    /// Model files loaded by the module
    #[serde(default, alias = "model", deserialize_with = "deserialize_one_or_many")]
    pub models: Vec<PathBuf>,
    /// Optional named unit filter applied before dispatch
    #[serde(default)]
    pub filter: Option<FilterKind>,
    /// Free-form module settings validated against the registered schema
    #[serde(default = "default_settings")]
    pub settings: Value,
}

impl ModuleSpec {
    /// Effective enabled state (`disabled` wins over `enabled`).
    pub fn is_enabled(&self) -> bool {
        if self.disabled == Some(true) {
            return false;
        }
        self.enabled.unwrap_or(true)
    }
}

/// Unparsed pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Pipeline id, used as the default document id prefix
    #[serde(default)]
    pub id: Option<String>,
    /// Root directory; the server registry lives at `<root>/run/`
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Document language hint
    #[serde(default)]
    pub language: Option<String>,
    /// External tokenizer configuration selector
    #[serde(default)]
    pub tokenizer: Option<String>,
    /// Worker count; defaults to the CPU count
    #[serde(default)]
    pub threads: Option<usize>,
    /// Queue timeout, e.g. "120s"
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    #[serde(skip_serializing)]
    pub timeout: Option<Duration>,
    /// Minimum interval between server probes, e.g. "60s"
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    #[serde(skip_serializing)]
    pub minpollinterval: Option<Duration>,
    /// Base configuration file to chain from
    #[serde(default)]
    pub inherit: Option<PathBuf>,
    /// Module specifications, in pipeline order
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
}

impl FromStr for Config {
    type Err = Error;

    /// `{{VAR}}` placeholders in the raw YAML are filled from the process
    /// environment before parsing; an unknown placeholder is a
    /// configuration error, not an empty string.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut templater = Handlebars::new();
        templater.set_strict_mode(true);
        let vars: HashMap<String, String> = env::vars().collect();
        let rendered = templater.render_template(raw, &vars).map_err(|e| {
            Error::ConfigFailedValidation(format!("environment templating failed: {e}"))
        })?;
        Ok(serde_yaml::from_str(&rendered)?)
    }
}

impl Config {
    /// Read a configuration file, resolving `inherit` chains relative to the
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self, Error> {
        Self::load_with_depth(path, 0)
    }

    fn load_with_depth(path: &Path, depth: usize) -> Result<Self, Error> {
        if depth > 8 {
            return Err(Error::Validation(format!(
                "inherit chain too deep at {}",
                path.display()
            )));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| Error::DocumentIo {
            path: path.display().to_string(),
            source,
        })?;
        let config = Config::from_str(&raw)?;
        match &config.inherit {
            None => Ok(config),
            Some(base_ref) => {
                let base_path = if base_ref.is_absolute() {
                    base_ref.clone()
                } else {
                    path.parent().unwrap_or(Path::new(".")).join(base_ref)
                };
                debug!(base = %base_path.display(), "resolving inherited configuration");
                let base = Self::load_with_depth(&base_path, depth + 1)?;
                Ok(config.merge_over(base))
            }
        }
    }

    /// Overlay this configuration on a base one: scalar settings of `self`
    /// win, module specs override by id and otherwise append.
    pub fn merge_over(self, base: Config) -> Config {
        let mut modules = base.modules;
        for spec in self.modules {
            match modules.iter_mut().find(|m| m.id == spec.id) {
                Some(slot) => *slot = spec,
                None => modules.push(spec),
            }
        }
        Config {
            id: self.id.or(base.id),
            root: self.root.or(base.root),
            language: self.language.or(base.language),
            tokenizer: self.tokenizer.or(base.tokenizer),
            threads: self.threads.or(base.threads),
            timeout: self.timeout.or(base.timeout),
            minpollinterval: self.minpollinterval.or(base.minpollinterval),
            inherit: None,
            modules,
        }
    }
}

/// Parsed and validated pipeline configuration
#[derive(Clone)]
pub struct ParsedConfig {
    /// Pipeline id
    pub id: String,
    /// Root directory for the server registry
    pub root: PathBuf,
    /// Document language hint
    pub language: Option<String>,
    /// External tokenizer selector
    pub tokenizer: Option<String>,
    /// Worker count
    pub threads: usize,
    /// Queue timeout
    pub timeout: Duration,
    /// Minimum interval between server probes
    pub minpollinterval: Duration,
    /// Validated module entries, in pipeline order
    pub modules: Vec<ParsedModule>,
}

/// One validated module entry: the specification fields the pipeline needs
/// plus the registered constructor.
#[derive(Clone)]
pub struct ParsedModule {
    /// Unique module id
    pub id: String,
    /// Whether the module participates in runs
    pub enabled: bool,
    /// Never dispatched by the pipeline when set
    pub submodule: bool,
    /// Dependency ids
    pub depends: Vec<String>,
    /// Configured server endpoints
    pub servers: Vec<ServerSpec>,
    /// Optional named unit filter
    pub filter: Option<FilterKind>,
    pub(crate) creator: Callback,
    pub(crate) context: ModuleContext,
}

impl ParsedModule {
    /// Create the module instance this entry describes.
    pub async fn instantiate(&self) -> Result<Box<dyn Module>, Error> {
        (self.creator)(self.context.clone()).await
    }

    /// The annotator recorded on this module's corrections.
    pub fn annotator(&self) -> &str {
        &self.context.annotator
    }
}

/// Module settings validation snippet.
///
/// Uses `Arc` internally to make cloning cheap without re-parsing the schema.
pub struct ConfigSpec {
    raw_schema: String,
    schema: Arc<JSONSchema>,
}

impl std::fmt::Debug for ConfigSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSpec")
            .field("raw_schema", &self.raw_schema)
            .finish()
    }
}

impl Clone for ConfigSpec {
    fn clone(&self) -> Self {
        ConfigSpec {
            raw_schema: self.raw_schema.clone(),
            schema: Arc::clone(&self.schema),
        }
    }
}

impl ConfigSpec {
    /// Creates a settings validation snippet from the provided schema. The
    /// schema is jsonschema format, in yaml. Rather than validating the yaml
    /// directly it is converted to json and checked with the jsonschema
    /// library.
    ///
    /// ```
    /// # use corrigo::config::ConfigSpec;
    /// let conf_str = r#"properties:
    ///   delimiter:
    ///     type: string"#;
    ///
    /// let config = ConfigSpec::from_schema(&conf_str).unwrap();
    /// ```
    pub fn from_schema(conf: &str) -> Result<Self, Error> {
        let v: Value = serde_yaml::from_str(conf)?;
        let intermediate = serde_json::to_string(&v)?;
        let f: serde_json::Value = serde_json::from_str(&intermediate)?;

        let schema: JSONSchema = match JSONSchema::options().with_draft(Draft::Draft7).compile(&f) {
            Ok(js) => js,
            Err(e) => return Err(Error::InvalidValidationSchema(format!("{e}"))),
        };

        trace!("json schema is valid");

        Ok(ConfigSpec {
            raw_schema: conf.into(),
            schema: Arc::new(schema),
        })
    }

    /// Validates the settings value against the schema provided to establish
    /// this ConfigSpec.
    pub fn validate(&self, content: &Value) -> Result<(), Error> {
        let intermediate = serde_json::to_string(content)?;
        let f: serde_json::Value = serde_json::from_str(&intermediate)?;
        let result = self.schema.validate(&f);
        if let Err(errors) = result {
            let errs: Vec<String> = errors.into_iter().map(|i| format!("{}", i)).collect();
            error!(
                number_of_failures = errs.len(),
                errors = errs.join(" "),
                "validation failed"
            );
            return Err(Error::ConfigFailedValidation(errs.join(" ")));
        };
        Ok(())
    }
}
