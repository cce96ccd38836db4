//! Loading of the `build.yml` template that describes what to run.
//!
//! The template names the image, the parameters exposed to the command, and
//! the command itself. Before submission, parameter values are overridden by
//! matching environment variables and any trailing command-line arguments are
//! appended to `run.args`.

use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;

/// Default file name of the build template inside the build directory.
pub const DEFAULT_BUILD_FILE: &str = "build.yml";

/// Parsed build template.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildConfig {
    /// Container image reference.
    pub image: String,
    /// Parameters exposed to the command, with values coerced to strings.
    pub params: BTreeMap<String, String>,
    /// Command to run.
    pub run: BuildRunConfig,
}

/// Command section of the build template.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct BuildRunConfig {
    /// Executable to run.
    pub path: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Deserialize)]
struct RawBuildConfig {
    image: String,
    #[serde(default)]
    params: BTreeMap<String, Value>,
    run: BuildRunConfig,
}

/// Errors raised while loading the build template.
#[derive(Debug, Error)]
pub enum BuildConfigError {
    /// The template file could not be read.
    #[error("failed to read build configuration {path}: {source}")]
    Read {
        /// Path that was read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The template is not valid YAML or lacks required fields.
    #[error("invalid build configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// A parameter value is not a scalar.
    #[error("parameter '{name}' must be a scalar value")]
    InvalidParam {
        /// Name of the offending parameter.
        name: String,
    },
}

impl BuildConfig {
    /// Reads and parses the template at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildConfigError::Read`] when the file cannot be read, or a
    /// parse error from [`BuildConfig::from_yaml`].
    pub fn load(path: &Utf8Path) -> Result<Self, BuildConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| BuildConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Parses a template from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`BuildConfigError::Parse`] for malformed YAML and
    /// [`BuildConfigError::InvalidParam`] when a parameter is a sequence or
    /// mapping.
    pub fn from_yaml(contents: &str) -> Result<Self, BuildConfigError> {
        let raw: RawBuildConfig = serde_yaml::from_str(contents)?;
        let params = raw
            .params
            .into_iter()
            .map(|(name, value)| {
                let coerced = coerce_param(&value)
                    .ok_or_else(|| BuildConfigError::InvalidParam { name: name.clone() })?;
                Ok((name, coerced))
            })
            .collect::<Result<_, BuildConfigError>>()?;

        Ok(Self {
            image: raw.image,
            params,
            run: raw.run,
        })
    }

    /// Replaces every parameter whose name `lookup` resolves.
    ///
    /// An empty string returned by `lookup` clears the value. Names absent
    /// from the template are never added.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (name, value) in &mut self.params {
            if let Some(overridden) = lookup(name) {
                *value = overridden;
            }
        }
    }

    /// Appends `args` verbatim after the templated arguments.
    pub fn append_args<I>(&mut self, args: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.run.args.extend(args);
    }
}

fn coerce_param(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::String(text) => Some(text.clone()),
        Value::Tagged(tagged) => coerce_param(&tagged.value),
        Value::Sequence(_) | Value::Mapping(_) => None,
    }
}
