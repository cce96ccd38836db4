//! The build specification submitted to the orchestrator.
//!
//! [`BuildSpec`] serialises to the JSON body expected by
//! `POST /api/v1/builds`:
//!
//! ```json
//! {
//!   "privileged": true,
//!   "config": { "image": "ubuntu", "params": {"FOO": "bar"},
//!               "run": { "path": "find", "args": ["."] } },
//!   "inputs": [ { "name": "project", "type": "archive",
//!                 "source": { "uri": "http://10.0.0.1:1234/api/v1/pipes/abc" } } ]
//! }
//! ```

use std::collections::BTreeMap;

use camino::Utf8Path;
use serde::Serialize;

use crate::build_config::BuildConfig;
use crate::orchestrator::Channel;

/// Input type tag for directories uploaded through a bits channel.
pub const ARCHIVE_INPUT_TYPE: &str = "archive";

/// Fallback input name for directories without a base name.
pub const DEFAULT_INPUT_NAME: &str = "input";

/// Complete description of a build to run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct BuildSpec {
    /// Whether the build container runs privileged.
    pub privileged: bool,
    /// What to run.
    pub config: TaskConfig,
    /// Inputs fetched by the execution backend before the run starts.
    pub inputs: Vec<Input>,
}

impl BuildSpec {
    /// Builds the specification for one uploaded directory.
    #[must_use]
    pub fn new(config: &BuildConfig, privileged: bool, input: Input) -> Self {
        Self {
            privileged,
            config: TaskConfig {
                image: config.image.clone(),
                params: config.params.clone(),
                run: RunConfig {
                    path: config.run.path.clone(),
                    args: config.run.args.clone(),
                },
            },
            inputs: vec![input],
        }
    }
}

/// Image, parameters, and command of a build.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TaskConfig {
    /// Container image reference.
    pub image: String,
    /// Environment parameters exposed to the command.
    pub params: BTreeMap<String, String>,
    /// Command to run.
    pub run: RunConfig,
}

/// Command path and arguments.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RunConfig {
    /// Executable to run.
    pub path: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
}

/// One named input of a build.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Input {
    /// Input name, derived from the uploaded directory.
    pub name: String,
    /// Input type tag; always [`ARCHIVE_INPUT_TYPE`] for uploaded directories.
    #[serde(rename = "type")]
    pub kind: String,
    /// Where the backend fetches the input from.
    pub source: BTreeMap<String, String>,
}

impl Input {
    /// Creates an archive input for `dir` fetched through `channel`.
    #[must_use]
    pub fn archive(dir: &Utf8Path, channel: &Channel) -> Self {
        let name = dir
            .file_name()
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_INPUT_NAME)
            .to_owned();
        let mut source = BTreeMap::new();
        source.insert(String::from("uri"), channel.fetch_uri());
        Self {
            name,
            kind: ARCHIVE_INPUT_TYPE.to_owned(),
            source,
        }
    }
}
