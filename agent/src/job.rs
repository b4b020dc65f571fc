use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

/// raw hash representation of a job as kept in the coordination store
pub type JobFields = HashMap<String, String>;

// field names of the job hash, shared with submitters
pub const FIELD_JOB_ID: &str = "job-id";
pub const FIELD_STATE: &str = "state";
pub const FIELD_EXECUTABLE: &str = "Executable";
pub const FIELD_ARGUMENTS: &str = "Arguments";
pub const FIELD_ENVIRONMENT: &str = "Environment";
pub const FIELD_PROCESSES: &str = "NumberOfProcesses";
pub const FIELD_SPMD: &str = "SPMDVariation";
pub const FIELD_WORKING_DIRECTORY: &str = "WorkingDirectory";
pub const FIELD_OUTPUT: &str = "Output";
pub const FIELD_ERROR: &str = "Error";

/// environment entry consumed by the launcher instead of being exported
pub const NUMBER_SUBJOBS: &str = "NUMBER_SUBJOBS";

/// exit code that is accepted as a successful termination next to 0
pub const ACCEPTED_EXIT_CODE: i32 = 255;

#[derive(Error, Debug)]
pub enum DescriptionError {
    #[error("Job description is missing the required field {0}")]
    MissingField(&'static str),
    #[error("Field {field} must be a positive number, got {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("Field {field} is not a valid list")]
    InvalidList {
        field: &'static str,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Field {field} contains a non scalar list entry")]
    NonScalarEntry { field: &'static str },
    #[error("Environment entry {0:?} is not of the form KEY=VALUE")]
    InvalidEnvironment(String),
    #[error("Unknown job state {0:?}")]
    InvalidState(String),
    #[error("Unknown SPMD variation {0:?}")]
    InvalidSpmd(String),
}

/// Lifecycle of a job.
///
/// ```text
///   Unknown/New ──(allocated + spawned)──→ Running ──(exit 0 | 255)──→ Done
///        ↑   │                                │
///        └───┘ (insufficient slots, requeue)  └──(any other exit)──→ Failed
/// ```
///
/// Transitions never move backward, `Done` and `Failed` are final.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobState {
    Unknown,
    New,
    Running,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// states from which the agent may still start the job
    pub fn is_dispatchable(self) -> bool {
        matches!(self, Self::Unknown | Self::New)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::New => 1,
            Self::Running => 2,
            Self::Done | Self::Failed => 3,
        }
    }

    /// whether moving from `self` to `next` keeps the state machine monotone
    pub fn can_advance_to(self, next: JobState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Map the exit code of a finished process to its terminal state.
    ///
    /// `None` (terminated by a signal) counts as a failure. Restarting failed
    /// jobs in place is not supported, failed jobs always end here.
    pub fn from_exit_code(code: Option<i32>) -> JobState {
        match code {
            Some(0) | Some(ACCEPTED_EXIT_CODE) => Self::Done,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "Unknown",
            Self::New => "New",
            Self::Running => "Running",
            Self::Done => "Done",
            Self::Failed => "Failed",
        })
    }
}

impl FromStr for JobState {
    type Err = DescriptionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "unknown" => Ok(Self::Unknown),
            "new" => Ok(Self::New),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(DescriptionError::InvalidState(value.to_string())),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpmdVariation {
    #[default]
    Single,
    Mpi,
    Other,
}

impl FromStr for SpmdVariation {
    type Err = DescriptionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "" | "single" => Ok(Self::Single),
            "mpi" => Ok(Self::Mpi),
            other if !other.contains(char::is_whitespace) => Ok(Self::Other),
            _ => Err(DescriptionError::InvalidSpmd(value.to_string())),
        }
    }
}

impl fmt::Display for SpmdVariation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Single => "single",
            Self::Mpi => "mpi",
            Self::Other => "other",
        })
    }
}

/// Typed job description, parsed once from the store hash when a job is dequeued.
#[derive(Clone, Debug, PartialEq)]
pub struct JobDescription {
    pub job_id: String,
    pub state: JobState,
    pub executable: String,
    pub arguments: Vec<String>,
    /// exported variables, `NUMBER_SUBJOBS` is already stripped
    pub environment: Vec<(String, String)>,
    pub number_of_processes: usize,
    pub spmd_variation: SpmdVariation,
    /// defaults to `<pilot dir>/<job id>`
    pub working_directory: Option<PathBuf>,
    /// relative paths are resolved against the working directory
    pub output: PathBuf,
    pub error: PathBuf,
    pub number_of_subjobs: usize,
}

impl JobDescription {
    /// minimal description for a single process job
    pub fn new(job_id: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Unknown,
            executable: executable.into(),
            arguments: Vec::new(),
            environment: Vec::new(),
            number_of_processes: 1,
            spmd_variation: SpmdVariation::Single,
            working_directory: None,
            output: PathBuf::from("stdout"),
            error: PathBuf::from("stderr"),
            number_of_subjobs: 1,
        }
    }

    pub fn from_fields(fields: &JobFields) -> Result<Self, DescriptionError> {
        let job_id = required(fields, FIELD_JOB_ID)?;
        let executable = required(fields, FIELD_EXECUTABLE)?;
        let mut description = Self::new(job_id, executable);

        if let Some(state) = optional(fields, FIELD_STATE) {
            description.state = state.parse()?;
        }

        if let Some(raw) = optional(fields, FIELD_ARGUMENTS) {
            description.arguments = parse_list(FIELD_ARGUMENTS, raw)?;
        }

        if let Some(raw) = optional(fields, FIELD_ENVIRONMENT) {
            for entry in parse_list(FIELD_ENVIRONMENT, raw)? {
                let (key, value) = entry
                    .split_once('=')
                    .ok_or_else(|| DescriptionError::InvalidEnvironment(entry.clone()))?;
                let key = key.trim();

                if key == NUMBER_SUBJOBS {
                    description.number_of_subjobs = parse_positive(NUMBER_SUBJOBS, value)?;
                } else if key.is_empty() {
                    return Err(DescriptionError::InvalidEnvironment(entry));
                } else {
                    description
                        .environment
                        .push((key.to_string(), value.to_string()));
                }
            }
        }

        if let Some(raw) = optional(fields, FIELD_PROCESSES) {
            description.number_of_processes = parse_positive(FIELD_PROCESSES, raw)?;
        }

        if let Some(raw) = optional(fields, FIELD_SPMD) {
            description.spmd_variation = raw.parse()?;
        }

        description.working_directory = optional(fields, FIELD_WORKING_DIRECTORY).map(PathBuf::from);

        if let Some(output) = optional(fields, FIELD_OUTPUT) {
            description.output = PathBuf::from(output);
        }

        if let Some(error) = optional(fields, FIELD_ERROR) {
            description.error = PathBuf::from(error);
        }

        Ok(description)
    }

    /// serialize back into the hash layout understood by `from_fields`
    pub fn to_fields(&self) -> JobFields {
        let mut fields = JobFields::new();
        let mut environment = self
            .environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>();

        if self.number_of_subjobs != 1 {
            environment.push(format!("{NUMBER_SUBJOBS}={}", self.number_of_subjobs));
        }

        fields.insert(FIELD_JOB_ID.into(), self.job_id.clone());
        fields.insert(FIELD_STATE.into(), self.state.to_string());
        fields.insert(FIELD_EXECUTABLE.into(), self.executable.clone());
        fields.insert(FIELD_ARGUMENTS.into(), render_list(&self.arguments));
        fields.insert(FIELD_ENVIRONMENT.into(), render_list(&environment));
        fields.insert(FIELD_PROCESSES.into(), self.number_of_processes.to_string());
        fields.insert(FIELD_SPMD.into(), self.spmd_variation.to_string());
        fields.insert(FIELD_OUTPUT.into(), self.output.to_string_lossy().into_owned());
        fields.insert(FIELD_ERROR.into(), self.error.to_string_lossy().into_owned());

        if let Some(ref directory) = self.working_directory {
            fields.insert(
                FIELD_WORKING_DIRECTORY.into(),
                directory.to_string_lossy().into_owned(),
            );
        }

        fields
    }

    pub fn working_directory_in(&self, pilot_dir: &Path) -> PathBuf {
        self.working_directory
            .clone()
            .unwrap_or_else(|| pilot_dir.join(path_component(&self.job_id)))
    }
}

/// Encode a job id as a single path component.
///
/// Path separators, `:`, NUL and `%` itself are percent-encoded so distinct ids
/// never share a component, and `.`/`..` cannot climb out of the pilot directory.
pub fn path_component(job_id: &str) -> String {
    if !job_id.is_empty() && job_id.chars().all(|c| c == '.') {
        return "%2E".repeat(job_id.len());
    }

    let mut encoded = String::with_capacity(job_id.len());

    for c in job_id.chars() {
        match c {
            '%' | '/' | '\\' | ':' | '\0' => encoded.push_str(&format!("%{:02X}", c as u32)),
            other => encoded.push(other),
        }
    }

    encoded
}

fn required<'a>(fields: &'a JobFields, field: &'static str) -> Result<&'a str, DescriptionError> {
    optional(fields, field).ok_or(DescriptionError::MissingField(field))
}

fn optional<'a>(fields: &'a JobFields, field: &str) -> Option<&'a str> {
    fields
        .get(field)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn parse_positive(field: &'static str, raw: &str) -> Result<usize, DescriptionError> {
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(DescriptionError::InvalidNumber {
            field,
            value: raw.to_string(),
        }),
    }
}

/// Lists are either YAML/JSON sequences (`['-n', '4']`, `["a"]`, block style)
/// or a plain whitespace separated string.
fn parse_list(field: &'static str, raw: &str) -> Result<Vec<String>, DescriptionError> {
    let trimmed = raw.trim();

    if !(trimmed.starts_with('[') || trimmed.starts_with("- ")) {
        return Ok(trimmed.split_whitespace().map(String::from).collect());
    }

    serde_yaml::from_str::<Option<Vec<serde_yaml::Value>>>(trimmed)
        .map_err(|source| DescriptionError::InvalidList { field, source })?
        .unwrap_or_default()
        .into_iter()
        .map(|value| match value {
            serde_yaml::Value::String(value) => Ok(value),
            serde_yaml::Value::Number(value) => Ok(value.to_string()),
            serde_yaml::Value::Bool(value) => Ok(value.to_string()),
            _ => Err(DescriptionError::NonScalarEntry { field }),
        })
        .collect()
}

fn render_list(items: &[String]) -> String {
    let quoted = items
        .iter()
        .map(|item| format!("'{}'", item.replace('\'', "''")))
        .collect::<Vec<_>>();

    format!("[{}]", quoted.join(", "))
}
