pub mod probe;

use crate::{
    config::LaunchConfig,
    inventory::is_local_host,
    job::{JobDescription, SpmdVariation},
    slots::Allocation,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::File,
    io,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    str::FromStr,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Job {0} has an empty executable")]
    EmptyExecutable(String),
    #[error("Job {0} has no allocated slots")]
    NoSlots(String),
    #[error("Failed to open {path:?} for job output")]
    OpenStream {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Unknown launch method {0:?}")]
    UnknownMethod(String),
}

/// How a job's processes are started
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMethod {
    /// run the executable directly on this host
    Local,
    /// run directly, or through ssh when the first allocated host is remote
    Ssh,
    /// wrap in `mpirun -np <n> -machinefile <file>`
    Mpirun,
    /// one `aprun -n <subjobs> -d <processes>` request, aprun owns placement
    Aprun,
}

impl LaunchMethod {
    /// MPI jobs go through mpirun unless the parallel launcher owns placement
    pub fn for_job(self, spmd: SpmdVariation) -> LaunchMethod {
        match (self, spmd) {
            (Self::Aprun, _) => Self::Aprun,
            (_, SpmdVariation::Mpi) => Self::Mpirun,
            (method, _) => method,
        }
    }
}

impl fmt::Display for LaunchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Ssh => "ssh",
            Self::Mpirun => "mpirun",
            Self::Aprun => "aprun",
        })
    }
}

impl FromStr for LaunchMethod {
    type Err = LaunchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "local" | "fork" => Ok(Self::Local),
            "ssh" => Ok(Self::Ssh),
            "mpirun" | "mpi" => Ok(Self::Mpirun),
            "aprun" => Ok(Self::Aprun),
            _ => Err(LaunchError::UnknownMethod(value.to_string())),
        }
    }
}

/// Fully resolved process invocation for one job.
///
/// Executed as an argument vector with explicit redirection, never through a
/// local shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchCommand {
    pub method: LaunchMethod,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_directory: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl LaunchCommand {
    /// Map a job onto the configured launch method and its allocation.
    pub fn build(
        description: &JobDescription,
        working_directory: &Path,
        config: &LaunchConfig,
        allocation: &Allocation,
    ) -> Result<Self, LaunchError> {
        if description.executable.trim().is_empty() {
            return Err(LaunchError::EmptyExecutable(description.job_id.clone()));
        }

        let method = config.method.for_job(description.spmd_variation);
        let mut program = description.executable.clone();
        let mut args = description.arguments.clone();

        match method {
            LaunchMethod::Aprun => {
                args = [
                    "-n".to_string(),
                    description.number_of_subjobs.to_string(),
                    "-d".to_string(),
                    description.number_of_processes.to_string(),
                    program,
                ]
                .into_iter()
                .chain(args)
                .collect();
                program = config.aprun.clone();
            }
            LaunchMethod::Mpirun => {
                args = [
                    "-np".to_string(),
                    description.number_of_processes.to_string(),
                    "-machinefile".to_string(),
                    allocation.machine_file.to_string_lossy().into_owned(),
                    program,
                ]
                .into_iter()
                .chain(args)
                .collect();
                program = config.mpirun.clone();
            }
            LaunchMethod::Ssh => {
                let host = allocation
                    .first_host()
                    .ok_or_else(|| LaunchError::NoSlots(description.job_id.clone()))?;

                if !is_local_host(host.as_str()) {
                    args = vec![
                        host.to_string(),
                        remote_command(working_directory, &description.environment, &program, &args),
                    ];
                    program = config.ssh.clone();
                }
            }
            LaunchMethod::Local => {}
        }

        Ok(Self {
            method,
            program,
            args,
            env: description.environment.clone(),
            working_directory: working_directory.to_path_buf(),
            stdout: resolve_stream(working_directory, &description.output),
            stderr: resolve_stream(working_directory, &description.error),
        })
    }

    /// Spawn the process with stdout/stderr redirected into their files.
    pub fn spawn(&self) -> Result<Child, LaunchError> {
        let stdout = create_stream(&self.stdout)?;
        let stderr = create_stream(&self.stderr)?;

        Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().map(|(key, value)| (key, value)))
            .current_dir(&self.working_directory)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.program.clone(),
                source,
            })
    }
}

impl fmt::Display for LaunchCommand {
    /// shell-like rendering for log lines
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let exports = self
            .env
            .iter()
            .map(|(key, value)| format!("{key}={}", quote(value)))
            .join(" ");

        if !exports.is_empty() {
            write!(f, "{exports} ")?;
        }

        write!(
            f,
            "{} {} > {} 2> {} (in {})",
            self.program,
            self.args.iter().map(|arg| quote(arg)).join(" "),
            self.stdout.display(),
            self.stderr.display(),
            self.working_directory.display()
        )
    }
}

/// relative output targets live inside the working directory
fn resolve_stream(working_directory: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        target.to_path_buf()
    } else {
        working_directory.join(target)
    }
}

fn create_stream(path: &Path) -> Result<File, LaunchError> {
    File::create(path).map_err(|source| LaunchError::OpenStream {
        path: path.to_path_buf(),
        source,
    })
}

/// The part ssh hands to the remote shell. Every component is quoted, the
/// remote side still sees a shell command.
fn remote_command(
    working_directory: &Path,
    environment: &[(String, String)],
    program: &str,
    args: &[String],
) -> String {
    let mut parts = vec![format!(
        "cd {}",
        quote(&working_directory.to_string_lossy())
    )];

    parts.extend(
        environment
            .iter()
            .map(|(key, value)| format!("export {}", quote(&format!("{key}={value}")))),
    );
    parts.push(
        std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .map(quote)
            .join(" "),
    );

    parts.join(" && ")
}

/// single quote a word for a POSIX shell
pub fn quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return word.to_string();
    }

    format!("'{}'", word.replace('\'', r"'\''"))
}
