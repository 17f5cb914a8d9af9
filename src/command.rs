//! Structured execution of external tools.
//!
//! Commands are built as an explicit program + argument list and spawned
//! directly (never through a shell). A command can optionally stream its
//! combined stdout/stderr to a per-command log file, one timestamped line at
//! a time, while echoing to the console.

use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread::scope,
};

use crossbeam_channel::{unbounded, Sender};
use crossbeam_utils::atomic::AtomicCell;
use log::{info, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("FAILED to run {command}: return value is {code}")]
    StageFailure { command: String, code: i32 },

    #[error("Could not spawn {command}: {err}")]
    Spawn { command: String, err: std::io::Error },

    #[error("IO error while logging output of {command}: {err}")]
    Log { command: String, err: std::io::Error },
}

/// How to run an [`ExternalCommand`].
#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    /// Tolerate a non-zero exit code; the code is returned instead of raised.
    pub allow_failure: bool,

    /// Stream combined stdout/stderr to this file, each line prefixed with a
    /// timestamp. Relative paths resolve against the command's working
    /// directory.
    pub log: Option<PathBuf>,

    /// Don't echo logged output to the console.
    pub quiet: bool,
}

impl RunOptions {
    pub fn logged<P: Into<PathBuf>>(log: P) -> RunOptions {
        RunOptions {
            log: Some(log.into()),
            ..RunOptions::default()
        }
    }
}

/// An external tool invocation under construction.
///
/// `param` adds the `key=value` arguments that the visibility-processing
/// tool's parset syntax expects; `arg` adds anything else.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ExternalCommand {
    pub fn new<S: Into<String>>(program: S) -> ExternalCommand {
        ExternalCommand {
            program: program.into(),
            args: vec![],
            envs: vec![],
        }
    }

    pub fn arg<S: std::fmt::Display>(mut self, arg: S) -> ExternalCommand {
        self.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> ExternalCommand
    where
        I: IntoIterator<Item = S>,
        S: std::fmt::Display,
    {
        self.args.extend(args.into_iter().map(|a| a.to_string()));
        self
    }

    pub fn param<V: std::fmt::Display>(mut self, key: &str, value: V) -> ExternalCommand {
        self.args.push(format!("{key}={value}"));
        self
    }

    pub fn env<S: Into<String>, V: std::fmt::Display>(mut self, key: S, value: V) -> ExternalCommand {
        self.envs.push((key.into(), value.to_string()));
        self
    }

    /// The literal command line, as it would be typed.
    pub fn render(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }

    /// Run the command in `dir` and return its exit code.
    ///
    /// A non-zero exit is an error unless `opts.allow_failure` is set. A
    /// process killed by a signal reports -1.
    pub fn run_in(&self, dir: &Path, opts: &RunOptions) -> Result<i32, CommandError> {
        let rendered = self.render();
        info!("Running: {rendered}");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(dir);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        let code = match opts.log.as_deref() {
            None => {
                let status = cmd.status().map_err(|err| CommandError::Spawn {
                    command: rendered.clone(),
                    err,
                })?;
                status.code().unwrap_or(-1)
            }
            Some(log_path) => {
                let log_path = if log_path.is_absolute() {
                    log_path.to_path_buf()
                } else {
                    dir.join(log_path)
                };
                self.run_logged(&mut cmd, &rendered, &log_path, opts.quiet)?
            }
        };

        if code != 0 && !opts.allow_failure {
            return Err(CommandError::StageFailure {
                command: rendered,
                code,
            });
        }
        Ok(code)
    }

    fn run_logged(
        &self,
        cmd: &mut Command,
        rendered: &str,
        log_path: &Path,
        quiet: bool,
    ) -> Result<i32, CommandError> {
        let log_err = |err| CommandError::Log {
            command: rendered.to_string(),
            err,
        };

        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|err| CommandError::Spawn {
            command: rendered.to_string(),
            err,
        })?;

        let mut logfile = File::create(log_path).map_err(log_err)?;
        writeln!(logfile, "Running process with command: {rendered}").map_err(log_err)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = unbounded::<String>();
        let read_error = AtomicCell::new(false);
        let mut write_result: std::io::Result<()> = Ok(());

        scope(|s| {
            if let Some(pipe) = stdout {
                let tx = tx.clone();
                let read_error = &read_error;
                s.spawn(move || stream_lines(pipe, &tx, read_error));
            }
            if let Some(pipe) = stderr {
                let tx = tx.clone();
                let read_error = &read_error;
                s.spawn(move || stream_lines(pipe, &tx, read_error));
            }
            // All senders must be dropped for the receive loop to end.
            drop(tx);

            for line in rx.iter() {
                if !quiet {
                    println!("{line}");
                }
                let result = writeln!(logfile, "{}: {line}", timestamp_now())
                    .and_then(|_| logfile.flush());
                if let Err(err) = result {
                    write_result = Err(err);
                    break;
                }
            }
        });

        if read_error.load() {
            warn!("Transient read errors while streaming output of {rendered}");
        }
        write_result.map_err(log_err)?;

        let status = child.wait().map_err(|err| CommandError::Spawn {
            command: rendered.to_string(),
            err,
        })?;
        let code = status.code().unwrap_or(-1);
        writeln!(logfile, "Process terminated with return value {code}").map_err(log_err)?;
        Ok(code)
    }
}

/// Forward a subprocess output stream line-by-line. Interrupted reads are
/// retried; any other read error terminates the stream but is not fatal to
/// the command itself.
fn stream_lines<R: Read>(pipe: R, tx: &Sender<String>, read_error: &AtomicCell<bool>) {
    let mut reader = BufReader::new(pipe);
    let mut buf = String::new();
    loop {
        buf.clear();
        match reader.read_line(&mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = buf.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                read_error.store(true);
                warn!("Error reading subprocess output: {e}");
                break;
            }
        }
    }
}

fn timestamp_now() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Record a top-level invocation of this tool in the append-only call log
/// kept next to where it was invoked.
pub fn append_call_log(invocation_dir: &Path, command_line: &str) -> std::io::Result<()> {
    let mut handle = OpenOptions::new()
        .create(true)
        .append(true)
        .open(invocation_dir.join("calls.log"))?;
    writeln!(handle, "{command_line}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_serialises_in_order() {
        let cmd = ExternalCommand::new("DPPP")
            .param("numthreads", 80)
            .param("msin", "a.ms")
            .arg("extra")
            .param("steps", "[]");
        assert_eq!(cmd.render(), "DPPP numthreads=80 msin=a.ms extra steps=[]");
    }

    #[test]
    fn zero_exit_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let code = ExternalCommand::new("true")
            .run_in(dir.path(), &RunOptions::default())
            .unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn non_zero_exit_is_a_stage_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = ExternalCommand::new("false")
            .run_in(dir.path(), &RunOptions::default())
            .unwrap_err();
        match err {
            CommandError::StageFailure { command, code } => {
                assert_eq!(command, "false");
                assert_eq!(code, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn allow_failure_returns_the_code() {
        let dir = tempfile::tempdir().unwrap();
        let opts = RunOptions {
            allow_failure: true,
            ..RunOptions::default()
        };
        let code = ExternalCommand::new("false").run_in(dir.path(), &opts).unwrap();
        assert_eq!(code, 1);
    }

    #[test]
    fn logged_output_is_timestamped_and_framed() {
        let dir = tempfile::tempdir().unwrap();
        let opts = RunOptions {
            quiet: true,
            ..RunOptions::logged("echo.log")
        };
        let code = ExternalCommand::new("echo")
            .arg("hello")
            .arg("world")
            .run_in(dir.path(), &opts)
            .unwrap();
        assert_eq!(code, 0);

        let contents = std::fs::read_to_string(dir.path().join("echo.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Running process with command: echo hello world");
        // "YYYY-MM-DD HH:MM:SS: hello world"
        assert!(lines[1].ends_with(": hello world"), "{}", lines[1]);
        assert!(lines[1].starts_with(&chrono::Utc::now().format("%Y-").to_string()));
        assert_eq!(lines[2], "Process terminated with return value 0");
    }

    #[test]
    fn stderr_is_captured_too() {
        let dir = tempfile::tempdir().unwrap();
        let opts = RunOptions {
            quiet: true,
            allow_failure: true,
            ..RunOptions::logged("stderr.log")
        };
        ExternalCommand::new("sh")
            .arg("-c")
            .arg("echo oops >&2; exit 3")
            .run_in(dir.path(), &opts)
            .unwrap();
        let contents = std::fs::read_to_string(dir.path().join("stderr.log")).unwrap();
        assert!(contents.contains(": oops"));
        assert!(contents.contains("return value 3"));
    }

    #[test]
    fn call_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        append_call_log(dir.path(), "lodess loc1 --pipeline DI_calibrator").unwrap();
        append_call_log(dir.path(), "lodess loc1 --pipeline DD").unwrap();
        let contents = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with("--pipeline DD"));
    }
}
