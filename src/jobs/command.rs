//! Work unit that runs an external program in a child process.

use super::context::JobContext;
use super::error::WorkUnitError;
use super::output::OutputStream;
use super::work_unit::WorkUnit;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long the worker waits for a line before re-checking for cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs `program args...` as a child process.
///
/// Every stdout line becomes an `Output` record and every stderr line an
/// `Error` record, in arrival order. A non-zero exit status fails the job.
/// When the job is stopped the child is killed.
#[derive(Debug, Clone)]
pub struct CommandUnit {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandUnit {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program = program.into();
        Self {
            name: program.clone(),
            program,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Kill the child and reap it.
    fn kill(&self, child: &mut Child, ctx: &JobContext) {
        if let Err(e) = child.kill() {
            warn!("Failed to kill {} for job {}: {}", self.program, ctx.job_id(), e);
        }
        if let Err(e) = child.wait() {
            warn!("Failed to reap {} for job {}: {}", self.program, ctx.job_id(), e);
        }
    }

    fn spawn(&self) -> Result<Child, WorkUnitError> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WorkUnitError::failed(format!("Failed to spawn {}: {}", self.program, e)))
    }
}

/// Forward every line of `reader` into `tx`, tagged with `stream`.
fn forward_lines<R: Read + Send + 'static>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<(OutputStream, String)>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("job-{}-reader", stream.as_str()))
        .spawn(move || {
            for line in BufReader::new(reader).lines() {
                match line {
                    Ok(line) => {
                        if tx.send((stream, line)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Stopped reading child {}: {}", stream.as_str(), e);
                        break;
                    }
                }
            }
        })
}

impl WorkUnit for CommandUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, ctx: &JobContext) -> Result<(), WorkUnitError> {
        ctx.checkpoint()?;
        let mut child = self.spawn()?;

        // Both pipes feed one channel so that only this thread appends to
        // the job's output.
        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::with_capacity(2);
        let pipes = [
            child.stdout.take().map(|p| Box::new(p) as Box<dyn Read + Send>),
            child.stderr.take().map(|p| Box::new(p) as Box<dyn Read + Send>),
        ];
        for (pipe, stream) in pipes
            .into_iter()
            .zip([OutputStream::Output, OutputStream::Error])
        {
            let Some(pipe) = pipe else { continue };
            match forward_lines(pipe, stream, tx.clone()) {
                Ok(reader) => readers.push(reader),
                Err(e) => {
                    self.kill(&mut child, ctx);
                    return Err(e.into());
                }
            }
        }
        drop(tx);

        let mut cancelled = false;
        loop {
            // Checked every iteration: a child printing faster than the poll
            // interval never lets recv_timeout time out.
            if ctx.is_cancelled() {
                cancelled = true;
                break;
            }
            match rx.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok((stream, line)) => ctx.write(stream, line),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        if cancelled {
            self.kill(&mut child, ctx);
            return Err(WorkUnitError::Cancelled);
        }

        let status = child.wait()?;
        for reader in readers {
            let _ = reader.join();
        }

        if status.success() {
            Ok(())
        } else {
            Err(WorkUnitError::failed(format!(
                "{} exited with {}",
                self.program, status
            )))
        }
    }
}
