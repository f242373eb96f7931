use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::thread;

use tracing::debug;

use crate::error::{ImageError, IoContext, Result};

/// Executes a filled-in compression or decompression command.
///
/// `input` is streamed to the command's standard input and its standard
/// output is copied into `output`. Returns the number of bytes written to
/// `output`. A command that fails to run or exits unsuccessfully is an
/// [`ImageError::Compression`].
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        command: &str,
        input: &mut (dyn Read + Send),
        output: &mut dyn Write,
    ) -> Result<u64>;
}

/// Runs commands through `sh -c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(
        &self,
        command: &str,
        input: &mut (dyn Read + Send),
        output: &mut dyn Write,
    ) -> Result<u64> {
        debug!(command, "spawning shell command");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .io_context("Failed to spawn compression command")?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ImageError::compression("command stdin unavailable"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ImageError::compression("command stdout unavailable"))?;

        // stdin and stdout must be serviced concurrently
        let (copied, fed) = thread::scope(|s| {
            let feeder = s.spawn(move || -> io::Result<u64> {
                match io::copy(input, &mut stdin) {
                    // the command is free to stop reading early
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(0),
                    other => other,
                }
            });
            let copied = io::copy(&mut stdout, output);
            let fed = feeder
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")));
            (copied, fed)
        });

        let status = child.wait().io_context("Failed to wait for compression command")?;
        let copied = copied.io_context("Compression command output failed")?;
        fed.io_context("Compression command input failed")?;

        if !status.success() {
            return Err(ImageError::compression(format!(
                "command `{}` exited with {}",
                command, status
            )));
        }
        Ok(copied)
    }
}
