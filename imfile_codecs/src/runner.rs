use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;

use tracing::debug;

use imfile_core::{CommandRunner, ImageError, ShellRunner};

use crate::codec::{Codec, Direction};
use crate::codec_by_program;

/// A filled-in command line that can run in-process.
///
/// Understood syntax: `program [flags] [input] [< input] [> output]`, where
/// flags are `-c`, `-q`, `-f`, `-k`, `--stdout`, `-d`/`--decompress` and a
/// numeric level such as `-9`. Anything else, including any shell syntax
/// such as pipes, quoting, variables or `2>` style redirects, makes
/// [`Invocation::parse`] return `None`.
pub struct Invocation {
    pub program: String,
    codec: Box<dyn Codec>,
    pub direction: Direction,
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

impl Invocation {
    pub fn parse(command: &str) -> Option<Self> {
        let mut tokens = command.split_whitespace();
        let program = tokens.next()?.to_string();

        let mut level = None;
        let mut decompress_flag = false;
        let mut input = None;
        let mut output = None;
        while let Some(token) = tokens.next() {
            if needs_shell(token) {
                return None;
            }
            match token {
                "-c" | "-q" | "-f" | "-k" | "--stdout" => {}
                "-d" | "--decompress" => decompress_flag = true,
                ">" => output = Some(PathBuf::from(tokens.next()?)),
                "<" => input = Some(PathBuf::from(tokens.next()?)),
                t if t.len() > 1 && t.starts_with('-') && t[1..].bytes().all(|b| b.is_ascii_digit()) => {
                    level = t[1..].parse().ok();
                }
                t if t.starts_with('>') && t.len() > 1 => output = Some(PathBuf::from(&t[1..])),
                t if t.starts_with('<') && t.len() > 1 => input = Some(PathBuf::from(&t[1..])),
                t if !t.starts_with('-') && input.is_none() => input = Some(PathBuf::from(t)),
                _ => return None,
            }
        }

        let (codec, mut direction) = codec_by_program(&program, level)?;
        if decompress_flag {
            direction = Direction::Decompress;
        }
        Some(Self {
            program,
            codec,
            direction,
            input,
            output,
        })
    }

    /// Run against `input`/`output` unless the command names files.
    /// Returns the number of bytes produced.
    pub fn execute(&self, input: &mut dyn Read, output: &mut dyn Write) -> anyhow::Result<u64> {
        let data = match &self.input {
            Some(path) => fs::read(path)?,
            None => {
                let mut buf = Vec::new();
                input.read_to_end(&mut buf)?;
                buf
            }
        };
        let result = self.codec.apply(self.direction, &data)?;
        match &self.output {
            Some(path) => fs::write(path, &result)?,
            None => output.write_all(&result)?,
        }
        debug!(
            program = %self.program,
            direction = ?self.direction,
            bytes_in = data.len(),
            bytes_out = result.len(),
            "in-process codec finished"
        );
        Ok(result.len() as u64)
    }
}

/// Runs compression commands with the bundled codecs, never spawning a
/// process. Commands naming any other program fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecRunner;

impl CommandRunner for CodecRunner {
    fn run(
        &self,
        command: &str,
        input: &mut (dyn Read + Send),
        output: &mut dyn Write,
    ) -> imfile_core::Result<u64> {
        let invocation = Invocation::parse(command).ok_or_else(|| {
            ImageError::Compression(format!("`{}` has no in-process codec", command))
        })?;
        run_invocation(&invocation, input, output)
    }
}

/// Uses the bundled codecs when a command allows it and `sh -c` otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct HybridRunner {
    shell: ShellRunner,
}

impl CommandRunner for HybridRunner {
    fn run(
        &self,
        command: &str,
        input: &mut (dyn Read + Send),
        output: &mut dyn Write,
    ) -> imfile_core::Result<u64> {
        match Invocation::parse(command) {
            Some(invocation) => run_invocation(&invocation, input, output),
            None => {
                debug!(command, "no in-process codec, falling back to shell");
                self.shell.run(command, input, output)
            }
        }
    }
}

/// Tokens only a shell can interpret. A leading `<`/`>` is a redirect the
/// parser handles itself.
fn needs_shell(token: &str) -> bool {
    const META: &[char] = &['|', ';', '&', '$', '\'', '"', '`', '\\', '*', '?', '(', ')', '{', '}', '~'];
    token.contains(META) || token.chars().skip(1).any(|c| c == '<' || c == '>')
}

fn run_invocation(
    invocation: &Invocation,
    input: &mut (dyn Read + Send),
    output: &mut dyn Write,
) -> imfile_core::Result<u64> {
    invocation
        .execute(input, output)
        .map_err(|e| ImageError::Compression(format!("{} failed: {:#}", invocation.program, e)))
}
