//! External tool invocation.

use std::process::Stdio;

use gkeship_core::{Error, Result};
use tracing::{debug, info, trace};

/// How a command's stdout is echoed to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Echo {
    #[default]
    Quiet,
    Debug,
    Info,
}

/// Program plus leading arguments, parsed from a configured command line
/// such as `sudo gcloud`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
}

impl ToolCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| Error::config("empty tool command"))?;
        Ok(Self { program, args: parts.collect() })
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self { self.args.push(a.into()); self }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str { &self.program }

    pub fn arguments(&self) -> &[String] { &self.args }

    pub fn is_sudo(&self) -> bool { self.program == "sudo" }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str)).collect::<Vec<_>>().join(" ")
    }
}

impl std::fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.command_line()) }
}

/// Runs external commands and returns their stdout.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &ToolCommand, echo: Echo) -> Result<String>;
}

/// Spawns real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

fn trim_trailing_newline(mut s: String) -> String {
    if s.ends_with('\n') {
        s.pop();
        if s.ends_with('\r') {
            s.pop();
        }
    }
    s
}

#[async_trait::async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, cmd: &ToolCommand, echo: Echo) -> Result<String> {
        trace!(cmd = %cmd, "exec");
        let out = tokio::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            match echo {
                Echo::Quiet => {}
                Echo::Debug => debug!(target: "gkeship_ops::shell", "{}", line),
                Echo::Info => info!(target: "gkeship_ops::shell", "{}", line),
            }
        }
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            debug!(cmd = %cmd, code = ?out.status.code(), stderr = %stderr, "command failed");
            return Err(Error::ExternalToolFailure { command: cmd.command_line(), code: out.status.code(), stderr });
        }
        Ok(trim_trailing_newline(stdout))
    }
}

/// Scripted runner: replies by command-line prefix and records every call.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct ScriptedRunner {
        replies: Mutex<Vec<(String, Result<String>)>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self { Self::default() }

        /// Reply to the first command line starting with `prefix`. Replies are
        /// consumed in order when a prefix is registered more than once; the
        /// last one is sticky.
        pub fn reply(&self, prefix: &str, out: Result<String>) -> &Self {
            self.replies.lock().unwrap_or_else(|e| e.into_inner()).push((prefix.to_string(), out));
            self
        }

        pub fn ok(&self, prefix: &str, out: &str) -> &Self { self.reply(prefix, Ok(out.to_string())) }

        pub fn fail(&self, prefix: &str) -> &Self {
            self.reply(prefix, Err(Error::ExternalToolFailure { command: prefix.to_string(), code: Some(1), stderr: String::new() }))
        }

        pub fn calls(&self) -> Vec<String> { self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone() }
    }

    fn clone_result(r: &Result<String>) -> Result<String> {
        match r {
            Ok(s) => Ok(s.clone()),
            Err(Error::ExternalToolFailure { command, code, stderr }) => {
                Err(Error::ExternalToolFailure { command: command.clone(), code: *code, stderr: stderr.clone() })
            }
            Err(e) => Err(Error::config(e.to_string())),
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, cmd: &ToolCommand, _echo: Echo) -> Result<String> {
            let line = cmd.command_line();
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(line.clone());
            let mut replies = self.replies.lock().unwrap_or_else(|e| e.into_inner());
            let matching: Vec<usize> = replies.iter().enumerate().filter(|(_, (p, _))| line.starts_with(p.as_str())).map(|(i, _)| i).collect();
            match matching.as_slice() {
                [] => Ok(String::new()),
                [only] => clone_result(&replies[*only].1),
                [first, ..] => Ok(replies.remove(*first).1?),
            }
        }
    }
}
