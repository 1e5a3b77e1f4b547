//! Guest Command Layer
//!
//! Builds safely-quoted PowerShell invocations and interprets their output.
//! The host wrapper always runs the guest shell with one `-Command` payload;
//! the rendered command line wraps the whole script in outer double quotes
//! and every embedded path in single quotes. Inner double quotes are never
//! backslash-escaped; the builder rejects script fragments that would need
//! them. Raw path strings must never reach the shell without passing
//! through [`quote_path`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::VmSpec;
use crate::controller::VmController;
use crate::{Error, Result};

const POWERSHELL: &str = "powershell.exe";

/// Shell prompt marker filtered out of guest stdout.
const PROMPT_MARKER: &str = "PS ";

/// Wrap a path in single quotes for a PowerShell payload. Single quotes
/// inside the path are doubled, the shell's own escape convention.
pub fn quote_path(path: &str) -> String {
    let mut quoted = String::with_capacity(path.len() + 2);
    quoted.push('\'');
    for c in path.chars() {
        if c == '\'' {
            quoted.push('\'');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

/// A composed guest shell command: one program plus argv, with the whole
/// script as a single `-Command` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCommand {
    script: String,
}

impl GuestCommand {
    /// Build from script fragments. Paths must already be quoted via
    /// [`quote_path`]; use [`GuestCommandBuilder`] to compose safely.
    fn new(script: String) -> Result<Self> {
        if script.contains('"') {
            return Err(Error::Guest(format!(
                "double quote in guest script (nested escaping is forbidden): {}",
                script
            )));
        }
        Ok(Self { script })
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    /// The argv handed to the controller: program + flat argument list.
    pub fn argv(&self) -> (String, Vec<String>) {
        (
            POWERSHELL.to_string(),
            vec![
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
                "-Command".to_string(),
                self.script.clone(),
            ],
        )
    }

    /// The full command line as executed in the guest: outer double quotes
    /// around the payload, nothing backslash-escaped. This rendering is the
    /// golden form asserted by tests and written to logs.
    pub fn command_line(&self) -> String {
        format!(
            "{} -NoProfile -NonInteractive -Command \"{}\"",
            POWERSHELL, self.script
        )
    }
}

/// Fragment-by-fragment builder keeping the quoting rules in one place.
#[derive(Debug, Default)]
pub struct GuestCommandBuilder {
    parts: Vec<String>,
}

impl GuestCommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append literal script text.
    pub fn raw(mut self, text: &str) -> Self {
        self.parts.push(text.to_string());
        self
    }

    /// Append a single-quoted path.
    pub fn path(mut self, path: &str) -> Self {
        self.parts.push(quote_path(path));
        self
    }

    pub fn build(self) -> Result<GuestCommand> {
        GuestCommand::new(self.parts.join(" "))
    }
}

/// The echo-filter over stdout that is expected to be a list of file names.
/// Filters, in order: empty lines, prompt-marker lines, lines containing
/// shell control tokens, lines that begin with the invoked cmdlet (command
/// echo). Anything surviving is a data line.
pub fn filter_listing_lines<'a>(stdout: &'a str, cmdlet: &str) -> Vec<&'a str> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with(PROMPT_MARKER))
        .filter(|line| !line.contains(['|', '{', '}']))
        .filter(|line| !line.starts_with(cmdlet))
        .collect()
}

/// Interpret an exists-probe: the literal `True`/`true` on its own line
/// means present; anything else, including command echo, means absent.
pub fn parse_bool_probe(stdout: &str) -> bool {
    stdout
        .lines()
        .any(|line| matches!(line.trim(), "True" | "true"))
}

/// Standardized guest filesystem and execution primitives for one VM,
/// composed over the controller's single-program exec seam.
pub struct GuestShell {
    controller: Arc<dyn VmController>,
    vm_name: String,
    user: String,
    password: String,
}

impl GuestShell {
    pub fn new(controller: Arc<dyn VmController>, vm: &VmSpec) -> Self {
        Self {
            controller,
            vm_name: vm.name.clone(),
            user: vm.user.clone(),
            password: vm.password.clone(),
        }
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    /// Run a composed command in the guest and capture its output.
    pub async fn run_command(
        &self,
        command: &GuestCommand,
        deadline: Duration,
    ) -> Result<crate::controller::GuestExecOutput> {
        let (program, args) = command.argv();
        debug!(vm = %self.vm_name, cmd = %command.command_line(), "guest exec");
        self.controller
            .exec_in_guest(&self.vm_name, &program, &args, &self.user, &self.password, deadline)
            .await
    }

    /// Probe whether a guest path exists.
    pub async fn path_exists(&self, path: &str, deadline: Duration) -> Result<bool> {
        let command = GuestCommandBuilder::new()
            .raw("if (Test-Path -LiteralPath")
            .path(path)
            .raw(") { Write-Output 'True' } else { Write-Output 'False' }")
            .build()?;
        let output = self.run_command(&command, deadline).await?;
        if !output.success() {
            // Non-zero exit counts as failure even with an empty stderr.
            return Err(Error::Guest(format!(
                "exists probe on '{}' exited {}",
                path, output.exit_code
            )));
        }
        Ok(parse_bool_probe(&output.stdout))
    }

    /// Delete a guest file or directory tree.
    pub async fn delete_path(&self, path: &str, deadline: Duration) -> Result<()> {
        let command = GuestCommandBuilder::new()
            .raw("Remove-Item -LiteralPath")
            .path(path)
            .raw("-Force -Recurse -ErrorAction Stop")
            .build()?;
        let output = self.run_command(&command, deadline).await?;
        if !output.success() {
            return Err(Error::Guest(format!(
                "delete of '{}' exited {}: {}",
                path,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// List file names under a guest directory.
    pub async fn list_files(
        &self,
        dir: &str,
        recursive: bool,
        deadline: Duration,
    ) -> Result<Vec<String>> {
        let mut builder = GuestCommandBuilder::new()
            .raw("Get-ChildItem -LiteralPath")
            .path(dir)
            .raw("-Name");
        if recursive {
            builder = builder.raw("-Recurse");
        }
        let command = builder.build()?;
        let output = self.run_command(&command, deadline).await?;
        if !output.success() {
            return Err(Error::Guest(format!(
                "listing of '{}' exited {}",
                dir, output.exit_code
            )));
        }
        Ok(filter_listing_lines(&output.stdout, "Get-ChildItem")
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    /// Launch a guest executable fire-and-forget: the start is requested,
    /// the exit is never awaited. A sample that blocks or loops is
    /// terminated by the next snapshot restore, not by us.
    pub fn run_executable(&self, path: &str, args: &[String], upper_timeout: Duration) -> Result<()> {
        let mut builder = GuestCommandBuilder::new()
            .raw("Start-Process -FilePath")
            .path(path);
        if !args.is_empty() {
            let list = args
                .iter()
                .map(|a| quote_path(a))
                .collect::<Vec<_>>()
                .join(",");
            builder = builder.raw("-ArgumentList").raw(&list);
        }
        let command = builder.build()?;

        let controller = Arc::clone(&self.controller);
        let vm_name = self.vm_name.clone();
        let user = self.user.clone();
        let password = self.password.clone();
        let (program, argv) = command.argv();
        let rendered = command.command_line();
        tokio::spawn(async move {
            let result = controller
                .exec_in_guest(&vm_name, &program, &argv, &user, &password, upper_timeout)
                .await;
            if let Err(err) = result {
                warn!(vm = %vm_name, cmd = %rendered, %err, "detached guest execution errored");
            }
        });
        Ok(())
    }
}
