//! Runs the database update scripts and reports failures by mail.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};

/// Options of `genefetch update`.
#[derive(Clone, Debug, clap::Args)]
pub struct UpdateArgs {
    /// The user the scripts upload their results as.
    #[arg(long, short)]
    pub user: String,

    /// The password of `--user`.
    #[arg(long, short)]
    pub password: String,

    /// Directory receiving one `<script>.log.txt` per script.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub log_dir: PathBuf,

    /// Addresses to mail the log of a failing script to.
    #[arg(long, value_delimiter = ',')]
    pub mailto: Vec<String>,

    /// Runs every script through this program instead of executing it directly.
    #[arg(long, value_name = "PROGRAM")]
    pub interpreter: Option<PathBuf>,

    /// The `sendmail` compatible program used to deliver failure reports.
    #[arg(long, value_name = "PROGRAM", default_value = "sendmail")]
    pub sendmail: PathBuf,

    /// The update scripts to run, in order.
    #[arg(required = true)]
    pub scripts: Vec<PathBuf>,
}

/// The result of running one update script.
#[derive(Debug)]
pub struct ScriptRun {
    pub name: String,
    pub log: PathBuf,
    /// The exit status, or `None` if the script could not be started.
    pub status: Option<ExitStatus>,
}

impl ScriptRun {
    pub fn success(&self) -> bool {
        self.status.is_some_and(|status| status.success())
    }
}

fn script_name(script: &Path) -> String {
    script
        .file_name()
        .unwrap_or(script.as_os_str())
        .to_string_lossy()
        .into_owned()
}

/// Runs `script` with its stdout and stderr captured in its log file.
pub fn run_script(args: &UpdateArgs, script: &Path) -> Result<ScriptRun> {
    let name = script_name(script);
    let log = args.log_dir.join(format!("{name}.log.txt"));
    let mut log_file =
        File::create(&log).with_context(|| format!("failed to create {}", log.display()))?;

    let mut command = match args.interpreter {
        Some(ref interpreter) => {
            let mut command = Command::new(interpreter);
            command.arg(script);
            command
        }
        None => Command::new(script),
    };
    command
        .args(["-u", &args.user, "-p", &args.password])
        .stdin(Stdio::null())
        .stdout(log_file.try_clone()?)
        .stderr(log_file.try_clone()?);

    tracing::info!(script = %name, "running update script");
    let status = match command.status() {
        Ok(status) => {
            write!(log_file, "\n{name} exited with {status}\n")?;
            if status.success() {
                tracing::info!(script = %name, "update script finished");
            } else {
                tracing::error!(
                    script = %name,
                    %status,
                    log = %log.display(),
                    "update script failed"
                );
            }
            Some(status)
        }
        Err(err) => {
            writeln!(log_file, "failed to run {}: {err}", script.display())?;
            tracing::error!(
                script = %name,
                error = &err as &dyn std::error::Error,
                log = %log.display(),
                "failed to start update script"
            );
            None
        }
    };
    log_file.sync_all()?;

    Ok(ScriptRun { name, log, status })
}

/// Formats the failure report of `run` as a mail for `sendmail -t`.
fn failure_mail(run: &ScriptRun, mailto: &[String]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    File::open(&run.log)
        .and_then(|mut file| file.read_to_end(&mut body))
        .with_context(|| format!("failed to read {}", run.log.display()))?;

    let mut mail = format!(
        "To: {}\r\nSubject: Error running {} update script\r\n\r\n",
        mailto.join(","),
        run.name
    )
    .into_bytes();
    mail.extend_from_slice(&body);
    Ok(mail)
}

fn send_mail(sendmail: &Path, mail: &[u8]) -> Result<()> {
    let mut child = Command::new(sendmail)
        .arg("-t")
        .stdin(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to start {}", sendmail.display()))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(mail)?;
    }
    let status = child.wait()?;
    if !status.success() {
        anyhow::bail!("{} exited with {status}", sendmail.display());
    }
    Ok(())
}

/// Runs all scripts, mailing the logs of failing ones.
///
/// Every script runs even if an earlier one failed. Fails if any script failed.
pub fn run(args: &UpdateArgs) -> Result<()> {
    fs::create_dir_all(&args.log_dir)
        .with_context(|| format!("failed to create {}", args.log_dir.display()))?;

    let mut failed = Vec::new();
    for script in &args.scripts {
        let run = run_script(args, script)?;
        if run.success() {
            continue;
        }
        if !args.mailto.is_empty() {
            let mailed = failure_mail(&run, &args.mailto)
                .and_then(|mail| send_mail(&args.sendmail, &mail));
            if let Err(err) = mailed {
                tracing::error!(
                    script = %run.name,
                    error = err.as_ref() as &dyn std::error::Error,
                    "failed to send error report"
                );
            }
        }
        failed.push(run.name);
    }

    match failed.is_empty() {
        true => Ok(()),
        false => anyhow::bail!("update scripts failed: {}", failed.join(", ")),
    }
}
