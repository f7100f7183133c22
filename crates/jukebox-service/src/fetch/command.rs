use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::process::Command;

use super::{FetchRequest, Fetcher, expand_placeholders};
use crate::config::FetchConfig;
use crate::error::{FetchError, FetchResult};

/// The number of trailing stderr bytes included in error messages.
const STDERR_TAIL: usize = 1024;

/// Fetches by running an external program, `yt-dlp` by default.
#[derive(Clone, Debug)]
pub struct CommandFetcher {
    program: PathBuf,
    url_template: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandFetcher {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            program: config.program.clone(),
            url_template: config.url_template.clone(),
            args: config.args.clone(),
            timeout: config.timeout,
        }
    }

    fn args(&self, request: &FetchRequest<'_>) -> Vec<String> {
        let key = request.key.as_str();
        let url = expand_placeholders(&self.url_template, &[("key", key)]);
        let output_template = request.output_template.to_string_lossy();
        let output_path = request.output_path.to_string_lossy();
        let vars = [
            ("key", key),
            ("url", url.as_str()),
            ("output_template", output_template.as_ref()),
            ("output_path", output_path.as_ref()),
        ];

        self.args
            .iter()
            .map(|arg| expand_placeholders(arg, &vars))
            .collect()
    }

    #[tracing::instrument(name = "command_fetch", skip_all, fields(key = %request.key))]
    async fn run(&self, request: FetchRequest<'_>) -> FetchResult<PathBuf> {
        let program = self.program.display();
        let mut command = Command::new(&self.program);
        command
            .args(self.args(&request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(%program, "Starting fetch program");
        let child = command
            .spawn()
            .map_err(|err| FetchError::FetchFailed(format!("failed to start {program}: {err}")))?;

        // Dropping the future kills the child.
        let output = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Err(FetchError::Cancelled),
            output = tokio::time::timeout(self.timeout, child.wait_with_output()) => output,
        };
        let output = match output {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(FetchError::FetchFailed(format!(
                    "failed to wait for {program}: {err}"
                )));
            }
            Err(_) => {
                return Err(FetchError::FetchFailed(format!(
                    "{program} timed out after {:?}",
                    self.timeout
                )));
            }
        };

        if !output.status.success() {
            let stderr = stderr_tail(&output.stderr);
            tracing::warn!(%program, status = %output.status, %stderr, "Fetch program failed");
            return Err(FetchError::FetchFailed(format!(
                "{program} exited with {}: {stderr}",
                output.status
            )));
        }

        check_output(request.output_path).await?;
        Ok(request.output_path.to_owned())
    }
}

impl Fetcher for CommandFetcher {
    fn fetch<'a>(&'a self, request: FetchRequest<'a>) -> BoxFuture<'a, FetchResult<PathBuf>> {
        Box::pin(self.run(request))
    }
}

async fn check_output(path: &Path) -> FetchResult {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        Ok(_) => Err(FetchError::FetchFailed(format!(
            "empty output at {}",
            path.display()
        ))),
        Err(err) => Err(FetchError::FetchFailed(format!(
            "no output at {}: {err}",
            path.display()
        ))),
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&stderr[start..]).trim().to_owned()
}
