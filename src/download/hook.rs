//! Post-processing hook run on each fetched file before it is published.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

/// Upper bound on one hook run.
const HOOK_TIMEOUT: Duration = Duration::from_secs(600);

/// An external program invoked with the fetched file's path as its only argument.
///
/// The program may rewrite the file in place. Its failure never fails the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostProcessHook {
    program: PathBuf,
    timeout: Duration,
}

impl PostProcessHook {
    /// Creates a hook for `program` with the default timeout.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: HOOK_TIMEOUT,
        }
    }

    /// Overrides the run timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Program path.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Runs the hook on `file`. Returns whether it exited successfully.
    ///
    /// Spawn errors, non-zero exits and timeouts are logged and reported as `false`.
    pub async fn run(&self, id: &str, file: &Path) -> bool {
        info!(id, program = %self.program.display(), "running post-process hook");
        let child = Command::new(&self.program)
            .arg(file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) if output.status.success() => {
                debug!(id, "post-process hook succeeded");
                true
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(
                    id,
                    status = %output.status,
                    stderr = %stderr.trim(),
                    "post-process hook failed"
                );
                false
            }
            Ok(Err(error)) => {
                warn!(id, error = %error, program = %self.program.display(), "post-process hook could not start");
                false
            }
            Err(_) => {
                warn!(id, timeout_secs = self.timeout.as_secs(), "post-process hook timed out");
                false
            }
        }
    }
}
