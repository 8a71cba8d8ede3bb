//! Installation Verifier: runs the linked executable and checks that it
//! reports the expected version.

use log::info;
use std::path::Path;
use std::time::Duration;

use crate::error::InstallError;
use crate::runtime::{CommandRequest, Runtime};

pub struct Verifier<'a, R: Runtime> {
    runtime: &'a R,
    timeout: Duration,
}

impl<'a, R: Runtime> Verifier<'a, R> {
    pub fn new(runtime: &'a R, timeout: Duration) -> Self {
        Self { runtime, timeout }
    }

    /// Returns the captured output on success.
    #[tracing::instrument(skip(self))]
    pub async fn verify(
        &self,
        executable: &Path,
        args: &[String],
        expected: &str,
    ) -> Result<String, InstallError> {
        let failed = |reason: String| InstallError::Verification {
            executable: executable.to_path_buf(),
            reason,
        };

        let request = CommandRequest::new(executable, self.timeout).args(args.iter().cloned());
        let output = self
            .runtime
            .run_command(&request)
            .await
            .map_err(|e| failed(format!("{:#}", e)))?;

        if !output.success() {
            let code = output
                .code
                .map_or_else(|| "a signal".to_string(), |c| c.to_string());
            return Err(failed(format!(
                "exited with {}: {}",
                code,
                output.stderr.trim()
            )));
        }

        let text = format!("{}{}", output.stdout, output.stderr);
        if !text.contains(expected) {
            return Err(failed(format!(
                "output '{}' does not contain the expected version {}",
                text.trim(),
                expected
            )));
        }

        info!("{:?} reports {}", executable, output.stdout.trim());
        Ok(text.trim().to_string())
    }
}
