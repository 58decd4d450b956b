use std::process::Command;

use domain::network::error::KernelError;

/// Runs an external tool and returns its standard output.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<String, KernelError>;
}

/// Spawns real processes.
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String, KernelError> {
        let operation = operation_label(program, args);
        tracing::trace!(program, args = %args.join(" "), "exec");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| KernelError::new(&operation, format!("spawn failed: {e}")))?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = if stderr.trim().is_empty() {
            format!("exited unsuccessfully: {}", output.status)
        } else {
            stderr.trim().to_string()
        };
        let err = KernelError::new(operation, reason);
        Err(match output.status.code() {
            Some(code) => err.with_code(code),
            None => err,
        })
    }
}

/// Short label such as `"ip rule add"`: the program plus its first two
/// non-flag arguments.
pub fn operation_label(program: &str, args: &[String]) -> String {
    let name = program.rsplit('/').next().unwrap_or(program);
    let mut label = name.to_string();
    for arg in args.iter().filter(|a| !a.starts_with('-')).take(2) {
        label.push(' ');
        label.push_str(arg);
    }
    label
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    type Responder = Box<dyn Fn(&str) -> Result<String, KernelError> + Send + Sync>;

    /// Records command lines and answers from a scripted responder.
    pub struct RecordingRunner {
        lines: Mutex<Vec<String>>,
        responder: Responder,
    }

    impl RecordingRunner {
        pub fn ok() -> Self {
            Self::with(|_| Ok(String::new()))
        }

        pub fn with(
            responder: impl Fn(&str) -> Result<String, KernelError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                lines: Mutex::new(Vec::new()),
                responder: Box::new(responder),
            }
        }

        pub fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }

        pub fn clear(&self) {
            self.lines.lock().unwrap().clear();
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, program: &str, args: &[String]) -> Result<String, KernelError> {
            let line = format!("{program} {}", args.join(" "));
            self.lines.lock().unwrap().push(line.clone());
            (self.responder)(&line)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(ToString::to_string).collect()
    }

    #[test]
    fn label_skips_flags_and_path() {
        assert_eq!(
            operation_label("/sbin/ip", &args("-6 rule add priority 16000")),
            "ip rule add"
        );
        assert_eq!(operation_label("ss", &args("-V")), "ss");
    }

    #[test]
    fn system_runner_reports_missing_binary() {
        let err = SystemCommandRunner
            .run("/nonexistent/physnetd-test-binary", &args("rule add"))
            .unwrap_err();
        assert_eq!(err.operation, "physnetd-test-binary rule add");
        assert!(err.reason.contains("spawn failed"));
    }
}
