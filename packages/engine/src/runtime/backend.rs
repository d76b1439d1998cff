// packages/engine/src/runtime/backend.rs
//! Render backends
//!
//! A backend knows how to turn a snippet into an [`ExecPayload`] for the
//! in-container renderer, how to read the renderer's output back, and how to
//! ask a worker whether it is still alive. The pool is configured with one
//! backend and hands it to every lease.
//!
//! - **Entrypoint**: the image ships a renderer that reads source on stdin
//!   and writes the image to stdout.
//! - **Template**: the snippet is wrapped in a screenshot harness, written
//!   into the work directory, run by an interpreter, and the resulting file
//!   is streamed back.

use crate::dispatch::display::DisplaySize;
use crate::runtime::container::{ExecOutput, ExecPayload};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Lines of stderr kept in a diagnostic
const DIAGNOSTIC_MAX_LINES: usize = 50;

/// Bytes of stderr kept in a diagnostic
const DIAGNOSTIC_MAX_BYTES: usize = 8 * 1024;

const DEFAULT_TEMPLATE: &str = include_str!("../../templates/screenshot_harness.py");

/// One render to perform
#[derive(Debug, Clone, Copy)]
pub struct RenderJob<'a> {
    pub source: &'a str,
    pub display: DisplaySize,
    pub deadline: Duration,
}

/// Interpreted result of a render execution
#[derive(Debug, Clone, PartialEq)]
pub enum RenderOutput {
    /// The renderer produced an image
    Image(Bytes),

    /// The submitted code failed; carries the diagnostic text
    Error(String),
}

/// Capability interface for one kind of in-container renderer
pub trait RenderBackend: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &'static str;

    /// Payload that renders `job`
    fn render_payload(&self, job: &RenderJob<'_>) -> ExecPayload;

    /// Interpret a finished render execution
    fn interpret(&self, output: ExecOutput) -> RenderOutput {
        if output.success() {
            if output.stdout.is_empty() {
                RenderOutput::Error("renderer exited without producing an image".to_string())
            } else {
                RenderOutput::Image(output.stdout)
            }
        } else {
            RenderOutput::Error(diagnostic(&output))
        }
    }

    /// Lightweight liveness check payload
    fn probe_payload(&self) -> ExecPayload;

    /// Whether a probe execution passed
    fn probe_ok(&self, output: &ExecOutput) -> bool {
        output.success()
    }
}

/// Tail of stderr plus the exit status, bounded in size
pub fn diagnostic(output: &ExecOutput) -> String {
    let lines: Vec<&str> = output
        .stderr
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(DIAGNOSTIC_MAX_LINES);
    let mut tail = lines[start..].join("\n");

    if tail.len() > DIAGNOSTIC_MAX_BYTES {
        let mut cut = tail.len() - DIAGNOSTIC_MAX_BYTES;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail = tail[cut..].to_string();
    }

    let status = match output.exit_code {
        Some(code) => format!("renderer exited with code {}", code),
        None => "renderer was killed by a signal".to_string(),
    };

    if tail.is_empty() {
        status
    } else {
        format!("{}\n{}", status, tail)
    }
}

/// Backend selection, as read from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Entrypoint {
        /// Renderer command inside the image
        command: Vec<String>,
        /// Liveness check command
        probe: Vec<String>,
    },
    Template {
        /// Interpreter that runs the wrapped script
        interpreter: Vec<String>,
        /// Directory the script and screenshot are written to
        work_dir: String,
        /// Harness template; the built-in one is used when unset
        template: Option<String>,
        /// Liveness check command
        probe: Vec<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Entrypoint {
            command: vec!["render-entrypoint".to_string()],
            probe: vec!["true".to_string()],
        }
    }
}

impl BackendConfig {
    /// Build the configured backend
    pub fn build(&self) -> Arc<dyn RenderBackend> {
        match self {
            BackendConfig::Entrypoint { command, probe } => {
                Arc::new(EntrypointBackend::new(command.clone()).with_probe(probe.clone()))
            }
            BackendConfig::Template {
                interpreter,
                work_dir,
                template,
                probe,
            } => {
                let mut backend = TemplateBackend::new(interpreter.clone(), work_dir.clone())
                    .with_probe(probe.clone());
                if let Some(template) = template {
                    backend = backend.with_template(template.clone());
                }
                Arc::new(backend)
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let (command, probe) = match self {
            BackendConfig::Entrypoint { command, probe } => (command, probe),
            BackendConfig::Template {
                interpreter, probe, ..
            } => (interpreter, probe),
        };
        if command.is_empty() {
            return Err("Backend command cannot be empty".to_string());
        }
        if probe.is_empty() {
            return Err("Backend probe command cannot be empty".to_string());
        }
        Ok(())
    }
}

/// Renderer that reads source on stdin and writes the image to stdout
#[derive(Debug, Clone)]
pub struct EntrypointBackend {
    command: Vec<String>,
    probe: Vec<String>,
}

impl EntrypointBackend {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            probe: vec!["true".to_string()],
        }
    }

    pub fn with_probe(mut self, probe: Vec<String>) -> Self {
        self.probe = probe;
        self
    }
}

impl RenderBackend for EntrypointBackend {
    fn name(&self) -> &'static str {
        "entrypoint"
    }

    fn render_payload(&self, job: &RenderJob<'_>) -> ExecPayload {
        let mut command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("\"$@\"; {}", CONFINE_EXIT_CODE),
            "render".to_string(),
        ];
        command.extend(self.command.iter().cloned());

        ExecPayload::new(command)
            .with_env("RENDER_WIDTH", job.display.width.to_string())
            .with_env("RENDER_HEIGHT", job.display.height.to_string())
            .with_env("RENDER_DEADLINE_SECS", job.deadline.as_secs().to_string())
            .with_stdin(Bytes::copy_from_slice(job.source.as_bytes()))
    }

    fn probe_payload(&self) -> ExecPayload {
        ExecPayload::new(self.probe.iter().cloned())
    }
}

/// Renderer that wraps the snippet in a screenshot harness
#[derive(Debug, Clone)]
pub struct TemplateBackend {
    interpreter: Vec<String>,
    work_dir: String,
    template: String,
    probe: Vec<String>,
}

impl TemplateBackend {
    const SCRIPT_NAME: &'static str = "main.py";
    const SCREENSHOT_NAME: &'static str = "screenshot.png";

    pub fn new(interpreter: Vec<String>, work_dir: impl Into<String>) -> Self {
        Self {
            interpreter,
            work_dir: work_dir.into(),
            template: DEFAULT_TEMPLATE.to_string(),
            probe: vec!["true".to_string()],
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn with_probe(mut self, probe: Vec<String>) -> Self {
        self.probe = probe;
        self
    }

    fn screenshot_path(&self) -> String {
        format!("{}/{}", self.work_dir.trim_end_matches('/'), Self::SCREENSHOT_NAME)
    }

    /// Harness with the snippet and display settings substituted in
    pub fn wrap(&self, job: &RenderJob<'_>) -> String {
        // User code goes in last so its own braces are never re-substituted
        self.template
            .replace("{width}", &job.display.width.to_string())
            .replace("{height}", &job.display.height.to_string())
            .replace("{output_path}", &self.screenshot_path())
            .replace("{user_code}", job.source)
    }

    fn shell_script(&self) -> String {
        let dir = self.work_dir.trim_end_matches('/');
        let interpreter = self
            .interpreter
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");

        // Interpreter output goes to stderr so stdout carries only the image
        format!(
            "set -e; rm -rf {dir}; mkdir -p {dir}; cd {dir}; \
             cat > {script}; \
             {interpreter} {script} 1>&2 || {{ {confine} }}; \
             cat {screenshot}",
            dir = shell_quote(dir),
            script = Self::SCRIPT_NAME,
            interpreter = interpreter,
            confine = CONFINE_EXIT_CODE,
            screenshot = shell_quote(&self.screenshot_path()),
        )
    }
}

impl RenderBackend for TemplateBackend {
    fn name(&self) -> &'static str {
        "template"
    }

    fn render_payload(&self, job: &RenderJob<'_>) -> ExecPayload {
        ExecPayload::new(["/bin/sh".to_string(), "-c".to_string(), self.shell_script()])
            .with_env("RENDER_DEADLINE_SECS", job.deadline.as_secs().to_string())
            .with_stdin(self.wrap(job))
    }

    fn probe_payload(&self) -> ExecPayload {
        ExecPayload::new(self.probe.iter().cloned())
    }
}

/// Shell tail that exits with the payload's status, except that 125-127
/// become 1. `docker exec` reserves those codes for its own failures, so a
/// snippet must not be able to produce them.
const CONFINE_EXIT_CODE: &str =
    "rc=$?; case $rc in 125|126|127) exit 1;; esac; exit $rc";

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::process_manager::ProcessManager;

    fn job(source: &str) -> RenderJob<'_> {
        RenderJob {
            source,
            display: DisplaySize::new(640, 480),
            deadline: Duration::from_secs(30),
        }
    }

    fn output(exit_code: Option<i32>, stdout: &'static [u8], stderr: &str) -> ExecOutput {
        ExecOutput {
            exit_code,
            stdout: Bytes::from_static(stdout),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_entrypoint_payload() {
        let backend = EntrypointBackend::new(vec!["render-entrypoint".to_string()]);
        let payload = backend.render_payload(&job("print('hi')"));

        assert_eq!(&payload.command[..2], &["/bin/sh", "-c"]);
        assert_eq!(&payload.command[3..], &["render", "render-entrypoint"]);
        assert!(payload
            .env
            .contains(&("RENDER_WIDTH".to_string(), "640".to_string())));
        assert!(payload
            .env
            .contains(&("RENDER_HEIGHT".to_string(), "480".to_string())));
        assert_eq!(payload.stdin.as_deref(), Some(&b"print('hi')"[..]));
    }

    #[test]
    fn test_payloads_remap_reserved_exit_codes() {
        let entrypoint = EntrypointBackend::new(vec!["r".to_string()]).render_payload(&job("x"));
        assert!(entrypoint.command[2].starts_with("\"$@\"; rc=$?;"));
        assert!(entrypoint.command[2].contains("125|126|127) exit 1"));

        let template = TemplateBackend::new(vec!["python3".to_string()], "/work").render_payload(&job("x"));
        assert!(template.command[2].contains("125|126|127) exit 1"));
    }

    /// Run a payload's command locally, the way `docker exec` would inside
    /// the container
    async fn run_locally(payload: &ExecPayload) -> Option<i32> {
        let process = ProcessManager::with_executable(&payload.command[0]);
        process
            .run_with_stdin(&payload.command[1..], payload.stdin.as_deref(), Duration::from_secs(5))
            .await
            .unwrap()
            .exit_code
    }

    #[tokio::test]
    async fn test_snippet_exit_codes_stay_out_of_docker_range() {
        for (script, expected) in [("exit 127", 1), ("exit 126", 1), ("exit 125", 1), ("exit 3", 3), ("cat >/dev/null", 0)] {
            let backend = EntrypointBackend::new(vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]);
            let payload = backend.render_payload(&job("raise SystemExit(127)"));
            assert_eq!(run_locally(&payload).await, Some(expected), "{}", script);
        }
    }

    #[test]
    fn test_interpret_image() {
        let backend = EntrypointBackend::new(vec!["r".to_string()]);
        let result = backend.interpret(output(Some(0), b"\x89PNG", ""));
        assert_eq!(result, RenderOutput::Image(Bytes::from_static(b"\x89PNG")));
    }

    #[test]
    fn test_interpret_empty_stdout_is_error() {
        let backend = EntrypointBackend::new(vec!["r".to_string()]);
        match backend.interpret(output(Some(0), b"", "")) {
            RenderOutput::Error(msg) => assert!(msg.contains("without producing an image")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_interpret_failure_keeps_stderr_tail() {
        let backend = EntrypointBackend::new(vec!["r".to_string()]);
        let stderr: String = (0..80).map(|i| format!("line {}\n", i)).collect();
        match backend.interpret(output(Some(1), b"", &stderr)) {
            RenderOutput::Error(msg) => {
                assert!(msg.starts_with("renderer exited with code 1"));
                assert!(msg.contains("line 79"));
                assert!(msg.contains("line 30"));
                assert!(!msg.contains("line 29\n"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_diagnostic_bounded() {
        let stderr = "x".repeat(20_000);
        let msg = diagnostic(&output(None, b"", &stderr));
        assert!(msg.starts_with("renderer was killed by a signal"));
        assert!(msg.len() <= DIAGNOSTIC_MAX_BYTES + 64);
    }

    #[test]
    fn test_template_wrap() {
        let backend = TemplateBackend::new(vec!["python3".to_string()], "/work")
            .with_template("size={width}x{height} out={output_path}\n{user_code}");
        let wrapped = backend.wrap(&job("label = '{width}'"));
        assert_eq!(
            wrapped,
            "size=640x480 out=/work/screenshot.png\nlabel = '{width}'"
        );
    }

    #[test]
    fn test_default_template_has_placeholders() {
        assert!(DEFAULT_TEMPLATE.contains("{user_code}"));
        assert!(DEFAULT_TEMPLATE.contains("{output_path}"));
    }

    #[test]
    fn test_template_payload() {
        let backend = TemplateBackend::new(vec!["uv".to_string(), "run".to_string()], "/work/");
        let payload = backend.render_payload(&job("print(1)"));

        assert_eq!(&payload.command[..2], &["/bin/sh", "-c"]);
        let script = &payload.command[2];
        assert!(script.contains("cat > main.py"));
        assert!(script.contains("'uv' 'run' main.py 1>&2 || { rc=$?;"));
        assert!(script.ends_with("cat '/work/screenshot.png'"));
        assert!(payload.stdin.is_some());
    }

    #[test]
    fn test_backend_config_build() {
        let backend = BackendConfig::default().build();
        assert_eq!(backend.name(), "entrypoint");
        assert_eq!(backend.probe_payload().command, vec!["true"]);

        let config = BackendConfig::Template {
            interpreter: vec!["python3".to_string()],
            work_dir: "/work".to_string(),
            template: None,
            probe: vec!["true".to_string()],
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.build().name(), "template");
    }

    #[test]
    fn test_backend_config_validation() {
        let config = BackendConfig::Entrypoint {
            command: vec![],
            probe: vec!["true".to_string()],
        };
        assert!(config.validate().is_err());
    }
}
