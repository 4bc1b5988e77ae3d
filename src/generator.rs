//! Test generation through a local model runner (`ollama run <model>`, prompt
//! on stdin).

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use crate::extractor::ClassUnit;
use crate::parse::{missing_markers, strip_code_fences, test_class_name};

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("generator executable not found: {0}")]
    NotFound(String),
    #[error("generator exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("generator timed out after {0}s")]
    Timeout(u64),
    #[error("generated output rejected, missing {0}")]
    Invalid(String),
    #[error("failed to run generator: {0}")]
    Io(#[from] std::io::Error),
}

pub trait TestGenerator: Sync {
    /// Raw model output for `prompt`.
    fn generate(&self, prompt: &str, model: &str) -> Result<String, GenerateError>;
}

#[derive(Debug, Clone)]
pub struct OllamaGenerator {
    program: PathBuf,
    timeout: Duration,
}

impl OllamaGenerator {
    pub fn new(program: PathBuf, timeout: Duration) -> Self {
        Self { program, timeout }
    }
}

impl TestGenerator for OllamaGenerator {
    fn generate(&self, prompt: &str, model: &str) -> Result<String, GenerateError> {
        let mut child = Command::new(&self.program)
            .arg("run")
            .arg(model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    GenerateError::NotFound(self.program.display().to_string())
                }
                _ => GenerateError::Io(err),
            })?;

        // Prompts embed whole source files and can exceed the argv size limit.
        let feeder = feed(child.stdin.take(), prompt);
        let (status, stdout, stderr) = wait_with_timeout(child, self.timeout)?;
        if let Some(handle) = feeder {
            let _ = handle.join();
        }
        if !status.success() {
            return Err(GenerateError::Failed {
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

/// Waits for `child`, killing it once `timeout` elapses. Output pipes are
/// drained on helper threads so a chatty child cannot block on a full pipe.
fn wait_with_timeout(
    mut child: Child,
    timeout: Duration,
) -> Result<(ExitStatus, String, String), GenerateError> {
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let deadline = Instant::now() + timeout;

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(GenerateError::Timeout(timeout.as_secs()));
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    Ok((status, join_output(stdout), join_output(stderr)))
}

/// Writes `prompt` on a helper thread, then closes stdin so the child sees EOF.
fn feed(stdin: Option<ChildStdin>, prompt: &str) -> Option<JoinHandle<()>> {
    stdin.map(|mut stdin| {
        let prompt = prompt.to_string();
        std::thread::spawn(move || {
            let _ = stdin.write_all(prompt.as_bytes());
        })
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).to_string()
        })
    })
}

fn join_output(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct PromptOptions {
    /// Namespace the generated test class must live in.
    pub test_namespace: String,
    pub few_shot: Option<String>,
}

pub fn build_prompt(class: &ClassUnit, options: &PromptOptions) -> String {
    let namespace = if class.namespace_name.is_empty() {
        "Global"
    } else {
        class.namespace_name.as_str()
    };
    let test_class = test_class_name(&class.class_name);

    let mut prompt = String::new();
    prompt.push_str(
        "You are a C# NUnit expert. Generate a complete, runnable NUnit test CLASS for the following C# class:\n",
    );
    prompt.push_str(&format!("ClassName: {}\n", class.class_name));
    prompt.push_str(&format!("Namespace: {namespace}\n"));
    prompt.push_str(&format!("FullSource:\n```\n{}\n```\n", class.full_source_text));

    if !class.referenced_type_defs.is_empty() {
        prompt.push_str("Referenced types:\n");
        for (name, source) in &class.referenced_type_defs {
            prompt.push_str(&format!("// {name}\n```\n{source}\n```\n"));
        }
    }

    prompt.push_str(&format!(
        "Your test class must be named {test_class} in namespace {}.\n",
        options.test_namespace
    ));
    prompt.push_str(
        "Use [TestFixture], [Test], Arrange, Act and Assert pattern, include setup if needed, meaningful test cases.\n",
    );

    match options.few_shot.as_deref() {
        Some(example) if !example.trim().is_empty() => format!("{example}\n---\n{prompt}"),
        _ => prompt,
    }
}

/// Runs the generator on `prompt` and accepts the output only if it looks
/// like an NUnit test class for `class_name`.
pub fn generate_test_class<G>(
    generator: &G,
    class_name: &str,
    prompt: &str,
    model: &str,
) -> Result<String, GenerateError>
where
    G: TestGenerator + ?Sized,
{
    debug!(
        class = %class_name,
        prompt_chars = prompt.len(),
        "requesting generated test"
    );

    let raw = generator.generate(prompt, model)?;
    let code = strip_code_fences(&raw);
    let missing = missing_markers(&code, class_name);
    if !missing.is_empty() {
        return Err(GenerateError::Invalid(missing.join(", ")));
    }
    Ok(code)
}
