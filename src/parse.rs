use sha2::{Digest, Sha256};

/// Attributes every accepted NUnit test class must carry.
pub const EXPECTED_MARKERS: [&str; 2] = ["[TestFixture]", "[Test]"];

const FENCE: &str = "```";
const FENCE_LANGUAGES: [&str; 3] = ["csharp", "cs", "c#"];

/// Content hash of a generation request: SHA-256 of the assembled prompt,
/// so every input the model sees (class source, resolved type definitions,
/// target namespace, few-shot example) takes part in cache validation.
pub fn hash_prompt(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn test_class_name(class_name: &str) -> String {
    format!("{class_name}Tests")
}

/// Removes a surrounding Markdown code fence, if the model emitted one.
pub fn strip_code_fences(raw: &str) -> String {
    let mut code = raw.trim();

    if let Some(rest) = code.strip_prefix(FENCE) {
        let rest = FENCE_LANGUAGES
            .iter()
            .find_map(|lang| rest.strip_prefix(lang))
            .unwrap_or(rest);
        code = rest.trim_start();
    }
    if let Some(rest) = code.strip_suffix(FENCE) {
        code = rest.trim_end();
    }

    code.to_string()
}

/// Returns the structural markers missing from `code`; empty means the
/// output is an acceptable test class for `class_name`.
pub fn missing_markers(code: &str, class_name: &str) -> Vec<String> {
    let mut missing = Vec::new();

    let declaration = format!("class {}", test_class_name(class_name));
    if !code.contains(&declaration) {
        missing.push(declaration);
    }
    for marker in EXPECTED_MARKERS {
        if !code.contains(marker) {
            missing.push(marker.to_string());
        }
    }

    missing
}
