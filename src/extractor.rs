//! Structural extractor integration.
//!
//! The extractor is an external program that turns one C# file into a JSON
//! array of class records. By default it is the bundled Roslyn tool under
//! `assets/`, built on demand with the `dotnet` CLI.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::dotnet::{Dotnet, TARGET_FRAMEWORK};

pub const EXTRACTOR_DIR_NAME: &str = "RoslynExtractor";
pub const EXTRACTOR_PROJECT_NAME: &str = "CodeStructureExtractor";
pub const ROSLYN_CSHARP_VERSION: &str = "4.9.2";

const EXTRACTOR_PROGRAM: &str = include_str!("../assets/CodeStructureExtractor/Program.cs");

/// One class discovered in one source file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClassUnit {
    pub file_path: String,
    pub namespace_name: String,
    pub class_name: String,
    pub constructors: Vec<ConstructorInfo>,
    pub methods: Vec<MethodInfo>,
    pub properties: Vec<PropertyInfo>,
    pub using_directives: Vec<String>,
    /// Type name to definition source. Filled by the extractor with its own
    /// reachability closure, then replaced by the closure resolver.
    #[serde(rename = "ReferencedTypeDefinitions")]
    pub referenced_type_defs: BTreeMap<String, String>,
    /// Whole file text at extraction time.
    #[serde(skip)]
    pub full_source_text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConstructorInfo {
    pub signature: String,
    pub parameters: Vec<String>,
    pub exception_conditions: Vec<ExceptionCondition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MethodInfo {
    pub name: String,
    pub signature: String,
    pub return_type: String,
    pub parameters: Vec<String>,
    pub exception_conditions: Vec<ExceptionCondition>,
    pub dependency_types: Vec<String>,
    pub source_code: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PropertyInfo {
    pub name: String,
    #[serde(rename = "Type")]
    pub type_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExceptionCondition {
    pub condition_expression: String,
    pub exception_type: String,
}

impl ClassUnit {
    /// The method whose body drives reference collection: the first one the
    /// extractor reported.
    pub fn primary_method(&self) -> Option<&MethodInfo> {
        self.methods.first()
    }

    pub fn declared_dependencies(&self) -> &[String] {
        self.primary_method()
            .map(|m| m.dependency_types.as_slice())
            .unwrap_or(&[])
    }

    /// Replaces, never merges, the attached type definitions.
    pub fn apply_resolution(&mut self, type_defs: BTreeMap<String, String>) {
        self.referenced_type_defs = type_defs;
    }
}

pub trait ClassExtractor: Sync {
    /// Extracts every class declared in `source_file`, in declaration order.
    fn extract(&self, source_file: &Path) -> Result<Vec<ClassUnit>>;
}

#[derive(Debug, Clone)]
pub struct Extractor {
    program: PathBuf,
    tool_args: Vec<OsString>,
}

impl Extractor {
    /// An extractor executable invoked as `<program> <file>`.
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            tool_args: Vec::new(),
        }
    }

    /// A framework-dependent extractor invoked as `dotnet <dll> <file>`.
    pub fn dotnet(dotnet: &Dotnet, dll: &Path) -> Self {
        Self {
            program: dotnet.program().to_path_buf(),
            tool_args: vec![dll.as_os_str().to_os_string()],
        }
    }

    fn run(&self, source_file: &Path) -> Result<String> {
        let output = Command::new(&self.program)
            .args(&self.tool_args)
            .arg(source_file)
            .output()
            .with_context(|| {
                format!("Failed to execute extractor {}", self.program.display())
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Extractor failed for {}: {}",
                source_file.display(),
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl ClassExtractor for Extractor {
    fn extract(&self, source_file: &Path) -> Result<Vec<ClassUnit>> {
        if !source_file.is_file() {
            bail!("Source file not found: {}", source_file.display());
        }

        let stdout = self.run(source_file)?;
        let mut classes = parse_extractor_output(&stdout)
            .with_context(|| format!("Malformed extractor output for {}", source_file.display()))?;
        if classes.is_empty() {
            return Ok(classes);
        }

        // Legacy code pages (Windows-1252 and friends) are common in C# trees.
        let bytes = std::fs::read(source_file)
            .with_context(|| format!("Failed to read {}", source_file.display()))?;
        let full_source = String::from_utf8_lossy(&bytes).into_owned();
        for class in classes.iter_mut() {
            class.full_source_text = full_source.clone();
            debug!(
                class = %class.class_name,
                methods = class.methods.len(),
                dependencies = class.referenced_type_defs.len(),
                "extracted class"
            );
        }
        Ok(classes)
    }
}

/// Parses the extractor's JSON array. Blank output means no classes.
pub fn parse_extractor_output(stdout: &str) -> Result<Vec<ClassUnit>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).context("Extractor output is not a JSON class list")
}

/// Path of the extractor DLL for a tool tree rooted at `base_dir`.
pub fn extractor_dll_path(base_dir: &Path) -> PathBuf {
    extractor_project_dir(base_dir)
        .join("bin")
        .join("Release")
        .join(TARGET_FRAMEWORK)
        .join(format!("{EXTRACTOR_PROJECT_NAME}.dll"))
}

fn extractor_project_dir(base_dir: &Path) -> PathBuf {
    base_dir.join(EXTRACTOR_DIR_NAME).join(EXTRACTOR_PROJECT_NAME)
}

/// Builds the bundled Roslyn extractor under `base_dir` unless its DLL is
/// already present, and returns the DLL path.
pub fn ensure_extractor_tool(dotnet: &Dotnet, base_dir: &Path) -> Result<PathBuf> {
    let dll = extractor_dll_path(base_dir);
    if dll.is_file() {
        return Ok(dll);
    }

    let project_dir = extractor_project_dir(base_dir);
    let csproj = project_dir.join(format!("{EXTRACTOR_PROJECT_NAME}.csproj"));
    std::fs::create_dir_all(&project_dir)
        .with_context(|| format!("Failed to create directory: {}", project_dir.display()))?;

    info!(dir = %project_dir.display(), "building structural extractor");
    dotnet.run(
        [
            OsStr::new("new"),
            OsStr::new("console"),
            OsStr::new("--force"),
            OsStr::new("-n"),
            OsStr::new(EXTRACTOR_PROJECT_NAME),
            OsStr::new("-f"),
            OsStr::new(TARGET_FRAMEWORK),
            OsStr::new("-o"),
            project_dir.as_os_str(),
        ],
        None,
    )?;

    let program = project_dir.join("Program.cs");
    std::fs::write(&program, EXTRACTOR_PROGRAM)
        .with_context(|| format!("Failed to write {}", program.display()))?;

    dotnet.run(
        [
            OsStr::new("add"),
            csproj.as_os_str(),
            OsStr::new("package"),
            OsStr::new("Microsoft.CodeAnalysis.CSharp"),
            OsStr::new("--version"),
            OsStr::new(ROSLYN_CSHARP_VERSION),
        ],
        None,
    )?;
    dotnet.run(
        [
            OsStr::new("build"),
            csproj.as_os_str(),
            OsStr::new("-c"),
            OsStr::new("Release"),
        ],
        None,
    )?;

    if !dll.is_file() {
        bail!("Extractor build finished but {} is missing", dll.display());
    }
    Ok(dll)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER_JSON: &str = r#"[
  {
    "FilePath": "/src/Order.cs",
    "NamespaceName": "Shop",
    "ClassName": "Order",
    "Constructors": [
      { "Signature": "public Order(Customer customer)", "Parameters": ["Customer customer"], "ExceptionConditions": [] }
    ],
    "Methods": [
      {
        "Name": "Total",
        "Signature": "public decimal Total()",
        "ReturnType": "decimal",
        "Parameters": [],
        "ExceptionConditions": [{ "ConditionExpression": "Lines == null", "ExceptionType": "InvalidOperationException" }],
        "DependencyTypes": ["Shop.OrderLine"],
        "SourceCode": "public decimal Total() { return Lines.Sum(l => l.Price); }"
      }
    ],
    "Properties": [{ "Name": "Lines", "Type": "System.Collections.Generic.List<Shop.OrderLine>" }],
    "UsingDirectives": ["using System;"],
    "ReferencedTypeDefinitions": { "Shop.Customer": "public class Customer {}" }
  }
]"#;

    #[test]
    fn parse_extractor_output_reads_pascal_case_records() -> Result<()> {
        let classes = parse_extractor_output(ORDER_JSON)?;
        assert_eq!(classes.len(), 1);
        let order = &classes[0];
        assert_eq!(order.class_name, "Order");
        assert_eq!(order.namespace_name, "Shop");
        assert_eq!(order.constructors[0].parameters, vec!["Customer customer"]);
        assert_eq!(order.declared_dependencies(), ["Shop.OrderLine".to_string()]);
        assert_eq!(
            order.properties[0].type_name,
            "System.Collections.Generic.List<Shop.OrderLine>"
        );
        assert_eq!(
            order.methods[0].exception_conditions[0].exception_type,
            "InvalidOperationException"
        );
        assert!(order.referenced_type_defs.contains_key("Shop.Customer"));
        assert!(order.full_source_text.is_empty());
        Ok(())
    }

    #[test]
    fn parse_extractor_output_tolerates_missing_fields_and_blank_output() -> Result<()> {
        assert!(parse_extractor_output("  \n")?.is_empty());

        let classes = parse_extractor_output(r#"[{"ClassName": "Bare"}]"#)?;
        assert_eq!(classes[0].class_name, "Bare");
        assert!(classes[0].primary_method().is_none());
        assert!(classes[0].declared_dependencies().is_empty());
        Ok(())
    }

    #[test]
    fn parse_extractor_output_rejects_garbage() {
        assert!(parse_extractor_output("Unhandled exception. System.IO...").is_err());
    }

    #[test]
    fn apply_resolution_replaces_existing_definitions() -> Result<()> {
        let mut order = parse_extractor_output(ORDER_JSON)?.remove(0);
        let mut narrowed = BTreeMap::new();
        narrowed.insert("OrderLine".to_string(), "class OrderLine {}".to_string());
        order.apply_resolution(narrowed);
        assert_eq!(
            order.referenced_type_defs.keys().collect::<Vec<_>>(),
            vec!["OrderLine"]
        );
        Ok(())
    }

    #[test]
    fn extractor_dll_path_follows_release_layout() {
        let dll = extractor_dll_path(Path::new("/out"));
        assert_eq!(
            dll,
            PathBuf::from("/out/RoslynExtractor/CodeStructureExtractor/bin/Release/net8.0/CodeStructureExtractor.dll")
        );
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::fs;

        fn fake_tool(dir: &Path, name: &str, script: &str) -> Result<PathBuf> {
            use std::os::unix::fs::PermissionsExt;
            let path = dir.join(name);
            fs::write(&path, script)?;
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms)?;
            Ok(path)
        }

        #[test]
        fn extract_attaches_full_source_text() -> Result<()> {
            let dir = tempfile::tempdir()?;
            let source = dir.path().join("Order.cs");
            fs::write(&source, "namespace Shop { public class Order {} }")?;
            let tool = fake_tool(
                dir.path(),
                "extractor",
                "#!/bin/sh\necho '[{\"ClassName\":\"Order\",\"NamespaceName\":\"Shop\"}]'\n",
            )?;

            let classes = Extractor::new(tool).extract(&source)?;
            assert_eq!(classes.len(), 1);
            assert_eq!(
                classes[0].full_source_text,
                "namespace Shop { public class Order {} }"
            );
            Ok(())
        }

        #[test]
        fn extract_accepts_non_utf8_source() -> Result<()> {
            let dir = tempfile::tempdir()?;
            let source = dir.path().join("Cafe.cs");
            fs::write(&source, b"public class Caf\xe9 { string s = \"na\xefve\"; }")?;
            let tool = fake_tool(
                dir.path(),
                "extractor",
                "#!/bin/sh\necho '[{\"ClassName\":\"Cafe\"}]'\n",
            )?;

            let classes = Extractor::new(tool).extract(&source)?;
            let text = &classes[0].full_source_text;
            assert!(text.starts_with("public class Caf\u{FFFD} {"));
            assert!(text.contains("na\u{FFFD}ve"));
            Ok(())
        }

        #[test]
        fn extract_reports_tool_failure_with_stderr() -> Result<()> {
            let dir = tempfile::tempdir()?;
            let source = dir.path().join("Broken.cs");
            fs::write(&source, "class {")?;
            let tool = fake_tool(
                dir.path(),
                "extractor",
                "#!/bin/sh\necho 'parse error at 1:7' >&2\nexit 1\n",
            )?;

            let err = Extractor::new(tool).extract(&source).unwrap_err().to_string();
            assert!(err.contains("Extractor failed"));
            assert!(err.contains("parse error at 1:7"));
            Ok(())
        }

        #[test]
        fn extract_passes_dll_before_file_for_dotnet_tools() -> Result<()> {
            let dir = tempfile::tempdir()?;
            let source = dir.path().join("A.cs");
            fs::write(&source, "class A {}")?;
            let dotnet = fake_tool(
                dir.path(),
                "dotnet",
                "#!/bin/sh\ncase \"$1\" in *.dll) echo \"[{\\\"ClassName\\\":\\\"A\\\"}]\";; *) exit 9;; esac\n",
            )?;

            let extractor =
                Extractor::dotnet(&Dotnet::new(dotnet), Path::new("/tools/Extractor.dll"));
            let classes = extractor.extract(&source)?;
            assert_eq!(classes[0].class_name, "A");
            Ok(())
        }
    }
}
