//! Catalog of the languages the service can compile and run.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Placeholder for the absolute path of the materialized source file
pub const INPUT_PLACEHOLDER: &str = "%INPUT%";
/// Placeholder for the absolute path of the compiled binary
pub const OUTPUT_PLACEHOLDER: &str = "%OUTPUT%";
/// Placeholder for the absolute path of the workspace directory
pub const DIR_PLACEHOLDER: &str = "%DIR%";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LanguageSpec {
    pub id: String,
    pub display_name: String,
    pub file_name: String,
    pub file_extension: String,
    #[serde(default)]
    pub compile_command: Option<Vec<String>>,
    pub run_command: Vec<String>,
    #[serde(default)]
    pub default_cpu_limit_ms: Option<u64>,
    #[serde(default)]
    pub default_memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub default_output_limit_bytes: Option<u64>,
    /// Starter code shown by the editor when the language is picked
    #[serde(default)]
    pub template: String,
}

impl LanguageSpec {
    pub fn needs_compile(&self) -> bool {
        self.compile_command.is_some()
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            bail!("language id must not be empty");
        }
        if self.run_command.is_empty() {
            bail!("language {} has an empty run command", self.id);
        }
        if matches!(&self.compile_command, Some(cmd) if cmd.is_empty()) {
            bail!("language {} has an empty compile command", self.id);
        }
        if !self.file_extension.starts_with('.') || !self.file_name.ends_with(&self.file_extension)
        {
            bail!(
                "language {}: file name {} does not carry extension {}",
                self.id,
                self.file_name,
                self.file_extension
            );
        }
        Ok(())
    }
}

/// Read-only lookup table built once at process start
#[derive(Debug)]
pub struct LanguageRegistry {
    languages: BTreeMap<String, LanguageSpec>,
}

impl LanguageRegistry {
    pub fn new(specs: Vec<LanguageSpec>) -> Result<Self> {
        let mut languages = BTreeMap::new();
        for spec in specs {
            spec.validate()?;
            let id = spec.id.clone();
            if languages.insert(id.clone(), spec).is_some() {
                bail!("language {id} is declared twice");
            }
        }
        if languages.is_empty() {
            bail!("at least one language must be configured");
        }
        Ok(Self { languages })
    }

    pub fn builtin() -> Self {
        let languages = builtin_languages()
            .into_iter()
            .map(|spec| (spec.id.clone(), spec))
            .collect();
        Self { languages }
    }

    pub fn get(&self, language_id: &str) -> Result<&LanguageSpec, ServiceError> {
        self.languages
            .get(language_id)
            .ok_or_else(|| ServiceError::UnsupportedLanguage(language_id.to_string()))
    }

    /// All languages, ordered by id
    pub fn list(&self) -> impl Iterator<Item = &LanguageSpec> {
        self.languages.values()
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}

/// Applies placeholder substitutions to every argument of a command template
pub fn render_command(template: &[String], mapping: &HashMap<&str, &str>) -> Vec<String> {
    template
        .iter()
        .map(|s| {
            let mut t = s.clone();
            for (k, v) in mapping.iter() {
                t = t.replace(k, v);
            }
            t
        })
        .collect()
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn builtin_languages() -> Vec<LanguageSpec> {
    vec![
        LanguageSpec {
            id: "python".to_string(),
            display_name: "Python".to_string(),
            file_name: "main.py".to_string(),
            file_extension: ".py".to_string(),
            compile_command: None,
            run_command: argv(&["python3", "-u", INPUT_PLACEHOLDER]),
            default_cpu_limit_ms: None,
            default_memory_limit_mb: None,
            default_output_limit_bytes: None,
            template: "def hello_world():\n    print(\"Hello, World!\")\n\n\nhello_world()\n"
                .to_string(),
        },
        LanguageSpec {
            id: "javascript".to_string(),
            display_name: "JavaScript".to_string(),
            file_name: "main.js".to_string(),
            file_extension: ".js".to_string(),
            compile_command: None,
            run_command: argv(&["node", INPUT_PLACEHOLDER]),
            default_cpu_limit_ms: None,
            default_memory_limit_mb: None,
            default_output_limit_bytes: None,
            template: concat!(
                "function helloWorld() {\n",
                "  console.log(\"Hello, World!\");\n",
                "}\n",
                "\n",
                "helloWorld();\n",
            )
            .to_string(),
        },
        LanguageSpec {
            id: "typescript".to_string(),
            display_name: "TypeScript".to_string(),
            file_name: "main.ts".to_string(),
            file_extension: ".ts".to_string(),
            compile_command: Some(argv(&[
                "tsc",
                "--target",
                "es2020",
                "--module",
                "commonjs",
                "--outDir",
                DIR_PLACEHOLDER,
                INPUT_PLACEHOLDER,
            ])),
            run_command: argv(&["node", "%DIR%/main.js"]),
            default_cpu_limit_ms: None,
            default_memory_limit_mb: None,
            default_output_limit_bytes: None,
            template: concat!(
                "function greet(name: string): string {\n",
                "  return `Hello, ${name}!`;\n",
                "}\n",
                "\n",
                "console.log(greet(\"World\"));\n",
            )
            .to_string(),
        },
        LanguageSpec {
            id: "java".to_string(),
            display_name: "Java".to_string(),
            file_name: "Main.java".to_string(),
            file_extension: ".java".to_string(),
            compile_command: Some(argv(&[
                "javac",
                "-encoding",
                "UTF-8",
                "-d",
                DIR_PLACEHOLDER,
                INPUT_PLACEHOLDER,
            ])),
            run_command: argv(&["java", "-XX:+UseSerialGC", "-cp", DIR_PLACEHOLDER, "Main"]),
            // The JVM burns CPU on several threads while starting up
            default_cpu_limit_ms: Some(6_000),
            default_memory_limit_mb: Some(512),
            default_output_limit_bytes: None,
            template: concat!(
                "public class Main {\n",
                "    public static void main(String[] args) {\n",
                "        System.out.println(\"Hello, World!\");\n",
                "    }\n",
                "}\n",
            )
            .to_string(),
        },
        LanguageSpec {
            id: "cpp".to_string(),
            display_name: "C++".to_string(),
            file_name: "main.cpp".to_string(),
            file_extension: ".cpp".to_string(),
            compile_command: Some(argv(&[
                "g++",
                "-O2",
                "-std=c++17",
                "-o",
                OUTPUT_PLACEHOLDER,
                INPUT_PLACEHOLDER,
            ])),
            run_command: argv(&[OUTPUT_PLACEHOLDER]),
            default_cpu_limit_ms: Some(2_000),
            default_memory_limit_mb: None,
            default_output_limit_bytes: None,
            template: concat!(
                "#include <iostream>\n",
                "\n",
                "int main() {\n",
                "    std::cout << \"Hello, World!\" << std::endl;\n",
                "    return 0;\n",
                "}\n",
            )
            .to_string(),
        },
        LanguageSpec {
            id: "c".to_string(),
            display_name: "C".to_string(),
            file_name: "main.c".to_string(),
            file_extension: ".c".to_string(),
            compile_command: Some(argv(&[
                "gcc",
                "-O2",
                "-std=c11",
                "-o",
                OUTPUT_PLACEHOLDER,
                INPUT_PLACEHOLDER,
                "-lm",
            ])),
            run_command: argv(&[OUTPUT_PLACEHOLDER]),
            default_cpu_limit_ms: Some(2_000),
            default_memory_limit_mb: None,
            default_output_limit_bytes: None,
            template: concat!(
                "#include <stdio.h>\n",
                "\n",
                "int main(void) {\n",
                "    printf(\"Hello, World!\\n\");\n",
                "    return 0;\n",
                "}\n",
            )
            .to_string(),
        },
    ]
}
