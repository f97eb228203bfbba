//! Compiler configuration
//!
//! Pass selection and driver limits, settable from the CLI or loaded from
//! a TOML file. Every optimization pass can be disabled individually,
//! which is the main debugging lever when a rewrite is suspected of
//! miscompiling a program.

use serde::Deserialize;
use std::path::Path;

/// Which passes the fixpoint driver runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PassConfig {
    pub inline: bool,
    pub flow: bool,
    pub dedup: bool,
    pub unused_args: bool,
}

impl Default for PassConfig {
    fn default() -> Self {
        PassConfig {
            inline: true,
            flow: true,
            dedup: true,
            unused_args: true,
        }
    }
}

/// Configuration for the MIL compiler.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerConfig {
    pub passes: PassConfig,
    /// Upper bound on driver iterations; the fixpoint is normally reached
    /// long before this.
    pub max_iterations: usize,
    /// Run the representation-lowering pass.
    pub lower_reps: bool,
    /// Run the lambda lifter on LC input.
    pub lift: bool,
    /// Print the program after each pass at debug level.
    pub dump_passes: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            passes: PassConfig::default(),
            max_iterations: 20,
            lower_reps: true,
            lift: true,
            dump_passes: false,
        }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config '{}': {}", path.display(), e))?;
        toml::from_str(&text)
            .map_err(|e| format!("Failed to parse config '{}': {}", path.display(), e))
    }

    /// Disable a pass by name (builder pattern, used by `--disable`).
    pub fn without_pass(mut self, name: &str) -> Result<Self, String> {
        match name {
            "inline" => self.passes.inline = false,
            "flow" => self.passes.flow = false,
            "dedup" => self.passes.dedup = false,
            "unused-args" => self.passes.unused_args = false,
            "lift" => self.lift = false,
            "lower-reps" => self.lower_reps = false,
            other => {
                return Err(format!(
                    "Unknown pass '{}'. Known passes: inline, flow, dedup, \
                     unused-args, lift, lower-reps",
                    other
                ));
            }
        }
        Ok(self)
    }

    pub fn with_dump_passes(mut self, dump: bool) -> Self {
        self.dump_passes = dump;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_enables_everything() {
        let c = CompilerConfig::default();
        assert!(c.passes.inline && c.passes.flow && c.passes.dedup && c.passes.unused_args);
        assert!(c.lower_reps && c.lift);
    }

    #[test]
    fn test_without_pass() {
        let c = CompilerConfig::new().without_pass("dedup").unwrap();
        assert!(!c.passes.dedup);
        assert!(c.passes.flow);
        assert!(CompilerConfig::new().without_pass("bogus").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("milc.toml");
        std::fs::write(&path, "max_iterations = 3\n[passes]\ninline = false\n").unwrap();
        let c = CompilerConfig::from_file(&path).unwrap();
        assert_eq!(c.max_iterations, 3);
        assert!(!c.passes.inline);
        assert!(CompilerConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_parse_toml() {
        let c: CompilerConfig = toml::from_str(
            r#"
            max_iterations = 5
            lower_reps = false

            [passes]
            dedup = false
            "#,
        )
        .unwrap();
        assert_eq!(c.max_iterations, 5);
        assert!(!c.lower_reps);
        assert!(!c.passes.dedup);
        assert!(c.passes.inline);
    }
}
