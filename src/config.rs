//! Compiler configuration built from CLI flags.
//!
//! Kept as a plain struct independent of `clap`'s `Cli` type (spec.md §6's
//! `--optimize`/`--no-optimize`, `--keep-tac`, `--keep-asm` flags) so library
//! consumers other than the `bxc` binary can drive the pipeline directly.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Run the §4.G/§4.H optimization passes. Default on.
    pub optimize: bool,
    /// Write `FILE.tac.json` alongside the output.
    pub keep_tac: bool,
    /// Keep the generated `FILE.s` after linking instead of removing it.
    pub keep_asm: bool,
    /// Output executable path; defaults to the input path with its
    /// extension stripped.
    pub output: Option<PathBuf>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig { optimize: true, keep_tac: false, keep_asm: false, output: None }
    }
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_keep_tac(mut self, keep_tac: bool) -> Self {
        self.keep_tac = keep_tac;
        self
    }

    pub fn with_keep_asm(mut self, keep_asm: bool) -> Self {
        self.keep_asm = keep_asm;
        self
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_optimizes_and_keeps_nothing() {
        let cfg = CompilerConfig::default();
        assert!(cfg.optimize);
        assert!(!cfg.keep_tac);
        assert!(!cfg.keep_asm);
        assert!(cfg.output.is_none());
    }

    #[test]
    fn builder_methods_compose() {
        let cfg = CompilerConfig::new().with_optimize(false).with_keep_tac(true).with_output("out");
        assert!(!cfg.optimize);
        assert!(cfg.keep_tac);
        assert_eq!(cfg.output, Some(PathBuf::from("out")));
    }
}
