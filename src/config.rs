// ABOUTME: Engine configuration and REPL cosmetics: budget limits plus version/help text

use crate::budget::Limits;

pub const VERSION: &str = "0.1.0";
pub const WELCOME_MESSAGE: &str = "stackscript v0.1.0";
pub const WELCOME_SUBTITLE: &str = "A stack-oriented, postfix scripting engine";

pub const HELP_TEXT: &str = r#"
Available commands:
  (quit) or (exit)     - Exit the REPL
  .help                - Show this help message
  .depth               - Print the current stack depth
  .clear               - Clear the screen

Feed the engine postfix statements terminated by whitespace. Open a macro
with <% and close it with %>; <'...'> opens a multiline string.
"#;

/// Generalizes this repo's `FsConfig`/`NetConfig` pair into the one
/// configuration surface the engine itself actually has: resource
/// budgets plus a couple of REPL/CLI cosmetics. Loaded from CLI flags in
/// `main.rs`; loading a configuration *file* is left to a host, same as
/// the function catalog and macro repository (external collaborators).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub limits: Limits,
    /// Initial value of the `section` attribute, purely cosmetic (used in
    /// framed-error diagnostics).
    pub section_name: Option<String>,
    /// Whether the parser starts in audit mode (demoting a handful of
    /// parse/resolution errors into in-band `Entry::Audit` statements
    /// instead of failing the feed outright).
    pub audit_by_default: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            limits: Limits::default(),
            section_name: None,
            audit_by_default: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_default_limits() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.limits.maxops, Limits::default().maxops);
        assert!(!cfg.audit_by_default);
        assert!(cfg.section_name.is_none());
    }
}
