//! Toolbox features: named command handlers selected by a trigger prefix.

pub mod env_control;
pub mod send_mail;
pub mod shell;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;

use crate::error::CommandError;

/// Separates error text from command output in the combined output.
pub const COMBINED_TEXT_SEPARATOR: &str = "|";

/// Timeout for outgoing connections made during feature self tests.
pub const SELF_TEST_TIMEOUT_SEC: u64 = 15;

/// Execution details for invoking a feature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub timeout_sec: u64,
    pub content: String,
}

impl Command {
    pub fn new(content: impl Into<String>, timeout_sec: u64) -> Self {
        Self {
            timeout_sec,
            content: content.into(),
        }
    }

    /// Remove leading and trailing white space; report an error result if the
    /// command becomes empty afterwards.
    pub fn trim(&mut self) -> Option<CommandResult> {
        self.content = self.content.trim().to_string();
        if self.content.is_empty() {
            Some(CommandResult::from_error(CommandError::EmptyCommand))
        } else {
            None
        }
    }

    /// Remove a prefix from the trimmed content and trim the remainder.
    /// Returns true only if the prefix was found and removed.
    pub fn find_and_remove_prefix(&mut self, prefix: &str) -> bool {
        let trimmed = self.content.trim();
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            self.content = rest.trim().to_string();
            true
        } else {
            false
        }
    }
}

/// A feature's execution result: human readable output plus error, if any.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    /// The command as dispatched; kept mainly for logging.
    pub command: Command,
    pub error: Option<CommandError>,
    /// Normal output excluding error text.
    pub output: String,
    /// Error text and normal output combined; set by `reset_combined_text`.
    pub combined_output: String,
}

impl CommandResult {
    pub fn from_error(error: CommandError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn from_output(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    /// Error text, or empty string if the error is absent.
    pub fn err_text(&self) -> String {
        self.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
    }

    /// Derive the combined error + output text.
    pub fn reset_combined_text(&mut self) -> &str {
        self.combined_output.clear();
        if let Some(err) = &self.error {
            self.combined_output.push_str(&err.to_string());
            if !self.output.is_empty() {
                self.combined_output.push_str(COMBINED_TEXT_SEPARATOR);
            }
        }
        self.combined_output.push_str(&self.output);
        &self.combined_output
    }
}

/// A useful capability triggered by a unique command prefix.
#[async_trait]
pub trait Feature: Send + Sync {
    /// True only when enough configuration is present to operate; called
    /// before `initialise`.
    fn is_configured(&self) -> bool;

    /// Prepare internal states.
    fn initialise(&mut self) -> anyhow::Result<()>;

    /// Validate configuration against the outside world; meaningful only
    /// after `initialise` succeeds.
    async fn self_test(&self) -> anyhow::Result<()>;

    /// The prefix matched against command input to select this feature.
    /// Unique per feature, starting with `.`.
    fn trigger(&self) -> &'static str;

    /// Execute the command with the trigger prefix already removed.
    async fn execute(&self, cmd: Command) -> CommandResult;
}

/// The fixed set of features available to a command processor, looked up by
/// exact trigger prefix on the trimmed command content.
#[derive(Default)]
pub struct FeatureSet {
    pub lookup_by_trigger: BTreeMap<&'static str, Arc<dyn Feature>>,
}

impl FeatureSet {
    /// Initialise every configured feature and index it by trigger. Features
    /// lacking configuration are silently left out; triggers must be unique
    /// and must not be prefixes of one another.
    pub fn initialise(features: Vec<Box<dyn Feature>>) -> anyhow::Result<Self> {
        let mut lookup_by_trigger: BTreeMap<&'static str, Arc<dyn Feature>> = BTreeMap::new();
        for mut feature in features {
            if !feature.is_configured() {
                continue;
            }
            let trigger = feature.trigger();
            if !trigger.starts_with('.') {
                bail!("feature trigger {trigger:?} must begin with a full stop");
            }
            for existing in lookup_by_trigger.keys() {
                if existing.starts_with(trigger) || trigger.starts_with(existing) {
                    bail!("feature trigger {trigger:?} collides with {existing:?}");
                }
            }
            feature
                .initialise()
                .with_context(|| format!("failed to initialise feature {trigger}"))?;
            lookup_by_trigger.insert(trigger, Arc::from(feature));
        }
        Ok(Self { lookup_by_trigger })
    }

    pub fn is_empty(&self) -> bool {
        self.lookup_by_trigger.is_empty()
    }

    pub fn triggers(&self) -> Vec<&'static str> {
        self.lookup_by_trigger.keys().copied().collect()
    }

    /// Run every feature's self test, collecting failures as human readable
    /// findings.
    pub async fn self_test(&self) -> Vec<String> {
        let mut findings = Vec::new();
        for (trigger, feature) in &self.lookup_by_trigger {
            if let Err(err) = feature.self_test().await {
                findings.push(format!("feature {trigger} failed self test: {err:#}"));
            }
        }
        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_trim() {
        let mut cmd = Command::new("  hello  ", 10);
        assert!(cmd.trim().is_none());
        assert_eq!(cmd.content, "hello");

        let mut empty = Command::new(" \r\n ", 10);
        let ret = empty.trim().unwrap();
        assert_eq!(ret.error, Some(CommandError::EmptyCommand));
    }

    #[test]
    fn command_find_and_remove_prefix() {
        let mut cmd = Command::new("\n\n .s  echo hi \n", 10);
        assert!(cmd.find_and_remove_prefix(".s"));
        assert_eq!(cmd.content, "echo hi");
        assert!(!cmd.find_and_remove_prefix(".m"));
        assert_eq!(cmd.content, "echo hi");
    }

    #[test]
    fn combined_text() {
        let mut ret = CommandResult::from_output("out");
        assert_eq!(ret.reset_combined_text(), "out");

        ret.error = Some(CommandError::BadPrefix);
        assert_eq!(
            ret.reset_combined_text(),
            "bad prefix or feature is not configured|out"
        );

        ret.output.clear();
        assert_eq!(
            ret.reset_combined_text(),
            "bad prefix or feature is not configured"
        );
    }

    #[test]
    fn feature_set_rejects_trigger_prefix_collision() {
        use super::shell::Shell;
        struct Clash;
        #[async_trait]
        impl Feature for Clash {
            fn is_configured(&self) -> bool {
                true
            }
            fn initialise(&mut self) -> anyhow::Result<()> {
                Ok(())
            }
            async fn self_test(&self) -> anyhow::Result<()> {
                Ok(())
            }
            fn trigger(&self) -> &'static str {
                ".sx"
            }
            async fn execute(&self, _cmd: Command) -> CommandResult {
                CommandResult::default()
            }
        }
        let err = FeatureSet::initialise(vec![Box::new(Shell::default()), Box::new(Clash)]);
        assert!(err.is_err());
    }
}
