//! The command processor: filter pipeline, PLT override, feature dispatch.

use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::CommandError;
use crate::filter::{CommandFilter, LintText, ResultFilter};
use crate::lockdown;
use crate::stats::Stats;
use crate::toolbox::{Command, CommandResult, FeatureSet};

/// Magic prefix that overrides the LintText window and the command timeout
/// for a single call. PLT stands for "position, length, timeout".
pub const PREFIX_COMMAND_PLT: &str = ".plt";

/// Parses the PLT parameters: position, length and timeout, all integers,
/// followed by the remaining command.
static REGEX_COMMAND_WITH_PLT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\d]*(\d+)[^\d]+(\d+)[^\d]*(\d+)(.*)").expect("PLT regex"));

/// Durations of all commands executed, in microseconds.
pub static COMMAND_DURATION_STATS: Stats = Stats::new();

const PREFIX_BAD_CONFIG: &str = "bad configuration: ";

/// Pre-configured environment for processing feature commands: ordered
/// command filters in front of the feature set, ordered result filters
/// behind it.
#[derive(Default)]
pub struct CommandProcessor {
    pub features: FeatureSet,
    pub command_filters: Vec<CommandFilter>,
    pub result_filters: Vec<ResultFilter>,
}

impl CommandProcessor {
    /// True only when there is no command filter configuration at all, which
    /// means the processor is not set up for use. A usable configuration has
    /// at least a PIN filter.
    pub fn is_empty(&self) -> bool {
        self.command_filters.is_empty()
    }

    /// From the prospect of an Internet-facing transport, check that the
    /// parameters are within a sane range. Returns the list of findings;
    /// an empty list means everything looks OK.
    pub fn is_sane_for_internet(&self) -> Vec<String> {
        let mut findings = Vec::new();
        if self.features.is_empty() {
            findings.push(format!(
                "{PREFIX_BAD_CONFIG}feature set is not initialised or all features are lacking configuration"
            ));
        }
        let pin_filter = self.command_filters.iter().find_map(|f| match f {
            CommandFilter::PinAndShortcuts(pin) => Some(pin),
            _ => None,
        });
        match pin_filter {
            None => findings.push(format!(
                "{PREFIX_BAD_CONFIG}the PIN filter is not used, this is horribly insecure"
            )),
            Some(pin) => {
                if pin.pin.is_empty() && pin.shortcuts.is_empty() {
                    findings.push(format!(
                        "{PREFIX_BAD_CONFIG}PIN is empty and there is no shortcut defined, hence no command will ever execute"
                    ));
                }
                if !pin.pin.is_empty() && pin.pin.len() < 7 {
                    findings.push(format!(
                        "{PREFIX_BAD_CONFIG}PIN is too short, make it at least 7 characters long to be somewhat secure"
                    ));
                }
            }
        }
        let lint_filter = self.result_filters.iter().find_map(|f| match f {
            ResultFilter::LintText(lint) => Some(lint),
            _ => None,
        });
        match lint_filter {
            None => findings.push(format!(
                "{PREFIX_BAD_CONFIG}the LintText filter is not used, this may cause crashes or undesired telephone cost"
            )),
            Some(lint) => {
                if lint.max_length < 35 || lint.max_length > 4096 {
                    findings.push(format!(
                        "{PREFIX_BAD_CONFIG}maximum output length is not within [35, 4096], this may cause undesired telephone cost"
                    ));
                }
            }
        }
        findings
    }

    /// Apply the command filters, invoke the feature selected by trigger
    /// prefix, then apply the result filters and return.
    pub async fn process(&self, cmd: Command) -> CommandResult {
        let began = Instant::now();
        let ret = self.process_inner(cmd).await;
        COMMAND_DURATION_STATS.trigger(began.elapsed().as_micros() as f64);
        ret
    }

    async fn process_inner(&self, mut cmd: Command) -> CommandResult {
        // Do not execute anything while the global lock down is effective.
        if lockdown::is_effective() {
            return CommandResult::from_error(CommandError::EmergencyLockDown);
        }
        let mut log_content = cmd.content.clone();
        let mut override_lint: Option<LintText> = None;
        let mut ret = match self
            .dispatch(&mut cmd, &mut log_content, &mut override_lint)
            .await
        {
            Ok(ret) => ret,
            Err(err) => CommandResult::from_error(err),
        };
        // The command inside the result serves logging: filters have already
        // removed the pieces that must never be logged, such as the PIN.
        ret.command = cmd.clone();
        ret.command.content = log_content;
        for result_filter in &self.result_filters {
            // The LintText filter may be replaced by the PLT override, for
            // this one call only; the installed instance is never mutated.
            let transformed = match (result_filter, &override_lint) {
                (ResultFilter::LintText(_), Some(overridden)) => overridden.transform(&mut ret),
                _ => result_filter.transform(&mut ret),
            };
            if let Err(err) = transformed {
                return CommandResult {
                    command: ret.command,
                    error: Some(err),
                    ..CommandResult::default()
                };
            }
        }
        ret
    }

    async fn dispatch(
        &self,
        cmd: &mut Command,
        log_content: &mut String,
        override_lint: &mut Option<LintText>,
    ) -> Result<CommandResult, CommandError> {
        for command_filter in &self.command_filters {
            *cmd = command_filter.transform(std::mem::take(cmd))?;
        }
        if let Some(err_result) = cmd.trim() {
            return Ok(err_result);
        }
        *log_content = cmd.content.clone();

        // Look for the PLT override; it affects the LintText filter and the
        // command timeout.
        if cmd.find_and_remove_prefix(PREFIX_COMMAND_PLT) {
            let installed = self.result_filters.iter().find_map(|f| match f {
                ResultFilter::LintText(lint) => Some(lint.clone()),
                _ => None,
            });
            let mut overridden = installed.ok_or(CommandError::LintTextMissing)?;
            let (begin_position, max_length, timeout_sec, remainder) = {
                let caps = REGEX_COMMAND_WITH_PLT
                    .captures(&cmd.content)
                    .ok_or(CommandError::BadPlt)?;
                (
                    caps[1].parse().map_err(|_| CommandError::BadPlt)?,
                    caps[2].parse().map_err(|_| CommandError::BadPlt)?,
                    caps[3].parse().map_err(|_| CommandError::BadPlt)?,
                    caps.get(4).map(|m| m.as_str().to_string()).unwrap_or_default(),
                )
            };
            if remainder.is_empty() {
                return Err(CommandError::BadPlt);
            }
            overridden.begin_position = begin_position;
            overridden.max_length = max_length;
            cmd.timeout_sec = timeout_sec;
            cmd.content = remainder;
            *override_lint = Some(overridden);
        }

        // The first trigger that is an exact prefix of the trimmed content
        // selects the feature; triggers are not prefixes of one another, so
        // the scan order cannot change the outcome.
        let mut matched = None;
        for (trigger, feature) in &self.features.lookup_by_trigger {
            if cmd.find_and_remove_prefix(trigger) {
                matched = Some(feature.clone());
                break;
            }
        }
        let feature = matched.ok_or(CommandError::BadPrefix)?;
        tracing::info!(content = %log_content, timeout_sec = cmd.timeout_sec, "going to run command");
        let ret = feature.execute(cmd.clone()).await;
        tracing::info!(content = %log_content, error = ?ret.error, "finished running command");
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{PinAndShortcuts, TranslateSequences};
    use crate::testsupport::get_test_command_processor;
    use crate::toolbox::shell::Shell;

    fn run(proc: &CommandProcessor, content: &str) -> CommandResult {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(proc.process(Command::new(content, 10)))
    }

    #[tokio::test]
    async fn rejects_empty_and_unauthenticated_commands() {
        let proc = get_test_command_processor();
        let ret = proc.process(Command::new("verysecret   ", 10)).await;
        assert_eq!(ret.error, Some(CommandError::EmptyCommand));
        assert_eq!(ret.combined_output, "Empty command");

        let ret = proc.process(Command::new("pin mismatch", 10)).await;
        assert_eq!(ret.error, Some(CommandError::PinMismatch));
        assert_eq!(ret.combined_output, "Failed to match PIN/shortcut");
    }

    #[tokio::test]
    async fn strips_pin_and_dispatches_by_trigger() {
        let proc = get_test_command_processor();
        let ret = proc
            .process(Command::new("verysecret .s echo hi", 10))
            .await;
        assert!(ret.error.is_none(), "{:?}", ret.error);
        assert_eq!(ret.combined_output, "hi");
        // The recorded command has the PIN removed but the trigger kept.
        assert_eq!(ret.command.content, ".s echo hi");

        let ret = proc.process(Command::new("verysecret .x what", 10)).await;
        assert_eq!(ret.error, Some(CommandError::BadPrefix));
    }

    #[tokio::test]
    async fn logged_content_no_longer_authenticates() {
        // Re-running the captured log content must fail the PIN gate: the
        // log records the dispatched command, not the credential.
        let proc = get_test_command_processor();
        let first = proc
            .process(Command::new("verysecret .s echo hi", 10))
            .await;
        let replay = proc
            .process(Command::new(first.command.content.clone(), 10))
            .await;
        assert_eq!(replay.error, Some(CommandError::PinMismatch));
    }

    #[tokio::test]
    async fn translate_sequences_rewrite_the_payload() {
        let proc = get_test_command_processor();
        let ret = proc
            .process(Command::new("verysecret .s echo alpha", 10))
            .await;
        assert_eq!(ret.combined_output, "beta");
    }

    #[tokio::test]
    async fn plt_overrides_window_and_timeout() {
        let proc = get_test_command_processor();
        // Without PLT: the full output, trimmed.
        let ret = proc
            .process(Command::new("verysecret .s echo 0123456789", 10))
            .await;
        assert_eq!(ret.combined_output, "0123456789");
        // P=2 L=5 T=30: slice [2..7).
        let ret = proc
            .process(Command::new("verysecret .plt 2 5 30 .s echo 0123456789", 10))
            .await;
        assert!(ret.error.is_none(), "{:?}", ret.error);
        assert_eq!(ret.combined_output, "23456");
        assert_eq!(ret.command.timeout_sec, 30);

        // L=0 keeps everything from P onwards.
        let ret = proc
            .process(Command::new("verysecret .plt 2 0 30 .s echo 0123456789", 10))
            .await;
        assert_eq!(ret.combined_output, "23456789");

        // P beyond the output clamps to empty, which SayEmptyOutput fills.
        let ret = proc
            .process(Command::new("verysecret .plt 90 5 30 .s echo 0123456789", 10))
            .await;
        assert_eq!(ret.combined_output, "EMPTY OUTPUT");
    }

    #[tokio::test]
    async fn malformed_plt_is_refused() {
        let proc = get_test_command_processor();
        let ret = proc.process(Command::new("verysecret .plt what", 10)).await;
        assert_eq!(ret.error, Some(CommandError::BadPlt));
        let ret = proc
            .process(Command::new("verysecret .plt 1 2 3", 10))
            .await;
        assert_eq!(ret.error, Some(CommandError::BadPlt));
    }

    #[tokio::test]
    async fn plt_requires_the_lint_filter() {
        let mut proc = get_test_command_processor();
        proc.result_filters
            .retain(|f| !matches!(f, ResultFilter::LintText(_)));
        let ret = proc
            .process(Command::new("verysecret .plt 0 35 10 .s echo hi", 10))
            .await;
        assert_eq!(ret.error, Some(CommandError::LintTextMissing));
    }

    #[test]
    fn sanity_findings() {
        let sane = get_test_command_processor();
        assert!(sane.is_sane_for_internet().is_empty());

        let mut short_pin = get_test_command_processor();
        short_pin.command_filters = vec![CommandFilter::PinAndShortcuts(PinAndShortcuts {
            pin: "short".to_string(),
            shortcuts: Default::default(),
        })];
        assert_eq!(short_pin.is_sane_for_internet().len(), 1);

        let mut no_lint = get_test_command_processor();
        no_lint
            .result_filters
            .retain(|f| !matches!(f, ResultFilter::LintText(_)));
        assert_eq!(no_lint.is_sane_for_internet().len(), 1);

        let mut tiny_window = get_test_command_processor();
        for filter in &mut tiny_window.result_filters {
            if let ResultFilter::LintText(lint) = filter {
                lint.max_length = 10;
            }
        }
        assert_eq!(tiny_window.is_sane_for_internet().len(), 1);

        let mut featureless = CommandProcessor {
            features: FeatureSet::default(),
            command_filters: vec![CommandFilter::PinAndShortcuts(PinAndShortcuts {
                pin: "verysecret".to_string(),
                shortcuts: Default::default(),
            })],
            result_filters: vec![ResultFilter::LintText(LintText {
                max_length: 35,
                ..LintText::default()
            })],
        };
        assert_eq!(featureless.is_sane_for_internet().len(), 1);
        featureless.command_filters.clear();
        assert!(featureless.is_empty());
    }

    #[test]
    fn shortcut_expansion_reaches_dispatch() {
        let features =
            FeatureSet::initialise(vec![Box::new(Shell::default())]).expect("feature set");
        let mut shortcuts = std::collections::HashMap::new();
        shortcuts.insert("hello".to_string(), ".s echo shortcut".to_string());
        let proc = CommandProcessor {
            features,
            command_filters: vec![
                CommandFilter::PinAndShortcuts(PinAndShortcuts {
                    pin: "verysecret".to_string(),
                    shortcuts,
                }),
                CommandFilter::TranslateSequences(TranslateSequences::default()),
            ],
            result_filters: vec![ResultFilter::ResetCombinedText],
        };
        let ret = run(&proc, "  hello ");
        assert_eq!(ret.combined_output, "shortcut\n");
    }
}
