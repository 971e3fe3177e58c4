//! Command and result filters applied around feature dispatch.
//!
//! Both kinds are small closed sets, so they are encoded as tagged variants
//! with one handler per variant; the processor runs them in declared order
//! and the order is part of the contract.

use std::collections::HashMap;

use crate::error::CommandError;
use crate::mail::MailClient;
use crate::toolbox::{Command, CommandResult};

/// Substituted for the combined output when a command produced nothing.
pub const EMPTY_OUTPUT_TEXT: &str = "EMPTY OUTPUT";

/// Transforms a command before feature dispatch; the first filter error
/// aborts the pipeline.
pub enum CommandFilter {
    PinAndShortcuts(PinAndShortcuts),
    TranslateSequences(TranslateSequences),
}

impl CommandFilter {
    pub fn transform(&self, cmd: Command) -> Result<Command, CommandError> {
        match self {
            Self::PinAndShortcuts(filter) => filter.transform(cmd),
            Self::TranslateSequences(filter) => filter.transform(cmd),
        }
    }
}

/// The authentication gate: a command must open with the secret PIN, or be
/// one of the configured shortcut words.
#[derive(Debug, Clone, Default)]
pub struct PinAndShortcuts {
    pub pin: String,
    pub shortcuts: HashMap<String, String>,
}

impl PinAndShortcuts {
    pub fn transform(&self, cmd: Command) -> Result<Command, CommandError> {
        let trimmed = cmd.content.trim();
        if !self.pin.is_empty() {
            if let Some(rest) = trimmed.strip_prefix(&self.pin) {
                return Ok(Command {
                    content: rest.trim().to_string(),
                    ..cmd
                });
            }
        }
        if let Some(full_command) = self.shortcuts.get(trimmed) {
            return Ok(Command {
                content: full_command.clone(),
                ..cmd
            });
        }
        Err(CommandError::PinMismatch)
    }
}

/// Ordered literal substitutions applied across the command content, giving
/// input channels that mangle special characters a way to express them.
#[derive(Debug, Clone, Default)]
pub struct TranslateSequences {
    pub sequences: Vec<(String, String)>,
}

impl TranslateSequences {
    pub fn transform(&self, mut cmd: Command) -> Result<Command, CommandError> {
        for (from, to) in &self.sequences {
            if from.is_empty() {
                continue;
            }
            cmd.content = cmd.content.replace(from, to);
        }
        Ok(cmd)
    }
}

/// Transforms an execution result before it is written back; the first
/// filter error aborts with that error.
pub enum ResultFilter {
    ResetCombinedText,
    LintText(LintText),
    SayEmptyOutput,
    NotifyViaEmail(NotifyViaEmail),
}

impl ResultFilter {
    pub fn transform(&self, result: &mut CommandResult) -> Result<(), CommandError> {
        match self {
            Self::ResetCombinedText => {
                result.reset_combined_text();
                Ok(())
            }
            Self::LintText(filter) => filter.transform(result),
            Self::SayEmptyOutput => {
                if result.combined_output.trim().is_empty() {
                    result.combined_output = EMPTY_OUTPUT_TEXT.to_string();
                }
                Ok(())
            }
            Self::NotifyViaEmail(filter) => filter.transform(result),
        }
    }
}

/// Tidies the combined output for narrow channels such as SMS: whitespace
/// normalisation, character class filtering, then a window slice.
#[derive(Debug, Clone, Default)]
pub struct LintText {
    pub trim_spaces: bool,
    pub compress_spaces: bool,
    pub compress_to_single_line: bool,
    pub keep_visible_7bit_char_only: bool,
    pub begin_position: usize,
    pub max_length: usize,
}

impl LintText {
    pub fn transform(&self, result: &mut CommandResult) -> Result<(), CommandError> {
        let mut text = result.combined_output.clone();
        if self.compress_to_single_line {
            text = text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join(";");
        }
        if self.trim_spaces {
            text = text.trim().to_string();
        }
        if self.keep_visible_7bit_char_only {
            text.retain(|c| (' '..='~').contains(&c));
        }
        if self.compress_spaces {
            let mut compressed = String::with_capacity(text.len());
            let mut in_gap = false;
            for c in text.chars() {
                if c.is_whitespace() {
                    if !in_gap {
                        compressed.push(' ');
                        in_gap = true;
                    }
                } else {
                    compressed.push(c);
                    in_gap = false;
                }
            }
            text = compressed;
        }
        // The slice window clamps instead of panicking on out-of-range
        // positions, and counts characters rather than bytes.
        if self.begin_position > 0 {
            text = text.chars().skip(self.begin_position).collect();
        }
        if self.max_length > 0 {
            text = text.chars().take(self.max_length).collect();
        }
        result.combined_output = text;
        Ok(())
    }
}

/// Side effect filter: posts the combined result to a recipient list in the
/// background. Delivery failures are logged, never surfaced to the caller.
#[derive(Debug, Clone, Default)]
pub struct NotifyViaEmail {
    pub recipients: Vec<String>,
    pub mail_client: MailClient,
}

impl NotifyViaEmail {
    pub fn is_configured(&self) -> bool {
        !self.recipients.is_empty() && self.mail_client.is_configured()
    }

    pub fn transform(&self, result: &mut CommandResult) -> Result<(), CommandError> {
        if !self.is_configured() {
            return Ok(());
        }
        let client = self.mail_client.clone();
        let recipients = self.recipients.clone();
        let subject = format!("steward has run: {}", result.command.content);
        let body = result.combined_output.clone();
        tokio::spawn(async move {
            if let Err(err) = client.send(&subject, &body, &recipients).await {
                tracing::warn!(error = %format!("{err:#}"), "failed to send notification email");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolbox::Command;

    fn cmd(content: &str) -> Command {
        Command::new(content, 10)
    }

    #[test]
    fn pin_strips_and_passes_through() {
        let filter = PinAndShortcuts {
            pin: "mypin".to_string(),
            shortcuts: HashMap::new(),
        };
        let out = filter.transform(cmd("mypineapple")).unwrap();
        assert_eq!(out.content, "eapple");
        let out = filter.transform(cmd("\n\n mypineapple \n\n")).unwrap();
        assert_eq!(out.content, "eapple");
        assert_eq!(
            filter.transform(cmd("abc")).unwrap_err(),
            CommandError::PinMismatch
        );
    }

    #[test]
    fn pin_is_left_inverse_of_prefixing() {
        let filter = PinAndShortcuts {
            pin: "verysecret".to_string(),
            shortcuts: HashMap::new(),
        };
        for tail in ["x", " .s echo hi ", "\talpha\t"] {
            let out = filter
                .transform(cmd(&format!("verysecret{tail}")))
                .unwrap();
            assert_eq!(out.content, tail.trim());
        }
    }

    #[test]
    fn shortcuts_expand_to_full_commands() {
        let mut shortcuts = HashMap::new();
        shortcuts.insert("abc".to_string(), "123".to_string());
        shortcuts.insert("def".to_string(), "456".to_string());
        let filter = PinAndShortcuts {
            pin: "mypin".to_string(),
            shortcuts,
        };
        assert_eq!(filter.transform(cmd("\n\n abc")).unwrap().content, "123");
        assert_eq!(filter.transform(cmd(" def \n")).unwrap().content, "456");
        assert_eq!(
            filter.transform(cmd("nothing_to_see")).unwrap_err(),
            CommandError::PinMismatch
        );
    }

    #[test]
    fn command_equal_to_bare_pin_leaves_empty_content() {
        let filter = PinAndShortcuts {
            pin: "verysecret".to_string(),
            shortcuts: HashMap::new(),
        };
        assert_eq!(filter.transform(cmd("verysecret")).unwrap().content, "");
        assert_eq!(
            filter.transform(cmd("verysecret   ")).unwrap().content,
            ""
        );
    }

    #[test]
    fn translate_applies_pairs_in_order() {
        let mut filter = TranslateSequences::default();
        assert_eq!(filter.transform(cmd("abc")).unwrap().content, "abc");
        filter.sequences = vec![
            ("abc".to_string(), "123".to_string()),
            ("def".to_string(), "456".to_string()),
        ];
        assert_eq!(
            filter.transform(cmd(" abc def ")).unwrap().content,
            " 123 456 "
        );
        assert_eq!(filter.transform(cmd(" ghi ")).unwrap().content, " ghi ");
    }

    #[test]
    fn lint_window_clamps_instead_of_panicking() {
        let lint = LintText {
            max_length: 10,
            ..LintText::default()
        };
        let mut ret = CommandResult::from_output("");
        ret.combined_output = "0123456789abcdef".to_string();
        lint.transform(&mut ret).unwrap();
        assert_eq!(ret.combined_output, "0123456789");

        // L greater than the text length keeps everything.
        let lint = LintText {
            max_length: 100,
            ..LintText::default()
        };
        ret.combined_output = "short".to_string();
        lint.transform(&mut ret).unwrap();
        assert_eq!(ret.combined_output, "short");

        // P past the end clamps to empty; L = 0 means unlimited.
        let lint = LintText {
            begin_position: 99,
            ..LintText::default()
        };
        ret.combined_output = "short".to_string();
        lint.transform(&mut ret).unwrap();
        assert_eq!(ret.combined_output, "");
    }

    #[test]
    fn lint_normalises_whitespace_and_characters() {
        let lint = LintText {
            trim_spaces: true,
            compress_spaces: true,
            compress_to_single_line: true,
            keep_visible_7bit_char_only: true,
            ..LintText::default()
        };
        let mut ret = CommandResult::default();
        ret.combined_output = "  first line \n\n second\tline\t\u{4f60}\u{597d} \n".to_string();
        lint.transform(&mut ret).unwrap();
        assert_eq!(ret.combined_output, "first line;secondline");
    }

    #[test]
    fn say_empty_output_substitutes_placeholder() {
        let mut ret = CommandResult::default();
        ret.combined_output = " \n ".to_string();
        ResultFilter::SayEmptyOutput.transform(&mut ret).unwrap();
        assert_eq!(ret.combined_output, EMPTY_OUTPUT_TEXT);

        ret.combined_output = "kept".to_string();
        ResultFilter::SayEmptyOutput.transform(&mut ret).unwrap();
        assert_eq!(ret.combined_output, "kept");
    }
}
