//! Construct command processors and daemons out of the configuration
//! document.

use std::sync::Arc;

use st_config::{Config, FiltersConfig};
use st_core::filter::{
    CommandFilter, LintText, NotifyViaEmail, PinAndShortcuts, ResultFilter, TranslateSequences,
};
use st_core::mail::MailClient;
use st_core::processor::CommandProcessor;
use st_core::toolbox::env_control::EnvControl;
use st_core::toolbox::send_mail::SendMail;
use st_core::toolbox::shell::Shell;
use st_core::toolbox::{Feature, FeatureSet};

pub fn mail_client(config: &Config) -> MailClient {
    MailClient::from_config(&config.mail_client)
}

fn feature_set(config: &Config) -> anyhow::Result<FeatureSet> {
    let shell = if config.features.shell.interpreter.is_empty() {
        Shell::default()
    } else {
        Shell {
            interpreter: config.features.shell.interpreter.clone(),
        }
    };
    let features: Vec<Box<dyn Feature>> = vec![
        Box::new(shell),
        Box::new(EnvControl),
        // Left out automatically while the mail client is unconfigured.
        Box::new(SendMail {
            client: mail_client(config),
        }),
    ];
    FeatureSet::initialise(features)
}

/// One processor per daemon, built from that daemon's filter section. The
/// filter order is fixed: PIN gate then sequence translation in front;
/// combined-text reset, lint, empty-output substitution, then mail
/// notification behind.
pub fn processor(config: &Config, filters: &FiltersConfig) -> anyhow::Result<Arc<CommandProcessor>> {
    let features = feature_set(config)?;

    let mut command_filters = Vec::new();
    if let Some(pin) = &filters.pin_and_shortcuts {
        command_filters.push(CommandFilter::PinAndShortcuts(PinAndShortcuts {
            pin: pin.pin.clone(),
            shortcuts: pin.shortcuts.clone(),
        }));
    }
    if let Some(translate) = &filters.translate_sequences {
        let sequences = translate
            .sequences
            .iter()
            .filter(|pair| pair.len() >= 2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        command_filters.push(CommandFilter::TranslateSequences(TranslateSequences {
            sequences,
        }));
    }

    let mut result_filters = vec![ResultFilter::ResetCombinedText];
    if let Some(lint) = &filters.lint_text {
        result_filters.push(ResultFilter::LintText(LintText {
            trim_spaces: lint.trim_spaces,
            compress_spaces: lint.compress_spaces,
            compress_to_single_line: lint.compress_to_single_line,
            keep_visible_7bit_char_only: lint.keep_visible_7bit_char_only,
            begin_position: lint.begin_position,
            max_length: lint.max_length,
        }));
    }
    result_filters.push(ResultFilter::SayEmptyOutput);
    if let Some(notify) = &filters.notify_via_email {
        result_filters.push(ResultFilter::NotifyViaEmail(NotifyViaEmail {
            recipients: notify.recipients.clone(),
            mail_client: mail_client(config),
        }));
    }

    Ok(Arc::new(CommandProcessor {
        features,
        command_filters,
        result_filters,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_processor_from_config() {
        let config = Config::deserialise(
            r##"{
                "PlainSocketFilters": {
                    "PINAndShortcuts": {"PIN": "verysecret", "Shortcuts": {"alpha": ".s echo beta"}},
                    "TranslateSequences": {"Sequences": [["#", "|"], ["broken"]]},
                    "LintText": {"TrimSpaces": true, "MaxLength": 120},
                    "NotifyViaEmail": {"Recipients": ["me@example.com"]}
                }
            }"##,
        )
        .unwrap();
        let processor = processor(&config, &config.plain_socket_filters).unwrap();
        assert_eq!(processor.command_filters.len(), 2);
        // Reset, lint, say-empty, notify.
        assert_eq!(processor.result_filters.len(), 4);
        assert!(processor.is_sane_for_internet().is_empty());
        // Shell and environment control are always present; mail stays out
        // without a configured client.
        assert_eq!(processor.features.triggers(), vec![".e", ".s"]);
    }

    #[test]
    fn mail_feature_appears_once_configured() {
        let config = Config::deserialise(
            r#"{
                "MailClient": {"MTAHost": "localhost", "MTAPort": 25, "MailFrom": "root@localhost"},
                "HTTPFilters": {"PINAndShortcuts": {"PIN": "verysecret"}, "LintText": {"MaxLength": 160}}
            }"#,
        )
        .unwrap();
        let processor = processor(&config, &config.http_filters).unwrap();
        assert_eq!(processor.features.triggers(), vec![".e", ".m", ".s"]);
    }
}
