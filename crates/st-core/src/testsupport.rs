//! Processor constructors used by test cases across the workspace.

use rand::RngCore;
use std::fmt::Write as _;

use crate::filter::{
    CommandFilter, LintText, PinAndShortcuts, ResultFilter, TranslateSequences,
};
use crate::processor::CommandProcessor;
use crate::toolbox::env_control::EnvControl;
use crate::toolbox::shell::Shell;
use crate::toolbox::FeatureSet;

/// A realistic command processor: shell execution behind the PIN
/// `verysecret`, the sequence `alpha -> beta`, and a 35 character output
/// window.
pub fn get_test_command_processor() -> CommandProcessor {
    let features = FeatureSet::initialise(vec![
        Box::new(Shell::default()),
        Box::new(EnvControl),
    ])
    .expect("test feature set must initialise");
    CommandProcessor {
        features,
        command_filters: vec![
            CommandFilter::PinAndShortcuts(PinAndShortcuts {
                pin: "verysecret".to_string(),
                shortcuts: Default::default(),
            }),
            CommandFilter::TranslateSequences(TranslateSequences {
                sequences: vec![("alpha".to_string(), "beta".to_string())],
            }),
        ],
        result_filters: vec![
            ResultFilter::ResetCombinedText,
            ResultFilter::LintText(LintText {
                trim_spaces: true,
                max_length: 35,
                ..LintText::default()
            }),
            ResultFilter::SayEmptyOutput,
        ],
    }
}

/// A do-nothing yet sane processor: the random 128 byte PIN renders it
/// unable to invoke any feature.
pub fn get_empty_command_processor() -> CommandProcessor {
    let features = FeatureSet::initialise(vec![Box::new(Shell::default())])
        .expect("test feature set must initialise");
    let mut pin_bytes = [0u8; 128];
    rand::thread_rng().fill_bytes(&mut pin_bytes);
    let pin = pin_bytes.iter().fold(String::new(), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    });
    CommandProcessor {
        features,
        command_filters: vec![CommandFilter::PinAndShortcuts(PinAndShortcuts {
            pin,
            shortcuts: Default::default(),
        })],
        result_filters: vec![
            ResultFilter::ResetCombinedText,
            ResultFilter::LintText(LintText {
                max_length: 35,
                ..LintText::default()
            }),
            ResultFilter::SayEmptyOutput,
        ],
    }
}
