//! Directive tags embedded in generated speech.
//!
//! Session handlers may return text such as `Okay! <launch:STORY:s1>` and
//! let the envelope turn the tags into response actions. Recognized forms:
//!
//! | tag                              | action                         |
//! |----------------------------------|--------------------------------|
//! | `<exit>`                         | launch first exit, else exit   |
//! | `<sleep>`                        | SLEEP                          |
//! | `<launch:M>` / `<launch:M:C>`    | LAUNCH                         |
//! | `<launch_if_confirmed:M[:C]>`    | LAUNCH_IF_CONFIRMED            |
//!
//! Every other `<...>` span is removed from the text without effect.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::envelope::{ActionKind, OutputType, ResponseAction, ResponseEnvelope};
use crate::request::DeviceRequest;

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("tag regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Exit,
    Sleep,
    Launch {
        module_id: String,
        content_id: Option<String>,
    },
    LaunchIfConfirmed {
        module_id: String,
        content_id: Option<String>,
    },
}

impl Directive {
    /// Parse the inside of one tag (without the angle brackets).
    pub fn parse(tag: &str) -> Option<Self> {
        let mut parts = tag.split(':');
        let verb = parts.next()?;
        let module_id = parts.next().filter(|m| !m.is_empty()).map(str::to_string);
        let content_id = parts.next().filter(|c| !c.is_empty()).map(str::to_string);

        match verb {
            "exit" => Some(Directive::Exit),
            "sleep" => Some(Directive::Sleep),
            "launch" => Some(Directive::Launch {
                module_id: module_id?,
                content_id,
            }),
            "launch_if_confirmed" => Some(Directive::LaunchIfConfirmed {
                module_id: module_id?,
                content_id,
            }),
            _ => None,
        }
    }
}

/// Recognized directives in source order.
pub fn scan_directives(text: &str) -> Vec<Directive> {
    TAG_RE
        .find_iter(text)
        .filter_map(|m| {
            let tag = m.as_str();
            Directive::parse(&tag[1..tag.len() - 1])
        })
        .collect()
}

/// Remove every `<...>` span.
pub fn strip_tags(text: &str) -> String {
    TAG_RE.replace_all(text, "").into_owned()
}

impl ResponseEnvelope {
    /// Turn directive tags in `output.text` into actions, in source order,
    /// then strip all tags from the text.
    ///
    /// The first directive replaces the seeded RESPOND action and later ones
    /// append, so a fresh envelope ends up with exactly one action per
    /// recognized tag.
    pub fn ingest_action_tags(&mut self, request: Option<&DeviceRequest>) {
        if self.output.text.is_empty() {
            return;
        }

        for directive in scan_directives(&self.output.text) {
            match directive {
                Directive::Exit => self.push_launch_or_exit(request),
                Directive::Sleep => self.push_action(ResponseAction::new(
                    ActionKind::Sleep,
                    None,
                    None,
                    OutputType::GlobalResponse,
                )),
                Directive::Launch {
                    module_id,
                    content_id,
                } => self.push_action(ResponseAction::new(
                    ActionKind::Launch,
                    Some(&module_id),
                    content_id.as_deref(),
                    OutputType::GlobalResponse,
                )),
                Directive::LaunchIfConfirmed {
                    module_id,
                    content_id,
                } => self.push_action(ResponseAction::new(
                    ActionKind::LaunchIfConfirmed,
                    Some(&module_id),
                    content_id.as_deref(),
                    OutputType::GlobalResponse,
                )),
            }
        }

        self.output.text = strip_tags(&self.output.text);
    }
}
