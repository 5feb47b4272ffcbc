//! Speech markup rendering.
//!
//! Devices speak `output.markup` when it is present. Rendering rich markup
//! (behaviors, pauses, voice) is a separate service; Hive only needs a
//! `text -> markup` function and ships a plain renderer that makes text
//! safe to embed.

/// Mood hint for rendering: name and intensity in `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Mood {
    pub name: String,
    pub intensity: f32,
}

pub trait MarkupRenderer: Send + Sync {
    fn render(&self, text: &str, mood: Option<&Mood>) -> String;
}

/// Escapes markup-significant characters and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainMarkup;

impl MarkupRenderer for PlainMarkup {
    fn render(&self, text: &str, _mood: Option<&Mood>) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' => out.push_str("&quot;"),
                c => out.push(c),
            }
        }
        out
    }
}
