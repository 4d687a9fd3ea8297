//! Markdown rendering for the controller's `html` side channel.

use pulldown_cmark::{Event, Options, Parser, Tag, html};

use crate::errors::RenderError;

/// Renders markdown to HTML that is safe to display.
pub trait MarkdownRenderer: Send + Sync {
    fn render(&self, markdown: &str) -> Result<String, RenderError>;
}

/// `pulldown-cmark` renderer that escapes raw HTML and neutralizes script URLs.
#[derive(Clone, Copy, Debug, Default)]
pub struct SanitizingMarkdownRenderer;

const BLOCKED_SCHEMES: [&str; 3] = ["javascript:", "vbscript:", "data:"];

fn is_blocked_url(url: &str) -> bool {
    let normalized: String = url
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect::<String>()
        .to_ascii_lowercase();
    BLOCKED_SCHEMES
        .iter()
        .any(|scheme| normalized.starts_with(scheme))
}

impl MarkdownRenderer for SanitizingMarkdownRenderer {
    fn render(&self, markdown: &str) -> Result<String, RenderError> {
        let options = Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH;
        let events = Parser::new_ext(markdown, options).map(|event| match event {
            Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
            Event::Start(mut tag) => {
                if let Tag::Link { dest_url, .. } | Tag::Image { dest_url, .. } = &mut tag
                    && is_blocked_url(dest_url)
                {
                    *dest_url = "#".into();
                }
                Event::Start(tag)
            }
            other => other,
        });
        let mut out = String::with_capacity(markdown.len() * 3 / 2);
        html::push_html(&mut out, events);
        Ok(out)
    }
}
