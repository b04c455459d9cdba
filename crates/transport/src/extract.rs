//! Response HTML to normalized markdown.

use crate::page::{PageMessage, Role};

/// Convert a response block's HTML to markdown, dropping UI chrome such as
/// copy buttons and inline scripts.
pub fn html_to_markdown(html: &str) -> String {
    use htmd::HtmlToMarkdown;

    let converter = HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "button", "svg", "noscript", "iframe"])
        .build();

    match converter.convert(html) {
        Ok(md) => clean_markdown(&md),
        Err(_) => extract_text_fallback(html),
    }
}

/// Collapse runs of blank lines to one and trim the ends.
fn clean_markdown(md: &str) -> String {
    let mut result = String::with_capacity(md.len());
    let mut blank_run = false;

    for line in md.lines() {
        if line.trim().is_empty() {
            blank_run = true;
            continue;
        }
        if !result.is_empty() {
            result.push('\n');
            if blank_run {
                result.push('\n');
            }
        }
        blank_run = false;
        result.push_str(line.trim_end());
    }

    result.trim().to_string()
}

fn extract_text_fallback(html: &str) -> String {
    let fragment = scraper::Html::parse_fragment(html);
    fragment
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render a chat transcript as markdown with one section per message.
pub fn transcript_markdown(title: &str, messages: &[PageMessage]) -> String {
    let mut out = format!("# {}\n", title.trim());
    for msg in messages {
        let heading = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        out.push_str(&format!("\n## {}\n\n{}\n", heading, html_to_markdown(&msg.html)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_conversion() {
        let md = html_to_markdown("<div><p>The answer is <strong>5</strong>.</p></div>");
        assert!(md.contains("The answer is **5**."));
    }

    #[test]
    fn test_code_blocks_survive_and_buttons_drop() {
        let html = r#"<div><pre><code>fn main() {}</code></pre><button>Copy code</button></div>"#;
        let md = html_to_markdown(html);
        assert!(md.contains("fn main() {}"));
        assert!(!md.contains("Copy code"));
    }

    #[test]
    fn test_empty_block_is_empty_markdown() {
        assert_eq!(html_to_markdown("<div>   </div>"), "");
    }

    #[test]
    fn test_clean_markdown_collapses_blank_runs() {
        assert_eq!(clean_markdown("a\n\n\n\nb\nc  \n\n"), "a\n\nb\nc");
    }

    #[test]
    fn test_transcript_sections() {
        let messages = vec![
            PageMessage {
                role: Role::User,
                html: "<p>What is 2+3?</p>".to_string(),
            },
            PageMessage {
                role: Role::Assistant,
                html: "<p>5</p>".to_string(),
            },
        ];
        let md = transcript_markdown("Math", &messages);
        assert!(md.starts_with("# Math\n"));
        let user = md.find("## User").unwrap();
        let asst = md.find("## Assistant").unwrap();
        assert!(user < asst);
        assert!(md.contains("What is 2+3?"));
    }
}
