use std::sync::OnceLock;

use regex::Regex;

fn title_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex")
    })
}

fn noise_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(script|style|noscript|template|svg)[^>]*>.*?</(script|style|noscript|template|svg)>|<!--.*?-->")
            .expect("valid regex")
    })
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").expect("valid regex"))
}

fn whitespace_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("valid regex"))
}

pub fn extract_title(html: &str) -> Option<String> {
    let raw = title_regex().captures(html)?.get(1)?.as_str();
    let title = normalize(&decode_entities(raw));
    (!title.is_empty()).then_some(title)
}

/// Visible text of the document with markup, scripts and styles removed.
pub fn extract_text(html: &str) -> String {
    let without_noise = noise_regex().replace_all(html, " ");
    let without_tags = tag_regex().replace_all(&without_noise, " ");
    normalize(&decode_entities(&without_tags))
}

/// Truncates to at most `max_chars` characters on a char boundary. Zero
/// disables truncation.
pub fn truncate(text: String, max_chars: usize) -> String {
    if max_chars == 0 {
        return text;
    }
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text,
    }
}

fn normalize(text: &str) -> String {
    whitespace_regex().replace_all(text, " ").trim().to_string()
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title>
        Acme &amp; Sons | Pricing
    </title><style>body { color: red }</style></head>
    <body><script>var x = "<p>hidden</p>";</script>
    <h1>Plans</h1><!-- promo --><p>Starter&nbsp;$9</p></body></html>"#;

    #[test]
    fn title_is_trimmed_and_decoded() {
        assert_eq!(extract_title(PAGE).as_deref(), Some("Acme & Sons | Pricing"));
        assert_eq!(extract_title("<html><body>none</body></html>"), None);
    }

    #[test]
    fn text_drops_scripts_and_markup() {
        let text = extract_text(PAGE);
        assert!(text.contains("Plans Starter $9"));
        assert!(!text.contains("hidden"));
        assert!(!text.contains("color"));
        assert!(!text.contains("promo"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo".to_string(), 2), "hé");
        assert_eq!(truncate("abc".to_string(), 10), "abc");
        assert_eq!(truncate("abc".to_string(), 0), "abc");
    }
}
