use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashSet;

use crate::agent::{PageState, ReducedPage};

const TRUNCATION_MARK: &str = "\n<!-- truncated -->";
const INDEX_HEADER: &str = "<!-- interactive elements -->\n";
const PAGE_HEADER: &str = "\n<!-- page -->\n";
/// Prefix of the section markers the browser adapter writes; these survive comment stripping.
pub const SECTION_MARKER: &str = "<!-- section:";

const NOISE_TAGS: &[&str] = &["script", "style", "noscript", "svg", "template", "iframe", "head"];

const KEPT_ATTRIBUTES: &[&str] = &[
    "id",
    "class",
    "name",
    "type",
    "href",
    "value",
    "placeholder",
    "aria-label",
    "role",
    "title",
    "alt",
    "for",
    "action",
    "selected",
    "checked",
    "disabled",
    "data-asin",
    "data-component-type",
];

/// Dropped entirely when they carry none of the kept attributes.
const LAYOUT_TAGS: &[&str] = &[
    "div", "span", "section", "article", "header", "footer", "main", "aside", "ul", "ol", "li", "p",
    "table", "tbody", "thead", "tr", "td", "th", "i", "b", "strong", "em", "small", "font",
    "center", "br", "hr", "picture", "source", "img", "figure", "label", "form",
];

static NOISE: Lazy<Vec<Regex>> = Lazy::new(|| {
    NOISE_TAGS
        .iter()
        .map(|t| Regex::new(&format!(r"(?is)<{t}\b[^>]*>.*?</{t}\s*>")).unwrap())
        .collect()
});
static COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<(/?)([a-zA-Z][a-zA-Z0-9-]*)([^<>]*?)(/?)>").unwrap());
static ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([^\s=/"'<>]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'<>]+)))?"#).unwrap()
});
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static INTERACTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)<(?:input|select|textarea|button)\b[^>]*>[^<]{0,80}|<a\b[^>]*>[^<]{0,80}|<[a-z]+[^>]*class="[^"]*a-(?:offscreen|price-whole|price)\b[^"]*"[^>]*>[^<]{1,40}"#,
    )
    .unwrap()
});

/// Shrinks captured markup to a byte budget. Over budget, an index of
/// interactive elements and prices goes ahead of the leading part of the page.
#[derive(Clone, Debug)]
pub struct PageReducer {
    budget: usize,
}

impl PageReducer {
    pub fn new(budget: usize) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn reduce_page(&self, page: &PageState) -> ReducedPage {
        ReducedPage {
            url: page.url.clone(),
            title: page.title.clone(),
            content: self.reduce(&page.content),
        }
    }

    /// The returned string is never longer than the budget, in bytes and therefore in characters.
    pub fn reduce(&self, raw: &str) -> String {
        let cleaned = clean_markup(raw);
        if cleaned.len() <= self.budget {
            return cleaned;
        }

        let mut out = String::with_capacity(self.budget);
        let index_budget = self.budget / 2;
        if INDEX_HEADER.len() < index_budget {
            out.push_str(INDEX_HEADER);
            let mut seen = HashSet::new();
            for m in INTERACTIVE.find_iter(&cleaned) {
                let line = m.as_str().trim();
                if !seen.insert(line) {
                    continue;
                }
                if out.len() + line.len() + 1 > index_budget {
                    break;
                }
                out.push_str(line);
                out.push('\n');
            }
            out.push_str(PAGE_HEADER);
        }

        let remaining = self
            .budget
            .saturating_sub(out.len())
            .saturating_sub(TRUNCATION_MARK.len());
        out.push_str(clip(&cleaned, remaining));
        out.push_str(TRUNCATION_MARK);
        clip(&out, self.budget).to_string()
    }
}

/// Strips noise and decoration and collapses whitespace; no size limit applied.
pub fn clean_markup(raw: &str) -> String {
    let mut html = raw.to_string();
    for re in NOISE.iter() {
        html = re.replace_all(&html, " ").into_owned();
    }
    html = COMMENT
        .replace_all(&html, |c: &Captures| {
            if c[0].starts_with(SECTION_MARKER) {
                format!("\n{}\n", &c[0])
            } else {
                " ".to_string()
            }
        })
        .into_owned();
    html = TAG.replace_all(&html, rewrite_tag).into_owned();

    html.lines()
        .map(|line| WHITESPACE.replace_all(line, " ").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn rewrite_tag(c: &Captures) -> String {
    let closing = !c[1].is_empty();
    let name = c[2].to_ascii_lowercase();
    let layout = LAYOUT_TAGS.contains(&name.as_str());
    if closing {
        return if layout { " ".into() } else { format!("</{name}>") };
    }

    let mut attrs = String::new();
    for a in ATTR.captures_iter(&c[3]) {
        let key = a[1].to_ascii_lowercase();
        if !KEPT_ATTRIBUTES.contains(&key.as_str()) {
            continue;
        }
        let value = a
            .get(2)
            .or_else(|| a.get(3))
            .or_else(|| a.get(4))
            .map(|m| m.as_str());
        match value {
            Some(v) => {
                let v = if key == "href" { shorten_href(v) } else { v };
                let v = if key == "class" { v } else { clip(v, 120) };
                attrs.push_str(&format!(" {key}=\"{}\"", v.replace('"', "'")));
            }
            None => attrs.push_str(&format!(" {key}")),
        }
    }

    if layout && attrs.is_empty() {
        return " ".into();
    }
    format!("<{name}{attrs}>")
}

/// Amazon tracking parameters dwarf the path; search links keep their query.
fn shorten_href(href: &str) -> &str {
    match href.find('?') {
        Some(i) if !href[..i].ends_with("/s") => &href[..i],
        _ => href,
    }
}

fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH_FORM: &str = r#"<form id="nav-search-bar-form" accept-charset="utf-8" style="x"><input type="text" id="twotabsearchtextbox" name="field-keywords" placeholder="Search Amazon" data-foo="bar"><input type="submit" id="nav-search-submit-button" value="Go"></form>"#;

    #[test]
    fn strips_scripts_styles_and_plain_comments() {
        let raw = format!(
            "<html><head><title>t</title></head><body><script>var x = 1;</script><style>.a{{}}</style>\
             <!-- tracking --><!-- section: #search -->{SEARCH_FORM}</body></html>"
        );
        let out = clean_markup(&raw);
        assert!(!out.contains("var x"));
        assert!(!out.contains(".a{"));
        assert!(!out.contains("tracking"));
        assert!(out.contains("<!-- section: #search -->"));
        assert!(out.contains(r#"<input type="text" id="twotabsearchtextbox" name="field-keywords" placeholder="Search Amazon">"#));
        assert!(!out.contains("data-foo"));
        assert!(!out.contains("style="));
    }

    #[test]
    fn bare_layout_tags_are_dropped_but_identified_ones_kept() {
        let out = clean_markup(r#"<div><div class="s-main-slot"><span>RTX 4090</span></div></div>"#);
        assert_eq!(out, r#"<div class="s-main-slot"> RTX 4090"#.to_string());
    }

    #[test]
    fn hrefs_lose_tracking_queries() {
        let out = clean_markup(r#"<a class="a-link-normal" href="/dp/B0BG9Z8LR1?ref=sr_1_1&pd_rd=abc">ASUS</a><a href="/s?k=rtx+4090&page=2">2</a>"#);
        assert!(out.contains(r#"href="/dp/B0BG9Z8LR1""#));
        assert!(out.contains(r#"href="/s?k=rtx+4090&page=2""#));
    }

    #[test]
    fn small_pages_pass_through_cleaned() {
        let reducer = PageReducer::new(15_000);
        assert_eq!(reducer.reduce(SEARCH_FORM), clean_markup(SEARCH_FORM));
    }

    #[test]
    fn output_never_exceeds_budget() {
        let filler = "<p>Lorem ipsum dolor sit amet, ünïcödé ✓ text</p>".repeat(2_000);
        let raw = format!("{filler}{SEARCH_FORM}{filler}");
        for budget in [0, 1, 7, 31, 64, 256, 1_000, 4_096, 15_000] {
            let out = PageReducer::new(budget).reduce(&raw);
            assert!(out.len() <= budget, "budget {budget} produced {}", out.len());
        }
    }

    #[test]
    fn interactive_elements_survive_truncation() {
        let filler = "<p>Sponsored filler paragraph with plenty of words</p>".repeat(3_000);
        let price = r#"<span class="a-price"><span class="a-offscreen">$1,599.99</span></span>"#;
        let raw = format!("{filler}{SEARCH_FORM}{price}");
        let out = PageReducer::new(2_000).reduce(&raw);
        assert!(out.len() <= 2_000);
        assert!(out.contains("twotabsearchtextbox"));
        assert!(out.contains("nav-search-submit-button"));
        assert!(out.contains("$1,599.99"));
        assert!(out.ends_with(TRUNCATION_MARK.trim_start_matches('\n')) || out.len() == 2_000);
    }

    #[test]
    fn reduce_page_keeps_url_and_title() {
        let page = PageState::new(
            Some("https://www.amazon.com/".into()),
            Some("Amazon.com".into()),
            SEARCH_FORM.into(),
        );
        let reduced = PageReducer::new(500).reduce_page(&page);
        assert_eq!(reduced.url.as_deref(), Some("https://www.amazon.com/"));
        assert_eq!(reduced.title.as_deref(), Some("Amazon.com"));
        assert!(reduced.content.len() <= 500);
    }
}
