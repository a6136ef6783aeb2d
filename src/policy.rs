use url::Url;

use crate::agent::{Action, AgentError, PolicyEngine, Verdict, AMAZON_HOME};
use crate::config::env_list;

const MAX_SELECTOR_LEN: usize = 512;
const MAX_TEXT_LEN: usize = 500;
const MAX_KEY_LEN: usize = 32;
const MAX_SCROLL: i64 = 20_000;
const MAX_WAIT_MS: u64 = 30_000;

/// Script injection attempts, matched case-insensitively against targets and values.
const SCRIPT_PATTERNS: &[&str] = &[
    "javascript:",
    "vbscript:",
    "data:text/html",
    "<script",
    "eval(",
    "exec(",
    "new function",
    "import(",
    "fetch(",
    "xmlhttprequest",
    "document.cookie",
    "document.write",
    "localstorage",
    "sessionstorage",
    "__proto__",
    "onerror=",
    "onload=",
];

/// Checkout, payment and account-modifying surfaces, matched against targets only.
const ACCOUNT_PATTERNS: &[&str] = &[
    "/gp/buy",
    "/checkout",
    "buy-now",
    "buynow",
    "place-order",
    "placeyourorder",
    "turbo-checkout",
    "one-click",
    "oneclick",
    "/gp/css/account",
    "/gp/css/homepage",
    "/a/addresses",
    "/cpe/yourpayments",
    "/gp/wallet",
    "payment",
    "/ap/cnep",
    "/ap/forgotpassword",
    "close-account",
    "delete-account",
    "cancel-order",
    "/gp/subscribe",
    "prime/signup",
    "sign-out",
    "signout",
];

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Registrable domains navigation may reach; subdomains are included.
    pub allowed_domains: Vec<String>,
    /// Base for resolving relative navigation targets.
    pub base_url: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_domains: env_list("CART_PILOT_ALLOWED_DOMAINS", &["amazon.com"]),
            base_url: AMAZON_HOME.to_string(),
        }
    }
}

/// Pattern deny-list plus a navigation domain allow-list. Best effort only:
/// an action that avoids every listed pattern passes.
#[derive(Debug, Clone)]
pub struct DenyListPolicy {
    allowed_domains: Vec<String>,
    base: Url,
}

impl DenyListPolicy {
    pub fn new(cfg: &PolicyConfig) -> Result<Self, AgentError> {
        let allowed_domains = normalize_domains(&cfg.allowed_domains);
        if allowed_domains.is_empty() {
            return Err(AgentError::Config("no allowed domains configured".into()));
        }
        let base = Url::parse(&cfg.base_url)
            .map_err(|e| AgentError::Config(format!("invalid base url {}: {}", cfg.base_url, e)))?;
        Ok(Self { allowed_domains, base })
    }

    /// Amazon-only policy.
    pub fn amazon() -> Result<Self, AgentError> {
        Self::new(&PolicyConfig {
            allowed_domains: vec!["amazon.com".to_string()],
            base_url: AMAZON_HOME.to_string(),
        })
    }

    fn normalize(&self, action: &Action) -> Result<Action, String> {
        for text in [action.target(), action.value()].into_iter().flatten() {
            if let Some(p) = first_match(text, SCRIPT_PATTERNS) {
                return Err(format!("script content `{p}`"));
            }
        }
        if let Some(target) = action.target() {
            if let Some(p) = first_match(target, ACCOUNT_PATTERNS) {
                return Err(format!("account or payment operation `{p}`"));
            }
        }

        Ok(match action {
            Action::Navigate { url } => Action::Navigate { url: self.check_url(url)? },
            Action::Click { selector } => Action::Click { selector: check_selector(selector)? },
            Action::Type { selector, text } => {
                if text.chars().count() > MAX_TEXT_LEN {
                    return Err(format!("text longer than {MAX_TEXT_LEN} characters"));
                }
                Action::Type { selector: check_selector(selector)?, text: text.clone() }
            }
            Action::Press { selector, key } => {
                let key = key.trim();
                if key.is_empty() || key.len() > MAX_KEY_LEN {
                    return Err("malformed key".into());
                }
                Action::Press {
                    selector: selector.as_deref().map(check_selector).transpose()?,
                    key: key.to_string(),
                }
            }
            Action::Select { selector, value } => {
                if value.len() > MAX_TEXT_LEN {
                    return Err("option value too long".into());
                }
                Action::Select { selector: check_selector(selector)?, value: value.clone() }
            }
            Action::Scroll { dx, dy } => Action::Scroll {
                dx: (*dx).clamp(-MAX_SCROLL, MAX_SCROLL),
                dy: (*dy).clamp(-MAX_SCROLL, MAX_SCROLL),
            },
            Action::WaitFor { selector, timeout_ms } => Action::WaitFor {
                selector: check_selector(selector)?,
                timeout_ms: (*timeout_ms).min(MAX_WAIT_MS),
            },
        })
    }

    fn check_url(&self, raw: &str) -> Result<String, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("empty navigation target".into());
        }
        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => self
                .base
                .join(raw)
                .map_err(|e| format!("malformed url: {e}"))?,
            Err(e) => return Err(format!("malformed url: {e}")),
        };
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("scheme `{}` not allowed", url.scheme()));
        }
        let host = url.host_str().map(str::to_ascii_lowercase).ok_or("url has no host")?;
        if !host_allowed(&host, &self.allowed_domains) {
            return Err(format!("host `{host}` is outside the allowed domains"));
        }
        Ok(url.to_string())
    }
}

impl PolicyEngine for DenyListPolicy {
    fn review(&self, action: &Action) -> Verdict {
        match self.normalize(action) {
            Ok(normalized) => Verdict::Accept(normalized),
            Err(reason) => Verdict::Reject { reason },
        }
    }
}

fn check_selector(selector: &str) -> Result<String, String> {
    let selector = selector.trim();
    if selector.is_empty() {
        return Err("empty locator".into());
    }
    if selector.len() > MAX_SELECTOR_LEN {
        return Err("locator too long".into());
    }
    if selector.chars().any(char::is_control) {
        return Err("locator contains control characters".into());
    }
    if !balanced(selector) {
        return Err("malformed locator".into());
    }
    Ok(selector.to_string())
}

/// Brackets and parentheses outside quoted strings must pair up.
fn balanced(selector: &str) -> bool {
    let mut stack = Vec::new();
    let mut quote: Option<char> = None;
    for c in selector.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '[' | '(') => stack.push(c),
            (None, ']') => {
                if stack.pop() != Some('[') {
                    return false;
                }
            }
            (None, ')') => {
                if stack.pop() != Some('(') {
                    return false;
                }
            }
            _ => {}
        }
    }
    stack.is_empty() && quote.is_none()
}

fn first_match(text: &str, patterns: &[&'static str]) -> Option<&'static str> {
    let lower = text.to_ascii_lowercase();
    patterns.iter().copied().find(|p| lower.contains(p))
}

fn normalize_domains(domains: &[String]) -> Vec<String> {
    domains
        .iter()
        .map(|d| d.trim().trim_start_matches("*.").trim_start_matches('.').to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect()
}

fn host_allowed(host: &str, allowed: &[String]) -> bool {
    allowed
        .iter()
        .any(|d| host == d || host.ends_with(&format!(".{d}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reject_reason(action: Action) -> String {
        match DenyListPolicy::amazon().unwrap().review(&action) {
            Verdict::Reject { reason } => reason,
            Verdict::Accept(a) => panic!("expected rejection, accepted {a}"),
        }
    }

    fn accepted(action: Action) -> Action {
        match DenyListPolicy::amazon().unwrap().review(&action) {
            Verdict::Accept(a) => a,
            Verdict::Reject { reason } => panic!("expected acceptance, rejected: {reason}"),
        }
    }

    #[test]
    fn navigation_outside_amazon_is_rejected() {
        let reason = reject_reason(Action::Navigate { url: "https://evil.example.com/phish".into() });
        assert!(reason.contains("evil.example.com"));
        reject_reason(Action::Navigate { url: "https://amazon.com.evil.io/".into() });
        reject_reason(Action::Navigate { url: "https://www.amazon.com@evil.io/".into() });
        reject_reason(Action::Navigate { url: "file:///etc/passwd".into() });
    }

    #[test]
    fn amazon_subdomains_and_relative_paths_are_accepted() {
        assert_eq!(
            accepted(Action::Navigate { url: "https://smile.amazon.com/s?k=ssd".into() }),
            Action::Navigate { url: "https://smile.amazon.com/s?k=ssd".into() }
        );
        assert_eq!(
            accepted(Action::Navigate { url: " /s?k=RTX+4090 ".into() }),
            Action::Navigate { url: "https://www.amazon.com/s?k=RTX+4090".into() }
        );
    }

    #[test]
    fn script_injection_is_rejected_in_targets_and_values() {
        reject_reason(Action::Navigate { url: "javascript:alert(1)".into() });
        reject_reason(Action::Type {
            selector: "#twotabsearchtextbox".into(),
            text: "<script>steal()</script>".into(),
        });
        reject_reason(Action::Click { selector: "a[onload=eval(x)]".into() });
    }

    #[test]
    fn checkout_and_account_operations_are_rejected() {
        let reason = reject_reason(Action::Click { selector: "#buy-now-button".into() });
        assert!(reason.contains("account or payment"));
        reject_reason(Action::Click { selector: "input[name='placeYourOrder1']".into() });
        reject_reason(Action::Navigate { url: "https://www.amazon.com/cpe/yourpayments/wallet".into() });
        reject_reason(Action::Navigate { url: "https://www.amazon.com/gp/buy/spc/handlers/display.html".into() });
    }

    #[test]
    fn search_text_mentioning_payment_is_still_allowed() {
        accepted(Action::Type {
            selector: "#twotabsearchtextbox".into(),
            text: "payment card holder".into(),
        });
    }

    #[test]
    fn malformed_locators_are_rejected() {
        assert_eq!(reject_reason(Action::Click { selector: "   ".into() }), "empty locator");
        reject_reason(Action::Click { selector: "div[data-asin".into() });
        reject_reason(Action::Click { selector: "a\nb".into() });
        reject_reason(Action::Click { selector: "x".repeat(MAX_SELECTOR_LEN + 1) });
        reject_reason(Action::Press { selector: None, key: "".into() });
    }

    #[test]
    fn accepted_actions_are_normalized() {
        assert_eq!(
            accepted(Action::Click { selector: "  #nav-search-submit-button ".into() }),
            Action::Click { selector: "#nav-search-submit-button".into() }
        );
        assert_eq!(
            accepted(Action::Scroll { dx: 0, dy: 1_000_000 }),
            Action::Scroll { dx: 0, dy: MAX_SCROLL }
        );
        assert_eq!(
            accepted(Action::WaitFor { selector: ".s-main-slot".into(), timeout_ms: 120_000 }),
            Action::WaitFor { selector: ".s-main-slot".into(), timeout_ms: MAX_WAIT_MS }
        );
        assert_eq!(
            accepted(Action::Click { selector: r#"a[href*="/dp/"]"#.into() }),
            Action::Click { selector: r#"a[href*="/dp/"]"#.into() }
        );
    }

    #[test]
    fn config_domains_are_normalized() {
        let policy = DenyListPolicy::new(&PolicyConfig {
            allowed_domains: vec!["  *.Amazon.co.uk ".into(), String::new()],
            base_url: "https://www.amazon.co.uk".into(),
        })
        .unwrap();
        assert!(matches!(
            policy.review(&Action::Navigate { url: "https://www.amazon.co.uk/".into() }),
            Verdict::Accept(_)
        ));
        assert!(matches!(
            policy.review(&Action::Navigate { url: "https://www.amazon.com/".into() }),
            Verdict::Reject { .. }
        ));
        assert!(DenyListPolicy::new(&PolicyConfig {
            allowed_domains: vec![],
            base_url: AMAZON_HOME.into()
        })
        .is_err());
    }
    #[test]
    fn bad_base_url_is_a_config_error() {
        let amazon = DenyListPolicy::amazon().unwrap();
        assert_eq!(amazon.base.host_str(), Some("www.amazon.com"));
        assert_eq!(amazon.allowed_domains, vec!["amazon.com".to_string()]);
        let err = DenyListPolicy::new(&PolicyConfig {
            allowed_domains: vec!["amazon.com".into()],
            base_url: "not a url".into(),
        })
        .unwrap_err();
        assert!(matches!(err, AgentError::Config(ref m) if m.contains("not a url")));
    }
}
