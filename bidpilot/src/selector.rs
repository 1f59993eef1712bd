use serde::{Deserialize, Serialize};

/// Represents ways to locate an element on the wizard page
///
/// Selectors are written as strings in configuration files and parsed with
/// `Selector::from`. Supported forms:
///
/// - `#some_id` looks an element up by id
/// - `css:input[title*="Anular"]` runs a CSS query
/// - `text:button:Firmar sin Clave Única` matches a tag whose text contains the needle
/// - `a >> b` resolves `b` inside the element matched by `a` (iframes are entered)
/// - `a || b` tries `a`, then `b`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Selector {
    /// Select by element id
    Id(String),
    /// Select using a CSS query
    Css(String),
    /// Select the first `tag` element whose trimmed text contains `text`
    Text { tag: String, text: String },
    /// Resolve each selector inside the element matched by the previous one
    Chain(Vec<Selector>),
    /// First alternative that matches wins
    AnyOf(Vec<Selector>),
    /// Represents an invalid selector string, with a reason.
    Invalid(String),
}

impl Selector {
    /// Expand a slot pattern such as `..._rptBids_ctl{INDEX}_rblBids_0` for a
    /// 1-based position on the page. The index is zero padded to two digits.
    pub fn from_template(pattern: &str, position: u32) -> Selector {
        let expanded = pattern.replace("{INDEX}", &format!("{position:02}"));
        Selector::from(expanded.as_str())
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Selector::Invalid(_) => false,
            Selector::Chain(parts) | Selector::AnyOf(parts) => parts.iter().all(|p| p.is_valid()),
            _ => true,
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Id(id) => write!(f, "#{id}"),
            Selector::Css(q) => write!(f, "css:{q}"),
            Selector::Text { tag, text } => write!(f, "text:{tag}:{text}"),
            Selector::Chain(parts) => {
                let joined: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "{}", joined.join(" >> "))
            }
            Selector::AnyOf(parts) => {
                let joined: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "{}", joined.join(" || "))
            }
            Selector::Invalid(reason) => write!(f, "invalid:{reason}"),
        }
    }
}

impl From<&str> for Selector {
    fn from(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() {
            return Selector::Invalid("empty selector".to_string());
        }

        // Alternatives bind looser than chains
        let alternatives: Vec<&str> = s.split("||").map(|p| p.trim()).collect();
        if alternatives.len() > 1 {
            return Selector::AnyOf(alternatives.into_iter().map(Selector::from).collect());
        }

        let parts: Vec<&str> = s.split(">>").map(|p| p.trim()).collect();
        if parts.len() > 1 {
            return Selector::Chain(parts.into_iter().map(Selector::from).collect());
        }

        match s {
            _ if s.starts_with("css:") => Selector::Css(s[4..].trim().to_string()),
            _ if s.starts_with("text:") => {
                let rest = &s[5..];
                match rest.split_once(':') {
                    Some((tag, text)) if !tag.trim().is_empty() && !text.trim().is_empty() => {
                        Selector::Text {
                            tag: tag.trim().to_lowercase(),
                            text: text.trim().to_string(),
                        }
                    }
                    _ => Selector::Invalid(format!(
                        "text selector needs the form text:<tag>:<needle>, got '{s}'"
                    )),
                }
            }
            _ if s.starts_with('#') => {
                let id = &s[1..];
                // "#a .b" or "#a[x]" are CSS queries, not bare ids
                if id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                {
                    Selector::Id(id.to_string())
                } else {
                    Selector::Css(s.to_string())
                }
            }
            _ if s.starts_with("id:") => Selector::Id(s[3..].trim().to_string()),
            // Anything else is handed to querySelector as-is
            _ => Selector::Css(s.to_string()),
        }
    }
}

impl From<String> for Selector {
    fn from(s: String) -> Self {
        Selector::from(s.as_str())
    }
}

impl From<Selector> for String {
    fn from(s: Selector) -> Self {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_selector() {
        let selector = Selector::from("#ctl00_btnNext");
        assert_eq!(selector, Selector::Id("ctl00_btnNext".to_string()));
    }

    #[test]
    fn test_hash_with_css_suffix_is_css() {
        let selector = Selector::from("#tblOrganismos tr");
        assert_eq!(selector, Selector::Css("#tblOrganismos tr".to_string()));
    }

    #[test]
    fn test_text_selector() {
        match Selector::from("text:Button:Firmar sin Clave Única") {
            Selector::Text { tag, text } => {
                assert_eq!(tag, "button");
                assert_eq!(text, "Firmar sin Clave Única");
            }
            other => panic!("Expected Text selector, got {other:?}"),
        }
    }

    #[test]
    fn test_text_selector_without_needle_is_invalid() {
        assert!(!Selector::from("text:button").is_valid());
    }

    #[test]
    fn test_chain_and_alternatives() {
        let selector = Selector::from("#frame >> #browse_local_admin_file || css:input[type=file]");
        match selector {
            Selector::AnyOf(alts) => {
                assert_eq!(alts.len(), 2);
                assert!(matches!(&alts[0], Selector::Chain(parts) if parts.len() == 2));
                assert_eq!(alts[1], Selector::Css("input[type=file]".to_string()));
            }
            other => panic!("Expected AnyOf selector, got {other:?}"),
        }
    }

    #[test]
    fn test_template_pads_index() {
        let selector = Selector::from_template(
            "#ctl00_mpcphFormWizardFields_rptBids_ctl{INDEX}_rblBids_0",
            3,
        );
        assert_eq!(
            selector,
            Selector::Id("ctl00_mpcphFormWizardFields_rptBids_ctl03_rblBids_0".to_string())
        );
    }

    #[test]
    fn test_display_round_trips_through_from() {
        let raw = "text:a:Declarar y firmar || css:a.declarar";
        let selector = Selector::from(raw);
        assert_eq!(Selector::from(selector.to_string().as_str()), selector);
    }
}
