//! Branch name generation and legality checks.
//!
//! Names are generated from a template with `{prefix}`, `{date}`,
//! `{username}` and `{description}` placeholders, sanitized to Git ref
//! rules.

use crate::errors::{Result, TrellisError};
use chrono::Utc;

/// Default template for generated branch names
pub const DEFAULT_TEMPLATE: &str = "{prefix}{date}_{username}_{description}";

/// Options for branch name generation
#[derive(Debug, Clone)]
pub struct NameOptions {
    pub prefix: String,
    pub template: String,
    pub date_format: String,
    pub username: Option<String>,
}

impl Default for NameOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            template: DEFAULT_TEMPLATE.to_string(),
            date_format: "%Y%m%d".to_string(),
            username: None,
        }
    }
}

/// Generate a branch name from a description and template options
pub fn generate_branch_name(description: &str, options: &NameOptions) -> Result<String> {
    if description.trim().is_empty() {
        return Err(TrellisError::validation("Description cannot be empty"));
    }

    let date = Utc::now().format(&options.date_format).to_string();
    let username = options
        .username
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .or_else(|| std::env::var("USERNAME").ok())
        .unwrap_or_else(|| "user".to_string());

    let name = options
        .template
        .replace("{prefix}", &sanitize_component(&options.prefix))
        .replace("{date}", &date)
        .replace("{username}", &sanitize_component(&username))
        .replace("{description}", &sanitize_component(description));

    let name = clean_name(&name);
    if name.is_empty() {
        return Err(TrellisError::validation(
            "Generated branch name is empty after sanitization",
        ));
    }

    validate_branch_name(&name)?;
    Ok(name)
}

/// Reject names that violate Git ref naming rules
pub fn validate_branch_name(name: &str) -> Result<()> {
    let illegal = |reason: &str| {
        Err(TrellisError::validation(format!(
            "Illegal branch name '{name}': {reason}"
        )))
    };

    if name.is_empty() {
        return illegal("name is empty");
    }
    if name.starts_with('-') || name.starts_with('/') {
        return illegal("must not start with '-' or '/'");
    }
    if name.ends_with('/') || name.ends_with('.') || name.ends_with(".lock") {
        return illegal("must not end with '/', '.' or '.lock'");
    }
    if name.contains("..") || name.contains("//") || name.contains("@{") {
        return illegal("must not contain '..', '//' or '@{'");
    }
    for ch in name.chars() {
        if ch.is_ascii_control() || " ~^:?*[\\".contains(ch) {
            return illegal("contains whitespace or a special ref character");
        }
    }
    Ok(())
}

/// Lowercase, hyphenate separators, strip everything else
fn sanitize_component(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    let mut last_hyphen = false;
    for ch in component.to_lowercase().chars() {
        let mapped = match ch {
            ' ' | '_' => Some('-'),
            'a'..='z' | '0'..='9' | '-' | '/' => Some(ch),
            _ => None,
        };
        if let Some(ch) = mapped {
            if ch == '-' {
                if last_hyphen {
                    continue;
                }
                last_hyphen = true;
            } else {
                last_hyphen = false;
            }
            out.push(ch);
        }
    }
    out.trim_matches('-').to_string()
}

fn clean_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last = '\0';
    for ch in name.chars() {
        if (ch == '-' && last == '-') || (ch == '_' && last == '_') {
            continue;
        }
        out.push(ch);
        last = ch;
    }
    out.trim_matches(|c| c == '-' || c == '/' || c == '_')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_with_description_only() {
        let options = NameOptions {
            template: "{description}".to_string(),
            ..Default::default()
        };
        let name = generate_branch_name("Fix Login Bug", &options).unwrap();
        assert_eq!(name, "fix-login-bug");
    }

    #[test]
    fn test_generate_with_prefix_and_username() {
        let options = NameOptions {
            prefix: "feature/".to_string(),
            username: Some("Alex Doe".to_string()),
            ..Default::default()
        };
        let name = generate_branch_name("add tests", &options).unwrap();
        assert!(name.starts_with("feature/"));
        assert!(name.contains("alex-doe"));
        assert!(name.ends_with("add-tests"));
        validate_branch_name(&name).unwrap();
    }

    #[test]
    fn test_empty_description_rejected() {
        let result = generate_branch_name("   ", &NameOptions::default());
        assert!(matches!(result, Err(TrellisError::Validation(_))));
    }

    #[test]
    fn test_special_characters_stripped() {
        let options = NameOptions {
            template: "{description}".to_string(),
            ..Default::default()
        };
        let name = generate_branch_name("hello!!! world???", &options).unwrap();
        assert_eq!(name, "hello-world");
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        for bad in [
            "",
            "-leading",
            "/leading",
            "trailing/",
            "trailing.",
            "double..dot",
            "has space",
            "ref.lock",
            "at@{sign",
            "star*name",
        ] {
            assert!(validate_branch_name(bad).is_err(), "should reject {bad:?}");
        }
    }

    #[test]
    fn test_validate_accepts_good_names() {
        for good in ["main", "feature/login", "fix-123", "user/alex/wip"] {
            validate_branch_name(good).unwrap();
        }
    }
}
