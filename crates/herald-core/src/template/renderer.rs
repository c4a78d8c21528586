//! Placeholder rendering.
//!
//! `{{name}}` placeholders are substituted from the variable map.
//! Required variables missing from the map abort the render; optional
//! ones render as the empty string. Escaping is channel-specific:
//! HTML-escaped values for HTML email bodies, raw text everywhere
//! else. Push payloads are structured JSON assembled by the transport,
//! so their values stay raw here.
//!
//! Rendering is pure: identical `(template version, channel, locale,
//! sorted variables)` always produces byte-identical output, which is
//! what makes the rendered output cacheable.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::notification::Channel;
use crate::repository::Template;
use crate::{Error, Result};

/// Output of a successful render
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rendered {
    pub subject: Option<String>,
    pub body: String,
    /// Whether `body` is HTML (carried through to the email transport)
    pub html: bool,
    /// Template version the output was produced from
    pub version: i64,
}

/// Render a template with the given variables.
pub fn render(template: &Template, vars: &serde_json::Value) -> Result<Rendered> {
    let values = flatten_variables(vars);

    for required in template.required_variables.iter() {
        if !values.contains_key(required.as_str()) {
            return Err(Error::MissingVariable(required.clone()));
        }
    }

    let escape_html = template.channel == Channel::Email && template.html;

    let subject = match &template.subject {
        // Subjects are plain text regardless of the body format
        Some(subject) => Some(substitute(subject, &values, false)?),
        None => None,
    };

    let body = substitute(&template.body, &values, escape_html)?;

    Ok(Rendered {
        subject,
        body,
        html: escape_html,
        version: template.version,
    })
}

/// Deterministic cache key for a render. Variables are sorted before
/// hashing so map iteration order cannot change the key.
pub fn render_key(template: &Template, vars: &serde_json::Value) -> String {
    let values = flatten_variables(vars);

    let mut hasher = DefaultHasher::new();
    for (key, value) in &values {
        key.hash(&mut hasher);
        value.hash(&mut hasher);
    }

    format!(
        "{}/{}/{}/v{}/{:016x}",
        template.template_id,
        template.channel,
        template.locale,
        template.version,
        hasher.finish()
    )
}

/// Sorted scalar view of the variable object. Non-scalar values are
/// carried as compact JSON.
fn flatten_variables(vars: &serde_json::Value) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();

    if let Some(obj) = vars.as_object() {
        for (key, value) in obj {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            values.insert(key.clone(), text);
        }
    }

    values
}

fn substitute(
    source: &str,
    values: &BTreeMap<String, String>,
    escape_html: bool,
) -> Result<String> {
    let mut output = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];

        let end = after_open
            .find("}}")
            .ok_or_else(|| Error::Render(format!("Unclosed placeholder near offset {}", start)))?;

        let name = after_open[..end].trim();
        if name.is_empty() {
            return Err(Error::Render("Empty placeholder".to_string()));
        }

        if let Some(value) = values.get(name) {
            if escape_html {
                output.push_str(&escape(value));
            } else {
                output.push_str(value);
            }
        }
        // Unknown optional variables render as empty string

        rest = &after_open[end + 2..];
    }

    output.push_str(rest);
    Ok(output)
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email_template(html: bool) -> Template {
        Template::new(
            "password_reset",
            Channel::Email,
            "en",
            "Hello {{name}}, reset here: {{resetUrl}}",
        )
        .with_subject("Reset for {{name}}")
        .with_html(html)
        .with_required_variables(vec!["resetUrl".to_string()])
    }

    #[test]
    fn test_substitution() {
        let vars = serde_json::json!({"name": "Ada", "resetUrl": "https://x/r?t=abc"});
        let rendered = render(&email_template(false), &vars).unwrap();

        assert_eq!(rendered.subject.as_deref(), Some("Reset for Ada"));
        assert_eq!(rendered.body, "Hello Ada, reset here: https://x/r?t=abc");
    }

    #[test]
    fn test_missing_required_variable() {
        let vars = serde_json::json!({"name": "Ada"});
        let err = render(&email_template(false), &vars).unwrap_err();
        assert!(matches!(err, Error::MissingVariable(name) if name == "resetUrl"));
    }

    #[test]
    fn test_optional_variable_renders_empty() {
        let vars = serde_json::json!({"resetUrl": "https://x"});
        let rendered = render(&email_template(false), &vars).unwrap();
        assert_eq!(rendered.body, "Hello , reset here: https://x");
    }

    #[test]
    fn test_html_escaping_applies_to_html_email_only() {
        let vars = serde_json::json!({"name": "<b>Ada</b>", "resetUrl": "https://x?a=1&b=2"});

        let html = render(&email_template(true), &vars).unwrap();
        assert!(html.body.contains("&lt;b&gt;Ada&lt;/b&gt;"));
        assert!(html.body.contains("https://x?a=1&amp;b=2"));
        // subject stays plain text
        assert_eq!(html.subject.as_deref(), Some("Reset for <b>Ada</b>"));

        let plain = render(&email_template(false), &vars).unwrap();
        assert!(plain.body.contains("<b>Ada</b>"));
    }

    #[test]
    fn test_sms_renders_raw() {
        let template = Template::new("alert", Channel::Sms, "en", "Alert: {{detail}}");
        let vars = serde_json::json!({"detail": "CPU > 90%"});
        let rendered = render(&template, &vars).unwrap();
        assert_eq!(rendered.body, "Alert: CPU > 90%");
    }

    #[test]
    fn test_render_is_deterministic() {
        let template = email_template(false);
        let vars = serde_json::json!({"resetUrl": "https://x", "name": "Ada"});
        // Same variables in a different insertion order
        let vars_reordered = serde_json::json!({"name": "Ada", "resetUrl": "https://x"});

        let a = render(&template, &vars).unwrap();
        let b = render(&template, &vars_reordered).unwrap();
        assert_eq!(a, b);
        assert_eq!(render_key(&template, &vars), render_key(&template, &vars_reordered));
    }

    #[test]
    fn test_render_key_changes_with_version() {
        let mut template = email_template(false);
        let vars = serde_json::json!({"resetUrl": "https://x"});
        let before = render_key(&template, &vars);
        template.version += 1;
        let after = render_key(&template, &vars);
        assert_ne!(before, after);
    }

    #[test]
    fn test_unclosed_placeholder_is_render_error() {
        let template = Template::new("broken", Channel::Sms, "en", "Hi {{name");
        let err = render(&template, &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, Error::Render(_)));
    }

    #[test]
    fn test_number_and_bool_variables() {
        let template = Template::new("counts", Channel::InApp, "en", "{{n}} new, urgent={{u}}");
        let vars = serde_json::json!({"n": 4, "u": true});
        let rendered = render(&template, &vars).unwrap();
        assert_eq!(rendered.body, "4 new, urgent=true");
    }
}
