//! Template rendering: placeholder substitution with channel-specific
//! escaping, behind a two-tier (process-local + shared) cache.

pub mod cache;
pub mod renderer;

pub use cache::{CacheStats, TemplateCache};
pub use renderer::{render, Rendered};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::Channel;
    use crate::repository::Template;

    #[test]
    fn test_module_renders_through_public_api() {
        let template = Template::new("welcome", Channel::Sms, "en", "Hi {{name}}");
        let vars = serde_json::json!({"name": "Ada"});
        let rendered = render(&template, &vars).unwrap();
        assert_eq!(rendered.body, "Hi Ada");
    }
}
