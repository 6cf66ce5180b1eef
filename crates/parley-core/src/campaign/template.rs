//! Template Renderer - Personalizes campaign message bodies

use regex::{Captures, Regex};
use serde_json::Value;

const PLACEHOLDER_PATTERN: &str = r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}";

/// Replaces `{{key}}` placeholders with values from an item's substitution snapshot
pub struct TemplateRenderer {
    placeholder: Regex,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self {
            placeholder: Regex::new(PLACEHOLDER_PATTERN).expect("placeholder pattern is valid"),
        }
    }

    /// Render a body against a JSON object of substitutions.
    ///
    /// Placeholders with no matching key are removed.
    pub fn render(&self, body: &str, substitutions: &Value) -> String {
        self.placeholder
            .replace_all(body, |caps: &Captures| {
                match substitutions.get(&caps[1]) {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                }
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_render_basic_template() {
        let renderer = TemplateRenderer::new();
        let subs = json!({"name": "Ana Souza", "first_name": "Ana", "city": "Recife"});

        assert_eq!(
            renderer.render("Hi {{first_name}}, see you in {{ city }}!", &subs),
            "Hi Ana, see you in Recife!"
        );
    }

    #[test]
    fn test_render_removes_unknown_and_null() {
        let renderer = TemplateRenderer::new();
        let subs = json!({"name": "Ana", "neighborhood": null});

        assert_eq!(
            renderer.render("{{name}} {{neighborhood}}|{{unknown}}|", &subs),
            "Ana ||"
        );
    }

    #[test]
    fn test_render_leaves_plain_braces() {
        let renderer = TemplateRenderer::new();
        assert_eq!(renderer.render("{ok} {{ }}", &json!({})), "{ok} {{ }}");
    }
}
