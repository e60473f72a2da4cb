//! `{{variable}}` substitution for predefined message templates.

use std::collections::HashMap;

/// Render a template against a variable map.
///
/// Placeholders without a binding are left verbatim so a misconfigured
/// template is visible in the activity log instead of silently blanked.
pub fn render(template: &str, variables: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                match variables.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unclosed placeholder: keep the tail as-is
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_bound_variables() {
        assert_eq!(
            render("Hi {{name}}, welcome to {{shop}}!", &vars(&[("name", "Ana"), ("shop", "Glow")])),
            "Hi Ana, welcome to Glow!"
        );
    }

    #[test]
    fn unresolved_placeholder_stays_verbatim() {
        assert_eq!(
            render("Hi {{name}}, your code is {{code}}", &vars(&[("name", "Ana")])),
            "Hi Ana, your code is {{code}}"
        );
    }

    #[test]
    fn placeholder_names_are_trimmed() {
        assert_eq!(render("{{ name }}", &vars(&[("name", "Bo")])), "Bo");
    }

    #[test]
    fn unclosed_placeholder_is_preserved() {
        assert_eq!(render("Hello {{name", &vars(&[("name", "Ana")])), "Hello {{name");
    }

    #[test]
    fn no_placeholders_is_identity() {
        assert_eq!(render("plain text", &HashMap::new()), "plain text");
    }
}
