//! Template Variable Resolution
//!
//! Builds the positional variable values for a send from the campaign's
//! variable mapping and a contact record. Paths resolve through the
//! contact's known fields, metadata map and custom fields with explicit
//! fallthrough; a missing value renders as an empty string rather than
//! aborting the whole campaign for one sparse contact.

use std::collections::HashMap;
use tracing::debug;

use wab_store::{Contact, FieldValue};

/// Resolve body variables 1..=count using the mapping
/// (position → field path).
pub fn build_body_variables(
    mapping: &HashMap<String, String>,
    count: u32,
    contact: &Contact,
) -> Vec<String> {
    (1..=count)
        .map(|position| {
            let Some(path) = mapping.get(&position.to_string()) else {
                debug!(position = position, "No mapping for template variable");
                return String::new();
            };
            match contact.resolve_field(path) {
                FieldValue::Text(value) => value,
                FieldValue::Missing => {
                    debug!(
                        position = position,
                        path = %path,
                        contact_id = %contact.id,
                        "Contact field missing for template variable"
                    );
                    String::new()
                }
            }
        })
        .collect()
}

/// Substitute positional `{{N}}` markers for previewing rendered bodies.
pub fn render_body(body: &str, variables: &[String]) -> String {
    let mut rendered = body.to_string();
    for (i, value) in variables.iter().enumerate() {
        rendered = rendered.replace(&format!("{{{{{}}}}}", i + 1), value);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> Contact {
        let mut contact = Contact::new("t1", "15551234567");
        contact.name = Some("Ada".into());
        contact
            .metadata
            .insert("order_id".into(), "A-1001".into());
        contact
    }

    fn mapping(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn builds_positional_variables_from_mapping() {
        let mapping = mapping(&[("1", "name"), ("2", "metadata.order_id")]);
        let variables = build_body_variables(&mapping, 2, &contact());
        assert_eq!(variables, vec!["Ada".to_string(), "A-1001".to_string()]);
    }

    #[test]
    fn missing_paths_render_empty() {
        let mapping = mapping(&[("1", "metadata.nope")]);
        let variables = build_body_variables(&mapping, 2, &contact());
        assert_eq!(variables, vec![String::new(), String::new()]);
    }

    #[test]
    fn renders_body_preview() {
        let rendered = render_body(
            "Hi {{1}}, order {{2}} shipped.",
            &["Ada".to_string(), "A-1001".to_string()],
        );
        assert_eq!(rendered, "Hi Ada, order A-1001 shipped.");
    }
}
