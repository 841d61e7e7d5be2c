//! Jinja rendering for `## template: jinja` documents
//!
//! The marker line is removed before rendering; the remaining text is
//! rendered with [`context::build_context`] and then treated like any other
//! document.

pub mod context;

pub use context::build_context;

use crate::CloudInitError;
use crate::datasources::InstanceMetadata;
use minijinja::Environment;
use tracing::debug;

const MARKERS: [&str; 2] = ["## template: jinja", "## template:jinja"];

/// Check if content starts with the jinja marker
pub fn is_jinja_template(content: &str) -> bool {
    let trimmed = content.trim_start();
    MARKERS.iter().any(|m| trimmed.starts_with(m))
}

/// Strip the marker line, if present
pub fn strip_template_marker(content: &str) -> &str {
    let trimmed = content.trim_start();
    MARKERS
        .iter()
        .find_map(|m| trimmed.strip_prefix(m))
        .map(|rest| rest.trim_start_matches([' ', '\t', '\r', '\n']))
        .unwrap_or(content)
}

/// Render a template with instance metadata
pub fn render_template(
    template: &str,
    metadata: &InstanceMetadata,
) -> Result<String, CloudInitError> {
    debug!("Rendering jinja template");

    let mut env = Environment::new();
    env.add_template("user-data", strip_template_marker(template))
        .map_err(|e| CloudInitError::InvalidData(format!("Template parse error: {}", e)))?;

    env.get_template("user-data")
        .and_then(|tmpl| tmpl.render(build_context(metadata)))
        .map_err(|e| CloudInitError::InvalidData(format!("Template render error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> InstanceMetadata {
        InstanceMetadata::from_value(
            serde_yaml::from_str(
                "instance-id: i-0abc\nlocal-hostname: web-1\nregion: eu-west-1\n",
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_is_jinja_template() {
        assert!(is_jinja_template("## template: jinja\n#cloud-config"));
        assert!(is_jinja_template("  ## template:jinja\n"));
        assert!(!is_jinja_template("#cloud-config\nhostname: test"));
    }

    #[test]
    fn test_strip_template_marker() {
        assert_eq!(
            strip_template_marker("## template: jinja\n#cloud-config\na: 1"),
            "#cloud-config\na: 1"
        );
        assert_eq!(strip_template_marker("#cloud-config\n"), "#cloud-config\n");
    }

    #[test]
    fn test_render_variables() {
        let template = "## template: jinja\n#cloud-config\nhost: {{ local_hostname }}\n\
                        region: {{ ds.meta_data.region }}\nid: {{ v1.instance_id }}\n\
                        raw: {{ ds.meta_data.instance_id }}\n";
        let rendered = render_template(template, &metadata()).unwrap();
        assert!(rendered.starts_with("#cloud-config"));
        assert!(rendered.contains("host: web-1"));
        assert!(rendered.contains("region: eu-west-1"));
        assert!(rendered.contains("id: i-0abc"));
        assert!(rendered.contains("raw: i-0abc"));
    }

    #[test]
    fn test_render_conditional() {
        let template = "## template: jinja\n{% if instance_id %}known: yes{% else %}known: no{% endif %}";
        assert!(render_template(template, &metadata()).unwrap().contains("known: yes"));
        assert!(
            render_template(template, &InstanceMetadata::default())
                .unwrap()
                .contains("known: no")
        );
    }

    #[test]
    fn test_render_invalid_syntax() {
        assert!(render_template("## template: jinja\nvalue: {{ invalid", &metadata()).is_err());
    }
}
