//! Template rendering
//!
//! Bootstraps, listener resources, request bodies and expected stat values
//! are all text templates with `{{ Vars.Name }}` / `{{ Ports.Name }}`
//! placeholders. Rendering is strict: a reference to a variable that is not
//! in the map is an error, never an empty string.
//!
//! The Go-style leading dot (`{{ .Vars.Name }}`) is accepted so existing
//! template files can be used unchanged.

use std::error::Error as StdError;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tera::{Context, Tera};

use crate::common::{Error, Result};

/// Name the inline template is registered under
const TEMPLATE_NAME: &str = "template";

fn leading_dot() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{(-?)\s*\.([A-Za-z_])").expect("static regex"))
}

fn undefined_variable() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Variable `([^`]+)` not found").expect("static regex"))
}

/// Render `source` against `variables`
///
/// `variables` must serialize to a map; its top-level keys become the names
/// templates can reference.
pub fn render<T: Serialize + ?Sized>(source: &str, variables: &T) -> Result<String> {
    let source = leading_dot().replace_all(source, "{{$1 $2");

    let mut tera = Tera::default();
    tera.add_raw_template(TEMPLATE_NAME, &source)
        .map_err(|e| Error::MalformedTemplate(error_chain(&e)))?;

    let context = Context::from_serialize(variables)
        .map_err(|e| Error::Internal(format!("Template variables are not a map: {}", e)))?;

    tera.render(TEMPLATE_NAME, &context).map_err(|e| {
        let chain = error_chain(&e);
        match undefined_variable().captures(&chain) {
            Some(caps) => Error::MissingVariable(caps[1].to_string()),
            None => Error::MalformedTemplate(chain),
        }
    })
}

/// Read a template file fully as text
pub fn load(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::file_read(path, e))
}

/// Flatten an error and its sources into one line
fn error_chain(err: &tera::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_renders_vars_and_ports() {
        let vars = json!({
            "Vars": { "RequestCount": "10" },
            "Ports": { "ServerPort": 20001 },
        });

        let out = render(
            "count={{ Vars.RequestCount }} port={{ Ports.ServerPort }}",
            &vars,
        )
        .unwrap();
        assert_eq!(out, "count=10 port=20001");
    }

    #[test]
    fn test_accepts_go_style_leading_dot() {
        let vars = json!({ "Vars": { "Node": "server" } });

        let out = render("node: {{ .Vars.Node }}\nid: {{- .Vars.Node }}", &vars).unwrap();
        assert_eq!(out, "node: server\nid:server");
    }

    #[test]
    fn test_missing_variable_fails() {
        let vars = json!({ "Vars": { "Present": "yes" } });

        let err = render("{{ Vars.Absent }}", &vars).unwrap_err();
        match err {
            Error::MissingVariable(name) => assert_eq!(name, "Vars.Absent"),
            other => panic!("expected MissingVariable, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_template_fails() {
        let vars = json!({ "Vars": {} });

        let err = render("{{ Vars.Open ", &vars).unwrap_err();
        assert!(matches!(err, Error::MalformedTemplate(_)), "{:?}", err);
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let vars = json!({ "Vars": { "A": "1", "B": "2" } });
        let source = "{{ Vars.A }}-{{ Vars.B }}";

        let first = render(source, &vars).unwrap();
        for _ in 0..5 {
            assert_eq!(render(source, &vars).unwrap(), first);
        }
    }

    #[test]
    fn test_text_without_placeholders_is_unchanged() {
        let body = "name: server\naddress:\n  port_value: 8080\n";
        assert_eq!(render(body, &json!({})).unwrap(), body);
    }

    #[test]
    fn test_load_missing_file() {
        let err = load(Path::new("/nonexistent/template.yaml.tmpl")).unwrap_err();
        assert!(matches!(err, Error::FileRead { .. }));
    }
}
