//! Wire formats: serialize a batch of events into the byte payload a sink
//! delivers.
//!
//! Built-in formats are rendered natively; any other template name resolves
//! against the user template registry (header/row/footer expansion).

use bytes::Bytes;
use minijinja::Environment;
use thiserror::Error;
use tracing::{error, warn};

use crate::config::TemplateConfig;
use crate::output::s2s;
use crate::sample::{Event, Sample};

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("template rendering failed: {0}")]
    Template(#[from] minijinja::Error),

    #[error("output template '{0}' does not exist")]
    UnknownTemplate(String),
}

/// Registry of user output templates. Each template contributes up to three
/// minijinja templates: `<name>_header`, `<name>_row`, `<name>_footer`.
pub struct TemplateSet {
    env: Environment<'static>,
    names: Vec<String>,
}

impl TemplateSet {
    pub fn build(configs: &[TemplateConfig]) -> Self {
        let mut env = Environment::new();
        let mut names = Vec::new();
        for t in configs {
            if t.name.is_empty() || t.row.is_empty() {
                warn!(template = %t.name, "template needs a name and a row, skipping");
                continue;
            }
            let mut ok = true;
            let parts = [
                ("row", t.row.as_str()),
                ("header", t.header.as_str()),
                ("footer", t.footer.as_str()),
            ];
            for (part, source) in parts {
                if source.is_empty() {
                    continue;
                }
                let key = format!("{}_{part}", t.name);
                if let Err(e) = env.add_template_owned(key, source.to_string()) {
                    error!(template = %t.name, part, error = %e, "bad template, skipping");
                    ok = false;
                    break;
                }
            }
            if ok {
                names.push(t.name.clone());
            }
        }
        TemplateSet { env, names }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Render one part of a template against an event, or `None` when the
    /// part was not configured.
    fn render_part(
        &self,
        name: &str,
        part: &str,
        event: &Event,
    ) -> Result<Option<String>, FormatError> {
        let key = format!("{name}_{part}");
        match self.env.get_template(&key) {
            Ok(tmpl) => Ok(Some(tmpl.render(event)?)),
            Err(_) => Ok(None),
        }
    }
}

impl Default for TemplateSet {
    fn default() -> Self {
        TemplateSet::build(&[])
    }
}

/// Serialize a batch of events according to the sample's output template.
pub fn render_payload(
    sample: &Sample,
    events: &[Event],
    templates: &TemplateSet,
) -> Result<Bytes, FormatError> {
    let mut out: Vec<u8> = Vec::with_capacity(events.len() * 128);
    let get = |ev: &Event, key: &str| -> String {
        ev.get(key).cloned().unwrap_or_default()
    };
    // S2S frames the stream itself; event separators would corrupt it.
    let newline = sample.output.outputter != "splunktcp";

    match sample.output.output_template.as_str() {
        "raw" => {
            for ev in events {
                out.extend_from_slice(get(ev, "_raw").as_bytes());
                if newline {
                    out.push(b'\n');
                }
            }
        }
        "json" => {
            for ev in events {
                serde_json::to_writer(&mut out, ev)?;
                if newline {
                    out.push(b'\n');
                }
            }
        }
        "splunkhec" => {
            for ev in events {
                let mut hec = ev.clone();
                if let Some(raw) = hec.remove("_raw") {
                    hec.insert("event".to_string(), raw);
                }
                if let Some(time) = hec.remove("_time") {
                    hec.insert("time".to_string(), time);
                }
                serde_json::to_writer(&mut out, &hec)?;
                if newline {
                    out.push(b'\n');
                }
            }
        }
        // Binary framing, no trailing newline.
        "splunktcp" => {
            for ev in events {
                out.extend_from_slice(&s2s::encode_event(ev));
            }
        }
        "rfc3164" => {
            for ev in events {
                out.extend_from_slice(
                    format!(
                        "<{}>{} {} {}[{}]: {}",
                        get(ev, "priority"),
                        get(ev, "_time"),
                        get(ev, "host"),
                        get(ev, "tag"),
                        get(ev, "pid"),
                        get(ev, "_raw"),
                    )
                    .as_bytes(),
                );
                if newline {
                    out.push(b'\n');
                }
            }
        }
        "rfc5424" => {
            for ev in events {
                out.extend_from_slice(
                    format!(
                        "<{}>1 {} {} {} {} - {} {}",
                        get(ev, "priority"),
                        get(ev, "_time"),
                        get(ev, "host"),
                        get(ev, "appName"),
                        get(ev, "pid"),
                        rfc5424_structured_data(ev),
                        get(ev, "_raw"),
                    )
                    .as_bytes(),
                );
                if newline {
                    out.push(b'\n');
                }
            }
        }
        "elasticsearch" => {
            for ev in events {
                let header =
                    serde_json::json!({"index": {"_index": get(ev, "index"), "_type": "doc"}});
                serde_json::to_writer(&mut out, &header)?;
                out.push(b'\n');
                let mut doc = ev.clone();
                if let Some(raw) = doc.remove("_raw") {
                    doc.insert("message".to_string(), raw);
                }
                serde_json::to_writer(&mut out, &doc)?;
                if newline {
                    out.push(b'\n');
                }
            }
        }
        name => {
            if !templates.contains(name) {
                return Err(FormatError::UnknownTemplate(name.to_string()));
            }
            let Some(first) = events.first() else {
                return Ok(Bytes::new());
            };
            if let Some(header) = templates.render_part(name, "header", first)? {
                out.extend_from_slice(header.as_bytes());
                out.push(b'\n');
            }
            for ev in events {
                let row = templates
                    .render_part(name, "row", ev)?
                    .ok_or_else(|| FormatError::UnknownTemplate(name.to_string()))?;
                out.extend_from_slice(row.as_bytes());
                out.push(b'\n');
            }
            let last = events.last().unwrap_or(first);
            if let Some(footer) = templates.render_part(name, "footer", last)? {
                out.extend_from_slice(footer.as_bytes());
                out.push(b'\n');
            }
        }
    }
    Ok(Bytes::from(out))
}

/// The `[meta k="v" …]` element of an RFC 5424 line, `-` when no metadata
/// fields remain. Keys are sorted for stable output.
fn rfc5424_structured_data(event: &Event) -> String {
    const EXCLUDED: &[&str] = &["_raw", "_time", "priority", "host", "appName", "pid", "tag"];
    let mut keys: Vec<&String> = event
        .keys()
        .filter(|k| !EXCLUDED.contains(&k.as_str()))
        .collect();
    if keys.is_empty() {
        return "-".to_string();
    }
    keys.sort();
    let pairs: Vec<String> = keys
        .iter()
        .map(|k| format!("{k}=\"{}\"", event[k.as_str()]))
        .collect();
    format!("[meta {}]", pairs.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_with_template(template: &str) -> Sample {
        let mut s = Sample::empty("fmt");
        s.output.output_template = template.to_string();
        s
    }

    fn event(pairs: &[(&str, &str)]) -> Event {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_raw_payload() {
        let s = sample_with_template("raw");
        let events = vec![event(&[("_raw", "one")]), event(&[("_raw", "two")])];
        let payload = render_payload(&s, &events, &TemplateSet::default()).unwrap();
        assert_eq!(&payload[..], b"one\ntwo\n");
    }

    #[test]
    fn test_splunkhec_renames_raw_and_time() {
        let s = sample_with_template("splunkhec");
        let events = vec![event(&[
            ("_raw", "x"),
            ("_time", "1003561200.000"),
            ("host", "h"),
        ])];
        let payload = render_payload(&s, &events, &TemplateSet::default()).unwrap();
        let parsed: HashMap<String, String> = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed["event"], "x");
        assert_eq!(parsed["time"], "1003561200.000");
        assert_eq!(parsed["host"], "h");
        assert!(!parsed.contains_key("_raw"));
        assert!(!parsed.contains_key("_time"));
    }

    #[test]
    fn test_splunkhec_over_s2s_omits_trailing_newline() {
        let mut s = sample_with_template("splunkhec");
        s.output.outputter = "splunktcp".to_string();
        let events = vec![event(&[("_raw", "x"), ("_time", "1003561200.000")])];
        let payload = render_payload(&s, &events, &TemplateSet::default()).unwrap();
        assert!(!payload.ends_with(b"\n"), "S2S payloads carry no event separator");

        let parsed: HashMap<String, String> = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed["event"], "x");
    }

    #[test]
    fn test_rfc3164_layout() {
        let s = sample_with_template("rfc3164");
        let events = vec![event(&[
            ("priority", "14"),
            ("_time", "Oct 20 00:00:00"),
            ("host", "h"),
            ("tag", "t"),
            ("pid", "1"),
            ("_raw", "m"),
        ])];
        let payload = render_payload(&s, &events, &TemplateSet::default()).unwrap();
        assert_eq!(&payload[..], b"<14>Oct 20 00:00:00 h t[1]: m\n");
    }

    #[test]
    fn test_rfc5424_metadata() {
        let s = sample_with_template("rfc5424");
        let events = vec![event(&[
            ("priority", "14"),
            ("_time", "2001-10-20T00:00:00Z"),
            ("host", "h"),
            ("appName", "app"),
            ("pid", "1"),
            ("_raw", "m"),
            ("zone", "a"),
            ("region", "us"),
        ])];
        let payload = render_payload(&s, &events, &TemplateSet::default()).unwrap();
        assert_eq!(
            String::from_utf8(payload.to_vec()).unwrap(),
            "<14>1 2001-10-20T00:00:00Z h app 1 - [meta region=\"us\" zone=\"a\"] m\n"
        );
    }

    #[test]
    fn test_rfc5424_without_metadata() {
        let s = sample_with_template("rfc5424");
        let events = vec![event(&[
            ("priority", "14"),
            ("_time", "t"),
            ("host", "h"),
            ("appName", "app"),
            ("pid", "1"),
            ("_raw", "m"),
        ])];
        let payload = render_payload(&s, &events, &TemplateSet::default()).unwrap();
        assert_eq!(String::from_utf8(payload.to_vec()).unwrap(), "<14>1 t h app 1 - - m\n");
    }

    #[test]
    fn test_elasticsearch_bulk_lines() {
        let s = sample_with_template("elasticsearch");
        let events = vec![event(&[("_raw", "m"), ("index", "main")])];
        let payload = render_payload(&s, &events, &TemplateSet::default()).unwrap();
        let text = String::from_utf8(payload.to_vec()).unwrap();
        let lines: Vec<&str> = text.trim_end().split('\n').collect();
        assert_eq!(lines.len(), 2);

        let header: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(header["index"]["_index"], "main");
        assert_eq!(header["index"]["_type"], "doc");

        let doc: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(doc["message"], "m");
        assert!(doc.get("_raw").is_none());
    }

    #[test]
    fn test_user_template() {
        let templates = TemplateSet::build(&[TemplateConfig {
            name: "kv".to_string(),
            header: "start".to_string(),
            row: "{{ host }} says {{ _raw }}".to_string(),
            footer: "end".to_string(),
        }]);
        let s = sample_with_template("kv");
        let events = vec![event(&[("_raw", "hi"), ("host", "h1")])];
        let payload = render_payload(&s, &events, &templates).unwrap();
        assert_eq!(
            String::from_utf8(payload.to_vec()).unwrap(),
            "start\nh1 says hi\nend\n"
        );
    }

    #[test]
    fn test_unknown_template_is_an_error() {
        let s = sample_with_template("nosuch");
        let events = vec![event(&[("_raw", "x")])];
        assert!(matches!(
            render_payload(&s, &events, &TemplateSet::default()),
            Err(FormatError::UnknownTemplate(_))
        ));
    }
}
