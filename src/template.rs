//! `%(name)s` message templating.
//!
//! Status and subject templates use named placeholders of the form
//! `%(name)s`. Unknown placeholders render as empty text rather than
//! failing the close path; `%%` is a literal percent.

use std::collections::BTreeMap;

/// Render a template against a placeholder map.
pub fn render(template: &str, values: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            let ch_len = template[i..].chars().next().map_or(1, char::len_utf8);
            out.push_str(&template[i..i + ch_len]);
            i += ch_len;
            continue;
        }
        if bytes.get(i + 1) == Some(&b'%') {
            out.push('%');
            i += 2;
        } else if bytes.get(i + 1) == Some(&b'(') {
            match template[i..].find(")s") {
                Some(close) => {
                    let name = &template[i + 2..i + close];
                    if let Some(v) = values.get(name) {
                        out.push_str(v);
                    }
                    i += close + 2;
                }
                None => {
                    out.push('%');
                    i += 1;
                }
            }
        } else {
            out.push('%');
            i += 1;
        }
    }
    out
}
