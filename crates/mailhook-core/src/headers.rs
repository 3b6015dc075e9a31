//! Header Store
//!
//! Ordered multi-map of header fields. Names are matched case-insensitively,
//! insertion order (duplicates included) is kept for wire output.

/// Ordered list of header fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderStore {
    entries: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    name: String,
    value: String,
    /// Bytes as received, re-emitted while the field is untouched
    raw: Option<Vec<u8>>,
}

impl Field {
    fn new(name: String, value: String) -> Self {
        Self { name, value, raw: None }
    }

    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl HeaderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw header block.
    ///
    /// Folded continuation lines stay part of the value (joined with CRLF)
    /// so serialization keeps the original folding. Values are read as
    /// UTF-8 with invalid bytes replaced, but parsed fields keep their
    /// original bytes for output. Parsing stops at the first empty line.
    /// Lines that are neither a field nor a continuation are skipped.
    pub fn parse(block: &[u8]) -> Self {
        let mut store = Self::new();

        for line in block.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                break;
            }

            if line[0] == b' ' || line[0] == b'\t' {
                if let Some(field) = store.entries.last_mut() {
                    field.value.push_str("\r\n");
                    field.value.push_str(&String::from_utf8_lossy(line));
                    if let Some(raw) = field.raw.as_mut() {
                        raw.extend_from_slice(b"\r\n");
                        raw.extend_from_slice(line);
                    }
                }
                continue;
            }

            let colon = match line.iter().position(|&b| b == b':') {
                Some(colon) => colon,
                None => continue,
            };
            let name = String::from_utf8_lossy(&line[..colon]);
            let name = name.trim_end();
            if name.is_empty() || name.contains(' ') {
                continue;
            }
            let value = &line[colon + 1..];
            let value = value.strip_prefix(b" ").unwrap_or(value);
            store.entries.push(Field {
                name: name.to_string(),
                value: String::from_utf8_lossy(value).into_owned(),
                raw: Some(line.to_vec()),
            });
        }

        store
    }

    /// Append a field, never overwriting existing ones
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(Field::new(name.into(), value.into()));
    }

    /// Insert a field at the top (trace headers such as `Received`)
    pub fn prepend(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(0, Field::new(name.into(), value.into()));
    }

    /// Remove every field with this name, returning how many were removed
    pub fn remove_all(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|f| !f.is(name));
        before - self.entries.len()
    }

    /// Remove every field with this name, then append a single one
    pub fn replace(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove_all(&name);
        self.add(name, value);
    }

    /// First value for the name, or an empty string
    pub fn get(&self, name: &str) -> &str {
        self.find(name).unwrap_or("")
    }

    /// First value for the name
    pub fn find(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|f| f.is(name))
            .map(|f| f.value.as_str())
    }

    /// Every value for the name, in original order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|f| f.is(name))
            .map(|f| f.value.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn count(&self, name: &str) -> usize {
        self.entries.iter().filter(|f| f.is(name)).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|f| (f.name.as_str(), f.value.as_str()))
    }

    /// Copy of the fields whose name starts with `prefix`, ignoring case
    pub fn with_prefix(&self, prefix: &str) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|f| {
                f.name
                    .get(..prefix.len())
                    .map_or(false, |head| head.eq_ignore_ascii_case(prefix))
            })
            .cloned()
            .collect();
        Self { entries }
    }

    /// `"Name: value"` lines in insertion order, duplicates included
    pub fn serialize(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|f| format!("{}: {}", f.name, f.value))
            .collect()
    }

    /// Write every field as a CRLF-terminated line. Parsed fields are
    /// written with their original bytes.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for field in &self.entries {
            match &field.raw {
                Some(raw) => out.extend_from_slice(raw),
                None => {
                    out.extend_from_slice(field.name.as_bytes());
                    out.extend_from_slice(b": ");
                    out.extend_from_slice(field.value.as_bytes());
                }
            }
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// Value of a header with folding removed
pub fn unfold(value: &str) -> String {
    value
        .split("\r\n")
        .map(|l| l.trim_start_matches([' ', '\t']))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a structured value (`type/subtype; key=value; ...`) into its main
/// token and lower-cased parameter names with unquoted values.
pub fn split_parameters(value: &str) -> (String, Vec<(String, String)>) {
    let value = unfold(value);
    let mut parts = value.split(';');
    let main = parts.next().unwrap_or("").trim().to_string();

    let params = parts
        .filter_map(|p| {
            let (k, v) = p.split_once('=')?;
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(v);
            Some((k.trim().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    (main, params)
}
