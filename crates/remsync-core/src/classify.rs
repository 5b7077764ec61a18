//! Response classification.
//!
//! Maps a remote response (MIME hint + body) onto the common document
//! status set. The shape is canonical across integrations; the vendor
//! vocabulary and envelope locations are per-integration data carried by
//! the [`ClassifierSpec`].
//!
//! - HTML bodies are access/authentication failures.
//! - XML and JSON bodies are checked for a fault envelope (SOAP fault,
//!   JSON `error` object) before batch or line statuses are read.
//! - Anything unparseable is rejected with `unparseable-response`.
//!
//! The aggregate is `accepted` iff every line is accepted, `rejected` iff
//! none are, `registered_with_errors` otherwise.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::RemoteError;
use crate::types::{DocumentStatus, MimeHint, WireResponse};

/// Verdict for one batch or line status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineVerdict {
    /// The line was accepted.
    Accepted,
    /// The line was registered but carries errors.
    AcceptedWithErrors,
    /// The line was rejected.
    Rejected,
    /// The remote acknowledged receipt; processing is still pending.
    Pending,
}

/// Classification result.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Derived document status.
    pub status: DocumentStatus,
    /// Collected error lines.
    pub errors: Vec<RemoteError>,
}

impl Classification {
    fn rejected(errors: Vec<RemoteError>) -> Self {
        Self {
            status: DocumentStatus::Rejected,
            errors,
        }
    }
}

/// Per-integration classification rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifierSpec {
    /// JSON pointers to fault envelopes (e.g. `/error`). A non-null value at
    /// any of these means the whole submission was rejected.
    #[serde(default)]
    pub fault_pointers: Vec<String>,

    /// JSON pointer to a batch-level status string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_status_pointer: Option<String>,

    /// JSON pointer to the per-line item array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_items_pointer: Option<String>,

    /// Pointer to the status string within one line item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_status_pointer: Option<String>,

    /// Pointer to the error code within one line item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_code_pointer: Option<String>,

    /// Pointer to the error message within one line item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_message_pointer: Option<String>,

    /// Vendor vocabulary shared by batch and line statuses.
    #[serde(default)]
    pub vocabulary: BTreeMap<String, LineVerdict>,

    /// XML element (local name) carrying a per-record status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xml_status_element: Option<String>,

    /// XML element (local name) carrying an error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xml_code_element: Option<String>,

    /// XML element (local name) carrying an error description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xml_message_element: Option<String>,
}

impl ClassifierSpec {
    /// Classify a remote response.
    #[must_use]
    pub fn classify(&self, response: &WireResponse) -> Classification {
        match response.mime {
            MimeHint::Html => self.classify_html(response),
            MimeHint::Json => self.classify_json(response),
            MimeHint::Xml => self.classify_xml(response),
            MimeHint::Binary | MimeHint::Unknown => Classification::rejected(vec![
                RemoteError::new("unparseable-response", "response body could not be interpreted"),
            ]),
        }
    }

    /// HTML means the request never reached the application layer; treat as
    /// an access or authentication error and keep the page text as evidence.
    fn classify_html(&self, response: &WireResponse) -> Classification {
        let text = response
            .text()
            .map(extract_html_text)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "access error".to_string());
        Classification::rejected(vec![RemoteError::new("access-error", text)])
    }

    fn classify_json(&self, response: &WireResponse) -> Classification {
        let Some(body) = response.as_json() else {
            return Classification::rejected(vec![RemoteError::new(
                "unparseable-response",
                "body is not valid JSON",
            )]);
        };

        // Fault envelope first.
        for pointer in &self.fault_pointers {
            if let Some(fault) = body.pointer(pointer) {
                if !fault.is_null() {
                    return Classification::rejected(vec![fault_to_error(fault)]);
                }
            }
        }

        let mut verdicts = Vec::new();
        let mut errors = Vec::new();

        if let Some(pointer) = &self.batch_status_pointer {
            if let Some(status) = body.pointer(pointer).and_then(Value::as_str) {
                if let Some(verdict) = self.vocabulary.get(status) {
                    verdicts.push(*verdict);
                }
            }
        }

        if let (Some(items_ptr), Some(status_ptr)) =
            (&self.line_items_pointer, &self.line_status_pointer)
        {
            if let Some(Value::Array(items)) = body.pointer(items_ptr) {
                for item in items {
                    let verdict = item
                        .pointer(status_ptr)
                        .and_then(Value::as_str)
                        .and_then(|s| self.vocabulary.get(s))
                        .copied()
                        .unwrap_or(LineVerdict::Rejected);
                    verdicts.push(verdict);

                    if verdict != LineVerdict::Accepted {
                        let code = self
                            .line_code_pointer
                            .as_deref()
                            .and_then(|p| item.pointer(p))
                            .map(render_scalar)
                            .unwrap_or_else(|| "line-error".to_string());
                        let message = self
                            .line_message_pointer
                            .as_deref()
                            .and_then(|p| item.pointer(p))
                            .map(render_scalar)
                            .unwrap_or_default();
                        if verdict != LineVerdict::Pending {
                            errors.push(RemoteError::new(code, message));
                        }
                    }
                }
            }
        }

        if verdicts.is_empty() {
            // No recognized signal; fall back to the HTTP status.
            return if (200..300).contains(&response.status) {
                Classification {
                    status: DocumentStatus::Accepted,
                    errors: vec![],
                }
            } else {
                Classification::rejected(vec![RemoteError::new(
                    response.status.to_string(),
                    "remote returned an error status",
                )])
            };
        }

        Classification {
            status: aggregate(&verdicts),
            errors,
        }
    }

    fn classify_xml(&self, response: &WireResponse) -> Classification {
        let Some(text) = response.text() else {
            return Classification::rejected(vec![RemoteError::new(
                "unparseable-response",
                "XML body is not valid UTF-8",
            )]);
        };

        let elements = collect_xml_text(text);

        // SOAP fault envelope.
        let faultcodes = elements.get("faultcode");
        let faultstrings = elements.get("faultstring");
        if faultcodes.is_some() || faultstrings.is_some() {
            let code = faultcodes
                .and_then(|v| v.first())
                .cloned()
                .unwrap_or_else(|| "soap-fault".to_string());
            let message = faultstrings
                .and_then(|v| v.first())
                .cloned()
                .unwrap_or_default();
            return Classification::rejected(vec![RemoteError::new(code, message)]);
        }

        let mut verdicts = Vec::new();
        if let Some(element) = &self.xml_status_element {
            if let Some(values) = elements.get(element.as_str()) {
                for value in values {
                    let verdict = self
                        .vocabulary
                        .get(value.as_str())
                        .copied()
                        .unwrap_or(LineVerdict::Rejected);
                    verdicts.push(verdict);
                }
            }
        }

        let mut errors = Vec::new();
        let codes = self
            .xml_code_element
            .as_deref()
            .and_then(|e| elements.get(e))
            .cloned()
            .unwrap_or_default();
        let messages = self
            .xml_message_element
            .as_deref()
            .and_then(|e| elements.get(e))
            .cloned()
            .unwrap_or_default();
        for (i, code) in codes.iter().enumerate() {
            let message = messages.get(i).cloned().unwrap_or_default();
            errors.push(RemoteError::new(code.clone(), message));
        }

        if verdicts.is_empty() {
            return if (200..300).contains(&response.status) && errors.is_empty() {
                Classification {
                    status: DocumentStatus::Accepted,
                    errors: vec![],
                }
            } else if errors.is_empty() {
                Classification::rejected(vec![RemoteError::new(
                    response.status.to_string(),
                    "remote returned an error status",
                )])
            } else {
                Classification::rejected(errors)
            };
        }

        Classification {
            status: aggregate(&verdicts),
            errors,
        }
    }
}

/// Aggregate line verdicts into a document status.
fn aggregate(verdicts: &[LineVerdict]) -> DocumentStatus {
    let accepted = verdicts.iter().filter(|v| **v == LineVerdict::Accepted).count();
    let rejected = verdicts.iter().filter(|v| **v == LineVerdict::Rejected).count();
    let pending = verdicts.iter().filter(|v| **v == LineVerdict::Pending).count();

    if pending == verdicts.len() {
        DocumentStatus::Sent
    } else if accepted == verdicts.len() {
        DocumentStatus::Accepted
    } else if rejected == verdicts.len() {
        DocumentStatus::Rejected
    } else {
        DocumentStatus::RegisteredWithErrors
    }
}

fn fault_to_error(fault: &Value) -> RemoteError {
    match fault {
        Value::String(s) => RemoteError::new("error", s.clone()),
        Value::Object(_) => {
            let code = fault
                .pointer("/code")
                .map(render_scalar)
                .unwrap_or_else(|| "error".to_string());
            let message = fault
                .pointer("/message")
                .map(render_scalar)
                .unwrap_or_else(|| fault.to_string());
            RemoteError::new(code, message)
        }
        other => RemoteError::new("error", other.to_string()),
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Collect text content per XML element local name.
fn collect_xml_text(xml: &str) -> BTreeMap<String, Vec<String>> {
    let mut reader = Reader::from_str(xml);
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut current: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                current = std::str::from_utf8(e.local_name().as_ref())
                    .ok()
                    .map(str::to_string);
            }
            Ok(Event::Text(t)) => {
                if let Some(name) = current.take() {
                    if let Ok(text) = t.unescape() {
                        let trimmed = text.trim();
                        if !trimmed.is_empty() {
                            out.entry(name).or_default().push(trimmed.to_string());
                        }
                    }
                }
            }
            Ok(Event::End(_)) => {
                current = None;
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    out
}

/// Extract the readable text of an HTML error page.
///
/// Takes the `<body>` section when present and strips tags; good enough for
/// the proxy and gateway pages that show up in front of misconfigured
/// endpoints.
fn extract_html_text(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let section = match (lower.find("<body"), lower.rfind("</body>")) {
        (Some(start), Some(end)) if start < end => {
            // Skip past the opening tag itself.
            match html[start..end].find('>') {
                Some(gt) => &html[start + gt + 1..end],
                None => &html[start..end],
            }
        }
        _ => html,
    };

    let mut text = String::new();
    let mut in_tag = false;
    for c in section.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => text.push(c),
            _ => {}
        }
    }

    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(500).collect()
}
