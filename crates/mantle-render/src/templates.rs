// SPDX-License-Identifier: MIT OR Apache-2.0
//! Document templates for PDF generation.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

/// A document template: HTML body plus page furniture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DocTemplate {
    /// Template id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Body HTML template.
    pub html: String,
    /// Filename pattern rendered against the record context.
    #[serde(default)]
    pub filename_pattern: Option<String>,
    /// Header band HTML template.
    #[serde(default)]
    pub header_html: Option<String>,
    /// Footer band HTML template.
    #[serde(default)]
    pub footer_html: Option<String>,
    /// Paper size tag (`A4`, `Letter`, ...).
    pub paper_size: String,
    /// Margin strings per side.
    pub margins: BTreeMap<String, String>,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

fn now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn default_margins() -> BTreeMap<String, String> {
    ["top", "right", "bottom", "left"]
        .iter()
        .map(|side| (side.to_string(), "12mm".to_string()))
        .collect()
}

/// In-memory doc template store, workspace-scoped.
#[derive(Debug, Default)]
pub struct DocTemplateStore {
    items: Mutex<BTreeMap<(String, String), DocTemplate>>,
}

impl DocTemplateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a template; margins default to 12 mm all around.
    pub fn create(
        &self,
        workspace: &str,
        name: &str,
        html: &str,
        filename_pattern: Option<&str>,
        paper_size: Option<&str>,
    ) -> DocTemplate {
        let ts = now();
        let template = DocTemplate {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            html: html.to_string(),
            filename_pattern: filename_pattern.map(String::from),
            header_html: None,
            footer_html: None,
            paper_size: paper_size.unwrap_or("A4").to_string(),
            margins: default_margins(),
            created_at: ts.clone(),
            updated_at: ts,
        };
        self.items
            .lock()
            .expect("doc templates poisoned")
            .insert((workspace.to_string(), template.id.clone()), template.clone());
        template
    }

    /// Fetch one template.
    #[must_use]
    pub fn get(&self, workspace: &str, template_id: &str) -> Option<DocTemplate> {
        self.items
            .lock()
            .expect("doc templates poisoned")
            .get(&(workspace.to_string(), template_id.to_string()))
            .cloned()
    }

    /// List templates, newest first.
    #[must_use]
    pub fn list(&self, workspace: &str) -> Vec<DocTemplate> {
        let mut out: Vec<DocTemplate> = self
            .items
            .lock()
            .expect("doc templates poisoned")
            .iter()
            .filter(|((ws, _), _)| ws == workspace)
            .map(|(_, t)| t.clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Merge loose updates into a template.
    #[must_use]
    pub fn update(&self, workspace: &str, template_id: &str, updates: &Value) -> Option<DocTemplate> {
        let mut items = self.items.lock().expect("doc templates poisoned");
        let template = items.get_mut(&(workspace.to_string(), template_id.to_string()))?;
        if let Some(name) = updates.get("name").and_then(Value::as_str) {
            template.name = name.to_string();
        }
        if let Some(html) = updates.get("html").and_then(Value::as_str) {
            template.html = html.to_string();
        }
        for (key, slot) in [
            ("filename_pattern", &mut template.filename_pattern),
            ("header_html", &mut template.header_html),
            ("footer_html", &mut template.footer_html),
        ] {
            if let Some(value) = updates.get(key) {
                *slot = value.as_str().map(String::from);
            }
        }
        if let Some(paper) = updates.get("paper_size").and_then(Value::as_str) {
            template.paper_size = paper.to_string();
        }
        if let Some(margins) = updates.get("margins").and_then(Value::as_object) {
            for (side, value) in margins {
                if let Some(value) = value.as_str() {
                    template.margins.insert(side.clone(), value.to_string());
                }
            }
        }
        template.updated_at = now();
        Some(template.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_and_updates() {
        let store = DocTemplateStore::new();
        let template = store.create("w", "Invoice", "<p>{{ record.total }}</p>", None, None);
        assert_eq!(template.paper_size, "A4");
        assert_eq!(template.margins["top"], "12mm");

        let updated = store
            .update("w", &template.id, &json!({"paper_size": "Letter", "margins": {"top": "20mm"}}))
            .unwrap();
        assert_eq!(updated.paper_size, "Letter");
        assert_eq!(updated.margins["top"], "20mm");
        assert_eq!(updated.margins["left"], "12mm");
    }
}
