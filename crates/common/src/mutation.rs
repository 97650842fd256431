// Page mutations: the unit of change a session serializes and fans out.
//
// Structural edits address nodes in the document tree with JSON Pointers
// (RFC 6901). The derived `content_html` is only replaced by
// `ReplaceContent`; tree edits leave it for the editor to re-derive.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{PageContent, MAX_PAGE_NAME_CHARS};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageMutation {
    /// Set the page title.
    Rename { name: String },
    /// Replace the whole document (editor autosave).
    ReplaceContent {
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_html: Option<String>,
    },
    /// Insert or overwrite the node at `path`. `-` as the last array token appends.
    SetNode { path: String, value: Value },
    /// Remove the node at `path`.
    RemoveNode { path: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("page name must not be empty")]
    EmptyName,
    #[error("page name exceeds {MAX_PAGE_NAME_CHARS} characters")]
    NameTooLong,
    #[error("invalid json pointer `{0}`")]
    InvalidPath(String),
    #[error("no node at `{0}`")]
    PathNotFound(String),
}

impl PageMutation {
    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rename { .. } => "rename",
            Self::ReplaceContent { .. } => "replace_content",
            Self::SetNode { .. } => "set_node",
            Self::RemoveNode { .. } => "remove_node",
        }
    }

    /// Apply to `page` in place. On error `page` is left untouched.
    pub fn apply(&self, page: &mut PageContent) -> Result<(), MutationError> {
        match self {
            Self::Rename { name } => {
                let trimmed = name.trim();
                if trimmed.is_empty() {
                    return Err(MutationError::EmptyName);
                }
                if trimmed.chars().count() > MAX_PAGE_NAME_CHARS {
                    return Err(MutationError::NameTooLong);
                }
                page.name = trimmed.to_string();
            }
            Self::ReplaceContent { content, content_html } => {
                page.content = content.clone();
                if let Some(html) = content_html {
                    page.content_html = html.clone();
                }
            }
            Self::SetNode { path, value } => set_node(&mut page.content, path, value.clone())?,
            Self::RemoveNode { path } => remove_node(&mut page.content, path)?,
        }
        Ok(())
    }
}

fn split_pointer(path: &str) -> Result<(String, String), MutationError> {
    if !path.starts_with('/') {
        return Err(MutationError::InvalidPath(path.to_string()));
    }
    // rsplit_once always succeeds: the path starts with '/'.
    let (parent, last) =
        path.rsplit_once('/').ok_or_else(|| MutationError::InvalidPath(path.to_string()))?;
    Ok((parent.to_string(), unescape_token(last)))
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn set_node(root: &mut Value, path: &str, value: Value) -> Result<(), MutationError> {
    if path.is_empty() {
        *root = value;
        return Ok(());
    }

    let (parent_path, token) = split_pointer(path)?;
    let parent = root
        .pointer_mut(&parent_path)
        .ok_or_else(|| MutationError::PathNotFound(parent_path.clone()))?;

    match parent {
        Value::Object(map) => {
            map.insert(token, value);
            Ok(())
        }
        Value::Array(items) => {
            if token == "-" {
                items.push(value);
                return Ok(());
            }
            let index =
                token.parse::<usize>().map_err(|_| MutationError::InvalidPath(path.to_string()))?;
            match index.cmp(&items.len()) {
                std::cmp::Ordering::Less => items[index] = value,
                std::cmp::Ordering::Equal => items.push(value),
                std::cmp::Ordering::Greater => {
                    return Err(MutationError::PathNotFound(path.to_string()))
                }
            }
            Ok(())
        }
        _ => Err(MutationError::PathNotFound(path.to_string())),
    }
}

fn remove_node(root: &mut Value, path: &str) -> Result<(), MutationError> {
    if path.is_empty() {
        return Err(MutationError::InvalidPath(path.to_string()));
    }

    let (parent_path, token) = split_pointer(path)?;
    let parent = root
        .pointer_mut(&parent_path)
        .ok_or_else(|| MutationError::PathNotFound(parent_path.clone()))?;

    let removed = match parent {
        Value::Object(map) => map.remove(&token).is_some(),
        Value::Array(items) => match token.parse::<usize>() {
            Ok(index) if index < items.len() => {
                items.remove(index);
                true
            }
            Ok(_) => false,
            Err(_) => return Err(MutationError::InvalidPath(path.to_string())),
        },
        _ => false,
    };

    if removed {
        Ok(())
    } else {
        Err(MutationError::PathNotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page() -> PageContent {
        PageContent {
            name: "Notes".into(),
            content: json!({
                "type": "doc",
                "content": [
                    { "type": "paragraph", "content": [{ "type": "text", "text": "hello" }] }
                ]
            }),
            content_html: "<p>hello</p>".into(),
        }
    }

    #[test]
    fn rename_trims_and_validates() {
        let mut p = page();
        PageMutation::Rename { name: "  Plan  ".into() }.apply(&mut p).unwrap();
        assert_eq!(p.name, "Plan");

        assert_eq!(
            PageMutation::Rename { name: "   ".into() }.apply(&mut p),
            Err(MutationError::EmptyName)
        );
        assert_eq!(
            PageMutation::Rename { name: "x".repeat(MAX_PAGE_NAME_CHARS + 1) }.apply(&mut p),
            Err(MutationError::NameTooLong)
        );
        assert_eq!(p.name, "Plan");
    }

    #[test]
    fn replace_content_keeps_html_unless_given() {
        let mut p = page();
        PageMutation::ReplaceContent { content: json!({"type": "doc", "content": []}), content_html: None }
            .apply(&mut p)
            .unwrap();
        assert_eq!(p.content_html, "<p>hello</p>");

        PageMutation::ReplaceContent {
            content: json!({"type": "doc", "content": []}),
            content_html: Some(String::new()),
        }
        .apply(&mut p)
        .unwrap();
        assert_eq!(p.content_html, "");
    }

    #[test]
    fn set_node_overwrites_appends_and_inserts_keys() {
        let mut p = page();
        PageMutation::SetNode {
            path: "/content/0/content/0/text".into(),
            value: json!("bye"),
        }
        .apply(&mut p)
        .unwrap();
        assert_eq!(p.content.pointer("/content/0/content/0/text"), Some(&json!("bye")));

        PageMutation::SetNode { path: "/content/-".into(), value: json!({"type": "hr"}) }
            .apply(&mut p)
            .unwrap();
        assert_eq!(p.content["content"].as_array().unwrap().len(), 2);

        PageMutation::SetNode { path: "/attrs~1meta".into(), value: json!(1) }
            .apply(&mut p)
            .unwrap();
        assert_eq!(p.content["attrs/meta"], json!(1));
    }

    #[test]
    fn set_node_rejects_out_of_range_and_missing_parent() {
        let mut p = page();
        assert!(matches!(
            PageMutation::SetNode { path: "/content/5".into(), value: json!(null) }.apply(&mut p),
            Err(MutationError::PathNotFound(_))
        ));
        assert!(matches!(
            PageMutation::SetNode { path: "/missing/child".into(), value: json!(null) }
                .apply(&mut p),
            Err(MutationError::PathNotFound(_))
        ));
        assert!(matches!(
            PageMutation::SetNode { path: "no-slash".into(), value: json!(null) }.apply(&mut p),
            Err(MutationError::InvalidPath(_))
        ));
    }

    #[test]
    fn remove_node_removes_array_items_and_keys() {
        let mut p = page();
        PageMutation::RemoveNode { path: "/content/0".into() }.apply(&mut p).unwrap();
        assert_eq!(p.content["content"], json!([]));

        PageMutation::RemoveNode { path: "/type".into() }.apply(&mut p).unwrap();
        assert!(p.content.get("type").is_none());

        assert!(matches!(
            PageMutation::RemoveNode { path: "/content/0".into() }.apply(&mut p),
            Err(MutationError::PathNotFound(_))
        ));
        assert!(matches!(
            PageMutation::RemoveNode { path: String::new() }.apply(&mut p),
            Err(MutationError::InvalidPath(_))
        ));
    }

    #[test]
    fn mutation_wire_shape_is_kind_tagged() {
        let op = PageMutation::Rename { name: "X".into() };
        let encoded = serde_json::to_value(&op).unwrap();
        assert_eq!(encoded, json!({"kind": "rename", "name": "X"}));
        assert_eq!(op.kind(), "rename");
    }
}
