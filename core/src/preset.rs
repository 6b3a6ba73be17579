//! Named filter presets.
//!
//! A preset is a saved JSON filter document, e.g.
//! `{ "$or": [ { "tag": "web" }, { "$and": [ { "tag": "db" }, { "$not": { "tag": "beta" } } ] } ] }`.
//! Presets live in `<config_dir>/presets.json`; saving one notifies every
//! inbound session currently bound to it so clients re-list.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::ProxyError;

/// A recursive filter document. Multiple clauses on one node conjoin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresetDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(rename = "$and", default, skip_serializing_if = "Option::is_none")]
    pub and: Option<Vec<PresetDocument>>,
    #[serde(rename = "$or", default, skip_serializing_if = "Option::is_none")]
    pub or: Option<Vec<PresetDocument>>,
    #[serde(rename = "$not", default, skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<PresetDocument>>,
    #[serde(rename = "$in", default, skip_serializing_if = "Option::is_none")]
    pub any_of: Option<Vec<String>>,
}

impl PresetDocument {
    /// Evaluate against a server's tag set. An empty document admits
    /// everything.
    pub fn eval(&self, tags: &BTreeSet<String>) -> bool {
        if let Some(tag) = &self.tag
            && !tags.contains(tag)
        {
            return false;
        }
        if let Some(clauses) = &self.and
            && !clauses.iter().all(|c| c.eval(tags))
        {
            return false;
        }
        if let Some(clauses) = &self.or
            && !clauses.iter().any(|c| c.eval(tags))
        {
            return false;
        }
        if let Some(inner) = &self.not
            && inner.eval(tags)
        {
            return false;
        }
        if let Some(list) = &self.any_of
            && !list.iter().any(|t| tags.contains(t))
        {
            return false;
        }
        true
    }

    /// Every tag the document mentions.
    pub fn referenced_tags(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_tags(&mut out);
        out
    }

    fn collect_tags(&self, out: &mut BTreeSet<String>) {
        if let Some(tag) = &self.tag {
            out.insert(tag.clone());
        }
        for clauses in [&self.and, &self.or] {
            if let Some(clauses) = clauses {
                for clause in clauses {
                    clause.collect_tags(out);
                }
            }
        }
        if let Some(inner) = &self.not {
            inner.collect_tags(out);
        }
        if let Some(list) = &self.any_of {
            out.extend(list.iter().cloned());
        }
    }
}

pub struct PresetStore {
    path: PathBuf,
    presets: ArcSwap<BTreeMap<String, PresetDocument>>,
    tx: broadcast::Sender<String>,
}

impl PresetStore {
    /// Load the preset file; a missing file is an empty store, a malformed
    /// one is logged and treated as empty.
    pub fn load(path: PathBuf) -> Self {
        let presets = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(presets) => presets,
                Err(err) => {
                    warn!("presets file {} is malformed: {err}", path.display());
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                warn!("failed to read presets file {}: {err}", path.display());
                BTreeMap::new()
            }
        };
        let (tx, _) = broadcast::channel(16);
        Self {
            path,
            presets: ArcSwap::from_pointee(presets),
            tx,
        }
    }

    pub fn get(&self, name: &str) -> Option<PresetDocument> {
        self.presets.load().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.presets.load().keys().cloned().collect()
    }

    /// Fires with the preset name whenever a preset is saved or deleted.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn set(&self, name: &str, document: PresetDocument) -> Result<(), ProxyError> {
        let mut next = (**self.presets.load()).clone();
        next.insert(name.to_string(), document);
        self.persist(&next)?;
        self.presets.store(Arc::new(next));
        let _ = self.tx.send(name.to_string());
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<bool, ProxyError> {
        let mut next = (**self.presets.load()).clone();
        let removed = next.remove(name).is_some();
        if removed {
            self.persist(&next)?;
            self.presets.store(Arc::new(next));
            let _ = self.tx.send(name.to_string());
        }
        Ok(removed)
    }

    // Atomic replace: write a sibling temp file, then rename over the real
    // one.
    fn persist(&self, presets: &BTreeMap<String, PresetDocument>) -> Result<(), ProxyError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                ProxyError::internal(format!("failed to create preset directory: {err}"))
            })?;
        }
        let json = serde_json::to_string_pretty(presets)
            .map_err(|err| ProxyError::internal(format!("failed to encode presets: {err}")))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|err| ProxyError::internal(format!("failed to write presets: {err}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|err| ProxyError::internal(format!("failed to replace presets: {err}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn tags(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn doc(value: serde_json::Value) -> PresetDocument {
        serde_json::from_value(value).expect("preset document")
    }

    #[test]
    fn eval_handles_every_clause_kind() {
        let document = doc(json!({
            "$or": [
                { "tag": "web" },
                { "$and": [ { "tag": "db" }, { "$not": { "tag": "beta" } } ] }
            ]
        }));
        assert!(document.eval(&tags(&["web"])));
        assert!(document.eval(&tags(&["db"])));
        assert!(!document.eval(&tags(&["db", "beta"])));
        assert!(!document.eval(&tags(&["fs"])));

        let any_of = doc(json!({ "$in": ["a", "b"] }));
        assert!(any_of.eval(&tags(&["b"])));
        assert!(!any_of.eval(&tags(&["c"])));
    }

    #[test]
    fn empty_document_admits_everything() {
        assert!(PresetDocument::default().eval(&tags(&[])));
    }

    #[test]
    fn referenced_tags_walks_the_whole_tree() {
        let document = doc(json!({
            "$or": [
                { "tag": "web" },
                { "$and": [ { "$in": ["db", "cache"] }, { "$not": { "tag": "beta" } } ] }
            ]
        }));
        assert_eq!(
            document.referenced_tags(),
            tags(&["web", "db", "cache", "beta"])
        );
    }

    #[test]
    fn store_round_trips_and_notifies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("presets.json");
        let store = PresetStore::load(path.clone());
        let mut rx = store.subscribe();

        store
            .set("prod", doc(json!({ "tag": "web" })))
            .expect("set");
        assert_eq!(rx.try_recv().ok().as_deref(), Some("prod"));

        // A fresh load sees the persisted preset.
        let reloaded = PresetStore::load(path);
        assert_eq!(reloaded.get("prod"), Some(doc(json!({ "tag": "web" }))));

        assert!(reloaded.delete("prod").expect("delete"));
        assert!(!reloaded.delete("prod").expect("second delete is a no-op"));
    }

    #[test]
    fn malformed_preset_file_is_treated_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("presets.json");
        std::fs::write(&path, "not json").expect("write");
        let store = PresetStore::load(path);
        assert!(store.names().is_empty());
    }
}
