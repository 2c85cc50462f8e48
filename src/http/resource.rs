//! A resource identified only by its URL.

use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::cache::{FetchOptions, Resource, ResourceKind};

/// Holds the latest value delivered for a URL.
///
/// Singles merge object fields on delivery. Collections merge records by
/// `id`, or replace their contents when the read asked for a reset.
pub struct UrlResource {
  url: String,
  kind: ResourceKind,
  state: Mutex<Value>,
  collection: Option<Arc<dyn Resource>>,
}

impl UrlResource {
  pub fn single(url: &str) -> Self {
    Self::new(url, ResourceKind::Single)
  }

  pub fn collection(url: &str) -> Self {
    Self::new(url, ResourceKind::Collection)
  }

  fn new(url: &str, kind: ResourceKind) -> Self {
    let empty = match kind {
      ResourceKind::Single => Value::Null,
      ResourceKind::Collection => Value::Array(Vec::new()),
    };
    Self {
      url: url.to_string(),
      kind,
      state: Mutex::new(empty),
      collection: None,
    }
  }

  pub fn in_collection(mut self, collection: Arc<dyn Resource>) -> Self {
    self.collection = Some(collection);
    self
  }

  pub fn value(&self) -> Value {
    match self.state.lock() {
      Ok(state) => state.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }
}

impl Resource for UrlResource {
  fn kind(&self) -> ResourceKind {
    self.kind
  }

  fn url(&self) -> Option<String> {
    Some(self.url.clone())
  }

  fn apply(&self, value: &Value, options: &FetchOptions) {
    let mut state = match self.state.lock() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    };

    let merged = match (self.kind, &mut *state, value) {
      (ResourceKind::Single, Value::Object(current), Value::Object(incoming)) => {
        for (field, v) in incoming {
          current.insert(field.clone(), v.clone());
        }
        true
      }
      (ResourceKind::Collection, Value::Array(current), Value::Array(incoming))
        if !options.reset =>
      {
        for record in incoming {
          let position = record
            .get("id")
            .and_then(|id| current.iter().position(|r| r.get("id") == Some(id)));
          match position {
            Some(index) => current[index] = record.clone(),
            None => current.push(record.clone()),
          }
        }
        true
      }
      _ => false,
    };
    if !merged {
      *state = value.clone();
    }
  }

  fn collection(&self) -> Option<Arc<dyn Resource>> {
    self.collection.clone()
  }
}
