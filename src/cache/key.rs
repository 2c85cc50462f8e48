//! Cache key derivation.
//!
//! A key is the request URL (from the options, else the resource) with the
//! request data appended as a query string. Resources can take over
//! entirely with [`KeyStrategy::Custom`].

use serde_json::{Map, Value};
use url::form_urlencoded;

use super::options::{FetchOptions, RequestData};
use super::traits::{KeyStrategy, Resource};

/// Derive the cache key for a read of `subject` with `options`.
///
/// Returns `None` when no key can be resolved; such requests are never cached.
pub fn derive_key(subject: &dyn Resource, options: &FetchOptions) -> Option<String> {
  match subject.key_strategy() {
    KeyStrategy::Custom(key_fn) => key_fn(options),
    KeyStrategy::Url => {
      let url = options
        .url
        .clone()
        .filter(|u| !u.is_empty())
        .or_else(|| subject.url().filter(|u| !u.is_empty()))?;
      Some(key_for_url(&url, options.data.as_ref()))
    }
  }
}

/// Append serialized request data to a URL.
pub fn key_for_url(url: &str, data: Option<&RequestData>) -> String {
  match data {
    Some(RequestData::Raw(raw)) => format!("{}?{}", url, raw),
    Some(RequestData::Params(params)) => format!("{}?{}", url, encode_params(params)),
    None => url.to_string(),
  }
}

/// Encode structured parameters as a query string.
///
/// Keys are emitted in lexicographic order so that equal parameter sets
/// always produce the same key. Nested objects use `a[b]=c`, arrays of
/// scalars `a[]=x`, arrays of containers `a[0][b]=c`.
pub fn encode_params(params: &Map<String, Value>) -> String {
  let mut pairs = Vec::new();
  let mut sorted: Vec<_> = params.iter().collect();
  sorted.sort_by(|a, b| a.0.cmp(b.0));
  for (name, value) in sorted {
    flatten(name, value, &mut pairs);
  }

  let mut serializer = form_urlencoded::Serializer::new(String::new());
  for (name, value) in &pairs {
    serializer.append_pair(name, value);
  }
  serializer.finish()
}

fn flatten(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
  match value {
    Value::Array(items) => {
      for (index, item) in items.iter().enumerate() {
        if item.is_object() || item.is_array() {
          flatten(&format!("{}[{}]", prefix, index), item, out);
        } else {
          flatten(&format!("{}[]", prefix), item, out);
        }
      }
    }
    Value::Object(fields) => {
      let mut sorted: Vec<_> = fields.iter().collect();
      sorted.sort_by(|a, b| a.0.cmp(b.0));
      for (name, item) in sorted {
        flatten(&format!("{}[{}]", prefix, name), item, out);
      }
    }
    Value::Null => out.push((prefix.to_string(), String::new())),
    Value::String(s) => out.push((prefix.to_string(), s.clone())),
    other => out.push((prefix.to_string(), other.to_string())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::testing::TestResource;
  use serde_json::json;

  fn params(value: Value) -> RequestData {
    match value {
      Value::Object(map) => RequestData::Params(map),
      _ => panic!("expected object"),
    }
  }

  #[test]
  fn test_resource_url_is_key() {
    let widget = TestResource::single("/widgets/1");
    assert_eq!(
      derive_key(&widget, &FetchOptions::default()).as_deref(),
      Some("/widgets/1")
    );
  }

  #[test]
  fn test_options_url_wins() {
    let widget = TestResource::single("/widgets/1");
    let options = FetchOptions::default().with_url("/gadgets/2");
    assert_eq!(derive_key(&widget, &options).as_deref(), Some("/gadgets/2"));
  }

  #[test]
  fn test_raw_data_is_verbatim() {
    let widget = TestResource::single("/widgets");
    let options = FetchOptions::default().with_data(RequestData::Raw("b=2&a=1".into()));
    assert_eq!(
      derive_key(&widget, &options).as_deref(),
      Some("/widgets?b=2&a=1")
    );
  }

  #[test]
  fn test_object_data_is_order_independent() {
    let widget = TestResource::single("/widgets");
    let a: Map<String, Value> = serde_json::from_str(r#"{"page":2,"q":"red fish"}"#).unwrap();
    let b: Map<String, Value> = serde_json::from_str(r#"{"q":"red fish","page":2}"#).unwrap();

    let key_a = derive_key(
      &widget,
      &FetchOptions::default().with_data(RequestData::Params(a)),
    );
    let key_b = derive_key(
      &widget,
      &FetchOptions::default().with_data(RequestData::Params(b)),
    );

    assert_eq!(key_a, key_b);
    assert_eq!(key_a.as_deref(), Some("/widgets?page=2&q=red+fish"));
  }

  #[test]
  fn test_nested_params() {
    let data = params(json!({"filter": {"color": "red"}, "ids": [1, 2], "x": null}));
    let RequestData::Params(map) = data else {
      unreachable!()
    };
    assert_eq!(
      encode_params(&map),
      "filter%5Bcolor%5D=red&ids%5B%5D=1&ids%5B%5D=2&x="
    );
  }

  #[test]
  fn test_custom_key_is_verbatim() {
    let widget = TestResource::single("/widgets/1")
      .with_strategy(KeyStrategy::custom(|_| Some("custom-key".into())));
    let options = FetchOptions::default().with_data(RequestData::Raw("a=1".into()));
    assert_eq!(derive_key(&widget, &options).as_deref(), Some("custom-key"));
  }

  #[test]
  fn test_key_function_receives_options() {
    let subject = TestResource::unnamed().with_strategy(KeyStrategy::custom(|opts| {
      opts.url.as_ref().map(|u| format!("fn:{}", u))
    }));
    let options = FetchOptions::default().with_url("/x");
    assert_eq!(derive_key(&subject, &options).as_deref(), Some("fn:/x"));
  }

  #[test]
  fn test_unresolvable_key() {
    let subject = TestResource::unnamed();
    assert_eq!(derive_key(&subject, &FetchOptions::default()), None);

    let empty = TestResource::single("");
    assert_eq!(derive_key(&empty, &FetchOptions::default()), None);
  }

  #[test]
  fn test_deterministic() {
    let widget = TestResource::single("/widgets/1");
    let options = FetchOptions::cached().with_data(params(json!({"a": [1, {"b": true}]})));
    assert_eq!(derive_key(&widget, &options), derive_key(&widget, &options));
  }
}
