//! Resource key codec
//!
//! Composite keys have the shape `namespace#consumer#verb#target`, e.g.
//! `gateway#ali-user#GET#/users/42` or `cache#value#get#users:42`.
//! The namespace isolates adapters from one another inside the shared
//! registries; the consumer isolates applications, routes, or operation
//! families within an adapter.
//!
//! The separator is reserved: consumer and verb components are validated
//! against it. The target is the last component and is not checked; decoding
//! keeps any further separators inside it.

use crate::error::RuleError;
use std::fmt;

/// Reserved key separator
pub const SEPARATOR: char = '#';

/// Adapter namespace, the first key component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Inbound HTTP service
    Web,
    /// Inbound gateway, consumers are route ids
    Gateway,
    /// Outbound RPC-style client, consumers are downstream applications
    Rpc,
    /// Outbound cache client, consumers are operation families
    Cache,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Web => "web",
            Namespace::Gateway => "gateway",
            Namespace::Rpc => "rpc",
            Namespace::Cache => "cache",
        }
    }

    pub fn try_parse(s: &str) -> Option<Self> {
        match s {
            "web" => Some(Namespace::Web),
            "gateway" => Some(Namespace::Gateway),
            "rpc" => Some(Namespace::Rpc),
            "cache" => Some(Namespace::Cache),
            _ => None,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn check_component(component: &'static str, value: &str) -> Result<(), RuleError> {
    if value.contains(SEPARATOR) {
        return Err(RuleError::MalformedKey {
            component,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Prefix shared by every key of one (namespace, consumer, verb) triple
///
/// Adapters build the prefix once per request and append the target, so a
/// lookup costs a single allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPrefix {
    value: String,
}

impl KeyPrefix {
    /// Build `namespace#consumer#verb#`
    pub fn new(namespace: Namespace, consumer: &str, verb: &str) -> Result<Self, RuleError> {
        check_component("consumer", consumer)?;
        check_component("verb", verb)?;

        let mut value =
            String::with_capacity(namespace.as_str().len() + consumer.len() + verb.len() + 3);
        value.push_str(namespace.as_str());
        value.push(SEPARATOR);
        value.push_str(consumer);
        value.push(SEPARATOR);
        value.push_str(verb);
        value.push(SEPARATOR);
        Ok(Self { value })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Append a target to form the full key
    pub fn key(&self, target: &str) -> String {
        let mut key = String::with_capacity(self.value.len() + target.len());
        key.push_str(&self.value);
        key.push_str(target);
        key
    }

    /// Strip this prefix from a key, leaving the target
    pub fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.value.as_str())
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Encode a full resource key
pub fn encode(
    namespace: Namespace,
    consumer: &str,
    verb: &str,
    target: &str,
) -> Result<String, RuleError> {
    Ok(KeyPrefix::new(namespace, consumer, verb)?.key(target))
}

/// Prefix a payload resource (`verb#target`) with namespace and consumer
pub fn scope_resource(
    namespace: Namespace,
    consumer: Option<&str>,
    resource: &str,
) -> Result<String, RuleError> {
    let mut key = String::with_capacity(
        namespace.as_str().len() + consumer.map_or(0, |c| c.len() + 1) + resource.len() + 1,
    );
    key.push_str(namespace.as_str());
    key.push(SEPARATOR);
    if let Some(consumer) = consumer {
        check_component("consumer", consumer)?;
        key.push_str(consumer);
        key.push(SEPARATOR);
    }
    key.push_str(resource);
    Ok(key)
}

/// A decoded resource key, borrowing from the encoded string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleKey<'a> {
    pub namespace: &'a str,
    pub consumer: &'a str,
    pub verb: &'a str,
    pub target: &'a str,
}

impl<'a> RuleKey<'a> {
    /// Split a key into its four components
    ///
    /// Returns `None` for keys with fewer than four components.
    pub fn decode(key: &'a str) -> Option<Self> {
        let mut parts = key.splitn(4, SEPARATOR);
        Some(Self {
            namespace: parts.next()?,
            consumer: parts.next()?,
            verb: parts.next()?,
            target: parts.next()?,
        })
    }

    /// Length of `namespace#consumer#verb#` within the encoded key
    pub fn prefix_len(&self) -> usize {
        self.namespace.len() + self.consumer.len() + self.verb.len() + 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let key = encode(Namespace::Gateway, "ali-user", "GET", "/users/123").unwrap();
        assert_eq!(key, "gateway#ali-user#GET#/users/123");
    }

    #[test]
    fn test_prefix_key_and_strip() {
        let prefix = KeyPrefix::new(Namespace::Rpc, "ali-order", "POST").unwrap();
        assert_eq!(prefix.as_str(), "rpc#ali-order#POST#");

        let key = prefix.key("/orders");
        assert_eq!(key, "rpc#ali-order#POST#/orders");
        assert_eq!(prefix.strip(&key), Some("/orders"));
        assert_eq!(prefix.strip("rpc#ali-order#GET#/orders"), None);
    }

    #[test]
    fn test_separator_in_component_is_rejected() {
        let err = KeyPrefix::new(Namespace::Web, "ali#user", "GET").unwrap_err();
        assert!(matches!(
            err,
            RuleError::MalformedKey {
                component: "consumer",
                ..
            }
        ));

        let err = encode(Namespace::Web, "ali-user", "G#T", "/").unwrap_err();
        assert!(matches!(err, RuleError::MalformedKey { component: "verb", .. }));
    }

    #[test]
    fn test_scope_resource() {
        assert_eq!(
            scope_resource(Namespace::Gateway, Some("ali-user"), "GET#/users/{id}").unwrap(),
            "gateway#ali-user#GET#/users/{id}"
        );
        assert_eq!(
            scope_resource(Namespace::Cache, None, "value#get#users:{id}").unwrap(),
            "cache#value#get#users:{id}"
        );
        assert!(scope_resource(Namespace::Rpc, Some("a#b"), "GET#/").is_err());
    }

    #[test]
    fn test_decode() {
        let key = RuleKey::decode("cache#value#get#users:{id}").unwrap();
        assert_eq!(key.namespace, "cache");
        assert_eq!(key.consumer, "value");
        assert_eq!(key.verb, "get");
        assert_eq!(key.target, "users:{id}");
        assert_eq!(key.prefix_len(), "cache#value#get#".len());

        // The target keeps any further separators
        let key = RuleKey::decode("cache#value#get#a#b").unwrap();
        assert_eq!(key.target, "a#b");

        assert!(RuleKey::decode("GET#/users").is_none());
    }

    #[test]
    fn test_namespace_roundtrip() {
        for ns in [
            Namespace::Web,
            Namespace::Gateway,
            Namespace::Rpc,
            Namespace::Cache,
        ] {
            assert_eq!(Namespace::try_parse(ns.as_str()), Some(ns));
        }
        assert_eq!(Namespace::try_parse("feign"), None);
    }
}
