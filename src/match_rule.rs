//! Match rules: the filter predicate applied to inbound messages and its
//! canonical wire-string form registered with the bus daemon.

use std::fmt;
use std::fmt::Write;

use crate::message::Message;
use crate::proto::MessageType;
use crate::value::Value;

/// How an indexed `arg<i>` element matches the body argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgMatch {
    /// `arg<i>='value'`: the i-th string argument equals the value.
    Equals(String),
    /// `arg<i>path='value'`: the i-th argument stands in the path-match
    /// relation to the value.
    Path(String),
}

/// A match rule.
///
/// Serializes to the canonical `key='value',key='value'` form understood by
/// the bus daemon, omitting absent keys. Values are not quote-escaped;
/// values containing `'` are undefined.
///
/// # Examples
///
/// ```
/// use busio::{MatchRule, MessageType};
///
/// let rule = MatchRule::new()
///     .with_message_type(MessageType::Signal)
///     .with_interface("org.freedesktop.DBus")
///     .with_member("NameOwnerChanged");
///
/// assert_eq!(
///     rule.to_string(),
///     "type='signal',interface='org.freedesktop.DBus',member='NameOwnerChanged'"
/// );
/// ```
#[derive(Debug, Default, Clone)]
pub struct MatchRule {
    message_type: Option<MessageType>,
    sender: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    path: Option<String>,
    path_namespace: Option<String>,
    destination: Option<String>,
    arg0_namespace: Option<String>,
    args: Vec<(u8, ArgMatch)>,
}

impl MatchRule {
    /// Construct an empty rule which matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    #[must_use]
    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_path_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.path_namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    #[must_use]
    pub fn with_arg0_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.arg0_namespace = Some(namespace.into());
        self
    }

    /// Add an indexed `arg<i>` element.
    #[must_use]
    pub fn with_arg(mut self, index: u8, arg: ArgMatch) -> Self {
        self.args.push((index, arg));
        self
    }

    /// Test if `message` satisfies every present element of this rule.
    pub fn is_match(&self, message: &Message) -> bool {
        if let Some(message_type) = self.message_type {
            if message.header.message_type != message_type {
                return false;
            }
        }

        let fields = &message.header.fields;

        for (element, field) in [
            (&self.sender, &fields.sender),
            (&self.interface, &fields.interface),
            (&self.member, &fields.member),
            (&self.path, &fields.path),
            (&self.destination, &fields.destination),
        ] {
            if let Some(element) = element {
                if field.as_deref() != Some(element.as_str()) {
                    return false;
                }
            }
        }

        if let Some(namespace) = &self.path_namespace {
            let Some(path) = &fields.path else {
                return false;
            };

            if !path_has_namespace(path, namespace) {
                return false;
            }
        }

        if let Some(namespace) = &self.arg0_namespace {
            let Some(arg0) = message.body.first().and_then(Value::as_str) else {
                return false;
            };

            if !has_namespace(arg0, namespace) {
                return false;
            }
        }

        for (index, arg) in &self.args {
            let value = message.body.get(usize::from(*index));

            let ok = match arg {
                ArgMatch::Equals(expected) => {
                    matches!(value, Some(Value::Str(s)) if s == expected)
                }
                ArgMatch::Path(expected) => match value {
                    Some(Value::Str(s)) | Some(Value::ObjectPath(s)) => {
                        is_path_match(s, expected)
                    }
                    _ => false,
                },
            };

            if !ok {
                return false;
            }
        }

        true
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;

        let mut element = |f: &mut fmt::Formatter<'_>, key: &str, value: &str| {
            let sep = if first { "" } else { "," };
            first = false;
            write!(f, "{sep}{key}='{value}'")
        };

        if let Some(message_type) = self.message_type {
            element(f, "type", message_type.match_rule_value())?;
        }

        if let Some(sender) = &self.sender {
            element(f, "sender", sender)?;
        }

        if let Some(interface) = &self.interface {
            element(f, "interface", interface)?;
        }

        if let Some(member) = &self.member {
            element(f, "member", member)?;
        }

        if let Some(path) = &self.path {
            element(f, "path", path)?;
        }

        if let Some(namespace) = &self.path_namespace {
            element(f, "path_namespace", namespace)?;
        }

        if let Some(destination) = &self.destination {
            element(f, "destination", destination)?;
        }

        if let Some(namespace) = &self.arg0_namespace {
            element(f, "arg0namespace", namespace)?;
        }

        for (index, arg) in &self.args {
            let mut key = String::new();

            match arg {
                ArgMatch::Equals(value) => {
                    write!(key, "arg{index}")?;
                    element(f, &key, value)?;
                }
                ArgMatch::Path(value) => {
                    write!(key, "arg{index}path")?;
                    element(f, &key, value)?;
                }
            }
        }

        Ok(())
    }
}

/// Test if `value` lies within the dot-separated namespace `namespace`.
///
/// True iff `value` equals the namespace or extends it by at least one
/// `.`-separated element.
///
/// # Examples
///
/// ```
/// use busio::has_namespace;
///
/// assert!(has_namespace("com.example.backend1", "com.example.backend1"));
/// assert!(has_namespace("com.example.backend1.foo", "com.example.backend1"));
/// assert!(!has_namespace("com.example.backend2", "com.example.backend1"));
/// ```
pub fn has_namespace(value: &str, namespace: &str) -> bool {
    match value.strip_prefix(namespace) {
        Some("") => true,
        Some(rest) => rest.starts_with('.'),
        None => false,
    }
}

/// The object-path analogue of [`has_namespace`], with `/` separating
/// elements. The root path `/` contains every path.
pub fn path_has_namespace(path: &str, namespace: &str) -> bool {
    if namespace == "/" {
        return true;
    }

    match path.strip_prefix(namespace) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// The path-match relation used by `arg<i>path` elements.
///
/// The shorter of the two strings must end with `/` and be a prefix of the
/// longer; two equal strings compare the same way.
///
/// # Examples
///
/// ```
/// use busio::is_path_match;
///
/// assert!(is_path_match("/aa/bb/", "/"));
/// assert!(is_path_match("/aa/bb/", "/aa/bb/cc"));
/// assert!(!is_path_match("/aa/bb/", "/aa/b"));
/// ```
pub fn is_path_match(a: &str, b: &str) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    short.ends_with('/') && long.starts_with(short)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_relation() {
        assert!(has_namespace("com.example.backend1", "com.example.backend1"));
        assert!(has_namespace(
            "com.example.backend1.foo",
            "com.example.backend1"
        ));
        assert!(!has_namespace(
            "org.example.backend1.foo.bar",
            "com.example.backend1"
        ));
        assert!(!has_namespace("com.example.backend2", "com.example.backend1"));
    }

    #[test]
    fn path_match_relation() {
        assert!(is_path_match("/aa/bb/", "/"));
        assert!(is_path_match("/aa/bb/", "/aa/"));
        assert!(is_path_match("/aa/bb/", "/aa/bb/"));
        assert!(is_path_match("/aa/bb/", "/aa/bb/cc/"));
        assert!(is_path_match("/aa/bb/", "/aa/bb/cc"));
        assert!(!is_path_match("/aa/bb/", "/aa/b"));
        assert!(!is_path_match("/aa/bb/", "/aa"));
        assert!(!is_path_match("/aa/bb/", "/aa/bb"));
    }

    #[test]
    fn serialized_form() {
        let rule = MatchRule::new()
            .with_message_type(MessageType::Signal)
            .with_sender("org.freedesktop.DBus")
            .with_path("/org/freedesktop/DBus")
            .with_arg(0, ArgMatch::Equals("org.example.Name".into()))
            .with_arg(2, ArgMatch::Path("/org/example/".into()));

        assert_eq!(
            rule.to_string(),
            "type='signal',sender='org.freedesktop.DBus',path='/org/freedesktop/DBus',\
             arg0='org.example.Name',arg2path='/org/example/'"
        );

        assert_eq!(MatchRule::new().to_string(), "");
    }

    #[test]
    fn matches_message_fields() {
        let m = Message::signal("/org/example/Object", "org.example.Iface", "Changed")
            .with_sender(":1.7")
            .with_serial(5)
            .with_arg(Value::Str("org.example.backend.foo".into()));

        assert!(MatchRule::new().is_match(&m));
        assert!(MatchRule::new()
            .with_message_type(MessageType::Signal)
            .with_interface("org.example.Iface")
            .with_member("Changed")
            .with_sender(":1.7")
            .is_match(&m));
        assert!(MatchRule::new()
            .with_path_namespace("/org/example")
            .is_match(&m));
        assert!(MatchRule::new()
            .with_arg0_namespace("org.example.backend")
            .is_match(&m));
        assert!(MatchRule::new()
            .with_arg(0, ArgMatch::Equals("org.example.backend.foo".into()))
            .is_match(&m));

        assert!(!MatchRule::new()
            .with_message_type(MessageType::MethodCall)
            .is_match(&m));
        assert!(!MatchRule::new()
            .with_interface("org.example.Other")
            .is_match(&m));
        assert!(!MatchRule::new()
            .with_destination(":1.9")
            .is_match(&m));
        assert!(!MatchRule::new()
            .with_arg(1, ArgMatch::Equals("anything".into()))
            .is_match(&m));
    }
}
