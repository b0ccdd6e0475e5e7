use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Row identity as reported by a data provider.
///
/// Providers backed by dynamic data may hand out any of these shapes, but only
/// [`Key::Number`] and [`Key::String`] are accepted for rendering: index lookups and
/// equality checks downstream assume that restricted domain.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Key {
    Number(i64),
    String(Arc<str>),
    Bool(bool),
    Null,
    Composite(Vec<Key>),
}

impl Key {
    /// Returns `true` for the key types a collection can render (strings and numbers).
    pub fn is_renderable(&self) -> bool {
        matches!(self, Self::Number(_) | Self::String(_))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Null => f.write_str("null"),
            Self::Composite(parts) => {
                f.write_str("[")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{part}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Self::Number(value as i64)
    }
}

/// Values above `i64::MAX` saturate to `i64::MAX`.
impl From<usize> for Key {
    fn from(value: usize) -> Self {
        Self::Number(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::String(Arc::from(value))
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self::String(Arc::from(value))
    }
}

pub(crate) type KeySet = HashSet<Key>;

/// The set of expanded tree nodes.
///
/// `All` models "expand everything" and tracks the keys explicitly collapsed since.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExpandedKeys {
    Keys(HashSet<Key>),
    All { except: HashSet<Key> },
}

impl Default for ExpandedKeys {
    fn default() -> Self {
        Self::Keys(HashSet::new())
    }
}

impl ExpandedKeys {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self::All {
            except: HashSet::new(),
        }
    }

    pub fn from_keys(keys: impl IntoIterator<Item = Key>) -> Self {
        Self::Keys(keys.into_iter().collect())
    }

    pub fn has(&self, key: &Key) -> bool {
        match self {
            Self::Keys(keys) => keys.contains(key),
            Self::All { except } => !except.contains(key),
        }
    }

    pub fn add(&mut self, key: Key) {
        match self {
            Self::Keys(keys) => {
                keys.insert(key);
            }
            Self::All { except } => {
                except.remove(&key);
            }
        }
    }

    pub fn remove(&mut self, key: &Key) {
        match self {
            Self::Keys(keys) => {
                keys.remove(key);
            }
            Self::All { except } => {
                except.insert(key.clone());
            }
        }
    }

    pub fn with(mut self, key: Key) -> Self {
        self.add(key);
        self
    }

    pub fn without(mut self, key: &Key) -> Self {
        self.remove(key);
        self
    }
}
