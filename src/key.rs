//! Hierarchical key expressions.
//!
//! A key is a period-delimited sequence of up to 16 components. Each
//! component is either a plain token over `[A-Za-z0-9_-]`, the single-slot
//! wildcard `*`, or the tail wildcard `#` (final position only). The root
//! key has zero components and an empty string form. A key containing a
//! wildcard is a *pattern*; patterns select sets of concrete keys but never
//! hold values themselves.

use std::fmt;

use thiserror::Error;

/// Maximum number of components in a key.
pub const MAX_COMPONENTS: usize = 16;
/// Maximum length of the joined string form.
pub const MAX_KEY_LENGTH: usize = 200;

/// Single-slot wildcard component.
pub const WILDCARD_ONE: &str = "*";
/// Tail wildcard component, only valid in final position.
pub const WILDCARD_TAIL: &str = "#";

/// Why a key string failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key has more than {MAX_COMPONENTS} components")]
    TooManyComponents,
    #[error("key contains an empty component")]
    EmptyComponent,
    #[error("key component contains an invalid character")]
    InvalidCharacter,
    #[error("'#' is only valid as the final component")]
    HashNotLast,
    #[error("key exceeds {MAX_KEY_LENGTH} characters")]
    TooLong,
}

/// A validated key expression: either a concrete key or a wildcard pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyExpr {
    text: String,
    components: Vec<String>,
}

impl KeyExpr {
    /// The root key: zero components, empty string form.
    pub fn root() -> Self {
        Self {
            text: String::new(),
            components: Vec::new(),
        }
    }

    /// Parses and validates a key from its joined string form.
    ///
    /// The empty string parses to the root key.
    pub fn parse(text: &str) -> Result<Self, KeyError> {
        if text.is_empty() {
            return Ok(Self::root());
        }
        if text.len() > MAX_KEY_LENGTH {
            return Err(KeyError::TooLong);
        }
        let components: Vec<String> = text.split('.').map(str::to_owned).collect();
        if components.len() > MAX_COMPONENTS {
            return Err(KeyError::TooManyComponents);
        }
        let last = components.len() - 1;
        for (index, component) in components.iter().enumerate() {
            validate_component(component, index == last)?;
        }
        Ok(Self {
            text: text.to_owned(),
            components,
        })
    }

    /// Builds a key from pre-split components.
    pub fn from_components<I, S>(components: I) -> Result<Self, KeyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let components: Vec<String> = components
            .into_iter()
            .map(|c| c.as_ref().to_owned())
            .collect();
        if components.is_empty() {
            return Ok(Self::root());
        }
        Self::parse(&components.join("."))
    }

    /// The joined string form. Round-trips through [`KeyExpr::parse`].
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// True when any component is a wildcard.
    pub fn is_pattern(&self) -> bool {
        self.components
            .iter()
            .any(|c| c == WILDCARD_ONE || c == WILDCARD_TAIL)
    }

    /// The final component, or `None` for the root.
    pub fn last_component(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }

    /// Drops the final component. The parent of the root is the root.
    pub fn parent(&self) -> KeyExpr {
        if self.components.len() <= 1 {
            return Self::root();
        }
        let components = self.components[..self.components.len() - 1].to_vec();
        Self {
            text: components.join("."),
            components,
        }
    }

    /// Appends one component. The component must be a single token: it is
    /// validated on its own before joining, so an embedded `.` or an empty
    /// string is rejected rather than re-split.
    pub fn child(&self, component: &str) -> Result<KeyExpr, KeyError> {
        validate_component(component, true)?;
        let text = if self.text.is_empty() {
            component.to_owned()
        } else {
            format!("{}.{}", self.text, component)
        };
        Self::parse(&text)
    }

    /// Appends a freshly generated unique component.
    pub fn child_unique(&self) -> Result<KeyExpr, KeyError> {
        self.child(&uuid::Uuid::new_v4().to_string())
    }

    /// Whether this expression matches the given concrete key.
    ///
    /// A concrete expression matches only its exact equal. In a pattern,
    /// `*` accepts any single component and `#` accepts the rest of the key
    /// including the empty rest, so `foo.bar.#` matches `foo.bar` itself.
    pub fn matches(&self, concrete: &KeyExpr) -> bool {
        if !self.is_pattern() {
            return self.text == concrete.text;
        }
        for (index, component) in self.components.iter().enumerate() {
            if component == WILDCARD_TAIL {
                return true;
            }
            match concrete.components.get(index) {
                None => return false,
                Some(other) => {
                    if component != WILDCARD_ONE && component != other {
                        return false;
                    }
                }
            }
        }
        concrete.components.len() == self.components.len()
    }
}

impl fmt::Display for KeyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

pub(crate) fn validate_component(component: &str, is_last: bool) -> Result<(), KeyError> {
    if component.is_empty() {
        return Err(KeyError::EmptyComponent);
    }
    if component == WILDCARD_ONE {
        return Ok(());
    }
    if component == WILDCARD_TAIL {
        return if is_last {
            Ok(())
        } else {
            Err(KeyError::HashNotLast)
        };
    }
    if component
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        Ok(())
    } else {
        Err(KeyError::InvalidCharacter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(text: &str) -> KeyExpr {
        KeyExpr::parse(text).expect(text)
    }

    #[test]
    fn parse_round_trips() {
        for text in ["", "a", "foo.bar", "a.*.c", "x.#", "under_score.da-sh.42"] {
            assert_eq!(key(text).as_str(), text);
        }
    }

    #[test]
    fn root_is_valid_and_concrete() {
        let root = key("");
        assert!(root.is_root());
        assert!(!root.is_pattern());
        assert_eq!(root.last_component(), None);
    }

    #[test]
    fn component_count_boundary() {
        let sixteen = vec!["c"; 16].join(".");
        assert!(KeyExpr::parse(&sixteen).is_ok());
        let seventeen = vec!["c"; 17].join(".");
        assert_eq!(
            KeyExpr::parse(&seventeen),
            Err(KeyError::TooManyComponents)
        );
    }

    #[test]
    fn length_boundary() {
        // 16 components, joined length exactly 200: 15 x "aaaaaaaaaaaa." + 5.
        let mut components = vec!["aaaaaaaaaaaa"; 15];
        components.push("aaaaa");
        let text = components.join(".");
        assert_eq!(text.len(), 200);
        assert!(KeyExpr::parse(&text).is_ok());

        let mut longer = vec!["aaaaaaaaaaaa"; 15];
        longer.push("aaaaaa");
        let text = longer.join(".");
        assert_eq!(text.len(), 201);
        assert_eq!(KeyExpr::parse(&text), Err(KeyError::TooLong));
    }

    #[test]
    fn empty_components_rejected() {
        for text in [".", "a.", ".a", "a..b"] {
            assert_eq!(KeyExpr::parse(text), Err(KeyError::EmptyComponent), "{text}");
        }
    }

    #[test]
    fn invalid_characters_rejected() {
        for text in ["a b", "a.b!c", "Ω", "a.*x"] {
            assert_eq!(
                KeyExpr::parse(text),
                Err(KeyError::InvalidCharacter),
                "{text}"
            );
        }
    }

    #[test]
    fn hash_only_final() {
        assert!(KeyExpr::parse("a.#").is_ok());
        assert!(KeyExpr::parse("#").is_ok());
        assert_eq!(KeyExpr::parse("#.a"), Err(KeyError::HashNotLast));
        assert_eq!(KeyExpr::parse("a.#.b"), Err(KeyError::HashNotLast));
    }

    #[test]
    fn star_anywhere() {
        for text in ["*", "*.a", "a.*", "a.*.b", "*.*"] {
            assert!(KeyExpr::parse(text).is_ok(), "{text}");
        }
    }

    #[test]
    fn parent_laws() {
        assert_eq!(key("").parent(), key(""));
        assert_eq!(key("a").parent(), key(""));
        assert_eq!(key("a.b.c").parent(), key("a.b"));
        let k = key("x.y");
        assert_eq!(k.child("z").unwrap().parent(), k);
    }

    #[test]
    fn child_component_is_atomic() {
        // An embedded delimiter is an invalid character, not a re-split.
        assert_eq!(
            key("x").child("a.b"),
            Err(KeyError::InvalidCharacter)
        );
        assert_eq!(key("").child("a.b"), Err(KeyError::InvalidCharacter));
    }

    #[test]
    fn child_rejects_the_empty_component_everywhere() {
        assert_eq!(key("a").child(""), Err(KeyError::EmptyComponent));
        assert_eq!(KeyExpr::root().child(""), Err(KeyError::EmptyComponent));
    }

    #[test]
    fn child_accepts_wildcard_components() {
        assert_eq!(key("a").child("*").unwrap().as_str(), "a.*");
        assert_eq!(key("a").child("#").unwrap().as_str(), "a.#");
    }

    #[test]
    fn child_unique_is_parseable() {
        let child = key("tests").child_unique().unwrap();
        assert_eq!(child.parent(), key("tests"));
        assert!(!child.is_pattern());
    }

    #[test]
    fn concrete_match_is_equality() {
        assert!(key("a.b").matches(&key("a.b")));
        assert!(!key("a.b").matches(&key("a.c")));
        assert!(!key("a.b").matches(&key("a")));
        assert!(key("").matches(&key("")));
    }

    #[test]
    fn star_matches_single_slot() {
        let pattern = key("foo.*.baz");
        assert!(pattern.matches(&key("foo.X.baz")));
        assert!(pattern.matches(&key("foo.anything-else.baz")));
        assert!(!pattern.matches(&key("foo.bar")));
        assert!(!pattern.matches(&key("foo.bar.baz.qux")));
    }

    #[test]
    fn hash_matches_prefix_and_tail() {
        let pattern = key("foo.bar.#");
        assert!(pattern.matches(&key("foo.bar")));
        assert!(pattern.matches(&key("foo.bar.baz")));
        assert!(pattern.matches(&key("foo.bar.2.3.4.5.6.7.8.9.a.b.c.d.e.f")));
        assert!(!pattern.matches(&key("foo")));
        assert!(!pattern.matches(&key("foo.baz")));
    }

    #[test]
    fn bare_hash_matches_everything() {
        let pattern = key("#");
        assert!(pattern.matches(&key("")));
        assert!(pattern.matches(&key("a")));
        assert!(pattern.matches(&key("a.b.c")));
    }

    #[test]
    fn from_components_round_trip() {
        let k = KeyExpr::from_components(["a", "b", "c"]).unwrap();
        assert_eq!(k.as_str(), "a.b.c");
        assert_eq!(KeyExpr::from_components(Vec::<String>::new()).unwrap(), key(""));
    }
}
