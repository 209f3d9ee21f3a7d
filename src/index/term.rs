//! Index terms.

use std::cmp::Ordering;

/// A term: a field name plus the token text indexed under it.
///
/// Terms order by field first, then text, which is the order the term
/// dictionary is written in and the order every term enumeration yields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Term {
    /// The field the term was indexed under.
    pub field: String,
    /// The token text.
    pub text: String,
}

impl Term {
    /// Create a new term.
    pub fn new<F: Into<String>, T: Into<String>>(field: F, text: T) -> Self {
        Term {
            field: field.into(),
            text: text.into(),
        }
    }
}

impl Ord for Term {
    fn cmp(&self, other: &Self) -> Ordering {
        self.field
            .cmp(&other.field)
            .then_with(|| self.text.cmp(&other.text))
    }
}

impl PartialOrd for Term {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.field, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_field_then_text() {
        let a = Term::new("author", "zed");
        let b = Term::new("body", "alpha");
        let c = Term::new("body", "beta");

        assert!(a < b);
        assert!(b < c);

        let mut terms = vec![c.clone(), a.clone(), b.clone()];
        terms.sort();
        assert_eq!(terms, vec![a, b, c]);
    }

    #[test]
    fn test_display() {
        assert_eq!(Term::new("body", "alpha").to_string(), "body:alpha");
    }
}
