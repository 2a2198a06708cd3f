//! Canonical forms for names and free-text roster fields.

use orgrec_core::{ParsedPerson, Person};

/// Trim and collapse every run of whitespace to a single space.
pub fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Comparison form: collapsed and lowercased. Never stored.
pub fn fold(raw: &str) -> String {
    collapse_whitespace(raw).to_lowercase()
}

pub fn eq_normalized(a: &str, b: &str) -> bool {
    fold(a) == fold(b)
}

/// Split a full name into `(first, last)`.
///
/// With a comma the text before it is the last name ("Smith, John"). Without
/// one the final token is the last name, so "Van Der Berg John" splits as
/// first "Van Der Berg", last "John"; upstream entry should use a comma for
/// compound surnames.
pub fn split_full_name(raw: &str) -> (String, String) {
    let name = collapse_whitespace(raw);
    if let Some((last, first)) = name.split_once(',') {
        return (first.trim().to_string(), last.trim().to_string());
    }
    match name.rsplit_once(' ') {
        Some((first, last)) => (first.to_string(), last.to_string()),
        None => (String::new(), name),
    }
}

pub fn parse_person(row: usize, person: Person) -> ParsedPerson {
    let (first_name, last_name) = split_full_name(&person.full_name);
    ParsedPerson {
        row,
        first_name,
        last_name,
        source: person,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapse_and_fold() {
        assert_eq!(collapse_whitespace("  Ana \t  Ruiz\n"), "Ana Ruiz");
        assert_eq!(fold(" MARÍA   José "), "maría josé");
        assert!(eq_normalized("Computer  Science", "computer science "));
        assert!(!eq_normalized("Biology", "Biochemistry"));
    }

    #[test]
    fn comma_puts_surname_first() {
        assert_eq!(
            split_full_name(" Rivera Ortiz ,  Maria  Luisa "),
            ("Maria Luisa".to_string(), "Rivera Ortiz".to_string())
        );
        assert_eq!(
            split_full_name("Smith,John"),
            ("John".to_string(), "Smith".to_string())
        );
    }

    #[test]
    fn without_comma_last_token_is_surname() {
        assert_eq!(
            split_full_name("John   Smith"),
            ("John".to_string(), "Smith".to_string())
        );
        assert_eq!(
            split_full_name("Van Der Berg John"),
            ("Van Der Berg".to_string(), "John".to_string())
        );
        assert_eq!(split_full_name("Cher"), (String::new(), "Cher".to_string()));
        assert_eq!(split_full_name("   "), (String::new(), String::new()));
    }

    #[test]
    fn split_reconstructs_collapsed_name() {
        for raw in ["Ana  Ruiz", "Mary Ann  de la Cruz", "Li", "Jean-Luc Picard"] {
            let (first, last) = split_full_name(raw);
            let rebuilt = collapse_whitespace(&format!("{first} {last}"));
            assert_eq!(rebuilt, collapse_whitespace(raw));
        }
        let (first, last) = split_full_name("Smith, John Paul");
        assert_eq!(
            collapse_whitespace(&format!("{last} {first}")),
            "Smith John Paul"
        );
    }

    #[test]
    fn parse_person_keeps_source_row() {
        let parsed = parse_person(
            3,
            Person {
                full_name: "Cole, Ben".into(),
                ..Default::default()
            },
        );
        assert_eq!(parsed.row, 3);
        assert_eq!(parsed.display_name(), "Ben Cole");
        assert_eq!(parsed.source.full_name, "Cole, Ben");
    }
}
