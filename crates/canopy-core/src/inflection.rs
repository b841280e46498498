//! Deterministic English pluralization for collection names.
//!
//! Pure functions of their input: the same type name always maps to the same
//! collection name, with no registry or cache behind it.

const UNCOUNTABLE: &[&str] = &[
    "data",
    "equipment",
    "fish",
    "information",
    "media",
    "metadata",
    "money",
    "news",
    "rice",
    "series",
    "sheep",
    "species",
];

const IRREGULAR: &[(&str, &str)] = &[
    ("child", "children"),
    ("foot", "feet"),
    ("goose", "geese"),
    ("half", "halves"),
    ("knife", "knives"),
    ("leaf", "leaves"),
    ("life", "lives"),
    ("man", "men"),
    ("mouse", "mice"),
    ("ox", "oxen"),
    ("person", "people"),
    ("shelf", "shelves"),
    ("tooth", "teeth"),
    ("wife", "wives"),
    ("wolf", "wolves"),
    ("woman", "women"),
];

/// Singular words ending in `-as`, which take `-es` in the plural.
const SINGULAR_AS: &[&str] = &["alias", "atlas", "bias", "canvas", "gas"];

/// Plural form of a type name: `user` → `users`, `activity` → `activities`.
///
/// Words that are already plural are returned unchanged.
pub fn pluralize(word: &str) -> String {
    let lower = word.to_ascii_lowercase();
    if lower.is_empty() || is_uncountable(&lower) {
        return lower;
    }
    if let Some((_, plural)) = IRREGULAR.iter().find(|(s, p)| *s == lower || *p == lower) {
        return (*plural).to_string();
    }
    let singular = singularize_regular(&lower);
    if singular != lower && pluralize_regular(&singular) == lower {
        return lower;
    }
    pluralize_regular(&lower)
}

/// Singular form of a collection name: `users` → `user`.
///
/// Words that are already singular are returned unchanged.
pub fn singularize(word: &str) -> String {
    let lower = word.to_ascii_lowercase();
    if lower.is_empty() || is_uncountable(&lower) {
        return lower;
    }
    if let Some((singular, _)) = IRREGULAR.iter().find(|(s, p)| *p == lower || *s == lower) {
        return (*singular).to_string();
    }
    let singular = singularize_regular(&lower);
    if singular != lower && pluralize_regular(&singular) == lower {
        singular
    } else {
        lower
    }
}

fn is_uncountable(word: &str) -> bool {
    UNCOUNTABLE.contains(&word)
}

fn pluralize_regular(word: &str) -> String {
    if let Some(stem) = word.strip_suffix('y') {
        if ends_with_consonant(stem) {
            return format!("{stem}ies");
        }
    }
    if word.ends_with("quiz") {
        return format!("{word}zes");
    }
    if ["s", "x", "z", "ch", "sh"].iter().any(|s| word.ends_with(s)) {
        return format!("{word}es");
    }
    format!("{word}s")
}

fn singularize_regular(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        if ends_with_consonant(stem) {
            return format!("{stem}y");
        }
    }
    if let Some(stem) = word.strip_suffix("zzes") {
        return format!("{stem}z");
    }
    if word.ends_with("ouses") {
        return word[..word.len() - 1].to_string();
    }
    for singular in SINGULAR_AS {
        if word.ends_with(singular) {
            return word.to_string();
        }
        if word.strip_suffix("es").is_some_and(|stem| stem.ends_with(singular)) {
            return word[..word.len() - 2].to_string();
        }
    }
    for suffix in ["sses", "uses", "xes", "ches", "shes"] {
        if word.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }
    if ["ss", "us", "is"].iter().any(|s| word.ends_with(s)) {
        return word.to_string();
    }
    match word.strip_suffix('s') {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => word.to_string(),
    }
}

fn ends_with_consonant(stem: &str) -> bool {
    stem.chars()
        .last()
        .is_some_and(|c| c.is_ascii_alphabetic() && !"aeiou".contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAIRS: &[(&str, &str)] = &[
        ("user", "users"),
        ("group", "groups"),
        ("role", "roles"),
        ("note", "notes"),
        ("widget", "widgets"),
        ("activity", "activities"),
        ("day", "days"),
        ("key", "keys"),
        ("box", "boxes"),
        ("church", "churches"),
        ("dish", "dishes"),
        ("status", "statuses"),
        ("bus", "buses"),
        ("class", "classes"),
        ("house", "houses"),
        ("quiz", "quizzes"),
        ("person", "people"),
        ("child", "children"),
        ("sheep", "sheep"),
        ("device", "devices"),
        ("queue", "queues"),
        ("alias", "aliases"),
        ("canvas", "canvases"),
        ("gas", "gases"),
        ("idea", "ideas"),
        ("virus", "viruses"),
    ];

    #[test]
    fn pluralizes_known_words() {
        for (singular, plural) in PAIRS {
            assert_eq!(pluralize(singular), *plural, "pluralize({singular})");
        }
    }

    #[test]
    fn singularizes_known_words() {
        for (singular, plural) in PAIRS {
            assert_eq!(singularize(plural), *singular, "singularize({plural})");
        }
    }

    #[test]
    fn pluralize_is_idempotent_on_plurals() {
        for (_, plural) in PAIRS {
            assert_eq!(pluralize(plural), *plural);
        }
    }

    #[test]
    fn case_is_normalized() {
        assert_eq!(pluralize("User"), "users");
        assert_eq!(singularize("NOTES"), "note");
    }
}
