/// Pluggable heuristics for actor/entity/action detection in requirement
/// titles. The bundled default merges the English actor list with the German
/// keyword set the heuristics grew up with; deployments narrow or replace it
/// via configuration. No locale is privileged.
#[derive(Debug, Clone)]
pub struct Lexicon {
    /// Case-insensitive substrings that mark an actor.
    pub actors: Vec<String>,
    /// Case-insensitive keywords that mark entity candidates.
    pub entities: Vec<String>,
    /// A token longer than `min_verb_len` ending in one of these suffixes is
    /// taken as the action verb.
    pub verb_suffixes: Vec<String>,
    pub min_verb_len: usize,
}

impl Default for Lexicon {
    fn default() -> Self {
        Self {
            actors: [
                "benutzer", "nutzer", "user", "admin", "operator", "system",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            entities: [
                "profil",
                "profile",
                "passwort",
                "password",
                "token",
                "rollen",
                "rolle",
                "role",
                "account",
                "formular",
                "form",
                "suchergebnis",
                "search_result",
                "deployment",
                "metriken",
                "metric",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            verb_suffixes: vec!["en".to_string()],
            min_verb_len: 3,
        }
    }
}

impl Lexicon {
    /// First matching actor, original casing from the lexicon preserved
    /// capitalized.
    pub fn detect_actor(&self, title: &str) -> Option<String> {
        let lower = title.to_lowercase();
        self.actors
            .iter()
            .find(|actor| lower.contains(actor.as_str()))
            .map(|actor| capitalize(actor))
    }

    /// All entity keywords present in the title, deduplicated in lexicon
    /// order.
    pub fn detect_entities(&self, title: &str) -> Vec<String> {
        let lower = title.to_lowercase();
        let mut out = Vec::new();
        for keyword in &self.entities {
            if lower.contains(keyword.as_str()) {
                let name = capitalize(keyword);
                if !out.contains(&name) {
                    out.push(name);
                }
            }
        }
        out
    }

    /// First token that looks like a verb under the suffix heuristic.
    pub fn guess_action(&self, title: &str) -> Option<String> {
        for token in title
            .split(|c: char| !(c.is_alphabetic() || c == '-'))
            .filter(|t| !t.is_empty())
        {
            let lower = token.to_lowercase();
            if lower.len() > self.min_verb_len
                && self.verb_suffixes.iter().any(|suffix| lower.ends_with(suffix.as_str()))
            {
                return Some(token.to_string());
            }
        }
        None
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_actors_in_both_locales() {
        let lexicon = Lexicon::default();
        assert_eq!(
            lexicon.detect_actor("The user must reset the password"),
            Some("User".to_string())
        );
        assert_eq!(
            lexicon.detect_actor("Der Benutzer kann Rollen verwalten"),
            Some("Benutzer".to_string())
        );
        assert_eq!(lexicon.detect_actor("Caching must be transparent"), None);
    }

    #[test]
    fn detects_entity_keywords() {
        let lexicon = Lexicon::default();
        let entities = lexicon.detect_entities("Der Benutzer ändert Passwort und Rollen");
        assert!(entities.contains(&"Passwort".to_string()));
        assert!(entities.contains(&"Rollen".to_string()));
    }

    #[test]
    fn guesses_german_verbs_by_suffix() {
        let lexicon = Lexicon::default();
        assert_eq!(
            lexicon.guess_action("Der Benutzer kann Tokens verwalten"),
            Some("verwalten".to_string())
        );
        // The first suffix match wins, noun or not.
        assert_eq!(
            lexicon.guess_action("Rollen verwalten"),
            Some("Rollen".to_string())
        );
        assert_eq!(lexicon.guess_action("The system must log events"), None);
    }

    #[test]
    fn custom_suffixes_extend_the_heuristic() {
        let lexicon = Lexicon {
            verb_suffixes: vec!["es".to_string(), "s".to_string()],
            ..Lexicon::default()
        };
        assert_eq!(
            lexicon.guess_action("System validates tokens quickly"),
            Some("validates".to_string())
        );
    }
}
