//! Placeholder filling for message templates.

use crate::types::SubjectProfile;

/// Replace `{first_name}`, `{last_name}` and `{name}` with values from `profile`.
/// Missing names fall back to "there" so a greeting still reads naturally.
pub fn fill_placeholders(text: &str, profile: &SubjectProfile) -> String {
    let first = profile
        .first_name
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("there");
    let last = profile.last_name.as_deref().unwrap_or("");
    text.replace("{first_name}", first)
        .replace("{firstName}", first)
        .replace("{last_name}", last)
        .replace("{lastName}", last)
        .replace("{name}", &profile.display_name())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_known_names() {
        let p = SubjectProfile {
            subject_id: "s1".into(),
            contact: "+15550100".into(),
            first_name: Some("Dana".into()),
            last_name: Some("Reyes".into()),
            timezone: None,
        };
        assert_eq!(
            fill_placeholders("Hi {first_name}! ({name})", &p),
            "Hi Dana! (Dana Reyes)"
        );
    }

    #[test]
    fn test_fill_missing_names() {
        let p = SubjectProfile::default();
        assert_eq!(fill_placeholders("Hey {first_name}, {name}", &p), "Hey there, there");
        assert_eq!(fill_placeholders("no placeholders", &p), "no placeholders");
    }
}
