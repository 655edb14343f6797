//! Maps free-text tenant or affiliation labels onto an [Audience].
//!
//! Classification only decides how generous throttling is. It must never be used as an
//! authorization decision: anyone can claim any label.

use crate::policy::Audience;
use std::collections::HashMap;

/// Classifies labels by case-insensitive substring match against per-audience markers.
///
/// Audiences are tried from the most to the least generous, and the first one with a matching
/// marker wins. Labels that match nothing fall into [Audience::Community].
#[derive(Debug, Clone)]
pub struct AudienceClassifier {
    // Most generous first, markers lowercased
    markers: Vec<(Audience, Vec<String>)>,
}

impl AudienceClassifier {
    pub fn new(markers: HashMap<Audience, Vec<String>>) -> Self {
        let mut markers: Vec<_> = markers
            .into_iter()
            .filter(|(audience, _)| *audience != Audience::Community)
            .map(|(audience, list)| {
                let list = list
                    .into_iter()
                    .map(|m| m.trim().to_lowercase())
                    .filter(|m| !m.is_empty())
                    .collect();
                (audience, list)
            })
            .collect();
        markers.sort_by_key(|(audience, _)| std::cmp::Reverse(*audience as usize));
        Self { markers }
    }

    /// Replaces the markers of the audiences present in `overrides`, keeping the defaults of the
    /// rest.
    pub fn with_overrides(overrides: &HashMap<Audience, Vec<String>>) -> Self {
        let mut markers = default_markers();
        for (audience, list) in overrides {
            markers.insert(*audience, list.clone());
        }
        Self::new(markers)
    }

    pub fn classify(&self, label: &str) -> Audience {
        let label = label.to_lowercase();
        self.markers
            .iter()
            .find(|(_, list)| list.iter().any(|marker| label.contains(marker.as_str())))
            .map(|(audience, _)| *audience)
            .unwrap_or_default()
    }

    /// Classifies an optional label, treating a missing label as unmatched.
    pub fn classify_opt(&self, label: Option<&str>) -> Audience {
        label.map(|l| self.classify(l)).unwrap_or_default()
    }
}

impl Default for AudienceClassifier {
    fn default() -> Self {
        Self::new(default_markers())
    }
}

pub fn default_markers() -> HashMap<Audience, Vec<String>> {
    let list = |markers: &[&str]| markers.iter().map(|m| m.to_string()).collect::<Vec<_>>();
    HashMap::from([
        (Audience::Staff, list(&["staff", "moderator", "internal"])),
        (
            Audience::Partner,
            list(&["partner", "nonprofit", "non-profit", "charity"]),
        ),
        (
            Audience::Campus,
            list(&["university", "college", "campus", ".edu", "school"]),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_defaults() {
        let classifier = AudienceClassifier::default();
        assert_eq!(classifier.classify("University of Leeds"), Audience::Campus);
        assert_eq!(classifier.classify("student@ox.ac.uk.edu"), Audience::Campus);
        assert_eq!(classifier.classify("Local Charity Shop"), Audience::Partner);
        assert_eq!(classifier.classify("Marketplace STAFF"), Audience::Staff);
        assert_eq!(classifier.classify("Someone"), Audience::Community);
        assert_eq!(classifier.classify(""), Audience::Community);
        assert_eq!(classifier.classify_opt(None), Audience::Community);
    }

    #[test]
    fn test_most_generous_marker_wins() {
        let classifier = AudienceClassifier::default();
        assert_eq!(
            classifier.classify("College partner programme"),
            Audience::Partner
        );
        assert_eq!(
            classifier.classify("Internal staff, university liaison"),
            Audience::Staff
        );
    }

    #[test]
    fn test_overrides() {
        let overrides = HashMap::from([(Audience::Campus, vec!["Academy".to_string()])]);
        let classifier = AudienceClassifier::with_overrides(&overrides);
        assert_eq!(classifier.classify("Riverside academy"), Audience::Campus);
        // Overridden list replaces the default one
        assert_eq!(classifier.classify("Riverside college"), Audience::Community);
        // Other audiences keep their defaults
        assert_eq!(classifier.classify("Charity"), Audience::Partner);
    }

    #[test]
    fn test_community_markers_and_blank_markers_ignored() {
        let markers = HashMap::from([
            (Audience::Community, vec!["a".to_string()]),
            (Audience::Staff, vec!["  ".to_string()]),
        ]);
        let classifier = AudienceClassifier::new(markers);
        assert_eq!(classifier.classify("anything"), Audience::Community);
    }
}
