//! Gallery snapshot and embedding matching.

use crate::types::{Embedding, Identity};

/// Immutable, ordered view of the enrolled identities for one pipeline run.
///
/// Stored as parallel arrays so that gallery position is stable and the
/// first-encountered minimum distance wins a tie.
#[derive(Debug, Clone, Default)]
pub struct GallerySnapshot {
    ids: Vec<i64>,
    names: Vec<String>,
    embeddings: Vec<Embedding>,
}

impl GallerySnapshot {
    /// Build a snapshot from identities in the order given.
    ///
    /// Entries whose embedding dimension differs from the first entry are
    /// dropped: they can never be compared against a probe from the same model.
    pub fn from_identities<I>(identities: I) -> Self
    where
        I: IntoIterator<Item = Identity>,
    {
        let mut snapshot = Self::default();
        for identity in identities {
            if let Some(first) = snapshot.embeddings.first() {
                if first.dim() != identity.embedding.dim() {
                    tracing::warn!(
                        identity = %identity.display_name,
                        expected = first.dim(),
                        actual = identity.embedding.dim(),
                        "skipping gallery entry with mismatched embedding dimension"
                    );
                    continue;
                }
            }
            snapshot.push(identity.id, identity.display_name, identity.embedding);
        }
        snapshot
    }

    pub fn push(&mut self, id: i64, name: impl Into<String>, embedding: Embedding) {
        self.ids.push(id);
        self.names.push(name.into());
        self.embeddings.push(embedding);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, index: usize) -> Option<i64> {
        self.ids.get(index).copied()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched {
        index: usize,
        identity_id: i64,
        name: String,
        distance: f32,
        /// `1 - distance`, clamped to [0, 1].
        confidence: f32,
    },
    NoMatch {
        /// Smallest distance seen, if the gallery was not empty.
        best_distance: Option<f32>,
    },
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Matched { .. })
    }

    /// Confidence of the accepted candidate; always 0.0 for `NoMatch`.
    pub fn confidence(&self) -> f32 {
        match self {
            MatchOutcome::Matched { confidence, .. } => *confidence,
            MatchOutcome::NoMatch { .. } => 0.0,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            MatchOutcome::Matched { name, .. } => Some(name),
            MatchOutcome::NoMatch { .. } => None,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &GallerySnapshot, tolerance: f32) -> MatchOutcome;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// The gallery entry with the smallest distance is the candidate; it is
/// accepted only when its distance is strictly below `tolerance`.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &GallerySnapshot, tolerance: f32) -> MatchOutcome {
        let mut best: Option<(usize, f32)> = None;

        for (i, candidate) in gallery.embeddings().iter().enumerate() {
            let distance = probe.euclidean_distance(candidate);
            // Strict comparison keeps the first of equal distances; NaN never wins.
            let closer = match best {
                None => !distance.is_nan(),
                Some((_, best_distance)) => distance < best_distance,
            };
            if closer {
                best = Some((i, distance));
            }
        }

        match best {
            Some((index, distance)) if distance < tolerance => MatchOutcome::Matched {
                index,
                identity_id: gallery.ids[index],
                name: gallery.names[index].clone(),
                distance,
                confidence: (1.0 - distance).clamp(0.0, 1.0),
            },
            _ => MatchOutcome::NoMatch {
                best_distance: best.map(|(_, d)| d).filter(|d| d.is_finite()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gallery(entries: &[(&str, Vec<f32>)]) -> GallerySnapshot {
        let mut g = GallerySnapshot::default();
        for (i, (name, values)) in entries.iter().enumerate() {
            g.push(i as i64 + 1, *name, Embedding::new(values.clone()));
        }
        g
    }

    #[test]
    fn test_match_nearest_entry() {
        let g = gallery(&[
            ("decoy", vec![1.0, 1.0]),
            ("alice", vec![0.0, 0.1]),
            ("bob", vec![0.0, 0.3]),
        ]);
        let probe = Embedding::new(vec![0.0, 0.0]);

        let result = EuclideanMatcher.compare(&probe, &g, 0.5);
        match result {
            MatchOutcome::Matched { index, identity_id, ref name, distance, confidence } => {
                assert_eq!(index, 1);
                assert_eq!(identity_id, 2);
                assert_eq!(name, "alice");
                assert!((distance - 0.1).abs() < 1e-6);
                assert!((confidence - 0.9).abs() < 1e-6);
            }
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn test_no_match_above_tolerance() {
        let g = gallery(&[("alice", vec![0.0, 0.7])]);
        let probe = Embedding::new(vec![0.0, 0.0]);

        let result = EuclideanMatcher.compare(&probe, &g, 0.5);
        assert!(!result.is_match());
        assert_eq!(result.confidence(), 0.0);
        match result {
            MatchOutcome::NoMatch { best_distance: Some(d) } => assert!((d - 0.7).abs() < 1e-5),
            other => panic!("expected NoMatch with a distance, got {other:?}"),
        }
    }

    #[test]
    fn test_distance_equal_to_tolerance_is_rejected() {
        let g = gallery(&[("alice", vec![0.5])]);
        let result = EuclideanMatcher.compare(&Embedding::new(vec![0.0]), &g, 0.5);
        assert!(!result.is_match());
    }

    #[test]
    fn test_tie_first_entry_wins() {
        let g = gallery(&[("first", vec![0.2, 0.0]), ("second", vec![0.0, 0.2])]);
        let probe = Embedding::new(vec![0.0, 0.0]);
        for _ in 0..10 {
            let result = EuclideanMatcher.compare(&probe, &g, 0.5);
            assert_eq!(result.name(), Some("first"));
        }
    }

    #[test]
    fn test_deterministic() {
        let g = gallery(&[("a", vec![0.1, 0.2, 0.3]), ("b", vec![0.3, 0.2, 0.1])]);
        let probe = Embedding::new(vec![0.12, 0.2, 0.28]);
        let first = EuclideanMatcher.compare(&probe, &g, 0.5);
        let second = EuclideanMatcher.compare(&probe, &g, 0.5);
        assert_eq!(first, second);
    }

    #[test]
    fn test_confidence_clamped_with_loose_tolerance() {
        let g = gallery(&[("far", vec![1.5])]);
        let result = EuclideanMatcher.compare(&Embedding::new(vec![0.0]), &g, 2.0);
        assert!(result.is_match());
        assert_eq!(result.confidence(), 0.0);
    }

    /// Unit vector at `cosine` similarity to `[1, 0]`.
    fn at_cosine(cosine: f32) -> Embedding {
        Embedding::new(vec![cosine, (1.0 - cosine * cosine).sqrt()])
    }

    #[test]
    fn test_default_tolerance_on_unit_embeddings() {
        let g = gallery(&[("alice", vec![1.0, 0.0])]);

        // Same person, moderate similarity: d = 1.0.
        let same = EuclideanMatcher.compare(&at_cosine(0.5), &g, crate::DEFAULT_MATCH_TOLERANCE);
        assert_eq!(same.name(), Some("alice"));

        let near = EuclideanMatcher.compare(&at_cosine(0.8), &g, crate::DEFAULT_MATCH_TOLERANCE);
        assert!((near.confidence() - (1.0 - 0.4f32.sqrt())).abs() < 1e-4);

        // Different person: d ~= 1.18.
        let other = EuclideanMatcher.compare(&at_cosine(0.3), &g, crate::DEFAULT_MATCH_TOLERANCE);
        assert!(!other.is_match());
    }

    #[test]
    fn test_empty_gallery() {
        let result = EuclideanMatcher.compare(&Embedding::new(vec![1.0]), &GallerySnapshot::default(), 0.5);
        assert_eq!(result, MatchOutcome::NoMatch { best_distance: None });
        assert_eq!(result.confidence(), 0.0);
    }

    #[test]
    fn test_snapshot_skips_mismatched_dimension() {
        let identities = vec![
            Identity {
                id: 1,
                display_name: "a".into(),
                external_code: "E1".into(),
                embedding: Embedding::new(vec![0.0; 4]),
                reference_image: None,
            },
            Identity {
                id: 2,
                display_name: "b".into(),
                external_code: "E2".into(),
                embedding: Embedding::new(vec![0.0; 3]),
                reference_image: None,
            },
        ];
        let snapshot = GallerySnapshot::from_identities(identities);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.name(0), Some("a"));
        assert_eq!(snapshot.id(0), Some(1));
    }
}
